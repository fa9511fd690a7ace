// Venturi - a portable aviation data receiver
// Copyright (C) 2018  The Venturi Developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Ownship state. Three aspects (GNSS, baro, AHRS), each behind its
//! own reader-writer lock with an independent validity timestamp.
//! Readers get a consistent copy per aspect; data older than three
//! nominal update intervals is treated as absent.

use chrono::prelude::*;
use std::sync::RwLock;
use std::time::{Duration, Instant};

const GPS_STALE: Duration = Duration::from_secs(3);
const BARO_STALE: Duration = Duration::from_secs(3);
// AHRS sources report at 5 Hz or better
const AHRS_STALE: Duration = Duration::from_millis(600);

const MAX_GS_KT: f32 = 600.0;
const MAX_HDOP: f32 = 4.0;
const MIN_SATS: u8 = 4;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Serialize)]
pub enum FixQuality {
    Unknown,
    TwoDim,
    ThreeDim,
    SBAS,
}

/// One GNSS solution as delivered by an adapter. Fields the source did
/// not carry stay `None` and preserve the previous value.
#[derive(Debug, PartialEq, Clone)]
pub struct GnssFix {
    pub time: Option<DateTime<Utc>>,
    pub quality: FixQuality,
    pub lat: f32,
    pub lon: f32,
    pub alt_msl_ft: Option<f32>,
    pub geoid_sep_ft: Option<f32>,
    pub hdop: Option<f32>,
    pub accuracy_m: Option<f32>,
    pub sat_seen: Option<u8>,
    pub sat_used: Option<u8>,
    pub gs_kt: Option<f32>,
    pub true_course: Option<f32>,
}

#[derive(Debug, Default, Copy, Clone, Serialize)]
pub struct GpsAspect {
    pub quality: u8,
    /// GPS time of week in seconds, derived from UTC
    pub time_of_week_s: u32,
    pub lat: f32,
    pub lon: f32,
    pub alt_msl_ft: f32,
    pub height_wgs84_ft: f32,
    pub horizontal_accuracy_m: f32,
    pub hdop: f32,
    pub nacp: u8,
    pub sat_seen: u8,
    pub sat_used: u8,
    pub gs_kt: f32,
    pub true_course: f32,
    pub vs_fpm: f32,
    pub turn_rate_dps: f32,
}

#[derive(Debug, Default, Copy, Clone, Serialize)]
pub struct BaroAspect {
    pub pressure_alt_ft: f32,
    pub vs_fpm: f32,
    pub temperature_c: Option<f32>,
}

#[derive(Debug, Default, Copy, Clone, Serialize)]
pub struct AhrsAspect {
    pub pitch_deg: f32,
    pub roll_deg: f32,
    pub heading_deg: f32,
    pub slip_skid_deg: f32,
    pub g_load: f32,
    pub g_min: f32,
    pub g_max: f32,
}

/// Immutable cross-component view; each aspect is `None` when its
/// data is stale or was never valid.
#[derive(Debug, Default, Copy, Clone, Serialize)]
pub struct Snapshot {
    pub gps: Option<GpsAspect>,
    pub baro: Option<BaroAspect>,
    pub ahrs: Option<AhrsAspect>,
}

#[derive(Default)]
struct GpsState {
    aspect: GpsAspect,
    time: Option<DateTime<Utc>>,
    last_valid: Option<Instant>,
    prev_alt: Option<(f32, Instant)>,
    prev_course: Option<(f32, Instant)>,
}

#[derive(Default)]
struct BaroState {
    aspect: BaroAspect,
    last_valid: Option<Instant>,
    prev_alt: Option<(f32, Instant)>,
}

#[derive(Default)]
struct AhrsState {
    aspect: AhrsAspect,
    last_valid: Option<Instant>,
}

pub struct Situation {
    gps: RwLock<GpsState>,
    baro: RwLock<BaroState>,
    ahrs: RwLock<AhrsState>,
}

impl Situation {
    pub fn new() -> Self {
        Situation {
            gps: RwLock::new(GpsState::default()),
            baro: RwLock::new(BaroState::default()),
            ahrs: RwLock::new(AhrsState::default()),
        }
    }

    /// Atomic GNSS aspect update. The aspect advances only when the
    /// solution passes the validity gate; otherwise it is flagged
    /// invalid and left untouched, so no reader ever sees a partial
    /// or dubious fix.
    pub fn update_gps(&self, fix: &GnssFix, now: Instant) -> bool {
        let mut guard = self.gps.write().unwrap();
        let s = &mut *guard;

        let usable = fix.quality >= FixQuality::TwoDim &&
            fix.hdop.map_or(false, |h| h <= MAX_HDOP) &&
            fix.sat_used.map_or(false, |n| n >= MIN_SATS) &&
            fix.gs_kt.map_or(true, |g| g <= MAX_GS_KT);

        if !usable {
            debug!("GNSS solution rejected: {:?}", fix);
            s.last_valid = None;
            return false;
        }

        s.aspect.quality = match fix.quality {
            FixQuality::TwoDim => 2,
            FixQuality::ThreeDim => 3,
            FixQuality::SBAS => 4,
            FixQuality::Unknown => 0,
        };
        s.aspect.lat = fix.lat;
        s.aspect.lon = fix.lon;

        if let Some(alt) = fix.alt_msl_ft {
            s.aspect.alt_msl_ft = alt;
            s.aspect.height_wgs84_ft = alt + fix.geoid_sep_ft.unwrap_or(0.0);
        }

        s.aspect.hdop = fix.hdop.unwrap_or(s.aspect.hdop);
        // without a direct accuracy estimate, approximate from HDOP
        s.aspect.horizontal_accuracy_m = fix.accuracy_m.unwrap_or(s.aspect.hdop * 5.0);
        s.aspect.nacp = nacp_from_accuracy(s.aspect.horizontal_accuracy_m);
        s.aspect.sat_used = fix.sat_used.unwrap_or(s.aspect.sat_used);
        s.aspect.sat_seen = fix.sat_seen.unwrap_or(s.aspect.sat_used);
        s.aspect.gs_kt = fix.gs_kt.unwrap_or(s.aspect.gs_kt);

        if let Some(crs) = fix.true_course {
            if let Some((prev, t)) = s.prev_course {
                let dt = now.duration_since(t);
                if dt >= Duration::from_millis(200) {
                    let mut delta = crs - prev;
                    if delta > 180.0 {
                        delta -= 360.0;
                    } else if delta < -180.0 {
                        delta += 360.0;
                    }
                    s.aspect.turn_rate_dps = delta / duration_secs(dt);
                }
            }
            s.aspect.true_course = crs;
            s.prev_course = Some((crs, now));
        }

        if let Some(alt) = fix.alt_msl_ft {
            if let Some((prev, t)) = s.prev_alt {
                let dt = now.duration_since(t);
                if dt >= Duration::from_millis(200) {
                    s.aspect.vs_fpm = (alt - prev) / duration_secs(dt) * 60.0;
                }
            }
            s.prev_alt = Some((alt, now));
        }

        if let Some(time) = fix.time {
            s.aspect.time_of_week_s = time.weekday().num_days_from_sunday() * 86_400 +
                time.num_seconds_from_midnight();
            s.time = Some(time);
        }

        s.last_valid = Some(now);
        true
    }

    pub fn update_baro(&self, pressure_alt_ft: f32, temperature_c: Option<f32>, now: Instant) {
        let mut s = self.baro.write().unwrap();

        if !pressure_alt_ft.is_finite() || pressure_alt_ft < -2_000.0 || pressure_alt_ft > 60_000.0 {
            debug!("baro altitude rejected: {}", pressure_alt_ft);
            s.last_valid = None;
            return;
        }

        if let Some((prev, t)) = s.prev_alt {
            let dt = now.duration_since(t);
            if dt >= Duration::from_millis(200) {
                s.aspect.vs_fpm = (pressure_alt_ft - prev) / duration_secs(dt) * 60.0;
            }
        }
        s.prev_alt = Some((pressure_alt_ft, now));

        s.aspect.pressure_alt_ft = pressure_alt_ft;
        if temperature_c.is_some() {
            s.aspect.temperature_c = temperature_c;
        }
        s.last_valid = Some(now);
    }

    pub fn update_ahrs(
        &self,
        pitch_deg: f32,
        roll_deg: f32,
        heading_deg: f32,
        slip_skid_deg: f32,
        g_load: Option<f32>,
        now: Instant,
    ) {
        let mut s = self.ahrs.write().unwrap();

        if pitch_deg.abs() > 90.0 || roll_deg.abs() > 180.0 {
            debug!("attitude rejected: pitch {} roll {}", pitch_deg, roll_deg);
            s.last_valid = None;
            return;
        }

        let a = &mut s.aspect;
        a.pitch_deg = pitch_deg;
        a.roll_deg = roll_deg;
        a.heading_deg = heading_deg;
        a.slip_skid_deg = slip_skid_deg;

        if let Some(g) = g_load {
            a.g_load = g;
            if a.g_min == 0.0 && a.g_max == 0.0 {
                a.g_min = g;
                a.g_max = g;
            } else {
                if g < a.g_min {
                    a.g_min = g;
                }
                if g > a.g_max {
                    a.g_max = g;
                }
            }
        }

        s.last_valid = Some(now);
    }

    /// Last valid GNSS time, for wall-clock disciplining.
    pub fn gnss_time(&self) -> Option<DateTime<Utc>> {
        self.gps.read().unwrap().time
    }

    pub fn snapshot(&self, now: Instant) -> Snapshot {
        let gps = {
            let s = self.gps.read().unwrap();
            match s.last_valid {
                Some(t) if now.duration_since(t) <= GPS_STALE => Some(s.aspect),
                _ => None,
            }
        };

        let baro = {
            let s = self.baro.read().unwrap();
            match s.last_valid {
                Some(t) if now.duration_since(t) <= BARO_STALE => Some(s.aspect),
                _ => None,
            }
        };

        let ahrs = {
            let s = self.ahrs.read().unwrap();
            match s.last_valid {
                Some(t) if now.duration_since(t) <= AHRS_STALE => Some(s.aspect),
                _ => None,
            }
        };

        Snapshot { gps, baro, ahrs }
    }
}

fn duration_secs(d: Duration) -> f32 {
    d.as_secs() as f32 + d.subsec_millis() as f32 / 1000.0
}

// horizontal accuracy (meters) to the standardized NACp category
fn nacp_from_accuracy(acc_m: f32) -> u8 {
    match acc_m {
        n if n < 3.0 => 11,
        n if n < 10.0 => 10,
        n if n < 30.0 => 9,
        n if n < 92.6 => 8,
        n if n < 185.2 => 7,
        n if n < 555.6 => 6,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_fix() -> GnssFix {
        GnssFix {
            time: None,
            quality: FixQuality::ThreeDim,
            lat: 47.45,
            lon: -122.31,
            alt_msl_ft: Some(1200.0),
            geoid_sep_ft: Some(-60.0),
            hdop: Some(0.9),
            accuracy_m: None,
            sat_seen: Some(11),
            sat_used: Some(9),
            gs_kt: Some(104.0),
            true_course: Some(271.0),
        }
    }

    #[test]
    fn test_gate_accepts_good_fix() {
        let s = Situation::new();
        let now = Instant::now();

        assert!(s.update_gps(&good_fix(), now));
        let snap = s.snapshot(now);
        let gps = snap.gps.expect("gps aspect should be valid");
        assert_eq!(gps.quality, 3);
        assert_eq!(gps.sat_used, 9);
        assert_eq!(gps.nacp, 10);
        assert!((gps.height_wgs84_ft - 1140.0).abs() < 0.01);
    }

    #[test]
    fn test_gate_rejects_and_preserves() {
        let s = Situation::new();
        let now = Instant::now();
        s.update_gps(&good_fix(), now);

        let mut bad = good_fix();
        bad.hdop = Some(9.9);
        assert!(!s.update_gps(&bad, now));
        assert!(s.snapshot(now).gps.is_none());

        // a later good fix revalidates with no residue of the bad one
        assert!(s.update_gps(&good_fix(), now));
        assert!(s.snapshot(now).gps.is_some());
    }

    #[test]
    fn test_gate_rejects_impossible_speed() {
        let s = Situation::new();
        let mut fix = good_fix();
        fix.gs_kt = Some(700.0);
        assert!(!s.update_gps(&fix, Instant::now()));
    }

    #[test]
    fn test_gate_rejects_few_sats() {
        let s = Situation::new();
        let mut fix = good_fix();
        fix.sat_used = Some(3);
        assert!(!s.update_gps(&fix, Instant::now()));
    }

    #[test]
    fn test_staleness() {
        let s = Situation::new();
        let t0 = Instant::now();
        s.update_gps(&good_fix(), t0);

        assert!(s.snapshot(t0 + Duration::from_secs(2)).gps.is_some());
        assert!(s.snapshot(t0 + Duration::from_secs(4)).gps.is_none());
    }

    #[test]
    fn test_baro_vs() {
        let s = Situation::new();
        let t0 = Instant::now();
        s.update_baro(5_000.0, None, t0);
        s.update_baro(5_010.0, None, t0 + Duration::from_secs(1));

        let snap = s.snapshot(t0 + Duration::from_secs(1));
        let baro = snap.baro.expect("baro aspect should be valid");
        assert!((baro.vs_fpm - 600.0).abs() < 1.0, "vs = {}", baro.vs_fpm);
    }

    #[test]
    fn test_ahrs_g_envelope() {
        let s = Situation::new();
        let now = Instant::now();
        s.update_ahrs(2.0, -5.0, 180.0, 0.0, Some(1.0), now);
        s.update_ahrs(2.0, -5.0, 180.0, 0.0, Some(1.8), now);
        s.update_ahrs(2.0, -5.0, 180.0, 0.0, Some(0.4), now);

        let ahrs = s.snapshot(now).ahrs.expect("ahrs aspect should be valid");
        assert_eq!(ahrs.g_min, 0.4);
        assert_eq!(ahrs.g_max, 1.8);
        assert_eq!(ahrs.g_load, 0.4);
    }
}
