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

//! Maintains the traffic situation around us: one record per target
//! address, merged from every receiving chain, aged and dead-reckoned
//! once per second, with ownship suppression and proximity alerting.

use processor::situation::Snapshot;
use sensor::TrafficData;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::Instant;
use utils::{dead_reckon, great_circle};

// remove a target this long after its last update
const MAX_STALE_SECS: u64 = 60;
// ships move slowly and transmit rarely
const AIS_STALE_SECS: u64 = 900;
/// Data older than this is not worth passing to the output side.
const FRESHNESS_DELAY: u64 = 6;
// lock out TIS-B and ADS-R updates if direct ADS-B data is less than
// ADS_B_LOCKOUT_SECS seconds old
const ADS_B_LOCKOUT_SECS: u64 = 2;
// drop OGN relays while a direct 1090/978 position is this fresh
const OGN_LOCKOUT_SECS: u64 = 30;
// keep the strongest signal sample seen within this window
const SIGNAL_WINDOW_SECS: u64 = 6;
// start dead reckoning after one silent second
const EXTRAPOLATION_DELAY_SECS: u64 = 1;

const ALERT_DISTANCE_NM: f32 = 2.0;
const ALERT_ALTITUDE_FT: i32 = 500;
const OWNSHIP_DISTANCE_NM: f32 = 0.01;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum AddressType {
    ADSBICAO,
    ADSBOther,
    ADSRICAO,
    ADSROther,
    TISBICAO,
    TISBOther,
    OGNTracker,
    Unknown,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum TargetType {
    ADSB,
    ADSR,
    TISB,
    ModeS,
    OGN,
    AIS,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum TrafficSource {
    ES,
    UAT,
    OGN,
    AIS,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum AltitudeType {
    Baro,
    GNSS,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum HeadingType {
    True,
    Mag,
}

/// Bearing and distance from ownship. `estimated` ranges come from the
/// signal-strength model and are advisory only.
#[derive(Debug, PartialEq, Copy, Clone)]
pub struct Relative {
    pub bearing_deg: f32,
    pub distance_nm: f32,
    pub estimated: bool,
}

/// A tracked traffic target
/// Way fields work: `(data, data_type?, last_updated)`
/// Notice that `last_updated` is represented as [`Instant`]
/// which means it is not affected by system clock jumps.
/// Items that do not change often do not have the timestamp stored.
#[derive(Debug, Clone)]
pub struct Target {
    pub addr: (u32, AddressType),
    pub target_type: TargetType,
    pub source: TrafficSource,
    /// Coordinates may have been advanced by dead reckoning; the
    /// `Instant` is always that of the last real fix.
    pub lat_lon: Option<((f32, f32), Instant)>,
    pub extrapolated_secs: u32,
    pub altitude: Option<(i32, AltitudeType, Instant)>,
    pub gnss_delta: Option<i32>,
    pub track: Option<(u16, HeadingType, Instant)>,
    pub speed: Option<(u16, Instant)>,
    pub vs: Option<(i16, Instant)>,
    pub squawk: Option<u16>,
    pub tail: Option<String>,
    pub category: Option<u8>,
    pub nic: Option<u8>,
    pub nacp: Option<u8>,
    pub on_ground: Option<bool>,
    pub signal_db: Option<(f32, Instant)>,
    pub last_seen: Instant,
    pub relative: Option<Relative>,
    pub alertable: bool,
    pub ownship: bool,
    last_extrapolated: Option<Instant>,
}

impl Target {
    pub fn new(addr: (u32, AddressType), clock: Instant, source: TrafficSource) -> Self {
        Target {
            addr,
            target_type: TargetType::ModeS,
            source,
            lat_lon: None,
            extrapolated_secs: 0,
            altitude: None,
            gnss_delta: None,
            track: None,
            speed: None,
            vs: None,
            squawk: None,
            tail: None,
            category: None,
            nic: None,
            nacp: None,
            on_ground: None,
            signal_db: None,
            last_seen: clock,
            relative: None,
            alertable: false,
            ownship: false,
            last_extrapolated: None,
        }
    }

    /// Whether the target is worth passing to the output side.
    fn is_fresh(&self, now: Instant) -> bool {
        if self.lat_lon.is_some() {
            // positions stay usable while dead reckoning keeps up;
            // removal caps how long that lasts
            return true;
        }

        if let Some((_, _, i)) = self.altitude {
            if now.duration_since(i).as_secs() <= FRESHNESS_DELAY {
                return true;
            }
        }

        false
    }

    fn stale_limit(&self) -> u64 {
        if self.target_type == TargetType::AIS {
            AIS_STALE_SECS
        } else {
            MAX_STALE_SECS
        }
    }

    fn signal(&self, now: Instant) -> Option<f32> {
        match self.signal_db {
            Some((db, t)) if now.duration_since(t).as_secs() <= SIGNAL_WINDOW_SECS => Some(db),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrafficConfig {
    /// Our own Mode-S code, if the installation has one.
    pub ownship_icao: Option<u32>,
    /// Our own OGN/FLARM tracker id, if one is aboard.
    pub ownship_ogn: Option<u32>,
    /// Require an altitude match before position-based ownship
    /// suppression.
    pub altitude_verification: bool,
    pub altitude_window_ft: i32,
}

impl Default for TrafficConfig {
    fn default() -> TrafficConfig {
        TrafficConfig {
            ownship_icao: None,
            ownship_ogn: None,
            altitude_verification: true,
            altitude_window_ft: 400,
        }
    }
}

#[derive(Debug, Default, Copy, Clone, Serialize)]
pub struct TrafficStats {
    pub total: usize,
    pub es: usize,
    pub uat: usize,
    pub ogn: usize,
    pub ais: usize,
}

pub struct Traffic {
    situation: RwLock<HashMap<u32, Target>>,
    config: TrafficConfig,
    range: Mutex<SignalRange>,
}

impl Traffic {
    pub fn new(config: TrafficConfig) -> Self {
        // 100 should be a good start
        Traffic {
            situation: RwLock::new(HashMap::with_capacity(100)),
            config,
            range: Mutex::new(SignalRange::new()),
        }
    }

    /// Merge-apply one decoder record. Fields present overwrite,
    /// fields absent preserve the prior value. Returns `false` when the
    /// record was rejected outright.
    pub fn upsert(&self, t: &TrafficData, now: Instant) -> bool {
        let addr24 = t.addr.0 & 0x00FF_FFFF;
        if addr24 == 0 || addr24 == 0x00FF_FFFF {
            debug!("rejecting synthetic address {:06X}", addr24);
            return false;
        }

        let mut map = self.situation.write().unwrap();

        if let Some(existing) = map.get(&t.addr.0) {
            // a directly received position beats an OGN relay of the
            // same airframe for a while
            if t.source == TrafficSource::OGN &&
                (existing.source == TrafficSource::ES ||
                     existing.source == TrafficSource::UAT)
            {
                if let Some((_, fix_t)) = existing.lat_lon {
                    if now.duration_since(fix_t).as_secs() < OGN_LOCKOUT_SECS {
                        debug!("OGN update for {:06X} skipped in favor of direct reception",
                               addr24);
                        return false;
                    }
                }
            }

            // if we are also receiving direct ADS-B transmissions from
            // the A/C but this update is ADS-R or TIS-B, ignore it
            if (existing.addr.1 == AddressType::ADSBICAO ||
                    existing.addr.1 == AddressType::ADSBOther) &&
                (t.addr.1 == AddressType::TISBICAO || t.addr.1 == AddressType::TISBOther ||
                     t.addr.1 == AddressType::ADSRICAO ||
                     t.addr.1 == AddressType::ADSROther) &&
                now.duration_since(existing.last_seen).as_secs() < ADS_B_LOCKOUT_SECS
            {
                debug!("TIS-B or ADS-R traffic skipped in favor of ADS-B");
                return false;
            }
        }

        let trfc = map.entry(t.addr.0)
            .or_insert_with(|| Target::new(t.addr, now, t.source));

        trfc.addr = t.addr;
        trfc.last_seen = now;
        trfc.source = t.source;

        if let Some(tt) = t.target_type {
            // evidence only ever upgrades a Mode-S-only track
            if !(tt == TargetType::ModeS && trfc.target_type != TargetType::ModeS) {
                trfc.target_type = tt;
            }
        }

        if let Some(ll) = t.lat_lon {
            trfc.lat_lon = Some((ll, now));
            trfc.extrapolated_secs = 0;
            trfc.last_extrapolated = None;
        }

        if let Some((alt, typ)) = t.altitude {
            trfc.altitude = Some((alt, typ, now));
        }

        if let Some(delta) = t.gnss_delta {
            trfc.gnss_delta = Some(delta);
        }

        if let Some((trk, typ)) = t.track {
            trfc.track = Some((trk, typ, now));
        }

        if let Some(spd) = t.speed {
            trfc.speed = Some((spd, now));
        }

        if let Some(vs) = t.vs {
            trfc.vs = Some((vs, now));
        }

        if let Some(sq) = t.squawk {
            trfc.squawk = Some(sq);
        }

        if let Some(ref cs) = t.callsign {
            let trimmed = cs.trim();
            if !trimmed.is_empty() {
                trfc.tail = Some(trimmed.to_string());
            }
        }

        if let Some(cat) = t.category {
            trfc.category = Some(cat);
        }

        if let Some(n) = t.nic {
            trfc.nic = Some(n);
        }

        if let Some(na) = t.nacp {
            // the standard stops at 11
            trfc.nacp = Some(if na > 11 { 11 } else { na });
        }

        if let Some(on_gnd) = t.on_ground {
            trfc.on_ground = Some(on_gnd);
        }

        if let Some(db) = t.signal_db {
            trfc.signal_db = match trfc.signal_db {
                Some((prev, t0))
                    if now.duration_since(t0).as_secs() <= SIGNAL_WINDOW_SECS && prev > db => {
                    Some((prev, t0))
                }
                _ => Some((db, now)),
            };
        }

        true
    }

    /// Once-per-second pass: dead-reckon silent targets that still have
    /// a usable velocity, then drop the ones past their freshness
    /// window.
    pub fn age_and_extrapolate(&self, now: Instant) {
        let mut map = self.situation.write().unwrap();

        for trfc in map.values_mut() {
            let (pos, fix_t) = match trfc.lat_lon {
                Some((p, t)) => (p, t),
                None => continue,
            };

            let age = now.duration_since(fix_t);
            if age.as_secs() < EXTRAPOLATION_DELAY_SECS {
                continue;
            }

            let (spd, trk) = match (trfc.speed, trfc.track) {
                (Some((s, _)), Some((t, _, _))) => (s, t),
                _ => continue,
            };

            let base = trfc.last_extrapolated.unwrap_or(fix_t);
            let dt = now.duration_since(base);
            let dt_s = dt.as_secs() as f32 + dt.subsec_millis() as f32 / 1000.0;
            if dt_s <= 0.0 {
                continue;
            }

            let dist_nm = spd as f32 * dt_s / 3600.0;
            let (lat, lon) = dead_reckon(pos.0, pos.1, trk as f32, dist_nm);
            trfc.lat_lon = Some(((lat, lon), fix_t));

            if let (Some((alt, typ, at)), Some((vs, _))) = (trfc.altitude, trfc.vs) {
                let new_alt = alt + (vs as f32 * dt_s / 60.0).round() as i32;
                trfc.altitude = Some((new_alt, typ, at));
            }

            trfc.last_extrapolated = Some(now);
            trfc.extrapolated_secs = age.as_secs() as u32;
        }

        let before = map.len();
        map.retain(|_, v| {
            let idle = now.duration_since(v.last_seen).as_secs();

            if v.lat_lon.is_none() {
                // altitude-only track: it lives off its replies
                if let Some((_, _, t)) = v.altitude {
                    return now.duration_since(t).as_secs() < MAX_STALE_SECS;
                }
            }

            idle < v.stale_limit()
        });

        if map.len() != before {
            debug!("cleaned up {} stale targets", before - map.len());
        }
    }

    /// Refresh bearing/distance (and the signal-range model) against
    /// the current ownship solution, then re-evaluate alerting and
    /// ownship suppression.
    pub fn compute_relative(&self, situation: &Snapshot, now: Instant) {
        let mut map = self.situation.write().unwrap();
        let mut est = self.range.lock().unwrap();

        for trfc in map.values_mut() {
            trfc.ownship = self.is_ownship_addr(trfc) || is_ownship_position(trfc, situation,
                                                                             &self.config);

            trfc.relative = match (situation.gps, trfc.lat_lon) {
                (Some(own), Some(((lat, lon), _))) => {
                    let (dist, brg) = great_circle(own.lat, own.lon, lat, lon);

                    // a real fix alongside a signal sample teaches the
                    // range model something
                    if trfc.extrapolated_secs == 0 && !trfc.ownship {
                        if let Some(db) = trfc.signal(now) {
                            est.train(db, dist);
                        }
                    }

                    Some(Relative {
                        bearing_deg: brg,
                        distance_nm: dist,
                        estimated: false,
                    })
                }
                (Some(_), None) => {
                    trfc.signal(now).map(|db| {
                        Relative {
                            bearing_deg: 0.0,
                            distance_nm: est.estimate(db),
                            estimated: true,
                        }
                    })
                }
                _ => None,
            };

            trfc.alertable = match trfc.relative {
                Some(r) if !r.estimated && !trfc.ownship &&
                               r.distance_nm <= ALERT_DISTANCE_NM => {
                    match relative_altitude_ft(trfc, situation) {
                        Some(delta) => delta.abs() <= ALERT_ALTITUDE_FT,
                        // incomparable altitudes do not veto a range alert
                        None => true,
                    }
                }
                _ => false,
            };
        }
    }

    /// Snapshot of everything that belongs in the current output
    /// cycle.
    pub fn emitable_list(&self, now: Instant) -> Vec<Target> {
        self.situation
            .read()
            .unwrap()
            .values()
            .filter(|v| !v.ownship && !self.is_ownship_addr(v) && v.is_fresh(now))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> TrafficStats {
        let map = self.situation.read().unwrap();
        let mut stats = TrafficStats::default();

        stats.total = map.len();
        for v in map.values() {
            match v.source {
                TrafficSource::ES => stats.es += 1,
                TrafficSource::UAT => stats.uat += 1,
                TrafficSource::OGN => stats.ogn += 1,
                TrafficSource::AIS => stats.ais += 1,
            }
        }

        stats
    }

    fn is_ownship_addr(&self, trfc: &Target) -> bool {
        if let Some(code) = self.config.ownship_icao {
            if trfc.addr.0 == code {
                return true;
            }
        }

        if let Some(code) = self.config.ownship_ogn {
            if trfc.source == TrafficSource::OGN && trfc.addr.0 & 0x00FF_FFFF == code {
                return true;
            }
        }

        false
    }

    #[cfg(test)]
    fn get(&self, addr: u32) -> Option<Target> {
        self.situation.read().unwrap().get(&addr).cloned()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.situation.read().unwrap().len()
    }
}

/// Target altitude minus ownship altitude, in a common reference, or
/// `None` when the two cannot be compared.
fn relative_altitude_ft(trfc: &Target, situation: &Snapshot) -> Option<i32> {
    if let Some(baro) = situation.baro {
        let own = baro.pressure_alt_ft as i32;
        return match trfc.altitude {
            Some((alt, AltitudeType::Baro, _)) => Some(alt - own),
            // geometric altitude is only comparable once the target
            // also told us its GNSS-baro offset
            Some((alt, AltitudeType::GNSS, _)) => trfc.gnss_delta.map(|d| alt - d - own),
            None => None,
        };
    }

    if let Some(gps) = situation.gps {
        // no baro aboard: compare in the geometric domain only
        return match trfc.altitude {
            Some((alt, AltitudeType::GNSS, _)) => Some(alt - gps.alt_msl_ft as i32),
            _ => None,
        };
    }

    None
}

fn is_ownship_position(trfc: &Target, situation: &Snapshot, config: &TrafficConfig) -> bool {
    let own = match situation.gps {
        Some(g) => g,
        None => return false,
    };
    let (lat, lon) = match trfc.lat_lon {
        Some((p, _)) => p,
        None => return false,
    };

    let (dist, _) = great_circle(own.lat, own.lon, lat, lon);
    if dist > OWNSHIP_DISTANCE_NM {
        return false;
    }

    if !config.altitude_verification {
        return true;
    }

    match relative_altitude_ft(trfc, situation) {
        Some(delta) => delta.abs() <= config.altitude_window_ft,
        // nothing to verify against
        None => true,
    }
}

// how many (signal, realized range) pairs the model keeps
const RANGE_SAMPLES: usize = 32;
// refit once this many are in
const RANGE_MIN_SAMPLES: usize = 8;

/// Signal-strength range model for bearingless targets:
/// `R = a * 10^(-signal_dB / 20) + b`, with `a`, `b` refit online from
/// targets whose estimated range was later confirmed by a real fix.
pub struct SignalRange {
    a: f32,
    b: f32,
    samples: VecDeque<(f32, f32)>,
}

impl SignalRange {
    // seeds put a -30 dBm target at roughly 6 nm
    const SEED_A: f32 = 0.18;
    const SEED_B: f32 = 0.5;

    pub fn new() -> Self {
        SignalRange {
            a: SignalRange::SEED_A,
            b: SignalRange::SEED_B,
            samples: VecDeque::with_capacity(RANGE_SAMPLES),
        }
    }

    pub fn estimate(&self, signal_db: f32) -> f32 {
        let db = clamp(signal_db, -60.0, 0.0);
        let r = self.a * 10_f32.powf(-db / 20.0) + self.b;

        clamp(r, 0.1, 100.0)
    }

    pub fn train(&mut self, signal_db: f32, range_nm: f32) {
        if !(signal_db > -120.0 && range_nm > 0.0 && range_nm < 100.0) {
            return;
        }

        if self.samples.len() == RANGE_SAMPLES {
            self.samples.pop_front();
        }
        self.samples
            .push_back((10_f32.powf(-clamp(signal_db, -60.0, 0.0) / 20.0), range_nm));

        if self.samples.len() < RANGE_MIN_SAMPLES {
            return;
        }

        // weighted least squares, newer samples weighing more
        let (mut sw, mut swx, mut swr, mut swxx, mut swxr) = (0_f64, 0_f64, 0_f64, 0_f64, 0_f64);
        for (i, &(x, r)) in self.samples.iter().enumerate() {
            let w = (i + 1) as f64;
            let x = x as f64;
            let r = r as f64;
            sw += w;
            swx += w * x;
            swr += w * r;
            swxx += w * x * x;
            swxr += w * x * r;
        }

        let denom = sw * swxx - swx * swx;
        if denom.abs() < 1e-9 {
            return;
        }

        let a = (sw * swxr - swx * swr) / denom;
        if a <= 0.0 {
            // an inverted fit means the samples are junk; keep the
            // previous model
            return;
        }

        self.a = a as f32;
        self.b = ((swr - a * swx) / sw) as f32;
    }

    /// Forget everything learned, e.g. after a receiver gain change.
    pub fn reseed(&mut self) {
        self.a = SignalRange::SEED_A;
        self.b = SignalRange::SEED_B;
        self.samples.clear();
    }
}

fn clamp(v: f32, lo: f32, hi: f32) -> f32 {
    if v < lo {
        lo
    } else if v > hi {
        hi
    } else {
        v
    }
}
