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

//! NMEA-0183 adapter: GNSS position sentences, Garmin `PGRMZ`
//! pressure altitude, Levil `RPYL` attitude and FLARM `PFLAU`/`PFLAA`
//! traffic. Several sentences may be concatenated on one input line.

use super::aprs::dm_to_deg;
use super::*;
use chrono::prelude::*;
use processor::situation::{FixQuality, GnssFix};
use processor::{Stores, Update};
use utils::offset_position;

/// XOR of every byte between `$` and `*`.
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

/// Validate `$BODY*HH` framing and return the body.
pub fn verify_sentence(s: &str) -> Option<&str> {
    if !s.starts_with('$') {
        return None;
    }

    let star = s.rfind('*')?;
    if s.len() < star + 3 {
        return None;
    }

    let body = &s[1..star];
    let expect = u8::from_str_radix(&s[star + 1..star + 3], 16).ok()?;

    if checksum(body) == expect {
        Some(body)
    } else {
        None
    }
}

#[derive(Default)]
struct GnssState {
    time: Option<DateTime<Utc>>,
    gs_kt: Option<f32>,
    true_course: Option<f32>,
    // GSA reports the solution mode: 2 = 2D, 3 = 3D
    gsa_mode: Option<u8>,
    accuracy_m: Option<f32>,
    sat_seen: Option<u8>,
}

pub struct NmeaSink {
    state: GnssState,
}

impl NmeaSink {
    pub fn new() -> Self {
        NmeaSink { state: GnssState::default() }
    }

    fn handle_sentence(&mut self, body: &str, stores: &Stores) -> bool {
        let fields: Vec<&str> = body.split(',').collect();
        if fields.is_empty() {
            return false;
        }

        // talker prefix varies (GP, GN, GL); dispatch on the type
        let kind = if fields[0].len() == 5 && !fields[0].starts_with('P') {
            &fields[0][2..]
        } else {
            fields[0]
        };

        match kind {
            "RMC" => self.handle_rmc(&fields),
            "GGA" => self.handle_gga(&fields, stores),
            "GSA" => {
                self.state.gsa_mode = fields.get(2).and_then(|f| f.parse().ok());
                true
            }
            "GST" => {
                // RMS of lat/lon error, meters
                let lat_err: Option<f32> = fields.get(6).and_then(|f| f.parse().ok());
                let lon_err: Option<f32> = fields.get(7).and_then(|f| f.parse().ok());
                if let (Some(a), Some(b)) = (lat_err, lon_err) {
                    self.state.accuracy_m = Some((a * a + b * b).sqrt());
                }
                true
            }
            "GSV" => {
                self.state.sat_seen = fields.get(3).and_then(|f| f.parse().ok());
                true
            }
            "VTG" => {
                self.state.true_course = fields.get(1).and_then(|f| f.parse().ok());
                self.state.gs_kt = fields.get(5).and_then(|f| f.parse().ok());
                true
            }
            "PGRMZ" => {
                match fields.get(1).and_then(|f| f.parse::<f32>().ok()) {
                    Some(alt_ft) => {
                        stores.apply(Update::Baro {
                            pressure_alt_ft: alt_ft,
                            temperature_c: None,
                        });
                        true
                    }
                    None => false,
                }
            }
            "RPYL" => self.handle_rpyl(&fields, stores),
            "PFLAU" => true, // our own alarm state echoed back; nothing to ingest
            "PFLAA" => self.handle_pflaa(&fields, stores),
            _ => {
                trace!("unhandled NMEA sentence {}", kind);
                true
            }
        }
    }

    fn handle_rmc(&mut self, fields: &[&str]) -> bool {
        if fields.len() < 10 {
            return false;
        }

        if fields[2] != "A" {
            // void fix: keep the last known course/speed out of play
            self.state.gs_kt = None;
            self.state.true_course = None;
            return true;
        }

        self.state.gs_kt = fields[7].parse().ok();
        self.state.true_course = fields[8].parse().ok();
        self.state.time = parse_datetime(fields[1], fields[9]);

        true
    }

    fn handle_gga(&mut self, fields: &[&str], stores: &Stores) -> bool {
        if fields.len() < 12 {
            return false;
        }

        let quality_digit: u8 = match fields[6].parse() {
            Ok(q) => q,
            Err(_) => return false,
        };

        let lat = match parse_coordinate(fields[2], fields[3]) {
            Some(v) => v,
            None => return false,
        };
        let lon = match parse_coordinate(fields[4], fields[5]) {
            Some(v) => v,
            None => return false,
        };

        let quality = match quality_digit {
            0 => FixQuality::Unknown,
            2 => FixQuality::SBAS,
            _ => {
                if self.state.gsa_mode == Some(2) {
                    FixQuality::TwoDim
                } else {
                    FixQuality::ThreeDim
                }
            }
        };

        let fix = GnssFix {
            time: self.state.time,
            quality,
            lat,
            lon,
            alt_msl_ft: fields[9].parse::<f32>().ok().map(|m| m_to_ft!(m)),
            geoid_sep_ft: fields[11].parse::<f32>().ok().map(|m| m_to_ft!(m)),
            hdop: fields[8].parse().ok(),
            accuracy_m: self.state.accuracy_m,
            sat_seen: self.state.sat_seen,
            sat_used: fields[7].parse().ok(),
            gs_kt: self.state.gs_kt,
            true_course: self.state.true_course,
        };

        stores.apply(Update::Gnss(fix));
        true
    }

    fn handle_rpyl(&self, fields: &[&str], stores: &Stores) -> bool {
        if fields.len() < 7 {
            return false;
        }

        let deci = |f: &str| f.parse::<f32>().ok().map(|v| v / 10.0);

        let (roll, pitch, heading, slip) = match (
            deci(fields[1]),
            deci(fields[2]),
            deci(fields[3]),
            deci(fields[4]),
        ) {
            (Some(r), Some(p), Some(h), Some(s)) => (r, p, h, s),
            _ => return false,
        };

        let g_load = fields[6].parse::<f32>().ok().map(|v| v / 1000.0);

        stores.apply(Update::Ahrs {
            pitch_deg: pitch,
            roll_deg: roll,
            heading_deg: heading,
            slip_skid_deg: slip,
            g_load,
        });
        true
    }

    /// FLARM per-target report: relative north/east/vertical meters,
    /// made absolute against the current ownship solution.
    fn handle_pflaa(&self, fields: &[&str], stores: &Stores) -> bool {
        if fields.len() < 11 {
            return false;
        }

        let own = match stores.situation.snapshot(stores.clock.now()).gps {
            Some(g) => g,
            // no ownship reference: the relative report is unusable
            None => return true,
        };

        let north_m: f32 = match fields[2].parse() {
            Ok(v) => v,
            Err(_) => return false,
        };
        let east_m: f32 = match fields[3].parse() {
            Ok(v) => v,
            Err(_) => return false,
        };
        let vert_m: f32 = fields[4].parse().unwrap_or(0.0);

        let addr24 = match u32::from_str_radix(fields[6], 16) {
            Ok(a) => a & 0x00FF_FFFF,
            Err(_) => return false,
        };

        let addr = match fields[5] {
            "1" => (addr24, AddressType::ADSBICAO),
            "2" => (tagged_addr(addr24, ADDR_TAG_FLARM), AddressType::OGNTracker),
            _ => (tagged_addr(addr24, ADDR_TAG_OTHER), AddressType::Unknown),
        };

        let mut trfc = TrafficData::new(addr, TrafficSource::OGN);
        trfc.target_type = Some(TargetType::OGN);
        trfc.lat_lon = Some(offset_position(own.lat, own.lon, north_m, east_m));
        trfc.altitude = Some((
            (own.alt_msl_ft + m_to_ft!(vert_m)).round() as i32,
            AltitudeType::GNSS,
        ));

        if let Ok(trk) = fields[7].parse::<u16>() {
            trfc.track = Some((trk % 360, HeadingType::True));
        }
        if let Ok(gs_mps) = fields[9].parse::<f32>() {
            trfc.speed = Some(mps_to_kts!(gs_mps).round() as u16);
        }
        if let Ok(climb_mps) = fields[10].parse::<f32>() {
            trfc.vs = Some(mps_to_fpm!(climb_mps).round() as i16);
        }
        if let Some(t) = fields.get(11).and_then(|f| u8::from_str_radix(f, 16).ok()) {
            trfc.category = Some(super::ogn::aircraft_category(t));
        }

        stores.apply(Update::Traffic(trfc));
        true
    }
}

impl LineSink for NmeaSink {
    fn name(&self) -> &'static str {
        "NMEA"
    }

    fn line(&mut self, line: &str, stores: &Stores) -> bool {
        // several sentences may share one line
        let mut all_ok = true;
        let mut seen = false;

        for chunk in line.split('$') {
            if chunk.is_empty() {
                continue;
            }
            seen = true;

            let mut sentence = String::with_capacity(chunk.len() + 1);
            sentence.push('$');
            sentence.push_str(chunk.trim());

            match verify_sentence(&sentence) {
                Some(body) => {
                    let body = body.to_string();
                    all_ok &= self.handle_sentence(&body, stores);
                }
                None => {
                    debug!("NMEA checksum failure: {}", sentence);
                    all_ok = false;
                }
            }
        }

        seen && all_ok
    }
}

/// `ddmm.mmmm` plus hemisphere to signed decimal degrees.
fn parse_coordinate(value: &str, hemisphere: &str) -> Option<f32> {
    let dot = value.find('.')?;
    if dot < 3 {
        return None;
    }

    let split = dot - 2;
    let degrees: f64 = value[..split].parse().ok()?;
    let minutes: f64 = value[split..].parse().ok()?;
    let deg = dm_to_deg(degrees, minutes);

    match hemisphere {
        "N" | "E" => Some(deg as f32),
        "S" | "W" => Some(-deg as f32),
        _ => None,
    }
}

fn parse_datetime(time: &str, date: &str) -> Option<DateTime<Utc>> {
    if time.len() < 6 || date.len() != 6 {
        return None;
    }

    let h: u32 = time[0..2].parse().ok()?;
    let mi: u32 = time[2..4].parse().ok()?;
    let s: u32 = time[4..6].parse().ok()?;

    let day: u32 = date[0..2].parse().ok()?;
    let mon: u32 = date[2..4].parse().ok()?;
    let yy: i32 = date[4..6].parse().ok()?;
    let year = if yy < 80 { 2000 + yy } else { 1900 + yy };

    Utc.ymd_opt(year, mon, day).single()?.and_hms_opt(h, mi, s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use processor::clock::Monotonic;
    use processor::fisb::Fisb;
    use processor::situation::Situation;
    use processor::traffic::{Traffic, TrafficConfig};
    use std::sync::Arc;

    fn stores() -> Stores {
        Stores {
            clock: Arc::new(Monotonic::new()),
            situation: Arc::new(Situation::new()),
            traffic: Arc::new(Traffic::new(TrafficConfig::default())),
            fisb: Arc::new(Fisb::new()),
            counters: Arc::new(Default::default()),
            discipline_clock: false,
        }
    }

    const GGA: &str = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
    const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";

    #[test]
    fn test_checksum() {
        assert!(verify_sentence(GGA).is_some());
        assert!(verify_sentence(RMC).is_some());
        assert!(verify_sentence("$GPGGA,123519,4807.038,N*00").is_none());
        assert!(verify_sentence("no dollar").is_none());
    }

    #[test]
    fn test_gga_updates_situation() {
        let stores = stores();
        let mut sink = NmeaSink::new();

        assert!(sink.line(RMC, &stores));
        assert!(sink.line(GGA, &stores));

        let snap = stores.situation.snapshot(stores.clock.now());
        let gps = snap.gps.expect("valid fix expected");
        assert!((gps.lat - 48.1173).abs() < 0.0001, "lat = {}", gps.lat);
        assert!((gps.lon - 11.5167).abs() < 0.0001, "lon = {}", gps.lon);
        assert_eq!(gps.sat_used, 8);
        assert!((gps.gs_kt - 22.4).abs() < 0.01);
        assert!((gps.alt_msl_ft - m_to_ft!(545.4)).abs() < 0.1);
        assert!(stores.clock.is_anchored());
    }

    #[test]
    fn test_bad_checksum_leaves_situation_alone() {
        let stores = stores();
        let mut sink = NmeaSink::new();

        let corrupted = GGA.replace("4807.038", "4807.039");
        assert!(!sink.line(&corrupted, &stores));
        assert!(stores.situation.snapshot(stores.clock.now()).gps.is_none());
    }

    #[test]
    fn test_multiple_sentences_one_line() {
        let stores = stores();
        let mut sink = NmeaSink::new();

        let line = format!("{}{}", RMC, GGA);
        assert!(sink.line(&line, &stores));
        assert!(stores.situation.snapshot(stores.clock.now()).gps.is_some());
    }

    #[test]
    fn test_pgrmz_baro() {
        let stores = stores();
        let mut sink = NmeaSink::new();

        let body = "PGRMZ,2282,f,3";
        let line = format!("${}*{:02X}", body, checksum(body));
        assert!(sink.line(&line, &stores));

        let baro = stores.situation.snapshot(stores.clock.now()).baro.unwrap();
        assert_eq!(baro.pressure_alt_ft, 2282.0);
    }

    #[test]
    fn test_rpyl_ahrs() {
        let stores = stores();
        let mut sink = NmeaSink::new();

        let body = "RPYL,52,-31,1805,5,0,1012,0";
        let line = format!("${}*{:02X}", body, checksum(body));
        assert!(sink.line(&line, &stores));

        let ahrs = stores.situation.snapshot(stores.clock.now()).ahrs.unwrap();
        assert!((ahrs.roll_deg - 5.2).abs() < 0.01);
        assert!((ahrs.pitch_deg + 3.1).abs() < 0.01);
        assert!((ahrs.heading_deg - 180.5).abs() < 0.01);
        assert!((ahrs.g_load - 1.012).abs() < 0.001);
    }

    #[test]
    fn test_pflaa_traffic() {
        let stores = stores();
        let mut sink = NmeaSink::new();

        // a FLARM report is useless until ownship is known
        let body = "PFLAA,0,1000,500,100,2,DDE626,180,,25.0,-0.5,1";
        let line = format!("${}*{:02X}", body, checksum(body));
        assert!(sink.line(&line, &stores));
        assert_eq!(stores.traffic.stats().total, 0);

        sink.line(GGA, &stores);
        assert!(sink.line(&line, &stores));
        assert_eq!(stores.traffic.stats().total, 1);

        let list = stores.traffic.emitable_list(stores.clock.now());
        let t = &list[0];
        assert_eq!(t.addr.0, ADDR_TAG_FLARM | 0xDDE626);
        let ((lat, lon), _) = t.lat_lon.unwrap();
        assert!(lat > 48.1173 && lat < 48.14, "lat = {}", lat);
        assert!(lon > 11.5167 && lon < 11.53, "lon = {}", lon);
        let (alt, typ, _) = t.altitude.unwrap();
        assert_eq!(typ, super::AltitudeType::GNSS);
        // 545.4 m MSL plus 100 m relative, in feet
        assert!((alt - 2117).abs() <= 2, "alt = {}", alt);
        assert_eq!(t.speed.unwrap().0, 49);
        assert_eq!(t.category, Some(9));
    }
}
