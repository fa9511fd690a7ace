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

//! NMEA output for clients that speak FLARM rather than GDL90:
//! ownship position sentences plus PFLAU/PFLAA traffic.

use processor::situation::{BaroAspect, GpsAspect, Snapshot};
use processor::traffic::{AddressType, Target};
use sensor::nmea::checksum;
use time::Tm;
use utils::{nm_to_meters, relative_meters};

/// Wrap a sentence body in `$...*HH\r\n` framing.
pub fn sentence(body: &str) -> Vec<u8> {
    format!("${}*{:02X}\r\n", body, checksum(body)).into_bytes()
}

fn coordinate(deg: f32, int_digits: usize) -> String {
    let abs = deg.abs() as f64;
    let d = abs.trunc();
    let m = (abs - d) * 60.0;

    format!("{:0width$}{:07.4}", d as u32, m, width = int_digits)
}

pub fn gprmc(utc: &Tm, gps: &GpsAspect) -> Vec<u8> {
    let body = format!(
        "GPRMC,{:02}{:02}{:02},A,{},{},{},{},{:.1},{:.1},{:02}{:02}{:02},,",
        utc.tm_hour,
        utc.tm_min,
        utc.tm_sec,
        coordinate(gps.lat, 2),
        if gps.lat < 0.0 { 'S' } else { 'N' },
        coordinate(gps.lon, 3),
        if gps.lon < 0.0 { 'W' } else { 'E' },
        gps.gs_kt,
        gps.true_course,
        utc.tm_mday,
        utc.tm_mon + 1,
        (utc.tm_year + 1900) % 100,
    );

    sentence(&body)
}

pub fn gpgga(utc: &Tm, gps: &GpsAspect) -> Vec<u8> {
    let quality = if gps.quality >= 4 { 2 } else { 1 };
    let alt_m = gps.alt_msl_ft / 3.28084;
    let sep_m = (gps.height_wgs84_ft - gps.alt_msl_ft) / 3.28084;

    let body = format!(
        "GPGGA,{:02}{:02}{:02},{},{},{},{},{},{:02},{:.1},{:.1},M,{:.1},M,,",
        utc.tm_hour,
        utc.tm_min,
        utc.tm_sec,
        coordinate(gps.lat, 2),
        if gps.lat < 0.0 { 'S' } else { 'N' },
        coordinate(gps.lon, 3),
        if gps.lon < 0.0 { 'W' } else { 'E' },
        quality,
        gps.sat_used,
        gps.hdop,
        alt_m,
        sep_m,
    );

    sentence(&body)
}

pub fn pgrmz(baro: &BaroAspect) -> Vec<u8> {
    sentence(&format!("PGRMZ,{:.0},f,3", baro.pressure_alt_ft))
}

fn target_alarm(t: &Target) -> u8 {
    if t.alertable {
        2
    } else {
        0
    }
}

/// Relative vertical separation in meters, when the altitudes can be
/// compared at all.
fn relative_vertical_m(t: &Target, snapshot: &Snapshot) -> Option<i32> {
    let own_ft = match (snapshot.baro, snapshot.gps) {
        (Some(b), _) => b.pressure_alt_ft,
        (None, Some(g)) => g.alt_msl_ft,
        _ => return None,
    };

    t.altitude.map(|(alt, _, _)| ((alt as f32 - own_ft) / 3.28084).round() as i32)
}

/// Traffic summary: target count, highest alarm and the most urgent
/// intruder's geometry.
pub fn pflau(targets: &[Target], snapshot: &Snapshot) -> Vec<u8> {
    let gps_status = if snapshot.gps.is_some() { 2 } else { 0 };

    let urgent = targets
        .iter()
        .filter(|t| t.alertable)
        .min_by(|a, b| {
            let da = a.relative.map(|r| r.distance_nm).unwrap_or(9999.0);
            let db = b.relative.map(|r| r.distance_nm).unwrap_or(9999.0);
            da.partial_cmp(&db).unwrap_or(::std::cmp::Ordering::Equal)
        });

    let body = match urgent {
        Some(t) => {
            let rel = t.relative.expect("alertable targets always have geometry");
            let mut bearing = rel.bearing_deg;
            if let Some(gps) = snapshot.gps {
                bearing -= gps.true_course;
            }
            while bearing > 180.0 {
                bearing -= 360.0;
            }
            while bearing < -180.0 {
                bearing += 360.0;
            }

            format!(
                "PFLAU,{},1,{},1,{},{:.0},2,{},{:.0},{:06X}",
                targets.len(),
                gps_status,
                target_alarm(t),
                bearing,
                relative_vertical_m(t, snapshot)
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
                nm_to_meters(rel.distance_nm),
                t.addr.0 & 0x00FF_FFFF,
            )
        }
        None => format!("PFLAU,{},1,{},1,0,,0,,,", targets.len(), gps_status),
    };

    sentence(&body)
}

/// Per-target report, relative to ownship. `None` when the target has
/// no usable position to project.
pub fn pflaa(t: &Target, snapshot: &Snapshot) -> Option<Vec<u8>> {
    let gps = snapshot.gps?;
    let ((lat, lon), _) = t.lat_lon?;

    let (north, east) = relative_meters(gps.lat, gps.lon, lat, lon);

    let id_type = match t.addr.1 {
        AddressType::ADSBICAO | AddressType::ADSRICAO | AddressType::TISBICAO => 1,
        AddressType::OGNTracker => 2,
        _ => 0,
    };

    let climb = t.vs
        .map(|(fpm, _)| format!("{:.1}", fpm as f32 / 196.85))
        .unwrap_or_default();

    let body = format!(
        "PFLAA,{},{:.0},{:.0},{},{},{:06X},{},,{},{},{:X}",
        target_alarm(t),
        north,
        east,
        relative_vertical_m(t, snapshot)
            .map(|v| v.to_string())
            .unwrap_or_default(),
        id_type,
        t.addr.0 & 0x00FF_FFFF,
        t.track.map(|(trk, _, _)| trk.to_string()).unwrap_or_default(),
        t.speed.map(|(kt, _)| kt.to_string()).unwrap_or_default(),
        climb,
        aircraft_type(t),
    );

    Some(sentence(&body))
}

// best-effort inverse of the emitter category table, for the FLARM
// aircraft type digit
fn aircraft_type(t: &Target) -> u8 {
    match t.category {
        Some(9) => 1,  // glider
        Some(7) => 3,  // rotorcraft
        Some(11) => 4, // skydiver
        Some(12) => 7, // para/hang glider
        Some(2) | Some(3) | Some(4) | Some(5) | Some(6) => 9, // turbine
        Some(10) => 0xB, // balloon
        Some(14) => 0xD, // UAV
        Some(19) => 0xF, // obstacle
        Some(1) => 8,  // piston
        _ => 0xA,      // unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use processor::traffic::{AltitudeType, Relative, TrafficSource};
    use sensor::nmea::verify_sentence;
    use std::str;
    use std::time::Instant;
    use time;

    fn gps() -> GpsAspect {
        let mut g = GpsAspect::default();
        g.quality = 3;
        g.lat = 48.1173;
        g.lon = 11.516667;
        g.alt_msl_ft = 1789.4;
        g.height_wgs84_ft = 1943.2;
        g.hdop = 0.9;
        g.sat_used = 8;
        g.gs_kt = 22.4;
        g.true_course = 84.4;
        g
    }

    fn utc() -> time::Tm {
        let mut tm = time::empty_tm();
        tm.tm_hour = 12;
        tm.tm_min = 35;
        tm.tm_sec = 19;
        tm.tm_mday = 23;
        tm.tm_mon = 2; // March
        tm.tm_year = 94;
        tm
    }

    fn target_north() -> Target {
        let mut t = Target::new((0xDD8741, AddressType::ADSBICAO), Instant::now(),
                                TrafficSource::OGN);
        t.lat_lon = Some(((48.1173 + 1.0 / 60.0, 11.516667), Instant::now()));
        t.altitude = Some((2289, AltitudeType::GNSS, Instant::now()));
        t.speed = Some((55, Instant::now()));
        t.relative = Some(Relative {
            bearing_deg: 0.0,
            distance_nm: 1.0,
            estimated: false,
        });
        t.alertable = true;
        t
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            gps: Some(gps()),
            baro: None,
            ahrs: None,
        }
    }

    #[test]
    fn test_every_sentence_checksums() {
        let snap = snapshot();
        let t = target_north();

        let all = vec![
            gprmc(&utc(), &gps()),
            gpgga(&utc(), &gps()),
            pgrmz(&BaroAspect {
                pressure_alt_ft: 2282.0,
                vs_fpm: 0.0,
                temperature_c: None,
            }),
            pflau(&[t.clone()], &snap),
            pflaa(&t, &snap).unwrap(),
        ];

        for bytes in all {
            let s = str::from_utf8(&bytes).unwrap();
            assert!(s.ends_with("\r\n"), "missing terminator: {:?}", s);
            assert!(verify_sentence(s.trim()).is_some(), "bad checksum: {:?}", s);
        }
    }

    #[test]
    fn test_gprmc_format() {
        let bytes = gprmc(&utc(), &gps());
        let s = String::from_utf8(bytes).unwrap();
        assert!(s.starts_with("$GPRMC,123519,A,4807.0380,N,01131.0000,E,22.4,84.4,230394,,*"),
                "s = {}", s);
    }

    #[test]
    fn test_gpgga_format() {
        let s = String::from_utf8(gpgga(&utc(), &gps())).unwrap();
        assert!(s.starts_with("$GPGGA,123519,4807.0380,N,01131.0000,E,1,08,0.9,545.4,M,46.9,M,,*"),
                "s = {}", s);
    }

    #[test]
    fn test_pflaa_geometry() {
        let s = String::from_utf8(pflaa(&target_north(), &snapshot()).unwrap()).unwrap();
        // one nm north: about 1852 m north, 0 east, 152 m above
        let fields: Vec<&str> = s.trim().trim_left_matches('$').split(',').collect();
        assert_eq!(fields[0], "PFLAA");
        assert_eq!(fields[1], "2"); // alarm
        let north: f32 = fields[2].parse().unwrap();
        assert!((north - 1852.0).abs() < 10.0, "north = {}", north);
        assert_eq!(fields[3], "0");
        let vert: i32 = fields[4].parse().unwrap();
        assert!((vert - 152).abs() <= 2, "vert = {}", vert);
        assert_eq!(fields[6], "DD8741");
    }

    #[test]
    fn test_pflau_no_alarm() {
        let mut quiet = target_north();
        quiet.alertable = false;

        let s = String::from_utf8(pflau(&[quiet], &snapshot())).unwrap();
        assert!(s.starts_with("$PFLAU,1,1,2,1,0,,0,,,*"), "s = {}", s);
    }

    #[test]
    fn test_pflau_alarm_geometry() {
        let s = String::from_utf8(pflau(&[target_north()], &snapshot())).unwrap();
        let fields: Vec<&str> = s.trim().trim_left_matches('$').split(',').collect();
        assert_eq!(fields[5], "2"); // alarm level
        // target bears 000 true, we track 084: about -84 relative
        let brg: f32 = fields[6].parse().unwrap();
        assert!((brg + 84.0).abs() < 1.5, "brg = {}", brg);
        let dist: f32 = fields[9].split('*').next().unwrap().parse().unwrap();
        assert!((dist - 1852.0).abs() < 10.0, "dist = {}", dist);
    }
}
