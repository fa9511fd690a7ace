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

//! OGN/FLARM adapter: one JSON object per line from an 868 MHz decoder
//! (`sys` selects the variant). Also accepts AIS position objects from
//! receivers that carry a 162 MHz chain.

use super::*;
use processor::{Stores, Update};
use serde_json;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumOrHex {
    Num(u32),
    Hex(String),
}

impl NumOrHex {
    fn value(&self) -> Option<u32> {
        match *self {
            NumOrHex::Num(n) => Some(n),
            NumOrHex::Hex(ref s) => u32::from_str_radix(s.trim(), 16).ok(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OgnFrame {
    sys: String,
    addr: Option<NumOrHex>,
    addr_type: Option<u8>,
    acft_type: Option<NumOrHex>,
    acft_cat: Option<NumOrHex>,
    lat_deg: Option<f32>,
    lon_deg: Option<f32>,
    alt_msl_m: Option<f32>,
    alt_hae_m: Option<f32>,
    alt_std_m: Option<f32>,
    track_deg: Option<f32>,
    speed_mps: Option<f32>,
    climb_mps: Option<f32>,
    #[serde(rename = "DOP")]
    dop: Option<f32>,
    snr_db: Option<f32>,
    reg: Option<String>,
    hard: Option<String>,
}

/// One decoder JSON line to a traffic delta. `Ok(None)` is a valid
/// object that carries no traffic (receiver status and the like).
pub fn parse_ogn_json(line: &str) -> Result<Option<TrafficData>, ()> {
    let frame: OgnFrame = serde_json::from_str(line).map_err(|_| ())?;

    match frame.sys.as_str() {
        "OGN" | "FLR" | "SKY" | "PAW" => parse_position(&frame, false),
        "AIS" => parse_position(&frame, true),
        // status and telemetry objects are valid but carry no traffic
        _ => Ok(None),
    }
}

fn parse_position(frame: &OgnFrame, ais: bool) -> Result<Option<TrafficData>, ()> {
    let addr24 = match frame.addr.as_ref().and_then(NumOrHex::value) {
        Some(a) => a & 0x00FF_FFFF,
        None => return Err(()),
    };

    let (addr, addr_type) = if ais {
        (tagged_addr(addr24, ADDR_TAG_AIS), AddressType::Unknown)
    } else {
        match frame.addr_type.unwrap_or(0) {
            1 => (addr24, AddressType::ADSBICAO),
            2 => (tagged_addr(addr24, ADDR_TAG_FLARM), AddressType::OGNTracker),
            3 => (tagged_addr(addr24, ADDR_TAG_OGN_TRACKER), AddressType::OGNTracker),
            _ => (tagged_addr(addr24, ADDR_TAG_OTHER), AddressType::Unknown),
        }
    };

    let source = if ais {
        TrafficSource::AIS
    } else {
        TrafficSource::OGN
    };

    let mut trfc = TrafficData::new((addr, addr_type), source);
    trfc.target_type = Some(if ais { TargetType::AIS } else { TargetType::OGN });

    if let (Some(lat), Some(lon)) = (frame.lat_deg, frame.lon_deg) {
        if lat.abs() <= 90.0 && lon.abs() <= 180.0 {
            trfc.lat_lon = Some((lat, lon));
        }
    }

    // prefer the standard-atmosphere altitude; geometric otherwise
    if let Some(std_m) = frame.alt_std_m {
        let baro_ft = m_to_ft!(std_m).round() as i32;
        trfc.altitude = Some((baro_ft, AltitudeType::Baro));
        if let Some(msl_m) = frame.alt_msl_m {
            trfc.gnss_delta = Some(m_to_ft!(msl_m).round() as i32 - baro_ft);
        }
    } else if let Some(geo_m) = frame.alt_msl_m.or(frame.alt_hae_m) {
        trfc.altitude = Some((m_to_ft!(geo_m).round() as i32, AltitudeType::GNSS));
    }

    if let Some(trk) = frame.track_deg {
        if trk >= 0.0 && trk < 360.0 {
            trfc.track = Some((trk.round() as u16, HeadingType::True));
        }
    }

    if let Some(spd) = frame.speed_mps {
        if spd >= 0.0 {
            trfc.speed = Some(mps_to_kts!(spd).round() as u16);
        }
    }

    if let Some(climb) = frame.climb_mps {
        trfc.vs = Some(mps_to_fpm!(climb).round() as i16);
    }

    trfc.signal_db = frame.snr_db;

    if let Some(ref reg) = frame.reg {
        let trimmed = reg.trim();
        if !trimmed.is_empty() {
            trfc.callsign = Some(trimmed.to_string());
        }
    }

    if ais {
        trfc.category = Some(18); // surface vessel
        trfc.on_ground = Some(true);
    } else if let Some(t) = frame
        .acft_type
        .as_ref()
        .or(frame.acft_cat.as_ref())
        .and_then(NumOrHex::value)
    {
        trfc.category = Some(aircraft_category(t as u8));
    }

    Ok(Some(trfc))
}

/// OGN aircraft type nibble to the GDL90 emitter category.
pub fn aircraft_category(acft_type: u8) -> u8 {
    match acft_type & 0x0F {
        0x1 => 9,  // glider
        0x2 => 1,  // tow plane: light
        0x3 => 7,  // rotorcraft
        0x4 => 11, // skydiver
        0x5 => 1,  // drop plane: light
        0x6 => 12, // hang glider
        0x7 => 12, // paraglider
        0x8 => 1,  // piston: light
        0x9 => 2,  // jet/turboprop: small
        0xB => 10, // balloon
        0xC => 10, // airship
        0xD => 14, // UAV
        0xF => 19, // static obstacle
        _ => 0,
    }
}

pub struct OgnSink;

impl LineSink for OgnSink {
    fn name(&self) -> &'static str {
        "OGN"
    }

    fn line(&mut self, line: &str, stores: &Stores) -> bool {
        match parse_ogn_json(line) {
            Ok(Some(trfc)) => {
                trace!("OGN: {:?}", trfc);
                stores.apply(Update::Traffic(trfc));
                true
            }
            Ok(None) => true,
            Err(()) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flarm() {
        let line = r#"{"sys":"FLR","addr":"DD8741","addr_type":2,"acft_type":"1",
            "lat_deg":46.8251,"lon_deg":9.4883,"alt_msl_m":2350.0,"alt_std_m":2310.0,
            "track_deg":183.0,"speed_mps":28.3,"climb_mps":-1.2,"DOP":1.1,
            "snr_db":12.5,"reg":"HB-3210"}"#
            .replace('\n', " ");

        let trfc = parse_ogn_json(&line).unwrap().unwrap();
        assert_eq!(trfc.addr, (ADDR_TAG_FLARM | 0xDD8741, AddressType::OGNTracker));
        assert_eq!(trfc.target_type, Some(TargetType::OGN));
        assert_eq!(trfc.source, TrafficSource::OGN);
        assert_eq!(trfc.lat_lon, Some((46.8251, 9.4883)));

        let (alt, typ) = trfc.altitude.unwrap();
        assert_eq!(typ, AltitudeType::Baro);
        assert_eq!(alt, 7579); // 2310 m
        assert_eq!(trfc.gnss_delta, Some(131)); // 40 m of split

        assert_eq!(trfc.track, Some((183, HeadingType::True)));
        assert_eq!(trfc.speed, Some(55)); // 28.3 m/s
        assert_eq!(trfc.vs, Some(-236));
        assert_eq!(trfc.category, Some(9));
        assert_eq!(trfc.callsign.as_ref().unwrap(), "HB-3210");
        assert_eq!(trfc.signal_db, Some(12.5));
    }

    #[test]
    fn test_icao_addressed_glider() {
        let line = r#"{"sys":"OGN","addr":4843329,"addr_type":1,"acft_type":"8",
            "lat_deg":51.0,"lon_deg":-0.5,"alt_msl_m":500.0}"#
            .replace('\n', " ");

        let trfc = parse_ogn_json(&line).unwrap().unwrap();
        assert_eq!(trfc.addr, (4_843_329, AddressType::ADSBICAO));
        assert_eq!(trfc.altitude, Some((1640, AltitudeType::GNSS)));
        assert_eq!(trfc.category, Some(1));
    }

    #[test]
    fn test_status_ignored() {
        let line = r#"{"sys":"status","cpu_temp_degC":61.0}"#;
        assert_eq!(parse_ogn_json(line).unwrap(), None);
    }

    #[test]
    fn test_ais_vessel() {
        let line = r#"{"sys":"AIS","addr":211234567,"lat_deg":54.32,"lon_deg":10.14,
            "speed_mps":6.2,"track_deg":271.0}"#
            .replace('\n', " ");

        let trfc = parse_ogn_json(&line).unwrap().unwrap();
        assert_eq!(trfc.source, TrafficSource::AIS);
        assert_eq!(trfc.target_type, Some(TargetType::AIS));
        assert_eq!(trfc.addr.0 >> 24, 4);
        assert_eq!(trfc.category, Some(18));
        assert_eq!(trfc.on_ground, Some(true));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(parse_ogn_json("{").is_err());
        assert!(parse_ogn_json(r#"{"sys":"FLR"}"#).is_err());
    }
}
