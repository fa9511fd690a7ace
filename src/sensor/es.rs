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

//! 1090ES adapter. Consumes the dump1090 JSON stream (one object per
//! line, `Icao_addr`/`Lat`/`Lng`/`Alt` style field names) and turns it
//! into traffic deltas.

use super::*;
use processor::{Stores, Update};
use serde_json;

// dump1090 emits this pseudo-address once per second as a keepalive
const ES_HEARTBEAT_ADDR: u32 = 0x07FF_FFFF;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
#[allow(non_snake_case)]
struct EsFrame {
    Icao_addr: Option<u32>,
    DF: Option<u8>,
    CA: Option<u8>,
    TypeCode: Option<u8>,
    SignalLevel: Option<f64>,
    Position_valid: Option<bool>,
    Lat: Option<f32>,
    Lng: Option<f32>,
    Alt: Option<i32>,
    AltIsGNSS: Option<bool>,
    GnssDiffFromBaroAlt: Option<i32>,
    NIC: Option<u8>,
    NACp: Option<u8>,
    Emitter_category: Option<u8>,
    OnGround: Option<bool>,
    Speed_valid: Option<bool>,
    Speed: Option<u16>,
    Track: Option<u16>,
    Vvel: Option<i16>,
    Tail: Option<String>,
    Squawk: Option<u16>,
}

/// One dump1090 JSON line to a traffic delta. `Ok(None)` is a valid
/// frame that carries no traffic (the keepalive), `Err` is noise.
pub fn parse_es_json(line: &str) -> Result<Option<TrafficData>, ()> {
    let frame: EsFrame = serde_json::from_str(line).map_err(|_| ())?;

    let addr = match frame.Icao_addr {
        Some(a) => a,
        None => return Err(()),
    };

    if addr == ES_HEARTBEAT_ADDR {
        return Ok(None);
    }

    let df = frame.DF.unwrap_or(17);
    let ca = frame.CA.unwrap_or(0);

    let (addr_type, target_type) = match df {
        17 => (AddressType::ADSBICAO, TargetType::ADSB),
        18 => {
            match ca {
                2 => (AddressType::TISBICAO, TargetType::TISB),
                6 => (AddressType::ADSRICAO, TargetType::ADSR),
                _ => (AddressType::ADSBOther, TargetType::ADSB),
            }
        }
        4 | 5 | 20 | 21 => (AddressType::ADSBICAO, TargetType::ModeS),
        _ => (AddressType::Unknown, TargetType::ModeS),
    };

    let mut trfc = TrafficData::new((addr & 0x00FF_FFFF, addr_type), TrafficSource::ES);
    trfc.target_type = Some(target_type);

    if let Some(level) = frame.SignalLevel {
        if level > 0.0 {
            trfc.signal_db = Some((10.0 * level.log10()) as f32);
        }
    }

    if target_type == TargetType::ModeS {
        // surveillance replies carry identity and altitude only
        if df == 4 || df == 20 {
            if let Some(alt) = frame.Alt {
                trfc.altitude = Some((alt, AltitudeType::Baro));
            }
        }
        if df == 5 || df == 21 {
            trfc.squawk = frame.Squawk.filter(|&s| s != 0);
        }
        return Ok(Some(trfc));
    }

    if frame.Position_valid == Some(true) {
        if let (Some(lat), Some(lng)) = (frame.Lat, frame.Lng) {
            trfc.lat_lon = Some((lat, lng));
        }
    }

    if let Some(alt) = frame.Alt {
        let typ = if frame.AltIsGNSS == Some(true) {
            AltitudeType::GNSS
        } else {
            AltitudeType::Baro
        };
        trfc.altitude = Some((alt, typ));
    }

    trfc.gnss_delta = frame.GnssDiffFromBaroAlt.filter(|&d| d != 0);

    if frame.Speed_valid == Some(true) {
        trfc.speed = frame.Speed;
        if let Some(track) = frame.Track {
            trfc.track = Some((track, HeadingType::True));
        }
        trfc.vs = frame.Vvel;
    }

    if let Some(tail) = frame.Tail {
        let trimmed = tail.trim().to_string();
        if !trimmed.is_empty() {
            trfc.callsign = Some(trimmed);
        }
    }

    trfc.category = frame.Emitter_category;
    trfc.squawk = trfc.squawk.or(frame.Squawk.filter(|&s| s != 0));
    trfc.nic = frame.NIC;
    trfc.nacp = frame.NACp;
    trfc.on_ground = frame.OnGround;

    Ok(Some(trfc))
}

pub struct EsSink;

impl LineSink for EsSink {
    fn name(&self) -> &'static str {
        "1090ES"
    }

    fn line(&mut self, line: &str, stores: &Stores) -> bool {
        match parse_es_json(line) {
            Ok(Some(trfc)) => {
                trace!("1090ES: {:?}", trfc);
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
    fn test_parse_adsb_position() {
        let line = r#"{"Icao_addr":10560325,"DF":17,"CA":5,"TypeCode":11,
            "Position_valid":true,"Lat":47.4502,"Lng":-122.3088,"Alt":35000,
            "AltIsGNSS":false,"NIC":8,"NACp":9,"Speed_valid":true,"Speed":440,
            "Track":95,"Vvel":-64,"Tail":"UAL123 ","Emitter_category":3,
            "OnGround":false,"SignalLevel":0.0316}"#
            .replace('\n', " ");

        let trfc = parse_es_json(&line).unwrap().unwrap();
        assert_eq!(trfc.addr, (10_560_325 & 0x00FF_FFFF, AddressType::ADSBICAO));
        assert_eq!(trfc.target_type, Some(TargetType::ADSB));
        assert_eq!(trfc.source, TrafficSource::ES);
        assert_eq!(trfc.lat_lon, Some((47.4502, -122.3088)));
        assert_eq!(trfc.altitude, Some((35_000, AltitudeType::Baro)));
        assert_eq!(trfc.speed, Some(440));
        assert_eq!(trfc.track, Some((95, HeadingType::True)));
        assert_eq!(trfc.vs, Some(-64));
        assert_eq!(trfc.callsign.as_ref().unwrap(), "UAL123");
        assert_eq!(trfc.category, Some(3));
        assert_eq!(trfc.nic, Some(8));
        assert_eq!(trfc.nacp, Some(9));
        assert_eq!(trfc.on_ground, Some(false));
        // 0.0316 linear is about -15 dB
        assert!((trfc.signal_db.unwrap() + 15.0).abs() < 0.1);
    }

    #[test]
    fn test_heartbeat_ignored() {
        let trfc = parse_es_json(r#"{"Icao_addr":134217727,"DF":17}"#).unwrap();
        assert!(trfc.is_none());
    }

    #[test]
    fn test_tisb_and_adsr() {
        let tisb = parse_es_json(r#"{"Icao_addr":2883400,"DF":18,"CA":2}"#)
            .unwrap()
            .unwrap();
        assert_eq!(tisb.addr.1, AddressType::TISBICAO);
        assert_eq!(tisb.target_type, Some(TargetType::TISB));

        let adsr = parse_es_json(r#"{"Icao_addr":2883400,"DF":18,"CA":6}"#)
            .unwrap()
            .unwrap();
        assert_eq!(adsr.addr.1, AddressType::ADSRICAO);
        assert_eq!(adsr.target_type, Some(TargetType::ADSR));
    }

    #[test]
    fn test_df4_altitude_only() {
        let line = r#"{"Icao_addr":3958164,"DF":4,"Alt":7500,
            "Position_valid":true,"Lat":1.0,"Lng":2.0,"SignalLevel":0.1}"#
            .replace('\n', " ");

        let trfc = parse_es_json(&line).unwrap().unwrap();
        assert_eq!(trfc.target_type, Some(TargetType::ModeS));
        assert_eq!(trfc.altitude, Some((7_500, AltitudeType::Baro)));
        // a surveillance reply can never carry a position
        assert!(trfc.lat_lon.is_none());
        assert!(trfc.speed.is_none());
    }

    #[test]
    fn test_df5_squawk_only() {
        let trfc = parse_es_json(r#"{"Icao_addr":3958164,"DF":5,"Squawk":7700}"#)
            .unwrap()
            .unwrap();
        assert_eq!(trfc.squawk, Some(7700));
        assert!(trfc.altitude.is_none());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(parse_es_json("not json").is_err());
        assert!(parse_es_json(r#"{"DF":17}"#).is_err());
    }
}
