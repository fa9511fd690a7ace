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

//! 978 MHz UAT adapter. The demodulator hands us framed text lines:
//! `+HEX...;rs=N;ss=N` for ground uplinks (432-byte payload) and
//! `-HEX...;rs=N;ss=N` for air-to-air downlinks (18, 34 or 48 bytes).
//! Downlinks become traffic deltas, uplinks become FIS-B products.

use super::*;
use processor::fisb::FISBData;
use processor::{Stores, Update};
use std::f32::consts::PI;
use utils::from_hex;

const CALLSIGN_BASE40: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ  ..";
const LAT_LON_RESOLUTION: f32 = 360.0 / 16777216_f32; // 2^24
const TRACK_RESOLUTION: f32 = 360.0 / 512.0;

const UPLINK_LEN: usize = 432;
const DOWNLINK_LENS: [usize; 3] = [18, 34, 48];

#[derive(Debug, PartialEq)]
pub enum UatFrame {
    Downlink(TrafficData),
    Uplink(FISBData),
}

/// Decode one framed line from the demodulator.
pub fn parse_uat_line(line: &str) -> Result<UatFrame, ()> {
    let (uplink, body) = match line.chars().next() {
        Some('+') => (true, &line[1..]),
        Some('-') => (false, &line[1..]),
        _ => return Err(()),
    };

    let mut parts = body.split(';');
    let hex = parts.next().ok_or(())?;

    let mut signal_db = None;
    for opt in parts {
        if opt.starts_with("ss=") {
            if let Ok(ss) = opt[3..].trim().parse::<f32>() {
                if ss > 0.0 {
                    // amplitude relative to full scale
                    let db = 20.0 * (ss / 1000.0).log10();
                    signal_db = Some(if db > 0.0 { 0.0 } else { db });
                }
            }
        }
        // rs=N (error corrections used) is informational only: the
        // demodulator already dropped anything uncorrectable
    }

    let payload = from_hex(hex).ok_or(())?;

    if uplink {
        if payload.len() != UPLINK_LEN {
            return Err(());
        }
        parse_uplink(payload).map(UatFrame::Uplink).ok_or(())
    } else {
        if !DOWNLINK_LENS.contains(&payload.len()) {
            return Err(());
        }
        Ok(UatFrame::Downlink(parse_adsb_downlink(&payload, signal_db)))
    }
}

/// 24-bit semicircle latitude/longitude pair, with the high halves
/// wrapping negative.
fn latlon24(b: &[u8]) -> Option<(f32, f32)> {
    let raw_lat = (b[0] as u32) << 15 | (b[1] as u32) << 7 | b[2] as u32 >> 1;
    let raw_lon = ((b[2] & 0x01) as u32) << 23 | (b[3] as u32) << 15 | (b[4] as u32) << 7 |
        b[5] as u32 >> 1;

    if raw_lat == 0 && raw_lon == 0 {
        return None;
    }

    let mut lat = raw_lat as f32 * LAT_LON_RESOLUTION;
    if lat > 90_f32 {
        lat -= 180_f32;
    }

    let mut lon = raw_lon as f32 * LAT_LON_RESOLUTION;
    if lon > 180_f32 {
        lon -= 360_f32;
    }

    Some((lat, lon))
}

// altitude: low byte, then the high nibble; (raw - 1) * 25 - 1000 ft,
// raw = 0 means none
fn altitude12(lo: u8, hi: u8) -> Option<i32> {
    let raw = ((hi as u16 & 0xF0) as u32) << 4 | lo as u32;
    if raw == 0 {
        None
    } else {
        Some((raw as i32 - 1) * 25 - 1000)
    }
}

pub fn parse_adsb_downlink(buf: &[u8], signal_db: Option<f32>) -> TrafficData {
    let addr24 = ((buf[1] as u32) << 16) | ((buf[2] as u32) << 8) | buf[3] as u32;
    let addr_type = match buf[0] & 0x07 {
        0 => AddressType::ADSBICAO,
        1 => AddressType::ADSBOther,
        2 => AddressType::TISBICAO,
        3 => AddressType::TISBOther,
        6 => AddressType::ADSRICAO,
        _ => AddressType::Unknown,
    };

    let mut trfc = TrafficData::new((addr24, addr_type), TrafficSource::UAT);
    trfc.signal_db = signal_db;

    let payload_type = (buf[0] & 0xF8) >> 3;

    if (payload_type == 1 || payload_type == 3) && buf.len() >= 34 {
        let b40 = (buf[17] as u16) << 8 | buf[18] as u16;
        trfc.category = Some((b40 / 1600) as u8);

        if (buf[26] >> 1) & 0x01 == 1 {
            // callsign ID = 1
            let mut callsign = String::with_capacity(8);
            let alphabet = CALLSIGN_BASE40.as_bytes();

            callsign.push(alphabet[(b40 % 1600 / 40) as usize] as char);
            callsign.push(alphabet[(b40 % 40) as usize] as char);

            let b40 = (buf[19] as u16) << 8 | buf[20] as u16;
            callsign.push(alphabet[(b40 / 1600) as usize] as char);
            callsign.push(alphabet[(b40 % 1600 / 40) as usize] as char);
            callsign.push(alphabet[(b40 % 40) as usize] as char);

            let b40 = (buf[21] as u16) << 8 | buf[22] as u16;
            callsign.push(alphabet[(b40 / 1600) as usize] as char);
            callsign.push(alphabet[(b40 % 1600 / 40) as usize] as char);
            callsign.push(alphabet[(b40 % 40) as usize] as char);

            let trimmed = callsign.trim();
            if !trimmed.is_empty() {
                trfc.callsign = Some(trimmed.into());
            }
        } else if (buf[23] >> 2) & 0x07 >= 2 {
            // uat_version >= 2 encodes the squawk in the callsign slot
            let mut squawk = 0;

            squawk += b40 % 1600 / 40 * 1000;
            squawk += b40 % 40 * 100;

            let b40 = (buf[19] as u16) << 8 | buf[20] as u16;
            squawk += b40 / 1600 * 10;
            squawk += b40 % 1600 / 40;

            trfc.squawk = Some(squawk);
        }

        trfc.nacp = Some((buf[25] >> 4) & 0x0F);
        // emergency status currently not extracted
    }

    // state vector, sent in all payload types

    trfc.nic = Some(buf[11] & 0x0F);

    if trfc.addr.1 == AddressType::TISBICAO {
        // a good-integrity TIS-B track with a category is really ADS-R
        if let Some(nic) = trfc.nic {
            if nic >= 7 && trfc.category != None {
                trfc.addr.1 = AddressType::ADSRICAO;
            }
        }
    }

    trfc.target_type = Some(match trfc.addr.1 {
        AddressType::TISBICAO | AddressType::TISBOther => TargetType::TISB,
        AddressType::ADSRICAO | AddressType::ADSROther => TargetType::ADSR,
        _ => TargetType::ADSB,
    });

    trfc.lat_lon = latlon24(&buf[4..10]);

    let mut alt_is_gnss = buf[9] & 0x01 == 1;
    let mut altitude = altitude12(buf[10], buf[11]);

    // long frames of types 2, 5 and 6 carry the other altitude too;
    // prefer to report barometric and keep the geometric offset
    if alt_is_gnss && (payload_type == 2 || payload_type == 5 || payload_type == 6) &&
        buf.len() >= 31
    {
        if let (Some(gnss), Some(baro)) = (altitude, altitude12(buf[29], buf[30])) {
            trfc.gnss_delta = Some(gnss - baro);
            altitude = Some(baro);
            alt_is_gnss = false;
        }
    }

    if let Some(alt) = altitude {
        trfc.altitude = Some((
            alt,
            if alt_is_gnss {
                AltitudeType::GNSS
            } else {
                AltitudeType::Baro
            },
        ));
    }

    match (buf[12] >> 6) & 0x03 {
        typ @ 0 | typ @ 1 => {
            trfc.on_ground = Some(false);

            let raw_ns = (buf[12] as i16 & 0x1F) << 6 | (buf[13] as i16 & 0xFC) >> 2;
            let raw_ew = (buf[13] as i16 & 0x03) << 9 | (buf[14] as i16) << 1 |
                (buf[15] as i16 & 0x80) >> 7;

            if raw_ns & 0x3FF != 0 && raw_ew & 0x3FF != 0 {
                let mut ns_vel = (raw_ns & 0x3FF) as i32 - 1;
                let mut ew_vel = (raw_ew & 0x3FF) as i32 - 1;

                if raw_ns & 0x400 != 0 {
                    ns_vel = -ns_vel;
                }

                if raw_ew & 0x400 != 0 {
                    ew_vel = -ew_vel;
                }

                if typ == 1 {
                    // supersonic scaling
                    ns_vel *= 4;
                    ew_vel *= 4;
                }

                trfc.speed = Some(
                    ((ns_vel * ns_vel) as f32 + (ew_vel * ew_vel) as f32)
                        .sqrt()
                        .round() as u16,
                );
                if ns_vel != 0 || ew_vel != 0 {
                    let trk = ((360 + 90 -
                                    (((ns_vel as f32).atan2(ew_vel as f32) * 180.0 / PI)
                                         .round() as i16)) % 360) as u16;
                    trfc.track = Some((trk, HeadingType::True));
                }
            }

            let raw_vs = ((buf[15] & 0x7F) as i16) << 4 | (buf[16] & 0xF0) as i16 >> 4;
            if raw_vs & 0x1FF != 0 {
                let mut vs = ((raw_vs & 0x1FF) - 1) * 64;

                if raw_vs & 0x200 != 0 {
                    vs = -vs;
                }

                trfc.vs = Some(vs);
            }
        }
        2 => {
            // on the ground
            trfc.on_ground = Some(true);

            let raw_gs = ((buf[12] & 0x1F) as u16) << 6 | (buf[13] & 0xFC) as u16 >> 2;
            if raw_gs != 0 {
                trfc.speed = Some((raw_gs & 0x3FF) - 1);
            }

            let raw_trk = ((buf[13] & 0x03) as u16) << 9 | (buf[14] as u16) << 1 |
                (buf[15] & 0x80) as u16 >> 7;
            trfc.track = Some((
                ((raw_trk & 0x1FF) as f32 * TRACK_RESOLUTION).round() as u16,
                match (raw_trk & 0x600) >> 9 {
                    2 => HeadingType::Mag,
                    _ => HeadingType::True,
                },
            ));
        }
        st => debug!("unknown A/C status: {}", st),
    }

    trfc
}

/// Pull the product key out of a ground uplink: walk the information
/// frames, take the first application payload's product id and report
/// time. The stored payload stays the whole uplink so sibling frames
/// are rebroadcast untouched.
pub fn parse_uplink(payload: Vec<u8>) -> Option<FISBData> {
    let station = latlon24(&payload[0..6]);

    let mut product_id = None;
    let mut time_of_day_s = None;

    {
        let mut data = &payload[8..];
        while data.len() >= 2 {
            let frame_len = (data[0] as usize) << 1 | (data[1] >> 7) as usize;
            let frame_type = data[1] & 0x0F;

            if frame_len == 0 || data.len() < 2 + frame_len {
                break;
            }

            let frame = &data[2..2 + frame_len];
            if frame_type == 0 && frame_len >= 4 {
                product_id = Some(((frame[0] as u32 & 0x1F) << 6) | (frame[1] as u32) >> 2);

                let t_opt = (frame[1] & 0x01) << 1 | frame[2] >> 7;
                if t_opt == 0 {
                    // hours and minutes of the UTC day
                    let hours = (frame[2] >> 2) & 0x1F;
                    let minutes = (frame[2] & 0x03) << 4 | frame[3] >> 4;
                    time_of_day_s = Some(hours as u32 * 3600 + minutes as u32 * 60);
                }
                break;
            }

            data = &data[2 + frame_len..];
        }
    }

    product_id.map(|id| {
        FISBData {
            product_id: id,
            time_of_day_s,
            station,
            payload,
        }
    })
}

pub struct UatSink;

impl LineSink for UatSink {
    fn name(&self) -> &'static str {
        "UAT"
    }

    fn line(&mut self, line: &str, stores: &Stores) -> bool {
        match parse_uat_line(line) {
            Ok(UatFrame::Downlink(trfc)) => {
                trace!("UAT downlink: {:?}", trfc);
                stores.apply(Update::Traffic(trfc));
                true
            }
            Ok(UatFrame::Uplink(fisb)) => {
                trace!("UAT uplink: product {}", fisb.product_id);
                stores.apply(Update::Fisb(fisb));
                true
            }
            Err(()) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_adsb_downlink() {
        let payload = [11, 43, 3, 200, 53, 69, 117, 82, 61, 248, 129, 6, 16, 238, 31, 192, 17, 5,
                       196, 230, 196, 230, 196, 10, 218, 130, 3, 0, 0, 0, 0, 0, 0, 0];
        let mut exp = TrafficData::new((0x2B03C8, AddressType::TISBOther), TrafficSource::UAT);
        exp.target_type = Some(TargetType::TISB);
        exp.altitude = Some((2200, AltitudeType::Baro));
        exp.track = Some((227, HeadingType::True));
        exp.speed = Some(85);
        exp.vs = Some(0);
        exp.category = Some(0);
        exp.lat_lon = Some((37.456383, -122.17355));
        exp.nic = Some(6);
        exp.nacp = Some(8);
        exp.on_ground = Some(false);
        assert_eq!(parse_adsb_downlink(&payload, None), exp);

        let payload = [8, 166, 98, 159, 46, 182, 45, 99, 174, 214, 194, 26, 0, 30, 44, 128, 24, 9,
                       229, 187, 168, 230, 196, 6, 120, 160, 130, 0, 0, 28, 96, 0, 0, 0];
        let mut exp = TrafficData::new((0xA6629F, AddressType::ADSBICAO), TrafficSource::UAT);
        exp.target_type = Some(TargetType::ADSB);
        exp.altitude = Some((10225, AltitudeType::Baro));
        exp.track = Some((274, HeadingType::True));
        exp.speed = Some(88);
        exp.vs = Some(0);
        exp.callsign = Some(String::from("NDU10"));
        exp.category = Some(1);
        exp.lat_lon = Some((32.844100, -109.91043));
        exp.nic = Some(10);
        exp.nacp = Some(10);
        exp.on_ground = Some(false);
        assert_eq!(parse_adsb_downlink(&payload, None), exp);

        let payload = [8, 165, 16, 171, 63, 198, 127, 123, 20, 102, 106, 9, 16, 168, 61, 160, 40,
                       6, 229, 19, 93, 237, 45, 11, 230, 164, 192, 160, 0, 6, 224, 0, 0, 0];
        let mut exp = TrafficData::new((0xA510AB, AddressType::ADSBICAO), TrafficSource::UAT);
        exp.target_type = Some(TargetType::ADSB);
        exp.altitude = Some((1625, AltitudeType::Baro));
        exp.track = Some((109, HeadingType::True));
        exp.speed = Some(129);
        exp.vs = Some(-64);
        exp.squawk = Some(4533);
        exp.category = Some(1);
        exp.lat_lon = Some((44.842050, -93.459595));
        exp.nic = Some(9);
        exp.nacp = Some(10);
        exp.on_ground = Some(false);
        assert_eq!(parse_adsb_downlink(&payload, None), exp);

        let payload = [10, 163, 166, 85, 63, 125, 231, 123, 194, 150, 114, 0, 1, 170, 10, 64, 223,
                       9, 219, 19, 125, 68, 68, 8, 200, 145, 194, 160, 0, 7, 144, 0, 0, 0];
        let mut exp = TrafficData::new((0xA3A655, AddressType::TISBICAO), TrafficSource::UAT);
        exp.target_type = Some(TargetType::TISB);
        exp.altitude = Some((1825, AltitudeType::Baro));
        exp.track = Some((350, HeadingType::True));
        exp.speed = Some(107);
        exp.vs = Some(768);
        exp.callsign = Some(String::from("N334TA"));
        exp.category = Some(1);
        exp.lat_lon = Some((44.642665, -92.98117));
        exp.nic = Some(0);
        exp.nacp = Some(9);
        exp.on_ground = Some(false);
        assert_eq!(parse_adsb_downlink(&payload, None), exp);
    }

    #[test]
    fn test_altitude_decode() {
        // raw = 241: (241 - 1) * 25 - 1000 = 5000 ft, NIC in the low
        // nibble of byte 11
        let mut payload = [0_u8; 34];
        payload[1] = 0xAA;
        payload[2] = 0xBB;
        payload[3] = 0xCC;
        payload[10] = 0xF1;
        payload[11] = 0x08;

        let trfc = parse_adsb_downlink(&payload, None);
        assert_eq!(trfc.addr.0, 0xAABBCC);
        assert_eq!(trfc.altitude, Some((5000, AltitudeType::Baro)));
        assert_eq!(trfc.nic, Some(8));
        assert!(trfc.lat_lon.is_none());
    }

    #[test]
    fn test_latlon_wrap() {
        let mut payload = [0_u8; 18];
        payload[1] = 0x01;
        // raw latitude 0x600000 decodes to 135 deg, which wraps to -45
        payload[4] = 0xC0;
        // raw longitude 0xC00000 decodes to 270 deg, which wraps to -90
        payload[6] = 0x01;
        payload[7] = 0x80;

        let trfc = parse_adsb_downlink(&payload, None);
        let (lat, lon) = trfc.lat_lon.unwrap();
        assert!((lat + 45.0).abs() < 0.001, "lat = {}", lat);
        assert!((lon + 90.0).abs() < 0.001, "lon = {}", lon);
    }

    #[test]
    fn test_gnss_baro_swap() {
        // payload type 2, GNSS primary altitude with an auxiliary
        // pressure altitude in bytes 29-30
        let mut payload = [0_u8; 34];
        payload[0] = 2 << 3;
        payload[1] = 0x01;
        payload[9] = 0x01; // primary altitude is geometric
        // primary raw 241 -> 5000 ft
        payload[10] = 0xF1;
        // auxiliary raw 229 -> 4700 ft
        payload[29] = 0xE5;

        let trfc = parse_adsb_downlink(&payload, None);
        assert_eq!(trfc.altitude, Some((4700, AltitudeType::Baro)));
        assert_eq!(trfc.gnss_delta, Some(300));
    }

    #[test]
    fn test_uat_line_framing() {
        // a short downlink is 18 bytes (36 hex chars)
        let mut line = String::from("-");
        line.push_str("000102030405060708090A0B0C0D0E0F1011");
        line.push_str(";rs=2;ss=500");

        match parse_uat_line(&line) {
            Ok(UatFrame::Downlink(trfc)) => {
                assert_eq!(trfc.addr.0, 0x010203);
                // 500/1000 amplitude is about -6 dB
                assert!((trfc.signal_db.unwrap() + 6.0).abs() < 0.1);
            }
            other => panic!("unexpected parse: {:?}", other),
        }

        assert!(parse_uat_line("-0102").is_err());
        assert!(parse_uat_line("nonsense").is_err());
    }

    #[test]
    fn test_uplink_product_walk() {
        let mut payload = vec![0_u8; 432];
        // ground station at (45, -90)
        payload[0] = 0x40;
        payload[2] = 0x01;
        payload[3] = 0x80;

        // one information frame: length 10, type 0 (APDU)
        payload[8] = 10 >> 1;
        payload[9] = (10 & 0x01) << 7;
        // APDU header: product id 413, hours 14, minutes 30
        // id 413 = 0b110_0111_01 -> frame[0] low 5 bits, frame[1] high 6
        payload[10] = ((413 >> 6) & 0x1F) as u8;
        payload[11] = ((413 & 0x3F) << 2) as u8; // t_opt bit 0 = 0
        payload[12] = 14 << 2 | 30 >> 4;
        payload[13] = (30 & 0x0F) << 4;

        let fisb = parse_uplink(payload).expect("an APDU should be found");
        assert_eq!(fisb.product_id, 413);
        assert_eq!(fisb.time_of_day_s, Some(14 * 3600 + 30 * 60));
        assert_eq!(fisb.payload.len(), 432);
        let (lat, lon) = fisb.station.unwrap();
        assert!((lat - 45.0).abs() < 0.001, "lat = {}", lat);
        assert!((lon + 90.0).abs() < 0.001, "lon = {}", lon);
    }
}
