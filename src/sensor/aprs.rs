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

//! APRS-IS adapter for the glider network: textual position beacons
//! over a TCP stream. Ground station lines are filtered out before
//! parsing; stealth and no-track beacons are honored by dropping them.

use super::*;
use processor::{Stores, Update};
use regex::Regex;

const BEACON_PATTERN: &str = r"(?x)
    ^(ICA|FLR|OGN|SKY|PAW|RND|FMT|MTK|XCG|FAN|FNT)
    ([0-9A-Fa-f]{6})>
    .*?:/
    (\d{6})h
    (\d{2})(\d{2}\.\d{2})([NS])
    .
    (\d{3})(\d{2}\.\d{2})([EW])
    .
    (?:(\d{3})/(\d{3}))?
    (?:/A=(\d{6}))?
    (.*)$";

pub struct AprsSink {
    login: Option<String>,
    beacon: Regex,
    precision: Regex,
    id_field: Regex,
    climb: Regex,
    snr: Regex,
}

impl AprsSink {
    pub fn new(login: Option<String>) -> Self {
        AprsSink {
            login,
            beacon: Regex::new(BEACON_PATTERN).unwrap(),
            precision: Regex::new(r"!W(\d)(\d)!").unwrap(),
            id_field: Regex::new(r"\bid([0-9A-Fa-f]{8})\b").unwrap(),
            climb: Regex::new(r"([+-]?\d+)fpm\b").unwrap(),
            snr: Regex::new(r"([+-]?[0-9.]+)dB\b").unwrap(),
        }
    }

    /// Decode one beacon. `Ok(None)` is a line we understand and
    /// deliberately ignore.
    pub fn parse(&self, line: &str) -> Result<Option<TrafficData>, ()> {
        let caps = self.beacon.captures(line).ok_or(())?;

        let prefix = caps.get(1).unwrap().as_str();
        let header_addr = u32::from_str_radix(caps.get(2).unwrap().as_str(), 16)
            .map_err(|_| ())?;
        let rest = caps.get(13).map_or("", |m| m.as_str());

        // position enhancement digits refine the minutes field
        let (lat_extra, lon_extra) = match self.precision.captures(rest) {
            Some(pe) => (
                pe.get(1).unwrap().as_str().parse::<f64>().unwrap_or(0.0),
                pe.get(2).unwrap().as_str().parse::<f64>().unwrap_or(0.0),
            ),
            None => (0.0, 0.0),
        };

        let lat_deg: f64 = caps.get(4).unwrap().as_str().parse().map_err(|_| ())?;
        let lat_min: f64 = caps.get(5).unwrap().as_str().parse().map_err(|_| ())?;
        let mut lat = dm_to_deg(lat_deg, lat_min + lat_extra / 1000.0);
        if caps.get(6).unwrap().as_str() == "S" {
            lat = -lat;
        }

        let lon_deg: f64 = caps.get(7).unwrap().as_str().parse().map_err(|_| ())?;
        let lon_min: f64 = caps.get(8).unwrap().as_str().parse().map_err(|_| ())?;
        let mut lon = dm_to_deg(lon_deg, lon_min + lon_extra / 1000.0);
        if caps.get(9).unwrap().as_str() == "W" {
            lon = -lon;
        }

        // the id field's flag byte: stealth, no-track, aircraft type,
        // address type (Stttttaa)
        let (flags, detail_addr) = match self.id_field.captures(rest) {
            Some(id) => {
                let raw = u32::from_str_radix(id.get(1).unwrap().as_str(), 16)
                    .map_err(|_| ())?;
                (Some((raw >> 24) as u8), Some(raw & 0x00FF_FFFF))
            }
            None => (None, None),
        };

        if let Some(f) = flags {
            if f & 0xC0 != 0 {
                // stealth or no-track: the operator asked not to be
                // rebroadcast
                return Ok(None);
            }
        }

        let addr24 = detail_addr.unwrap_or(header_addr);
        let addr_type = flags.map(|f| f & 0x03).unwrap_or_else(|| match prefix {
            "ICA" => 1,
            "FLR" => 2,
            "OGN" => 3,
            _ => 0,
        });

        let addr = match addr_type {
            1 => (addr24, AddressType::ADSBICAO),
            2 => (tagged_addr(addr24, ADDR_TAG_FLARM), AddressType::OGNTracker),
            3 => (tagged_addr(addr24, ADDR_TAG_OGN_TRACKER), AddressType::OGNTracker),
            _ => (tagged_addr(addr24, ADDR_TAG_OTHER), AddressType::Unknown),
        };

        let mut trfc = TrafficData::new(addr, TrafficSource::OGN);
        trfc.target_type = Some(TargetType::OGN);
        trfc.lat_lon = Some((lat as f32, lon as f32));

        if let (Some(crs), Some(spd)) = (caps.get(10), caps.get(11)) {
            let crs: u16 = crs.as_str().parse().map_err(|_| ())?;
            let spd: u16 = spd.as_str().parse().map_err(|_| ())?;
            if crs <= 360 {
                trfc.track = Some((crs % 360, HeadingType::True));
            }
            trfc.speed = Some(spd);
        }

        if let Some(alt) = caps.get(12) {
            let alt_ft: i32 = alt.as_str().parse().map_err(|_| ())?;
            trfc.altitude = Some((alt_ft, AltitudeType::GNSS));
        }

        if let Some(c) = self.climb.captures(rest) {
            if let Ok(fpm) = c.get(1).unwrap().as_str().parse::<i32>() {
                trfc.vs = Some(fpm as i16);
            }
        }

        if let Some(s) = self.snr.captures(rest) {
            if let Ok(db) = s.get(1).unwrap().as_str().parse::<f32>() {
                trfc.signal_db = Some(db);
            }
        }

        if let Some(f) = flags {
            trfc.category = Some(super::ogn::aircraft_category((f >> 2) & 0x0F));
        }

        Ok(Some(trfc))
    }
}

impl LineSink for AprsSink {
    fn name(&self) -> &'static str {
        "APRS"
    }

    fn greeting(&self) -> Option<String> {
        self.login.as_ref().map(|l| format!("{}\r\n", l))
    }

    fn line(&mut self, line: &str, stores: &Stores) -> bool {
        // server chatter and ground station beacons
        if line.starts_with('#') || line.contains("TCPIP*,qAC,") {
            return true;
        }

        match self.parse(line) {
            Ok(Some(trfc)) => {
                trace!("APRS: {:?}", trfc);
                stores.apply(Update::Traffic(trfc));
                true
            }
            Ok(None) => true,
            Err(()) => false,
        }
    }
}

/// Degrees + decimal minutes to decimal degrees.
pub fn dm_to_deg(degrees: f64, minutes: f64) -> f64 {
    degrees + minutes / 60.0
}

/// Decimal degrees back to (degrees, decimal minutes).
pub fn deg_to_dm(deg: f64) -> (f64, f64) {
    let d = deg.trunc();
    (d, (deg - d) * 60.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flarm_beacon() {
        let sink = AprsSink::new(None);
        let line = "FLRDDE626>APRS,qAS,EGHL:/074548h5111.32N/00102.04W'086/007/A=000607 \
                    !W52! id0ADDE626 -019fpm +0.0rot 5.5dB 3e -4.3kHz gps4x5";

        let trfc = sink.parse(line).unwrap().unwrap();
        assert_eq!(trfc.addr, (ADDR_TAG_FLARM | 0xDDE626, AddressType::OGNTracker));
        assert_eq!(trfc.source, TrafficSource::OGN);

        let (lat, lon) = trfc.lat_lon.unwrap();
        assert!((lat as f64 - (51.0 + 11.325 / 60.0)).abs() < 1e-5, "lat = {}", lat);
        assert!((lon as f64 + (1.0 + 2.042 / 60.0)).abs() < 1e-5, "lon = {}", lon);

        assert_eq!(trfc.track, Some((86, HeadingType::True)));
        assert_eq!(trfc.speed, Some(7));
        assert_eq!(trfc.altitude, Some((607, AltitudeType::GNSS)));
        assert_eq!(trfc.vs, Some(-19));
        assert_eq!(trfc.signal_db, Some(5.5));
        // flag byte 0x0A: tow plane, FLARM address
        assert_eq!(trfc.category, Some(1));
    }

    #[test]
    fn test_parse_icao_beacon() {
        let sink = AprsSink::new(None);
        let line = "ICA4B43D0>APRS,qAS,LSZI:/123456h4657.62N/00800.73E'090/054/A=003150 \
                    id054B43D0 +119fpm";

        let trfc = sink.parse(line).unwrap().unwrap();
        // flag byte 0x05: ICAO address, glider
        assert_eq!(trfc.addr, (0x4B43D0, AddressType::ADSBICAO));
        assert_eq!(trfc.category, Some(9));
        assert_eq!(trfc.altitude, Some((3150, AltitudeType::GNSS)));
        assert_eq!(trfc.vs, Some(119));
    }

    #[test]
    fn test_stealth_dropped() {
        let sink = AprsSink::new(None);
        let line = "FLRDDE626>APRS,qAS,EGHL:/074548h5111.32N/00102.04W'086/007/A=000607 \
                    id8ADDE626";
        assert_eq!(sink.parse(line).unwrap(), None);
    }

    #[test]
    fn test_noise_rejected() {
        let sink = AprsSink::new(None);
        assert!(sink.parse("EGHL>APRS,TCPIP*,qAC,GLIDERN1:/074555h5111.32NI00102.04W&").is_err());
        assert!(sink.parse("random junk").is_err());
    }

    #[test]
    fn test_dm_round_trip() {
        for &deg in &[51.188750f64, -1.034033, 0.000001, 89.999999, 179.5] {
            let a = deg.abs();
            let (d, m) = deg_to_dm(a);
            let back = dm_to_deg(d, m);
            assert!((back - a).abs() < 1e-6, "deg = {} back = {}", a, back);
        }
    }
}
