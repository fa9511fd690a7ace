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

//! Byte-exact GDL90 message encoders. Every function here is a pure
//! transform from a field struct to a framed byte sequence: CRC-16
//! appended little-endian, 0x7E/0x7D escaped, bracketed in 0x7E flags.
//! No state, no I/O.

const LON_LAT_RESOLUTION: f32 = 180.0 / 8388608.0; // 2^23 (p. 19)
const TRACK_RESOLUTION: f32 = 360.0 / 256.0;
// using Garmin's sample program on page p. 7
const CRC16_TABLE: [u16; 256] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50A5, 0x60C6, 0x70E7, 0x8108, 0x9129, 0xA14A, 0xB16B,
    0xC18C, 0xD1AD, 0xE1CE, 0xF1EF, 0x1231, 0x0210, 0x3273, 0x2252, 0x52B5, 0x4294, 0x72F7, 0x62D6,
    0x9339, 0x8318, 0xB37B, 0xA35A, 0xD3BD, 0xC39C, 0xF3FF, 0xE3DE, 0x2462, 0x3443, 0x0420, 0x1401,
    0x64E6, 0x74C7, 0x44A4, 0x5485, 0xA56A, 0xB54B, 0x8528, 0x9509, 0xE5EE, 0xF5CF, 0xC5AC, 0xD58D,
    0x3653, 0x2672, 0x1611, 0x0630, 0x76D7, 0x66F6, 0x5695, 0x46B4, 0xB75B, 0xA77A, 0x9719, 0x8738,
    0xF7DF, 0xE7FE, 0xD79D, 0xC7BC, 0x48C4, 0x58E5, 0x6886, 0x78A7, 0x0840, 0x1861, 0x2802, 0x3823,
    0xC9CC, 0xD9ED, 0xE98E, 0xF9AF, 0x8948, 0x9969, 0xA90A, 0xB92B, 0x5AF5, 0x4AD4, 0x7AB7, 0x6A96,
    0x1A71, 0x0A50, 0x3A33, 0x2A12, 0xDBFD, 0xCBDC, 0xFBBF, 0xEB9E, 0x9B79, 0x8B58, 0xBB3B, 0xAB1A,
    0x6CA6, 0x7C87, 0x4CE4, 0x5CC5, 0x2C22, 0x3C03, 0x0C60, 0x1C41, 0xEDAE, 0xFD8F, 0xCDEC, 0xDDCD,
    0xAD2A, 0xBD0B, 0x8D68, 0x9D49, 0x7E97, 0x6EB6, 0x5ED5, 0x4EF4, 0x3E13, 0x2E32, 0x1E51, 0x0E70,
    0xFF9F, 0xEFBE, 0xDFDD, 0xCFFC, 0xBF1B, 0xAF3A, 0x9F59, 0x8F78, 0x9188, 0x81A9, 0xB1CA, 0xA1EB,
    0xD10C, 0xC12D, 0xF14E, 0xE16F, 0x1080, 0x00A1, 0x30C2, 0x20E3, 0x5004, 0x4025, 0x7046, 0x6067,
    0x83B9, 0x9398, 0xA3FB, 0xB3DA, 0xC33D, 0xD31C, 0xE37F, 0xF35E, 0x02B1, 0x1290, 0x22F3, 0x32D2,
    0x4235, 0x5214, 0x6277, 0x7256, 0xB5EA, 0xA5CB, 0x95A8, 0x8589, 0xF56E, 0xE54F, 0xD52C, 0xC50D,
    0x34E2, 0x24C3, 0x14A0, 0x0481, 0x7466, 0x6447, 0x5424, 0x4405, 0xA7DB, 0xB7FA, 0x8799, 0x97B8,
    0xE75F, 0xF77E, 0xC71D, 0xD73C, 0x26D3, 0x36F2, 0x0691, 0x16B0, 0x6657, 0x7676, 0x4615, 0x5634,
    0xD94C, 0xC96D, 0xF90E, 0xE92F, 0x99C8, 0x89E9, 0xB98A, 0xA9AB, 0x5844, 0x4865, 0x7806, 0x6827,
    0x18C0, 0x08E1, 0x3882, 0x28A3, 0xCB7D, 0xDB5C, 0xEB3F, 0xFB1E, 0x8BF9, 0x9BD8, 0xABBB, 0xBB9A,
    0x4A75, 0x5A54, 0x6A37, 0x7A16, 0x0AF1, 0x1AD0, 0x2AB3, 0x3A92, 0xFD2E, 0xED0F, 0xDD6C, 0xCD4D,
    0xBDAA, 0xAD8B, 0x9DE8, 0x8DC9, 0x7C26, 0x6C07, 0x5C64, 0x4C45, 0x3CA2, 0x2C83, 0x1CE0, 0x0CC1,
    0xEF1F, 0xFF3E, 0xCF5D, 0xDF7C, 0xAF9B, 0xBFBA, 0x8FD9, 0x9FF8, 0x6E17, 0x7E36, 0x4E55, 0x5E74,
    0x2E93, 0x3EB2, 0x0ED1, 0x1EF0,
];

pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0_u16, |crc, &b| {
        CRC16_TABLE[(crc >> 8) as usize] ^ (crc << 8) ^ b as u16
    })
}

/// Given a buffer containing everything between "Flag Bytes" (see p. 5)
/// with the CRC field space allocated but left empty for calculation
pub fn frame(buf: &mut [u8]) -> Vec<u8> {
    let len = buf.len() - 2;

    let crc = crc16(&buf[..len]);
    buf[len] = (crc & 0xFF) as u8;
    buf[len + 1] = (crc >> 8) as u8;

    // len + CRC (2 bytes) + 2 Flag Bytes + some stuffing bytes
    let mut tmp = Vec::with_capacity(len + 4);
    tmp.push(0x7E);

    for b in buf.iter() {
        if *b == 0x7E || *b == 0x7D {
            tmp.push(0x7D);
            tmp.push(*b ^ 0x20);
        } else {
            tmp.push(*b);
        }
    }

    tmp.push(0x7E);

    tmp
}

/// Undo [`frame`]: strip the flags, unescape, verify the CRC. Returns
/// the bare message (without CRC), or `None` when the framing or CRC
/// is bad.
pub fn deframe(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < 5 || data[0] != 0x7E || data[data.len() - 1] != 0x7E {
        return None;
    }

    let mut out = Vec::with_capacity(data.len() - 2);
    let mut escape = false;

    for &b in &data[1..data.len() - 1] {
        if escape {
            out.push(b ^ 0x20);
            escape = false;
        } else if b == 0x7D {
            escape = true;
        } else if b == 0x7E {
            return None;
        } else {
            out.push(b);
        }
    }

    if escape || out.len() < 3 {
        return None;
    }

    let len = out.len() - 2;
    let crc = crc16(&out[..len]);
    if out[len] != (crc & 0xFF) as u8 || out[len + 1] != (crc >> 8) as u8 {
        return None;
    }

    out.truncate(len);
    Some(out)
}

/// Heartbeat (id 0x00) fields.
#[derive(Debug, Default, Copy, Clone)]
pub struct Heartbeat {
    pub gps_valid: bool,
    pub maintenance: bool,
    pub utc_ok: bool,
    pub seconds_since_midnight: u32,
    /// Uplink messages accepted in the last second.
    pub uplink_count: u8,
    /// Basic and long messages accepted in the last second.
    pub basic_long_count: u16,
}

pub fn heartbeat(h: &Heartbeat) -> Vec<u8> {
    let mut buf = [0_u8; 7 + 2]; // incl CRC field

    buf[0] = 0x00; // type = heartbeat
    buf[1] = 0x11; // UAT Initialized + ATC Services talkback

    if h.gps_valid {
        buf[1] |= 0x80;
    }
    if h.maintenance {
        buf[1] |= 0x40;
    }

    let ts = h.seconds_since_midnight;
    buf[2] = ((ts & 0x10000) >> 9) as u8;
    if h.utc_ok {
        buf[2] |= 0x01;
    }
    buf[3] = (ts & 0xFF) as u8;
    buf[4] = ((ts & 0xFF00) >> 8) as u8;

    let counts = ((h.uplink_count as u16 & 0x1F) << 11) | (h.basic_long_count & 0x3FF);
    buf[5] = (counts >> 8) as u8;
    buf[6] = (counts & 0xFF) as u8;

    frame(&mut buf)
}

/// Receiver status heartbeat ("SX"), carrying link and store health
/// for displays that understand it.
#[derive(Debug, Default, Copy, Clone)]
pub struct StatusReport {
    pub fw_major: u8,
    pub fw_minor: u8,
    pub gps_valid: bool,
    pub baro_valid: bool,
    pub ahrs_valid: bool,
    pub es_link_up: bool,
    pub uat_link_up: bool,
    pub ogn_link_up: bool,
    pub sat_locked: u8,
    pub sat_seen: u8,
    pub es_targets: u16,
    pub other_targets: u16,
    pub es_rate: u16,
    pub uat_rate: u16,
    pub uptime_s: u32,
}

pub fn status_heartbeat(s: &StatusReport) -> Vec<u8> {
    let mut buf = [0_u8; 29 + 2]; // incl CRC field

    buf[0] = 0x53; // 'S'
    buf[1] = 0x58; // 'X'
    buf[2] = 0x01; // message version

    buf[3] = s.fw_major;
    buf[4] = s.fw_minor;

    if s.gps_valid {
        buf[7] |= 0x01;
    }
    if s.baro_valid {
        buf[7] |= 0x02;
    }
    if s.ahrs_valid {
        buf[7] |= 0x04;
    }
    if s.es_link_up {
        buf[7] |= 0x08;
    }
    if s.uat_link_up {
        buf[7] |= 0x10;
    }
    if s.ogn_link_up {
        buf[7] |= 0x20;
    }

    buf[9] = s.sat_locked;
    buf[10] = s.sat_seen;

    buf[11] = (s.es_targets >> 8) as u8;
    buf[12] = (s.es_targets & 0xFF) as u8;
    buf[13] = (s.other_targets >> 8) as u8;
    buf[14] = (s.other_targets & 0xFF) as u8;

    buf[15] = (s.es_rate >> 8) as u8;
    buf[16] = (s.es_rate & 0xFF) as u8;
    buf[17] = (s.uat_rate >> 8) as u8;
    buf[18] = (s.uat_rate & 0xFF) as u8;

    buf[19] = (s.uptime_s >> 24) as u8;
    buf[20] = (s.uptime_s >> 16) as u8;
    buf[21] = (s.uptime_s >> 8) as u8;
    buf[22] = s.uptime_s as u8;

    frame(&mut buf)
}

/// Fields shared by the ownship report (0x0A) and the traffic report
/// (0x14).
#[derive(Debug, Clone)]
pub struct Report {
    pub alert: bool,
    /// Address qualifier nibble: 0 ICAO, 1 self-assigned, 2 TIS-B
    /// with ICAO, 3 TIS-B track file.
    pub addr_type: u8,
    pub addr: u32,
    pub position_valid: bool,
    pub lat: f32,
    pub lon: f32,
    pub altitude_ft: Option<i32>,
    /// Miscellaneous nibble: bit 3 airborne, bits 0-1 track type.
    pub misc: u8,
    pub nic: u8,
    pub nacp: u8,
    pub gs_kt: Option<u16>,
    pub vs_fpm: Option<i16>,
    pub track_deg: Option<f32>,
    pub emitter_category: u8,
    pub callsign: String,
    /// Emergency/priority code nibble; 1 = general emergency.
    pub emergency: u8,
}

impl Default for Report {
    fn default() -> Report {
        Report {
            alert: false,
            addr_type: 0,
            addr: 0,
            position_valid: false,
            lat: 0.0,
            lon: 0.0,
            altitude_ft: None,
            misc: 0x08, // airborne, track unavailable
            nic: 0,
            nacp: 0,
            gs_kt: None,
            vs_fpm: None,
            track_deg: None,
            emitter_category: 0,
            callsign: String::new(),
            emergency: 0,
        }
    }
}

pub fn ownship_report(r: &Report) -> Vec<u8> {
    report_message(0x0A, r)
}

pub fn traffic_report(r: &Report) -> Vec<u8> {
    report_message(0x14, r)
}

fn report_message(id: u8, r: &Report) -> Vec<u8> {
    let mut buf = [0_u8; 28 + 2]; // incl CRC field

    buf[0] = id;

    buf[1] = r.addr_type & 0x0F;
    if r.alert {
        buf[1] |= 0x10;
    }

    buf[2] = ((0xFF0000 & r.addr) >> 16) as u8;
    buf[3] = ((0x00FF00 & r.addr) >> 8) as u8;
    buf[4] = (0x0000FF & r.addr) as u8;

    if r.position_valid {
        let (lat1, lat2, lat3) = latlon_to_gdl90(r.lat);
        buf[5] = lat1;
        buf[6] = lat2;
        buf[7] = lat3;

        let (lon1, lon2, lon3) = latlon_to_gdl90(r.lon);
        buf[8] = lon1;
        buf[9] = lon2;
        buf[10] = lon3;

        buf[13] = (r.nic << 4) & 0xF0;
    }
    // without a position, lat/lon stay zero and NIC reads 0

    let alt = match r.altitude_ft {
        Some(ft) => alt_to_gdl90(ft as f32),
        None => 0xFFF,
    };
    buf[11] = ((alt & 0xFF0) >> 4) as u8;
    buf[12] = ((alt & 0x00F) << 4) as u8 | (r.misc & 0x0F);

    buf[13] |= r.nacp & 0x0F;

    match r.gs_kt {
        Some(gs) => {
            let gs = if gs > 0xFFE { 0xFFE } else { gs };
            buf[14] = ((gs & 0xFF0) >> 4) as u8;
            buf[15] = ((gs & 0x00F) << 4) as u8;
        }
        None => {
            // horizontal velocity unavailable
            buf[14] = 0xFF;
            buf[15] = 0xF0;
        }
    }

    match r.vs_fpm {
        Some(vs) => {
            let vs = (vs as f32 / 64_f32).round() as i16; // see p. 21
            buf[15] |= ((vs & 0xF00) >> 8) as u8;
            buf[16] = (vs & 0xFF) as u8;
        }
        None => {
            buf[15] |= 0x08; // no vertical rate available
        }
    }

    if let Some(track) = r.track_deg {
        buf[17] = crs_to_gdl90(track);
    }

    buf[18] = r.emitter_category;

    for (i, c) in r.callsign.bytes().take(8).enumerate() {
        buf[19 + i] = c;
    }
    for i in r.callsign.len().min(8)..8 {
        buf[19 + i] = b' ';
    }

    buf[27] = (r.emergency & 0x0F) << 4;

    frame(&mut buf)
}

/// Ownship geometric altitude (id 0x0B).
#[derive(Debug, Copy, Clone)]
pub struct GeoAltitude {
    pub alt_wgs84_ft: i32,
    /// Vertical figure of merit, meters. 0x7FFF = unknown.
    pub vfom_m: u16,
    pub vertical_warning: bool,
}

pub fn ownship_geo_altitude(g: &GeoAltitude) -> Vec<u8> {
    let mut buf = [0_u8; 5 + 2]; // incl CRC field

    buf[0] = 0x0B; // type = ownship geometric

    let alt = (g.alt_wgs84_ft / 5) as i16;
    buf[1] = (alt >> 8) as u8;
    buf[2] = (alt & 0x00FF) as u8;

    let mut vfom = g.vfom_m & 0x7FFF;
    if g.vertical_warning {
        vfom |= 0x8000;
    }
    buf[3] = (vfom >> 8) as u8;
    buf[4] = (vfom & 0xFF) as u8;

    frame(&mut buf)
}

/// ForeFlight identification (0x65 sub 0).
pub fn foreflight_id(device_name: &str) -> Vec<u8> {
    // see: https://www.foreflight.com/connect/spec/
    let mut buf = [0_u8; 39 + 2]; // incl CRC field

    buf[0] = 0x65; // type = ForeFlight
    buf[1] = 0x00; // sub ID = identification
    buf[2] = 0x01; // version = 1

    for i in 3..11 {
        buf[i] = 0xFF; // serial = invalid
    }

    for (i, c) in device_name.bytes().take(8).enumerate() {
        buf[11 + i] = c; // device name
    }
    for (i, c) in device_name.bytes().take(16).enumerate() {
        buf[19 + i] = c; // long device name
    }

    buf[38] = 0x01; // geometric altitude datum = MSL

    frame(&mut buf)
}

/// ForeFlight AHRS (0x65 sub 1). Unknown fields are sent as the
/// designated invalid patterns.
#[derive(Debug, Default, Copy, Clone)]
pub struct AhrsReport {
    pub roll_deg: Option<f32>,
    pub pitch_deg: Option<f32>,
    pub heading_deg: Option<f32>,
    pub heading_is_true: bool,
    pub ias_kt: Option<u16>,
    pub tas_kt: Option<u16>,
}

pub fn foreflight_ahrs(a: &AhrsReport) -> Vec<u8> {
    let mut buf = [0_u8; 12 + 2]; // incl CRC field

    buf[0] = 0x65; // type = ForeFlight
    buf[1] = 0x01; // sub ID = AHRS

    let deci = |v: Option<f32>| -> u16 {
        match v {
            Some(d) => ((d * 10.0).round() as i16) as u16,
            None => 0x7FFF,
        }
    };

    let roll = deci(a.roll_deg);
    buf[2] = (roll >> 8) as u8;
    buf[3] = (roll & 0xFF) as u8;

    let pitch = deci(a.pitch_deg);
    buf[4] = (pitch >> 8) as u8;
    buf[5] = (pitch & 0xFF) as u8;

    let mut heading = deci(a.heading_deg);
    if a.heading_deg.is_some() && a.heading_is_true {
        heading |= 0x8000;
    }
    buf[6] = (heading >> 8) as u8;
    buf[7] = (heading & 0xFF) as u8;

    let ias = a.ias_kt.unwrap_or(0xFFFF);
    buf[8] = (ias >> 8) as u8;
    buf[9] = (ias & 0xFF) as u8;

    let tas = a.tas_kt.unwrap_or(0xFFFF);
    buf[10] = (tas >> 8) as u8;
    buf[11] = (tas & 0xFF) as u8;

    frame(&mut buf)
}

/// Uplink data passthrough (id 0x07): time of reception (unknown) and
/// the 432-byte FIS-B payload.
pub fn uplink(payload: &[u8]) -> Vec<u8> {
    let mut buf = [0_u8; 436 + 2]; // incl CRC field

    buf[0] = 0x07; // type = uplink

    buf[1] = 0xFF; // TOR = invalid
    buf[2] = 0xFF;
    buf[3] = 0xFF;

    let n = payload.len().min(432);
    buf[4..4 + n].copy_from_slice(&payload[..n]);

    frame(&mut buf)
}

/// Given coordinate in degrees, return the GDL 90 formatted byte sequence
pub fn latlon_to_gdl90(mut d: f32) -> (u8, u8, u8) {
    d /= LON_LAT_RESOLUTION;
    let wk = d.round() as i32;

    (
        ((wk & 0xFF0000) >> 16) as u8,
        ((wk & 0x00FF00) >> 8) as u8,
        (wk & 0x0000FF) as u8,
    )
}

/// Inverse of [`latlon_to_gdl90`], for verification.
pub fn gdl90_to_latlon(b1: u8, b2: u8, b3: u8) -> f32 {
    let mut raw = ((b1 as i32) << 16) | ((b2 as i32) << 8) | b3 as i32;
    if raw & 0x800000 != 0 {
        raw -= 0x1000000; // sign-extend the 24-bit field
    }

    raw as f32 * LON_LAT_RESOLUTION
}

pub fn alt_to_gdl90(mut a: f32) -> u16 {
    if a < -1000_f32 || a > 101350_f32 {
        0xFFF
    } else {
        a += 1000_f32; // see p. 20
        a /= 25_f32;

        (a.round() as u16) & 0xFFF
    }
}

pub fn crs_to_gdl90(mut c: f32) -> u8 {
    while c > 360_f32 {
        c -= 360_f32;
    }

    while c < 0_f32 {
        c += 360_f32;
    }

    (c / TRACK_RESOLUTION) as u8
}
