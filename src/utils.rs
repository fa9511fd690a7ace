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

#[macro_export]
macro_rules! m_to_ft {
    ($x:expr) => (($x as f32) * 3.28084_f32);
}

#[macro_export]
macro_rules! mps_to_kts {
    ($x:expr) => (($x as f32) * 1.94384_f32);
}

#[macro_export]
macro_rules! mps_to_fpm {
    ($x:expr) => (($x as f32) * 196.85_f32);
}

/// Run `$action` once every `$secs` invocations. The caller is assumed
/// to invoke this once per second.
#[macro_export]
macro_rules! run_every {
    ($secs:expr, $counter:expr, $action:block) => {
        $counter += 1;
        if $counter >= $secs as u32 {
            $counter = 0;
            $action;
        }
    }
}

const EARTH_RADIUS_NM: f64 = 3440.065;
const METERS_PER_NM: f64 = 1852.0;
/// Meters of latitude per degree, for short-range flat projections.
const METERS_PER_DEG: f64 = 111_320.0;

/// Great-circle distance (nm) and initial bearing (deg true, 0..360)
/// between two WGS-84 coordinates.
pub fn great_circle(lat1: f32, lon1: f32, lat2: f32, lon2: f32) -> (f32, f32) {
    let phi1 = (lat1 as f64).to_radians();
    let phi2 = (lat2 as f64).to_radians();
    let d_phi = ((lat2 - lat1) as f64).to_radians();
    let d_lam = ((lon2 - lon1) as f64).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lam / 2.0).sin().powi(2);
    let dist = 2.0 * a.sqrt().atan2((1.0 - a).sqrt()) * EARTH_RADIUS_NM;

    let y = d_lam.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lam.cos();
    let mut brg = y.atan2(x).to_degrees();
    if brg < 0.0 {
        brg += 360.0;
    }

    (dist as f32, brg as f32)
}

/// Advance a position along `track_deg` by `dist_nm` on the sphere.
pub fn dead_reckon(lat: f32, lon: f32, track_deg: f32, dist_nm: f32) -> (f32, f32) {
    let phi1 = (lat as f64).to_radians();
    let lam1 = (lon as f64).to_radians();
    let theta = (track_deg as f64).to_radians();
    let delta = dist_nm as f64 / EARTH_RADIUS_NM;

    let phi2 = (phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos()).asin();
    let lam2 = lam1 +
        (theta.sin() * delta.sin() * phi1.cos()).atan2(delta.cos() - phi1.sin() * phi2.sin());

    (phi2.to_degrees() as f32, normalize_lon(lam2.to_degrees()) as f32)
}

fn normalize_lon(mut lon: f64) -> f64 {
    while lon > 180.0 {
        lon -= 360.0;
    }
    while lon < -180.0 {
        lon += 360.0;
    }
    lon
}

/// Offset a position by relative north/east meters (flat projection,
/// adequate for the few-km ranges carried in FLARM reports).
pub fn offset_position(lat: f32, lon: f32, north_m: f32, east_m: f32) -> (f32, f32) {
    let d_lat = north_m as f64 / METERS_PER_DEG;
    let d_lon = east_m as f64 / (METERS_PER_DEG * (lat as f64).to_radians().cos());

    (
        (lat as f64 + d_lat) as f32,
        normalize_lon(lon as f64 + d_lon) as f32,
    )
}

/// Inverse of [`offset_position`]: relative north/east meters from
/// ownship to target.
pub fn relative_meters(own_lat: f32, own_lon: f32, lat: f32, lon: f32) -> (f32, f32) {
    let north = (lat as f64 - own_lat as f64) * METERS_PER_DEG;
    let east = (lon as f64 - own_lon as f64) * METERS_PER_DEG *
        (own_lat as f64).to_radians().cos();

    (north as f32, east as f32)
}

pub fn nm_to_meters(nm: f32) -> f32 {
    (nm as f64 * METERS_PER_NM) as f32
}

/// Decode a hex string into bytes. Returns `None` on odd length or a
/// non-hex character.
pub fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }

    let b = s.as_bytes();
    let mut out = Vec::with_capacity(s.len() / 2);

    for pair in b.chunks(2) {
        let hi = match (pair[0] as char).to_digit(16) {
            Some(d) => d,
            None => return None,
        };
        let lo = match (pair[1] as char).to_digit(16) {
            Some(d) => d,
            None => return None,
        };
        out.push(((hi << 4) | lo) as u8);
    }

    Some(out)
}
