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

//! FIS-B product store. One entry per product id, refreshed in place
//! by newer uplinks, swept after a fixed shelf life.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

const PRODUCT_SHELF_LIFE: Duration = Duration::from_secs(15 * 60);

/// One ground uplink worth of FIS-B data, as handed over by the UAT
/// adapter.
#[derive(Debug, PartialEq, Clone)]
pub struct FISBData {
    pub product_id: u32,
    /// Report time of day carried in the APDU header, seconds since
    /// UTC midnight.
    pub time_of_day_s: Option<u32>,
    /// Position of the originating ground station.
    pub station: Option<(f32, f32)>,
    /// The full uplink application payload, rebroadcast as-is.
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
struct Product {
    data: FISBData,
    received: Instant,
}

pub struct Fisb {
    products: RwLock<HashMap<u32, Product>>,
    duplicates: RwLock<u64>,
}

impl Fisb {
    pub fn new() -> Self {
        Fisb {
            products: RwLock::new(HashMap::new()),
            duplicates: RwLock::new(0),
        }
    }

    /// Insert or refresh the entry for this product id. A payload
    /// identical to the stored one only refreshes the receive time.
    pub fn put(&self, data: FISBData, now: Instant) {
        if data.payload.is_empty() {
            debug!("dropping empty FIS-B payload for product {}", data.product_id);
            return;
        }

        let mut map = self.products.write().unwrap();

        if let Some(existing) = map.get_mut(&data.product_id) {
            if existing.data.payload == data.payload {
                existing.received = now;
                *self.duplicates.write().unwrap() += 1;
                return;
            }
        }

        trace!("FIS-B product {} updated ({} bytes)", data.product_id, data.payload.len());
        map.insert(data.product_id, Product { data, received: now });
    }

    /// Products still young enough to rebroadcast, oldest first so the
    /// output order is stable.
    pub fn fresh_list(&self, now: Instant) -> Vec<(u32, Vec<u8>, Instant)> {
        let map = self.products.read().unwrap();
        let mut out: Vec<_> = map.values()
            .filter(|p| now.duration_since(p.received) < PRODUCT_SHELF_LIFE)
            .map(|p| (p.data.product_id, p.data.payload.clone(), p.received))
            .collect();

        out.sort_by_key(|&(id, _, _)| id);
        out
    }

    /// Evict expired and empty entries. Run from the scheduler tick.
    pub fn sweep(&self, now: Instant) {
        let mut map = self.products.write().unwrap();
        let before = map.len();

        map.retain(|_, p| {
            !p.data.payload.is_empty() && now.duration_since(p.received) < PRODUCT_SHELF_LIFE
        });

        if map.len() != before {
            debug!("swept {} expired FIS-B products", before - map.len());
        }
    }

    pub fn len(&self) -> usize {
        self.products.read().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(id: u32, payload: &[u8]) -> FISBData {
        FISBData {
            product_id: id,
            time_of_day_s: Some(43_200),
            station: Some((40.0, -98.0)),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_put_and_overwrite() {
        let fisb = Fisb::new();
        let t0 = Instant::now();

        fisb.put(product(413, b"METAR KSEA"), t0);
        fisb.put(product(63, b"NEXRAD"), t0);
        assert_eq!(fisb.len(), 2);

        fisb.put(product(413, b"METAR KBFI"), t0 + Duration::from_secs(10));
        assert_eq!(fisb.len(), 2);

        let fresh = fisb.fresh_list(t0 + Duration::from_secs(11));
        let metar = fresh.iter().find(|&&(id, _, _)| id == 413).unwrap();
        assert_eq!(metar.1, b"METAR KBFI");
    }

    #[test]
    fn test_duplicate_refreshes_timestamp() {
        let fisb = Fisb::new();
        let t0 = Instant::now();

        fisb.put(product(413, b"METAR KSEA"), t0);
        fisb.put(product(413, b"METAR KSEA"), t0 + Duration::from_secs(14 * 60));

        // still fresh 16 minutes after first arrival
        fisb.sweep(t0 + Duration::from_secs(16 * 60));
        assert_eq!(fisb.len(), 1);
    }

    #[test]
    fn test_expiry() {
        let fisb = Fisb::new();
        let t0 = Instant::now();

        fisb.put(product(8, b"NOTAM"), t0);
        assert_eq!(fisb.fresh_list(t0 + Duration::from_secs(14 * 60)).len(), 1);
        assert_eq!(fisb.fresh_list(t0 + Duration::from_secs(16 * 60)).len(), 0);

        fisb.sweep(t0 + Duration::from_secs(16 * 60));
        assert_eq!(fisb.len(), 0);
    }

    #[test]
    fn test_empty_payload_dropped() {
        let fisb = Fisb::new();
        fisb.put(product(413, b""), Instant::now());
        assert_eq!(fisb.len(), 0);
    }
}
