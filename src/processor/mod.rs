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

pub mod clock;
pub mod situation;
pub mod traffic;
pub mod fisb;

use self::fisb::FISBData;
use self::situation::GnssFix;
use self::traffic::TrafficSource;
use sensor::TrafficData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Everything a decoder adapter can produce.
#[derive(Debug)]
pub enum Update {
    Traffic(TrafficData),
    Gnss(GnssFix),
    Baro {
        pressure_alt_ft: f32,
        temperature_c: Option<f32>,
    },
    Ahrs {
        pitch_deg: f32,
        roll_deg: f32,
        heading_deg: f32,
        slip_skid_deg: f32,
        g_load: Option<f32>,
    },
    Fisb(FISBData),
}

/// Receive-rate counters, read and reset once per heartbeat.
#[derive(Default)]
pub struct Counters {
    pub uplink: AtomicU64,
    pub basic_long: AtomicU64,
}

impl Counters {
    /// Counts since the last call, clamped to the heartbeat fields.
    pub fn take(&self) -> (u8, u16) {
        let uplink = self.uplink.swap(0, Ordering::Relaxed).min(0x1F) as u8;
        let basic_long = self.basic_long.swap(0, Ordering::Relaxed).min(0x3FF) as u16;

        (uplink, basic_long)
    }
}

/// The owned stores, shared with every input task and the scheduler.
#[derive(Clone)]
pub struct Stores {
    pub clock: Arc<clock::Monotonic>,
    pub situation: Arc<situation::Situation>,
    pub traffic: Arc<traffic::Traffic>,
    pub fisb: Arc<fisb::Fisb>,
    pub counters: Arc<Counters>,
    /// Step the OS clock from GNSS time. Wanted on the appliance,
    /// never in tests.
    pub discipline_clock: bool,
}

impl Stores {
    pub fn apply(&self, update: Update) {
        let now = self.clock.now();

        match update {
            Update::Traffic(t) => {
                if t.source == TrafficSource::ES || t.source == TrafficSource::UAT {
                    self.counters.basic_long.fetch_add(1, Ordering::Relaxed);
                }
                self.traffic.upsert(&t, now);
            }
            Update::Gnss(fix) => {
                if self.situation.update_gps(&fix, now) {
                    if let Some(time) = fix.time {
                        self.clock.anchor_to_wallclock(time);
                        if self.discipline_clock {
                            clock::sync_system_clock(time);
                        }
                    }
                }
            }
            Update::Baro {
                pressure_alt_ft,
                temperature_c,
            } => {
                self.situation.update_baro(pressure_alt_ft, temperature_c, now);
            }
            Update::Ahrs {
                pitch_deg,
                roll_deg,
                heading_deg,
                slip_skid_deg,
                g_load,
            } => {
                self.situation
                    .update_ahrs(pitch_deg, roll_deg, heading_deg, slip_skid_deg, g_load, now);
            }
            Update::Fisb(f) => {
                self.counters.uplink.fetch_add(1, Ordering::Relaxed);
                self.fisb.put(f, now);
            }
        }
    }
}
