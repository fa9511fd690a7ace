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

//! Process-wide monotonic time reference. Freshness decisions
//! everywhere in the core compare `Instant`s obtained here and are
//! therefore immune to wall-clock jumps. The wall clock is only ever
//! consulted for log humanization and the heartbeat UTC field, and is
//! itself disciplined from GNSS time when it drifts.

use chrono;
use chrono::prelude::*;
use libc::{clock_settime, timespec, CLOCK_REALTIME};
use std::sync::Mutex;
use std::time::{Duration, Instant};

// max 2 second tolerance before the system clock is stepped
const MAX_TOLERANCE: i64 = 2;

pub struct Monotonic {
    start: Instant,
    /// UTC corresponding to `start`, learned from the first valid GNSS
    /// time. Set at most once.
    anchor: Mutex<Option<DateTime<Utc>>>,
}

impl Monotonic {
    pub fn new() -> Self {
        Monotonic {
            start: Instant::now(),
            anchor: Mutex::new(None),
        }
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    pub fn since_start(&self) -> Duration {
        self.start.elapsed()
    }

    /// Anchor the humanizer to real time. Only the first call has any
    /// effect.
    pub fn anchor_to_wallclock(&self, utc: DateTime<Utc>) {
        let mut anchor = self.anchor.lock().unwrap();

        if anchor.is_none() {
            let elapsed = self.start.elapsed();
            *anchor = Some(utc - chrono::Duration::from_std(elapsed).unwrap_or_else(
                |_| chrono::Duration::seconds(elapsed.as_secs() as i64),
            ));
            info!("clock anchored to UTC {}", utc);
        }
    }

    pub fn is_anchored(&self) -> bool {
        self.anchor.lock().unwrap().is_some()
    }

    /// Render an instant for logs: UTC when anchored, seconds since
    /// start otherwise.
    pub fn humanize(&self, t: Instant) -> String {
        let offset = t.duration_since(self.start);

        match *self.anchor.lock().unwrap() {
            Some(anchor) => {
                let utc = anchor +
                    chrono::Duration::from_std(offset)
                        .unwrap_or_else(|_| chrono::Duration::seconds(offset.as_secs() as i64));
                utc.format("%H:%M:%S%.3fZ").to_string()
            }
            None => format!("T+{}.{:03}s", offset.as_secs(), offset.subsec_millis()),
        }
    }
}

/// Step the OS wall clock to GNSS time when the two disagree by more
/// than `MAX_TOLERANCE` seconds. The monotonic reference is unaffected.
#[cfg(target_pointer_width = "64")]
pub fn sync_system_clock(gnss: DateTime<Utc>) {
    if (Utc::now().timestamp() - gnss.timestamp()).abs() > MAX_TOLERANCE {
        info!("setting system clock to {}", gnss);

        let ts = timespec {
            tv_sec: gnss.timestamp(),
            tv_nsec: 0,
        };
        unsafe {
            if clock_settime(CLOCK_REALTIME, &ts) != 0 {
                error!("failed to set system clock");
            }
        }
    }
}

#[cfg(target_pointer_width = "32")]
pub fn sync_system_clock(gnss: DateTime<Utc>) {
    if (Utc::now().timestamp() - gnss.timestamp()).abs() > MAX_TOLERANCE {
        info!("setting system clock to {}", gnss);

        let ts = timespec {
            tv_sec: gnss.timestamp() as i32,
            tv_nsec: 0,
        };
        unsafe {
            if clock_settime(CLOCK_REALTIME, &ts) != 0 {
                error!("failed to set system clock");
            }
        }
    }
}
