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

pub mod gdl90;
pub mod nmea;
pub mod websocket;

use std::time::Instant;

/// Which wire dialect a payload belongs to; clients subscribe to a
/// subset.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Family {
    GDL90,
    NMEA,
}

// scheduler priorities, lower is more important
pub const PRIORITY_REALTIME: u8 = 10;
pub const PRIORITY_ALERT: u8 = 20;
pub const PRIORITY_TRAFFIC: u8 = 40;
pub const PRIORITY_WEATHER: u8 = 70;

/// One encoded outbound message.
#[derive(Debug, PartialEq, Clone)]
pub struct Payload {
    pub family: Family,
    /// Lower value = higher priority.
    pub priority: u8,
    /// Queued copies older than this are dropped at dequeue.
    pub valid_until: Option<Instant>,
    pub payload: Vec<u8>,
}
