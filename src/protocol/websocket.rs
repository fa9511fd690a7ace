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

//! JSON status stream for cockpit status displays: one WebSocket
//! broadcast of the situation and traffic counts per output cycle.
//! This is a one-way feed; incoming messages are ignored.

use processor::situation::Snapshot;
use processor::traffic::TrafficStats;
use serde_json;
use std::thread::{spawn, JoinHandle};
use ws;

pub struct WebSocket {
    broadcaster: ws::Sender,
    _handle: JoinHandle<()>,
}

impl WebSocket {
    pub fn new(addr: String) -> Option<WebSocket> {
        let socket = match ws::WebSocket::new(|_| move |_| Ok(())) {
            Ok(s) => s,
            Err(e) => {
                error!("unable to create status WebSocket: {}", e);
                return None;
            }
        };

        let broadcaster = socket.broadcaster();

        let handle = spawn(move || {
            if let Err(e) = socket.listen(addr) {
                error!("status WebSocket listener failed: {}", e);
            }
        });
        debug!("spawned WebSocket thread");

        Some(WebSocket {
            broadcaster,
            _handle: handle,
        })
    }

    pub fn push_status(&self, snapshot: &Snapshot, stats: &TrafficStats, clients: usize) {
        if let Ok(mut js) = serde_json::to_value(snapshot) {
            js["type"] = "Situation".into();
            let _ = self.broadcaster.send(js.to_string());
        }

        if let Ok(mut js) = serde_json::to_value(stats) {
            js["type"] = "Traffic".into();
            js["clients"] = clients.into();
            let _ = self.broadcaster.send(js.to_string());
        }
    }
}
