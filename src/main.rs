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

#[macro_use]
extern crate log;
extern crate env_logger;
extern crate chrono;
extern crate serial;
#[macro_use]
extern crate nom;
extern crate regex;
extern crate time;
extern crate serde_json;
#[macro_use]
extern crate serde_derive;
extern crate ws;
extern crate libc;
extern crate inotify;
extern crate icmp;

#[macro_use]
mod utils;
mod sensor;
mod processor;
mod protocol;
mod transport;
mod scheduler;
mod venturi;

use venturi::Venturi;

fn main() {
    env_logger::init();

    info!("venturi starting");

    let config = venturi::config_from_env();
    debug!("configuration: {:?}", config);

    Venturi::new(config).run();
}
