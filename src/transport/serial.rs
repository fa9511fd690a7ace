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

//! Serial delivery, for panel devices that take NMEA/FLARM sentences
//! over RS-232.

use super::*;
use serial::{self, SerialPort};
use std::io::Write;

const WRITE_TIMEOUT: Duration = Duration::from_millis(200);

pub struct SerialLink {
    port: serial::SystemPort,
}

impl Link for SerialLink {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)
    }
}

/// Open a configured output device and register it as an NMEA client.
pub fn register_device(
    engine: &Arc<Engine>,
    path: &str,
    baud: usize,
) -> serial::Result<u64> {
    let mut port = serial::open(path)?;

    port.reconfigure(&|settings| {
        settings.set_baud_rate(baud_rate(baud))?;
        settings.set_char_size(serial::Bits8);
        settings.set_parity(serial::ParityNone);
        settings.set_stop_bits(serial::Stop1);
        settings.set_flow_control(serial::FlowNone);
        Ok(())
    })?;
    port.set_timeout(WRITE_TIMEOUT)?;

    Ok(Engine::register(
        engine,
        ClientInfo {
            name: format!("serial {}", path),
            subscription: Subscription::nmea(),
            probe_addr: None,
        },
        Box::new(SerialLink { port }),
    ))
}

fn baud_rate(baud: usize) -> serial::BaudRate {
    match baud {
        4800 => serial::Baud4800,
        9600 => serial::Baud9600,
        19200 => serial::Baud19200,
        38400 => serial::Baud38400,
        57600 => serial::Baud57600,
        115200 => serial::Baud115200,
        other => serial::BaudOther(other),
    }
}
