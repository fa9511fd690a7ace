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

//! Decoder adapters and their input tasks. Each adapter is a pure
//! transform from one line of decoder output to store updates; the
//! task around it owns the connection, reconnects with backoff, and
//! never holds a store lock while blocked on input.

pub mod es;
pub mod uat;
pub mod ogn;
pub mod aprs;
pub mod nmea;

use processor::traffic::{AddressType, AltitudeType, HeadingType, TargetType, TrafficSource};
use processor::Stores;
use serial;
use serial::SerialPort;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{sleep, spawn, JoinHandle};
use std::time::{Duration, Instant};

/// Raw traffic delta produced by an adapter. Only fields the frame
/// actually carried are set.
#[derive(Debug, PartialEq, Clone)]
pub struct TrafficData {
    pub addr: (u32, AddressType),
    pub target_type: Option<TargetType>,
    pub source: TrafficSource,
    pub lat_lon: Option<(f32, f32)>,
    pub altitude: Option<(i32, AltitudeType)>,
    pub gnss_delta: Option<i32>,
    pub track: Option<(u16, HeadingType)>,
    pub speed: Option<u16>,
    pub vs: Option<i16>,
    pub squawk: Option<u16>,
    pub callsign: Option<String>,
    pub category: Option<u8>,
    pub nic: Option<u8>,
    pub nacp: Option<u8>,
    pub on_ground: Option<bool>,
    pub signal_db: Option<f32>,
}

impl TrafficData {
    pub fn new(addr: (u32, AddressType), source: TrafficSource) -> Self {
        TrafficData {
            addr,
            target_type: None,
            source,
            lat_lon: None,
            altitude: None,
            gnss_delta: None,
            track: None,
            speed: None,
            vs: None,
            squawk: None,
            callsign: None,
            category: None,
            nic: None,
            nacp: None,
            on_ground: None,
            signal_db: None,
        }
    }
}

// non-ICAO sources get their addresses tagged above bit 23 so they can
// never collide with real Mode-S codes
pub const ADDR_TAG_FLARM: u32 = 1 << 24;
pub const ADDR_TAG_OGN_TRACKER: u32 = 2 << 24;
pub const ADDR_TAG_OTHER: u32 = 3 << 24;
pub const ADDR_TAG_AIS: u32 = 4 << 24;

pub fn tagged_addr(addr24: u32, tag: u32) -> u32 {
    tag | (addr24 & 0x00FF_FFFF)
}

/// A line-oriented decoder adapter.
pub trait LineSink: Send {
    fn name(&self) -> &'static str;

    /// Bytes to write to the peer right after connecting (APRS-IS
    /// login, for instance).
    fn greeting(&self) -> Option<String> {
        None
    }

    /// Consume one line. Returns `false` when the line was noise; the
    /// task counts those but never escalates.
    fn line(&mut self, line: &str, stores: &Stores) -> bool;
}

struct SourceStats {
    good: u64,
    bad: u64,
    last_report: Instant,
}

impl SourceStats {
    fn new() -> Self {
        SourceStats {
            good: 0,
            bad: 0,
            last_report: Instant::now(),
        }
    }

    fn note(&mut self, name: &str, ok: bool) {
        if ok {
            self.good += 1;
        } else {
            self.bad += 1;
        }

        if self.last_report.elapsed().as_secs() >= 60 {
            info!("{}: {} frames, {} rejected", name, self.good, self.bad);
            self.last_report = Instant::now();
        }
    }
}

const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 30;

/// Connect to a line-oriented decoder over TCP and pump it into the
/// stores until shutdown. Reconnects with exponential backoff.
pub fn spawn_tcp_source(
    addr: String,
    mut sink: Box<LineSink>,
    stores: Stores,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    spawn(move || {
        let name = sink.name();
        let mut backoff = INITIAL_BACKOFF_SECS;
        let mut stats = SourceStats::new();

        while !shutdown.load(Ordering::Relaxed) {
            match TcpStream::connect(addr.as_str()) {
                Ok(stream) => {
                    info!("{}: connected to {}", name, addr);
                    backoff = INITIAL_BACKOFF_SECS;

                    if stream.set_read_timeout(Some(Duration::from_secs(1))).is_err() {
                        error!("{}: cannot set read timeout", name);
                    }

                    if let Some(greeting) = sink.greeting() {
                        if let Ok(mut w) = stream.try_clone() {
                            let _ = w.write_all(greeting.as_bytes());
                        }
                    }

                    pump_lines(&mut BufReader::new(stream), name, &mut *sink, &stores,
                               &shutdown, &mut stats);

                    info!("{}: connection to {} closed", name, addr);
                }
                Err(e) => {
                    warn!("{}: unable to connect to {}: {}", name, addr, e);
                }
            }

            wait_backoff(backoff, &shutdown);
            backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
        }

        info!("{}: input task exiting", name);
    })
}

/// Same as [`spawn_tcp_source`], but reading a serial device.
pub fn spawn_serial_source(
    path: String,
    baud: usize,
    mut sink: Box<LineSink>,
    stores: Stores,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    spawn(move || {
        let name = sink.name();
        let mut backoff = INITIAL_BACKOFF_SECS;
        let mut stats = SourceStats::new();

        while !shutdown.load(Ordering::Relaxed) {
            match open_serial(&path, baud) {
                Ok(port) => {
                    info!("{}: opened {} at {} baud", name, path, baud);
                    backoff = INITIAL_BACKOFF_SECS;

                    pump_lines(&mut BufReader::new(port), name, &mut *sink, &stores,
                               &shutdown, &mut stats);

                    info!("{}: serial device {} closed", name, path);
                }
                Err(e) => {
                    warn!("{}: unable to open {}: {}", name, path, e);
                }
            }

            wait_backoff(backoff, &shutdown);
            backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
        }

        info!("{}: input task exiting", name);
    })
}

fn open_serial(path: &str, baud: usize) -> serial::Result<serial::SystemPort> {
    let mut port = serial::open(path)?;

    port.reconfigure(&|settings| {
        settings.set_baud_rate(baud_rate(baud))?;
        settings.set_char_size(serial::Bits8);
        settings.set_parity(serial::ParityNone);
        settings.set_stop_bits(serial::Stop1);
        settings.set_flow_control(serial::FlowNone);
        Ok(())
    })?;
    port.set_timeout(Duration::from_secs(1))?;

    Ok(port)
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

fn pump_lines<R: BufRead>(
    reader: &mut R,
    name: &str,
    sink: &mut LineSink,
    stores: &Stores,
    shutdown: &Arc<AtomicBool>,
    stats: &mut SourceStats,
) {
    let mut line = String::new();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }

        match reader.read_line(&mut line) {
            Ok(0) => return, // EOF
            Ok(_) => {
                {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        let ok = sink.line(trimmed, stores);
                        stats.note(name, ok);
                    }
                }
                line.clear();
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                // keep any partial line and poll the shutdown flag
                continue;
            }
            Err(ref e) if e.kind() == ErrorKind::InvalidData => {
                // not UTF-8; drop the garbage and move on
                stats.note(name, false);
                line.clear();
            }
            Err(e) => {
                warn!("{}: read error: {}", name, e);
                return;
            }
        }
    }
}

fn wait_backoff(secs: u64, shutdown: &Arc<AtomicBool>) {
    for _ in 0..secs {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        sleep(Duration::from_secs(1));
    }
}
