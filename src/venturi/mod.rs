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

//! Coordination root: owns the stores, the fan-out engine and every
//! long-lived thread, and holds the single shutdown flag they all
//! honor. `run` blocks on the output scheduler until a signal arrives,
//! then unwinds the whole tree.

use libc::{self, c_int, SIGINT, SIGTERM};
use processor::clock::Monotonic;
use processor::fisb::Fisb;
use processor::situation::Situation;
use processor::traffic::{Traffic, TrafficConfig};
use processor::{Counters, Stores};
use protocol::websocket::WebSocket;
use scheduler::{Scheduler, SchedulerConfig};
use sensor;
use sensor::aprs::AprsSink;
use sensor::es::EsSink;
use sensor::nmea::NmeaSink;
use sensor::ogn::OgnSink;
use sensor::uat::UatSink;
use std::env;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{sleep, spawn, JoinHandle};
use std::time::Duration;
use transport::{self, ClientInfo, Engine, Subscription};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_: c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

#[derive(Debug, Clone)]
pub enum NmeaInput {
    Serial { path: String, baud: usize },
    Tcp { addr: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ownship_icao: Option<u32>,
    pub ownship_ogn: Option<u32>,
    pub callsign: String,
    pub altitude_verification: bool,
    pub es_addr: Option<String>,
    pub uat_addr: Option<String>,
    pub ogn_addr: Option<String>,
    pub aprs_addr: Option<String>,
    pub aprs_login: Option<String>,
    pub nmea_input: Option<NmeaInput>,
    pub tcp_listen: Option<String>,
    pub udp_port: u16,
    pub udp_broadcast: bool,
    pub lease_discovery: bool,
    pub serial_outputs: Vec<(String, usize)>,
    pub ws_listen: Option<String>,
    pub set_system_clock: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            ownship_icao: None,
            ownship_ogn: None,
            callsign: "VENTURI".to_string(),
            altitude_verification: true,
            es_addr: Some("127.0.0.1:30006".to_string()),
            uat_addr: Some("127.0.0.1:30978".to_string()),
            ogn_addr: Some("127.0.0.1:30011".to_string()),
            aprs_addr: Some("aprs.glidernet.org:14580".to_string()),
            aprs_login: Some("user NOCALL pass -1 vers venturi 0.1".to_string()),
            nmea_input: Some(NmeaInput::Serial {
                path: "/dev/ttyAMA0".to_string(),
                baud: 38400,
            }),
            tcp_listen: Some("0.0.0.0:2000".to_string()),
            udp_port: 4000,
            udp_broadcast: true,
            lease_discovery: true,
            serial_outputs: vec![],
            ws_listen: Some("0.0.0.0:9001".to_string()),
            set_system_clock: true,
        }
    }
}

/// Configuration comes in through the `VENTURI_*` environment; an
/// empty value disables the corresponding input or output.
pub fn config_from_env() -> Config {
    let mut c = Config::default();

    if let Ok(v) = env::var("VENTURI_OWNSHIP_ICAO") {
        c.ownship_icao = u32::from_str_radix(v.trim_left_matches("0x"), 16).ok();
    }
    if let Ok(v) = env::var("VENTURI_OWNSHIP_OGN") {
        c.ownship_ogn = u32::from_str_radix(v.trim_left_matches("0x"), 16).ok();
    }
    if let Ok(v) = env::var("VENTURI_CALLSIGN") {
        if !v.is_empty() {
            c.callsign = v;
        }
    }
    if let Ok(v) = env::var("VENTURI_ALT_VERIFY") {
        c.altitude_verification = flag(&v);
    }

    if let Ok(v) = env::var("VENTURI_ES") {
        c.es_addr = non_empty(v);
    }
    if let Ok(v) = env::var("VENTURI_UAT") {
        c.uat_addr = non_empty(v);
    }
    if let Ok(v) = env::var("VENTURI_OGN") {
        c.ogn_addr = non_empty(v);
    }
    if let Ok(v) = env::var("VENTURI_APRS") {
        c.aprs_addr = non_empty(v);
    }
    if let Ok(v) = env::var("VENTURI_APRS_LOGIN") {
        c.aprs_login = non_empty(v);
    }

    if let Ok(v) = env::var("VENTURI_NMEA") {
        c.nmea_input = parse_nmea_input(&v);
    }

    if let Ok(v) = env::var("VENTURI_TCP_LISTEN") {
        c.tcp_listen = non_empty(v);
    }
    if let Ok(v) = env::var("VENTURI_UDP_PORT") {
        if let Ok(port) = v.parse() {
            c.udp_port = port;
        }
    }
    if let Ok(v) = env::var("VENTURI_BROADCAST") {
        c.udp_broadcast = flag(&v);
    }
    if let Ok(v) = env::var("VENTURI_LEASE_DISCOVERY") {
        c.lease_discovery = flag(&v);
    }
    if let Ok(v) = env::var("VENTURI_SERIAL_OUT") {
        c.serial_outputs = v.split(',')
            .filter_map(|spec| parse_serial_spec(spec.trim()))
            .collect();
    }
    if let Ok(v) = env::var("VENTURI_WS") {
        c.ws_listen = non_empty(v);
    }
    if let Ok(v) = env::var("VENTURI_SET_CLOCK") {
        c.set_system_clock = flag(&v);
    }

    c
}

fn non_empty(v: String) -> Option<String> {
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

fn flag(v: &str) -> bool {
    !(v == "0" || v.eq_ignore_ascii_case("false") || v.eq_ignore_ascii_case("off") || v.is_empty())
}

fn parse_nmea_input(v: &str) -> Option<NmeaInput> {
    if v.is_empty() {
        return None;
    }

    if v.starts_with("tcp:") {
        return Some(NmeaInput::Tcp { addr: v[4..].to_string() });
    }

    match parse_serial_spec(v) {
        Some((path, baud)) => Some(NmeaInput::Serial { path, baud }),
        None => None,
    }
}

// "/dev/ttyUSB0:38400", baud optional
fn parse_serial_spec(spec: &str) -> Option<(String, usize)> {
    if spec.is_empty() {
        return None;
    }

    match spec.rfind(':') {
        Some(i) => {
            match spec[i + 1..].parse() {
                Ok(baud) => Some((spec[..i].to_string(), baud)),
                Err(_) => {
                    warn!("bad serial spec {:?}", spec);
                    None
                }
            }
        }
        None => Some((spec.to_string(), 38_400)),
    }
}

pub struct Venturi {
    stores: Stores,
    engine: Arc<Engine>,
    shutdown: Arc<AtomicBool>,
    config: Config,
    threads: Vec<JoinHandle<()>>,
}

impl Venturi {
    pub fn new(config: Config) -> Venturi {
        let shutdown = Arc::new(AtomicBool::new(false));

        let stores = Stores {
            clock: Arc::new(Monotonic::new()),
            situation: Arc::new(Situation::new()),
            traffic: Arc::new(Traffic::new(TrafficConfig {
                ownship_icao: config.ownship_icao,
                ownship_ogn: config.ownship_ogn,
                altitude_verification: config.altitude_verification,
                altitude_window_ft: 400,
            })),
            fisb: Arc::new(Fisb::new()),
            counters: Arc::new(Counters::default()),
            discipline_clock: config.set_system_clock,
        };

        let engine = Engine::new(shutdown.clone());

        Venturi {
            stores,
            engine,
            shutdown,
            config,
            threads: vec![],
        }
    }

    fn start_sources(&mut self) {
        if let Some(addr) = self.config.es_addr.clone() {
            self.threads.push(sensor::spawn_tcp_source(
                addr,
                Box::new(EsSink),
                self.stores.clone(),
                self.shutdown.clone(),
            ));
        }

        if let Some(addr) = self.config.uat_addr.clone() {
            self.threads.push(sensor::spawn_tcp_source(
                addr,
                Box::new(UatSink),
                self.stores.clone(),
                self.shutdown.clone(),
            ));
        }

        if let Some(addr) = self.config.ogn_addr.clone() {
            self.threads.push(sensor::spawn_tcp_source(
                addr,
                Box::new(OgnSink),
                self.stores.clone(),
                self.shutdown.clone(),
            ));
        }

        if let Some(addr) = self.config.aprs_addr.clone() {
            self.threads.push(sensor::spawn_tcp_source(
                addr,
                Box::new(AprsSink::new(self.config.aprs_login.clone())),
                self.stores.clone(),
                self.shutdown.clone(),
            ));
        }

        match self.config.nmea_input.clone() {
            Some(NmeaInput::Serial { path, baud }) => {
                self.threads.push(sensor::spawn_serial_source(
                    path,
                    baud,
                    Box::new(NmeaSink::new()),
                    self.stores.clone(),
                    self.shutdown.clone(),
                ));
            }
            Some(NmeaInput::Tcp { addr }) => {
                self.threads.push(sensor::spawn_tcp_source(
                    addr,
                    Box::new(NmeaSink::new()),
                    self.stores.clone(),
                    self.shutdown.clone(),
                ));
            }
            None => {}
        }
    }

    fn start_transports(&mut self) {
        if self.config.lease_discovery {
            self.threads.push(transport::udp::spawn_lease_discovery(
                self.engine.clone(),
                self.config.udp_port,
                self.shutdown.clone(),
            ));
        }

        if self.config.udp_broadcast {
            match transport::udp::UdpLink::broadcast(self.config.udp_port) {
                Ok(link) => {
                    Engine::register(
                        &self.engine,
                        ClientInfo {
                            name: format!("udp broadcast :{}", self.config.udp_port),
                            subscription: Subscription::gdl90(),
                            probe_addr: None,
                        },
                        Box::new(link),
                    );
                }
                Err(e) => error!("cannot open broadcast socket: {}", e),
            }
        }

        if let Some(addr) = self.config.tcp_listen.clone() {
            match transport::tcp::spawn_listener(self.engine.clone(), &addr,
                                                 self.shutdown.clone()) {
                Ok(handle) => self.threads.push(handle),
                Err(e) => {
                    // not being able to serve clients at all is fatal
                    error!("cannot listen on {}: {}", addr, e);
                    process::exit(1);
                }
            }
        }

        for &(ref path, baud) in &self.config.serial_outputs {
            if let Err(e) = transport::serial::register_device(&self.engine, path, baud) {
                error!("cannot open serial output {}: {}", path, e);
            }
        }

        self.threads.push(transport::spawn_prober(
            self.engine.clone(),
            self.shutdown.clone(),
        ));
    }

    /// Run until SIGINT/SIGTERM. Owns the calling thread.
    pub fn run(mut self) {
        let handler = handle_signal as extern "C" fn(c_int);
        unsafe {
            libc::signal(SIGINT, handler as libc::sighandler_t);
            libc::signal(SIGTERM, handler as libc::sighandler_t);
        }

        self.start_sources();
        self.start_transports();

        // bridge the signal handler's static into the shared flag
        {
            let flag = self.shutdown.clone();
            self.threads.push(spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    if SHUTDOWN.load(Ordering::Relaxed) {
                        flag.store(true, Ordering::Relaxed);
                        break;
                    }
                    sleep(Duration::from_millis(200));
                }
            }));
        }

        let status = match self.config.ws_listen.clone() {
            Some(addr) => WebSocket::new(addr),
            None => None,
        };

        let mut scheduler = Scheduler::new(
            self.stores.clone(),
            self.engine.clone(),
            self.shutdown.clone(),
            status,
            SchedulerConfig {
                ownship_addr: self.config.ownship_icao,
                callsign: self.config.callsign.clone(),
                device_name: "Venturi".to_string(),
            },
        );
        scheduler.run();

        info!("shutting down");
        self.engine.shutdown_all();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
        info!("goodbye");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serial_spec() {
        assert_eq!(parse_serial_spec("/dev/ttyUSB0:9600"),
                   Some(("/dev/ttyUSB0".to_string(), 9600)));
        assert_eq!(parse_serial_spec("/dev/ttyUSB0"),
                   Some(("/dev/ttyUSB0".to_string(), 38_400)));
        assert_eq!(parse_serial_spec(""), None);
        assert_eq!(parse_serial_spec("/dev/ttyUSB0:fast"), None);
    }

    #[test]
    fn test_parse_nmea_input() {
        match parse_nmea_input("tcp:localhost:10110") {
            Some(NmeaInput::Tcp { ref addr }) if addr == "localhost:10110" => {}
            other => panic!("unexpected: {:?}", other),
        }

        match parse_nmea_input("/dev/ttyAMA0:38400") {
            Some(NmeaInput::Serial { ref path, baud: 38_400 }) if path == "/dev/ttyAMA0" => {}
            other => panic!("unexpected: {:?}", other),
        }

        assert!(parse_nmea_input("").is_none());
    }

    #[test]
    fn test_flag() {
        assert!(flag("1"));
        assert!(flag("yes"));
        assert!(!flag("0"));
        assert!(!flag("false"));
        assert!(!flag("OFF"));
        assert!(!flag(""));
    }
}
