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

//! UDP delivery. EFB tablets on the receiver's Wi-Fi are discovered
//! from the DHCP lease file and each gets a unicast client; an
//! optional broadcast client covers everything else on the segment.

use super::*;
use inotify::{watch_mask, Inotify};
use nom::{be_u32, be_u64, be_u8, IResult};
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::net::UdpSocket;
use time::{now_utc, Timespec};

const LEASE_FILE_PATH: &str = "/tmp/udhcpd.leases";
const WATCH_PATH: &str = "/tmp";

pub struct UdpLink {
    sock: UdpSocket,
}

impl UdpLink {
    pub fn connect(ip: Ipv4Addr, port: u16) -> io::Result<UdpLink> {
        let sock = UdpSocket::bind("0.0.0.0:0")?;
        sock.set_write_timeout(Some(Duration::from_millis(200)))?;
        sock.connect((ip, port))?;

        Ok(UdpLink { sock })
    }

    pub fn broadcast(port: u16) -> io::Result<UdpLink> {
        let sock = UdpSocket::bind("0.0.0.0:0")?;
        sock.set_broadcast(true)?;
        sock.set_write_timeout(Some(Duration::from_millis(200)))?;
        sock.connect((Ipv4Addr::new(255, 255, 255, 255), port))?;

        Ok(UdpLink { sock })
    }
}

impl Link for UdpLink {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.sock.send(bytes) {
            Ok(_) => Ok(()),
            // refused just means the app is closed right now; the
            // probe task decides whether the host is really gone
            Err(ref e) if e.kind() == ErrorKind::ConnectionRefused ||
                              e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

named_args!(parse_lease_file(tm: Timespec, cap: usize)<HashSet<Ipv4Addr>>,
       do_parse!(
           written: be_u64 >>
           ips: fold_many0!(
               do_parse!(
                   expires: be_u32 >>
                   a: be_u8 >>
                   b: be_u8 >>
                   c: be_u8 >>
                   d: be_u8 >>
                   take!(6 + 20 + 2) >> // skip mac, hostname and pad
                   (a, b, c, d, expires)
               ), HashSet::with_capacity(cap), |mut acc: HashSet<Ipv4Addr>, info: (u8, u8, u8, u8, u32)| {
                      if tm.sec < (info.4 as u64 + written) as i64 {
                        acc.insert(Ipv4Addr::new(info.0, info.1, info.2, info.3));
                      }
                      acc
                  }
           ) >>
        (ips)));

fn live_leases() -> io::Result<HashSet<Ipv4Addr>> {
    let mut buf = Vec::new();
    let mut file = File::open(LEASE_FILE_PATH)?;
    file.read_to_end(&mut buf)?;

    if buf.len() < 8 {
        return Ok(HashSet::new());
    }

    match parse_lease_file(&buf[..], now_utc().to_timespec(), (buf.len() - 8) / 36) {
        IResult::Done(_, alive) => Ok(alive),
        _ => Ok(HashSet::new()),
    }
}

/// Keep the engine's UDP client list in sync with the DHCP leases.
pub fn spawn_lease_discovery(
    engine: Arc<Engine>,
    port: u16,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    spawn(move || {
        let mut inotify = match Inotify::init() {
            Ok(i) => i,
            Err(e) => {
                warn!("inotify unavailable, no lease discovery: {}", e);
                return;
            }
        };

        if let Err(e) = inotify.add_watch(WATCH_PATH, watch_mask::MODIFY | watch_mask::CREATE) {
            warn!("cannot watch {}: {}", WATCH_PATH, e);
            return;
        }

        let mut clients: HashMap<Ipv4Addr, u64> = HashMap::new();
        sync_clients(&engine, port, &mut clients);

        let mut buffer = [0_u8; 1024];

        while !shutdown.load(Ordering::Relaxed) {
            sleep(Duration::from_secs(1));

            let events = match inotify.read_events(&mut buffer) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!("inotify read failed: {}", e);
                    continue;
                }
            };

            for e in events {
                if e.name.to_str().map_or(false, |n| n.contains("udhcpd.leases")) {
                    sync_clients(&engine, port, &mut clients);
                    break;
                }
            }
        }
    })
}

fn sync_clients(engine: &Arc<Engine>, port: u16, clients: &mut HashMap<Ipv4Addr, u64>) {
    let alive = match live_leases() {
        Ok(a) => a,
        Err(e) => {
            debug!("unable to read lease file: {}", e);
            return;
        }
    };

    debug!("lease file lists {} live client(s)", alive.len());

    let gone: Vec<Ipv4Addr> = clients
        .keys()
        .filter(|ip| !alive.contains(ip))
        .cloned()
        .collect();
    for ip in gone {
        if let Some(id) = clients.remove(&ip) {
            engine.unregister(id);
        }
    }

    for ip in alive {
        if clients.contains_key(&ip) {
            continue;
        }

        match UdpLink::connect(ip, port) {
            Ok(link) => {
                let id = Engine::register(
                    engine,
                    ClientInfo {
                        name: format!("udp {}", ip),
                        subscription: Subscription::gdl90(),
                        probe_addr: Some(ip),
                    },
                    Box::new(link),
                );
                clients.insert(ip, id);
            }
            Err(e) => error!("could not connect to client {}: {}", ip, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease_record(expires: u32, ip: [u8; 4]) -> Vec<u8> {
        let mut rec = Vec::with_capacity(36);
        rec.extend_from_slice(&[
            (expires >> 24) as u8,
            (expires >> 16) as u8,
            (expires >> 8) as u8,
            expires as u8,
        ]);
        rec.extend_from_slice(&ip);
        rec.extend_from_slice(&[0; 6 + 20 + 2]);
        rec
    }

    #[test]
    fn test_parse_lease_file() {
        // written at t=1000, big-endian
        let mut data = vec![0, 0, 0, 0, 0, 0, 0x03, 0xE8];
        data.extend(lease_record(500, [192, 168, 10, 22]));
        data.extend(lease_record(100, [192, 168, 10, 23]));

        // at t=1200 both leases hold
        match parse_lease_file(&data[..], Timespec::new(1_200, 0), 2) {
            IResult::Done(_, alive) => {
                assert!(alive.contains(&Ipv4Addr::new(192, 168, 10, 22)));
                assert!(!alive.contains(&Ipv4Addr::new(192, 168, 10, 23)),
                        "lease expired at t=1100");
            }
            other => panic!("parse failed: {:?}", other),
        }

        // at t=1600 everything is expired
        match parse_lease_file(&data[..], Timespec::new(1_600, 0), 2) {
            IResult::Done(_, alive) => assert!(alive.is_empty()),
            other => panic!("parse failed: {:?}", other),
        }
    }
}
