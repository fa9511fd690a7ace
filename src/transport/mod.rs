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

//! Client fan-out. Every registered client owns a bounded priority
//! queue and a writer thread; the scheduler submits each composed
//! message once and the engine distributes copies. Sleeping tablets
//! are detected with ICMP probes and shed everything but the
//! important traffic until they answer again.

pub mod udp;
pub mod tcp;
pub mod serial;

use icmp::IcmpSocket;
use protocol::{Family, Payload};
use std::collections::{BTreeMap, HashMap};
use std::io::{self, ErrorKind};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{sleep, spawn, JoinHandle};
use std::time::{Duration, Instant};

pub const QUEUE_CAPACITY: usize = 25_000;
/// While a client sleeps, anything less important than this is shed at
/// enqueue. Alerts and ownship stay below the cutoff so a waking EFB
/// is current immediately.
pub const SLEEP_PRIORITY_CUTOFF: u8 = 30;

const PROBE_INTERVAL_SECS: u64 = 10;
const PROBE_MISS_LIMIT: u32 = 2;
const PROBE_IDENT: u16 = 0xD99D;

/// A one-way byte pipe to a client. Implementations must apply their
/// own write timeout; a returned error unregisters the client.
pub trait Link: Send {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;
}

#[derive(Debug, Copy, Clone)]
pub struct Subscription {
    pub gdl90: bool,
    pub nmea: bool,
}

impl Subscription {
    pub fn gdl90() -> Subscription {
        Subscription {
            gdl90: true,
            nmea: false,
        }
    }

    pub fn nmea() -> Subscription {
        Subscription {
            gdl90: false,
            nmea: true,
        }
    }

    fn accepts(&self, family: Family) -> bool {
        match family {
            Family::GDL90 => self.gdl90,
            Family::NMEA => self.nmea,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Human-readable identity for logs ("udp 192.168.10.22" etc).
    pub name: String,
    pub subscription: Subscription,
    /// Datagram clients get reachability probes; stream and serial
    /// clients are governed by their own write errors.
    pub probe_addr: Option<Ipv4Addr>,
}

pub enum Pop {
    Message {
        priority: u8,
        valid_until: Option<Instant>,
        bytes: Arc<Vec<u8>>,
    },
    Timeout,
    Closed,
}

struct QueueEntry {
    valid_until: Option<Instant>,
    bytes: Arc<Vec<u8>>,
}

struct QueueInner {
    entries: BTreeMap<(u8, u64), QueueEntry>,
    next_seq: u64,
    closed: bool,
}

/// Bounded queue ordered by `(priority, insertion order)`. Enqueue is
/// non-blocking: when full, the least important soonest-to-expire
/// entry makes room, or the newcomer is refused.
pub struct MessageQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
    capacity: usize,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        MessageQueue {
            inner: Mutex::new(QueueInner {
                entries: BTreeMap::new(),
                next_seq: 0,
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    pub fn push(&self, priority: u8, valid_until: Option<Instant>, bytes: Arc<Vec<u8>>) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.closed {
            return false;
        }

        if inner.entries.len() >= self.capacity {
            let worst = match inner.entries.keys().next_back() {
                Some(&(p, _)) => p,
                None => return false, // zero capacity
            };

            if worst < priority {
                // everything queued outranks the newcomer
                return false;
            }

            let far = Instant::now() + Duration::from_secs(366 * 86_400);
            let victim = inner.entries
                .iter()
                .rev()
                .take_while(|&(&(p, _), _)| p == worst)
                .min_by_key(|&(_, e)| e.valid_until.unwrap_or(far))
                .map(|(&k, _)| k);

            if let Some(k) = victim {
                inner.entries.remove(&k);
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert((priority, seq), QueueEntry { valid_until, bytes });

        self.available.notify_one();
        true
    }

    pub fn pop(&self, timeout: Duration) -> Pop {
        let mut inner = self.inner.lock().unwrap();

        loop {
            if let Some(key) = inner.entries.keys().next().cloned() {
                let e = inner.entries.remove(&key).unwrap();
                return Pop::Message {
                    priority: key.0,
                    valid_until: e.valid_until,
                    bytes: e.bytes,
                };
            }

            if inner.closed {
                return Pop::Closed;
            }

            let (guard, res) = self.available.wait_timeout(inner, timeout).unwrap();
            inner = guard;

            if res.timed_out() && inner.entries.is_empty() {
                return if inner.closed { Pop::Closed } else { Pop::Timeout };
            }
        }
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        inner.entries.clear();
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

struct Client {
    id: u64,
    info: ClientInfo,
    queue: Arc<MessageQueue>,
    throttled: AtomicBool,
    writer: Mutex<Option<JoinHandle<()>>>,
}

pub struct Engine {
    clients: RwLock<HashMap<u64, Arc<Client>>>,
    next_id: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(shutdown: Arc<AtomicBool>) -> Arc<Engine> {
        Arc::new(Engine {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown,
        })
    }

    /// Register a client and start its writer. Returns the client id
    /// for later unregistration.
    pub fn register(engine: &Arc<Engine>, info: ClientInfo, link: Box<Link>) -> u64 {
        let id = engine.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(MessageQueue::new(QUEUE_CAPACITY));

        info!("client registered: {} (id {})", info.name, id);

        let client = Arc::new(Client {
            id,
            info,
            queue,
            throttled: AtomicBool::new(false),
            writer: Mutex::new(None),
        });

        let handle = {
            let engine = engine.clone();
            let client = client.clone();
            spawn(move || writer_loop(engine, client, link))
        };
        *client.writer.lock().unwrap() = Some(handle);

        engine.clients.write().unwrap().insert(id, client);
        id
    }

    /// Hand one composed message to every interested client.
    pub fn submit(&self, p: &Payload) {
        let bytes = Arc::new(p.payload.clone());
        let clients = self.clients.read().unwrap();

        for client in clients.values() {
            if !client.info.subscription.accepts(p.family) {
                continue;
            }

            if client.throttled.load(Ordering::Relaxed) && p.priority > SLEEP_PRIORITY_CUTOFF {
                // the client is asleep; don't pile up bulk data
                continue;
            }

            client.queue.push(p.priority, p.valid_until, bytes.clone());
        }
    }

    /// Remove a client without joining its writer. Used by the writer
    /// itself after a transport error.
    fn drop_client(&self, id: u64) {
        if let Some(client) = self.clients.write().unwrap().remove(&id) {
            client.queue.close();
            info!("client dropped: {} (id {})", client.info.name, id);
        }
    }

    /// Remove a client, draining and closing its queue and waiting for
    /// the writer to finish. Must not be called from the writer.
    pub fn unregister(&self, id: u64) {
        let client = self.clients.write().unwrap().remove(&id);

        if let Some(client) = client {
            client.queue.close();
            if let Some(handle) = client.writer.lock().unwrap().take() {
                let _ = handle.join();
            }
            info!("client unregistered: {} (id {})", client.info.name, id);
        }
    }

    pub fn shutdown_all(&self) {
        let ids: Vec<u64> = self.clients.read().unwrap().keys().cloned().collect();
        for id in ids {
            self.unregister(id);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    pub fn set_throttled(&self, id: u64, throttled: bool) {
        if let Some(client) = self.clients.read().unwrap().get(&id) {
            let was = client.throttled.swap(throttled, Ordering::Relaxed);
            if was != throttled {
                info!(
                    "client {}: {}",
                    client.info.name,
                    if throttled { "sleeping" } else { "awake" }
                );
            }
        }
    }

    pub fn is_throttled(&self, id: u64) -> bool {
        self.clients
            .read()
            .unwrap()
            .get(&id)
            .map_or(false, |c| c.throttled.load(Ordering::Relaxed))
    }

    /// Clients that want reachability probes.
    pub fn probe_targets(&self) -> Vec<(u64, Ipv4Addr)> {
        self.clients
            .read()
            .unwrap()
            .values()
            .filter_map(|c| c.info.probe_addr.map(|ip| (c.id, ip)))
            .collect()
    }

}

fn writer_loop(engine: Arc<Engine>, client: Arc<Client>, mut link: Box<Link>) {
    loop {
        match client.queue.pop(Duration::from_millis(250)) {
            Pop::Closed => break,
            Pop::Timeout => {
                if engine.shutdown.load(Ordering::Relaxed) {
                    break;
                }
            }
            Pop::Message { valid_until, bytes, .. } => {
                if let Some(deadline) = valid_until {
                    if Instant::now() > deadline {
                        trace!("client {}: expired message dropped", client.info.name);
                        continue;
                    }
                }

                if let Err(e) = link.send(&bytes) {
                    error!("client {}: write failed: {}", client.info.name, e);
                    engine.drop_client(client.id);
                    break;
                }
            }
        }
    }

    debug!("writer for {} exiting", client.info.name);
}

struct ProbeState {
    sock: IcmpSocket,
    missed: u32,
    outstanding: bool,
}

/// Periodically ping datagram clients. Two consecutive unanswered
/// probes put a client to sleep; any answer wakes it.
pub fn spawn_prober(engine: Arc<Engine>, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
    spawn(move || {
        let mut states: HashMap<u64, ProbeState> = HashMap::new();
        let mut seq: u16 = 0;
        let mut probe_counter = 0_u32;

        while !shutdown.load(Ordering::Relaxed) {
            sleep(Duration::from_secs(1));

            run_every!(PROBE_INTERVAL_SECS, probe_counter, {
                let targets = engine.probe_targets();
                states.retain(|id, _| targets.iter().any(|&(tid, _)| tid == *id));

                for &(id, ip) in &targets {
                    if !states.contains_key(&id) {
                        match IcmpSocket::connect(ip.into()) {
                            Ok(sock) => {
                                let _ = sock.set_read_timeout(Some(Duration::new(0, 1_000_000)));
                                let _ = sock.set_write_timeout(Some(Duration::new(0, 1_000_000)));
                                states.insert(id, ProbeState {
                                    sock,
                                    missed: 0,
                                    outstanding: false,
                                });
                            }
                            Err(e) => {
                                warn!("cannot open probe socket for {}: {}", ip, e);
                            }
                        }
                    }
                }

                seq = seq.wrapping_add(1);

                for &(id, ip) in &targets {
                    let state = match states.get_mut(&id) {
                        Some(s) => s,
                        None => continue,
                    };

                    let mut replied = false;
                    let mut buf = [0_u8; 64];
                    while let Ok((n, _)) = state.sock.recv_from(&mut buf) {
                        // 20 bytes of IP header, then type/code
                        if n > 25 && buf[20] == 0 && buf[21] == 0 &&
                            buf[24] == (PROBE_IDENT >> 8) as u8 &&
                            buf[25] == (PROBE_IDENT & 0xFF) as u8
                        {
                            replied = true;
                        }
                    }

                    if state.outstanding {
                        if replied {
                            state.missed = 0;
                            engine.set_throttled(id, false);
                        } else {
                            state.missed += 1;
                            if state.missed >= PROBE_MISS_LIMIT {
                                engine.set_throttled(id, true);
                            }
                        }
                    }

                    let packet = icmp_echo_request(PROBE_IDENT, seq);
                    match state.sock.send(&packet) {
                        Ok(_) => state.outstanding = true,
                        Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
                        Err(e) => debug!("probe send to {} failed: {}", ip, e),
                    }
                }
            });
        }
    })
}

fn icmp_echo_request(ident: u16, seq: u16) -> Vec<u8> {
    let mut packet = vec![
        0x08, // echo request
        0x00,
        0x00, 0x00, // checksum, filled below
        (ident >> 8) as u8,
        (ident & 0xFF) as u8,
        (seq >> 8) as u8,
        (seq & 0xFF) as u8,
    ];
    packet.extend_from_slice(b"VENTURI");

    let ck = icmp_checksum(&packet);
    packet[2] = (ck >> 8) as u8;
    packet[3] = (ck & 0xFF) as u8;

    packet
}

fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum = 0_u32;

    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            (chunk[0] as u32) << 8 | chunk[1] as u32
        } else {
            (chunk[0] as u32) << 8
        };
        sum += word;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{Family, Payload};
    use std::thread;

    struct MockLink {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Link for MockLink {
        fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.sent.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    struct FailingLink;

    impl Link for FailingLink {
        fn send(&mut self, _: &[u8]) -> io::Result<()> {
            Err(io::Error::new(ErrorKind::BrokenPipe, "gone"))
        }
    }

    fn payload(family: Family, priority: u8, tag: u8) -> Payload {
        Payload {
            family,
            priority,
            valid_until: Some(Instant::now() + Duration::from_secs(5)),
            payload: vec![tag],
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition never became true");
    }

    #[test]
    fn test_queue_orders_by_priority_then_arrival() {
        let q = MessageQueue::new(16);
        q.push(40, None, Arc::new(vec![1]));
        q.push(10, None, Arc::new(vec![2]));
        q.push(40, None, Arc::new(vec![3]));
        q.push(20, None, Arc::new(vec![4]));

        let mut order = vec![];
        for _ in 0..4 {
            match q.pop(Duration::from_millis(10)) {
                Pop::Message { bytes, .. } => order.push(bytes[0]),
                _ => panic!("expected a message"),
            }
        }
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn test_queue_prunes_least_important_closest_to_expiry() {
        let q = MessageQueue::new(3);
        let now = Instant::now();

        q.push(40, Some(now + Duration::from_secs(9)), Arc::new(vec![1]));
        q.push(70, Some(now + Duration::from_secs(60)), Arc::new(vec![2]));
        q.push(70, Some(now + Duration::from_secs(10)), Arc::new(vec![3]));

        // queue full; an alert must push out the priority-70 entry
        // that expires first (tag 3)
        assert!(q.push(20, Some(now + Duration::from_secs(2)), Arc::new(vec![4])));
        assert_eq!(q.len(), 3);

        let mut tags = vec![];
        for _ in 0..3 {
            match q.pop(Duration::from_millis(10)) {
                Pop::Message { bytes, .. } => tags.push(bytes[0]),
                _ => panic!("expected a message"),
            }
        }
        assert_eq!(tags, vec![4, 1, 2]);
    }

    #[test]
    fn test_queue_refuses_newcomer_when_outranked() {
        let q = MessageQueue::new(2);
        q.push(10, None, Arc::new(vec![1]));
        q.push(10, None, Arc::new(vec![2]));

        assert!(!q.push(70, None, Arc::new(vec![3])));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_engine_routes_by_family() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let engine = Engine::new(shutdown.clone());

        let gdl_sent = Arc::new(Mutex::new(vec![]));
        let nmea_sent = Arc::new(Mutex::new(vec![]));

        Engine::register(
            &engine,
            ClientInfo {
                name: "gdl".to_string(),
                subscription: Subscription::gdl90(),
                probe_addr: None,
            },
            Box::new(MockLink { sent: gdl_sent.clone() }),
        );
        Engine::register(
            &engine,
            ClientInfo {
                name: "nmea".to_string(),
                subscription: Subscription::nmea(),
                probe_addr: None,
            },
            Box::new(MockLink { sent: nmea_sent.clone() }),
        );

        engine.submit(&payload(Family::GDL90, 10, 1));
        engine.submit(&payload(Family::NMEA, 10, 2));

        wait_for(|| gdl_sent.lock().unwrap().len() == 1);
        wait_for(|| nmea_sent.lock().unwrap().len() == 1);
        assert_eq!(gdl_sent.lock().unwrap()[0], vec![1]);
        assert_eq!(nmea_sent.lock().unwrap()[0], vec![2]);

        shutdown.store(true, Ordering::Relaxed);
        engine.shutdown_all();
    }

    #[test]
    fn test_sleeping_client_sheds_bulk_but_gets_alerts() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let engine = Engine::new(shutdown.clone());

        let sent = Arc::new(Mutex::new(vec![]));
        let id = Engine::register(
            &engine,
            ClientInfo {
                name: "tablet".to_string(),
                subscription: Subscription::gdl90(),
                probe_addr: None,
            },
            Box::new(MockLink { sent: sent.clone() }),
        );

        engine.set_throttled(id, true);

        engine.submit(&payload(Family::GDL90, 70, 9)); // weather: shed
        engine.submit(&payload(Family::GDL90, 20, 1)); // alert: kept

        wait_for(|| sent.lock().unwrap().len() == 1);
        assert_eq!(sent.lock().unwrap()[0], vec![1]);

        // awake again, weather flows
        engine.set_throttled(id, false);
        engine.submit(&payload(Family::GDL90, 70, 9));
        wait_for(|| sent.lock().unwrap().len() == 2);

        shutdown.store(true, Ordering::Relaxed);
        engine.shutdown_all();
    }

    #[test]
    fn test_expired_messages_dropped_at_dequeue() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let engine = Engine::new(shutdown.clone());

        let sent = Arc::new(Mutex::new(vec![]));
        Engine::register(
            &engine,
            ClientInfo {
                name: "slow".to_string(),
                subscription: Subscription::gdl90(),
                probe_addr: None,
            },
            Box::new(MockLink { sent: sent.clone() }),
        );

        let stale = Payload {
            family: Family::GDL90,
            priority: 40,
            valid_until: Some(Instant::now() - Duration::from_secs(1)),
            payload: vec![7],
        };
        engine.submit(&stale);
        engine.submit(&payload(Family::GDL90, 40, 8));

        wait_for(|| sent.lock().unwrap().len() == 1);
        assert_eq!(sent.lock().unwrap()[0], vec![8]);

        shutdown.store(true, Ordering::Relaxed);
        engine.shutdown_all();
    }

    #[test]
    fn test_write_error_unregisters() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let engine = Engine::new(shutdown.clone());

        Engine::register(
            &engine,
            ClientInfo {
                name: "broken".to_string(),
                subscription: Subscription::gdl90(),
                probe_addr: None,
            },
            Box::new(FailingLink),
        );
        assert_eq!(engine.client_count(), 1);

        engine.submit(&payload(Family::GDL90, 10, 1));
        wait_for(|| engine.client_count() == 0);

        shutdown.store(true, Ordering::Relaxed);
    }

    #[test]
    fn test_icmp_checksum() {
        // checksum of the packet with its checksum field zeroed must
        // make the full packet sum to 0xFFFF
        let packet = icmp_echo_request(PROBE_IDENT, 7);
        let mut zeroed = packet.clone();
        zeroed[2] = 0;
        zeroed[3] = 0;
        let ck = icmp_checksum(&zeroed);
        assert_eq!((ck >> 8) as u8, packet[2]);
        assert_eq!((ck & 0xFF) as u8, packet[3]);
    }
}
