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

//! TCP delivery: an accept loop registers every connection as a
//! client. A reader that stalls past the write timeout fills its
//! queue, pruning kicks in, and a dead peer is unregistered on the
//! first failed write.

use super::*;
use std::io::Write;
use std::net::{TcpListener, TcpStream};

const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct TcpLink {
    stream: TcpStream,
}

impl Link for TcpLink {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }
}

/// Bind the listening socket up front (failure here is a startup
/// failure for the caller to escalate), then accept in the background.
pub fn spawn_listener(
    engine: Arc<Engine>,
    addr: &str,
    shutdown: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    info!("listening for GDL90 clients on tcp {}", addr);

    Ok(spawn(move || {
        while !shutdown.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = setup_stream(&stream) {
                        warn!("rejecting tcp client {}: {}", peer, e);
                        continue;
                    }

                    Engine::register(
                        &engine,
                        ClientInfo {
                            name: format!("tcp {}", peer),
                            subscription: Subscription::gdl90(),
                            probe_addr: None,
                        },
                        Box::new(TcpLink { stream }),
                    );
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    sleep(Duration::from_millis(200));
                }
                Err(e) => {
                    error!("tcp accept failed: {}", e);
                    sleep(Duration::from_secs(1));
                }
            }
        }
    }))
}

fn setup_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    stream.set_nodelay(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{Family, Payload};
    use std::io::Read;
    use std::time::Instant;

    #[test]
    fn test_accepted_connection_receives_submissions() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let engine = Engine::new(shutdown.clone());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();

        let shutdown2 = shutdown.clone();
        let engine2 = engine.clone();
        let accept = spawn(move || {
            while !shutdown2.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        setup_stream(&stream).unwrap();
                        Engine::register(
                            &engine2,
                            ClientInfo {
                                name: format!("tcp {}", peer),
                                subscription: Subscription::gdl90(),
                                probe_addr: None,
                            },
                            Box::new(TcpLink { stream }),
                        );
                        return;
                    }
                    Err(_) => sleep(Duration::from_millis(10)),
                }
            }
        });

        let mut client = TcpStream::connect(addr).unwrap();
        accept.join().unwrap();

        engine.submit(&Payload {
            family: Family::GDL90,
            priority: 10,
            valid_until: Some(Instant::now() + Duration::from_secs(2)),
            payload: vec![0x7E, 0x00, 0x7E],
        });

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0_u8; 3];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, &[0x7E, 0x00, 0x7E]);

        shutdown.store(true, Ordering::Relaxed);
        engine.shutdown_all();
    }
}
