//! UDP link service: one datagram per segment.
//!
//! The output daemon drains a span's segment FIFO onto a connected UDP
//! socket, honoring a bits-per-second throttle by sleeping after each
//! send. The input daemon feeds received datagrams to the engine.

use super::engine::Engine;
use super::span::OutboundSegment;
use crate::ipc::{TaskArgs, TaskId};
use crate::tools::error::{DtnError, Result};
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

/// Datagram buffer size; also the upper bound on one received segment.
pub const UDPLSA_BUFSZ: usize = 65536;

/// IP + UDP header bytes, counted against the rate throttle.
const IPHDR_SIZE: u64 = 20 + 8;

/// UDP link service output daemon for one span.
#[derive(Debug)]
pub struct UdpLso {
    sock: UdpSocket,
    sleep_sec_per_bit: f64,
}

impl UdpLso {
    /// Connect toward the peer's link service input. `txbps` of 0 means
    /// unthrottled.
    pub fn new<A: ToSocketAddrs>(dest: A, txbps: u64) -> Result<UdpLso> {
        let sock = UdpSocket::bind("0.0.0.0:0")?;
        let addrs: Vec<std::net::SocketAddr> = dest.to_socket_addrs()?.collect();
        sock.connect(addrs.as_slice())?;
        Ok(UdpLso {
            sock,
            sleep_sec_per_bit: if txbps == 0 { 0.0 } else { 1.0 / txbps as f64 },
        })
    }

    /// Drain the span's FIFO until it is stopped. Send failures drop the
    /// segment; LTP retransmission recovers the loss.
    pub fn run(&self, engine: &Engine, peer_engine: u64, args: &TaskArgs) {
        let span = match engine.span(peer_engine) {
            Ok(span) => span,
            Err(_) => return,
        };

        log::info!("udplso for engine {} running", peer_engine);
        while !args.stop_requested() {
            match span.dequeue_outbound_segment(engine.heap()) {
                Ok(OutboundSegment::Segment(wire)) => {
                    match self.sock.send(&wire) {
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            log::warn!("udplso send failed, dropping segment: {}", e);
                        }
                    }
                    if self.sleep_sec_per_bit > 0.0 {
                        let bits = (IPHDR_SIZE + wire.len() as u64) * 8;
                        let usecs = (bits as f64 * self.sleep_sec_per_bit * 1_000_000.0) as u64;
                        std::thread::sleep(Duration::from_micros(usecs.max(1)));
                    }
                }
                Ok(OutboundSegment::Interrupted) => continue,
                Ok(OutboundSegment::Stopped) => break,
                Err(e) => {
                    log::error!("udplso dequeue failed: {}", e);
                    break;
                }
            }
        }
        log::info!("udplso for engine {} stopped", peer_engine);
    }
}

/// UDP link service input daemon.
#[derive(Debug)]
pub struct UdpLsi {
    sock: UdpSocket,
}

impl UdpLsi {
    /// Bind the local link service input address.
    pub fn new<A: ToSocketAddrs>(bind: A) -> Result<UdpLsi> {
        let sock = UdpSocket::bind(bind)?;
        // Wake periodically so a stop request is noticed.
        sock.set_read_timeout(Some(Duration::from_millis(500)))?;
        Ok(UdpLsi {
            sock,
        })
    }

    /// Local address the input daemon is bound to.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    /// Receive datagrams and hand each one to the engine until stopped.
    pub fn run(&self, engine: &Engine, args: &TaskArgs) {
        let mut buffer = vec![0u8; UDPLSA_BUFSZ];
        log::info!("udplsi running on {:?}", self.sock.local_addr().ok());
        while !args.stop_requested() {
            match self.sock.recv(&mut buffer) {
                Ok(0) => continue,
                Ok(n) => {
                    if let Err(e) = engine.handle_segment(&buffer[..n]) {
                        log::warn!("Discarding malformed segment: {}", e);
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    continue;
                }
                Err(e) => {
                    log::error!("udplsi receive failed: {}", e);
                    break;
                }
            }
        }
        log::info!("udplsi stopped");
    }
}

/// Launch the output daemon for `peer_engine` from the span's
/// `lso_cmd` (`"udp <host:port> [txbps]"`).
pub fn spawn_lso(engine: Arc<Engine>, peer_engine: u64) -> Result<TaskId> {
    let span = engine.span(peer_engine)?;
    let cmd = span.config().lso_cmd.clone();
    let mut parts = cmd.split_whitespace();
    match parts.next() {
        Some("udp") => {}
        other => {
            return Err(DtnError::new(format!(
                "Unsupported LSO command {:?} for engine {}",
                other, peer_engine
            )));
        }
    }
    let dest = parts
        .next()
        .ok_or_else(|| DtnError::new("LSO command missing destination"))?
        .to_owned();
    let txbps: u64 = parts.next().map_or(Ok(0), str::parse).map_err(|_| {
        DtnError::new(format!("Bad tx rate in LSO command {:?}", cmd))
    })?;

    let lso = UdpLso::new(dest.as_str(), txbps)?;
    let ipc = engine.ipc().clone();
    ipc.tasks.spawn_fn("udplso", move |args| {
        lso.run(&engine, peer_engine, &args);
    })
}

/// Launch the input daemon bound to `bind`.
pub fn spawn_lsi(engine: Arc<Engine>, bind: &str) -> Result<TaskId> {
    let lsi = UdpLsi::new(bind)?;
    let ipc = engine.ipc().clone();
    ipc.tasks.spawn_fn("udplsi", move |args| {
        lsi.run(&engine, &args);
    })
}
