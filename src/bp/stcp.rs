//! Simple TCP convergence layer.
//!
//! Each bundle rides as a 2-byte big-endian length prefix followed by the
//! encoded bundle; a zero length is a keepalive. Outbound connections
//! live in a bounded promote-on-use pool keyed by peer address; inbound
//! connections are tracked by an analogous receiver pool whose least
//! recently used entry is closed when a new connection needs room.

use super::acquire::AcqWorkArea;
use super::bundle::{self, BundleRec};
use super::cos::CustodySwitch;
use super::node::{BpNode, DequeuedBundle, Outduct, Wakeups};
use super::pool::LruPool;
use crate::ipc::{TaskArgs, TaskId};
use crate::store::Addr;
use crate::tools::error::{DtnError, Result};
use crate::zco::ZcoReader;
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;

/// Largest bundle the 2-byte length prefix can frame.
pub const STCP_MAX_BUNDLE: usize = 65535;

/// Live-connection bound for both the sender and receiver pools.
pub const STCP_POOL_SIZE: usize = 32;

struct StcpSender {
    peer: String,
    stream: Mutex<TcpStream>,
}

/// Bounded pool of outbound STCP connections, promote-on-use.
pub struct StcpSenderPool {
    pool: LruPool<Arc<StcpSender>>,
}

impl std::fmt::Debug for StcpSenderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StcpSenderPool({} live)", self.pool.len())
    }
}

impl Default for StcpSenderPool {
    fn default() -> Self {
        StcpSenderPool::new()
    }
}

impl StcpSenderPool {
    /// An empty pool.
    pub fn new() -> StcpSenderPool {
        StcpSenderPool {
            pool: LruPool::new(STCP_POOL_SIZE),
        }
    }

    /// Send one encoded bundle to `peer`, reusing a pooled connection
    /// when one exists. Bundles longer than [`STCP_MAX_BUNDLE`] are
    /// rejected with `InvalidInput`.
    pub fn send_bundle(&self, peer: &str, bytes: &[u8]) -> Result<()> {
        if bytes.len() > STCP_MAX_BUNDLE {
            return Err(DtnError::new_kind(
                std::io::ErrorKind::InvalidInput,
                format!("Bundle of {} bytes exceeds STCP framing", bytes.len()),
            ));
        }

        let mut frame = Vec::with_capacity(2 + bytes.len());
        frame.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        frame.extend_from_slice(bytes);

        // Reuse a live connection; a send failure retires it and retries
        // once on a fresh one.
        if let Some(index) = self.pool.find(|s| s.peer == peer) {
            if let Some(sender) = self.pool.get(index) {
                let sent = sender.stream.lock().write_all(&frame);
                match sent {
                    Ok(()) => {
                        self.pool.promote(index);
                        return Ok(());
                    }
                    Err(e) => {
                        log::debug!("Pooled connection to {} failed: {}", peer, e);
                        self.pool.remove(index);
                    }
                }
            }
        }

        let stream = TcpStream::connect(peer)?;
        stream.write_all_retry(&frame)?;
        let (_, evicted) = self.pool.insert(Arc::new(StcpSender {
            peer: peer.to_owned(),
            stream: Mutex::new(stream),
        }));
        if let Some(old) = evicted {
            log::debug!("Evicting LRU connection to {}", old.peer);
            old.stream.lock().shutdown(Shutdown::Both).ok();
        }
        Ok(())
    }

    /// Close every pooled connection.
    pub fn drain(&self) {
        for sender in self.pool.drain() {
            sender.stream.lock().shutdown(Shutdown::Both).ok();
        }
    }
}

trait WriteAllRetry {
    fn write_all_retry(&self, frame: &[u8]) -> Result<()>;
}

impl WriteAllRetry for TcpStream {
    fn write_all_retry(&self, frame: &[u8]) -> Result<()> {
        let mut stream = self;
        loop {
            match stream.write_all(frame) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Encode a bundle record and its payload into contiguous wire bytes.
pub(crate) fn serialize_bundle(node: &BpNode, bundle_addr: Addr) -> Result<(BundleRec, Vec<u8>)> {
    let mut txn = node.heap().begin();
    let rec: BundleRec = txn.get(bundle_addr)?;
    let mut wire = bundle::encode_header(&rec);
    wire.extend_from_slice(&bundle::encode_payload_header(rec.payload_length));

    let start = wire.len();
    wire.resize(start + rec.payload_length as usize, 0);
    let mut reader = ZcoReader::new(rec.payload);
    reader.track_file_offset();
    let n = reader.transmit(&mut txn, rec.payload_length, Some(&mut wire[start..]))?;
    txn.commit()?;
    if n != rec.payload_length {
        return Err(DtnError::new("Degraded payload read; abandoning bundle"));
    }
    Ok((rec, wire))
}

/// STCP convergence-layer output daemon: drains one outduct into the
/// shared sender pool.
pub fn stcpclo_run(node: &BpNode, duct: &Arc<Outduct>, pool: &StcpSenderPool, args: &TaskArgs) {
    log::info!("stcpclo for duct {} running", duct.name);
    while !args.stop_requested() {
        let bundle_addr = match duct.dequeue(node.heap()) {
            Ok(DequeuedBundle::Bundle(addr)) => addr,
            Ok(DequeuedBundle::Interrupted) => continue,
            Ok(DequeuedBundle::Stopped) => break,
            Err(e) => {
                log::error!("stcpclo dequeue failed: {}", e);
                break;
            }
        };

        let (rec, wire) = match serialize_bundle(node, bundle_addr) {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("Dropping unserializable bundle: {}", e);
                discard_bundle(node, bundle_addr);
                continue;
            }
        };

        match pool.send_bundle(&duct.peer, &wire) {
            Ok(()) => {
                if duct.nominal_rate > 0 {
                    // Nominal-rate throttle: pace the duct by sleeping off
                    // the bytes just sent.
                    let usecs = wire.len() as u64 * 1_000_000 / duct.nominal_rate;
                    std::thread::sleep(std::time::Duration::from_micros(usecs));
                }
                if rec.custody == CustodySwitch::SourceCustodyRequired {
                    // Retained until a custody signal or the custody-due
                    // timer resolves it.
                    continue;
                }
                discard_bundle(node, bundle_addr);
            }
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
                log::error!("Bundle exceeds STCP framing: {}", e);
                discard_bundle(node, bundle_addr);
            }
            Err(e) => {
                log::warn!("Transmission to {} failed ({}); sending to limbo", duct.peer, e);
                if let Err(e) = requeue_to_limbo(node, bundle_addr) {
                    log::error!("Can't limbo bundle: {}", e);
                }
            }
        }
    }
    log::info!("stcpclo for duct {} stopped", duct.name);
}

fn discard_bundle(node: &BpNode, bundle_addr: Addr) {
    let mut wake = Wakeups::default();
    let mut txn = node.heap().begin();
    let destroyed = txn
        .get::<BundleRec>(bundle_addr)
        .and_then(|rec| node.destroy_bundle(&mut txn, &mut wake, bundle_addr, &rec, 0));
    match destroyed {
        Ok(()) => {
            txn.commit().ok();
            wake.fire();
        }
        Err(e) => log::error!("Can't destroy bundle: {}", e),
    }
}

fn requeue_to_limbo(node: &BpNode, bundle_addr: Addr) -> Result<()> {
    // Park for a later reforward rather than dropping.
    node.send_to_limbo(bundle_addr)
}

struct StcpReceiver {
    stream: TcpStream,
    task: TaskId,
}

/// STCP convergence-layer input daemon: accepts connections and spawns a
/// per-connection receiver, bounded by an LRU pool.
pub struct StcpCli {
    listener: TcpListener,
    receivers: Arc<LruPool<Arc<StcpReceiver>>>,
}

impl std::fmt::Debug for StcpCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StcpCli({:?})", self.listener.local_addr().ok())
    }
}

impl StcpCli {
    /// Bind the listen address.
    pub fn new<A: ToSocketAddrs>(bind: A) -> Result<StcpCli> {
        Ok(StcpCli {
            listener: TcpListener::bind(bind)?,
            receivers: Arc::new(LruPool::new(STCP_POOL_SIZE)),
        })
    }

    /// Local listen address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept inbound connections until stopped. Stop by raising the
    /// task's stop flag, then poking the listener with [`StcpCli::wakeup`]
    /// so `accept` returns.
    pub fn run(&self, node: &Arc<BpNode>, args: &TaskArgs) {
        log::info!("stcpcli on {:?} running", self.listener.local_addr().ok());
        loop {
            let (stream, from) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) => {
                    log::error!("accept failed: {}", e);
                    break;
                }
            };
            if args.stop_requested() {
                break;
            }

            log::debug!("Inbound STCP connection from {}", from);
            let reader = match stream.try_clone() {
                Ok(clone) => clone,
                Err(e) => {
                    log::error!("Can't clone inbound stream: {}", e);
                    continue;
                }
            };

            let node_for_recv = node.clone();
            let task = match node.ipc().tasks.spawn_fn("stcprcvr", move |rcvr_args| {
                receive_bundles(&node_for_recv, reader, &rcvr_args);
            }) {
                Ok(task) => task,
                Err(e) => {
                    log::error!("Can't spawn receiver: {}", e);
                    continue;
                }
            };

            let (_, evicted) = self.receivers.insert(Arc::new(StcpReceiver { stream, task }));
            if let Some(old) = evicted {
                // Pool full: close the least recently used receiver.
                log::debug!("Receiver pool full; closing LRU receiver");
                old.stream.shutdown(Shutdown::Both).ok();
                node.ipc().tasks.kill(old.task, 15);
            }
        }

        for receiver in self.receivers.drain() {
            receiver.stream.shutdown(Shutdown::Both).ok();
            node.ipc().tasks.kill(receiver.task, 15);
        }
        log::info!("stcpcli stopped");
    }

    /// Pop a blocked `accept` by self-connecting; the injected EOF lets
    /// the running flag be observed.
    pub fn wakeup(&self) {
        if let Ok(addr) = self.listener.local_addr() {
            TcpStream::connect(addr).ok();
        }
    }
}

/// Per-connection receive loop: one length-delimited bundle at a time
/// into a dedicated acquisition work area.
fn receive_bundles(node: &Arc<BpNode>, mut stream: TcpStream, args: &TaskArgs) {
    let mut acq = AcqWorkArea::new();
    let mut length_buf = [0u8; 2];
    while !args.stop_requested() {
        match stream.read_exact(&mut length_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break, // EOF or closed by eviction
        }

        let length = u16::from_be_bytes(length_buf) as usize;
        if length == 0 {
            continue; // keepalive
        }

        let mut body = vec![0u8; length];
        if stream.read_exact(&mut body).is_err() {
            log::warn!("Truncated STCP frame; closing connection");
            break;
        }

        acq.begin(None);
        acq.continue_acq(&body);
        if let Err(e) = acq.end_acq(node) {
            log::warn!("Discarding unacquirable bundle: {}", e);
        }
    }
    stream.shutdown(Shutdown::Both).ok();
}

/// Spawn the listener daemon.
pub fn spawn_cli(node: Arc<BpNode>, cli: Arc<StcpCli>) -> Result<TaskId> {
    let ipc = node.ipc().clone();
    ipc.tasks.spawn_fn("stcpcli", move |args| {
        cli.run(&node, &args);
    })
}

/// Spawn the output daemon for `duct`.
pub fn spawn_clo(node: Arc<BpNode>, duct: Arc<Outduct>, pool: Arc<StcpSenderPool>) -> Result<TaskId> {
    let ipc = node.ipc().clone();
    ipc.tasks.spawn_fn("stcpclo", move |args| {
        stcpclo_run(&node, &duct, &pool, &args);
    })
}
