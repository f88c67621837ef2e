use super::segment::{
    CancelReason, Claim, DataSegment, ReportSegment, Segment, SegmentBody,
};
use super::session::{
    covers_prefix, destroy_ranges, gaps_within, merge_range, read_ranges, ExportSessionRec,
    ExportState, ImportSessionRec, SegRec,
};
use super::span::{ExportIndex, Span, SpanConfig};
use crate::ipc::{Ipc, Sem, SemDiscipline, SemTake, TaskId, SM_NO_KEY};
use crate::store::{Addr, Heap, Rec, Txn};
use crate::tools::error::{DtnError, Result};
use crate::zco::{self, Zco, ZcoReader, ZcoMedium};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const KIND_EXPORT_COMPLETE: u64 = 0;
const KIND_EXPORT_CANCELED: u64 = 1;
const KIND_IMPORT_CANCELED: u64 = 2;
const KIND_RECV_RED_PART: u64 = 3;
const KIND_RECV_GREEN: u64 = 4;

const TIMER_CKPT: u64 = 0;
const TIMER_REPORT: u64 = 1;

const CLOSED_SESSION_MEMORY: usize = 256;

fn get(buf: &[u8], i: usize) -> u64 {
    u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap())
}

fn put(buf: &mut [u8], i: usize, v: u64) {
    buf[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
}

/// Event delivered to an LTP client service.
#[derive(Debug)]
pub enum LtpNotice {
    /// The red part of an outbound block was fully acknowledged
    ExportSessionComplete {
        /// Peer the block was sent to
        peer_engine: u64,
        /// Session number
        session_nbr: u64,
    },
    /// An outbound session was cancelled, locally or by the peer
    ExportSessionCanceled {
        /// Peer the block was being sent to
        peer_engine: u64,
        /// Session number
        session_nbr: u64,
        /// Why the session died
        reason: CancelReason,
    },
    /// An inbound session was cancelled, locally or by the peer
    ImportSessionCanceled {
        /// Peer the block was coming from
        peer_engine: u64,
        /// Session number
        session_nbr: u64,
        /// Why the session died
        reason: CancelReason,
    },
    /// A fully reassembled red part
    RecvRedPart {
        /// Peer the block came from
        peer_engine: u64,
        /// Session number
        session_nbr: u64,
        /// Client service the block is addressed to
        client_id: u64,
        /// The reassembled bytes; the client owns this ZCO
        data: Zco,
        /// Red-part length
        length: u64,
    },
    /// One green segment, delivered as received
    RecvGreenSegment {
        /// Peer the segment came from
        peer_engine: u64,
        /// Session number
        session_nbr: u64,
        /// Client service the segment is addressed to
        client_id: u64,
        /// Segment bytes; the client owns this ZCO (null when empty)
        data: Zco,
        /// Offset of the segment within its block
        offset: u64,
        /// Segment length
        length: u64,
        /// True if this segment ended its block
        eob: bool,
    },
}

#[derive(Debug, Default)]
struct NoticeRec {
    kind: u64,
    peer_engine: u64,
    session_nbr: u64,
    reason: u64,
    client_id: u64,
    zco: Addr,
    offset: u64,
    length: u64,
    flags: u64,
}

impl Rec for NoticeRec {
    const SIZE: usize = 72;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.kind);
        put(buf, 1, self.peer_engine);
        put(buf, 2, self.session_nbr);
        put(buf, 3, self.reason);
        put(buf, 4, self.client_id);
        put(buf, 5, self.zco.0);
        put(buf, 6, self.offset);
        put(buf, 7, self.length);
        put(buf, 8, self.flags);
    }

    fn decode(buf: &[u8]) -> Self {
        NoticeRec {
            kind: get(buf, 0),
            peer_engine: get(buf, 1),
            session_nbr: get(buf, 2),
            reason: get(buf, 3),
            client_id: get(buf, 4),
            zco: Addr(get(buf, 5)),
            offset: get(buf, 6),
            length: get(buf, 7),
            flags: get(buf, 8),
        }
    }
}

#[derive(Debug)]
struct TimerRec {
    deadline: u64,
    peer_engine: u64,
    session_nbr: u64,
    serial: u64,
    kind: u64,
}

impl Rec for TimerRec {
    const SIZE: usize = 40;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.deadline);
        put(buf, 1, self.peer_engine);
        put(buf, 2, self.session_nbr);
        put(buf, 3, self.serial);
        put(buf, 4, self.kind);
    }

    fn decode(buf: &[u8]) -> Self {
        TimerRec {
            deadline: get(buf, 0),
            peer_engine: get(buf, 1),
            session_nbr: get(buf, 2),
            serial: get(buf, 3),
            kind: get(buf, 4),
        }
    }
}

struct Client {
    notices: Addr,
    sem: Sem,
}

/// Deferred semaphore work, fired only after the transaction that made the
/// corresponding state visible has committed.
#[derive(Default)]
struct Wakeups {
    spans: Vec<(Arc<Span>, usize)>,
    sems: Vec<Sem>,
}

impl Wakeups {
    fn span(&mut self, span: &Arc<Span>, n: usize) {
        if n > 0 {
            self.spans.push((span.clone(), n));
        }
    }

    fn fire(self) {
        for (span, n) in self.spans {
            span.signal_segments(n);
        }
        for sem in self.sems {
            sem.give();
        }
    }
}

/// An LTP engine: the sender/receiver state machines for every span, the
/// retransmission clock, and the client notice queues.
pub struct Engine {
    heap: Arc<Heap>,
    ipc: Arc<Ipc>,
    engine_id: u64,
    spans: Mutex<HashMap<u64, Arc<Span>>>,
    imports: Mutex<HashMap<(u64, u64), Addr>>,
    /// Recently completed import sessions and their red lengths, kept so a
    /// late-retransmitted checkpoint can be answered without rebuilding
    closed_imports: Mutex<HashMap<(u64, u64), u64>>,
    clients: Mutex<HashMap<u64, Client>>,
    timers: Addr,
    next_session: AtomicU64,
    next_serial: AtomicU64,
    running: AtomicBool,
    tasks: Mutex<Vec<TaskId>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LtpEngine({})", self.engine_id)
    }
}

impl Engine {
    /// Create an engine with the given id over a heap and IPC context.
    pub fn new(heap: Arc<Heap>, ipc: Arc<Ipc>, engine_id: u64) -> Result<Arc<Engine>> {
        let mut txn = heap.begin();
        let timers = txn.list_create()?;
        txn.commit()?;

        let mut rng = rand::thread_rng();
        Ok(Arc::new(Engine {
            heap,
            ipc,
            engine_id,
            spans: Mutex::new(HashMap::new()),
            imports: Mutex::new(HashMap::new()),
            closed_imports: Mutex::new(HashMap::new()),
            clients: Mutex::new(HashMap::new()),
            timers,
            next_session: AtomicU64::new(rng.gen_range(1..=0xffff_ffff)),
            next_serial: AtomicU64::new(rng.gen_range(1..=0xffff_ffff)),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// This engine's id.
    pub fn engine_id(&self) -> u64 {
        self.engine_id
    }

    /// The heap this engine stores its state in.
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// The IPC context this engine signals through.
    pub fn ipc(&self) -> &Arc<Ipc> {
        &self.ipc
    }

    fn next_session_nbr(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    fn next_serial_nbr(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Configure a span to a peer engine.
    pub fn add_span(&self, config: SpanConfig) -> Result<Arc<Span>> {
        let peer = config.peer_engine;
        let mut txn = self.heap.begin();
        let span = Arc::new(Span::new(&mut txn, &self.ipc, config)?);
        txn.commit()?;
        self.spans.lock().insert(peer, span.clone());
        Ok(span)
    }

    /// Span leading to `peer_engine`.
    pub fn span(&self, peer_engine: u64) -> Result<Arc<Span>> {
        self.spans
            .lock()
            .get(&peer_engine)
            .cloned()
            .ok_or_else(|| DtnError::new(format!("No span to engine {}", peer_engine)))
    }

    /// Register a client service so it can receive notices.
    pub fn open_client(&self, client_id: u64) -> Result<()> {
        let mut txn = self.heap.begin();
        let notices = txn.list_create()?;

        let mut clients = self.clients.lock();
        if clients.contains_key(&client_id) {
            return Err(DtnError::new(format!("Client {} already open", client_id)));
        }
        txn.commit()?;
        clients.insert(
            client_id,
            Client {
                notices,
                sem: self.ipc.sems.create(SM_NO_KEY, SemDiscipline::Fifo),
            },
        );
        Ok(())
    }

    /// Detach a client service, waking any blocked [`Engine::get_notice`].
    pub fn close_client(&self, client_id: u64) {
        if let Some(client) = self.clients.lock().remove(&client_id) {
            client.sem.end();
        }
    }

    /// Block until a notice is available for `client_id`. Returns `None`
    /// once the client has been closed or the engine stopped.
    pub fn get_notice(&self, client_id: u64) -> Result<Option<LtpNotice>> {
        loop {
            let (sem, notices) = {
                let clients = self.clients.lock();
                match clients.get(&client_id) {
                    Some(c) => (c.sem.clone(), c.notices),
                    None => return Ok(None),
                }
            };

            match sem.take() {
                SemTake::Ended => return Ok(None),
                SemTake::Taken | SemTake::TimedOut => {}
            }

            let mut txn = self.heap.begin();
            let rec_addr = txn.list_pop_first(notices)?;
            if rec_addr.is_null() {
                txn.cancel();
                continue;
            }
            let rec: NoticeRec = txn.get(rec_addr)?;
            txn.free(rec_addr)?;
            txn.commit()?;
            return Ok(Some(Self::decode_notice(rec)));
        }
    }

    fn decode_notice(rec: NoticeRec) -> LtpNotice {
        match rec.kind {
            KIND_EXPORT_COMPLETE => LtpNotice::ExportSessionComplete {
                peer_engine: rec.peer_engine,
                session_nbr: rec.session_nbr,
            },
            KIND_EXPORT_CANCELED => LtpNotice::ExportSessionCanceled {
                peer_engine: rec.peer_engine,
                session_nbr: rec.session_nbr,
                reason: CancelReason::from_u8(rec.reason as u8),
            },
            KIND_IMPORT_CANCELED => LtpNotice::ImportSessionCanceled {
                peer_engine: rec.peer_engine,
                session_nbr: rec.session_nbr,
                reason: CancelReason::from_u8(rec.reason as u8),
            },
            KIND_RECV_RED_PART => LtpNotice::RecvRedPart {
                peer_engine: rec.peer_engine,
                session_nbr: rec.session_nbr,
                client_id: rec.client_id,
                data: Zco(rec.zco),
                length: rec.length,
            },
            _ => LtpNotice::RecvGreenSegment {
                peer_engine: rec.peer_engine,
                session_nbr: rec.session_nbr,
                client_id: rec.client_id,
                data: Zco(rec.zco),
                offset: rec.offset,
                length: rec.length,
                eob: rec.flags != 0,
            },
        }
    }

    fn post_notice(&self, txn: &mut Txn, wake: &mut Wakeups, rec: NoticeRec) -> Result<()> {
        let clients = self.clients.lock();
        match clients.get(&rec.client_id) {
            Some(client) => {
                let addr = txn.alloc_rec(&rec)?;
                txn.list_insert_last(client.notices, addr)?;
                wake.sems.push(client.sem.clone());
            }
            None => {
                log::warn!("No client {} attached; dropping notice", rec.client_id);
                if !rec.zco.is_null() {
                    zco::destroy(txn, Zco(rec.zco))?;
                }
            }
        }
        Ok(())
    }

    fn add_timer(
        &self,
        txn: &mut Txn,
        deadline: u64,
        peer_engine: u64,
        session_nbr: u64,
        serial: u64,
        kind: u64,
    ) -> Result<()> {
        let rec = TimerRec {
            deadline,
            peer_engine,
            session_nbr,
            serial,
            kind,
        };
        let addr = txn.alloc_rec(&rec)?;
        txn.list_insert_last(self.timers, addr)?;
        Ok(())
    }

    fn purge_timers(&self, txn: &mut Txn, peer_engine: u64, session_nbr: u64) -> Result<()> {
        let mut elt = txn.list_first(self.timers)?;
        while !elt.is_null() {
            let next = txn.list_next(elt)?;
            let addr = txn.list_data(elt)?;
            let rec: TimerRec = txn.get(addr)?;
            if rec.peer_engine == peer_engine && rec.session_nbr == session_nbr {
                txn.free(addr)?;
                txn.list_delete(elt)?;
            }
            elt = next;
        }
        Ok(())
    }

    fn now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }

    /// Read `out.len()` bytes of the session block starting at `offset`.
    /// The block is the concatenation of the session's service-data ZCOs.
    fn read_block(&self, txn: &mut Txn, svc_data: Addr, offset: u64, out: &mut [u8]) -> Result<()> {
        let mut skip = offset;
        let mut filled = 0usize;
        let mut elt = txn.list_first(svc_data)?;
        while !elt.is_null() && filled < out.len() {
            let z = Zco(txn.list_data(elt)?);
            let zlen = zco::length(txn, z)?;
            if skip >= zlen {
                skip -= zlen;
                elt = txn.list_next(elt)?;
                continue;
            }

            let mut reader = ZcoReader::new(z);
            if skip > 0 {
                reader.transmit(txn, skip, None)?;
            }
            let take = ((zlen - skip) as usize).min(out.len() - filled);
            let n = reader.transmit(txn, take as u64, Some(&mut out[filled..filled + take]))?;
            if n != take as u64 {
                return Err(DtnError::new("Short read of session block"));
            }
            skip = 0;
            filled += take;
            elt = txn.list_next(elt)?;
        }

        if filled < out.len() {
            return Err(DtnError::new(format!(
                "Block read past end: wanted {} at {}",
                out.len(),
                offset
            )));
        }
        Ok(())
    }

    /// Post client service data for transmission to `peer_engine`.
    ///
    /// The first `red_length` bytes are sent reliably; the remainder is
    /// green. The engine takes ownership of `zco`. Returns the session
    /// number carrying the data.
    pub fn send(&self, peer_engine: u64, client_id: u64, zco: Zco, red_length: u64) -> Result<u64> {
        let span = self.span(peer_engine)?;
        let mut wake = Wakeups::default();
        let mut txn = self.heap.begin();

        let total = zco::length(&txn, zco)?;
        if total == 0 {
            return Err(DtnError::new("Refusing to send empty service data"));
        }
        if total > span.config.remote_max_block_size {
            return Err(DtnError::new(format!(
                "Service data of {} bytes exceeds remote block limit",
                total
            )));
        }

        let red = red_length.min(total);
        let mut ex = span.export.lock();
        let sess_addr = match ex.filling {
            Some(addr) => addr,
            None => {
                if ex.sessions.len() >= span.config.max_export_sessions {
                    return Err(DtnError::new_kind(
                        std::io::ErrorKind::WouldBlock,
                        format!("All export sessions to engine {} are busy", peer_engine),
                    ));
                }
                let rec = ExportSessionRec {
                    session_nbr: self.next_session_nbr(),
                    peer_engine,
                    client_id,
                    state: ExportState::Filling,
                    red_length: 0,
                    block_length: 0,
                    svc_data: txn.list_create()?,
                    segments: txn.list_create()?,
                    acked: txn.list_create()?,
                    ckpt_serial: 0,
                    ckpt_offset: 0,
                    ckpt_length: 0,
                    ckpt_retransmits: 0,
                };
                let addr = txn.alloc_rec(&rec)?;
                ex.sessions.insert(rec.session_nbr, addr);
                ex.filling = Some(addr);
                addr
            }
        };

        let mut rec: ExportSessionRec = txn.get(sess_addr)?;
        txn.list_insert_last(rec.svc_data, zco.0)?;
        if rec.red_length == rec.block_length {
            // Still an unbroken red prefix.
            rec.red_length += red;
        }
        rec.block_length += total;
        let session_nbr = rec.session_nbr;

        // A green tail must end the block, so seal immediately in that
        // case; otherwise seal on the aggregation size threshold.
        let seal = red < total || rec.block_length >= span.config.aggregation_size_limit;
        if seal {
            ex.filling = None;
            self.emit_block(&mut txn, &span, &mut rec, &mut wake)?;
            if rec.red_length == 0 {
                // All-green block: nothing to await.
                self.post_notice(
                    &mut txn,
                    &mut wake,
                    NoticeRec {
                        kind: KIND_EXPORT_COMPLETE,
                        peer_engine,
                        session_nbr,
                        client_id: rec.client_id,
                        ..Default::default()
                    },
                )?;
                self.release_export(&mut txn, &mut ex, sess_addr, &rec)?;
            } else {
                txn.put(sess_addr, &rec)?;
            }
        } else {
            txn.put(sess_addr, &rec)?;
        }

        drop(ex);
        txn.commit()?;
        wake.fire();
        Ok(session_nbr)
    }

    /// Seal and emit the filling session of `peer_engine`, if any. Driven
    /// by the span's aggregation-time meter.
    pub fn seal_filling(&self, peer_engine: u64) -> Result<()> {
        let span = self.span(peer_engine)?;
        let mut wake = Wakeups::default();
        let mut txn = self.heap.begin();
        let mut ex = span.export.lock();

        let sess_addr = match ex.filling.take() {
            Some(addr) => addr,
            None => return Ok(()),
        };
        let mut rec: ExportSessionRec = txn.get(sess_addr)?;
        if rec.block_length == 0 {
            ex.filling = Some(sess_addr);
            return Ok(());
        }

        self.emit_block(&mut txn, &span, &mut rec, &mut wake)?;
        if rec.red_length == 0 {
            self.post_notice(
                &mut txn,
                &mut wake,
                NoticeRec {
                    kind: KIND_EXPORT_COMPLETE,
                    peer_engine,
                    session_nbr: rec.session_nbr,
                    client_id: rec.client_id,
                    ..Default::default()
                },
            )?;
            self.release_export(&mut txn, &mut ex, sess_addr, &rec)?;
        } else {
            txn.put(sess_addr, &rec)?;
        }

        drop(ex);
        txn.commit()?;
        wake.fire();
        Ok(())
    }

    /// Cut the sealed block into data segments on the span's FIFO.
    fn emit_block(
        &self,
        txn: &mut Txn,
        span: &Arc<Span>,
        rec: &mut ExportSessionRec,
        wake: &mut Wakeups,
    ) -> Result<()> {
        let seg_size = span.config.max_segment_size as u64;
        let mut count = 0usize;
        let mut offset = 0u64;

        while offset < rec.red_length {
            let len = seg_size.min(rec.red_length - offset);
            let last_red = offset + len == rec.red_length;
            let mut data = vec![0u8; len as usize];
            self.read_block(txn, rec.svc_data, offset, &mut data)?;

            let serial = if last_red { self.next_serial_nbr() } else { 0 };
            let segment = Segment {
                engine_id: self.engine_id,
                session_nbr: rec.session_nbr,
                body: SegmentBody::Data(DataSegment {
                    client_id: rec.client_id,
                    offset,
                    red: true,
                    checkpoint: last_red,
                    eorp: last_red,
                    eob: last_red && rec.red_length == rec.block_length,
                    checkpoint_serial: serial,
                    report_serial: 0,
                    data,
                }),
            };
            span.enqueue(txn, &segment)?;
            count += 1;

            let seg_rec = txn.alloc_rec(&SegRec {
                offset,
                length: len,
                red: true,
                serial,
            })?;
            txn.list_insert_last(rec.segments, seg_rec)?;

            if last_red {
                rec.ckpt_serial = serial;
                rec.ckpt_offset = offset;
                rec.ckpt_length = len;
            }
            offset += len;
        }

        while offset < rec.block_length {
            let len = seg_size.min(rec.block_length - offset);
            let eob = offset + len == rec.block_length;
            let mut data = vec![0u8; len as usize];
            self.read_block(txn, rec.svc_data, offset, &mut data)?;

            let segment = Segment {
                engine_id: self.engine_id,
                session_nbr: rec.session_nbr,
                body: SegmentBody::Data(DataSegment {
                    client_id: rec.client_id,
                    offset,
                    red: false,
                    checkpoint: false,
                    eorp: false,
                    eob,
                    checkpoint_serial: 0,
                    report_serial: 0,
                    data,
                }),
            };
            span.enqueue(txn, &segment)?;
            count += 1;

            let seg_rec = txn.alloc_rec(&SegRec {
                offset,
                length: len,
                red: false,
                serial: 0,
            })?;
            txn.list_insert_last(rec.segments, seg_rec)?;
            offset += len;
        }

        log::debug!(
            "Emitted block of {} bytes ({} red) to engine {} in {} segments, session {}",
            rec.block_length,
            rec.red_length,
            rec.peer_engine,
            count,
            rec.session_nbr
        );
        rec.state = if rec.red_length > 0 {
            ExportState::AwaitingReport
        } else {
            ExportState::Closed
        };

        if rec.red_length > 0 {
            self.add_timer(
                txn,
                Self::now() + span.config.expected_rtt,
                rec.peer_engine,
                rec.session_nbr,
                rec.ckpt_serial,
                TIMER_CKPT,
            )?;
        }
        wake.span(span, count);
        Ok(())
    }

    /// Free every trace of an export session. The export index lock is
    /// held by the caller.
    fn release_export(
        &self,
        txn: &mut Txn,
        ex: &mut ExportIndex,
        sess_addr: Addr,
        rec: &ExportSessionRec,
    ) -> Result<()> {
        let mut elt = txn.list_first(rec.svc_data)?;
        while !elt.is_null() {
            let z = Zco(txn.list_data(elt)?);
            zco::destroy(txn, z)?;
            elt = txn.list_next(elt)?;
        }
        txn.list_destroy(rec.svc_data)?;

        let mut elt = txn.list_first(rec.segments)?;
        while !elt.is_null() {
            txn.free(txn.list_data(elt)?)?;
            elt = txn.list_next(elt)?;
        }
        txn.list_destroy(rec.segments)?;

        destroy_ranges(txn, rec.acked)?;
        txn.free(sess_addr)?;
        self.purge_timers(txn, rec.peer_engine, rec.session_nbr)?;
        ex.sessions.remove(&rec.session_nbr);
        if ex.filling == Some(sess_addr) {
            ex.filling = None;
        }
        Ok(())
    }

    fn find_export(&self, session_nbr: u64) -> Option<(Arc<Span>, Addr)> {
        let spans = self.spans.lock();
        for span in spans.values() {
            if let Some(addr) = span.export.lock().sessions.get(&session_nbr) {
                return Some((span.clone(), *addr));
            }
        }
        None
    }

    /// Process one segment arriving from a link service input.
    pub fn handle_segment(&self, wire: &[u8]) -> Result<()> {
        let segment = Segment::decode(wire)?;
        match segment.body {
            SegmentBody::Data(ref d) => self.handle_data(&segment, d),
            SegmentBody::Report(ref r) => self.handle_report(&segment, r),
            SegmentBody::ReportAck { serial } => self.handle_report_ack(&segment, serial),
            SegmentBody::CancelBySender(reason) => self.handle_cancel_by_sender(&segment, reason),
            SegmentBody::CancelByReceiver(reason) => {
                self.handle_cancel_by_receiver(&segment, reason)
            }
            SegmentBody::CancelAckToSender | SegmentBody::CancelAckToReceiver => {
                log::debug!(
                    "Cancel ack for session {}:{}",
                    segment.engine_id,
                    segment.session_nbr
                );
                Ok(())
            }
        }
    }

    fn handle_data(&self, segment: &Segment, d: &DataSegment) -> Result<()> {
        let span = self.span(segment.engine_id)?;
        let mut wake = Wakeups::default();
        let mut txn = self.heap.begin();

        if !d.red {
            // Green data is delivered opportunistically, unsequenced.
            let data = if d.data.is_empty() {
                Zco::default()
            } else {
                let array = txn.put_bytes(&d.data)?;
                let z = zco::create(&mut txn)?;
                zco::append_extent(&mut txn, z, ZcoMedium::Heap, array, 0, d.data.len() as u64)?;
                z
            };
            self.post_notice(
                &mut txn,
                &mut wake,
                NoticeRec {
                    kind: KIND_RECV_GREEN,
                    peer_engine: segment.engine_id,
                    session_nbr: segment.session_nbr,
                    client_id: d.client_id,
                    zco: data.0,
                    offset: d.offset,
                    length: d.data.len() as u64,
                    flags: d.eob as u64,
                    ..Default::default()
                },
            )?;
            txn.commit()?;
            wake.fire();
            return Ok(());
        }

        let key = (segment.engine_id, segment.session_nbr);

        // A checkpoint for a session we already delivered gets a full
        // claim so the sender can close without rebuilding state.
        if let Some(&red_length) = self.closed_imports.lock().get(&key) {
            if d.checkpoint {
                let report = Segment {
                    engine_id: segment.engine_id,
                    session_nbr: segment.session_nbr,
                    body: SegmentBody::Report(ReportSegment {
                        serial: self.next_serial_nbr(),
                        checkpoint_serial: d.checkpoint_serial,
                        upper_bound: red_length,
                        lower_bound: 0,
                        claims: vec![Claim {
                            begin: 0,
                            end: red_length,
                        }],
                    }),
                };
                span.enqueue(&mut txn, &report)?;
                wake.span(&span, 1);
                txn.commit()?;
                wake.fire();
            }
            return Ok(());
        }

        let mut imports = self.imports.lock();
        let sess_addr = match imports.get(&key) {
            Some(&addr) => addr,
            None => {
                let count = imports.keys().filter(|(p, _)| *p == key.0).count();
                if count >= span.config.max_import_sessions {
                    log::warn!(
                        "Import sessions from engine {} exhausted; dropping segment",
                        key.0
                    );
                    return Ok(());
                }
                let rec = ImportSessionRec {
                    session_nbr: segment.session_nbr,
                    peer_engine: segment.engine_id,
                    client_id: d.client_id,
                    buffer: Addr::NULL,
                    buffer_cap: 0,
                    red_length: 0,
                    eob_seen: false,
                    ranges: txn.list_create()?,
                    rpt_serial: 0,
                    rpt_ckpt_serial: 0,
                    rpt_retransmits: 0,
                };
                let addr = txn.alloc_rec(&rec)?;
                imports.insert(key, addr);
                log::debug!("New import session {}:{}", key.0, key.1);
                addr
            }
        };

        let mut rec: ImportSessionRec = txn.get(sess_addr)?;
        let end = d.offset + d.data.len() as u64;
        self.grow_buffer(&mut txn, &mut rec, end)?;
        if !d.data.is_empty() {
            txn.write(Addr(rec.buffer.0 + d.offset), &d.data)?;
            merge_range(&mut txn, rec.ranges, d.offset, end)?;
        }

        if d.checkpoint {
            if d.eorp {
                rec.red_length = end;
            }
            if d.eob {
                rec.eob_seen = true;
            }
            rec.rpt_ckpt_serial = d.checkpoint_serial;
            rec.rpt_retransmits = 0;
            rec.rpt_serial = self.next_serial_nbr();
            self.emit_report(&mut txn, &span, &rec, &mut wake)?;
        }

        let ranges = read_ranges(&txn, rec.ranges)?;
        if rec.red_length > 0 && covers_prefix(&ranges, rec.red_length) {
            self.complete_import(&mut txn, &mut imports, sess_addr, &rec, &mut wake)?;
        } else {
            txn.put(sess_addr, &rec)?;
        }

        drop(imports);
        txn.commit()?;
        wake.fire();
        Ok(())
    }

    fn grow_buffer(&self, txn: &mut Txn, rec: &mut ImportSessionRec, needed: u64) -> Result<()> {
        if rec.buffer_cap >= needed {
            return Ok(());
        }
        let new_cap = needed.max(rec.buffer_cap * 2).max(2048);
        let new_buffer = txn.malloc(new_cap)?;
        if !rec.buffer.is_null() {
            let mut old = vec![0u8; rec.buffer_cap as usize];
            txn.read(rec.buffer, &mut old)?;
            txn.write(new_buffer, &old)?;
            txn.free(rec.buffer)?;
        }
        rec.buffer = new_buffer;
        rec.buffer_cap = new_cap;
        Ok(())
    }

    /// Emit a reception report reflecting the current gap set.
    fn emit_report(
        &self,
        txn: &mut Txn,
        span: &Arc<Span>,
        rec: &ImportSessionRec,
        wake: &mut Wakeups,
    ) -> Result<()> {
        let ranges = read_ranges(txn, rec.ranges)?;
        let upper = if rec.red_length > 0 {
            rec.red_length
        } else {
            ranges.last().map_or(0, |c| c.end)
        };

        let report = Segment {
            engine_id: rec.peer_engine,
            session_nbr: rec.session_nbr,
            body: SegmentBody::Report(ReportSegment {
                serial: rec.rpt_serial,
                checkpoint_serial: rec.rpt_ckpt_serial,
                upper_bound: upper,
                lower_bound: 0,
                claims: ranges,
            }),
        };
        span.enqueue(txn, &report)?;
        wake.span(span, 1);
        self.add_timer(
            txn,
            Self::now() + span.config.expected_rtt,
            rec.peer_engine,
            rec.session_nbr,
            rec.rpt_serial,
            TIMER_REPORT,
        )?;
        Ok(())
    }

    /// Deliver the reassembled red part and retire the session.
    fn complete_import(
        &self,
        txn: &mut Txn,
        imports: &mut HashMap<(u64, u64), Addr>,
        sess_addr: Addr,
        rec: &ImportSessionRec,
        wake: &mut Wakeups,
    ) -> Result<()> {
        let z = zco::create(txn)?;
        zco::append_extent(txn, z, ZcoMedium::Heap, rec.buffer, 0, rec.red_length)?;
        self.post_notice(
            txn,
            wake,
            NoticeRec {
                kind: KIND_RECV_RED_PART,
                peer_engine: rec.peer_engine,
                session_nbr: rec.session_nbr,
                client_id: rec.client_id,
                zco: z.0,
                length: rec.red_length,
                ..Default::default()
            },
        )?;
        log::debug!(
            "Red part of session {}:{} complete, {} bytes",
            rec.peer_engine,
            rec.session_nbr,
            rec.red_length
        );

        destroy_ranges(txn, rec.ranges)?;
        txn.free(sess_addr)?;
        self.purge_timers(txn, rec.peer_engine, rec.session_nbr)?;
        imports.remove(&(rec.peer_engine, rec.session_nbr));

        let mut closed = self.closed_imports.lock();
        if closed.len() >= CLOSED_SESSION_MEMORY {
            closed.clear();
        }
        closed.insert((rec.peer_engine, rec.session_nbr), rec.red_length);
        Ok(())
    }

    /// Drop an import session without delivery.
    fn release_import(
        &self,
        txn: &mut Txn,
        imports: &mut HashMap<(u64, u64), Addr>,
        sess_addr: Addr,
        rec: &ImportSessionRec,
    ) -> Result<()> {
        destroy_ranges(txn, rec.ranges)?;
        if !rec.buffer.is_null() {
            txn.free(rec.buffer)?;
        }
        txn.free(sess_addr)?;
        self.purge_timers(txn, rec.peer_engine, rec.session_nbr)?;
        imports.remove(&(rec.peer_engine, rec.session_nbr));
        Ok(())
    }

    fn handle_report(&self, segment: &Segment, r: &ReportSegment) -> Result<()> {
        let found = self.find_export(segment.session_nbr);
        let mut wake = Wakeups::default();
        let mut txn = self.heap.begin();

        let (span, sess_addr) = match found {
            Some(pair) => pair,
            None => {
                log::debug!("Report for unknown session {}", segment.session_nbr);
                return Ok(());
            }
        };

        // Acknowledge the report itself.
        let ack = Segment {
            engine_id: segment.engine_id,
            session_nbr: segment.session_nbr,
            body: SegmentBody::ReportAck { serial: r.serial },
        };
        span.enqueue(&mut txn, &ack)?;
        wake.span(&span, 1);

        let mut ex = span.export.lock();
        let mut rec: ExportSessionRec = txn.get(sess_addr)?;
        for claim in &r.claims {
            merge_range(&mut txn, rec.acked, claim.begin, claim.end)?;
        }
        self.remove_timer(&mut txn, rec.peer_engine, rec.session_nbr, TIMER_CKPT)?;

        let acked = read_ranges(&txn, rec.acked)?;
        if covers_prefix(&acked, rec.red_length) {
            log::debug!(
                "Export session {} to engine {} complete",
                rec.session_nbr,
                rec.peer_engine
            );
            rec.state = ExportState::Closed;
            self.post_notice(
                &mut txn,
                &mut wake,
                NoticeRec {
                    kind: KIND_EXPORT_COMPLETE,
                    peer_engine: rec.peer_engine,
                    session_nbr: rec.session_nbr,
                    client_id: rec.client_id,
                    ..Default::default()
                },
            )?;
            self.release_export(&mut txn, &mut ex, sess_addr, &rec)?;
        } else {
            // Retransmit exactly the unclaimed ranges; the last segment
            // out becomes a fresh checkpoint.
            let gaps = gaps_within(&acked, 0, rec.red_length);
            let mut chunks: Vec<(u64, u64)> = Vec::new();
            for gap in &gaps {
                let mut offset = gap.begin;
                while offset < gap.end {
                    let len = (span.config.max_segment_size as u64).min(gap.end - offset);
                    chunks.push((offset, len));
                    offset += len;
                }
            }

            let serial = self.next_serial_nbr();
            let count = chunks.len();
            for (i, (offset, len)) in chunks.into_iter().enumerate() {
                let last = i + 1 == count;
                let mut data = vec![0u8; len as usize];
                self.read_block(&mut txn, rec.svc_data, offset, &mut data)?;
                let eorp = offset + len == rec.red_length;
                let seg = Segment {
                    engine_id: self.engine_id,
                    session_nbr: rec.session_nbr,
                    body: SegmentBody::Data(DataSegment {
                        client_id: rec.client_id,
                        offset,
                        red: true,
                        checkpoint: last,
                        eorp,
                        eob: eorp && rec.red_length == rec.block_length,
                        checkpoint_serial: if last { serial } else { 0 },
                        report_serial: r.serial,
                        data,
                    }),
                };
                span.enqueue(&mut txn, &seg)?;
                if last {
                    rec.ckpt_serial = serial;
                    rec.ckpt_offset = offset;
                    rec.ckpt_length = len;
                }
            }
            wake.span(&span, count);
            log::debug!(
                "Retransmitting {} segments of session {} after report {}",
                count,
                rec.session_nbr,
                r.serial
            );

            self.add_timer(
                &mut txn,
                Self::now() + span.config.expected_rtt,
                rec.peer_engine,
                rec.session_nbr,
                serial,
                TIMER_CKPT,
            )?;
            txn.put(sess_addr, &rec)?;
        }

        drop(ex);
        txn.commit()?;
        wake.fire();
        Ok(())
    }

    fn remove_timer(
        &self,
        txn: &mut Txn,
        peer_engine: u64,
        session_nbr: u64,
        kind: u64,
    ) -> Result<()> {
        let mut elt = txn.list_first(self.timers)?;
        while !elt.is_null() {
            let next = txn.list_next(elt)?;
            let addr = txn.list_data(elt)?;
            let rec: TimerRec = txn.get(addr)?;
            if rec.peer_engine == peer_engine && rec.session_nbr == session_nbr && rec.kind == kind
            {
                txn.free(addr)?;
                txn.list_delete(elt)?;
            }
            elt = next;
        }
        Ok(())
    }

    fn handle_report_ack(&self, segment: &Segment, serial: u64) -> Result<()> {
        let key = (segment.engine_id, segment.session_nbr);
        let mut txn = self.heap.begin();
        let imports = self.imports.lock();
        if !imports.contains_key(&key) {
            log::debug!("Report ack for unknown session {}:{}", key.0, key.1);
            return Ok(());
        }
        let mut elt = txn.list_first(self.timers)?;
        while !elt.is_null() {
            let next = txn.list_next(elt)?;
            let addr = txn.list_data(elt)?;
            let rec: TimerRec = txn.get(addr)?;
            if rec.kind == TIMER_REPORT
                && rec.peer_engine == key.0
                && rec.session_nbr == key.1
                && rec.serial == serial
            {
                txn.free(addr)?;
                txn.list_delete(elt)?;
            }
            elt = next;
        }
        txn.commit()?;
        Ok(())
    }

    fn handle_cancel_by_sender(&self, segment: &Segment, reason: CancelReason) -> Result<()> {
        let span = self.span(segment.engine_id)?;
        let mut wake = Wakeups::default();
        let mut txn = self.heap.begin();

        let ack = Segment {
            engine_id: segment.engine_id,
            session_nbr: segment.session_nbr,
            body: SegmentBody::CancelAckToSender,
        };
        span.enqueue(&mut txn, &ack)?;
        wake.span(&span, 1);

        let key = (segment.engine_id, segment.session_nbr);
        let mut imports = self.imports.lock();
        if let Some(&sess_addr) = imports.get(&key) {
            let rec: ImportSessionRec = txn.get(sess_addr)?;
            self.post_notice(
                &mut txn,
                &mut wake,
                NoticeRec {
                    kind: KIND_IMPORT_CANCELED,
                    peer_engine: key.0,
                    session_nbr: key.1,
                    reason: reason.to_code(),
                    client_id: rec.client_id,
                    ..Default::default()
                },
            )?;
            self.release_import(&mut txn, &mut imports, sess_addr, &rec)?;
            log::info!("Import session {}:{} cancelled by sender", key.0, key.1);
        }

        drop(imports);
        txn.commit()?;
        wake.fire();
        Ok(())
    }

    fn handle_cancel_by_receiver(&self, segment: &Segment, reason: CancelReason) -> Result<()> {
        let found = self.find_export(segment.session_nbr);
        let mut wake = Wakeups::default();
        let mut txn = self.heap.begin();

        let (span, sess_addr) = match found {
            Some(pair) => pair,
            None => {
                log::debug!(
                    "Cancel by receiver for unknown session {}",
                    segment.session_nbr
                );
                return Ok(());
            }
        };

        let ack = Segment {
            engine_id: segment.engine_id,
            session_nbr: segment.session_nbr,
            body: SegmentBody::CancelAckToReceiver,
        };
        span.enqueue(&mut txn, &ack)?;
        wake.span(&span, 1);

        let mut ex = span.export.lock();
        let rec: ExportSessionRec = txn.get(sess_addr)?;
        self.post_notice(
            &mut txn,
            &mut wake,
            NoticeRec {
                kind: KIND_EXPORT_CANCELED,
                peer_engine: rec.peer_engine,
                session_nbr: rec.session_nbr,
                reason: reason.to_code(),
                client_id: rec.client_id,
                ..Default::default()
            },
        )?;
        log::info!(
            "Export session {} cancelled by engine {}",
            rec.session_nbr,
            rec.peer_engine
        );
        self.release_export(&mut txn, &mut ex, sess_addr, &rec)?;

        drop(ex);
        txn.commit()?;
        wake.fire();
        Ok(())
    }

    /// One pass of the retransmission clock; expired timers drive
    /// checkpoint or report retransmission, then cancellation once the
    /// retransmit limit is spent. Runs once per second in the clock task.
    pub fn clock_tick(&self) -> Result<()> {
        let now = Self::now();
        let mut expired = Vec::new();
        {
            let mut txn = self.heap.begin();
            let mut elt = txn.list_first(self.timers)?;
            while !elt.is_null() {
                let next = txn.list_next(elt)?;
                let addr = txn.list_data(elt)?;
                let rec: TimerRec = txn.get(addr)?;
                if rec.deadline <= now {
                    txn.free(addr)?;
                    txn.list_delete(elt)?;
                    expired.push(rec);
                }
                elt = next;
            }
            txn.commit()?;
        }

        for timer in expired {
            if timer.kind == TIMER_CKPT {
                self.checkpoint_expired(&timer)?;
            } else {
                self.report_expired(&timer)?;
            }
        }
        Ok(())
    }

    fn checkpoint_expired(&self, timer: &TimerRec) -> Result<()> {
        let (span, sess_addr) = match self.find_export(timer.session_nbr) {
            Some(pair) => pair,
            None => return Ok(()),
        };

        let mut wake = Wakeups::default();
        let mut txn = self.heap.begin();
        let mut ex = span.export.lock();
        let mut rec: ExportSessionRec = txn.get(sess_addr)?;
        if rec.ckpt_serial != timer.serial {
            // A newer checkpoint superseded this timer.
            return Ok(());
        }

        rec.ckpt_retransmits += 1;
        if rec.ckpt_retransmits <= span.config.max_timeouts {
            log::debug!(
                "Checkpoint {} of session {} timed out, retransmit {}",
                rec.ckpt_serial,
                rec.session_nbr,
                rec.ckpt_retransmits
            );
            let mut data = vec![0u8; rec.ckpt_length as usize];
            self.read_block(&mut txn, rec.svc_data, rec.ckpt_offset, &mut data)?;
            let eorp = rec.ckpt_offset + rec.ckpt_length == rec.red_length;
            let seg = Segment {
                engine_id: self.engine_id,
                session_nbr: rec.session_nbr,
                body: SegmentBody::Data(DataSegment {
                    client_id: rec.client_id,
                    offset: rec.ckpt_offset,
                    red: true,
                    checkpoint: true,
                    eorp,
                    eob: eorp && rec.red_length == rec.block_length,
                    checkpoint_serial: rec.ckpt_serial,
                    report_serial: 0,
                    data,
                }),
            };
            span.enqueue(&mut txn, &seg)?;
            wake.span(&span, 1);
            self.add_timer(
                &mut txn,
                Self::now() + span.config.expected_rtt,
                rec.peer_engine,
                rec.session_nbr,
                rec.ckpt_serial,
                TIMER_CKPT,
            )?;
            txn.put(sess_addr, &rec)?;
        } else {
            log::warn!(
                "Session {} to engine {} exhausted retransmits, cancelling",
                rec.session_nbr,
                rec.peer_engine
            );
            let cancel = Segment {
                engine_id: self.engine_id,
                session_nbr: rec.session_nbr,
                body: SegmentBody::CancelBySender(CancelReason::RetransmitLimit),
            };
            span.enqueue(&mut txn, &cancel)?;
            wake.span(&span, 1);
            rec.state = ExportState::Cancelled;
            self.post_notice(
                &mut txn,
                &mut wake,
                NoticeRec {
                    kind: KIND_EXPORT_CANCELED,
                    peer_engine: rec.peer_engine,
                    session_nbr: rec.session_nbr,
                    reason: CancelReason::RetransmitLimit.to_code(),
                    client_id: rec.client_id,
                    ..Default::default()
                },
            )?;
            self.release_export(&mut txn, &mut ex, sess_addr, &rec)?;
        }

        drop(ex);
        txn.commit()?;
        wake.fire();
        Ok(())
    }

    fn report_expired(&self, timer: &TimerRec) -> Result<()> {
        let key = (timer.peer_engine, timer.session_nbr);
        let span = self.span(timer.peer_engine)?;
        let mut wake = Wakeups::default();
        let mut txn = self.heap.begin();
        let mut imports = self.imports.lock();

        let sess_addr = match imports.get(&key) {
            Some(&addr) => addr,
            None => return Ok(()),
        };
        let mut rec: ImportSessionRec = txn.get(sess_addr)?;
        if rec.rpt_serial != timer.serial {
            return Ok(());
        }

        rec.rpt_retransmits += 1;
        if rec.rpt_retransmits <= span.config.max_timeouts {
            log::debug!(
                "Report {} of session {}:{} unacknowledged, retransmit {}",
                rec.rpt_serial,
                key.0,
                key.1,
                rec.rpt_retransmits
            );
            self.emit_report(&mut txn, &span, &rec, &mut wake)?;
            txn.put(sess_addr, &rec)?;
        } else {
            log::warn!(
                "Import session {}:{} exhausted report retransmits, cancelling",
                key.0,
                key.1
            );
            let cancel = Segment {
                engine_id: key.0,
                session_nbr: key.1,
                body: SegmentBody::CancelByReceiver(CancelReason::RetransmitLimit),
            };
            span.enqueue(&mut txn, &cancel)?;
            wake.span(&span, 1);
            self.post_notice(
                &mut txn,
                &mut wake,
                NoticeRec {
                    kind: KIND_IMPORT_CANCELED,
                    peer_engine: key.0,
                    session_nbr: key.1,
                    reason: CancelReason::RetransmitLimit.to_code(),
                    client_id: rec.client_id,
                    ..Default::default()
                },
            )?;
            self.release_import(&mut txn, &mut imports, sess_addr, &rec)?;
        }

        drop(imports);
        txn.commit()?;
        wake.fire();
        Ok(())
    }

    /// Start the retransmission clock and the per-span aggregation meters.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let engine = self.clone();
        let clock = self.ipc.tasks.spawn_fn("ltpclock", move |args| {
            while !args.stop_requested() && engine.running.load(Ordering::Relaxed) {
                std::thread::sleep(std::time::Duration::from_secs(1));
                if let Err(e) = engine.clock_tick() {
                    log::error!("LTP clock tick failed: {}", e);
                }
            }
        })?;
        self.tasks.lock().push(clock);

        let peers: Vec<u64> = self.spans.lock().keys().copied().collect();
        for peer in peers {
            let engine = self.clone();
            let interval = self.span(peer)?.config.aggregation_time_limit.max(1);
            let meter = self.ipc.tasks.spawn_fn("ltpmeter", move |args| {
                while !args.stop_requested() && engine.running.load(Ordering::Relaxed) {
                    std::thread::sleep(std::time::Duration::from_secs(interval));
                    if let Err(e) = engine.seal_filling(peer) {
                        log::error!("LTP meter for engine {} failed: {}", peer, e);
                    }
                }
            })?;
            self.tasks.lock().push(meter);
        }
        Ok(())
    }

    /// Rewind every pending timer to the epoch so the next clock tick
    /// fires it immediately.
    #[cfg(test)]
    pub(crate) fn rewind_timers_for_test(&self) {
        let mut txn = self.heap.begin();
        let mut elt = txn.list_first(self.timers).unwrap();
        while !elt.is_null() {
            let addr = txn.list_data(elt).unwrap();
            let mut rec: TimerRec = txn.get(addr).unwrap();
            rec.deadline = 0;
            txn.put(addr, &rec).unwrap();
            elt = txn.list_next(elt).unwrap();
        }
        txn.commit().unwrap();
    }

    /// Stop the engine: end every client, stop every span, and wind down
    /// the clock and meter tasks.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        for span in self.spans.lock().values() {
            span.stop();
        }
        for client in self.clients.lock().values() {
            client.sem.end();
        }
        let tasks: Vec<TaskId> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            self.ipc.tasks.kill(task, 15);
            self.ipc.tasks.join(task);
        }
        log::info!("LTP engine {} stopped", self.engine_id);
    }
}
