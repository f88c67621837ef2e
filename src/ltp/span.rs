use super::segment::Segment;
use crate::ipc::{Ipc, Sem, SemDiscipline, SemTake, SM_NO_KEY};
use crate::store::{Addr, Heap, Txn};
use crate::tools::error::{DtnError, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use typed_builder::TypedBuilder;

/// Per-peer transmission parameters.
#[derive(Clone, Debug, Deserialize, TypedBuilder)]
pub struct SpanConfig {
    /// Engine id of the peer at the far end of the link
    pub peer_engine: u64,
    /// Largest data-segment payload emitted to this peer
    #[builder(default = 1400)]
    #[serde(default = "default_segment_size")]
    pub max_segment_size: usize,
    /// Block aggregation threshold: a filling session is sealed once its
    /// accumulated service data reaches this size
    #[builder(default = 4096)]
    #[serde(default = "default_aggr_size")]
    pub aggregation_size_limit: u64,
    /// Seal a non-empty filling session after this many seconds even if
    /// the size threshold was not reached
    #[builder(default = 1)]
    #[serde(default = "default_aggr_time")]
    pub aggregation_time_limit: u64,
    /// Concurrent export session limit
    #[builder(default = 8)]
    #[serde(default = "default_sessions")]
    pub max_export_sessions: usize,
    /// Concurrent import session limit
    #[builder(default = 8)]
    #[serde(default = "default_sessions")]
    pub max_import_sessions: usize,
    /// Largest block the peer will accept
    #[builder(default = 100_000_000)]
    #[serde(default = "default_block_size")]
    pub remote_max_block_size: u64,
    /// Expected round-trip time to the peer, in seconds; drives checkpoint
    /// and report retransmission timers
    #[builder(default = 2)]
    #[serde(default = "default_rtt")]
    pub expected_rtt: u64,
    /// Retransmissions tolerated before a session is cancelled with
    /// a retransmit-limit reason
    #[builder(default = 5)]
    #[serde(default = "default_timeouts")]
    pub max_timeouts: u64,
    /// Link service output command, e.g. `"udp 127.0.0.1:5501 1000000"`
    #[builder(default)]
    #[serde(default)]
    pub lso_cmd: String,
}

fn default_segment_size() -> usize {
    1400
}
fn default_aggr_size() -> u64 {
    4096
}
fn default_aggr_time() -> u64 {
    1
}
fn default_sessions() -> usize {
    8
}
fn default_block_size() -> u64 {
    100_000_000
}
fn default_rtt() -> u64 {
    2
}
fn default_timeouts() -> u64 {
    5
}

/// Outcome of [`Span::dequeue_outbound_segment`].
#[derive(Debug, PartialEq, Eq)]
pub enum OutboundSegment {
    /// An encoded segment ready for the link
    Segment(Vec<u8>),
    /// Woken without a segment; check for shutdown and retry
    Interrupted,
    /// The span has been stopped
    Stopped,
}

pub(crate) struct ExportIndex {
    /// Session currently accepting service data, if any
    pub filling: Option<Addr>,
    /// All live export sessions by session number
    pub sessions: HashMap<u64, Addr>,
}

/// Per-peer LTP state: configuration, the outbound segment FIFO, and the
/// index of live export sessions.
pub struct Span {
    pub(crate) config: SpanConfig,
    seg_sem: Sem,
    /// Heap FIFO of encoded segments awaiting the link service
    pub(crate) segments: Addr,
    pub(crate) export: Mutex<ExportIndex>,
}

impl std::fmt::Debug for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Span(peer={})", self.config.peer_engine)
    }
}

impl Span {
    pub(crate) fn new(txn: &mut Txn, ipc: &Ipc, config: SpanConfig) -> Result<Span> {
        let segments = txn.list_create()?;
        Ok(Span {
            config,
            seg_sem: ipc.sems.create(SM_NO_KEY, SemDiscipline::Fifo),
            segments,
            export: Mutex::new(ExportIndex {
                filling: None,
                sessions: HashMap::new(),
            }),
        })
    }

    /// Peer engine id this span leads to.
    pub fn peer_engine(&self) -> u64 {
        self.config.peer_engine
    }

    /// Span configuration.
    pub fn config(&self) -> &SpanConfig {
        &self.config
    }

    /// Encode `segment` onto the outbound FIFO. The caller signals the
    /// link service with [`Span::signal_segments`] after committing.
    pub(crate) fn enqueue(&self, txn: &mut Txn, segment: &Segment) -> Result<()> {
        let wire = segment.encode();
        if wire.len() > self.config.max_segment_size + 64 {
            // Data payloads are cut to max_segment_size upstream; anything
            // bigger than that plus worst-case framing is a logic error.
            return Err(DtnError::new(format!(
                "Segment of {} bytes exceeds span limit {}",
                wire.len(),
                self.config.max_segment_size
            )));
        }
        let blob = txn.put_blob(&wire)?;
        txn.list_insert_last(self.segments, blob)?;
        Ok(())
    }

    /// Wake the link service for `n` newly committed segments.
    pub(crate) fn signal_segments(&self, n: usize) {
        for _ in 0..n {
            self.seg_sem.give();
        }
    }

    /// Wake any blocked link service with an interruption indication.
    pub fn interrupt(&self) {
        self.seg_sem.give();
    }

    /// Permanently stop this span's outbound path; every blocked and
    /// future dequeue returns [`OutboundSegment::Stopped`].
    pub fn stop(&self) {
        self.seg_sem.end();
    }

    /// Block until a segment is ready for the link, the span is
    /// interrupted, or it is stopped.
    pub fn dequeue_outbound_segment(&self, heap: &Heap) -> Result<OutboundSegment> {
        match self.seg_sem.take() {
            SemTake::Ended => return Ok(OutboundSegment::Stopped),
            SemTake::TimedOut | SemTake::Taken => {}
        }

        let mut txn = heap.begin();
        let blob = txn.list_pop_first(self.segments)?;
        if blob.is_null() {
            txn.cancel();
            return Ok(OutboundSegment::Interrupted);
        }
        let wire = txn.get_blob(blob)?;
        txn.free(blob)?;
        txn.commit()?;
        Ok(OutboundSegment::Segment(wire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ltp::segment::SegmentBody;
    use crate::store::Heap;

    #[test]
    fn test_fifo_order_and_stop() {
        crate::tests::init();
        let dir = tempfile::tempdir().unwrap();
        let heap = Heap::create(dir.path().join("span.heap"), 1 << 20).unwrap();
        let ipc = Ipc::new();
        let config = SpanConfig::builder().peer_engine(2).build();

        let mut txn = heap.begin();
        let span = Span::new(&mut txn, &ipc, config).unwrap();
        let a = Segment {
            engine_id: 1,
            session_nbr: 1,
            body: SegmentBody::ReportAck { serial: 1 },
        };
        let b = Segment {
            engine_id: 1,
            session_nbr: 1,
            body: SegmentBody::ReportAck { serial: 2 },
        };
        span.enqueue(&mut txn, &a).unwrap();
        span.enqueue(&mut txn, &b).unwrap();
        txn.commit().unwrap();
        span.signal_segments(2);

        assert_eq!(
            span.dequeue_outbound_segment(&heap).unwrap(),
            OutboundSegment::Segment(a.encode())
        );
        assert_eq!(
            span.dequeue_outbound_segment(&heap).unwrap(),
            OutboundSegment::Segment(b.encode())
        );

        span.interrupt();
        assert_eq!(
            span.dequeue_outbound_segment(&heap).unwrap(),
            OutboundSegment::Interrupted
        );

        span.stop();
        assert_eq!(
            span.dequeue_outbound_segment(&heap).unwrap(),
            OutboundSegment::Stopped
        );
    }
}
