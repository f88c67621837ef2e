//! Licklider Transmission Protocol.
//!
//! Reliable (red) and best-effort (green) block transfer over a single
//! high-latency hop. The sender cuts a block into data segments and awaits
//! reception reports solicited by checkpoints; the receiver reassembles
//! the red part, reporting its gaps, until the block is complete or one
//! side exhausts its retransmission budget and cancels.

mod engine;
mod segment;
mod session;
mod span;
pub mod udplso;

#[cfg(feature = "pmq")]
pub mod pmq;

pub use engine::{Engine, LtpNotice};
pub use segment::{
    CancelReason, Claim, DataSegment, ReportSegment, Segment, SegmentBody,
};
pub use session::ExportState;
pub use span::{OutboundSegment, Span, SpanConfig};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::Ipc;
    use crate::store::Heap;
    use crate::zco::{self, ZcoMedium, ZcoReader};
    use std::sync::Arc;

    const CLIENT: u64 = 1;

    /// Two engines joined back-to-back: every segment one queues is
    /// carried to the other by `carry`, with optional loss.
    struct Bench {
        heap: Arc<Heap>,
        sender: Arc<Engine>,
        receiver: Arc<Engine>,
        _dir: tempfile::TempDir,
    }

    fn bench(max_segment_size: usize, aggr: u64) -> Bench {
        crate::tests::init();
        let dir = tempfile::tempdir().unwrap();
        let heap = Arc::new(Heap::create(dir.path().join("ltp.heap"), 4 << 20).unwrap());
        let ipc = Ipc::new();

        let sender = Engine::new(heap.clone(), ipc.clone(), 10).unwrap();
        let receiver = Engine::new(heap.clone(), ipc.clone(), 20).unwrap();
        sender
            .add_span(
                SpanConfig::builder()
                    .peer_engine(20)
                    .max_segment_size(max_segment_size)
                    .aggregation_size_limit(aggr)
                    .build(),
            )
            .unwrap();
        receiver
            .add_span(
                SpanConfig::builder()
                    .peer_engine(10)
                    .max_segment_size(max_segment_size)
                    .build(),
            )
            .unwrap();
        sender.open_client(CLIENT).unwrap();
        receiver.open_client(CLIENT).unwrap();
        Bench {
            heap,
            sender,
            receiver,
            _dir: dir,
        }
    }

    /// Move every queued segment from `from` to `to`, dropping the ones
    /// whose index is in `drop`. Returns how many were carried.
    fn carry(b: &Bench, from: &Arc<Engine>, to: &Arc<Engine>, peer: u64, drop: &[usize]) -> usize {
        let span = from.span(peer).unwrap();
        let mut carried = 0;
        let mut index = 0;
        loop {
            span.interrupt();
            match span.dequeue_outbound_segment(&b.heap).unwrap() {
                OutboundSegment::Segment(wire) => {
                    if !drop.contains(&index) {
                        to.handle_segment(&wire).unwrap();
                        carried += 1;
                    }
                    index += 1;
                }
                OutboundSegment::Interrupted => break,
                OutboundSegment::Stopped => break,
            }
        }
        carried
    }

    fn heap_zco(heap: &Heap, data: &[u8]) -> zco::Zco {
        let mut txn = heap.begin();
        let array = txn.put_bytes(data).unwrap();
        let z = zco::create(&mut txn).unwrap();
        zco::append_extent(&mut txn, z, ZcoMedium::Heap, array, 0, data.len() as u64).unwrap();
        txn.commit().unwrap();
        z
    }

    fn read_all(heap: &Heap, z: zco::Zco, len: u64) -> Vec<u8> {
        let mut txn = heap.begin();
        let mut out = vec![0u8; len as usize];
        let mut reader = ZcoReader::new(z);
        assert_eq!(
            reader.receive_source(&mut txn, len, Some(&mut out)).unwrap(),
            len
        );
        zco::destroy(&mut txn, z).unwrap();
        txn.commit().unwrap();
        out
    }

    #[test]
    fn test_red_block_clean_delivery() {
        let b = bench(500, 100_000);
        let payload: Vec<u8> = (0..1500u32).map(|i| i as u8).collect();
        let z = heap_zco(&b.heap, &payload);
        b.sender.send(20, CLIENT, z, u64::MAX).unwrap();
        b.sender.seal_filling(20).unwrap();

        carry(&b, &b.sender, &b.receiver, 20, &[]);
        match b.receiver.get_notice(CLIENT).unwrap().unwrap() {
            LtpNotice::RecvRedPart { data, length, .. } => {
                assert_eq!(length, 1500);
                assert_eq!(read_all(&b.heap, data, length), payload);
            }
            other => panic!("Unexpected notice {:?}", other),
        }

        // Report travels back; sender learns the session is complete.
        carry(&b, &b.receiver, &b.sender, 10, &[]);
        match b.sender.get_notice(CLIENT).unwrap().unwrap() {
            LtpNotice::ExportSessionComplete { peer_engine, .. } => {
                assert_eq!(peer_engine, 20);
            }
            other => panic!("Unexpected notice {:?}", other),
        }
    }

    #[test]
    fn test_red_block_loss_and_selective_retransmission() {
        let b = bench(500, 100_000);
        let payload: Vec<u8> = (0..1500u32).map(|i| (i * 7) as u8).collect();
        let z = heap_zco(&b.heap, &payload);
        b.sender.send(20, CLIENT, z, u64::MAX).unwrap();
        b.sender.seal_filling(20).unwrap();

        // Drop the middle segment [500, 1000).
        carry(&b, &b.sender, &b.receiver, 20, &[1]);

        // The receiver saw the checkpoint and reported gap [500, 1000).
        carry(&b, &b.receiver, &b.sender, 10, &[]);

        // Exactly one retransmitted data segment (the gap), as a fresh
        // checkpoint, plus the report ack.
        let sent = carry(&b, &b.sender, &b.receiver, 20, &[]);
        assert_eq!(sent, 2);

        match b.receiver.get_notice(CLIENT).unwrap().unwrap() {
            LtpNotice::RecvRedPart { data, length, .. } => {
                assert_eq!(length, 1500);
                assert_eq!(read_all(&b.heap, data, length), payload);
            }
            other => panic!("Unexpected notice {:?}", other),
        }

        // Final report closes the export session.
        carry(&b, &b.receiver, &b.sender, 10, &[]);
        match b.sender.get_notice(CLIENT).unwrap().unwrap() {
            LtpNotice::ExportSessionComplete { .. } => {}
            other => panic!("Unexpected notice {:?}", other),
        }
    }

    #[test]
    fn test_green_data_delivered_without_reports() {
        let b = bench(500, 100_000);
        let payload = vec![0x5A; 800];
        let z = heap_zco(&b.heap, &payload);
        b.sender.send(20, CLIENT, z, 0).unwrap();

        // All-green blocks seal immediately and complete locally.
        match b.sender.get_notice(CLIENT).unwrap().unwrap() {
            LtpNotice::ExportSessionComplete { .. } => {}
            other => panic!("Unexpected notice {:?}", other),
        }

        carry(&b, &b.sender, &b.receiver, 20, &[]);
        let mut received = 0u64;
        let mut saw_eob = false;
        for _ in 0..2 {
            match b.receiver.get_notice(CLIENT).unwrap().unwrap() {
                LtpNotice::RecvGreenSegment {
                    data, length, eob, ..
                } => {
                    received += length;
                    saw_eob |= eob;
                    let bytes = read_all(&b.heap, data, length);
                    assert!(bytes.iter().all(|&x| x == 0x5A));
                }
                other => panic!("Unexpected notice {:?}", other),
            }
        }
        assert_eq!(received, 800);
        assert!(saw_eob);
        // No report should be queued by the receiver.
        let span = b.receiver.span(10).unwrap();
        span.interrupt();
        assert_eq!(
            span.dequeue_outbound_segment(&b.heap).unwrap(),
            OutboundSegment::Interrupted
        );
    }

    #[test]
    fn test_checkpoint_timeout_cancels_session() {
        let b = bench(500, 100_000);
        let payload = vec![1u8; 600];
        let z = heap_zco(&b.heap, &payload);
        b.sender.send(20, CLIENT, z, u64::MAX).unwrap();
        b.sender.seal_filling(20).unwrap();

        // Never deliver anything; expire the checkpoint timer past the
        // retransmit limit.
        let span = b.sender.span(20).unwrap();
        let max = span.config().max_timeouts;
        for _ in 0..=max {
            // Each tick with an already-expired deadline retransmits once.
            force_expire_timers(&b);
            b.sender.clock_tick().unwrap();
        }

        match b.sender.get_notice(CLIENT).unwrap().unwrap() {
            LtpNotice::ExportSessionCanceled { reason, .. } => {
                assert_eq!(reason, CancelReason::RetransmitLimit);
            }
            other => panic!("Unexpected notice {:?}", other),
        }
    }

    /// Rewrite every timer deadline to the past so the next clock tick
    /// fires it.
    fn force_expire_timers(b: &Bench) {
        b.sender.rewind_timers_for_test();
    }

    #[test]
    fn test_cancel_by_receiver_reaches_sender_client() {
        let b = bench(500, 100_000);
        let payload = vec![2u8; 600];
        let z = heap_zco(&b.heap, &payload);
        let session = b.sender.send(20, CLIENT, z, u64::MAX).unwrap();
        b.sender.seal_filling(20).unwrap();

        let cancel = Segment {
            engine_id: b.sender.engine_id(),
            session_nbr: session,
            body: SegmentBody::CancelByReceiver(CancelReason::UserCancelled),
        };
        b.sender.handle_segment(&cancel.encode()).unwrap();

        match b.sender.get_notice(CLIENT).unwrap().unwrap() {
            LtpNotice::ExportSessionCanceled { reason, .. } => {
                assert_eq!(reason, CancelReason::UserCancelled);
            }
            other => panic!("Unexpected notice {:?}", other),
        }
    }
}
