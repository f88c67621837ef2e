//! Bundle Protocol (version 6).
//!
//! Store-and-forward message delivery: admission, class-of-service
//! queueing, plan/group/rule forwarding, custody transfer, endpoint
//! delivery, status reporting, and convergence-layer handoff over STCP
//! and LTP.

pub mod acquire;
mod bundle;
mod cos;
mod eid;
pub mod ltpcl;
mod node;
mod pool;
mod report;
mod routes;
pub mod stcp;

pub use bundle::{
    BundleRec, ParsedBundle, BP_CUSTODY_RPT, BP_DELETED_RPT, BP_DELIVERED_RPT, BP_FORWARDED_RPT,
    BP_RECEIVED_RPT, BP_VERSION,
};
pub use cos::{
    parse_class_of_service, ClassOfService, CustodySwitch, ExtendedCos, ECOS_BEST_EFFORT,
    ECOS_FLOW_LABEL_PRESENT, ECOS_MINIMUM_LATENCY, MAX_ORDINAL,
};
pub use eid::Eid;
pub use node::{
    BpDelivery, BpIndication, BpNode, BpTimeout, DequeuedBundle, NodeConfig, Outduct,
    OutductConfig, PlanConfig, Sap,
};
pub use pool::LruPool;
pub use report::{AdminRecord, CustodySignal, StatusReport, REASON_EXPIRED, REASON_NONE};
pub use routes::{DirectiveSet, Routes, Stream, StreamLog, ALL_OTHERS};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::Ipc;
    use crate::store::Heap;
    use crate::zco::{self, ZcoMedium, ZcoReader};
    use std::sync::Arc;

    fn loopback_node() -> (tempfile::TempDir, Arc<BpNode>) {
        crate::tests::init();
        let dir = tempfile::tempdir().unwrap();
        let heap = Arc::new(Heap::create(dir.path().join("bp.heap"), 4 << 20).unwrap());
        let node = BpNode::create(
            heap,
            Ipc::new(),
            &NodeConfig::builder()
                .node_nbr(5)
                .endpoints(vec![1, 2])
                .build(),
        )
        .unwrap();
        node.start().unwrap();
        (dir, node)
    }

    fn heap_payload(node: &BpNode, data: &[u8]) -> zco::Zco {
        let mut txn = node.heap().begin();
        let array = txn.put_bytes(data).unwrap();
        let z = zco::create(&mut txn).unwrap();
        zco::append_extent(&mut txn, z, ZcoMedium::Heap, array, 0, data.len() as u64).unwrap();
        txn.commit().unwrap();
        z
    }

    fn read_payload(node: &BpNode, delivery: &BpDelivery) -> Vec<u8> {
        let mut txn = node.heap().begin();
        let mut out = vec![0u8; delivery.payload_length as usize];
        let mut reader = ZcoReader::new(delivery.adu.unwrap());
        assert_eq!(
            reader
                .transmit(&mut txn, delivery.payload_length, Some(&mut out))
                .unwrap(),
            delivery.payload_length
        );
        txn.commit().unwrap();
        out
    }

    #[test]
    fn test_loopback_delivery() {
        let (_dir, node) = loopback_node();
        let sap = node.open("ipn:5.1").unwrap();

        let payload = heap_payload(&node, b"hello");
        let cos = parse_class_of_service("0.1.0").unwrap();
        node.send(Some(&sap), "ipn:5.1", None, 300, &cos, 0, false, payload)
            .unwrap();

        let delivery = node.receive(&sap, BpTimeout::Blocking).unwrap();
        assert_eq!(delivery.result, BpIndication::PayloadPresent);
        assert_eq!(delivery.payload_length, 5);
        assert_eq!(delivery.source, Eid::ipn(5, 1));
        assert_eq!(read_payload(&node, &delivery), b"hello");
        node.release_delivery(delivery).unwrap();
        node.shutdown();
    }

    #[test]
    fn test_receive_poll_and_timeout() {
        let (_dir, node) = loopback_node();
        let sap = node.open("ipn:5.2").unwrap();

        let delivery = node.receive(&sap, BpTimeout::Poll).unwrap();
        assert_eq!(delivery.result, BpIndication::ReceptionTimedOut);

        let started = std::time::Instant::now();
        let delivery = node.receive(&sap, BpTimeout::Seconds(2)).unwrap();
        let waited = started.elapsed();
        assert_eq!(delivery.result, BpIndication::ReceptionTimedOut);
        assert!(waited >= std::time::Duration::from_secs(2));
        assert!(waited <= std::time::Duration::from_secs(3));
        node.shutdown();
    }

    #[test]
    fn test_receive_interrupted() {
        let (_dir, node) = loopback_node();
        let sap = node.open("ipn:5.1").unwrap();
        node.interrupt(&sap);
        let delivery = node.receive(&sap, BpTimeout::Seconds(5)).unwrap();
        assert_eq!(delivery.result, BpIndication::ReceptionInterrupted);
        node.shutdown();
    }

    #[test]
    fn test_endpoint_single_owner() {
        let (_dir, node) = loopback_node();
        let _sap = node.open("ipn:5.1").unwrap();

        // Another live task cannot open the same endpoint.
        let node2 = node.clone();
        let handle = std::thread::spawn(move || node2.open("ipn:5.1").is_err());
        assert!(handle.join().unwrap());
        node.shutdown();
    }

    #[test]
    fn test_send_validation() {
        let (_dir, node) = loopback_node();
        let sap = node.open("ipn:5.1").unwrap();

        let payload = heap_payload(&node, b"x");
        let mut cos = ClassOfService::default();
        cos.priority = 3;
        assert!(node
            .send(Some(&sap), "ipn:5.1", None, 300, &cos, 0, false, payload)
            .is_err());

        let payload = heap_payload(&node, b"x");
        let cos = ClassOfService::default();
        assert!(node
            .send(Some(&sap), "garbage", None, 300, &cos, 0, false, payload)
            .is_err());
        node.shutdown();
    }

    #[test]
    fn test_reserved_ordinal_demoted_on_send() {
        let (_dir, node) = loopback_node();
        let sap = node.open("ipn:5.1").unwrap();

        let payload = heap_payload(&node, b"ordinal probe");
        let cos = parse_class_of_service("1.1.255").unwrap();
        let bundle = node
            .send(Some(&sap), "ipn:5.2", None, 300, &cos, 0, false, payload)
            .unwrap();

        let txn = node.heap().begin();
        let rec: BundleRec = txn.get(bundle).unwrap();
        assert_eq!(rec.ecos.ordinal, 254);
        drop(txn);
        node.shutdown();
    }

    #[test]
    fn test_suspend_refused_for_minimum_latency() {
        let (_dir, node) = loopback_node();
        let sap = node.open("ipn:5.1").unwrap();
        node.add_outduct(
            &OutductConfig::builder()
                .name("stcp/c".to_owned())
                .protocol("stcp".to_owned())
                .peer("127.0.0.1:1".to_owned())
                .build(),
        )
        .unwrap();
        {
            let mut txn = node.heap().begin();
            node.routes()
                .add_plan(
                    &mut txn,
                    9,
                    0,
                    &DirectiveSet {
                        default_duct: "stcp/c".to_owned(),
                        ..Default::default()
                    },
                )
                .unwrap();
            txn.commit().unwrap();
        }

        let payload = heap_payload(&node, b"critical");
        let cos = parse_class_of_service("0.1.5.0.1").unwrap();
        assert!(cos.ecos.minimum_latency());
        let bundle = node
            .send(Some(&sap), "ipn:9.1", None, 300, &cos, 0, false, payload)
            .unwrap();

        wait_until(|| {
            let txn = node.heap().begin();
            let rec: BundleRec = txn.get(bundle).unwrap();
            !rec.duct_xmit_elt.is_null()
        });

        // Suspension is refused silently: still queued, not in limbo.
        node.suspend(bundle).unwrap();
        assert!(!node.in_limbo(bundle).unwrap());

        let txn = node.heap().begin();
        let rec: BundleRec = txn.get(bundle).unwrap();
        assert!(!rec.suspended);
        assert!(!rec.duct_xmit_elt.is_null());
        drop(txn);
        node.shutdown();
    }

    #[test]
    fn test_unroutable_goes_to_limbo_and_reforwards() {
        let (_dir, node) = loopback_node();
        let sap = node.open("ipn:5.1").unwrap();

        let payload = heap_payload(&node, b"wanderer");
        let cos = ClassOfService::default();
        let bundle = node
            .send(Some(&sap), "ipn:9.1", None, 300, &cos, 0, false, payload)
            .unwrap();

        // The forwarder finds no plan and parks the bundle in limbo.
        wait_until(|| node.in_limbo(bundle).unwrap());

        // Add a route and an outduct, then reforward: the bundle lands
        // on the duct queue.
        let duct = node
            .add_outduct(
                &OutductConfig::builder()
                    .name("stcp/peer".to_owned())
                    .protocol("stcp".to_owned())
                    .peer("127.0.0.1:1".to_owned())
                    .build(),
            )
            .unwrap();
        {
            let mut txn = node.heap().begin();
            node.routes()
                .add_plan(
                    &mut txn,
                    9,
                    0,
                    &DirectiveSet {
                        default_duct: "stcp/peer".to_owned(),
                        ..Default::default()
                    },
                )
                .unwrap();
            txn.commit().unwrap();
        }
        node.reforward_limbo().unwrap();

        wait_until(|| !node.in_limbo(bundle).unwrap());
        match duct.dequeue(node.heap()).unwrap() {
            DequeuedBundle::Bundle(addr) => assert_eq!(addr, bundle),
            other => panic!("Unexpected dequeue {:?}", other),
        }
        node.shutdown();
    }

    #[test]
    fn test_expedited_queue_ordered_by_ordinal() {
        let (_dir, node) = loopback_node();
        let sap = node.open("ipn:5.1").unwrap();
        let duct = node
            .add_outduct(
                &OutductConfig::builder()
                    .name("stcp/x".to_owned())
                    .protocol("stcp".to_owned())
                    .peer("127.0.0.1:1".to_owned())
                    .build(),
            )
            .unwrap();
        {
            let mut txn = node.heap().begin();
            node.routes()
                .add_plan(
                    &mut txn,
                    9,
                    0,
                    &DirectiveSet {
                        default_duct: "stcp/x".to_owned(),
                        ..Default::default()
                    },
                )
                .unwrap();
            txn.commit().unwrap();
        }

        let mut bundles = Vec::new();
        for ordinal in [1u8, 200, 100] {
            let payload = heap_payload(&node, b"ordered");
            let cos = parse_class_of_service(&format!("0.2.{}", ordinal)).unwrap();
            bundles.push(
                node.send(Some(&sap), "ipn:9.1", None, 300, &cos, 0, false, payload)
                    .unwrap(),
            );
        }

        // All three queued: dequeue order is by descending ordinal.
        wait_until(|| {
            let txn = node.heap().begin();
            let rec: BundleRec = txn.get(bundles[2]).unwrap();
            !rec.duct_xmit_elt.is_null()
        });
        let mut order = Vec::new();
        for _ in 0..3 {
            match duct.dequeue(node.heap()).unwrap() {
                DequeuedBundle::Bundle(addr) => order.push(addr),
                other => panic!("Unexpected dequeue {:?}", other),
            }
        }
        assert_eq!(order, vec![bundles[1], bundles[2], bundles[0]]);
        node.shutdown();
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("Condition not reached in time");
    }
}
