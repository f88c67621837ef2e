mod tests {
    use dtn::bp::{
        self, BpIndication, BpNode, BpTimeout, DirectiveSet, NodeConfig, OutductConfig, PlanConfig,
    };
    use dtn::ipc::Ipc;
    use dtn::ltp;
    use dtn::store::Heap;
    use dtn::zco::{self, ZcoMedium, ZcoReader};
    use std::io::Write;
    use std::sync::Arc;

    pub fn init() {
        std::env::set_var("RUST_LOG", "debug");
        env_logger::builder().is_test(true).try_init().ok();
    }

    fn make_node(dir: &std::path::Path, file: &str, config: &NodeConfig) -> (Arc<Heap>, Arc<BpNode>) {
        let heap = Arc::new(Heap::create(dir.join(file), 8 << 20).unwrap());
        let node = BpNode::create(heap.clone(), Ipc::new(), config).unwrap();
        node.start().unwrap();
        (heap, node)
    }

    fn heap_payload(heap: &Heap, data: &[u8]) -> zco::Zco {
        let mut txn = heap.begin();
        let array = txn.put_bytes(data).unwrap();
        let z = zco::create(&mut txn).unwrap();
        zco::append_extent(&mut txn, z, ZcoMedium::Heap, array, 0, data.len() as u64).unwrap();
        txn.commit().unwrap();
        z
    }

    fn read_delivery(heap: &Heap, node: &BpNode, delivery: bp::BpDelivery) -> Vec<u8> {
        let mut out = vec![0u8; delivery.payload_length as usize];
        {
            let mut txn = heap.begin();
            let mut reader = ZcoReader::new(delivery.adu.unwrap());
            assert_eq!(
                reader
                    .transmit(&mut txn, delivery.payload_length, Some(&mut out))
                    .unwrap(),
                delivery.payload_length
            );
            txn.commit().unwrap();
        }
        node.release_delivery(delivery).unwrap();
        out
    }

    #[test]
    fn test_stcp_end_to_end() {
        init();
        let dir = tempfile::tempdir().unwrap();

        // Receiving node ipn:7 with an STCP listener.
        let (heap_b, node_b) = make_node(
            dir.path(),
            "b.heap",
            &NodeConfig::builder().node_nbr(7).endpoints(vec![1]).build(),
        );
        let cli = Arc::new(bp::stcp::StcpCli::new("127.0.0.1:0").unwrap());
        let listen_addr = cli.local_addr().unwrap();
        bp::stcp::spawn_cli(node_b.clone(), cli.clone()).unwrap();
        let sap_b = node_b.open("ipn:7.1").unwrap();

        // Sending node ipn:5 with a duct and plan toward node 7.
        let (heap_a, node_a) = make_node(
            dir.path(),
            "a.heap",
            &NodeConfig::builder()
                .node_nbr(5)
                .endpoints(vec![1])
                .outducts(vec![OutductConfig::builder()
                    .name("stcp/7".to_owned())
                    .protocol("stcp".to_owned())
                    .peer(listen_addr.to_string())
                    .build()])
                .plans(vec![PlanConfig::builder()
                    .node_nbr(7)
                    .default_duct("stcp/7".to_owned())
                    .build()])
                .build(),
        );
        let pool = Arc::new(bp::stcp::StcpSenderPool::new());
        let duct = node_a.outduct("stcp/7").unwrap();
        bp::stcp::spawn_clo(node_a.clone(), duct, pool.clone()).unwrap();

        let sap_a = node_a.open("ipn:5.1").unwrap();
        let payload = heap_payload(&heap_a, b"across the link");
        let cos = bp::parse_class_of_service("0.1.0").unwrap();
        node_a
            .send(Some(&sap_a), "ipn:7.1", None, 300, &cos, 0, false, payload)
            .unwrap();

        let delivery = node_b.receive(&sap_b, BpTimeout::Seconds(10)).unwrap();
        assert_eq!(delivery.result, BpIndication::PayloadPresent);
        assert_eq!(delivery.source, bp::Eid::ipn(5, 1));
        assert_eq!(read_delivery(&heap_b, &node_b, delivery), b"across the link");

        cli.wakeup();
        node_a.shutdown();
        node_b.shutdown();
    }

    #[test]
    fn test_file_extent_with_unlink_cleanup() {
        init();
        let dir = tempfile::tempdir().unwrap();

        let (heap_b, node_b) = make_node(
            dir.path(),
            "fb.heap",
            &NodeConfig::builder().node_nbr(7).endpoints(vec![1]).build(),
        );
        let cli = Arc::new(bp::stcp::StcpCli::new("127.0.0.1:0").unwrap());
        let listen_addr = cli.local_addr().unwrap();
        bp::stcp::spawn_cli(node_b.clone(), cli.clone()).unwrap();
        let sap_b = node_b.open("ipn:7.1").unwrap();

        let (heap_a, node_a) = make_node(
            dir.path(),
            "fa.heap",
            &NodeConfig::builder()
                .node_nbr(5)
                .endpoints(vec![1])
                .outducts(vec![OutductConfig::builder()
                    .name("stcp/7".to_owned())
                    .protocol("stcp".to_owned())
                    .peer(listen_addr.to_string())
                    .build()])
                .plans(vec![PlanConfig::builder()
                    .node_nbr(7)
                    .default_duct("stcp/7".to_owned())
                    .build()])
                .build(),
        );
        let pool = Arc::new(bp::stcp::StcpSenderPool::new());
        bp::stcp::spawn_clo(node_a.clone(), node_a.outduct("stcp/7").unwrap(), pool).unwrap();

        // The application data unit lives in a file.
        let adu_path = dir.path().join("adu");
        let adu: Vec<u8> = (0..60000u32).map(|i| i as u8).collect();
        let mut f = std::fs::File::create(&adu_path).unwrap();
        f.write_all(&adu).unwrap();
        drop(f);

        let sap_a = node_a.open("ipn:5.1").unwrap();
        let (payload, file_ref) = {
            let mut txn = heap_a.begin();
            let file_ref =
                zco::create_file_ref(&mut txn, adu_path.to_str().unwrap(), Some("")).unwrap();
            let z = zco::create(&mut txn).unwrap();
            zco::append_extent(&mut txn, z, ZcoMedium::File, file_ref.0, 0, adu.len() as u64)
                .unwrap();
            txn.commit().unwrap();
            (z, file_ref)
        };

        let cos = bp::parse_class_of_service("0.1.0").unwrap();
        node_a
            .send(Some(&sap_a), "ipn:7.1", None, 300, &cos, 0, false, payload)
            .unwrap();

        // The sender is done with the file once the bundle is gone.
        {
            let mut txn = heap_a.begin();
            zco::destroy_file_ref(&mut txn, file_ref).unwrap();
            txn.commit().unwrap();
        }

        let delivery = node_b.receive(&sap_b, BpTimeout::Seconds(10)).unwrap();
        assert_eq!(delivery.result, BpIndication::PayloadPresent);
        assert_eq!(read_delivery(&heap_b, &node_b, delivery), adu);

        // Transmission finished and the bundle was destroyed, so the
        // unlink-on-destroy cleanup must have removed the source file.
        for _ in 0..100 {
            if !adu_path.exists() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        assert!(!adu_path.exists());

        cli.wakeup();
        node_a.shutdown();
        node_b.shutdown();
    }

    #[test]
    fn test_bp_over_ltp_end_to_end() {
        init();
        let dir = tempfile::tempdir().unwrap();

        // Node ipn:7 behind LTP engine 20.
        let heap_b = Arc::new(Heap::create(dir.path().join("lb.heap"), 8 << 20).unwrap());
        let ipc_b = Ipc::new();
        let node_b = BpNode::create(
            heap_b.clone(),
            ipc_b.clone(),
            &NodeConfig::builder().node_nbr(7).endpoints(vec![1]).build(),
        )
        .unwrap();
        node_b.start().unwrap();
        let engine_b = ltp::Engine::new(heap_b.clone(), ipc_b, 20).unwrap();
        let lsi_b = ltp::udplso::UdpLsi::new("127.0.0.1:0").unwrap();
        let lsi_b_addr = lsi_b.local_addr().unwrap();

        // Node ipn:5 behind LTP engine 10.
        let heap_a = Arc::new(Heap::create(dir.path().join("la.heap"), 8 << 20).unwrap());
        let ipc_a = Ipc::new();
        let node_a = BpNode::create(
            heap_a.clone(),
            ipc_a.clone(),
            &NodeConfig::builder()
                .node_nbr(5)
                .endpoints(vec![1])
                .outducts(vec![OutductConfig::builder()
                    .name("ltp/20".to_owned())
                    .protocol("ltp".to_owned())
                    .peer("20".to_owned())
                    .build()])
                .plans(vec![PlanConfig::builder()
                    .node_nbr(7)
                    .default_duct("ltp/20".to_owned())
                    .build()])
                .build(),
        )
        .unwrap();
        node_a.start().unwrap();
        let engine_a = ltp::Engine::new(heap_a.clone(), ipc_a, 10).unwrap();
        let lsi_a = ltp::udplso::UdpLsi::new("127.0.0.1:0").unwrap();
        let lsi_a_addr = lsi_a.local_addr().unwrap();

        engine_a
            .add_span(
                ltp::SpanConfig::builder()
                    .peer_engine(20)
                    .max_segment_size(700)
                    .aggregation_size_limit(1)
                    .lso_cmd(format!("udp {}", lsi_b_addr))
                    .build(),
            )
            .unwrap();
        engine_b
            .add_span(
                ltp::SpanConfig::builder()
                    .peer_engine(10)
                    .max_segment_size(700)
                    .aggregation_size_limit(1)
                    .lso_cmd(format!("udp {}", lsi_a_addr))
                    .build(),
            )
            .unwrap();
        engine_a.start().unwrap();
        engine_b.start().unwrap();

        engine_a.open_client(bp::ltpcl::LTP_CLIENT_BP).unwrap();
        engine_b.open_client(bp::ltpcl::LTP_CLIENT_BP).unwrap();

        // Link services both ways.
        ltp::udplso::spawn_lso(engine_a.clone(), 20).unwrap();
        ltp::udplso::spawn_lso(engine_b.clone(), 10).unwrap();
        {
            let engine = engine_a.clone();
            engine_a
                .ipc()
                .tasks
                .spawn_fn("udplsi-a", move |args| lsi_a.run(&engine, &args))
                .unwrap();
        }
        {
            let engine = engine_b.clone();
            engine_b
                .ipc()
                .tasks
                .spawn_fn("udplsi-b", move |args| lsi_b.run(&engine, &args))
                .unwrap();
        }

        // Convergence-layer daemons.
        bp::ltpcl::spawn_clo(
            node_a.clone(),
            node_a.outduct("ltp/20").unwrap(),
            engine_a.clone(),
        )
        .unwrap();
        bp::ltpcl::spawn_cli(node_b.clone(), engine_b.clone()).unwrap();

        let sap_b = node_b.open("ipn:7.1").unwrap();
        let sap_a = node_a.open("ipn:5.1").unwrap();

        let message: Vec<u8> = (0..2000u32).map(|i| (i * 3) as u8).collect();
        let payload = heap_payload(&heap_a, &message);
        let cos = bp::parse_class_of_service("0.1.0").unwrap();
        node_a
            .send(Some(&sap_a), "ipn:7.1", None, 300, &cos, 0, false, payload)
            .unwrap();

        let delivery = node_b.receive(&sap_b, BpTimeout::Seconds(15)).unwrap();
        assert_eq!(delivery.result, BpIndication::PayloadPresent);
        assert_eq!(delivery.source, bp::Eid::ipn(5, 1));
        assert_eq!(read_delivery(&heap_b, &node_b, delivery), message);

        engine_a.shutdown();
        engine_b.shutdown();
        node_a.shutdown();
        node_b.shutdown();
    }

    #[test]
    fn test_stcp_oversize_bundle_rejected() {
        init();
        let pool = bp::stcp::StcpSenderPool::new();
        let err = pool
            .send_bundle("127.0.0.1:9", &vec![0u8; 70000])
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_route_tables_survive_reopen() {
        init();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.heap");
        {
            let heap = Heap::create(&path, 1 << 20).unwrap();
            let mut txn = heap.begin();
            let routes = bp::Routes::attach(&mut txn).unwrap();
            routes
                .add_plan(
                    &mut txn,
                    42,
                    8,
                    &DirectiveSet {
                        default_duct: "stcp/42".to_owned(),
                        ..Default::default()
                    },
                )
                .unwrap();
            txn.commit().unwrap();
        }

        let heap = Heap::open(&path).unwrap();
        let mut txn = heap.begin();
        let routes = bp::Routes::attach(&mut txn).unwrap();
        assert_eq!(routes.expected_rtt(&txn, 42).unwrap(), 8);
        let streams = bp::StreamLog::default();
        let duct = routes
            .lookup_directive(
                &txn,
                bp::Eid::ipn(1, 1),
                bp::Eid::ipn(42, 1),
                (100, 0),
                &streams,
            )
            .unwrap();
        assert_eq!(duct.as_deref(), Some("stcp/42"));
        txn.commit().unwrap();
    }
}
