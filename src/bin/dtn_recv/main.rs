use clap::Parser;
use dtn::bp::{self, BpIndication, BpNode, BpTimeout};
use dtn::ipc::Ipc;
use dtn::store::Heap;
use dtn::zco::ZcoReader;
use std::io::Write;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(version, about = "Receive DTN bundles on an endpoint")]
struct Args {
    /// Node configuration (JSON)
    #[arg(short, long)]
    config: std::path::PathBuf,

    /// Heap file backing the node; created if absent
    #[arg(long, default_value = "dtn.heap")]
    heap: std::path::PathBuf,

    /// Endpoint to receive on, e.g. ipn:7.1
    #[arg(short, long)]
    eid: String,

    /// STCP listen address for inbound bundles
    #[arg(short, long)]
    listen: Option<String>,

    /// Directory payloads are written into (one file per bundle);
    /// payloads go to stdout when unset
    #[arg(short, long)]
    output: Option<std::path::PathBuf>,

    /// Stop after this many bundles (0 = run forever)
    #[arg(long, default_value_t = 0)]
    count: u64,
}

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
    let args = Args::parse();

    let config_text = std::fs::read_to_string(&args.config).expect("Can't read config");
    let config = BpNode::parse_config(&config_text).expect("Bad config");

    let heap = if args.heap.exists() {
        Heap::open(&args.heap)
    } else {
        Heap::create(&args.heap, 64 << 20)
    }
    .expect("Can't open heap");
    let heap = Arc::new(heap);

    let ipc = Ipc::new();
    let node = BpNode::create(heap.clone(), ipc, &config).expect("Can't create node");
    node.start().expect("Can't start node");

    let cli = args.listen.as_ref().map(|listen| {
        let cli = Arc::new(bp::stcp::StcpCli::new(listen.as_str()).expect("Can't bind listener"));
        bp::stcp::spawn_cli(node.clone(), cli.clone()).expect("Can't start stcpcli");
        cli
    });

    let sap = node.open(&args.eid).expect("Can't open endpoint");
    log::info!("Receiving on {}", args.eid);

    let mut received = 0u64;
    loop {
        let delivery = match node.receive(&sap, BpTimeout::Blocking) {
            Ok(delivery) => delivery,
            Err(e) => {
                log::error!("Receive failed: {}", e);
                break;
            }
        };

        match delivery.result {
            BpIndication::PayloadPresent => {
                received += 1;
                let mut payload = vec![0u8; delivery.payload_length as usize];
                {
                    let mut txn = heap.begin();
                    let mut reader = ZcoReader::new(delivery.adu.unwrap());
                    let n = reader
                        .transmit(&mut txn, delivery.payload_length, Some(&mut payload))
                        .expect("Payload read failed");
                    txn.commit().unwrap();
                    if n != delivery.payload_length {
                        log::warn!("Degraded payload read; source file changed underneath");
                    }
                }

                log::info!(
                    "Bundle {} from {} created {}: {} bytes",
                    received,
                    delivery.source,
                    dtn::tools::dtn_time_to_utc(delivery.creation.0),
                    delivery.payload_length
                );
                match &args.output {
                    Some(dir) => {
                        let name = format!(
                            "bundle-{}-{}.{}",
                            delivery.creation.0, delivery.creation.1, received
                        );
                        std::fs::write(dir.join(&name), &payload).expect("Can't write payload");
                    }
                    None => {
                        std::io::stdout().write_all(&payload).ok();
                        std::io::stdout().flush().ok();
                    }
                }
                node.release_delivery(delivery).ok();

                if args.count != 0 && received >= args.count {
                    break;
                }
            }
            BpIndication::ReceptionInterrupted => continue,
            BpIndication::ReceptionTimedOut => continue,
            BpIndication::EndpointStopped => break,
        }
    }

    if let Some(cli) = cli {
        cli.wakeup();
    }
    node.shutdown();
    log::info!("Received {} bundles", received);
}
