use clap::Parser;
use dtn::bp::{self, BpNode};
use dtn::ipc::Ipc;
use dtn::store::Heap;
use dtn::zco;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(version, about = "Send a file or message as a DTN bundle")]
struct Args {
    /// Node configuration (JSON)
    #[arg(short, long)]
    config: std::path::PathBuf,

    /// Heap file backing the node; created if absent
    #[arg(long, default_value = "dtn.heap")]
    heap: std::path::PathBuf,

    /// Destination endpoint, e.g. ipn:7.1
    #[arg(short, long)]
    dest: String,

    /// Source endpoint to send from, e.g. ipn:5.1
    #[arg(short, long)]
    source: String,

    /// Class-of-service token: custody.priority.ordinal[.u.c[.label]]
    #[arg(long, default_value = "0.1.0")]
    cos: String,

    /// Bundle time to live, seconds
    #[arg(short, long, default_value_t = 3600)]
    ttl: u64,

    /// File to send as the payload
    #[arg(short, long, conflicts_with = "message")]
    file: Option<String>,

    /// Inline text payload
    #[arg(short, long)]
    message: Option<String>,
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

    // One STCP output daemon per configured stcp duct.
    let pool = Arc::new(bp::stcp::StcpSenderPool::new());
    for duct_config in &config.outducts {
        if duct_config.protocol == "stcp" {
            let duct = node.outduct(&duct_config.name).unwrap();
            bp::stcp::spawn_clo(node.clone(), duct, pool.clone()).expect("Can't start stcpclo");
        }
    }

    let cos = bp::parse_class_of_service(&args.cos).expect("Bad class-of-service token");
    let sap = node.open(&args.source).expect("Can't open source endpoint");

    let payload = {
        let mut txn = heap.begin();
        let z = zco::create(&mut txn).unwrap();
        match (&args.file, &args.message) {
            (Some(path), _) => {
                let file_ref =
                    zco::create_file_ref(&mut txn, path, None).expect("Can't reference file");
                let length = std::fs::metadata(path).expect("Can't stat file").len();
                if !zco::enough_file_space(&mut txn, length).unwrap() {
                    panic!("File occupancy cap would be exceeded");
                }
                zco::append_extent(&mut txn, z, zco::ZcoMedium::File, file_ref.0, 0, length)
                    .expect("Can't build payload");
            }
            (None, Some(text)) => {
                let array = txn.put_bytes(text.as_bytes()).unwrap();
                zco::append_extent(
                    &mut txn,
                    z,
                    zco::ZcoMedium::Heap,
                    array,
                    0,
                    text.len() as u64,
                )
                .expect("Can't build payload");
            }
            (None, None) => {
                eprintln!("Nothing to send: pass --file or --message");
                std::process::exit(2);
            }
        }
        txn.commit().unwrap();
        z
    };

    let bundle = node
        .send(Some(&sap), &args.dest, None, args.ttl, &cos, 0, false, payload)
        .expect("Send failed");
    log::info!("Bundle {} admitted for {}", bundle, args.dest);

    // Let the forwarder and convergence layer drain before exit.
    std::thread::sleep(std::time::Duration::from_secs(2));
    node.shutdown();
}
