use super::bundle::{self, BundleRec, BP_CUSTODY_RPT, BP_DELETED_RPT, BP_DELIVERED_RPT, BP_FORWARDED_RPT};
use super::cos::{ClassOfService, CustodySwitch, ExtendedCos};
use super::eid::Eid;
use super::report::{AdminRecord, CustodySignal, StatusReport, REASON_EXPIRED, REASON_NONE};
use super::routes::{Routes, StreamLog};
use crate::ipc::{Ipc, Sem, SemDiscipline, SemTake, TaskId, SM_NO_KEY};
use crate::store::{Addr, Heap, Rec, Txn};
use crate::tools::error::{DtnError, Result};
use crate::tools::{self, dtn_time_now};
use crate::zco::{self, Zco, ZcoMedium, ZcoReader};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use typed_builder::TypedBuilder;

const TIMELINE_TTL: u64 = 0;
const TIMELINE_CT_DUE: u64 = 1;

fn get(buf: &[u8], i: usize) -> u64 {
    u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap())
}

fn put(buf: &mut [u8], i: usize, v: u64) {
    buf[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
}

/// Receive timeout semantics.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BpTimeout {
    /// Return immediately when no bundle is ready
    Poll,
    /// Block until delivery or endpoint stop
    Blocking,
    /// Block for at most this many seconds
    Seconds(u32),
}

/// Outcome of a receive.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BpIndication {
    /// A payload was delivered
    PayloadPresent,
    /// The timeout elapsed first
    ReceptionTimedOut,
    /// The wait was interrupted
    ReceptionInterrupted,
    /// The endpoint has been stopped
    EndpointStopped,
}

/// One delivered bundle (or the reason none was delivered).
#[derive(Debug)]
pub struct BpDelivery {
    /// What happened
    pub result: BpIndication,
    /// The payload, owned by the application; release with
    /// [`BpNode::release_delivery`]
    pub adu: Option<Zco>,
    /// Source of the bundle
    pub source: Eid,
    /// Creation timestamp of the bundle
    pub creation: (u64, u64),
    /// Payload length in bytes
    pub payload_length: u64,
    /// True if the bundle was an administrative record
    pub admin_record: bool,
}

impl BpDelivery {
    fn empty(result: BpIndication) -> BpDelivery {
        BpDelivery {
            result,
            adu: None,
            source: Eid::None,
            creation: (0, 0),
            payload_length: 0,
            admin_record: false,
        }
    }
}

/// Endpoint access handle returned by [`BpNode::open`].
#[derive(Debug)]
pub struct Sap {
    node: Arc<BpNode>,
    service: u64,
}

impl Sap {
    /// The endpoint's EID.
    pub fn eid(&self) -> Eid {
        Eid::ipn(self.node.node_nbr, self.service)
    }

    /// The endpoint's service number.
    pub fn service(&self) -> u64 {
        self.service
    }
}

#[derive(Debug, Default)]
struct EndpointRec {
    service_nbr: u64,
    delivery_queue: Addr,
    app_task_id: u64,
    orphan_discard: bool,
}

impl Rec for EndpointRec {
    const SIZE: usize = 32;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.service_nbr);
        put(buf, 1, self.delivery_queue.0);
        put(buf, 2, self.app_task_id);
        put(buf, 3, self.orphan_discard as u64);
    }

    fn decode(buf: &[u8]) -> Self {
        EndpointRec {
            service_nbr: get(buf, 0),
            delivery_queue: Addr(get(buf, 1)),
            app_task_id: get(buf, 2),
            orphan_discard: get(buf, 3) != 0,
        }
    }
}

struct VEndpoint {
    rec: Addr,
    sem: Sem,
    app_task: Arc<AtomicU32>,
    timed_out: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct TimelineRec {
    deadline: u64,
    kind: u64,
    bundle: Addr,
}

impl Rec for TimelineRec {
    const SIZE: usize = 24;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.deadline);
        put(buf, 1, self.kind);
        put(buf, 2, self.bundle.0);
    }

    fn decode(buf: &[u8]) -> Self {
        TimelineRec {
            deadline: get(buf, 0),
            kind: get(buf, 1),
            bundle: Addr(get(buf, 2)),
        }
    }
}

/// What a convergence-layer output daemon popped from its duct.
#[derive(Debug, PartialEq, Eq)]
pub enum DequeuedBundle {
    /// A bundle ready for transmission
    Bundle(Addr),
    /// Woken without work; check for shutdown and retry
    Interrupted,
    /// The duct has been stopped
    Stopped,
}

/// Per-convergence-layer outbound channel: three priority queues in the
/// heap plus a ready semaphore.
pub struct Outduct {
    /// Duct name, as referenced by forwarding directives
    pub name: String,
    /// Convergence-layer protocol ("stcp", "ltp", ...)
    pub protocol: String,
    /// Peer address: a `host:port` or an LTP engine id
    pub peer: String,
    /// Nominal transmission rate, bytes per second; 0 = unthrottled
    pub nominal_rate: u64,
    queues: [Addr; 3],
    sem: Sem,
}

impl std::fmt::Debug for Outduct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Outduct({} via {})", self.name, self.protocol)
    }
}

impl Outduct {
    /// Block until a bundle is queued, the duct is interrupted, or it is
    /// stopped. Queues drain expedited first, then standard, then bulk.
    pub fn dequeue(&self, heap: &Heap) -> Result<DequeuedBundle> {
        match self.sem.take() {
            SemTake::Ended => return Ok(DequeuedBundle::Stopped),
            SemTake::Taken | SemTake::TimedOut => {}
        }

        let mut txn = heap.begin();
        for queue in self.queues.iter().rev() {
            let elt = txn.list_first(*queue)?;
            if elt.is_null() {
                continue;
            }
            let bundle = txn.list_data(elt)?;
            let mut rec: BundleRec = txn.get(bundle)?;
            txn.list_delete(elt)?;
            rec.duct_xmit_elt = Addr::NULL;
            txn.put(bundle, &rec)?;
            txn.commit()?;
            return Ok(DequeuedBundle::Bundle(bundle));
        }
        txn.cancel();
        Ok(DequeuedBundle::Interrupted)
    }

    /// Wake a blocked output daemon without queueing anything.
    pub fn interrupt(&self) {
        self.sem.give();
    }

    /// Stop the duct; blocked and future dequeues return `Stopped`.
    pub fn stop(&self) {
        self.sem.end();
    }
}

/// Outduct configuration.
#[derive(Clone, Debug, Deserialize, TypedBuilder)]
pub struct OutductConfig {
    /// Duct name referenced by plans
    pub name: String,
    /// Convergence-layer protocol ("stcp" or "ltp")
    pub protocol: String,
    /// Peer address (`host:port` for stcp, engine id for ltp)
    pub peer: String,
    /// Nominal rate in bytes per second, 0 for none
    #[builder(default = 0)]
    #[serde(default)]
    pub nominal_rate: u64,
}

/// Forwarding plan configuration.
#[derive(Clone, Debug, Deserialize, TypedBuilder)]
pub struct PlanConfig {
    /// Destination node number
    pub node_nbr: u64,
    /// Expected round-trip time in seconds; drives custody-due timers
    #[builder(default = 0)]
    #[serde(default)]
    pub expected_rtt: u64,
    /// Default outduct name
    pub default_duct: String,
    /// Real-time outduct name, empty for none
    #[builder(default)]
    #[serde(default)]
    pub rt_duct: String,
    /// Playback outduct name, empty for none
    #[builder(default)]
    #[serde(default)]
    pub pb_duct: String,
}

/// Node configuration.
#[derive(Clone, Debug, Deserialize, TypedBuilder)]
pub struct NodeConfig {
    /// Own node number
    pub node_nbr: u64,
    /// Endpoint services to create at startup
    #[builder(default)]
    #[serde(default)]
    pub endpoints: Vec<u64>,
    /// Outducts to create at startup
    #[builder(default)]
    #[serde(default)]
    pub outducts: Vec<OutductConfig>,
    /// Forwarding plans to install at startup
    #[builder(default)]
    #[serde(default)]
    pub plans: Vec<PlanConfig>,
}

/// A Bundle Protocol node: endpoints, forwarding, custody, timers, and
/// the outduct fabric.
pub struct BpNode {
    heap: Arc<Heap>,
    ipc: Arc<Ipc>,
    node_nbr: u64,
    endpoints: Mutex<HashMap<u64, Arc<VEndpoint>>>,
    outducts: Mutex<HashMap<String, Arc<Outduct>>>,
    fwd_queue: Addr,
    fwd_sem: Sem,
    limbo: Addr,
    timeline: Addr,
    routes: Routes,
    streams: StreamLog,
    seq: Mutex<(u64, u64)>,
    running: AtomicBool,
    tasks: Mutex<Vec<TaskId>>,
}

impl std::fmt::Debug for BpNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BpNode({})", self.node_nbr)
    }
}

/// Deferred wakeups, fired after commit.
#[derive(Default)]
pub(crate) struct Wakeups {
    sems: Vec<Sem>,
}

impl Wakeups {
    pub(crate) fn push(&mut self, sem: Sem) {
        self.sems.push(sem);
    }

    pub(crate) fn fire(self) {
        for sem in self.sems {
            sem.give();
        }
    }
}

impl BpNode {
    /// Stand up a node from its configuration.
    pub fn create(heap: Arc<Heap>, ipc: Arc<Ipc>, config: &NodeConfig) -> Result<Arc<BpNode>> {
        let mut txn = heap.begin();
        let fwd_queue = txn.list_create()?;
        let limbo = txn.list_create()?;
        let timeline = txn.list_create()?;
        let routes = Routes::attach(&mut txn)?;
        txn.commit()?;

        let node = Arc::new(BpNode {
            heap,
            ipc: ipc.clone(),
            node_nbr: config.node_nbr,
            endpoints: Mutex::new(HashMap::new()),
            outducts: Mutex::new(HashMap::new()),
            fwd_queue,
            fwd_sem: ipc.sems.create(SM_NO_KEY, SemDiscipline::Fifo),
            limbo,
            timeline,
            routes,
            streams: StreamLog::default(),
            seq: Mutex::new((0, 0)),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        for &service in &config.endpoints {
            node.add_endpoint(service, false)?;
        }
        for duct in &config.outducts {
            node.add_outduct(duct)?;
        }
        if !config.plans.is_empty() {
            let mut txn = node.heap.begin();
            for plan in &config.plans {
                node.routes.add_plan(
                    &mut txn,
                    plan.node_nbr,
                    plan.expected_rtt,
                    &super::routes::DirectiveSet {
                        default_duct: plan.default_duct.clone(),
                        rt_duct: plan.rt_duct.clone(),
                        pb_duct: plan.pb_duct.clone(),
                    },
                )?;
            }
            txn.commit()?;
        }
        log::info!("Node ipn:{}.* is up", config.node_nbr);
        Ok(node)
    }

    /// Own node number.
    pub fn node_nbr(&self) -> u64 {
        self.node_nbr
    }

    /// The heap this node stores its state in.
    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    /// The IPC context this node signals through.
    pub fn ipc(&self) -> &Arc<Ipc> {
        &self.ipc
    }

    /// The durable routing tables.
    pub fn routes(&self) -> &Routes {
        &self.routes
    }

    /// The in-memory stream log consulted for BSS directives.
    pub fn streams(&self) -> &StreamLog {
        &self.streams
    }

    /// Create an endpoint for `service`. `orphan_discard` selects the
    /// recovery behavior when bundles arrive while no task owns the
    /// endpoint: discard, or queue for a later owner.
    pub fn add_endpoint(&self, service: u64, orphan_discard: bool) -> Result<()> {
        // Transaction before index lock, like every runtime path.
        let mut txn = self.heap.begin();
        let rec = EndpointRec {
            service_nbr: service,
            delivery_queue: txn.list_create()?,
            app_task_id: 0,
            orphan_discard,
        };
        let addr = txn.alloc_rec(&rec)?;

        let mut endpoints = self.endpoints.lock();
        if endpoints.contains_key(&service) {
            return Err(DtnError::new(format!("Endpoint {} exists", service)));
        }
        txn.commit()?;

        endpoints.insert(
            service,
            Arc::new(VEndpoint {
                rec: addr,
                sem: self.ipc.sems.create(SM_NO_KEY, SemDiscipline::Fifo),
                app_task: Arc::new(AtomicU32::new(0)),
                timed_out: Arc::new(AtomicBool::new(false)),
            }),
        );
        Ok(())
    }

    /// Create an outduct.
    pub fn add_outduct(&self, config: &OutductConfig) -> Result<Arc<Outduct>> {
        let mut txn = self.heap.begin();
        let queues = [txn.list_create()?, txn.list_create()?, txn.list_create()?];

        let mut outducts = self.outducts.lock();
        if outducts.contains_key(&config.name) {
            return Err(DtnError::new(format!("Outduct {} exists", config.name)));
        }
        txn.commit()?;

        let duct = Arc::new(Outduct {
            name: config.name.clone(),
            protocol: config.protocol.clone(),
            peer: config.peer.clone(),
            nominal_rate: config.nominal_rate,
            queues,
            sem: self.ipc.sems.create(SM_NO_KEY, SemDiscipline::Fifo),
        });
        outducts.insert(config.name.clone(), duct.clone());
        Ok(duct)
    }

    /// Look up an outduct by name.
    pub fn outduct(&self, name: &str) -> Option<Arc<Outduct>> {
        self.outducts.lock().get(name).cloned()
    }

    fn endpoint(&self, service: u64) -> Result<Arc<VEndpoint>> {
        self.endpoints
            .lock()
            .get(&service)
            .cloned()
            .ok_or_else(|| DtnError::new(format!("No endpoint ipn:{}.{}", self.node_nbr, service)))
    }

    /// Open an endpoint for receiving. Fails if the EID is foreign,
    /// unknown, or owned by another live task.
    pub fn open(self: &Arc<Self>, eid_text: &str) -> Result<Sap> {
        let eid = Eid::parse(eid_text)?;
        let (node, service) = match eid {
            Eid::Ipn { node, service } => (node, service),
            Eid::None => return Err(DtnError::new("Can't open the null endpoint")),
        };
        if node != self.node_nbr {
            return Err(DtnError::new(format!(
                "EID {} is not on node {}",
                eid, self.node_nbr
            )));
        }

        let vep = self.endpoint(service)?;
        let self_task = self.ipc.tasks.attach_self("bpapp");
        let owner = vep.app_task.load(Ordering::Relaxed);
        if owner != 0 && owner != self_task && self.ipc.tasks.exists(owner) {
            return Err(DtnError::new(format!(
                "Endpoint {} is owned by live task {}",
                eid, owner
            )));
        }

        vep.app_task.store(self_task, Ordering::Relaxed);
        vep.sem.unend();
        let mut txn = self.heap.begin();
        let mut rec: EndpointRec = txn.get(vep.rec)?;
        rec.app_task_id = self_task as u64;
        txn.put(vep.rec, &rec)?;
        txn.commit()?;

        Ok(Sap {
            node: self.clone(),
            service,
        })
    }

    /// Release the caller's claim on the endpoint.
    pub fn close(&self, sap: Sap) -> Result<()> {
        let vep = self.endpoint(sap.service)?;
        vep.app_task.store(0, Ordering::Relaxed);
        let mut txn = self.heap.begin();
        let mut rec: EndpointRec = txn.get(vep.rec)?;
        rec.app_task_id = 0;
        txn.put(vep.rec, &rec)?;
        txn.commit()?;
        Ok(())
    }

    /// Permanently stop an endpoint, waking any blocked receiver with
    /// `EndpointStopped`.
    pub fn stop_endpoint(&self, service: u64) {
        if let Ok(vep) = self.endpoint(service) {
            vep.sem.end();
        }
    }

    fn next_creation(&self) -> (u64, u64) {
        let now = dtn_time_now();
        let mut seq = self.seq.lock();
        if seq.0 == now {
            seq.1 += 1;
        } else {
            *seq = (now, 0);
        }
        *seq
    }

    /// Admit a bundle for transmission. The payload ZCO becomes the
    /// bundle's; the returned address identifies the bundle record.
    #[allow(clippy::too_many_arguments)]
    pub fn send(
        &self,
        sap: Option<&Sap>,
        dest_eid: &str,
        report_to_eid: Option<&str>,
        ttl: u64,
        cos: &ClassOfService,
        srr_flags: u8,
        ack_requested: bool,
        payload: Zco,
    ) -> Result<Addr> {
        let destination = Eid::parse(dest_eid)?;
        if destination == Eid::None {
            return Err(DtnError::new("Can't send to the null endpoint"));
        }
        if cos.priority > 2 {
            return Err(DtnError::new(format!("Invalid priority {}", cos.priority)));
        }
        if ttl == 0 {
            return Err(DtnError::new("TTL must be positive"));
        }

        let source = match sap {
            Some(sap) => sap.eid(),
            None => Eid::None,
        };
        let report_to = match report_to_eid {
            Some(text) => Eid::parse(text)?,
            None => source,
        };

        let mut ecos = cos.ecos;
        if ecos.ordinal == 255 {
            // Reserved ordinal.
            ecos.ordinal = 254;
        }

        let mut wake = Wakeups::default();
        let mut txn = self.heap.begin();
        if !zco::enough_heap_space(&mut txn, BundleRec::SIZE as u64)? {
            return Err(DtnError::new_kind(
                std::io::ErrorKind::OutOfMemory,
                "Heap occupancy cap reached; bundle refused",
            ));
        }

        let payload_length = zco::length(&txn, payload)?;
        let creation = self.next_creation();
        let rec = BundleRec {
            source: source.cbhe(),
            destination: destination.cbhe(),
            report_to: report_to.cbhe(),
            custodian: if cos.custody == CustodySwitch::SourceCustodyRequired {
                (self.node_nbr, 0)
            } else {
                (0, 0)
            },
            creation,
            ttl,
            priority: cos.priority,
            custody: cos.custody,
            srr_flags,
            admin_record: false,
            ack_requested,
            delivered: false,
            suspended: false,
            ecos,
            payload,
            payload_length,
            duct_xmit_elt: Addr::NULL,
            prox_node_eid: Addr::NULL,
            tracking_elts: txn.list_create()?,
        };
        let bundle = txn.alloc_rec(&rec)?;
        self.add_timeline(&mut txn, Self::now() + ttl, TIMELINE_TTL, bundle)?;
        txn.list_insert_last(self.fwd_queue, bundle)?;
        wake.push(self.fwd_sem.clone());
        txn.commit()?;
        wake.fire();

        log::debug!(
            "Admitted bundle {} from {} to {}, {} bytes",
            bundle,
            source,
            destination,
            payload_length
        );
        Ok(bundle)
    }

    fn now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }

    fn add_timeline(&self, txn: &mut Txn, deadline: u64, kind: u64, bundle: Addr) -> Result<()> {
        let rec = TimelineRec {
            deadline,
            kind,
            bundle,
        };
        let addr = txn.alloc_rec(&rec)?;
        txn.list_insert_last(self.timeline, addr)?;
        Ok(())
    }

    fn purge_timeline(&self, txn: &mut Txn, bundle: Addr) -> Result<()> {
        let mut elt = txn.list_first(self.timeline)?;
        while !elt.is_null() {
            let next = txn.list_next(elt)?;
            let addr = txn.list_data(elt)?;
            let rec: TimelineRec = txn.get(addr)?;
            if rec.bundle == bundle {
                txn.free(addr)?;
                txn.list_delete(elt)?;
            }
            elt = next;
        }
        Ok(())
    }

    /// Drop a bundle: dequeue it, release its payload and bookkeeping,
    /// and send a Deleted status report when requested.
    pub(crate) fn destroy_bundle(
        &self,
        txn: &mut Txn,
        wake: &mut Wakeups,
        bundle: Addr,
        rec: &BundleRec,
        reason: u8,
    ) -> Result<()> {
        if !rec.duct_xmit_elt.is_null() {
            txn.list_delete(rec.duct_xmit_elt)?;
        }
        if !rec.prox_node_eid.is_null() {
            txn.free(rec.prox_node_eid)?;
        }
        if !rec.tracking_elts.is_null() {
            txn.list_destroy(rec.tracking_elts)?;
        }
        if reason != REASON_NONE {
            self.send_status_report(txn, wake, rec, BP_DELETED_RPT, reason)?;
        }
        if !rec.payload.is_null() {
            zco::destroy(txn, rec.payload)?;
        }
        self.purge_timeline(txn, bundle)?;
        txn.free(bundle)?;
        Ok(())
    }

    /// Queue a status report about `subject` if it asks for one.
    pub(crate) fn send_status_report(
        &self,
        txn: &mut Txn,
        wake: &mut Wakeups,
        subject: &BundleRec,
        flag: u8,
        reason: u8,
    ) -> Result<()> {
        if subject.srr_flags & flag == 0 || subject.admin_record {
            return Ok(());
        }
        let report_to = subject.report_to_eid();
        if report_to == Eid::None {
            return Ok(());
        }

        let record = AdminRecord::StatusReport(StatusReport {
            flags: flag,
            reason,
            time: dtn_time_now(),
            creation: subject.creation,
            source: subject.source_eid(),
        });
        self.send_admin_record(txn, wake, report_to, &record, subject.ttl.max(60))
    }

    /// Queue a custody signal about `subject` to its custodian.
    pub(crate) fn send_custody_signal(
        &self,
        txn: &mut Txn,
        wake: &mut Wakeups,
        subject: &BundleRec,
        accepted: bool,
        reason: u8,
    ) -> Result<()> {
        let custodian = Eid::from_cbhe(subject.custodian.0, subject.custodian.1);
        if custodian == Eid::None || subject.custodian.0 == self.node_nbr {
            return Ok(());
        }

        let record = AdminRecord::CustodySignal(CustodySignal {
            accepted,
            reason,
            time: dtn_time_now(),
            creation: subject.creation,
            source: subject.source_eid(),
        });
        self.send_admin_record(txn, wake, custodian, &record, subject.ttl.max(60))
    }

    fn send_admin_record(
        &self,
        txn: &mut Txn,
        wake: &mut Wakeups,
        destination: Eid,
        record: &AdminRecord,
        ttl: u64,
    ) -> Result<()> {
        let bytes = record.encode();
        let array = txn.put_bytes(&bytes)?;
        let payload = zco::create(txn)?;
        zco::append_extent(txn, payload, ZcoMedium::Heap, array, 0, bytes.len() as u64)?;

        let rec = BundleRec {
            source: (self.node_nbr, 0),
            destination: destination.cbhe(),
            report_to: (0, 0),
            custodian: (0, 0),
            creation: self.next_creation(),
            ttl,
            priority: 1,
            custody: CustodySwitch::NoCustodyRequested,
            srr_flags: 0,
            admin_record: true,
            ack_requested: false,
            delivered: false,
            suspended: false,
            ecos: ExtendedCos::default(),
            payload,
            payload_length: bytes.len() as u64,
            duct_xmit_elt: Addr::NULL,
            prox_node_eid: Addr::NULL,
            tracking_elts: txn.list_create()?,
        };
        let bundle = txn.alloc_rec(&rec)?;
        self.add_timeline(txn, Self::now() + ttl, TIMELINE_TTL, bundle)?;
        txn.list_insert_last(self.fwd_queue, bundle)?;
        wake.push(self.fwd_sem.clone());
        Ok(())
    }

    /// Admit a fully parsed inbound bundle: build its record, take
    /// custody when asked, and dispatch it. The payload ZCO becomes the
    /// bundle's.
    pub(crate) fn admit_inbound(
        &self,
        txn: &mut Txn,
        wake: &mut Wakeups,
        parsed: &bundle::ParsedBundle,
        payload: Zco,
        payload_length: u64,
    ) -> Result<Addr> {
        let remaining = Self::remaining_ttl(parsed.creation.0, parsed.ttl);
        if remaining == 0 {
            log::debug!("Inbound bundle from {} already expired", parsed.source);
            zco::destroy(txn, payload)?;
            return Ok(Addr::NULL);
        }

        let mut rec = BundleRec {
            source: parsed.source.cbhe(),
            destination: parsed.destination.cbhe(),
            report_to: parsed.report_to.cbhe(),
            custodian: parsed.custodian.cbhe(),
            creation: parsed.creation,
            ttl: remaining,
            priority: parsed.priority,
            custody: parsed.custody,
            srr_flags: parsed.srr_flags,
            admin_record: parsed.admin_record,
            ack_requested: parsed.ack_requested,
            delivered: false,
            suspended: false,
            ecos: parsed.ecos,
            payload,
            payload_length,
            duct_xmit_elt: Addr::NULL,
            prox_node_eid: Addr::NULL,
            tracking_elts: txn.list_create()?,
        };

        self.send_status_report(txn, wake, &rec, super::bundle::BP_RECEIVED_RPT, REASON_NONE)?;

        // Take custody: tell the previous custodian it is off the hook.
        if rec.custody == CustodySwitch::SourceCustodyRequired
            && rec.custodian.0 != self.node_nbr
        {
            self.send_custody_signal(txn, wake, &rec, true, REASON_NONE)?;
            self.send_status_report(txn, wake, &rec, BP_CUSTODY_RPT, REASON_NONE)?;
            rec.custodian = (self.node_nbr, 0);
        }

        let addr = txn.alloc_rec(&rec)?;
        self.add_timeline(txn, Self::now() + remaining, TIMELINE_TTL, addr)?;
        self.dispatch_inbound(txn, wake, addr, &rec)?;
        Ok(addr)
    }

    /// Hand an inbound (acquired) bundle to dispatching: local delivery,
    /// admin processing, or forwarding.
    pub(crate) fn dispatch_inbound(
        &self,
        txn: &mut Txn,
        wake: &mut Wakeups,
        bundle: Addr,
        rec: &BundleRec,
    ) -> Result<()> {
        if rec.destination.0 == self.node_nbr {
            if rec.admin_record && rec.destination.1 == 0 {
                return self.handle_admin(txn, wake, bundle, rec);
            }
            return self.deliver_locally(txn, wake, bundle, rec);
        }
        txn.list_insert_last(self.fwd_queue, bundle)?;
        wake.push(self.fwd_sem.clone());
        Ok(())
    }

    fn deliver_locally(
        &self,
        txn: &mut Txn,
        wake: &mut Wakeups,
        bundle: Addr,
        rec: &BundleRec,
    ) -> Result<()> {
        let vep = match self.endpoints.lock().get(&rec.destination.1) {
            Some(vep) => vep.clone(),
            None => {
                log::warn!(
                    "No endpoint ipn:{}.{}; abandoning bundle",
                    self.node_nbr,
                    rec.destination.1
                );
                return self.destroy_bundle(txn, wake, bundle, rec, REASON_NONE);
            }
        };

        let owner = vep.app_task.load(Ordering::Relaxed);
        let orphaned = owner == 0 || !self.ipc.tasks.exists(owner);
        if orphaned {
            let ep_rec: EndpointRec = txn.get(vep.rec)?;
            if ep_rec.orphan_discard {
                log::debug!("Endpoint {} is orphaned; discarding", rec.destination.1);
                return self.destroy_bundle(txn, wake, bundle, rec, REASON_NONE);
            }
        }

        let ep_rec: EndpointRec = txn.get(vep.rec)?;
        txn.list_insert_last(ep_rec.delivery_queue, bundle)?;
        wake.push(vep.sem.clone());
        Ok(())
    }

    /// Process a custody signal or status report addressed to the admin
    /// endpoint.
    fn handle_admin(
        &self,
        txn: &mut Txn,
        wake: &mut Wakeups,
        bundle: Addr,
        rec: &BundleRec,
    ) -> Result<()> {
        let mut bytes = vec![0u8; rec.payload_length as usize];
        let mut reader = ZcoReader::new(rec.payload);
        reader.transmit(txn, rec.payload_length, Some(&mut bytes))?;

        match AdminRecord::decode(&bytes) {
            Ok(AdminRecord::CustodySignal(cs)) => {
                if cs.accepted {
                    self.release_custody(txn, wake, &cs)?;
                } else {
                    log::warn!("Custody refused for bundle from {}", cs.source);
                }
            }
            Ok(AdminRecord::StatusReport(sr)) => {
                log::info!(
                    "Status report: flags {:#x} reason {} for bundle from {} created {} (#{})",
                    sr.flags,
                    sr.reason,
                    sr.source,
                    tools::dtn_time_to_utc(sr.creation.0),
                    sr.creation.1
                );
            }
            Err(e) => {
                log::warn!("Malformed admin record: {}", e);
            }
        }
        self.destroy_bundle(txn, wake, bundle, rec, REASON_NONE)
    }

    /// A downstream node accepted custody: the retained copy can go.
    fn release_custody(&self, txn: &mut Txn, wake: &mut Wakeups, cs: &CustodySignal) -> Result<()> {
        let mut elt = txn.list_first(self.timeline)?;
        while !elt.is_null() {
            let next = txn.list_next(elt)?;
            let addr = txn.list_data(elt)?;
            let timer: TimelineRec = txn.get(addr)?;
            if timer.kind == TIMELINE_CT_DUE {
                let rec: BundleRec = txn.get(timer.bundle)?;
                if rec.source_eid() == cs.source && rec.creation == cs.creation {
                    log::debug!("Custody accepted downstream; releasing bundle");
                    let bundle = timer.bundle;
                    return self.destroy_bundle(txn, wake, bundle, &rec, REASON_NONE);
                }
            }
            elt = next;
        }
        log::debug!("Custody signal for unknown bundle from {}", cs.source);
        Ok(())
    }

    /// Route one bundle: deliver locally, queue on an outduct, or park it
    /// in limbo.
    pub(crate) fn forward_bundle(&self, bundle: Addr) -> Result<()> {
        let mut wake = Wakeups::default();
        let mut txn = self.heap.begin();
        let rec: BundleRec = txn.get(bundle)?;

        if rec.destination.0 == self.node_nbr {
            if rec.admin_record && rec.destination.1 == 0 {
                self.handle_admin(&mut txn, &mut wake, bundle, &rec)?;
            } else {
                self.deliver_locally(&mut txn, &mut wake, bundle, &rec)?;
            }
            txn.commit()?;
            wake.fire();
            return Ok(());
        }

        let source = rec.source_eid();
        let destination = rec.destination_eid();
        let directive =
            self.routes
                .lookup_directive(&txn, source, destination, rec.creation, &self.streams)?;

        let duct = directive.and_then(|name| self.outducts.lock().get(&name).cloned());
        match duct {
            Some(duct) => {
                self.enqueue_to_duct(&mut txn, &mut wake, bundle, rec, &duct)?;
            }
            None => {
                log::debug!("No route for bundle to {}; sending to limbo", destination);
                let mut rec = rec;
                let elt = txn.list_insert_last(self.limbo, bundle)?;
                rec.duct_xmit_elt = elt;
                txn.put(bundle, &rec)?;
            }
        }

        txn.commit()?;
        wake.fire();
        Ok(())
    }

    fn enqueue_to_duct(
        &self,
        txn: &mut Txn,
        wake: &mut Wakeups,
        bundle: Addr,
        mut rec: BundleRec,
        duct: &Arc<Outduct>,
    ) -> Result<()> {
        let queue = duct.queues[rec.priority.min(2) as usize];
        let elt = if rec.priority == 2 {
            // Expedited traffic is ordered by ordinal, high first.
            let mut insert_before = Addr::NULL;
            let mut cursor = txn.list_first(queue)?;
            while !cursor.is_null() {
                let other: BundleRec = txn.get(txn.list_data(cursor)?)?;
                if other.ecos.ordinal < rec.ecos.ordinal {
                    insert_before = cursor;
                    break;
                }
                cursor = txn.list_next(cursor)?;
            }
            if insert_before.is_null() {
                txn.list_insert_last(queue, bundle)?
            } else {
                txn.list_insert_before(insert_before, bundle)?
            }
        } else {
            txn.list_insert_last(queue, bundle)?
        };

        rec.duct_xmit_elt = elt;
        if rec.prox_node_eid.is_null() {
            let prox = format!("ipn:{}.0", rec.destination.0);
            rec.prox_node_eid = txn.put_str(&prox)?;
        }
        txn.put(bundle, &rec)?;

        // Custody: schedule reforwarding unless a custody signal lands
        // first.
        if rec.custody == CustodySwitch::SourceCustodyRequired {
            let rtt = self.routes.expected_rtt(txn, rec.destination.0)?;
            if rtt > 0 {
                self.add_timeline(txn, Self::now() + rtt, TIMELINE_CT_DUE, bundle)?;
            }
        }

        self.send_status_report(txn, wake, &rec, BP_FORWARDED_RPT, REASON_NONE)?;
        if self.routes.is_bss_destination(txn, rec.destination_eid())? {
            self.streams
                .monitor(rec.source_eid(), rec.destination_eid(), rec.creation);
        }
        wake.push(duct.sem.clone());
        Ok(())
    }

    /// Move a queued bundle to the limbo queue. Minimum-latency bundles
    /// refuse suspension; the call succeeds without effect.
    pub fn suspend(&self, bundle: Addr) -> Result<()> {
        let mut txn = self.heap.begin();
        let mut rec: BundleRec = txn.get(bundle)?;
        if rec.ecos.minimum_latency() {
            log::warn!("Minimum-latency bundle {} cannot be suspended", bundle);
            return Ok(());
        }
        if rec.suspended {
            return Ok(());
        }

        if !rec.duct_xmit_elt.is_null() {
            txn.list_delete(rec.duct_xmit_elt)?;
        }
        let elt = txn.list_insert_last(self.limbo, bundle)?;
        rec.duct_xmit_elt = elt;
        rec.suspended = true;
        txn.put(bundle, &rec)?;
        txn.commit()?;
        log::debug!("Bundle {} suspended", bundle);
        Ok(())
    }

    /// Release a suspended bundle back to the forwarder.
    pub fn resume(&self, bundle: Addr) -> Result<()> {
        let mut wake = Wakeups::default();
        let mut txn = self.heap.begin();
        let mut rec: BundleRec = txn.get(bundle)?;
        if !rec.suspended {
            return Ok(());
        }

        if !rec.duct_xmit_elt.is_null() {
            txn.list_delete(rec.duct_xmit_elt)?;
            rec.duct_xmit_elt = Addr::NULL;
        }
        rec.suspended = false;
        txn.put(bundle, &rec)?;
        txn.list_insert_last(self.fwd_queue, bundle)?;
        wake.push(self.fwd_sem.clone());
        txn.commit()?;
        wake.fire();
        Ok(())
    }

    /// Park an unqueued bundle in the limbo queue for a later reforward.
    pub(crate) fn send_to_limbo(&self, bundle: Addr) -> Result<()> {
        let mut txn = self.heap.begin();
        let mut rec: BundleRec = txn.get(bundle)?;
        if !rec.duct_xmit_elt.is_null() {
            txn.list_delete(rec.duct_xmit_elt)?;
        }
        let elt = txn.list_insert_last(self.limbo, bundle)?;
        rec.duct_xmit_elt = elt;
        txn.put(bundle, &rec)?;
        txn.commit()?;
        Ok(())
    }

    /// Reforward everything sitting in limbo, e.g. after a plan change.
    pub fn reforward_limbo(&self) -> Result<()> {
        let mut wake = Wakeups::default();
        let mut txn = self.heap.begin();
        loop {
            let bundle = txn.list_pop_first(self.limbo)?;
            if bundle.is_null() {
                break;
            }
            let mut rec: BundleRec = txn.get(bundle)?;
            rec.duct_xmit_elt = Addr::NULL;
            txn.put(bundle, &rec)?;
            txn.list_insert_last(self.fwd_queue, bundle)?;
            wake.push(self.fwd_sem.clone());
        }
        txn.commit()?;
        wake.fire();
        Ok(())
    }

    /// True if the bundle sits in the limbo queue.
    pub fn in_limbo(&self, bundle: Addr) -> Result<bool> {
        let txn = self.heap.begin();
        let rec: BundleRec = txn.get(bundle)?;
        if rec.duct_xmit_elt.is_null() {
            return Ok(false);
        }
        Ok(txn.list_of(rec.duct_xmit_elt)? == self.limbo)
    }

    /// Cancel an admitted bundle outright.
    pub fn cancel(&self, bundle: Addr) -> Result<()> {
        let mut wake = Wakeups::default();
        let mut txn = self.heap.begin();
        let rec: BundleRec = txn.get(bundle)?;
        self.destroy_bundle(&mut txn, &mut wake, bundle, &rec, REASON_NONE)?;
        txn.commit()?;
        wake.fire();
        Ok(())
    }

    /// Receive one bundle from the endpoint, honoring the requested
    /// timeout discipline.
    pub fn receive(&self, sap: &Sap, timeout: BpTimeout) -> Result<BpDelivery> {
        let vep = self.endpoint(sap.service)?;
        let self_task = self.ipc.tasks.self_id();
        if vep.app_task.load(Ordering::Relaxed) != self_task {
            return Err(DtnError::new("Not the owner of this endpoint"));
        }
        if vep.sem.is_ended() {
            return Ok(BpDelivery::empty(BpIndication::EndpointStopped));
        }

        // Fast path: a bundle is already waiting.
        if let Some(delivery) = self.try_deliver(&vep)? {
            return Ok(delivery);
        }

        match timeout {
            BpTimeout::Poll => {
                return Ok(BpDelivery::empty(BpIndication::ReceptionTimedOut));
            }
            BpTimeout::Blocking => match vep.sem.take() {
                SemTake::Ended => {
                    return Ok(BpDelivery::empty(BpIndication::EndpointStopped));
                }
                SemTake::Taken | SemTake::TimedOut => {}
            },
            BpTimeout::Seconds(secs) => {
                // A one-shot timer task signals the same semaphore; an
                // auxiliary flag distinguishes its wakeup from an
                // interrupt.
                vep.timed_out.store(false, Ordering::Relaxed);
                let sem = vep.sem.clone();
                let flag = vep.timed_out.clone();
                let deadline = std::time::Instant::now() + std::time::Duration::from_secs(secs as u64);
                let timer = self.ipc.tasks.spawn_fn("bptimer", move |args| {
                    while std::time::Instant::now() < deadline {
                        if args.stop_requested() {
                            return;
                        }
                        std::thread::sleep(std::time::Duration::from_millis(100));
                    }
                    flag.store(true, Ordering::Relaxed);
                    sem.give();
                })?;

                let take = vep.sem.take();
                self.ipc.tasks.kill(timer, 15);
                self.ipc.tasks.delete(timer);
                if take == SemTake::Ended {
                    return Ok(BpDelivery::empty(BpIndication::EndpointStopped));
                }
            }
        }

        match self.try_deliver(&vep)? {
            Some(delivery) => Ok(delivery),
            None => {
                if vep.timed_out.swap(false, Ordering::Relaxed) {
                    Ok(BpDelivery::empty(BpIndication::ReceptionTimedOut))
                } else {
                    Ok(BpDelivery::empty(BpIndication::ReceptionInterrupted))
                }
            }
        }
    }

    fn try_deliver(&self, vep: &VEndpoint) -> Result<Option<BpDelivery>> {
        let mut wake = Wakeups::default();
        let mut txn = self.heap.begin();
        let ep_rec: EndpointRec = txn.get(vep.rec)?;
        let bundle = txn.list_pop_first(ep_rec.delivery_queue)?;
        if bundle.is_null() {
            txn.cancel();
            return Ok(None);
        }

        let rec: BundleRec = txn.get(bundle)?;
        self.send_status_report(&mut txn, &mut wake, &rec, BP_DELIVERED_RPT, REASON_NONE)?;
        if rec.custody == CustodySwitch::SourceCustodyRequired {
            self.send_custody_signal(&mut txn, &mut wake, &rec, true, REASON_NONE)?;
        }

        let delivery = BpDelivery {
            result: BpIndication::PayloadPresent,
            adu: Some(rec.payload),
            source: rec.source_eid(),
            creation: rec.creation,
            payload_length: rec.payload_length,
            admin_record: rec.admin_record,
        };

        // The application owns the payload now; drop the rest of the
        // bundle.
        if !rec.prox_node_eid.is_null() {
            txn.free(rec.prox_node_eid)?;
        }
        if !rec.tracking_elts.is_null() {
            txn.list_destroy(rec.tracking_elts)?;
        }
        self.purge_timeline(&mut txn, bundle)?;
        txn.free(bundle)?;
        txn.commit()?;
        wake.fire();
        Ok(Some(delivery))
    }

    /// Wake a blocked [`BpNode::receive`] with an interruption.
    pub fn interrupt(&self, sap: &Sap) {
        if let Ok(vep) = self.endpoint(sap.service) {
            vep.sem.give();
        }
    }

    /// Release a delivered payload.
    pub fn release_delivery(&self, delivery: BpDelivery) -> Result<()> {
        if let Some(adu) = delivery.adu {
            let mut txn = self.heap.begin();
            zco::destroy(&mut txn, adu)?;
            txn.commit()?;
        }
        Ok(())
    }

    /// One pass over the timeline: expire TTLs, fire custody-due
    /// reforwards. Collection and action share one transaction so a
    /// timer can never outlive its bundle.
    pub fn clock_tick(&self) -> Result<()> {
        let now = Self::now();
        let mut wake = Wakeups::default();
        let mut txn = self.heap.begin();

        let mut expired = Vec::new();
        let mut elt = txn.list_first(self.timeline)?;
        while !elt.is_null() {
            let next = txn.list_next(elt)?;
            let addr = txn.list_data(elt)?;
            let rec: TimelineRec = txn.get(addr)?;
            if rec.deadline <= now {
                txn.free(addr)?;
                txn.list_delete(elt)?;
                expired.push(rec);
            }
            elt = next;
        }

        let mut destroyed: Vec<Addr> = Vec::new();
        for timer in expired {
            if destroyed.contains(&timer.bundle) {
                continue;
            }
            let rec: BundleRec = txn.get(timer.bundle)?;
            if timer.kind == TIMELINE_TTL {
                log::debug!("Bundle {} expired", timer.bundle);
                self.destroy_bundle(&mut txn, &mut wake, timer.bundle, &rec, REASON_EXPIRED)?;
                destroyed.push(timer.bundle);
            } else {
                // Custody-due: no custody signal arrived in time.
                log::debug!("Custody due for bundle {}; reforwarding", timer.bundle);
                let mut rec = rec;
                if !rec.duct_xmit_elt.is_null() {
                    txn.list_delete(rec.duct_xmit_elt)?;
                    rec.duct_xmit_elt = Addr::NULL;
                    txn.put(timer.bundle, &rec)?;
                }
                txn.list_insert_last(self.fwd_queue, timer.bundle)?;
                wake.push(self.fwd_sem.clone());
            }
        }

        txn.commit()?;
        wake.fire();
        Ok(())
    }

    /// Start the forwarder and clock daemons.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let node = self.clone();
        let forwarder = self.ipc.tasks.spawn_fn("bpforwarder", move |args| {
            while !args.stop_requested() {
                match node.fwd_sem.take() {
                    SemTake::Ended => break,
                    SemTake::Taken | SemTake::TimedOut => {}
                }
                let bundle = {
                    let mut txn = node.heap.begin();
                    let bundle = match txn.list_pop_first(node.fwd_queue) {
                        Ok(addr) => addr,
                        Err(e) => {
                            log::error!("Forwarder queue failure: {}", e);
                            break;
                        }
                    };
                    if let Err(e) = txn.commit() {
                        log::error!("Forwarder commit failure: {}", e);
                        break;
                    }
                    bundle
                };
                if bundle.is_null() {
                    continue;
                }
                if let Err(e) = node.forward_bundle(bundle) {
                    log::error!("Forwarding failed: {}", e);
                }
            }
            log::info!("Forwarder stopped");
        })?;
        self.tasks.lock().push(forwarder);

        let node = self.clone();
        let clock = self.ipc.tasks.spawn_fn("bpclock", move |args| {
            while !args.stop_requested() && node.running.load(Ordering::Relaxed) {
                std::thread::sleep(std::time::Duration::from_secs(1));
                if let Err(e) = node.clock_tick() {
                    log::error!("BP clock tick failed: {}", e);
                }
            }
        })?;
        self.tasks.lock().push(clock);
        Ok(())
    }

    /// Stop the node: end all semaphores and wind down the daemons.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.fwd_sem.end();
        for vep in self.endpoints.lock().values() {
            vep.sem.end();
        }
        for duct in self.outducts.lock().values() {
            duct.stop();
        }
        let tasks: Vec<TaskId> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            self.ipc.tasks.kill(task, 15);
            self.ipc.tasks.join(task);
        }
        log::info!("Node ipn:{}.* stopped", self.node_nbr);
    }

    /// Parse a JSON node configuration.
    pub fn parse_config(text: &str) -> Result<NodeConfig> {
        serde_json::from_str(text).map_err(|e| DtnError::new(format!("Bad node config: {}", e)))
    }

    /// Remaining seconds before the DTN epoch-based creation time plus
    /// TTL lapses; used by receivers of status reports.
    pub fn remaining_ttl(creation_secs: u64, ttl: u64) -> u64 {
        let age = tools::dtn_time_now().saturating_sub(creation_secs);
        ttl.saturating_sub(age)
    }
}
