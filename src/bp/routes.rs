//! Forwarding tables: plans, rules, groups, and the stream log.
//!
//! Plans are keyed by destination node number; each carries up to three
//! transmission directives (default, real-time, playback) and per-source
//! rule overrides. Groups cover node ranges and back up the plans. The
//! stream log records the latest creation time seen per stream so that
//! in-order ("current") traffic rides the real-time directive and
//! catch-up traffic rides playback. Everything durable lives under the
//! `"ipnRoute"` catalog name.

use super::eid::Eid;
use crate::store::{Addr, Rec, Txn};
use crate::tools::error::{DtnError, Result};
use parking_lot::Mutex;

/// Wildcard source node or service number in a rule.
pub const ALL_OTHERS: u64 = u64::MAX;

fn get(buf: &[u8], i: usize) -> u64 {
    u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap())
}

fn put(buf: &mut [u8], i: usize, v: u64) {
    buf[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
}

#[derive(Debug, Default)]
struct RouteDbRec {
    plans: Addr,
    groups: Addr,
    bss_entries: Addr,
}

impl Rec for RouteDbRec {
    const SIZE: usize = 24;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.plans.0);
        put(buf, 1, self.groups.0);
        put(buf, 2, self.bss_entries.0);
    }

    fn decode(buf: &[u8]) -> Self {
        RouteDbRec {
            plans: Addr(get(buf, 0)),
            groups: Addr(get(buf, 1)),
            bss_entries: Addr(get(buf, 2)),
        }
    }
}

/// The three directives of a plan, group, or rule: outduct names, empty
/// when unset.
#[derive(Debug, Default, Clone)]
pub struct DirectiveSet {
    /// Used when no mode preference applies
    pub default_duct: String,
    /// Real-time mode
    pub rt_duct: String,
    /// Playback mode
    pub pb_duct: String,
}

#[derive(Debug, Default)]
struct PlanRec {
    node_nbr: u64,
    expected_rtt: u64,
    default_duct: Addr,
    rt_duct: Addr,
    pb_duct: Addr,
    rules: Addr,
}

impl Rec for PlanRec {
    const SIZE: usize = 48;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.node_nbr);
        put(buf, 1, self.expected_rtt);
        put(buf, 2, self.default_duct.0);
        put(buf, 3, self.rt_duct.0);
        put(buf, 4, self.pb_duct.0);
        put(buf, 5, self.rules.0);
    }

    fn decode(buf: &[u8]) -> Self {
        PlanRec {
            node_nbr: get(buf, 0),
            expected_rtt: get(buf, 1),
            default_duct: Addr(get(buf, 2)),
            rt_duct: Addr(get(buf, 3)),
            pb_duct: Addr(get(buf, 4)),
            rules: Addr(get(buf, 5)),
        }
    }
}

#[derive(Debug, Default)]
struct RuleRec {
    src_service: u64,
    src_node: u64,
    default_duct: Addr,
    rt_duct: Addr,
    pb_duct: Addr,
}

impl Rec for RuleRec {
    const SIZE: usize = 40;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.src_service);
        put(buf, 1, self.src_node);
        put(buf, 2, self.default_duct.0);
        put(buf, 3, self.rt_duct.0);
        put(buf, 4, self.pb_duct.0);
    }

    fn decode(buf: &[u8]) -> Self {
        RuleRec {
            src_service: get(buf, 0),
            src_node: get(buf, 1),
            default_duct: Addr(get(buf, 2)),
            rt_duct: Addr(get(buf, 3)),
            pb_duct: Addr(get(buf, 4)),
        }
    }
}

#[derive(Debug, Default)]
struct GroupRec {
    first_node: u64,
    last_node: u64,
    default_duct: Addr,
    rules: Addr,
}

impl Rec for GroupRec {
    const SIZE: usize = 32;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.first_node);
        put(buf, 1, self.last_node);
        put(buf, 2, self.default_duct.0);
        put(buf, 3, self.rules.0);
    }

    fn decode(buf: &[u8]) -> Self {
        GroupRec {
            first_node: get(buf, 0),
            last_node: get(buf, 1),
            default_duct: Addr(get(buf, 2)),
            rules: Addr(get(buf, 3)),
        }
    }
}

#[derive(Debug, Default)]
struct BssEntryRec {
    node_nbr: u64,
    service_nbr: u64,
}

impl Rec for BssEntryRec {
    const SIZE: usize = 16;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.node_nbr);
        put(buf, 1, self.service_nbr);
    }

    fn decode(buf: &[u8]) -> Self {
        BssEntryRec {
            node_nbr: get(buf, 0),
            service_nbr: get(buf, 1),
        }
    }
}

/// One logged stream: latest creation time seen for a
/// (source, destination) endpoint pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stream {
    /// Source node number
    pub src_node: u64,
    /// Source service number
    pub src_service: u64,
    /// Destination node number
    pub dst_node: u64,
    /// Destination service number
    pub dst_service: u64,
    /// Latest creation timestamp logged for this stream
    pub latest: (u64, u64),
}

impl Stream {
    fn key(&self) -> (u64, u64, u64, u64) {
        (self.src_node, self.src_service, self.dst_node, self.dst_service)
    }
}

/// In-memory log of observed streams, kept sorted by stream key.
#[derive(Debug, Default)]
pub struct StreamLog {
    streams: Mutex<Vec<Stream>>,
}

impl StreamLog {
    /// Record `creation` for the stream of (source, destination),
    /// keeping only the newest time.
    pub fn monitor(&self, source: Eid, destination: Eid, creation: (u64, u64)) {
        let (src_node, src_service) = source.cbhe();
        let (dst_node, dst_service) = destination.cbhe();
        let entry = Stream {
            src_node,
            src_service,
            dst_node,
            dst_service,
            latest: creation,
        };

        let mut streams = self.streams.lock();
        match streams.binary_search_by_key(&entry.key(), Stream::key) {
            Ok(i) => {
                if creation > streams[i].latest {
                    streams[i].latest = creation;
                }
            }
            Err(i) => streams.insert(i, entry),
        }
    }

    /// Latest logged creation time for the stream, if any.
    pub fn latest(&self, source: Eid, destination: Eid) -> Option<(u64, u64)> {
        let (src_node, src_service) = source.cbhe();
        let (dst_node, dst_service) = destination.cbhe();
        let probe = Stream {
            src_node,
            src_service,
            dst_node,
            dst_service,
            latest: (0, 0),
        };
        let streams = self.streams.lock();
        streams
            .binary_search_by_key(&probe.key(), Stream::key)
            .ok()
            .map(|i| streams[i].latest)
    }
}

/// Handle on the durable routing database.
#[derive(Debug, Clone, Copy)]
pub struct Routes {
    db: Addr,
}

impl Routes {
    /// Find or create the `"ipnRoute"` database.
    pub fn attach(txn: &mut Txn) -> Result<Routes> {
        if let Some(db) = txn.find("ipnRoute")? {
            return Ok(Routes { db });
        }
        let rec = RouteDbRec {
            plans: txn.list_create()?,
            groups: txn.list_create()?,
            bss_entries: txn.list_create()?,
        };
        let db = txn.alloc_rec(&rec)?;
        txn.catlg("ipnRoute", db)?;
        Ok(Routes { db })
    }

    fn rec(&self, txn: &Txn) -> Result<RouteDbRec> {
        txn.get(self.db)
    }

    fn put_directives(txn: &mut Txn, ducts: &DirectiveSet) -> Result<(Addr, Addr, Addr)> {
        let default_duct = if ducts.default_duct.is_empty() {
            Addr::NULL
        } else {
            txn.put_str(&ducts.default_duct)?
        };
        let rt_duct = if ducts.rt_duct.is_empty() {
            Addr::NULL
        } else {
            txn.put_str(&ducts.rt_duct)?
        };
        let pb_duct = if ducts.pb_duct.is_empty() {
            Addr::NULL
        } else {
            txn.put_str(&ducts.pb_duct)?
        };
        Ok((default_duct, rt_duct, pb_duct))
    }

    /// Add a plan for bundles destined to `node_nbr`. Plans are kept
    /// sorted by node number; duplicates are rejected.
    pub fn add_plan(
        &self,
        txn: &mut Txn,
        node_nbr: u64,
        expected_rtt: u64,
        ducts: &DirectiveSet,
    ) -> Result<()> {
        if node_nbr == 0 || ducts.default_duct.is_empty() {
            return Err(DtnError::new("Plan needs a node number and a default duct"));
        }

        let db = self.rec(txn)?;
        let mut next_elt = Addr::NULL;
        let mut elt = txn.list_first(db.plans)?;
        while !elt.is_null() {
            let plan: PlanRec = txn.get(txn.list_data(elt)?)?;
            if plan.node_nbr == node_nbr {
                return Err(DtnError::new(format!("Plan for node {} exists", node_nbr)));
            }
            if plan.node_nbr > node_nbr {
                next_elt = elt;
                break;
            }
            elt = txn.list_next(elt)?;
        }

        let (default_duct, rt_duct, pb_duct) = Self::put_directives(txn, ducts)?;
        let rec = PlanRec {
            node_nbr,
            expected_rtt,
            default_duct,
            rt_duct,
            pb_duct,
            rules: txn.list_create()?,
        };
        let addr = txn.alloc_rec(&rec)?;
        if next_elt.is_null() {
            txn.list_insert_last(db.plans, addr)?;
        } else {
            txn.list_insert_before(next_elt, addr)?;
        }
        log::info!("Added plan for node {}", node_nbr);
        Ok(())
    }

    /// Remove the plan for `node_nbr`, including its rules.
    pub fn remove_plan(&self, txn: &mut Txn, node_nbr: u64) -> Result<()> {
        let db = self.rec(txn)?;
        let mut elt = txn.list_first(db.plans)?;
        while !elt.is_null() {
            let addr = txn.list_data(elt)?;
            let plan: PlanRec = txn.get(addr)?;
            if plan.node_nbr == node_nbr {
                free_directive(txn, plan.default_duct)?;
                free_directive(txn, plan.rt_duct)?;
                free_directive(txn, plan.pb_duct)?;
                destroy_rules(txn, plan.rules)?;
                txn.free(addr)?;
                txn.list_delete(elt)?;
                return Ok(());
            }
            elt = txn.list_next(elt)?;
        }
        Err(DtnError::new(format!("No plan for node {}", node_nbr)))
    }

    fn find_plan(&self, txn: &Txn, node_nbr: u64) -> Result<Option<PlanRec>> {
        let db = self.rec(txn)?;
        let mut elt = txn.list_first(db.plans)?;
        while !elt.is_null() {
            let plan: PlanRec = txn.get(txn.list_data(elt)?)?;
            if plan.node_nbr == node_nbr {
                return Ok(Some(plan));
            }
            if plan.node_nbr > node_nbr {
                break;
            }
            elt = txn.list_next(elt)?;
        }
        Ok(None)
    }

    /// Expected round-trip time of the plan for `node_nbr`, or 0.
    pub fn expected_rtt(&self, txn: &Txn, node_nbr: u64) -> Result<u64> {
        Ok(self.find_plan(txn, node_nbr)?.map_or(0, |p| p.expected_rtt))
    }

    /// Add a per-source rule to the plan for `node_nbr`. Rules stay
    /// sorted so that wildcards land at the tail of the list.
    pub fn add_plan_rule(
        &self,
        txn: &mut Txn,
        node_nbr: u64,
        src_service: u64,
        src_node: u64,
        ducts: &DirectiveSet,
    ) -> Result<()> {
        let plan = self
            .find_plan(txn, node_nbr)?
            .ok_or_else(|| DtnError::new(format!("No plan for node {}", node_nbr)))?;
        add_rule(txn, plan.rules, src_service, src_node, ducts)
    }

    /// Add a group covering `[first_node, last_node]`. Groups are sorted
    /// by range size then first node, so the first covering group found
    /// in a scan is the narrowest fit.
    pub fn add_group(
        &self,
        txn: &mut Txn,
        first_node: u64,
        last_node: u64,
        ducts: &DirectiveSet,
    ) -> Result<()> {
        if first_node > last_node || ducts.default_duct.is_empty() {
            return Err(DtnError::new("Bad group range or missing duct"));
        }

        let size = last_node - first_node;
        let db = self.rec(txn)?;
        let mut next_elt = Addr::NULL;
        let mut elt = txn.list_first(db.groups)?;
        while !elt.is_null() {
            let group: GroupRec = txn.get(txn.list_data(elt)?)?;
            let group_size = group.last_node - group.first_node;
            if group.first_node == first_node && group.last_node == last_node {
                return Err(DtnError::new("Group exists"));
            }
            if (group_size, group.first_node) > (size, first_node) {
                next_elt = elt;
                break;
            }
            elt = txn.list_next(elt)?;
        }

        let (default_duct, _rt, _pb) = Self::put_directives(txn, ducts)?;
        let rec = GroupRec {
            first_node,
            last_node,
            default_duct,
            rules: txn.list_create()?,
        };
        let addr = txn.alloc_rec(&rec)?;
        if next_elt.is_null() {
            txn.list_insert_last(db.groups, addr)?;
        } else {
            txn.list_insert_before(next_elt, addr)?;
        }
        log::info!("Added group for nodes {}..={}", first_node, last_node);
        Ok(())
    }

    /// Add a per-source rule to the group covering exactly
    /// `[first_node, last_node]`.
    pub fn add_group_rule(
        &self,
        txn: &mut Txn,
        first_node: u64,
        last_node: u64,
        src_service: u64,
        src_node: u64,
        ducts: &DirectiveSet,
    ) -> Result<()> {
        let db = self.rec(txn)?;
        let mut elt = txn.list_first(db.groups)?;
        while !elt.is_null() {
            let group: GroupRec = txn.get(txn.list_data(elt)?)?;
            if group.first_node == first_node && group.last_node == last_node {
                return add_rule(txn, group.rules, src_service, src_node, ducts);
            }
            elt = txn.list_next(elt)?;
        }
        Err(DtnError::new("No such group"))
    }

    /// Mark a destination endpoint as BSS traffic.
    pub fn add_bss_entry(&self, txn: &mut Txn, node_nbr: u64, service_nbr: u64) -> Result<()> {
        let db = self.rec(txn)?;
        let mut elt = txn.list_first(db.bss_entries)?;
        while !elt.is_null() {
            let entry: BssEntryRec = txn.get(txn.list_data(elt)?)?;
            if entry.node_nbr == node_nbr && entry.service_nbr == service_nbr {
                return Ok(());
            }
            elt = txn.list_next(elt)?;
        }
        let addr = txn.alloc_rec(&BssEntryRec {
            node_nbr,
            service_nbr,
        })?;
        txn.list_insert_last(db.bss_entries, addr)?;
        Ok(())
    }

    /// Remove a BSS destination endpoint.
    pub fn remove_bss_entry(&self, txn: &mut Txn, node_nbr: u64, service_nbr: u64) -> Result<()> {
        let db = self.rec(txn)?;
        let mut elt = txn.list_first(db.bss_entries)?;
        while !elt.is_null() {
            let addr = txn.list_data(elt)?;
            let entry: BssEntryRec = txn.get(addr)?;
            if entry.node_nbr == node_nbr && entry.service_nbr == service_nbr {
                txn.free(addr)?;
                txn.list_delete(elt)?;
                return Ok(());
            }
            elt = txn.list_next(elt)?;
        }
        Ok(())
    }

    pub(crate) fn is_bss_destination(&self, txn: &Txn, destination: Eid) -> Result<bool> {
        let (node, service) = destination.cbhe();
        let db = self.rec(txn)?;
        let mut elt = txn.list_first(db.bss_entries)?;
        while !elt.is_null() {
            let entry: BssEntryRec = txn.get(txn.list_data(elt)?)?;
            if entry.node_nbr == node && entry.service_nbr == service {
                return Ok(true);
            }
            elt = txn.list_next(elt)?;
        }
        Ok(false)
    }

    /// Pick the directive mode for a bundle: real-time when the bundle is
    /// current for its stream, playback when it lags, the default
    /// directive otherwise or as fallback.
    fn choose(
        &self,
        txn: &Txn,
        default_duct: Addr,
        rt_duct: Addr,
        pb_duct: Addr,
        source: Eid,
        destination: Eid,
        creation: (u64, u64),
        streams: &StreamLog,
    ) -> Result<Option<String>> {
        let choice = if self.is_bss_destination(txn, destination)? {
            match streams.latest(source, destination) {
                None => {
                    if !rt_duct.is_null() {
                        rt_duct
                    } else {
                        default_duct
                    }
                }
                Some(latest) => {
                    if creation > latest {
                        if !rt_duct.is_null() {
                            rt_duct
                        } else {
                            default_duct
                        }
                    } else if !pb_duct.is_null() {
                        pb_duct
                    } else {
                        default_duct
                    }
                }
            }
        } else {
            default_duct
        };

        if choice.is_null() {
            return Ok(None);
        }
        Ok(Some(txn.get_str(choice)?))
    }

    /// Resolve the outduct for a bundle, per plans, groups, rules, and
    /// the stream log. `None` means no route: the bundle goes to limbo.
    pub fn lookup_directive(
        &self,
        txn: &Txn,
        source: Eid,
        destination: Eid,
        creation: (u64, u64),
        streams: &StreamLog,
    ) -> Result<Option<String>> {
        let dest_node = match destination.node() {
            Some(node) => node,
            None => return Ok(None),
        };
        let (src_node, src_service) = source.cbhe();

        if let Some(plan) = self.find_plan(txn, dest_node)? {
            if let Some(rule) = lookup_rule(txn, plan.rules, src_service, src_node)? {
                return self.choose(
                    txn,
                    rule.default_duct,
                    rule.rt_duct,
                    rule.pb_duct,
                    source,
                    destination,
                    creation,
                    streams,
                );
            }
            return self.choose(
                txn,
                plan.default_duct,
                plan.rt_duct,
                plan.pb_duct,
                source,
                destination,
                creation,
                streams,
            );
        }

        // No plan; fall back to the narrowest covering group.
        let db = self.rec(txn)?;
        let mut elt = txn.list_first(db.groups)?;
        while !elt.is_null() {
            let group: GroupRec = txn.get(txn.list_data(elt)?)?;
            if group.first_node <= dest_node && dest_node <= group.last_node {
                if let Some(rule) = lookup_rule(txn, group.rules, src_service, src_node)? {
                    return self.choose(
                        txn,
                        rule.default_duct,
                        rule.rt_duct,
                        rule.pb_duct,
                        source,
                        destination,
                        creation,
                        streams,
                    );
                }
                if group.default_duct.is_null() {
                    return Ok(None);
                }
                return Ok(Some(txn.get_str(group.default_duct)?));
            }
            elt = txn.list_next(elt)?;
        }

        Ok(None)
    }
}

fn free_directive(txn: &mut Txn, duct: Addr) -> Result<()> {
    if !duct.is_null() {
        txn.free(duct)?;
    }
    Ok(())
}

fn destroy_rules(txn: &mut Txn, rules: Addr) -> Result<()> {
    let mut elt = txn.list_first(rules)?;
    while !elt.is_null() {
        let addr = txn.list_data(elt)?;
        let rule: RuleRec = txn.get(addr)?;
        free_directive(txn, rule.default_duct)?;
        free_directive(txn, rule.rt_duct)?;
        free_directive(txn, rule.pb_duct)?;
        txn.free(addr)?;
        elt = txn.list_next(elt)?;
    }
    txn.list_destroy(rules)
}

/// Insert a rule keeping the list sorted ascending by (service, node),
/// which parks universal wildcards at the tail.
fn add_rule(
    txn: &mut Txn,
    rules: Addr,
    src_service: u64,
    src_node: u64,
    ducts: &DirectiveSet,
) -> Result<()> {
    let mut next_elt = Addr::NULL;
    let mut elt = txn.list_first(rules)?;
    while !elt.is_null() {
        let rule: RuleRec = txn.get(txn.list_data(elt)?)?;
        if rule.src_service == src_service && rule.src_node == src_node {
            return Err(DtnError::new("Rule exists"));
        }
        if (rule.src_service, rule.src_node) > (src_service, src_node) {
            next_elt = elt;
            break;
        }
        elt = txn.list_next(elt)?;
    }

    let (default_duct, rt_duct, pb_duct) = Routes::put_directives(txn, ducts)?;
    let rec = RuleRec {
        src_service,
        src_node,
        default_duct,
        rt_duct,
        pb_duct,
    };
    let addr = txn.alloc_rec(&rec)?;
    if next_elt.is_null() {
        txn.list_insert_last(rules, addr)?;
    } else {
        txn.list_insert_before(next_elt, addr)?;
    }
    Ok(())
}

/// Best-match rule scan: the wildcard (`ALL_OTHERS`) entries live at the
/// tail, so the whole list must be walked.
fn lookup_rule(
    txn: &Txn,
    rules: Addr,
    src_service: u64,
    src_node: u64,
) -> Result<Option<RuleRec>> {
    let mut elt = txn.list_first(rules)?;
    while !elt.is_null() {
        let rule: RuleRec = txn.get(txn.list_data(elt)?)?;
        if rule.src_service < src_service
            || (rule.src_service > src_service && rule.src_service != ALL_OTHERS)
        {
            elt = txn.list_next(elt)?;
            continue;
        }
        if rule.src_node < src_node || (rule.src_node > src_node && rule.src_node != ALL_OTHERS) {
            elt = txn.list_next(elt)?;
            continue;
        }
        return Ok(Some(rule));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Heap;

    fn setup() -> (tempfile::TempDir, Heap) {
        crate::tests::init();
        let dir = tempfile::tempdir().unwrap();
        let heap = Heap::create(dir.path().join("routes.heap"), 1 << 20).unwrap();
        (dir, heap)
    }

    fn ducts(name: &str) -> DirectiveSet {
        DirectiveSet {
            default_duct: name.to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_lookup() {
        let (_dir, heap) = setup();
        let streams = StreamLog::default();
        let mut txn = heap.begin();
        let routes = Routes::attach(&mut txn).unwrap();
        routes.add_plan(&mut txn, 7, 10, &ducts("stcp/a")).unwrap();
        routes.add_plan(&mut txn, 3, 4, &ducts("stcp/b")).unwrap();

        let duct = routes
            .lookup_directive(&txn, Eid::ipn(1, 1), Eid::ipn(7, 2), (100, 0), &streams)
            .unwrap();
        assert_eq!(duct.as_deref(), Some("stcp/a"));
        assert_eq!(routes.expected_rtt(&txn, 7).unwrap(), 10);

        let none = routes
            .lookup_directive(&txn, Eid::ipn(1, 1), Eid::ipn(9, 2), (100, 0), &streams)
            .unwrap();
        assert!(none.is_none());
        txn.commit().unwrap();
    }

    #[test]
    fn test_rule_overrides_plan() {
        let (_dir, heap) = setup();
        let streams = StreamLog::default();
        let mut txn = heap.begin();
        let routes = Routes::attach(&mut txn).unwrap();
        routes.add_plan(&mut txn, 7, 0, &ducts("plain")).unwrap();
        routes
            .add_plan_rule(&mut txn, 7, 5, 1, &ducts("special"))
            .unwrap();
        routes
            .add_plan_rule(&mut txn, 7, ALL_OTHERS, ALL_OTHERS, &ducts("wild"))
            .unwrap();

        // Exact source match takes the rule.
        let duct = routes
            .lookup_directive(&txn, Eid::ipn(1, 5), Eid::ipn(7, 2), (100, 0), &streams)
            .unwrap();
        assert_eq!(duct.as_deref(), Some("special"));

        // Any other source matches the wildcard at the tail.
        let duct = routes
            .lookup_directive(&txn, Eid::ipn(2, 9), Eid::ipn(7, 2), (100, 0), &streams)
            .unwrap();
        assert_eq!(duct.as_deref(), Some("wild"));
        txn.commit().unwrap();
    }

    #[test]
    fn test_group_narrowest_fit() {
        let (_dir, heap) = setup();
        let streams = StreamLog::default();
        let mut txn = heap.begin();
        let routes = Routes::attach(&mut txn).unwrap();
        routes.add_group(&mut txn, 1, 100, &ducts("wide")).unwrap();
        routes.add_group(&mut txn, 10, 20, &ducts("narrow")).unwrap();

        let duct = routes
            .lookup_directive(&txn, Eid::ipn(1, 1), Eid::ipn(15, 2), (100, 0), &streams)
            .unwrap();
        assert_eq!(duct.as_deref(), Some("narrow"));

        let duct = routes
            .lookup_directive(&txn, Eid::ipn(1, 1), Eid::ipn(50, 2), (100, 0), &streams)
            .unwrap();
        assert_eq!(duct.as_deref(), Some("wide"));
        txn.commit().unwrap();
    }

    #[test]
    fn test_bss_stream_mode_selection() {
        let (_dir, heap) = setup();
        let streams = StreamLog::default();
        let mut txn = heap.begin();
        let routes = Routes::attach(&mut txn).unwrap();
        routes
            .add_plan(
                &mut txn,
                7,
                0,
                &DirectiveSet {
                    default_duct: "plain".to_owned(),
                    rt_duct: "rt".to_owned(),
                    pb_duct: "pb".to_owned(),
                },
            )
            .unwrap();
        routes.add_bss_entry(&mut txn, 7, 2).unwrap();

        let src = Eid::ipn(1, 1);
        let dst = Eid::ipn(7, 2);

        // Unlogged stream: real-time.
        let duct = routes
            .lookup_directive(&txn, src, dst, (100, 0), &streams)
            .unwrap();
        assert_eq!(duct.as_deref(), Some("rt"));

        // Current bundle (newer than logged): real-time.
        streams.monitor(src, dst, (100, 0));
        let duct = routes
            .lookup_directive(&txn, src, dst, (100, 1), &streams)
            .unwrap();
        assert_eq!(duct.as_deref(), Some("rt"));

        // Stale bundle: playback.
        let duct = routes
            .lookup_directive(&txn, src, dst, (99, 5), &streams)
            .unwrap();
        assert_eq!(duct.as_deref(), Some("pb"));

        // Non-BSS destination keeps the default directive.
        let duct = routes
            .lookup_directive(&txn, src, Eid::ipn(7, 9), (100, 0), &streams)
            .unwrap();
        assert_eq!(duct.as_deref(), Some("plain"));
        txn.commit().unwrap();
    }
}
