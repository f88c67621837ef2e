//! LTP convergence layer.
//!
//! Outbound, each bundle becomes one LTP service-data unit: a clone of
//! the payload ZCO with the encoded BP header prepended as a capsule, so
//! the payload bytes are never copied on their way to the link. Inbound,
//! reassembled red parts (and green segment streams) are fed to bundle
//! acquisition.

use super::acquire::AcqWorkArea;
use super::bundle::{self, BundleRec};
use super::cos::CustodySwitch;
use super::node::{BpNode, DequeuedBundle, Outduct, Wakeups};
use crate::ipc::{TaskArgs, TaskId};
use crate::ltp::{Engine, LtpNotice};
use crate::tools::error::{DtnError, Result};
use crate::zco::{self, ZcoReader};
use std::collections::HashMap;
use std::sync::Arc;

/// LTP client service id carrying Bundle Protocol traffic.
pub const LTP_CLIENT_BP: u64 = 1;

/// Queue one bundle into the LTP engine as a single block.
fn send_bundle(node: &BpNode, engine: &Engine, peer_engine: u64, bundle_addr: crate::store::Addr) -> Result<()> {
    let mut txn = node.heap().begin();
    let rec: BundleRec = txn.get(bundle_addr)?;

    // The block is a zero-copy clone of the payload with the encoded BP
    // blocks prepended as a header capsule.
    let block = zco::clone(&mut txn, rec.payload, 0, rec.payload_length)?;
    let mut header = bundle::encode_header(&rec);
    header.extend_from_slice(&bundle::encode_payload_header(rec.payload_length));
    zco::prepend_header(&mut txn, block, &header)?;
    txn.commit()?;

    let red_length = if rec.ecos.best_effort() {
        0
    } else {
        u64::MAX
    };
    match engine.send(peer_engine, LTP_CLIENT_BP, block, red_length) {
        Ok(_) => Ok(()),
        Err(e) => {
            // The engine refused the block; reclaim the clone.
            let mut txn = node.heap().begin();
            zco::destroy(&mut txn, block)?;
            txn.commit()?;
            Err(e)
        }
    }
}

/// LTP convergence-layer output daemon for one duct.
pub fn ltpclo_run(node: &BpNode, duct: &Arc<Outduct>, engine: &Arc<Engine>, args: &TaskArgs) {
    let peer_engine: u64 = match duct.peer.parse() {
        Ok(id) => id,
        Err(_) => {
            log::error!("Duct {} peer {:?} is not an engine id", duct.name, duct.peer);
            return;
        }
    };

    log::info!("ltpclo for duct {} (engine {}) running", duct.name, peer_engine);
    while !args.stop_requested() {
        let bundle_addr = match duct.dequeue(node.heap()) {
            Ok(DequeuedBundle::Bundle(addr)) => addr,
            Ok(DequeuedBundle::Interrupted) => continue,
            Ok(DequeuedBundle::Stopped) => break,
            Err(e) => {
                log::error!("ltpclo dequeue failed: {}", e);
                break;
            }
        };

        match send_bundle(node, engine, peer_engine, bundle_addr) {
            Ok(()) => {
                let custody = {
                    let txn = node.heap().begin();
                    txn.get::<BundleRec>(bundle_addr)
                        .map(|rec| rec.custody == CustodySwitch::SourceCustodyRequired)
                };
                match custody {
                    Ok(true) => {} // retained for the custody-due timer
                    Ok(false) => discard(node, bundle_addr),
                    Err(e) => log::error!("Lost track of bundle: {}", e),
                }
            }
            Err(e) => {
                log::warn!("LTP send failed ({}); sending bundle to limbo", e);
                if let Err(e) = node.send_to_limbo(bundle_addr) {
                    log::error!("Can't limbo bundle: {}", e);
                }
            }
        }
    }
    log::info!("ltpclo for duct {} stopped", duct.name);
}

fn discard(node: &BpNode, bundle_addr: crate::store::Addr) {
    let mut wake = Wakeups::default();
    let mut txn = node.heap().begin();
    match txn.get::<BundleRec>(bundle_addr) {
        Ok(rec) => {
            if let Err(e) = node.destroy_bundle(&mut txn, &mut wake, bundle_addr, &rec, 0) {
                log::error!("Can't destroy bundle: {}", e);
                return;
            }
            txn.commit().ok();
            wake.fire();
        }
        Err(e) => log::error!("Lost track of bundle: {}", e),
    }
}

/// Read a whole ZCO into memory and release it.
fn drain_zco(node: &BpNode, data: zco::Zco, length: u64) -> Result<Vec<u8>> {
    let mut txn = node.heap().begin();
    let mut bytes = vec![0u8; length as usize];
    if length > 0 {
        let mut reader = ZcoReader::new(data);
        let n = reader.transmit(&mut txn, length, Some(&mut bytes))?;
        if n != length {
            zco::destroy(&mut txn, data)?;
            txn.commit()?;
            return Err(DtnError::new("Degraded read of inbound block"));
        }
    }
    zco::destroy(&mut txn, data)?;
    txn.commit()?;
    Ok(bytes)
}

/// LTP convergence-layer input daemon: turns engine notices into bundle
/// acquisitions.
pub fn ltpcli_run(node: &Arc<BpNode>, engine: &Arc<Engine>, args: &TaskArgs) {
    let mut acq = AcqWorkArea::new();
    // Green segments accumulate per session until end-of-block.
    let mut green: HashMap<(u64, u64), Vec<(u64, Vec<u8>)>> = HashMap::new();

    log::info!("ltpcli running");
    while !args.stop_requested() {
        let notice = match engine.get_notice(LTP_CLIENT_BP) {
            Ok(Some(notice)) => notice,
            Ok(None) => break,
            Err(e) => {
                log::error!("ltpcli notice failure: {}", e);
                break;
            }
        };

        match notice {
            LtpNotice::RecvRedPart { data, length, .. } => {
                match drain_zco(node, data, length) {
                    Ok(bytes) => {
                        acq.begin(None);
                        acq.continue_acq(&bytes);
                        if let Err(e) = acq.end_acq(node) {
                            log::warn!("Discarding unacquirable block: {}", e);
                        }
                    }
                    Err(e) => log::warn!("Discarding inbound block: {}", e),
                }
            }
            LtpNotice::RecvGreenSegment {
                peer_engine,
                session_nbr,
                data,
                offset,
                length,
                eob,
                ..
            } => {
                let bytes = if data.is_null() {
                    Vec::new()
                } else {
                    match drain_zco(node, data, length) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            log::warn!("Discarding green segment: {}", e);
                            continue;
                        }
                    }
                };

                let key = (peer_engine, session_nbr);
                green.entry(key).or_default().push((offset, bytes));
                if eob {
                    let mut pieces = green.remove(&key).unwrap_or_default();
                    pieces.sort_by_key(|(offset, _)| *offset);
                    acq.begin(None);
                    for (_, piece) in &pieces {
                        acq.continue_acq(piece);
                    }
                    if let Err(e) = acq.end_acq(node) {
                        log::warn!("Discarding green block: {}", e);
                    }
                }
            }
            LtpNotice::ExportSessionComplete { session_nbr, .. } => {
                log::debug!("LTP session {} delivered", session_nbr);
            }
            LtpNotice::ExportSessionCanceled {
                session_nbr,
                reason,
                ..
            } => {
                log::warn!("LTP session {} cancelled: {:?}", session_nbr, reason);
            }
            LtpNotice::ImportSessionCanceled {
                session_nbr,
                reason,
                ..
            } => {
                log::warn!("Inbound LTP session {} cancelled: {:?}", session_nbr, reason);
            }
        }
    }
    log::info!("ltpcli stopped");
}

/// Spawn the output daemon for `duct`.
pub fn spawn_clo(node: Arc<BpNode>, duct: Arc<Outduct>, engine: Arc<Engine>) -> Result<TaskId> {
    let ipc = node.ipc().clone();
    ipc.tasks.spawn_fn("ltpclo", move |args| {
        ltpclo_run(&node, &duct, &engine, &args);
    })
}

/// Spawn the input daemon. The engine's BP client must already be open.
pub fn spawn_cli(node: Arc<BpNode>, engine: Arc<Engine>) -> Result<TaskId> {
    let ipc = node.ipc().clone();
    ipc.tasks.spawn_fn("ltpcli", move |args| {
        ltpcli_run(&node, &engine, &args);
    })
}
