//! Inbound bundle acquisition.
//!
//! A convergence-layer input daemon owns one work area per inbound
//! connection: it begins an acquisition tagged with the sender's EID,
//! feeds it one length-delimited bundle's bytes, and ends it, at which
//! point the bytes are parsed, admitted, and dispatched.

use super::node::{BpNode, Wakeups};
use super::{bundle, eid::Eid};
use crate::store::Addr;
use crate::tools::error::Result;
use crate::zco::{self, ZcoMedium};

/// One in-progress bundle acquisition.
#[derive(Debug)]
pub struct AcqWorkArea {
    sender_eid: Option<Eid>,
    buffer: Vec<u8>,
}

impl Default for AcqWorkArea {
    fn default() -> Self {
        AcqWorkArea::new()
    }
}

impl AcqWorkArea {
    /// An idle work area.
    pub fn new() -> AcqWorkArea {
        AcqWorkArea {
            sender_eid: None,
            buffer: Vec::new(),
        }
    }

    /// Begin acquiring from `sender_eid` (`None` when the sender is
    /// anonymous, e.g. an unauthenticated TCP peer).
    pub fn begin(&mut self, sender_eid: Option<Eid>) {
        self.sender_eid = sender_eid;
        self.buffer.clear();
    }

    /// Append convergence-layer bytes to the acquisition.
    pub fn continue_acq(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Parse and dispatch the acquired bundle. The work area is left
    /// ready for the next acquisition.
    pub fn end_acq(&mut self, node: &BpNode) -> Result<Addr> {
        let buffer = std::mem::take(&mut self.buffer);
        if buffer.is_empty() {
            return Ok(Addr::NULL);
        }

        let parsed = bundle::parse_bundle(&buffer)?;
        log::debug!(
            "Acquired bundle from {} (CL sender {:?}), {} payload bytes",
            parsed.source,
            self.sender_eid,
            parsed.payload_range.1 - parsed.payload_range.0
        );

        let payload_bytes = &buffer[parsed.payload_range.0..parsed.payload_range.1];
        let mut wake = Wakeups::default();
        let mut txn = node.heap().begin();

        if !zco::enough_heap_space(&mut txn, payload_bytes.len() as u64)? {
            log::warn!("Heap occupancy cap reached; inbound bundle refused");
            return Ok(Addr::NULL);
        }

        let payload = zco::create(&mut txn)?;
        if !payload_bytes.is_empty() {
            let array = txn.put_bytes(payload_bytes)?;
            zco::append_extent(
                &mut txn,
                payload,
                ZcoMedium::Heap,
                array,
                0,
                payload_bytes.len() as u64,
            )?;
        }

        let addr = node.admit_inbound(
            &mut txn,
            &mut wake,
            &parsed,
            payload,
            payload_bytes.len() as u64,
        )?;
        txn.commit()?;
        wake.fire();
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bp::bundle::{encode_header, encode_payload_header, BundleRec};
    use crate::bp::node::NodeConfig;
    use crate::ipc::Ipc;
    use crate::store::Heap;
    use std::sync::Arc;

    #[test]
    fn test_acquire_and_dispatch_to_forwarder() {
        crate::tests::init();
        let dir = tempfile::tempdir().unwrap();
        let heap = Arc::new(Heap::create(dir.path().join("acq.heap"), 1 << 20).unwrap());
        let node = BpNode::create(
            heap,
            Ipc::new(),
            &NodeConfig::builder().node_nbr(9).build(),
        )
        .unwrap();

        // A bundle destined elsewhere: parsed, admitted, and queued for
        // the forwarder.
        let rec = BundleRec {
            source: (5, 1),
            destination: (7, 2),
            creation: (crate::tools::dtn_time_now(), 0),
            ttl: 3600,
            priority: 1,
            ..Default::default()
        };
        let mut wire = encode_header(&rec);
        let payload = b"acquired payload";
        wire.extend_from_slice(&encode_payload_header(payload.len() as u64));
        wire.extend_from_slice(payload);

        let mut acq = AcqWorkArea::new();
        acq.begin(Some(crate::bp::Eid::ipn(5, 0)));
        acq.continue_acq(&wire[..6]);
        acq.continue_acq(&wire[6..]);
        let bundle = acq.end_acq(&node).unwrap();
        assert!(!bundle.is_null());
    }

    #[test]
    fn test_malformed_acquisition_rejected() {
        crate::tests::init();
        let dir = tempfile::tempdir().unwrap();
        let heap = Arc::new(Heap::create(dir.path().join("acq2.heap"), 1 << 20).unwrap());
        let node = BpNode::create(
            heap,
            Ipc::new(),
            &NodeConfig::builder().node_nbr(9).build(),
        )
        .unwrap();

        let mut acq = AcqWorkArea::new();
        acq.begin(None);
        acq.continue_acq(&[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(acq.end_acq(&node).is_err());
    }
}
