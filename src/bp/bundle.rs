//! Bundle records and the BP version 6 wire format.
//!
//! EIDs ride in CBHE-compressed form: the dictionary is empty and each
//! scheme/SSP offset pair carries an `ipn` node and service number
//! directly.

use super::cos::{CustodySwitch, ExtendedCos};
use super::eid::Eid;
use crate::common::sdnv::{self, SdnvReader};
use crate::store::{Addr, Rec};
use crate::tools::error::{DtnError, Result};
use crate::zco::Zco;

/// BP wire version implemented here.
pub const BP_VERSION: u8 = 6;

/// Report-requested flag: bundle reception.
pub const BP_RECEIVED_RPT: u8 = 0x01;
/// Report-requested flag: custody acceptance.
pub const BP_CUSTODY_RPT: u8 = 0x02;
/// Report-requested flag: bundle forwarded.
pub const BP_FORWARDED_RPT: u8 = 0x04;
/// Report-requested flag: bundle delivered.
pub const BP_DELIVERED_RPT: u8 = 0x08;
/// Report-requested flag: bundle deleted.
pub const BP_DELETED_RPT: u8 = 0x10;

const PROC_FLAG_FRAGMENT: u64 = 0x0001;
const PROC_FLAG_ADMIN: u64 = 0x0002;
const PROC_FLAG_CUSTODY: u64 = 0x0008;
const PROC_FLAG_SINGLETON: u64 = 0x0010;
const PROC_FLAG_ACK_REQUESTED: u64 = 0x0020;

const BLOCK_TYPE_PAYLOAD: u8 = 0x01;
const BLOCK_TYPE_ECOS: u8 = 0x13;
const BLOCK_FLAG_LAST: u64 = 0x08;

const REC_FLAG_ADMIN: u64 = 0x01;
const REC_FLAG_ACK: u64 = 0x02;
const REC_FLAG_DELIVERED: u64 = 0x04;
const REC_FLAG_SUSPENDED: u64 = 0x08;

fn get(buf: &[u8], i: usize) -> u64 {
    u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap())
}

fn put(buf: &mut [u8], i: usize, v: u64) {
    buf[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
}

/// Persistent bundle record.
#[derive(Debug, Default, Clone)]
pub struct BundleRec {
    /// Source endpoint
    pub source: (u64, u64),
    /// Destination endpoint
    pub destination: (u64, u64),
    /// Where status reports go
    pub report_to: (u64, u64),
    /// Current custodian, (0, 0) if none
    pub custodian: (u64, u64),
    /// Creation timestamp: seconds since the DTN epoch plus a sequence
    /// count unique within that second
    pub creation: (u64, u64),
    /// Remaining time to live, seconds
    pub ttl: u64,
    /// Priority class 0..=2
    pub priority: u8,
    /// Custody disposition
    pub custody: CustodySwitch,
    /// Status-report request flags
    pub srr_flags: u8,
    /// Admin-record flag
    pub admin_record: bool,
    /// Application acknowledgment requested
    pub ack_requested: bool,
    /// Delivered to the local application
    pub delivered: bool,
    /// Suspended (parked in the limbo queue)
    pub suspended: bool,
    /// Extended class of service
    pub ecos: ExtendedCos,
    /// Payload content
    pub payload: Zco,
    /// Payload length in bytes
    pub payload_length: u64,
    /// Membership element in a duct transmission queue or the limbo
    /// queue, null when unqueued
    pub duct_xmit_elt: Addr,
    /// Proximate-node EID string, set when queued for transmission
    pub prox_node_eid: Addr,
    /// Tracking list elements citing this bundle
    pub tracking_elts: Addr,
}

impl BundleRec {
    /// Source EID.
    pub fn source_eid(&self) -> Eid {
        Eid::from_cbhe(self.source.0, self.source.1)
    }

    /// Destination EID.
    pub fn destination_eid(&self) -> Eid {
        Eid::from_cbhe(self.destination.0, self.destination.1)
    }

    /// Report-to EID.
    pub fn report_to_eid(&self) -> Eid {
        Eid::from_cbhe(self.report_to.0, self.report_to.1)
    }
}

impl Rec for BundleRec {
    const SIZE: usize = 200;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.source.0);
        put(buf, 1, self.source.1);
        put(buf, 2, self.destination.0);
        put(buf, 3, self.destination.1);
        put(buf, 4, self.report_to.0);
        put(buf, 5, self.report_to.1);
        put(buf, 6, self.custodian.0);
        put(buf, 7, self.custodian.1);
        put(buf, 8, self.creation.0);
        put(buf, 9, self.creation.1);
        put(buf, 10, self.ttl);
        put(buf, 11, self.priority as u64);
        put(
            buf,
            12,
            match self.custody {
                CustodySwitch::NoCustodyRequested => 0,
                CustodySwitch::SourceCustodyRequired => 1,
            },
        );
        put(buf, 13, self.srr_flags as u64);
        let mut flags = 0u64;
        if self.admin_record {
            flags |= REC_FLAG_ADMIN;
        }
        if self.ack_requested {
            flags |= REC_FLAG_ACK;
        }
        if self.delivered {
            flags |= REC_FLAG_DELIVERED;
        }
        if self.suspended {
            flags |= REC_FLAG_SUSPENDED;
        }
        put(buf, 14, flags);
        put(buf, 15, self.ecos.flags as u64);
        put(buf, 16, self.ecos.ordinal as u64);
        put(buf, 17, self.ecos.flow_label as u64);
        put(buf, 18, self.payload.0 .0);
        put(buf, 19, self.payload_length);
        put(buf, 20, self.duct_xmit_elt.0);
        put(buf, 21, self.prox_node_eid.0);
        put(buf, 22, self.tracking_elts.0);
        put(buf, 23, 0);
        put(buf, 24, 0);
    }

    fn decode(buf: &[u8]) -> Self {
        let flags = get(buf, 14);
        BundleRec {
            source: (get(buf, 0), get(buf, 1)),
            destination: (get(buf, 2), get(buf, 3)),
            report_to: (get(buf, 4), get(buf, 5)),
            custodian: (get(buf, 6), get(buf, 7)),
            creation: (get(buf, 8), get(buf, 9)),
            ttl: get(buf, 10),
            priority: get(buf, 11) as u8,
            custody: if get(buf, 12) == 1 {
                CustodySwitch::SourceCustodyRequired
            } else {
                CustodySwitch::NoCustodyRequested
            },
            srr_flags: get(buf, 13) as u8,
            admin_record: flags & REC_FLAG_ADMIN != 0,
            ack_requested: flags & REC_FLAG_ACK != 0,
            delivered: flags & REC_FLAG_DELIVERED != 0,
            suspended: flags & REC_FLAG_SUSPENDED != 0,
            ecos: ExtendedCos {
                flags: get(buf, 15) as u32,
                ordinal: get(buf, 16) as u8,
                flow_label: get(buf, 17) as u32,
            },
            payload: Zco(Addr(get(buf, 18))),
            payload_length: get(buf, 19),
            duct_xmit_elt: Addr(get(buf, 20)),
            prox_node_eid: Addr(get(buf, 21)),
            tracking_elts: Addr(get(buf, 22)),
        }
    }
}

/// The parsed outer blocks of an inbound bundle.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedBundle {
    /// Source EID
    pub source: Eid,
    /// Destination EID
    pub destination: Eid,
    /// Report-to EID
    pub report_to: Eid,
    /// Custodian EID
    pub custodian: Eid,
    /// Creation timestamp (seconds, sequence)
    pub creation: (u64, u64),
    /// Remaining lifetime, seconds
    pub ttl: u64,
    /// Priority class
    pub priority: u8,
    /// Custody transfer requested
    pub custody: CustodySwitch,
    /// Status-report request flags
    pub srr_flags: u8,
    /// Admin-record flag
    pub admin_record: bool,
    /// Application ack requested
    pub ack_requested: bool,
    /// Extended class of service
    pub ecos: ExtendedCos,
    /// Byte range of the payload within the parsed buffer
    pub payload_range: (usize, usize),
}

/// Encode the primary block (and the ECOS extension block when it carries
/// anything) of an outbound bundle.
pub fn encode_header(rec: &BundleRec) -> Vec<u8> {
    let mut proc_flags = PROC_FLAG_SINGLETON | ((rec.priority as u64 & 0x3) << 7);
    proc_flags |= (rec.srr_flags as u64) << 14;
    if rec.admin_record {
        proc_flags |= PROC_FLAG_ADMIN;
    }
    if rec.custody == CustodySwitch::SourceCustodyRequired {
        proc_flags |= PROC_FLAG_CUSTODY;
    }
    if rec.ack_requested {
        proc_flags |= PROC_FLAG_ACK_REQUESTED;
    }

    let mut body = Vec::with_capacity(64);
    sdnv::encode(rec.destination.0, &mut body);
    sdnv::encode(rec.destination.1, &mut body);
    sdnv::encode(rec.source.0, &mut body);
    sdnv::encode(rec.source.1, &mut body);
    sdnv::encode(rec.report_to.0, &mut body);
    sdnv::encode(rec.report_to.1, &mut body);
    sdnv::encode(rec.custodian.0, &mut body);
    sdnv::encode(rec.custodian.1, &mut body);
    sdnv::encode(rec.creation.0, &mut body);
    sdnv::encode(rec.creation.1, &mut body);
    sdnv::encode(rec.ttl, &mut body);
    sdnv::encode(0, &mut body); // empty dictionary: CBHE

    let mut out = Vec::with_capacity(body.len() + 16);
    out.push(BP_VERSION);
    sdnv::encode(proc_flags, &mut out);
    sdnv::encode(body.len() as u64, &mut out);
    out.extend_from_slice(&body);

    if rec.ecos.flags != 0 || rec.ecos.ordinal != 0 {
        let mut block = Vec::with_capacity(8);
        block.push(rec.ecos.flags as u8);
        block.push(rec.ecos.ordinal);
        if rec.ecos.flags & super::cos::ECOS_FLOW_LABEL_PRESENT != 0 {
            sdnv::encode(rec.ecos.flow_label as u64, &mut block);
        }
        out.push(BLOCK_TYPE_ECOS);
        sdnv::encode(0, &mut out);
        sdnv::encode(block.len() as u64, &mut out);
        out.extend_from_slice(&block);
    }

    out
}

/// Encode the payload block header for a payload of `length` bytes.
pub fn encode_payload_header(length: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.push(BLOCK_TYPE_PAYLOAD);
    sdnv::encode(BLOCK_FLAG_LAST, &mut out);
    sdnv::encode(length, &mut out);
    out
}

/// Parse one whole bundle out of `buf`.
pub fn parse_bundle(buf: &[u8]) -> Result<ParsedBundle> {
    if buf.is_empty() || buf[0] != BP_VERSION {
        return Err(DtnError::new("Not a version-6 bundle"));
    }

    let mut reader = SdnvReader::new(&buf[1..]);
    let proc_flags = reader.read()?;
    if proc_flags & PROC_FLAG_FRAGMENT != 0 {
        return Err(DtnError::new("Bundle fragments are not supported"));
    }
    let block_len = reader.read()? as usize;
    let body_start = reader.pos();

    let dest = (reader.read()?, reader.read()?);
    let source = (reader.read()?, reader.read()?);
    let report_to = (reader.read()?, reader.read()?);
    let custodian = (reader.read()?, reader.read()?);
    let creation = (reader.read()?, reader.read()?);
    let ttl = reader.read()?;
    let dict_len = reader.read()?;
    if dict_len != 0 {
        return Err(DtnError::new("Dictionary-based EIDs are not supported"));
    }
    if reader.pos() - body_start != block_len {
        return Err(DtnError::new("Primary block length mismatch"));
    }

    let mut ecos = ExtendedCos::default();
    let mut cursor = 1 + reader.pos();

    // Walk canonical blocks to the payload.
    loop {
        if cursor >= buf.len() {
            return Err(DtnError::new("Bundle has no payload block"));
        }
        let block_type = buf[cursor];
        let mut rdr = SdnvReader::new(&buf[cursor + 1..]);
        let _flags = rdr.read()?;
        let data_len = rdr.read()? as usize;
        let data_start = cursor + 1 + rdr.pos();
        if data_start + data_len > buf.len() {
            return Err(DtnError::new("Canonical block extends past bundle end"));
        }

        match block_type {
            BLOCK_TYPE_PAYLOAD => {
                return Ok(ParsedBundle {
                    source: Eid::from_cbhe(source.0, source.1),
                    destination: Eid::from_cbhe(dest.0, dest.1),
                    report_to: Eid::from_cbhe(report_to.0, report_to.1),
                    custodian: Eid::from_cbhe(custodian.0, custodian.1),
                    creation,
                    ttl,
                    priority: ((proc_flags >> 7) & 0x3) as u8,
                    custody: if proc_flags & PROC_FLAG_CUSTODY != 0 {
                        CustodySwitch::SourceCustodyRequired
                    } else {
                        CustodySwitch::NoCustodyRequested
                    },
                    srr_flags: ((proc_flags >> 14) & 0x7f) as u8,
                    admin_record: proc_flags & PROC_FLAG_ADMIN != 0,
                    ack_requested: proc_flags & PROC_FLAG_ACK_REQUESTED != 0,
                    ecos,
                    payload_range: (data_start, data_start + data_len),
                });
            }
            BLOCK_TYPE_ECOS => {
                if data_len < 2 {
                    return Err(DtnError::new("Short extended class-of-service block"));
                }
                ecos.flags = buf[data_start] as u32;
                ecos.ordinal = buf[data_start + 1];
                if ecos.flags & super::cos::ECOS_FLOW_LABEL_PRESENT != 0 {
                    let (label, _) = sdnv::decode(&buf[data_start + 2..data_start + data_len])?;
                    ecos.flow_label = label as u32;
                }
                cursor = data_start + data_len;
            }
            other => {
                log::debug!("Skipping unknown canonical block type {:#x}", other);
                cursor = data_start + data_len;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bp::cos::ECOS_MINIMUM_LATENCY;

    fn sample_rec() -> BundleRec {
        BundleRec {
            source: (5, 1),
            destination: (7, 2),
            report_to: (5, 0),
            custodian: (0, 0),
            creation: (800000000, 3),
            ttl: 3600,
            priority: 1,
            custody: CustodySwitch::SourceCustodyRequired,
            srr_flags: BP_DELIVERED_RPT,
            ack_requested: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_header_payload_round_trip() {
        let rec = sample_rec();
        let mut wire = encode_header(&rec);
        let payload = b"hello dtn";
        wire.extend_from_slice(&encode_payload_header(payload.len() as u64));
        wire.extend_from_slice(payload);

        let parsed = parse_bundle(&wire).unwrap();
        assert_eq!(parsed.source, Eid::ipn(5, 1));
        assert_eq!(parsed.destination, Eid::ipn(7, 2));
        assert_eq!(parsed.report_to, Eid::ipn(5, 0));
        assert_eq!(parsed.custodian, Eid::None);
        assert_eq!(parsed.creation, (800000000, 3));
        assert_eq!(parsed.ttl, 3600);
        assert_eq!(parsed.priority, 1);
        assert_eq!(parsed.custody, CustodySwitch::SourceCustodyRequired);
        assert_eq!(parsed.srr_flags, BP_DELIVERED_RPT);
        assert!(parsed.ack_requested);
        assert!(!parsed.admin_record);
        assert_eq!(&wire[parsed.payload_range.0..parsed.payload_range.1], payload);
    }

    #[test]
    fn test_ecos_block_round_trip() {
        let mut rec = sample_rec();
        rec.ecos.flags = ECOS_MINIMUM_LATENCY;
        rec.ecos.ordinal = 9;
        let mut wire = encode_header(&rec);
        wire.extend_from_slice(&encode_payload_header(1));
        wire.push(0xEE);

        let parsed = parse_bundle(&wire).unwrap();
        assert_eq!(parsed.ecos.flags as u32, ECOS_MINIMUM_LATENCY);
        assert_eq!(parsed.ecos.ordinal, 9);
    }

    #[test]
    fn test_reject_bad_version() {
        assert!(parse_bundle(&[7, 0, 0]).is_err());
        assert!(parse_bundle(&[]).is_err());
    }

    #[test]
    fn test_reject_truncated() {
        let rec = sample_rec();
        let mut wire = encode_header(&rec);
        wire.extend_from_slice(&encode_payload_header(100));
        wire.extend_from_slice(&[0u8; 10]);
        assert!(parse_bundle(&wire).is_err());
    }

    #[test]
    fn test_bundle_rec_round_trip() {
        let rec = sample_rec();
        let mut buf = vec![0u8; BundleRec::SIZE];
        rec.encode(&mut buf);
        let back = BundleRec::decode(&buf);
        assert_eq!(back.source, rec.source);
        assert_eq!(back.destination, rec.destination);
        assert_eq!(back.creation, rec.creation);
        assert_eq!(back.custody, rec.custody);
        assert_eq!(back.srr_flags, rec.srr_flags);
        assert!(back.ack_requested);
        assert!(!back.suspended);
    }
}
