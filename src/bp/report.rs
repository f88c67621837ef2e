//! Administrative records: status reports and custody signals.

use super::eid::Eid;
use crate::common::sdnv::{self, SdnvReader};
use crate::tools::error::{DtnError, Result};

const RECORD_TYPE_STATUS_REPORT: u8 = 1;
const RECORD_TYPE_CUSTODY_SIGNAL: u8 = 2;

/// Deletion/abandonment reason: no further information.
pub const REASON_NONE: u8 = 0;
/// Bundle lifetime expired.
pub const REASON_EXPIRED: u8 = 1;
/// No route to destination.
#[allow(dead_code)]
pub const REASON_NO_ROUTE: u8 = 5;
/// No timely contact with next node.
#[allow(dead_code)]
pub const REASON_NO_CONTACT: u8 = 6;

/// A bundle status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Which statuses this report asserts (`BP_*_RPT` bits)
    pub flags: u8,
    /// Reason code
    pub reason: u8,
    /// When the reported disposition happened, seconds since the DTN epoch
    pub time: u64,
    /// Creation timestamp of the subject bundle
    pub creation: (u64, u64),
    /// Source of the subject bundle
    pub source: Eid,
}

/// A custody signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustodySignal {
    /// True if custody was accepted
    pub accepted: bool,
    /// Reason code when refused
    pub reason: u8,
    /// When the disposition happened, seconds since the DTN epoch
    pub time: u64,
    /// Creation timestamp of the subject bundle
    pub creation: (u64, u64),
    /// Source of the subject bundle
    pub source: Eid,
}

/// Payload of an admin-record bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminRecord {
    /// Status report
    StatusReport(StatusReport),
    /// Custody signal
    CustodySignal(CustodySignal),
}

impl AdminRecord {
    /// Serialize to admin-record payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        match self {
            AdminRecord::StatusReport(sr) => {
                out.push(RECORD_TYPE_STATUS_REPORT << 4);
                out.push(sr.flags);
                out.push(sr.reason);
                sdnv::encode(sr.time, &mut out);
                sdnv::encode(sr.creation.0, &mut out);
                sdnv::encode(sr.creation.1, &mut out);
                let eid = sr.source.to_string();
                sdnv::encode(eid.len() as u64, &mut out);
                out.extend_from_slice(eid.as_bytes());
            }
            AdminRecord::CustodySignal(cs) => {
                out.push(RECORD_TYPE_CUSTODY_SIGNAL << 4);
                out.push(if cs.accepted { 0x80 } else { 0 } | (cs.reason & 0x7f));
                sdnv::encode(cs.time, &mut out);
                sdnv::encode(cs.creation.0, &mut out);
                sdnv::encode(cs.creation.1, &mut out);
                let eid = cs.source.to_string();
                sdnv::encode(eid.len() as u64, &mut out);
                out.extend_from_slice(eid.as_bytes());
            }
        }
        out
    }

    /// Parse an admin-record payload.
    pub fn decode(buf: &[u8]) -> Result<AdminRecord> {
        if buf.len() < 2 {
            return Err(DtnError::new("Short admin record"));
        }

        let record_type = buf[0] >> 4;
        match record_type {
            RECORD_TYPE_STATUS_REPORT => {
                if buf.len() < 3 {
                    return Err(DtnError::new("Short status report"));
                }
                let flags = buf[1];
                let reason = buf[2];
                let mut reader = SdnvReader::new(&buf[3..]);
                let time = reader.read()?;
                let creation = (reader.read()?, reader.read()?);
                let source = read_eid(&mut reader)?;
                Ok(AdminRecord::StatusReport(StatusReport {
                    flags,
                    reason,
                    time,
                    creation,
                    source,
                }))
            }
            RECORD_TYPE_CUSTODY_SIGNAL => {
                let status = buf[1];
                let mut reader = SdnvReader::new(&buf[2..]);
                let time = reader.read()?;
                let creation = (reader.read()?, reader.read()?);
                let source = read_eid(&mut reader)?;
                Ok(AdminRecord::CustodySignal(CustodySignal {
                    accepted: status & 0x80 != 0,
                    reason: status & 0x7f,
                    time,
                    creation,
                    source,
                }))
            }
            other => Err(DtnError::new(format!("Unknown admin record type {}", other))),
        }
    }
}

fn read_eid(reader: &mut SdnvReader) -> Result<Eid> {
    let len = reader.read()? as usize;
    let rest = reader.remaining();
    if rest.len() < len {
        return Err(DtnError::new("Truncated EID in admin record"));
    }
    let text = std::str::from_utf8(&rest[..len])
        .map_err(|_| DtnError::new("Non-UTF8 EID in admin record"))?;
    Eid::parse(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bp::bundle::BP_DELIVERED_RPT;

    #[test]
    fn test_status_report_round_trip() {
        let record = AdminRecord::StatusReport(StatusReport {
            flags: BP_DELIVERED_RPT,
            reason: REASON_NONE,
            time: 123456,
            creation: (800000000, 42),
            source: Eid::ipn(5, 1),
        });
        let wire = record.encode();
        assert_eq!(AdminRecord::decode(&wire).unwrap(), record);
    }

    #[test]
    fn test_custody_signal_round_trip() {
        let record = AdminRecord::CustodySignal(CustodySignal {
            accepted: true,
            reason: 0,
            time: 99,
            creation: (800000001, 7),
            source: Eid::ipn(9, 3),
        });
        let wire = record.encode();
        assert_eq!(AdminRecord::decode(&wire).unwrap(), record);
    }

    #[test]
    fn test_reject_garbage() {
        assert!(AdminRecord::decode(&[]).is_err());
        assert!(AdminRecord::decode(&[0xF0, 0, 0]).is_err());
    }
}
