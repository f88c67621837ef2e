//! LTP segment wire codec.
//!
//! Every segment starts with a control byte {version:4, type:4}, then the
//! session id as two SDNVs (source engine id, session number), then a
//! type-specific body.

use crate::common::sdnv::{self, SdnvReader};
use crate::tools::error::{DtnError, Result};

const LTP_VERSION: u8 = 0;

const TYPE_RED: u8 = 0x0;
const TYPE_RED_CKPT: u8 = 0x1;
const TYPE_RED_CKPT_EORP: u8 = 0x2;
const TYPE_RED_CKPT_EORP_EOB: u8 = 0x3;
const TYPE_GREEN: u8 = 0x4;
const TYPE_GREEN_EOB: u8 = 0x7;
const TYPE_REPORT: u8 = 0x8;
const TYPE_REPORT_ACK: u8 = 0x9;
const TYPE_CANCEL_BY_SENDER: u8 = 0xC;
const TYPE_CANCEL_ACK_TO_SENDER: u8 = 0xD;
const TYPE_CANCEL_BY_RECEIVER: u8 = 0xE;
const TYPE_CANCEL_ACK_TO_RECEIVER: u8 = 0xF;

/// Reason code carried by a cancel segment.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CancelReason {
    /// Cancelled by client request
    UserCancelled,
    /// Destination client unreachable
    Unreachable,
    /// Retransmission limit exceeded
    RetransmitLimit,
    /// Red/green miscoloring detected
    Miscolored,
    /// Cancelled by the engine itself
    SystemCancelled,
    /// Retransmission cycle limit exceeded
    RetransmitCycle,
}

impl CancelReason {
    fn to_u8(self) -> u8 {
        match self {
            CancelReason::UserCancelled => 0,
            CancelReason::Unreachable => 1,
            CancelReason::RetransmitLimit => 2,
            CancelReason::Miscolored => 3,
            CancelReason::SystemCancelled => 4,
            CancelReason::RetransmitCycle => 5,
        }
    }

    /// Decode a wire reason code.
    pub fn from_u8(v: u8) -> CancelReason {
        match v {
            0 => CancelReason::UserCancelled,
            1 => CancelReason::Unreachable,
            2 => CancelReason::RetransmitLimit,
            3 => CancelReason::Miscolored,
            5 => CancelReason::RetransmitCycle,
            _ => CancelReason::SystemCancelled,
        }
    }

    pub(crate) fn to_code(self) -> u64 {
        self.to_u8() as u64
    }
}

/// One contiguous reception claim of a report segment, `[begin, end)`
/// relative to the block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Claim {
    /// First byte offset claimed
    pub begin: u64,
    /// One past the last byte offset claimed
    pub end: u64,
}

/// Body of a data segment.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct DataSegment {
    /// Client service id the block is addressed to
    pub client_id: u64,
    /// Offset of this fragment within the block
    pub offset: u64,
    /// True for red (reliable) data, false for green
    pub red: bool,
    /// True when this segment is a checkpoint
    pub checkpoint: bool,
    /// True when this checkpoint ends the red part of the block
    pub eorp: bool,
    /// True when this segment ends the block
    pub eob: bool,
    /// Checkpoint serial number, present iff `checkpoint`
    pub checkpoint_serial: u64,
    /// Serial of the report that solicited this (re)transmission, 0 if none
    pub report_serial: u64,
    /// The fragment bytes
    pub data: Vec<u8>,
}

/// Body of a report segment: the receiver's reception claims for the red
/// part, scoped to `[lower_bound, upper_bound)`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ReportSegment {
    /// Serial of this report
    pub serial: u64,
    /// Serial of the checkpoint that solicited it
    pub checkpoint_serial: u64,
    /// Scope upper bound
    pub upper_bound: u64,
    /// Scope lower bound
    pub lower_bound: u64,
    /// Contiguous reception claims
    pub claims: Vec<Claim>,
}

/// Type-specific content of a segment.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum SegmentBody {
    /// Red or green block data
    Data(DataSegment),
    /// Reception report
    Report(ReportSegment),
    /// Acknowledgment of a report, by serial
    ReportAck {
        /// Serial of the acknowledged report
        serial: u64,
    },
    /// Session cancellation initiated by the block sender
    CancelBySender(CancelReason),
    /// Acknowledgment of a sender cancellation
    CancelAckToSender,
    /// Session cancellation initiated by the block receiver
    CancelByReceiver(CancelReason),
    /// Acknowledgment of a receiver cancellation
    CancelAckToReceiver,
}

/// A complete LTP segment.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Segment {
    /// Engine id of the block sender (the session originator)
    pub engine_id: u64,
    /// Session number assigned by the originator
    pub session_nbr: u64,
    /// Segment content
    pub body: SegmentBody,
}

impl Segment {
    /// Serialize to wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32);
        out.push(self.type_nibble() | (LTP_VERSION << 4));
        sdnv::encode(self.engine_id, &mut out);
        sdnv::encode(self.session_nbr, &mut out);

        match &self.body {
            SegmentBody::Data(d) => {
                sdnv::encode(d.client_id, &mut out);
                sdnv::encode(d.offset, &mut out);
                sdnv::encode(d.data.len() as u64, &mut out);
                if d.checkpoint {
                    sdnv::encode(d.checkpoint_serial, &mut out);
                    sdnv::encode(d.report_serial, &mut out);
                }
                out.extend_from_slice(&d.data);
            }
            SegmentBody::Report(r) => {
                sdnv::encode(r.serial, &mut out);
                sdnv::encode(r.checkpoint_serial, &mut out);
                sdnv::encode(r.upper_bound, &mut out);
                sdnv::encode(r.lower_bound, &mut out);
                sdnv::encode(r.claims.len() as u64, &mut out);
                for claim in &r.claims {
                    sdnv::encode(claim.begin - r.lower_bound, &mut out);
                    sdnv::encode(claim.end - claim.begin, &mut out);
                }
            }
            SegmentBody::ReportAck { serial } => {
                sdnv::encode(*serial, &mut out);
            }
            SegmentBody::CancelBySender(reason) | SegmentBody::CancelByReceiver(reason) => {
                out.push(reason.to_u8());
            }
            SegmentBody::CancelAckToSender | SegmentBody::CancelAckToReceiver => {}
        }
        out
    }

    fn type_nibble(&self) -> u8 {
        match &self.body {
            SegmentBody::Data(d) => match (d.red, d.checkpoint, d.eorp, d.eob) {
                (true, false, _, _) => TYPE_RED,
                (true, true, false, _) => TYPE_RED_CKPT,
                (true, true, true, false) => TYPE_RED_CKPT_EORP,
                (true, true, true, true) => TYPE_RED_CKPT_EORP_EOB,
                (false, _, _, false) => TYPE_GREEN,
                (false, _, _, true) => TYPE_GREEN_EOB,
            },
            SegmentBody::Report(_) => TYPE_REPORT,
            SegmentBody::ReportAck { .. } => TYPE_REPORT_ACK,
            SegmentBody::CancelBySender(_) => TYPE_CANCEL_BY_SENDER,
            SegmentBody::CancelAckToSender => TYPE_CANCEL_ACK_TO_SENDER,
            SegmentBody::CancelByReceiver(_) => TYPE_CANCEL_BY_RECEIVER,
            SegmentBody::CancelAckToReceiver => TYPE_CANCEL_ACK_TO_RECEIVER,
        }
    }

    /// Parse a segment from wire form.
    pub fn decode(buf: &[u8]) -> Result<Segment> {
        if buf.is_empty() {
            return Err(DtnError::new("Empty LTP segment"));
        }

        let version = buf[0] >> 4;
        if version != LTP_VERSION {
            return Err(DtnError::new(format!("Unknown LTP version {}", version)));
        }

        let seg_type = buf[0] & 0x0f;
        let mut reader = SdnvReader::new(&buf[1..]);
        let engine_id = reader.read()?;
        let session_nbr = reader.read()?;

        let body = match seg_type {
            TYPE_RED | TYPE_RED_CKPT | TYPE_RED_CKPT_EORP | TYPE_RED_CKPT_EORP_EOB | TYPE_GREEN
            | TYPE_GREEN_EOB => {
                let red = seg_type <= TYPE_RED_CKPT_EORP_EOB;
                let checkpoint = red && seg_type >= TYPE_RED_CKPT;
                let eorp = seg_type == TYPE_RED_CKPT_EORP || seg_type == TYPE_RED_CKPT_EORP_EOB;
                let eob = seg_type == TYPE_RED_CKPT_EORP_EOB || seg_type == TYPE_GREEN_EOB;
                let client_id = reader.read()?;
                let offset = reader.read()?;
                let length = reader.read()? as usize;
                let (checkpoint_serial, report_serial) = if checkpoint {
                    (reader.read()?, reader.read()?)
                } else {
                    (0, 0)
                };
                let rest = reader.remaining();
                if rest.len() < length {
                    return Err(DtnError::new(format!(
                        "Data segment truncated: {} < {}",
                        rest.len(),
                        length
                    )));
                }
                SegmentBody::Data(DataSegment {
                    client_id,
                    offset,
                    red,
                    checkpoint,
                    eorp,
                    eob,
                    checkpoint_serial,
                    report_serial,
                    data: rest[..length].to_vec(),
                })
            }
            TYPE_REPORT => {
                let serial = reader.read()?;
                let checkpoint_serial = reader.read()?;
                let upper_bound = reader.read()?;
                let lower_bound = reader.read()?;
                let count = reader.read()?;
                let mut claims = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let begin = lower_bound + reader.read()?;
                    let length = reader.read()?;
                    claims.push(Claim {
                        begin,
                        end: begin + length,
                    });
                }
                SegmentBody::Report(ReportSegment {
                    serial,
                    checkpoint_serial,
                    upper_bound,
                    lower_bound,
                    claims,
                })
            }
            TYPE_REPORT_ACK => SegmentBody::ReportAck {
                serial: reader.read()?,
            },
            TYPE_CANCEL_BY_SENDER | TYPE_CANCEL_BY_RECEIVER => {
                let rest = reader.remaining();
                if rest.is_empty() {
                    return Err(DtnError::new("Cancel segment missing reason"));
                }
                let reason = CancelReason::from_u8(rest[0]);
                if seg_type == TYPE_CANCEL_BY_SENDER {
                    SegmentBody::CancelBySender(reason)
                } else {
                    SegmentBody::CancelByReceiver(reason)
                }
            }
            TYPE_CANCEL_ACK_TO_SENDER => SegmentBody::CancelAckToSender,
            TYPE_CANCEL_ACK_TO_RECEIVER => SegmentBody::CancelAckToReceiver,
            _ => {
                return Err(DtnError::new(format!("Unknown segment type {:#x}", seg_type)));
            }
        };

        Ok(Segment {
            engine_id,
            session_nbr,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(seg: Segment) {
        let wire = seg.encode();
        let back = Segment::decode(&wire).unwrap();
        assert_eq!(seg, back);
    }

    #[test]
    fn test_red_data_round_trip() {
        round_trip(Segment {
            engine_id: 19,
            session_nbr: 77,
            body: SegmentBody::Data(DataSegment {
                client_id: 1,
                offset: 500,
                red: true,
                checkpoint: false,
                eorp: false,
                eob: false,
                checkpoint_serial: 0,
                report_serial: 0,
                data: vec![0xAB; 500],
            }),
        });
    }

    #[test]
    fn test_checkpoint_eob_round_trip() {
        round_trip(Segment {
            engine_id: 19,
            session_nbr: 77,
            body: SegmentBody::Data(DataSegment {
                client_id: 1,
                offset: 1000,
                red: true,
                checkpoint: true,
                eorp: true,
                eob: true,
                checkpoint_serial: 42,
                report_serial: 7,
                data: vec![1, 2, 3],
            }),
        });
    }

    #[test]
    fn test_green_eob_round_trip() {
        round_trip(Segment {
            engine_id: 2,
            session_nbr: 9,
            body: SegmentBody::Data(DataSegment {
                client_id: 1,
                offset: 1500,
                red: false,
                checkpoint: false,
                eorp: false,
                eob: true,
                checkpoint_serial: 0,
                report_serial: 0,
                data: vec![9; 10],
            }),
        });
    }

    #[test]
    fn test_report_round_trip() {
        round_trip(Segment {
            engine_id: 19,
            session_nbr: 77,
            body: SegmentBody::Report(ReportSegment {
                serial: 1234,
                checkpoint_serial: 42,
                upper_bound: 1500,
                lower_bound: 0,
                claims: vec![
                    Claim { begin: 0, end: 500 },
                    Claim {
                        begin: 1000,
                        end: 1500,
                    },
                ],
            }),
        });
    }

    #[test]
    fn test_control_segments_round_trip() {
        round_trip(Segment {
            engine_id: 3,
            session_nbr: 4,
            body: SegmentBody::ReportAck { serial: 99 },
        });
        round_trip(Segment {
            engine_id: 3,
            session_nbr: 4,
            body: SegmentBody::CancelBySender(CancelReason::RetransmitLimit),
        });
        round_trip(Segment {
            engine_id: 3,
            session_nbr: 4,
            body: SegmentBody::CancelByReceiver(CancelReason::UserCancelled),
        });
        round_trip(Segment {
            engine_id: 3,
            session_nbr: 4,
            body: SegmentBody::CancelAckToSender,
        });
    }

    #[test]
    fn test_truncated_data_rejected() {
        let seg = Segment {
            engine_id: 1,
            session_nbr: 1,
            body: SegmentBody::Data(DataSegment {
                client_id: 1,
                offset: 0,
                red: true,
                checkpoint: false,
                eorp: false,
                eob: false,
                checkpoint_serial: 0,
                report_serial: 0,
                data: vec![5; 100],
            }),
        };
        let mut wire = seg.encode();
        wire.truncate(wire.len() - 1);
        assert!(Segment::decode(&wire).is_err());
    }

    #[test]
    fn test_bad_version_rejected() {
        assert!(Segment::decode(&[0x30, 0x01, 0x01]).is_err());
    }
}
