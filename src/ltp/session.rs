//! Session bookkeeping records and red-part gap tracking.

use super::segment::Claim;
use crate::store::{Addr, Rec, Txn};
use crate::tools::error::Result;

fn get(buf: &[u8], i: usize) -> u64 {
    u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap())
}

fn put(buf: &mut [u8], i: usize, v: u64) {
    buf[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
}

/// Sender-side session lifecycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExportState {
    /// Accumulating client service data
    Filling,
    /// Block emitted; awaiting a reception report
    AwaitingReport,
    /// Red part fully acknowledged
    Closed,
    /// Cancelled locally or by the peer
    Cancelled,
}

impl ExportState {
    fn to_u64(self) -> u64 {
        match self {
            ExportState::Filling => 0,
            ExportState::AwaitingReport => 1,
            ExportState::Closed => 2,
            ExportState::Cancelled => 3,
        }
    }

    fn from_u64(v: u64) -> ExportState {
        match v {
            0 => ExportState::Filling,
            1 => ExportState::AwaitingReport,
            2 => ExportState::Closed,
            _ => ExportState::Cancelled,
        }
    }
}

/// Sender-side session record.
#[derive(Debug)]
pub(crate) struct ExportSessionRec {
    pub session_nbr: u64,
    pub peer_engine: u64,
    pub client_id: u64,
    pub state: ExportState,
    pub red_length: u64,
    pub block_length: u64,
    /// List of client service-data ZCOs composing the block
    pub svc_data: Addr,
    /// List of emitted segment descriptors
    pub segments: Addr,
    /// List of acknowledged red ranges
    pub acked: Addr,
    pub ckpt_serial: u64,
    pub ckpt_offset: u64,
    pub ckpt_length: u64,
    pub ckpt_retransmits: u64,
}

impl Rec for ExportSessionRec {
    const SIZE: usize = 104;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.session_nbr);
        put(buf, 1, self.peer_engine);
        put(buf, 2, self.client_id);
        put(buf, 3, self.state.to_u64());
        put(buf, 4, self.red_length);
        put(buf, 5, self.block_length);
        put(buf, 6, self.svc_data.0);
        put(buf, 7, self.segments.0);
        put(buf, 8, self.acked.0);
        put(buf, 9, self.ckpt_serial);
        put(buf, 10, self.ckpt_offset);
        put(buf, 11, self.ckpt_length);
        put(buf, 12, self.ckpt_retransmits);
    }

    fn decode(buf: &[u8]) -> Self {
        ExportSessionRec {
            session_nbr: get(buf, 0),
            peer_engine: get(buf, 1),
            client_id: get(buf, 2),
            state: ExportState::from_u64(get(buf, 3)),
            red_length: get(buf, 4),
            block_length: get(buf, 5),
            svc_data: Addr(get(buf, 6)),
            segments: Addr(get(buf, 7)),
            acked: Addr(get(buf, 8)),
            ckpt_serial: get(buf, 9),
            ckpt_offset: get(buf, 10),
            ckpt_length: get(buf, 11),
            ckpt_retransmits: get(buf, 12),
        }
    }
}

/// Descriptor of one emitted data segment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegRec {
    pub offset: u64,
    pub length: u64,
    pub red: bool,
    pub serial: u64,
}

impl Rec for SegRec {
    const SIZE: usize = 32;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.offset);
        put(buf, 1, self.length);
        put(buf, 2, self.red as u64);
        put(buf, 3, self.serial);
    }

    fn decode(buf: &[u8]) -> Self {
        SegRec {
            offset: get(buf, 0),
            length: get(buf, 1),
            red: get(buf, 2) != 0,
            serial: get(buf, 3),
        }
    }
}

/// Receiver-side session record.
#[derive(Debug)]
pub(crate) struct ImportSessionRec {
    pub session_nbr: u64,
    pub peer_engine: u64,
    pub client_id: u64,
    /// Reassembly buffer (heap byte array) and its current capacity
    pub buffer: Addr,
    pub buffer_cap: u64,
    /// Red-part length; 0 until the end-of-red-part checkpoint arrives
    pub red_length: u64,
    pub eob_seen: bool,
    /// List of received red ranges
    pub ranges: Addr,
    pub rpt_serial: u64,
    pub rpt_ckpt_serial: u64,
    pub rpt_retransmits: u64,
}

impl Rec for ImportSessionRec {
    const SIZE: usize = 88;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.session_nbr);
        put(buf, 1, self.peer_engine);
        put(buf, 2, self.client_id);
        put(buf, 3, self.buffer.0);
        put(buf, 4, self.buffer_cap);
        put(buf, 5, self.red_length);
        put(buf, 6, self.eob_seen as u64);
        put(buf, 7, self.ranges.0);
        put(buf, 8, self.rpt_serial);
        put(buf, 9, self.rpt_ckpt_serial);
        put(buf, 10, self.rpt_retransmits);
    }

    fn decode(buf: &[u8]) -> Self {
        ImportSessionRec {
            session_nbr: get(buf, 0),
            peer_engine: get(buf, 1),
            client_id: get(buf, 2),
            buffer: Addr(get(buf, 3)),
            buffer_cap: get(buf, 4),
            red_length: get(buf, 5),
            eob_seen: get(buf, 6) != 0,
            ranges: Addr(get(buf, 7)),
            rpt_serial: get(buf, 8),
            rpt_ckpt_serial: get(buf, 9),
            rpt_retransmits: get(buf, 10),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RangeRec {
    begin: u64,
    end: u64,
}

impl Rec for RangeRec {
    const SIZE: usize = 16;

    fn encode(&self, buf: &mut [u8]) {
        put(buf, 0, self.begin);
        put(buf, 1, self.end);
    }

    fn decode(buf: &[u8]) -> Self {
        RangeRec {
            begin: get(buf, 0),
            end: get(buf, 1),
        }
    }
}

/// Read the ranges of `list` in ascending order.
pub(crate) fn read_ranges(txn: &Txn, list: Addr) -> Result<Vec<Claim>> {
    let mut out = Vec::new();
    let mut elt = txn.list_first(list)?;
    while !elt.is_null() {
        let rec: RangeRec = txn.get(txn.list_data(elt)?)?;
        out.push(Claim {
            begin: rec.begin,
            end: rec.end,
        });
        elt = txn.list_next(elt)?;
    }
    Ok(out)
}

fn write_ranges(txn: &mut Txn, list: Addr, ranges: &[Claim]) -> Result<()> {
    // Rewrite the whole list; range sets stay small.
    let mut elt = txn.list_first(list)?;
    while !elt.is_null() {
        let next = txn.list_next(elt)?;
        let data = txn.list_data(elt)?;
        txn.free(data)?;
        txn.list_delete(elt)?;
        elt = next;
    }
    for claim in ranges {
        let rec = txn.alloc_rec(&RangeRec {
            begin: claim.begin,
            end: claim.end,
        })?;
        txn.list_insert_last(list, rec)?;
    }
    Ok(())
}

/// Merge `[begin, end)` into the range list, coalescing overlaps.
pub(crate) fn merge_range(txn: &mut Txn, list: Addr, begin: u64, end: u64) -> Result<()> {
    let mut ranges = read_ranges(txn, list)?;
    ranges.push(Claim { begin, end });
    ranges.sort_by_key(|c| c.begin);

    let mut merged: Vec<Claim> = Vec::with_capacity(ranges.len());
    for claim in ranges {
        match merged.last_mut() {
            Some(last) if claim.begin <= last.end => {
                last.end = last.end.max(claim.end);
            }
            _ => merged.push(claim),
        }
    }
    write_ranges(txn, list, &merged)
}

/// Release the range list and its records.
pub(crate) fn destroy_ranges(txn: &mut Txn, list: Addr) -> Result<()> {
    let mut elt = txn.list_first(list)?;
    while !elt.is_null() {
        let next = txn.list_next(elt)?;
        let data = txn.list_data(elt)?;
        txn.free(data)?;
        elt = next;
    }
    txn.list_destroy(list)
}

/// True if the ranges fully cover `[0, length)`.
pub(crate) fn covers_prefix(ranges: &[Claim], length: u64) -> bool {
    if length == 0 {
        return false;
    }
    match ranges.first() {
        Some(first) => first.begin == 0 && first.end >= length,
        None => false,
    }
}

/// Uncovered intervals of `[lower, upper)`.
pub(crate) fn gaps_within(ranges: &[Claim], lower: u64, upper: u64) -> Vec<Claim> {
    let mut gaps = Vec::new();
    let mut cursor = lower;
    for claim in ranges {
        if claim.end <= cursor {
            continue;
        }
        if claim.begin >= upper {
            break;
        }
        if claim.begin > cursor {
            gaps.push(Claim {
                begin: cursor,
                end: claim.begin.min(upper),
            });
        }
        cursor = cursor.max(claim.end);
        if cursor >= upper {
            break;
        }
    }
    if cursor < upper {
        gaps.push(Claim {
            begin: cursor,
            end: upper,
        });
    }
    gaps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Heap;

    #[test]
    fn test_merge_and_gaps() {
        crate::tests::init();
        let dir = tempfile::tempdir().unwrap();
        let heap = Heap::create(dir.path().join("ltp.heap"), 1 << 20).unwrap();
        let mut txn = heap.begin();
        let list = txn.list_create().unwrap();

        merge_range(&mut txn, list, 0, 500).unwrap();
        merge_range(&mut txn, list, 1000, 1500).unwrap();
        let ranges = read_ranges(&txn, list).unwrap();
        assert_eq!(ranges.len(), 2);
        assert!(!covers_prefix(&ranges, 1500));
        assert_eq!(
            gaps_within(&ranges, 0, 1500),
            vec![Claim {
                begin: 500,
                end: 1000
            }]
        );

        // Fill the hole; adjacent ranges coalesce.
        merge_range(&mut txn, list, 500, 1000).unwrap();
        let ranges = read_ranges(&txn, list).unwrap();
        assert_eq!(
            ranges,
            vec![Claim {
                begin: 0,
                end: 1500
            }]
        );
        assert!(covers_prefix(&ranges, 1500));
        assert!(gaps_within(&ranges, 0, 1500).is_empty());

        destroy_ranges(&mut txn, list).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_overlapping_segments_merge() {
        crate::tests::init();
        let dir = tempfile::tempdir().unwrap();
        let heap = Heap::create(dir.path().join("ltp2.heap"), 1 << 20).unwrap();
        let mut txn = heap.begin();
        let list = txn.list_create().unwrap();

        merge_range(&mut txn, list, 100, 300).unwrap();
        merge_range(&mut txn, list, 200, 400).unwrap();
        merge_range(&mut txn, list, 50, 100).unwrap();
        let ranges = read_ranges(&txn, list).unwrap();
        assert_eq!(
            ranges,
            vec![Claim {
                begin: 50,
                end: 400
            }]
        );
        txn.cancel();
    }
}
