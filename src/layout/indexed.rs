//! Indexed-Column layout: two dense fixed-width columns. The first column
//! holds one `(key1, count, starting_point)` record per distinct key1; the
//! second holds every key2 value. All four byte widths are computed once at
//! write time from the observed value ranges and packed into a 2-byte
//! header, so both columns support true binary search with no sparse index.
//!
//! The block is batch-encoded into one contiguous region of a single
//! segment; every access is offset arithmetic from the block start.

use std::sync::{Arc, Mutex};

use itertools::Itertools;

use crate::encoding;
use crate::error::{Error, Result};
use crate::layout::{
    invalid_before_first, PairReader, PairWriter, ReadState, SequenceWriter, Signature, WriteState,
};
use crate::segment::{Position, SegmentManager, StreamReader, StreamWriter};

const COUNT_FIELD: usize = 4;
const HEADER_LEN: u64 = 2 * COUNT_FIELD as u64 + 2;

/// Which column of an Indexed-Column block an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnId {
    First,
    Second,
}

fn pack_widths(a: usize, b: usize) -> u8 {
    debug_assert!((1..=8).contains(&a) && (1..=8).contains(&b));
    (a as u8) << 4 | b as u8
}

fn unpack_widths(byte: u8) -> Result<(usize, usize)> {
    let a = (byte >> 4) as usize;
    let b = (byte & 0xf) as usize;
    if !(1..=8).contains(&a) || !(1..=8).contains(&b) {
        return Err(Error::Decode(
            "column width header",
            format!("invalid widths in byte {:#04x}", byte),
        ));
    }
    Ok((a, b))
}

pub struct IndexedWriter {
    stream: StreamWriter,
    state: WriteState,
    start: Option<Position>,
    pairs: Vec<(u64, u64)>,
}

impl IndexedWriter {
    pub fn new(manager: Arc<Mutex<SegmentManager>>, _sig: Signature) -> Self {
        Self {
            stream: StreamWriter::new(manager),
            state: WriteState::Idle,
            start: None,
            pairs: Vec::new(),
        }
    }

    pub fn start_position(&self) -> Option<Position> {
        self.start
    }

    fn encode(&self) -> Vec<u8> {
        let grouped = self
            .pairs
            .iter()
            .enumerate()
            .chunk_by(|&(_, &(k1, _))| k1);
        let groups: Vec<(u64, u64, u64)> = grouped
            .into_iter()
            .map(|(k1, chunk)| {
                let mut count = 0u64;
                let mut start = 0u64;
                for (i, _) in chunk {
                    if count == 0 {
                        start = i as u64;
                    }
                    count += 1;
                }
                (k1, count, start)
            })
            .collect();

        let w1 = width_for(groups.iter().map(|g| g.0));
        let wc = width_for(groups.iter().map(|g| g.1));
        let ws = width_for(groups.iter().map(|g| g.2));
        let w2 = width_for(self.pairs.iter().map(|p| p.1));

        let mut buf = Vec::new();
        encoding::write_fixed(&mut buf, groups.len() as u64, COUNT_FIELD);
        encoding::write_fixed(&mut buf, self.pairs.len() as u64, COUNT_FIELD);
        buf.push(pack_widths(w1, wc));
        buf.push(pack_widths(ws, w2));
        for &(k1, count, start) in &groups {
            encoding::write_fixed(&mut buf, k1, w1);
            encoding::write_fixed(&mut buf, count, wc);
            encoding::write_fixed(&mut buf, start, ws);
        }
        for &(_, k2) in &self.pairs {
            encoding::write_fixed(&mut buf, k2, w2);
        }
        buf
    }
}

fn width_for(values: impl Iterator<Item = u64>) -> usize {
    values.map(encoding::fixed_width).max().unwrap_or(1)
}

impl PairWriter for IndexedWriter {
    fn start_append(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, WriteState::Idle);
        self.state = WriteState::Appending;
        Ok(())
    }

    fn append(&mut self, key1: u64, key2: u64) -> Result<()> {
        debug_assert_eq!(self.state, WriteState::Appending);
        self.pairs.push((key1, key2));
        Ok(())
    }

    fn stop_append(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, WriteState::Appending);
        let buf = self.encode();
        self.start = Some(self.stream.align_block(buf.len() as u64)?);
        self.stream.write_bytes(&buf)?;
        self.state = WriteState::Closed;
        Ok(())
    }
}

#[derive(Clone)]
struct Snapshot {
    state: ReadState,
    current: Option<(u64, u64)>,
    group_idx: u64,
    group: (u64, u64, u64),
    val_off: u64,
}

pub struct IndexedReader {
    stream: StreamReader,
    segment: u16,
    n_groups: u64,
    total: u64,
    w1: usize,
    wc: usize,
    ws: usize,
    w2: usize,
    col1_off: u64,
    col2_off: u64,
    state: ReadState,
    current: Option<(u64, u64)>,
    group_idx: u64,
    /// (key1, count, starting_point) of the group the cursor is in.
    group: (u64, u64, u64),
    /// Offset of the current value within the group, 0..count.
    val_off: u64,
    marked: Option<Snapshot>,
}

impl IndexedReader {
    pub fn new(
        manager: Arc<Mutex<SegmentManager>>,
        session: usize,
        _sig: Signature,
        start: Position,
    ) -> Result<Self> {
        let mut stream = StreamReader::new(manager, session, start)?;
        let n_groups = stream.read_fixed(COUNT_FIELD)?;
        let total = stream.read_fixed(COUNT_FIELD)?;
        let (w1, wc) = unpack_widths(stream.read_u8()?)?;
        let (ws, w2) = unpack_widths(stream.read_u8()?)?;
        let col1_off = start.offset + HEADER_LEN;
        let col2_off = col1_off + n_groups * (w1 + wc + ws) as u64;
        Ok(Self {
            stream,
            segment: start.segment,
            n_groups,
            total,
            w1,
            wc,
            ws,
            w2,
            col1_off,
            col2_off,
            state: ReadState::BeforeFirst,
            current: None,
            group_idx: 0,
            group: (0, 0, 0),
            val_off: 0,
            marked: None,
        })
    }

    fn stride(&self) -> u64 {
        (self.w1 + self.wc + self.ws) as u64
    }

    fn read_group(&mut self, i: u64) -> Result<(u64, u64, u64)> {
        debug_assert!(i < self.n_groups);
        self.stream
            .seek(Position::new(self.segment, self.col1_off + i * self.stride()))?;
        let k1 = self.stream.read_fixed(self.w1)?;
        let count = self.stream.read_fixed(self.wc)?;
        let start = self.stream.read_fixed(self.ws)?;
        Ok((k1, count, start))
    }

    fn read_value(&mut self, j: u64) -> Result<u64> {
        debug_assert!(j < self.total);
        self.stream
            .seek(Position::new(self.segment, self.col2_off + j * self.w2 as u64))?;
        self.stream.read_fixed(self.w2)
    }

    /// Positions the cursor on value `val_off` of group `group_idx`.
    fn position_on(&mut self, group_idx: u64, val_off: u64) -> Result<Option<(u64, u64)>> {
        if group_idx >= self.n_groups {
            self.state = ReadState::Exhausted;
            self.current = None;
            return Ok(None);
        }
        if self.state == ReadState::BeforeFirst || group_idx != self.group_idx {
            self.group = self.read_group(group_idx)?;
            self.group_idx = group_idx;
        }
        debug_assert!(val_off < self.group.1);
        let k2 = self.read_value(self.group.2 + val_off)?;
        self.val_off = val_off;
        self.state = ReadState::Positioned;
        self.current = Some((self.group.0, k2));
        Ok(self.current)
    }

    fn column_len(&self, col: ColumnId) -> u64 {
        match col {
            ColumnId::First => self.n_groups,
            ColumnId::Second => self.total,
        }
    }

    fn column_at(&mut self, col: ColumnId, i: u64) -> Result<u64> {
        match col {
            ColumnId::First => Ok(self.read_group(i)?.0),
            ColumnId::Second => self.read_value(i),
        }
    }

    /// Emits every value of `col` that does not occur in `other_col` of
    /// `other`, via a merge over the two sorted columns. Both columns must
    /// be sorted with distinct values, which holds for first columns always
    /// and for second columns of single-group blocks.
    pub fn column_not_in(
        &mut self,
        col: ColumnId,
        other: &mut IndexedReader,
        other_col: ColumnId,
        out: &mut dyn SequenceWriter,
    ) -> Result<()> {
        let n = self.column_len(col);
        let m = other.column_len(other_col);
        let mut j = 0u64;
        for i in 0..n {
            let a = self.column_at(col, i)?;
            let mut present = false;
            while j < m {
                let b = other.column_at(other_col, j)?;
                if b < a {
                    j += 1;
                } else {
                    present = b == a;
                    break;
                }
            }
            if !present {
                out.add(a)?;
            }
        }
        Ok(())
    }
}

impl PairReader for IndexedReader {
    fn first(&mut self) -> Result<Option<(u64, u64)>> {
        self.state = ReadState::BeforeFirst;
        self.position_on(0, 0)
    }

    fn next_pair(&mut self) -> Result<Option<(u64, u64)>> {
        match self.state {
            ReadState::BeforeFirst => Err(invalid_before_first()),
            ReadState::Exhausted => Ok(None),
            ReadState::Positioned => {
                if self.val_off + 1 < self.group.1 {
                    self.position_on(self.group_idx, self.val_off + 1)
                } else {
                    self.position_on(self.group_idx + 1, 0)
                }
            }
        }
    }

    fn move_to_closest_first_term(&mut self, c1: u64) -> Result<Option<(u64, u64)>> {
        let mut lo = match self.state {
            ReadState::BeforeFirst => 0,
            ReadState::Positioned => {
                if self.group.0 >= c1 {
                    return Ok(self.current);
                }
                self.group_idx + 1
            }
            ReadState::Exhausted => return Ok(None),
        };
        // Lower-bound binary search on the fixed-stride first column
        let mut hi = self.n_groups;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.read_group(mid)?.0 < c1 {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.state = ReadState::BeforeFirst;
        self.position_on(lo, 0)
    }

    fn move_to_closest_second_term(&mut self, c1: u64, c2: u64) -> Result<Option<(u64, u64)>> {
        if self.state != ReadState::Positioned {
            return Ok(None);
        }
        if self.group.0 > c1 || (self.group.0 == c1 && self.current.map(|p| p.1) >= Some(c2)) {
            return Ok(self.current);
        }
        let (_, count, start) = self.group;
        let mut lo = self.val_off + 1;
        let mut hi = count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.read_value(start + mid)? < c2 {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo < count {
            self.position_on(self.group_idx, lo)
        } else {
            self.position_on(self.group_idx + 1, 0)
        }
    }

    fn mark(&mut self) {
        self.marked = Some(Snapshot {
            state: self.state,
            current: self.current,
            group_idx: self.group_idx,
            group: self.group,
            val_off: self.val_off,
        });
    }

    fn reset(&mut self) -> Result<()> {
        let snap = self
            .marked
            .clone()
            .ok_or_else(|| Error::InvalidState("reset without mark".to_string()))?;
        self.state = snap.state;
        self.current = snap.current;
        self.group_idx = snap.group_idx;
        self.group = snap.group;
        self.val_off = snap.val_off;
        Ok(())
    }

    fn current(&self) -> Option<(u64, u64)> {
        self.current
    }
}
