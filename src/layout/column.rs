//! Simple-Column layout: all key1 values as one fixed-width column, then
//! all key2 values as a second column. One pass over the batch at
//! `stop_append` computes the key1 byte width, so the column carries a
//! single width header instead of per-pair group metadata. Suited to
//! blocks with few groups but many values, mainly aggregated
//! back-reference blocks.
//!
//! The whole block is batch-encoded into one contiguous region of a
//! single segment, so reads are plain offset arithmetic.

use std::sync::{Arc, Mutex};

use crate::encoding;
use crate::error::{Error, Result};
use crate::layout::{
    invalid_before_first, PairReader, PairWriter, ReadState, Signature, WriteState,
};
use crate::segment::{Position, SegmentManager, StreamReader, StreamWriter};

const COUNT_FIELD: usize = 4;

pub struct ColumnWriter {
    stream: StreamWriter,
    sig: Signature,
    state: WriteState,
    start: Option<Position>,
    pairs: Vec<(u64, u64)>,
}

impl ColumnWriter {
    pub fn new(manager: Arc<Mutex<SegmentManager>>, sig: Signature) -> Self {
        Self {
            stream: StreamWriter::new(manager),
            sig,
            state: WriteState::Idle,
            start: None,
            pairs: Vec::new(),
        }
    }

    pub fn start_position(&self) -> Option<Position> {
        self.start
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        encoding::write_fixed(&mut buf, self.pairs.len() as u64, COUNT_FIELD);

        // First column: fixed width wide enough for the largest field,
        // which under delta mode is the largest gap rather than the
        // largest key.
        let mut fields = Vec::with_capacity(self.pairs.len());
        let mut prev = 0u64;
        for (i, &(k1, _)) in self.pairs.iter().enumerate() {
            let field = if self.sig.delta_first && i > 0 {
                k1 - prev
            } else {
                k1
            };
            fields.push(field);
            prev = k1;
        }
        let width = fields
            .iter()
            .map(|&f| encoding::fixed_width(f))
            .max()
            .unwrap_or(1);
        buf.push(width as u8);
        for &field in &fields {
            encoding::write_fixed(&mut buf, field, width);
        }

        for &(_, k2) in &self.pairs {
            match self.sig.compr2 {
                crate::layout::Compression::None => encoding::write_fixed(&mut buf, k2, 8),
                crate::layout::Compression::Var1 => encoding::write_var1(&mut buf, k2),
                crate::layout::Compression::Var2 => encoding::write_var2(&mut buf, k2),
            }
        }
        buf
    }
}

impl PairWriter for ColumnWriter {
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
    stream: StreamReader,
    state: ReadState,
    current: Option<(u64, u64)>,
    idx: usize,
}

pub struct ColumnReader {
    stream: StreamReader,
    sig: Signature,
    keys1: Vec<u64>,
    values_start: Position,
    /// Index of the record the cursor is positioned on.
    idx: usize,
    state: ReadState,
    current: Option<(u64, u64)>,
    marked: Option<Snapshot>,
}

impl ColumnReader {
    pub fn new(
        manager: Arc<Mutex<SegmentManager>>,
        session: usize,
        sig: Signature,
        start: Position,
    ) -> Result<Self> {
        let mut stream = StreamReader::new(manager, session, start)?;
        let count = stream.read_fixed(COUNT_FIELD)? as usize;
        let width = stream.read_u8()? as usize;
        if !(1..=8).contains(&width) {
            return Err(Error::Decode(
                "column width header",
                format!("invalid width {}", width),
            ));
        }

        let mut keys1 = Vec::with_capacity(count);
        let mut prev = 0u64;
        for i in 0..count {
            let field = stream.read_fixed(width)?;
            let k1 = if sig.delta_first && i > 0 {
                prev + field
            } else {
                field
            };
            keys1.push(k1);
            prev = k1;
        }
        let values_start = stream.position();
        Ok(Self {
            stream,
            sig,
            keys1,
            values_start,
            idx: 0,
            state: ReadState::BeforeFirst,
            current: None,
            marked: None,
        })
    }

    fn read_value(&mut self) -> Result<u64> {
        crate::layout::read_value(&mut self.stream, self.sig.compr2)
    }

    /// Skips forward so the cursor lands on record `target`, decoding and
    /// discarding the variable-width values in between.
    fn advance_to(&mut self, target: usize) -> Result<Option<(u64, u64)>> {
        debug_assert!(target > self.idx || self.state == ReadState::BeforeFirst);
        if target >= self.keys1.len() {
            self.state = ReadState::Exhausted;
            self.current = None;
            return Ok(None);
        }
        let from = match self.state {
            ReadState::BeforeFirst => 0,
            _ => self.idx + 1,
        };
        for _ in from..target {
            self.read_value()?;
        }
        let k2 = self.read_value()?;
        self.idx = target;
        self.state = ReadState::Positioned;
        self.current = Some((self.keys1[target], k2));
        Ok(self.current)
    }
}

impl PairReader for ColumnReader {
    fn first(&mut self) -> Result<Option<(u64, u64)>> {
        self.stream.seek(self.values_start)?;
        self.state = ReadState::BeforeFirst;
        self.advance_to(0)
    }

    fn next_pair(&mut self) -> Result<Option<(u64, u64)>> {
        match self.state {
            ReadState::BeforeFirst => Err(invalid_before_first()),
            ReadState::Exhausted => Ok(None),
            ReadState::Positioned => self.advance_to(self.idx + 1),
        }
    }

    fn move_to_closest_first_term(&mut self, c1: u64) -> Result<Option<(u64, u64)>> {
        let from = match self.state {
            ReadState::BeforeFirst => {
                self.stream.seek(self.values_start)?;
                0
            }
            ReadState::Positioned => {
                if self.keys1[self.idx] >= c1 {
                    return Ok(self.current);
                }
                self.idx + 1
            }
            ReadState::Exhausted => return Ok(None),
        };
        // The key1 column is already in memory; only the value skip is
        // sequential.
        let target = from + self.keys1[from..].partition_point(|&k| k < c1);
        self.advance_to(target)
    }

    fn move_to_closest_second_term(&mut self, c1: u64, c2: u64) -> Result<Option<(u64, u64)>> {
        loop {
            let (k1, k2) = match self.current {
                Some(pair) => pair,
                None => return Ok(None),
            };
            if k1 > c1 || (k1 == c1 && k2 >= c2) {
                return Ok(self.current);
            }
            if self.next_pair()?.is_none() {
                return Ok(None);
            }
        }
    }

    fn mark(&mut self) {
        self.marked = Some(Snapshot {
            stream: self.stream.clone(),
            state: self.state,
            current: self.current,
            idx: self.idx,
        });
    }

    fn reset(&mut self) -> Result<()> {
        let snap = self
            .marked
            .clone()
            .ok_or_else(|| Error::InvalidState("reset without mark".to_string()))?;
        self.stream = snap.stream;
        self.state = snap.state;
        self.current = snap.current;
        self.idx = snap.idx;
        Ok(())
    }

    fn current(&self) -> Option<(u64, u64)> {
        self.current
    }
}
