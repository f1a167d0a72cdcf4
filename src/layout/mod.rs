pub mod cluster;
pub mod column;
pub mod indexed;
pub mod row;
pub mod signature;
pub mod strategy;

pub use cluster::ReadStats;
pub use indexed::ColumnId;
pub use signature::{Compression, Layout, Signature};

use crate::error::{Error, Result};

/// Read-side cursor state shared by every layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    BeforeFirst,
    Positioned,
    Exhausted,
}

/// Write-side state shared by every layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Idle,
    Appending,
    Closed,
}

/// Single-method sink used as the output channel of column set-difference,
/// decoupling the layout internals from downstream result collection.
pub trait SequenceWriter {
    fn add(&mut self, value: u64) -> Result<()>;
}

impl SequenceWriter for Vec<u64> {
    fn add(&mut self, value: u64) -> Result<()> {
        self.push(value);
        Ok(())
    }
}

/// Positional cursor over one committed block of sorted (key1, key2) pairs.
///
/// Seeks only move forward; the upper layer bounds them with sparse index
/// checkpoints before handing a cursor the remaining distance.
pub trait PairReader {
    /// Positions at the first record. Returns None for an empty block.
    fn first(&mut self) -> Result<Option<(u64, u64)>>;

    /// Advances one record. Calling before `first` is a caller bug and
    /// reports `InvalidState`.
    fn next_pair(&mut self) -> Result<Option<(u64, u64)>>;

    /// Seeks forward to the first record with key1 >= `c1`. May be called
    /// in place of `first`.
    fn move_to_closest_first_term(&mut self, c1: u64) -> Result<Option<(u64, u64)>>;

    /// Assuming the cursor sits inside the group of `c1`, seeks forward
    /// within it to the first record with key2 >= `c2`. Leaves the group
    /// (returning the next group's first record) when no such value exists.
    fn move_to_closest_second_term(&mut self, c1: u64, c2: u64) -> Result<Option<(u64, u64)>>;

    /// Snapshots the full cursor state.
    fn mark(&mut self);

    /// Restores the state captured by the last `mark`.
    fn reset(&mut self) -> Result<()>;

    /// The record the cursor is positioned on, if any.
    fn current(&self) -> Option<(u64, u64)>;
}

/// Streaming encoder for one block. Callers guarantee non-decreasing
/// (key1, key2) input order; the layouts rely on it for delta encoding and
/// group boundary detection and do not re-validate.
pub trait PairWriter {
    fn start_append(&mut self) -> Result<()>;
    fn append(&mut self, key1: u64, key2: u64) -> Result<()>;
    /// Flushes deferred headers and backpatches, closing the block.
    fn stop_append(&mut self) -> Result<()>;
}

/// One-record-lookahead wrapper over any layout reader, evaluating the
/// caller's constraint filters so it can expose a plain hasNext/advance
/// protocol.
pub struct ScanCursor {
    reader: Box<dyn PairReader>,
    constraint1: Option<u64>,
    constraint2: Option<u64>,
    ignore_second: bool,
    lookahead: Option<(u64, u64)>,
    started: bool,
    done: bool,
}

impl ScanCursor {
    pub fn new(reader: Box<dyn PairReader>) -> Self {
        Self {
            reader,
            constraint1: None,
            constraint2: None,
            ignore_second: false,
            lookahead: None,
            started: false,
            done: false,
        }
    }

    /// Only yield records with this first key.
    pub fn with_constraint1(mut self, c1: u64) -> Self {
        self.constraint1 = Some(c1);
        self
    }

    /// Only yield records with this second key.
    pub fn with_constraint2(mut self, c2: u64) -> Self {
        self.constraint2 = Some(c2);
        self
    }

    /// Yield one record per distinct first key, skipping over the rest of
    /// each group.
    pub fn ignore_second(mut self) -> Self {
        self.ignore_second = true;
        self
    }

    pub fn has_next(&mut self) -> Result<bool> {
        if self.lookahead.is_some() {
            return Ok(true);
        }
        if self.done {
            return Ok(false);
        }
        loop {
            let next = self.fetch()?;
            let (k1, k2) = match next {
                Some(pair) => pair,
                None => {
                    self.done = true;
                    return Ok(false);
                }
            };
            if let Some(c1) = self.constraint1 {
                if k1 != c1 {
                    // The stream is sorted by key1: past c1 means no more matches
                    self.done = true;
                    return Ok(false);
                }
            }
            if let Some(c2) = self.constraint2 {
                if k2 != c2 {
                    if self.constraint1.is_some() && k2 > c2 {
                        self.done = true;
                        return Ok(false);
                    }
                    continue;
                }
            }
            self.lookahead = Some((k1, k2));
            return Ok(true);
        }
    }

    pub fn next(&mut self) -> Result<Option<(u64, u64)>> {
        if self.lookahead.is_none() && !self.has_next()? {
            return Ok(None);
        }
        Ok(self.lookahead.take())
    }

    fn fetch(&mut self) -> Result<Option<(u64, u64)>> {
        if !self.started {
            self.started = true;
            return match self.constraint1 {
                Some(c1) => {
                    let landed = self.reader.move_to_closest_first_term(c1)?;
                    match (landed, self.constraint2) {
                        (Some((k1, k2)), Some(c2)) if k1 == c1 && k2 < c2 => {
                            self.reader.move_to_closest_second_term(c1, c2)
                        }
                        _ => Ok(landed),
                    }
                }
                None => self.reader.first(),
            };
        }
        if self.ignore_second {
            let (k1, _) = match self.reader.current() {
                Some(pair) => pair,
                None => return Ok(None),
            };
            // No key can follow u64::MAX
            let next = match k1.checked_add(1) {
                Some(n) => n,
                None => return Ok(None),
            };
            return self.reader.move_to_closest_first_term(next);
        }
        self.reader.next_pair()
    }
}

/// Encodes one value in the signature's compression mode.
pub(crate) fn write_value(
    stream: &mut crate::segment::StreamWriter,
    value: u64,
    mode: Compression,
) -> Result<()> {
    match mode {
        Compression::None => stream.write_fixed(value, 8)?,
        Compression::Var1 => stream.write_var1(value)?,
        Compression::Var2 => stream.write_var2(value)?,
    };
    Ok(())
}

/// Encoded size of one value under a compression mode.
pub(crate) fn encoded_len(value: u64, mode: Compression) -> u64 {
    match mode {
        Compression::None => 8,
        Compression::Var1 => crate::encoding::var1_len(value) as u64,
        Compression::Var2 => crate::encoding::var2_len(value) as u64,
    }
}

/// Decodes one value in the signature's compression mode.
pub(crate) fn read_value(
    stream: &mut crate::segment::StreamReader,
    mode: Compression,
) -> Result<u64> {
    match mode {
        Compression::None => stream.read_fixed(8),
        Compression::Var1 => stream.read_var1(),
        Compression::Var2 => stream.read_var2(),
    }
}

pub(crate) fn invalid_before_first() -> Error {
    Error::InvalidState("Cursor not positioned: call first() before advancing".to_string())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// In-memory reference reader used to exercise ScanCursor independently
    /// of the on-disk layouts.
    pub struct VecReader {
        pairs: Vec<(u64, u64)>,
        state: ReadState,
        pos: usize,
        marked: Option<(ReadState, usize)>,
    }

    impl VecReader {
        pub fn new(pairs: Vec<(u64, u64)>) -> Self {
            Self {
                pairs,
                state: ReadState::BeforeFirst,
                pos: 0,
                marked: None,
            }
        }
    }

    impl PairReader for VecReader {
        fn first(&mut self) -> Result<Option<(u64, u64)>> {
            self.pos = 0;
            if self.pairs.is_empty() {
                self.state = ReadState::Exhausted;
                Ok(None)
            } else {
                self.state = ReadState::Positioned;
                Ok(Some(self.pairs[0]))
            }
        }

        fn next_pair(&mut self) -> Result<Option<(u64, u64)>> {
            match self.state {
                ReadState::BeforeFirst => Err(invalid_before_first()),
                ReadState::Exhausted => Ok(None),
                ReadState::Positioned => {
                    self.pos += 1;
                    if self.pos >= self.pairs.len() {
                        self.state = ReadState::Exhausted;
                        Ok(None)
                    } else {
                        Ok(Some(self.pairs[self.pos]))
                    }
                }
            }
        }

        fn move_to_closest_first_term(&mut self, c1: u64) -> Result<Option<(u64, u64)>> {
            let start = match self.state {
                ReadState::BeforeFirst => 0,
                ReadState::Positioned => self.pos,
                ReadState::Exhausted => return Ok(None),
            };
            for i in start..self.pairs.len() {
                if self.pairs[i].0 >= c1 {
                    self.pos = i;
                    self.state = ReadState::Positioned;
                    return Ok(Some(self.pairs[i]));
                }
            }
            self.state = ReadState::Exhausted;
            Ok(None)
        }

        fn move_to_closest_second_term(&mut self, c1: u64, c2: u64) -> Result<Option<(u64, u64)>> {
            for i in self.pos..self.pairs.len() {
                let (k1, k2) = self.pairs[i];
                if k1 > c1 || (k1 == c1 && k2 >= c2) {
                    self.pos = i;
                    self.state = ReadState::Positioned;
                    return Ok(Some(self.pairs[i]));
                }
            }
            self.state = ReadState::Exhausted;
            Ok(None)
        }

        fn mark(&mut self) {
            self.marked = Some((self.state, self.pos));
        }

        fn reset(&mut self) -> Result<()> {
            let (state, pos) = self
                .marked
                .ok_or_else(|| Error::InvalidState("reset without mark".to_string()))?;
            self.state = state;
            self.pos = pos;
            Ok(())
        }

        fn current(&self) -> Option<(u64, u64)> {
            match self.state {
                ReadState::Positioned => Some(self.pairs[self.pos]),
                _ => None,
            }
        }
    }
}
