use std::sync::{Arc, Mutex};

use crate::encoding;
use crate::error::{Error, Result};
use crate::segment::manager::{SegmentManager, RECORD_MARGIN};
use crate::segment::Position;

/// Sequential decoder over the partition's segment stream.
///
/// Holds the current segment's bytes as a shared buffer (kept alive even if
/// the cache evicts the segment) and applies the same roll-over rule as the
/// writer: whenever fewer than `RECORD_MARGIN` bytes of segment capacity
/// remain, the stream continues at offset 0 of the next segment.
pub struct StreamReader {
    manager: Arc<Mutex<SegmentManager>>,
    session: usize,
    capacity: u64,
    segment: u16,
    data: Arc<[u8]>,
    pos: u64,
}

impl Clone for StreamReader {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            session: self.session,
            capacity: self.capacity,
            segment: self.segment,
            data: Arc::clone(&self.data),
            pos: self.pos,
        }
    }
}

impl StreamReader {
    pub fn new(
        manager: Arc<Mutex<SegmentManager>>,
        session: usize,
        start: Position,
    ) -> Result<Self> {
        let (capacity, data) = {
            let mut mgr = manager.lock()?;
            let capacity = mgr.max_segment_size();
            let (data, _) = mgr.get_buffer(start.segment, start.offset, session)?;
            (capacity, data)
        };
        Ok(Self {
            manager,
            session,
            capacity,
            segment: start.segment,
            data,
            pos: start.offset,
        })
    }

    pub fn position(&self) -> Position {
        Position::new(self.segment, self.pos)
    }

    pub fn session(&self) -> usize {
        self.session
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Repositions the stream, fetching a different segment if needed.
    pub fn seek(&mut self, pos: Position) -> Result<()> {
        if pos.segment != self.segment {
            let mut mgr = self.manager.lock()?;
            let (data, _) = mgr.get_buffer(pos.segment, pos.offset, self.session)?;
            self.segment = pos.segment;
            self.data = data;
        }
        self.pos = pos.offset;
        Ok(())
    }

    /// Applies the writer's segment-roll rule before the next item.
    pub fn align_record(&mut self) -> Result<()> {
        if self.capacity - self.pos < RECORD_MARGIN {
            self.seek(Position::new(self.segment + 1, 0))?;
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let b = *self.data.get(self.pos as usize).ok_or_else(|| {
            Error::Decode(
                "stream byte",
                format!("offset {} past end of segment {}", self.pos, self.segment),
            )
        })?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_fixed(&mut self, width: usize) -> Result<u64> {
        let (value, next) = encoding::read_fixed(&self.data, self.pos as usize, width)?;
        self.pos = next as u64;
        Ok(value)
    }

    pub fn read_var1(&mut self) -> Result<u64> {
        let (value, next) = encoding::read_var1(&self.data, self.pos as usize)?;
        self.pos = next as u64;
        Ok(value)
    }

    pub fn read_var2(&mut self) -> Result<u64> {
        let (value, next) = encoding::read_var2(&self.data, self.pos as usize)?;
        self.pos = next as u64;
        Ok(value)
    }
}

/// Streaming encoder over the partition's segment stream. All mutation goes
/// through the manager, which owns the writable segments; the single-writer
/// bulk-load contract means the lock is uncontended here.
pub struct StreamWriter {
    manager: Arc<Mutex<SegmentManager>>,
}

impl StreamWriter {
    pub fn new(manager: Arc<Mutex<SegmentManager>>) -> Self {
        Self { manager }
    }

    /// Rolls to a new segment if fewer than `RECORD_MARGIN` bytes remain,
    /// returning the position the next item will be written at.
    pub fn align_record(&mut self) -> Result<Position> {
        self.manager.lock()?.ensure_room(RECORD_MARGIN)
    }

    /// Current end-of-stream position without rolling.
    pub fn position(&mut self) -> Result<Position> {
        self.manager.lock()?.ensure_room(0)
    }

    /// Rolls to a new segment unless `len` contiguous bytes remain, so a
    /// batch-encoded block never spans a segment boundary.
    pub fn align_block(&mut self, len: u64) -> Result<Position> {
        let mut mgr = self.manager.lock()?;
        if len > mgr.max_segment_size() {
            return Err(Error::InvalidOperation(format!(
                "Block of {} bytes exceeds the segment capacity of {}",
                len,
                mgr.max_segment_size()
            )));
        }
        mgr.ensure_room(len)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<Position> {
        self.manager.lock()?.append(bytes)
    }

    pub fn write_u8(&mut self, value: u8) -> Result<Position> {
        self.write_bytes(&[value])
    }

    pub fn write_fixed(&mut self, value: u64, width: usize) -> Result<Position> {
        let mut buf = Vec::with_capacity(width);
        encoding::write_fixed(&mut buf, value, width);
        self.write_bytes(&buf)
    }

    pub fn write_var1(&mut self, value: u64) -> Result<Position> {
        let mut buf = Vec::with_capacity(10);
        encoding::write_var1(&mut buf, value);
        self.write_bytes(&buf)
    }

    pub fn write_var2(&mut self, value: u64) -> Result<Position> {
        let mut buf = Vec::with_capacity(9);
        encoding::write_var2(&mut buf, value);
        self.write_bytes(&buf)
    }

    /// Reserves `n` zero bytes for a later `patch`.
    pub fn reserve(&mut self, n: usize) -> Result<Position> {
        self.manager.lock()?.reserve(n)
    }

    pub fn patch(&mut self, pos: Position, bytes: &[u8]) -> Result<()> {
        self.manager.lock()?.patch(pos, bytes)
    }

    pub fn patch_byte(&mut self, pos: Position, value: u8) -> Result<()> {
        self.manager.lock()?.patch_byte(pos, value)
    }
}
