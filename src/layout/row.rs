//! Row layout: records written back-to-back as (key1, key2), with optional
//! delta encoding of key1 against the previous record.
//!
//! When both columns are uncompressed and delta mode is off, every record
//! occupies exactly 16 bytes and seeks binary-search the raw bytes
//! directly; all other encodings seek by linear scan from the cursor, which
//! the sparse index has already bounded.

use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::layout::{
    invalid_before_first, read_value, write_value, Compression, PairReader, PairWriter, ReadState,
    Signature, WriteState,
};
use crate::segment::manager::RECORD_MARGIN;
use crate::segment::{Position, SegmentManager, StreamReader, StreamWriter};

const COUNT_FIELD: usize = 4;
const FIXED_RECORD: u64 = 16;

pub struct RowWriter {
    stream: StreamWriter,
    sig: Signature,
    state: WriteState,
    start: Option<Position>,
    count: u32,
    prev_key1: u64,
}

impl RowWriter {
    pub fn new(manager: Arc<Mutex<SegmentManager>>, sig: Signature) -> Self {
        Self {
            stream: StreamWriter::new(manager),
            sig,
            state: WriteState::Idle,
            start: None,
            count: 0,
            prev_key1: 0,
        }
    }

    /// Block start: the position the coordinate index records.
    pub fn start_position(&self) -> Option<Position> {
        self.start
    }
}

impl PairWriter for RowWriter {
    fn start_append(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, WriteState::Idle);
        self.stream.align_record()?;
        self.start = Some(self.stream.reserve(COUNT_FIELD)?);
        self.state = WriteState::Appending;
        Ok(())
    }

    fn append(&mut self, key1: u64, key2: u64) -> Result<()> {
        debug_assert_eq!(self.state, WriteState::Appending);
        self.stream.align_record()?;

        let first = if self.sig.delta_first && self.count > 0 {
            key1 - self.prev_key1
        } else {
            key1
        };
        write_value(&mut self.stream, first, self.sig.compr1)?;
        write_value(&mut self.stream, key2, self.sig.compr2)?;

        self.prev_key1 = key1;
        self.count += 1;
        Ok(())
    }

    fn stop_append(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, WriteState::Appending);
        let start = self.start.expect("start set in start_append");
        let mut buf = Vec::with_capacity(COUNT_FIELD);
        crate::encoding::write_fixed(&mut buf, self.count as u64, COUNT_FIELD);
        self.stream.patch(start, &buf)?;
        self.state = WriteState::Closed;
        Ok(())
    }
}

#[derive(Clone)]
struct Snapshot {
    stream: StreamReader,
    state: ReadState,
    consumed: u32,
    current: Option<(u64, u64)>,
    prev_key1: u64,
}

pub struct RowReader {
    stream: StreamReader,
    sig: Signature,
    count: u32,
    /// Records consumed so far, i.e. the index just past the current one.
    consumed: u32,
    state: ReadState,
    current: Option<(u64, u64)>,
    prev_key1: u64,
    data_start: Position,
    marked: Option<Snapshot>,
}

impl RowReader {
    pub fn new(
        manager: Arc<Mutex<SegmentManager>>,
        session: usize,
        sig: Signature,
        start: Position,
    ) -> Result<Self> {
        let mut stream = StreamReader::new(manager, session, start)?;
        let count = stream.read_fixed(COUNT_FIELD)? as u32;
        let data_start = stream.position();
        Ok(Self {
            stream,
            sig,
            count,
            consumed: 0,
            state: ReadState::BeforeFirst,
            current: None,
            prev_key1: 0,
            data_start,
            marked: None,
        })
    }

    fn fixed_width_records(&self) -> bool {
        self.sig.compr1 == Compression::None
            && self.sig.compr2 == Compression::None
            && !self.sig.delta_first
    }

    fn advance(&mut self) -> Result<Option<(u64, u64)>> {
        if self.consumed >= self.count {
            self.state = ReadState::Exhausted;
            self.current = None;
            return Ok(None);
        }
        self.stream.align_record()?;
        let raw1 = read_value(&mut self.stream, self.sig.compr1)?;
        let key1 = if self.sig.delta_first && self.consumed > 0 {
            self.prev_key1 + raw1
        } else {
            raw1
        };
        let key2 = read_value(&mut self.stream, self.sig.compr2)?;
        self.prev_key1 = key1;
        self.consumed += 1;
        self.state = ReadState::Positioned;
        self.current = Some((key1, key2));
        Ok(self.current)
    }

    /// Stream position of fixed-width record `i`, derived from the shared
    /// segment-roll rule: a record is placed at offset `o` only while
    /// `capacity - o >= RECORD_MARGIN`.
    fn record_position(&self, i: u32) -> Position {
        let capacity = self.stream.capacity();
        let per_full_segment = ((capacity - RECORD_MARGIN) / FIXED_RECORD + 1) as u32;

        let first_avail = if capacity - self.data_start.offset >= RECORD_MARGIN {
            ((capacity - RECORD_MARGIN - self.data_start.offset) / FIXED_RECORD + 1) as u32
        } else {
            0
        };

        if i < first_avail {
            Position::new(
                self.data_start.segment,
                self.data_start.offset + FIXED_RECORD * i as u64,
            )
        } else {
            let rem = i - first_avail;
            Position::new(
                self.data_start.segment + 1 + (rem / per_full_segment) as u16,
                FIXED_RECORD * (rem % per_full_segment) as u64,
            )
        }
    }

    fn key1_at(&mut self, i: u32) -> Result<u64> {
        self.stream.seek(self.record_position(i))?;
        self.stream.read_fixed(8)
    }

    /// Positions on record `i` by decoding it.
    fn load_record(&mut self, i: u32) -> Result<Option<(u64, u64)>> {
        self.stream.seek(self.record_position(i))?;
        self.consumed = i;
        self.advance()
    }

    /// Index of the last record sharing a segment with record `i`.
    fn last_record_in_segment(&self, i: u32) -> u32 {
        let capacity = self.stream.capacity();
        let per_full_segment = ((capacity - RECORD_MARGIN) / FIXED_RECORD + 1) as u32;
        let first_avail = if capacity - self.data_start.offset >= RECORD_MARGIN {
            ((capacity - RECORD_MARGIN - self.data_start.offset) / FIXED_RECORD + 1) as u32
        } else {
            0
        };
        if i < first_avail {
            first_avail - 1
        } else {
            first_avail + ((i - first_avail) / per_full_segment + 1) * per_full_segment - 1
        }
    }

    /// Lower-bound binary search for key1 >= c1 over the fixed 16-byte
    /// records in [lo, count). Probes the last record still in the current
    /// segment first, to decide whether the target can cross into the next
    /// segment at all.
    fn seek_fixed(&mut self, c1: u64, lo: u32) -> Result<Option<(u64, u64)>> {
        let mut lo = lo;
        let mut hi = self.count;
        if lo >= hi {
            self.consumed = self.count;
            self.state = ReadState::Exhausted;
            self.current = None;
            return Ok(None);
        }

        let last = self.last_record_in_segment(lo).min(hi - 1);
        if self.key1_at(last)? < c1 {
            // Everything left in this segment is below the target
            lo = last + 1;
        } else {
            hi = last + 1;
        }

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key1_at(mid)? < c1 {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo >= self.count {
            self.consumed = self.count;
            self.state = ReadState::Exhausted;
            self.current = None;
            return Ok(None);
        }
        self.load_record(lo)
    }
}

impl PairReader for RowReader {
    fn first(&mut self) -> Result<Option<(u64, u64)>> {
        self.stream.seek(self.data_start)?;
        self.consumed = 0;
        self.prev_key1 = 0;
        self.advance()
    }

    fn next_pair(&mut self) -> Result<Option<(u64, u64)>> {
        match self.state {
            ReadState::BeforeFirst => Err(invalid_before_first()),
            ReadState::Exhausted => Ok(None),
            ReadState::Positioned => self.advance(),
        }
    }

    fn move_to_closest_first_term(&mut self, c1: u64) -> Result<Option<(u64, u64)>> {
        if self.state == ReadState::BeforeFirst && self.first()?.is_none() {
            return Ok(None);
        }
        if self.state == ReadState::Exhausted {
            return Ok(None);
        }
        let (k1, _) = self.current.expect("positioned cursor has a record");
        if k1 >= c1 {
            return Ok(self.current);
        }
        if self.fixed_width_records() {
            return self.seek_fixed(c1, self.consumed);
        }
        while let Some((k1, _)) = self.advance()? {
            if k1 >= c1 {
                return Ok(self.current);
            }
        }
        Ok(None)
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
            if self.advance()?.is_none() {
                return Ok(None);
            }
        }
    }

    fn mark(&mut self) {
        self.marked = Some(Snapshot {
            stream: self.stream.clone(),
            state: self.state,
            consumed: self.consumed,
            current: self.current,
            prev_key1: self.prev_key1,
        });
    }

    fn reset(&mut self) -> Result<()> {
        let snap = self
            .marked
            .clone()
            .ok_or_else(|| crate::error::Error::InvalidState("reset without mark".to_string()))?;
        self.stream = snap.stream;
        self.state = snap.state;
        self.consumed = snap.consumed;
        self.current = snap.current;
        self.prev_key1 = snap.prev_key1;
        Ok(())
    }

    fn current(&self) -> Option<(u64, u64)> {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use tempfile::tempdir;

    fn setup(max_segment_size: u64) -> (tempfile::TempDir, Arc<Mutex<SegmentManager>>) {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = StoreConfig::new(dir.path())
            .max_segment_size(max_segment_size)
            .max_segments(256);
        let mgr = SegmentManager::create(&config).expect("Failed to create manager");
        (dir, Arc::new(Mutex::new(mgr)))
    }

    fn write_block(
        manager: &Arc<Mutex<SegmentManager>>,
        sig: Signature,
        pairs: &[(u64, u64)],
    ) -> Position {
        let mut writer = RowWriter::new(Arc::clone(manager), sig);
        writer.start_append().expect("Failed to start block");
        for &(k1, k2) in pairs {
            writer.append(k1, k2).expect("Failed to append");
        }
        writer.stop_append().expect("Failed to close block");
        let start = writer.start_position().expect("Missing block start");
        manager.lock().unwrap().seal().expect("Failed to seal");
        start
    }

    fn open_reader(
        manager: &Arc<Mutex<SegmentManager>>,
        sig: Signature,
        start: Position,
    ) -> RowReader {
        let session = manager
            .lock()
            .unwrap()
            .new_session()
            .expect("Failed to open session");
        RowReader::new(Arc::clone(manager), session, sig, start).expect("Failed to open reader")
    }

    fn plain_sig() -> Signature {
        Signature::new(
            super::super::Layout::Row,
            false,
            Compression::None,
            Compression::None,
            false,
        )
    }

    fn compressed_sig() -> Signature {
        Signature::new(
            super::super::Layout::Row,
            true,
            Compression::Var1,
            Compression::Var2,
            false,
        )
    }

    #[test]
    fn test_seek_then_scan_plain_rows() {
        let (_dir, manager) = setup(1 << 20);
        let pairs = [(1, 10), (1, 20), (3, 5), (3, 6), (3, 7)];
        let start = write_block(&manager, plain_sig(), &pairs);
        let mut reader = open_reader(&manager, plain_sig(), start);

        assert_eq!(reader.first().expect("Failed to read"), Some((1, 10)));
        assert_eq!(
            reader
                .move_to_closest_first_term(3)
                .expect("Failed to seek"),
            Some((3, 5))
        );
        assert_eq!(
            reader
                .move_to_closest_second_term(3, 6)
                .expect("Failed to seek"),
            Some((3, 6))
        );
        assert_eq!(reader.next_pair().expect("Failed to read"), Some((3, 7)));
        assert_eq!(reader.next_pair().expect("Failed to read"), None);
        assert_eq!(reader.next_pair().expect("Failed to read"), None);
    }

    #[test]
    fn test_roundtrip_compressed_delta() {
        let (_dir, manager) = setup(1 << 20);
        let pairs: Vec<(u64, u64)> = (0..500)
            .map(|i| (1000 + (i / 3) * 17, (i % 3) * 100_000 + i))
            .collect();
        let start = write_block(&manager, compressed_sig(), &pairs);
        let mut reader = open_reader(&manager, compressed_sig(), start);

        let mut got = Vec::new();
        let mut next = reader.first().expect("Failed to read");
        while let Some(pair) = next {
            got.push(pair);
            next = reader.next_pair().expect("Failed to read");
        }
        assert_eq!(got, pairs);
    }

    #[test]
    fn test_linear_seek_compressed() {
        let (_dir, manager) = setup(1 << 20);
        let pairs: Vec<(u64, u64)> = (0..100).map(|i| (i * 2, i)).collect();
        let start = write_block(&manager, compressed_sig(), &pairs);
        let mut reader = open_reader(&manager, compressed_sig(), start);

        assert_eq!(
            reader
                .move_to_closest_first_term(51)
                .expect("Failed to seek"),
            Some((52, 26))
        );
        // Forward-only: seeking backwards stays put
        assert_eq!(
            reader
                .move_to_closest_first_term(10)
                .expect("Failed to seek"),
            Some((52, 26))
        );
        assert_eq!(
            reader
                .move_to_closest_first_term(1000)
                .expect("Failed to seek"),
            None
        );
    }

    #[test]
    fn test_fixed_width_binary_search_across_segments() {
        // 128-byte segments force the block over several segment boundaries
        let (_dir, manager) = setup(128);
        let pairs: Vec<(u64, u64)> = (0..200).map(|i| (i * 3, i * 3 + 1)).collect();
        let start = write_block(&manager, plain_sig(), &pairs);
        assert!(manager.lock().unwrap().segment_count() > 1);

        let mut reader = open_reader(&manager, plain_sig(), start);
        assert_eq!(reader.first().expect("Failed to read"), Some((0, 1)));

        // Probe deep into a later segment
        assert_eq!(
            reader
                .move_to_closest_first_term(451)
                .expect("Failed to seek"),
            Some((453, 454))
        );
        // And a short hop within the same segment
        assert_eq!(
            reader
                .move_to_closest_first_term(460)
                .expect("Failed to seek"),
            Some((462, 463))
        );
        // Past the end
        assert_eq!(
            reader
                .move_to_closest_first_term(100_000)
                .expect("Failed to seek"),
            None
        );
    }

    #[test]
    fn test_mark_reset() {
        let (_dir, manager) = setup(1 << 20);
        let pairs = [(1, 1), (2, 2), (3, 3)];
        let start = write_block(&manager, plain_sig(), &pairs);
        let mut reader = open_reader(&manager, plain_sig(), start);

        reader.first().expect("Failed to read");
        reader.mark();
        assert_eq!(reader.next_pair().expect("Failed to read"), Some((2, 2)));
        assert_eq!(reader.next_pair().expect("Failed to read"), Some((3, 3)));
        reader.reset().expect("Failed to reset");
        assert_eq!(reader.next_pair().expect("Failed to read"), Some((2, 2)));
    }

    #[test]
    fn test_empty_block() {
        let (_dir, manager) = setup(1 << 20);
        let start = write_block(&manager, plain_sig(), &[]);
        let mut reader = open_reader(&manager, plain_sig(), start);
        assert_eq!(reader.first().expect("Failed to read"), None);
        assert_eq!(
            reader.move_to_closest_first_term(0).expect("Failed to seek"),
            None
        );
    }
}
