//! Delta-Cluster layout: records grouped by key1. Each group stores key1
//! once (optionally delta-encoded against the previous group) followed by a
//! one-byte header and the group's key2 values, delta-encoded within the
//! group.
//!
//! The header byte is reserved up front and backpatched when the group
//! closes: a value of 1..=255 is the byte count of the encoded key2 data
//! ("small group" mode), 0 marks a group whose encoded data ran past 255
//! bytes. Such a group switches irrevocably to indexed mode: it ends with a
//! 0 terminator and carries a sparse checkpoint sub-index with one entry
//! every `additional_index_size` values, so second-term seeks decode a
//! bounded run instead of the whole group.
//!
//! In-group gaps are stored biased by one (a duplicate pair encodes as 1),
//! so an encoded value of 0 is unambiguously the terminator.

use std::sync::{Arc, Mutex};

use crate::encoding;
use crate::error::{Error, Result};
use crate::index::FileIndex;
use crate::layout::{
    encoded_len, invalid_before_first, read_value, write_value, PairReader, PairWriter, ReadState,
    Signature, WriteState,
};
use crate::segment::{Position, SegmentManager, StreamReader, StreamWriter};

const GROUP_COUNT_FIELD: usize = 4;
const SMALL_GROUP_MAX_BYTES: u64 = 255;

struct OpenGroup {
    key1: u64,
    header_pos: Position,
    bytes: u64,
    values: u64,
    prev_key2: u64,
    /// Checkpoint candidates, committed only if the group goes long.
    pending: Vec<(i64, Position)>,
}

pub struct ClusterWriter {
    stream: StreamWriter,
    sig: Signature,
    state: WriteState,
    start: Option<Position>,
    n_groups: u32,
    prev_group_key: u64,
    group: Option<OpenGroup>,
    index: FileIndex,
    first_index_size: usize,
    additional_index_size: usize,
}

impl ClusterWriter {
    pub fn new(
        manager: Arc<Mutex<SegmentManager>>,
        sig: Signature,
        first_index_size: usize,
        additional_index_size: usize,
    ) -> Self {
        Self {
            stream: StreamWriter::new(manager),
            sig,
            state: WriteState::Idle,
            start: None,
            n_groups: 0,
            prev_group_key: 0,
            group: None,
            index: FileIndex::new(),
            first_index_size,
            additional_index_size,
        }
    }

    pub fn start_position(&self) -> Option<Position> {
        self.start
    }

    /// Hands the block's sparse index (checkpoints plus per-group
    /// sub-indices) to the caller after `stop_append`.
    pub fn take_index(&mut self) -> FileIndex {
        std::mem::take(&mut self.index)
    }

    fn open_group(&mut self, key1: u64) -> Result<()> {
        self.stream.align_record()?;

        let field = if self.sig.delta_first && self.n_groups > 0 {
            key1 - self.prev_group_key
        } else {
            key1
        };
        write_value(&mut self.stream, field, self.sig.compr1)?;

        // Checkpoints point past the key1 field so a reader landing on one
        // knows the group key without the previous group's delta base.
        if self.n_groups as usize % self.first_index_size == 0 {
            let pos = self.stream.position()?;
            self.index.add(key1 as i64, pos)?;
        }

        let header_pos = self.stream.reserve(1)?;
        self.group = Some(OpenGroup {
            key1,
            header_pos,
            bytes: 0,
            values: 0,
            prev_key2: 0,
            pending: Vec::new(),
        });
        self.prev_group_key = key1;
        self.n_groups += 1;
        Ok(())
    }

    fn close_group(&mut self) -> Result<()> {
        let group = match self.group.take() {
            Some(g) => g,
            None => return Ok(()),
        };
        if group.bytes <= SMALL_GROUP_MAX_BYTES {
            self.stream.patch_byte(group.header_pos, group.bytes as u8)?;
        } else {
            // Indexed mode: 0-marker header, 0 terminator, and the pending
            // checkpoints become the group's sub-index.
            self.stream.patch_byte(group.header_pos, 0)?;
            self.stream.align_record()?;
            write_value(&mut self.stream, 0, self.sig.compr2)?;
            if !group.pending.is_empty() {
                let sub = self.index.additional_mut(group.key1);
                for (key2, pos) in group.pending {
                    sub.add(key2, pos)?;
                }
            }
            tracing::debug!(
                key1 = group.key1,
                bytes = group.bytes,
                values = group.values,
                "Closed indexed group"
            );
        }
        Ok(())
    }
}

impl PairWriter for ClusterWriter {
    fn start_append(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, WriteState::Idle);
        self.stream.align_record()?;
        self.start = Some(self.stream.reserve(GROUP_COUNT_FIELD)?);
        self.state = WriteState::Appending;
        Ok(())
    }

    fn append(&mut self, key1: u64, key2: u64) -> Result<()> {
        debug_assert_eq!(self.state, WriteState::Appending);
        if self.group.as_ref().map(|g| g.key1) != Some(key1) {
            self.close_group()?;
            self.open_group(key1)?;
        }

        self.stream.align_record()?;
        let group = self.group.as_mut().expect("group just opened");
        // First value absolute, the rest as gap + 1 (0 is the terminator)
        let field = if group.values == 0 {
            key2
        } else {
            key2 - group.prev_key2 + 1
        };
        write_value(&mut self.stream, field, self.sig.compr2)?;

        group.bytes += encoded_len(field, self.sig.compr2);
        group.values += 1;
        group.prev_key2 = key2;
        if group.values as usize % self.additional_index_size == 0 {
            let pos = self.stream.position()?;
            group.pending.push((key2 as i64, pos));
        }
        Ok(())
    }

    fn stop_append(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, WriteState::Appending);
        self.close_group()?;
        let start = self.start.expect("start set in start_append");
        let mut buf = Vec::with_capacity(GROUP_COUNT_FIELD);
        encoding::write_fixed(&mut buf, self.n_groups as u64, GROUP_COUNT_FIELD);
        self.stream.patch(start, &buf)?;
        self.state = WriteState::Closed;
        Ok(())
    }
}

/// Counters a reader accumulates while decoding; tests use them to verify
/// that checkpointed seeks do bounded work.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadStats {
    pub values_decoded: usize,
}

#[derive(Clone)]
struct ReadGroup {
    key1: u64,
    long: bool,
    /// Byte budget of encoded key2 data, small mode only.
    budget: u64,
    consumed: u64,
    values: u64,
    prev_key2: u64,
}

#[derive(Clone)]
struct Snapshot {
    stream: StreamReader,
    state: ReadState,
    current: Option<(u64, u64)>,
    groups_read: u32,
    prev_group_key: u64,
    group: Option<ReadGroup>,
}

pub struct ClusterReader {
    stream: StreamReader,
    sig: Signature,
    index: Arc<FileIndex>,
    first_index_size: usize,
    additional_index_size: usize,
    n_groups: u32,
    groups_read: u32,
    state: ReadState,
    current: Option<(u64, u64)>,
    prev_group_key: u64,
    group: Option<ReadGroup>,
    data_start: Position,
    index_hint: Option<usize>,
    stats: ReadStats,
    marked: Option<Snapshot>,
}

impl ClusterReader {
    pub fn new(
        manager: Arc<Mutex<SegmentManager>>,
        session: usize,
        sig: Signature,
        start: Position,
        index: Arc<FileIndex>,
        first_index_size: usize,
        additional_index_size: usize,
    ) -> Result<Self> {
        let mut stream = StreamReader::new(manager, session, start)?;
        let n_groups = stream.read_fixed(GROUP_COUNT_FIELD)? as u32;
        let data_start = stream.position();
        Ok(Self {
            stream,
            sig,
            index,
            first_index_size,
            additional_index_size,
            n_groups,
            groups_read: 0,
            state: ReadState::BeforeFirst,
            current: None,
            prev_group_key: 0,
            group: None,
            data_start,
            index_hint: None,
            stats: ReadStats::default(),
            marked: None,
        })
    }

    pub fn stats(&self) -> ReadStats {
        self.stats
    }

    /// Reads the next group header at the cursor. Returns false at the end
    /// of the block.
    fn open_group(&mut self) -> Result<bool> {
        if self.groups_read >= self.n_groups {
            self.group = None;
            return Ok(false);
        }
        self.stream.align_record()?;
        let raw = read_value(&mut self.stream, self.sig.compr1)?;
        let key1 = if self.sig.delta_first && self.groups_read > 0 {
            self.prev_group_key + raw
        } else {
            raw
        };
        let header = self.stream.read_u8()?;
        self.group = Some(ReadGroup {
            key1,
            long: header == 0,
            budget: header as u64,
            consumed: 0,
            values: 0,
            prev_key2: 0,
        });
        self.prev_group_key = key1;
        self.groups_read += 1;
        Ok(true)
    }

    /// Decodes the next key2 in the open group. Returns None when the group
    /// is finished (budget spent, or terminator seen in long mode).
    fn read_group_value(&mut self) -> Result<Option<u64>> {
        let sig = self.sig;
        let group = self.group.as_mut().expect("group open");
        if !group.long && group.consumed >= group.budget {
            return Ok(None);
        }
        self.stream.align_record()?;
        let raw = read_value(&mut self.stream, sig.compr2)?;
        if group.long && group.values > 0 && raw == 0 {
            return Ok(None); // terminator
        }
        let key2 = if group.values == 0 {
            raw
        } else {
            group.prev_key2 + raw - 1
        };
        group.consumed += encoded_len(raw, sig.compr2);
        group.values += 1;
        group.prev_key2 = key2;
        self.stats.values_decoded += 1;
        Ok(Some(key2))
    }

    fn advance(&mut self) -> Result<Option<(u64, u64)>> {
        loop {
            if self.group.is_some() {
                if let Some(key2) = self.read_group_value()? {
                    let key1 = self.group.as_ref().expect("group open").key1;
                    self.state = ReadState::Positioned;
                    self.current = Some((key1, key2));
                    return Ok(self.current);
                }
            }
            if !self.open_group()? {
                self.state = ReadState::Exhausted;
                self.current = None;
                return Ok(None);
            }
        }
    }

    /// Jumps to block checkpoint `idx`, which by the writer's cadence is
    /// the start of group `idx * first_index_size`.
    fn jump_to_checkpoint(&mut self, idx: usize) -> Result<()> {
        let entry = *self.index.get(idx).expect("checkpoint index in range");
        self.stream
            .seek(Position::new(entry.segment, entry.offset))?;
        let header = self.stream.read_u8()?;
        self.group = Some(ReadGroup {
            key1: entry.key as u64,
            long: header == 0,
            budget: header as u64,
            consumed: 0,
            values: 0,
            prev_key2: 0,
        });
        self.prev_group_key = entry.key as u64;
        self.groups_read = (idx * self.first_index_size) as u32 + 1;
        Ok(())
    }

    /// Skips the remainder of the open group and positions on the first
    /// record of the next one.
    fn skip_group(&mut self) -> Result<Option<(u64, u64)>> {
        while self.read_group_value()?.is_some() {}
        self.group = None;
        self.advance()
    }
}

impl PairReader for ClusterReader {
    fn first(&mut self) -> Result<Option<(u64, u64)>> {
        self.stream.seek(self.data_start)?;
        self.groups_read = 0;
        self.prev_group_key = 0;
        self.group = None;
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
        let (cur_key1, _) = self.current.expect("positioned cursor has a record");
        if cur_key1 >= c1 {
            return Ok(self.current);
        }

        // A checkpoint strictly past the current group bounds the scan.
        if let Some(idx) = self.index.find_floor(c1 as i64, self.index_hint) {
            self.index_hint = Some(idx);
            let entry = self.index.get(idx).expect("floor index in range");
            if (entry.key as u64) > cur_key1 {
                self.jump_to_checkpoint(idx)?;
                if self.advance()?.is_none() {
                    return Ok(None);
                }
            }
        }

        loop {
            let (k1, _) = match self.current {
                Some(pair) => pair,
                None => return Ok(None),
            };
            if k1 >= c1 {
                return Ok(self.current);
            }
            if self.skip_group()?.is_none() {
                return Ok(None);
            }
        }
    }

    fn move_to_closest_second_term(&mut self, c1: u64, c2: u64) -> Result<Option<(u64, u64)>> {
        let group = match &self.group {
            Some(g) => g.clone(),
            None => return Ok(None),
        };
        if let Some((k1, k2)) = self.current {
            if k1 > c1 || (k1 == c1 && k2 >= c2) {
                return Ok(self.current);
            }
        }

        // Long groups carry a sub-index bounding the in-group scan.
        if group.long && group.key1 == c1 {
            if let Some(sub) = self.index.additional(c1) {
                if let Some(idx) = sub.find_floor(c2 as i64, None) {
                    let entry = *sub.get(idx).expect("floor index in range");
                    if (entry.key as u64) > group.prev_key2 {
                        self.stream
                            .seek(Position::new(entry.segment, entry.offset))?;
                        let g = self.group.as_mut().expect("group open");
                        g.prev_key2 = entry.key as u64;
                        g.values = (idx + 1) as u64 * self.additional_index_size as u64;
                        if (entry.key as u64) >= c2 {
                            self.current = Some((c1, entry.key as u64));
                            return Ok(self.current);
                        }
                    }
                }
            }
        }

        loop {
            if self.advance()?.is_none() {
                return Ok(None);
            }
            let (k1, k2) = self.current.expect("advance returned a record");
            if k1 > c1 || (k1 == c1 && k2 >= c2) {
                return Ok(self.current);
            }
        }
    }

    fn mark(&mut self) {
        self.marked = Some(Snapshot {
            stream: self.stream.clone(),
            state: self.state,
            current: self.current,
            groups_read: self.groups_read,
            prev_group_key: self.prev_group_key,
            group: self.group.clone(),
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
        self.groups_read = snap.groups_read;
        self.prev_group_key = snap.prev_group_key;
        self.group = snap.group;
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
    use crate::layout::{Compression, Layout};
    use tempfile::tempdir;

    fn setup(max_segment_size: u64) -> (tempfile::TempDir, Arc<Mutex<SegmentManager>>) {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = StoreConfig::new(dir.path())
            .max_segment_size(max_segment_size)
            .max_segments(256);
        let mgr = SegmentManager::create(&config).expect("Failed to create manager");
        (dir, Arc::new(Mutex::new(mgr)))
    }

    fn sig(compr2: Compression) -> Signature {
        Signature::new(Layout::DeltaCluster, true, Compression::Var1, compr2, false)
    }

    fn write_block(
        manager: &Arc<Mutex<SegmentManager>>,
        sig: Signature,
        pairs: &[(u64, u64)],
        first_index_size: usize,
        additional_index_size: usize,
    ) -> (Position, Arc<FileIndex>) {
        let mut writer = ClusterWriter::new(
            Arc::clone(manager),
            sig,
            first_index_size,
            additional_index_size,
        );
        writer.start_append().expect("Failed to start block");
        for &(k1, k2) in pairs {
            writer.append(k1, k2).expect("Failed to append");
        }
        writer.stop_append().expect("Failed to close block");
        let start = writer.start_position().expect("Missing block start");
        let index = Arc::new(writer.take_index());
        manager.lock().unwrap().seal().expect("Failed to seal");
        (start, index)
    }

    fn open_reader(
        manager: &Arc<Mutex<SegmentManager>>,
        sig: Signature,
        start: Position,
        index: Arc<FileIndex>,
        first_index_size: usize,
        additional_index_size: usize,
    ) -> ClusterReader {
        let session = manager
            .lock()
            .unwrap()
            .new_session()
            .expect("Failed to open session");
        ClusterReader::new(
            Arc::clone(manager),
            session,
            sig,
            start,
            index,
            first_index_size,
            additional_index_size,
        )
        .expect("Failed to open reader")
    }

    fn small_groups() -> Vec<(u64, u64)> {
        vec![(1, 10), (1, 20), (3, 5), (3, 6), (3, 7), (9, 1)]
    }

    #[test]
    fn test_roundtrip_small_groups() {
        let (_dir, manager) = setup(1 << 20);
        let s = sig(Compression::Var1);
        let (start, index) = write_block(&manager, s, &small_groups(), 512, 256);
        let mut reader = open_reader(&manager, s, start, index, 512, 256);

        let mut got = Vec::new();
        let mut next = reader.first().expect("Failed to read");
        while let Some(pair) = next {
            got.push(pair);
            next = reader.next_pair().expect("Failed to read");
        }
        assert_eq!(got, small_groups());
    }

    #[test]
    fn test_seek_first_term() {
        let (_dir, manager) = setup(1 << 20);
        let s = sig(Compression::Var1);
        let pairs: Vec<(u64, u64)> = (0..100).flat_map(|g| {
            let g = g * 5;
            vec![(g, 1), (g, 2), (g, 3)]
        })
        .collect();
        let (start, index) = write_block(&manager, s, &pairs, 8, 256);
        assert!(index.len() > 1);

        let mut reader = open_reader(&manager, s, start, index, 8, 256);
        assert_eq!(
            reader
                .move_to_closest_first_term(303)
                .expect("Failed to seek"),
            Some((305, 1))
        );
        // Forward-only
        assert_eq!(
            reader.move_to_closest_first_term(4).expect("Failed to seek"),
            Some((305, 1))
        );
        assert_eq!(
            reader
                .move_to_closest_first_term(496)
                .expect("Failed to seek"),
            None
        );
    }

    #[test]
    fn test_group_mode_transition() {
        let (_dir, manager) = setup(1 << 20);
        let s = sig(Compression::Var1);
        // 300 values under one key1 forces well past 255 encoded bytes
        let mut pairs: Vec<(u64, u64)> = (0..300).map(|i| (7, i * 3)).collect();
        pairs.push((8, 1)); // a trailing small group
        let (start, index) = write_block(&manager, s, &pairs, 512, 256);

        // The long group grew a sub-index with the 256-value cadence
        let sub = index.additional(7).expect("Missing sub-index");
        assert_eq!(sub.len(), 1);

        let mut reader = open_reader(&manager, s, start, Arc::clone(&index), 512, 256);
        let mut got = Vec::new();
        let mut next = reader.first().expect("Failed to read");
        while let Some(pair) = next {
            got.push(pair);
            next = reader.next_pair().expect("Failed to read");
        }
        assert_eq!(got, pairs);
    }

    #[test]
    fn test_small_group_never_overflows() {
        let (_dir, manager) = setup(1 << 20);
        let s = sig(Compression::None); // 8 bytes per value
        // 32 values * 8 bytes = 256 bytes > 255: must go long
        let pairs: Vec<(u64, u64)> = (0..32).map(|i| (1, i * 2)).collect();
        let (start, index) = write_block(&manager, s, &pairs, 512, 256);
        assert!(index.additional(1).is_none()); // no checkpoint hit, but...

        let mut reader = open_reader(&manager, s, start, index, 512, 256);
        let mut got = Vec::new();
        let mut next = reader.first().expect("Failed to read");
        while let Some(pair) = next {
            got.push(pair);
            next = reader.next_pair().expect("Failed to read");
        }
        // ...the round trip only works if the header was patched to 0
        assert_eq!(got, pairs);
    }

    #[test]
    fn test_second_term_seek_uses_checkpoints() {
        let (_dir, manager) = setup(1 << 20);
        let s = sig(Compression::Var1);
        let pairs: Vec<(u64, u64)> = (0..300).map(|i| (7, i * 3)).collect();
        // Tight cadence: checkpoints every 64 values
        let (start, index) = write_block(&manager, s, &pairs, 512, 64);
        assert_eq!(index.additional(7).expect("Missing sub-index").len(), 4);

        let mut reader = open_reader(&manager, s, start, index, 512, 64);
        reader.first().expect("Failed to read");
        // Value 250 of the group: target key2 = 750
        assert_eq!(
            reader
                .move_to_closest_second_term(7, 750)
                .expect("Failed to seek"),
            Some((7, 750))
        );
        // The checkpoint at value 256 is past the target; the one at value
        // 192 bounds the scan to at most 64 decodes (plus the first record).
        assert!(
            reader.stats().values_decoded <= 70,
            "Seek decoded {} values instead of using the checkpoint",
            reader.stats().values_decoded
        );
    }

    #[test]
    fn test_second_term_seek_past_group_end() {
        let (_dir, manager) = setup(1 << 20);
        let s = sig(Compression::Var1);
        let (start, index) = write_block(&manager, s, &small_groups(), 512, 256);
        let mut reader = open_reader(&manager, s, start, index, 512, 256);

        reader.first().expect("Failed to read");
        reader.move_to_closest_first_term(3).expect("Failed to seek");
        // No key2 >= 100 in group 3: lands on the next group
        assert_eq!(
            reader
                .move_to_closest_second_term(3, 100)
                .expect("Failed to seek"),
            Some((9, 1))
        );
    }

    #[test]
    fn test_mark_reset() {
        let (_dir, manager) = setup(1 << 20);
        let s = sig(Compression::Var1);
        let (start, index) = write_block(&manager, s, &small_groups(), 512, 256);
        let mut reader = open_reader(&manager, s, start, index, 512, 256);

        reader.first().expect("Failed to read");
        reader.next_pair().expect("Failed to read");
        reader.mark();
        assert_eq!(reader.next_pair().expect("Failed to read"), Some((3, 5)));
        reader.reset().expect("Failed to reset");
        assert_eq!(reader.next_pair().expect("Failed to read"), Some((3, 5)));
    }

    #[test]
    fn test_duplicate_pairs_in_long_group() {
        let (_dir, manager) = setup(1 << 20);
        let s = sig(Compression::Var1);
        // Well past 255 encoded bytes, with one repeated pair in the middle
        let mut pairs: Vec<(u64, u64)> = (0..300).map(|i| (7, i * 3)).collect();
        pairs.insert(51, (7, 150));
        let (start, index) = write_block(&manager, s, &pairs, 512, 256);

        let mut reader = open_reader(&manager, s, start, index, 512, 256);
        let mut got = Vec::new();
        let mut next = reader.first().expect("Failed to read");
        while let Some(pair) = next {
            got.push(pair);
            next = reader.next_pair().expect("Failed to read");
        }
        assert_eq!(got.len(), 301);
        assert_eq!(got, pairs);
    }

    #[test]
    fn test_block_spanning_segments() {
        let (_dir, manager) = setup(256);
        let s = sig(Compression::Var1);
        // ~4 bytes per group: 200 groups overflow several 256-byte segments
        let pairs: Vec<(u64, u64)> = (0..200).flat_map(|g| vec![(g * 2, 10), (g * 2, 20)]).collect();
        let (start, index) = write_block(&manager, s, &pairs, 16, 256);
        assert!(manager.lock().unwrap().segment_count() > 1);

        let mut reader = open_reader(&manager, s, start, index, 16, 256);
        let mut got = Vec::new();
        let mut next = reader.first().expect("Failed to read");
        while let Some(pair) = next {
            got.push(pair);
            next = reader.next_pair().expect("Failed to read");
        }
        assert_eq!(got, pairs);
    }
}
