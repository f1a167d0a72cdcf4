use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::segment::segment::{segment_file_name, ReadableSegment, WritableSegment};
use crate::segment::Position;

/// Minimum free bytes a segment must offer before another item (record,
/// group header or value) is placed in it. Writers roll to a new segment
/// below this margin and readers apply the identical rule, so an encoded
/// item never spans a segment boundary.
pub const RECORD_MARGIN: u64 = 24;

struct SessionSlot {
    /// Segment currently pinned by this reader, if any.
    pinned: Option<u16>,
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub evictions: usize,
}

/// Owns every segment of one partition.
///
/// During bulk load all segments are writable and kept in memory; `seal`
/// flushes them to disk. Afterwards the manager acts as a bounded cache of
/// open read-only segments: at most `max_open_files` are resident, evicting
/// in open order while skipping segments pinned by an active session. If
/// every candidate is pinned the cache degrades by holding more segments
/// open rather than invalidating an in-use one.
pub struct SegmentManager {
    dir: PathBuf,
    max_segment_size: u64,
    max_segments: u16,
    max_open_files: usize,
    max_sessions: usize,

    /// Writable segments, present only before `seal`. Earlier segments stay
    /// patchable until then because a group header written near the end of
    /// one segment may be backpatched after the stream rolled into the next.
    writable: Vec<WritableSegment>,
    sealed: bool,
    segment_count: u16,

    open: HashMap<u16, ReadableSegment>,
    open_order: VecDeque<u16>,
    pins: HashMap<u16, usize>,
    sessions: Vec<Option<SessionSlot>>,
    stats: CacheStats,
}

impl SegmentManager {
    /// Creates a manager for a fresh partition.
    pub fn create(config: &StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        Ok(Self::init(config, 0, false))
    }

    /// Opens a manager over an already-sealed partition with
    /// `segment_count` segment files on disk.
    pub fn open(config: &StoreConfig, segment_count: u16) -> Result<Self> {
        Ok(Self::init(config, segment_count, true))
    }

    fn init(config: &StoreConfig, segment_count: u16, sealed: bool) -> Self {
        Self {
            dir: config.dir.clone(),
            max_segment_size: config.max_segment_size,
            max_segments: config.max_segments,
            max_open_files: config.max_open_files,
            max_sessions: config.max_sessions,
            writable: Vec::new(),
            sealed,
            segment_count,
            open: HashMap::new(),
            open_order: VecDeque::new(),
            pins: HashMap::new(),
            sessions: Vec::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn max_segment_size(&self) -> u64 {
        self.max_segment_size
    }

    pub fn segment_count(&self) -> u16 {
        self.segment_count
    }

    // ---- write path -------------------------------------------------------

    /// Creates the next segment, which becomes the append target.
    pub fn create_new_segment(&mut self) -> Result<u16> {
        if self.sealed {
            return Err(Error::InvalidState(
                "Cannot create segments in a sealed partition".to_string(),
            ));
        }
        if self.segment_count >= self.max_segments {
            return Err(Error::SegmentLimit(self.max_segments));
        }
        let id = self.segment_count;
        let path = self.dir.join(segment_file_name(id));
        self.writable.push(WritableSegment::new(path));
        self.segment_count += 1;
        tracing::debug!(segment = id, "Created segment");
        Ok(id)
    }

    fn current(&mut self) -> Result<(u16, &mut WritableSegment)> {
        if self.writable.is_empty() {
            self.create_new_segment()?;
        }
        let id = self.segment_count - 1;
        let seg = self
            .writable
            .last_mut()
            .expect("writable segment just ensured");
        Ok((id, seg))
    }

    /// Current end-of-stream position, rolling to a new segment first if
    /// fewer than `margin` bytes remain in the active one.
    pub fn ensure_room(&mut self, margin: u64) -> Result<Position> {
        let max = self.max_segment_size;
        let (id, seg) = self.current()?;
        if max - seg.len() < margin {
            let id = self.create_new_segment()?;
            return Ok(Position::new(id, 0));
        }
        Ok(Position::new(id, seg.len()))
    }

    /// Appends to the active segment. The caller has already called
    /// `ensure_room`; appends never roll on their own.
    pub fn append(&mut self, bytes: &[u8]) -> Result<Position> {
        let (id, seg) = self.current()?;
        let offset = seg.append(bytes);
        Ok(Position::new(id, offset))
    }

    /// Reserves `n` zero bytes for a later fixed-width backpatch.
    pub fn reserve(&mut self, n: usize) -> Result<Position> {
        self.append(&vec![0u8; n])
    }

    /// Backpatches previously reserved bytes, possibly in an earlier
    /// segment than the active one.
    pub fn patch(&mut self, pos: Position, bytes: &[u8]) -> Result<()> {
        if self.sealed {
            return Err(Error::InvalidState(
                "Cannot patch a sealed partition".to_string(),
            ));
        }
        let seg = self
            .writable
            .get_mut(pos.segment as usize)
            .ok_or_else(|| Error::InvalidOperation(format!("No writable segment {}", pos.segment)))?;
        seg.overwrite(pos.offset, bytes)
    }

    pub fn patch_byte(&mut self, pos: Position, value: u8) -> Result<()> {
        self.patch(pos, &[value])
    }

    pub fn size_of_segment(&self, id: u16) -> Result<u64> {
        if !self.sealed {
            return self
                .writable
                .get(id as usize)
                .map(|s| s.len())
                .ok_or_else(|| Error::InvalidOperation(format!("No segment {}", id)));
        }
        if id >= self.segment_count {
            return Err(Error::InvalidOperation(format!("No segment {}", id)));
        }
        let path = self.dir.join(segment_file_name(id));
        Ok(fs::metadata(path)?.len())
    }

    /// Flushes every writable segment to disk. The partition is read-only
    /// from here on.
    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        for seg in self.writable.drain(..) {
            seg.finalize()?;
        }
        self.sealed = true;
        tracing::info!(segments = self.segment_count, "Sealed partition");
        Ok(())
    }

    // ---- sessions ---------------------------------------------------------

    /// Allocates a reader session. Fatal for the caller when the pool is
    /// exhausted; an existing session must be closed first.
    pub fn new_session(&mut self) -> Result<usize> {
        for (id, slot) in self.sessions.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(SessionSlot { pinned: None });
                return Ok(id);
            }
        }
        if self.sessions.len() >= self.max_sessions {
            return Err(Error::SessionLimit(self.max_sessions));
        }
        self.sessions.push(Some(SessionSlot { pinned: None }));
        Ok(self.sessions.len() - 1)
    }

    pub fn close_session(&mut self, session: usize) -> Result<()> {
        let slot = self
            .sessions
            .get_mut(session)
            .and_then(Option::take)
            .ok_or(Error::InvalidSession(session))?;
        if let Some(seg) = slot.pinned {
            Self::unpin(&mut self.pins, seg);
        }
        Ok(())
    }

    fn unpin(pins: &mut HashMap<u16, usize>, segment: u16) {
        if let Some(count) = pins.get_mut(&segment) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&segment);
            }
        }
    }

    fn pin(&mut self, session: usize, segment: u16) -> Result<()> {
        let slot = self
            .sessions
            .get_mut(session)
            .and_then(Option::as_mut)
            .ok_or(Error::InvalidSession(session))?;
        if slot.pinned == Some(segment) {
            return Ok(());
        }
        if let Some(prev) = slot.pinned.take() {
            Self::unpin(&mut self.pins, prev);
        }
        slot.pinned = Some(segment);
        *self.pins.entry(segment).or_insert(0) += 1;
        Ok(())
    }

    // ---- read path --------------------------------------------------------

    /// Returns the contents of a segment from `offset` onward, pinning the
    /// segment for the session so the cache will not drop it mid-scan. The
    /// session's previous pin is released only once the fetch succeeds; a
    /// failed fetch leaves the session pinning what it already had.
    ///
    /// The returned buffer is the whole segment; the second element is the
    /// number of readable bytes past `offset`.
    pub fn get_buffer(
        &mut self,
        segment: u16,
        offset: u64,
        session: usize,
    ) -> Result<(Arc<[u8]>, u64)> {
        if !self.sealed {
            return Err(Error::InvalidState(
                "Cannot read before the partition is sealed".to_string(),
            ));
        }
        if segment >= self.segment_count {
            return Err(Error::InvalidOperation(format!("No segment {}", segment)));
        }

        if let Some(seg) = self.open.get(&segment) {
            self.stats.hits += 1;
            let data = seg.data();
            self.pin(session, segment)?;
            let available = data.len() as u64 - offset.min(data.len() as u64);
            return Ok((data, available));
        }

        self.stats.misses += 1;
        self.evict_if_needed();

        let path = self.dir.join(segment_file_name(segment));
        let seg = ReadableSegment::open(&path)?;
        let data = seg.data();
        self.open.insert(segment, seg);
        self.open_order.push_back(segment);
        self.pin(session, segment)?;
        let available = data.len() as u64 - offset.min(data.len() as u64);
        Ok((data, available))
    }

    /// Evicts the least-recently-opened unpinned segment when at capacity.
    /// When everything is pinned the cap is exceeded instead of forcing an
    /// in-use segment closed.
    fn evict_if_needed(&mut self) {
        if self.open.len() < self.max_open_files {
            return;
        }
        let victim = self
            .open_order
            .iter()
            .position(|id| !self.pins.contains_key(id));
        match victim {
            Some(idx) => {
                let id = self.open_order.remove(idx).expect("index in range");
                self.open.remove(&id);
                self.stats.evictions += 1;
                tracing::debug!(segment = id, "Evicted segment from cache");
            }
            None => {
                tracing::warn!(
                    open = self.open.len(),
                    "All open segments pinned; exceeding open-file cap"
                );
            }
        }
    }

    pub fn num_open(&self) -> usize {
        self.open.len()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

/// RAII handle over a reader session: closing happens when the owning
/// cursor is dropped, so abandoned scans cannot exhaust the session pool.
pub struct SessionGuard {
    manager: Arc<Mutex<SegmentManager>>,
    id: usize,
}

impl SessionGuard {
    pub fn new(manager: Arc<Mutex<SegmentManager>>) -> Result<Self> {
        let id = manager.lock()?.new_session()?;
        Ok(Self { manager, id })
    }

    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Ok(mut mgr) = self.manager.lock() {
            let _ = mgr.close_session(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_config(dir: &std::path::Path) -> StoreConfig {
        StoreConfig::new(dir)
            .max_segment_size(64)
            .max_segments(8)
            .max_open_files(2)
            .max_sessions(2)
    }

    fn sealed_manager(config: &StoreConfig, segments: usize) -> SegmentManager {
        let mut mgr = SegmentManager::create(config).expect("Failed to create manager");
        for i in 0..segments {
            mgr.create_new_segment().expect("Failed to create segment");
            mgr.append(format!("segment-{}", i).as_bytes())
                .expect("Failed to append");
        }
        mgr.seal().expect("Failed to seal");
        mgr
    }

    #[test]
    fn test_append_and_rollover() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = small_config(dir.path());
        let mut mgr = SegmentManager::create(&config).expect("Failed to create manager");

        let pos = mgr.ensure_room(RECORD_MARGIN).expect("Failed to ensure room");
        assert_eq!((pos.segment, pos.offset), (0, 0));
        mgr.append(&[1u8; 50]).expect("Failed to append");

        // 14 bytes left < margin, so the stream rolls to segment 1
        let pos = mgr.ensure_room(RECORD_MARGIN).expect("Failed to ensure room");
        assert_eq!((pos.segment, pos.offset), (1, 0));
    }

    #[test]
    fn test_segment_limit_is_fatal() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = small_config(dir.path()).max_segments(1);
        let mut mgr = SegmentManager::create(&config).expect("Failed to create manager");
        mgr.create_new_segment().expect("Failed to create segment");
        assert!(matches!(
            mgr.create_new_segment(),
            Err(Error::SegmentLimit(1))
        ));
    }

    #[test]
    fn test_backpatch_across_rollover() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = small_config(dir.path());
        let mut mgr = SegmentManager::create(&config).expect("Failed to create manager");

        mgr.ensure_room(RECORD_MARGIN).expect("Failed to ensure room");
        let patch_at = mgr.reserve(1).expect("Failed to reserve");
        mgr.append(&[7u8; 60]).expect("Failed to append");
        mgr.ensure_room(RECORD_MARGIN).expect("Failed to ensure room");
        mgr.append(b"next segment").expect("Failed to append");

        // The placeholder lives in segment 0, the stream is now in segment 1
        mgr.patch_byte(patch_at, 9).expect("Failed to patch");
        mgr.seal().expect("Failed to seal");

        let mut mgr = SegmentManager::open(&config, 2).expect("Failed to open");
        let session = mgr.new_session().expect("Failed to open session");
        let (data, _) = mgr.get_buffer(0, 0, session).expect("Failed to read");
        assert_eq!(data[0], 9);
    }

    #[test]
    fn test_session_limit_is_fatal() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = small_config(dir.path());
        let mut mgr = sealed_manager(&config, 1);

        let s1 = mgr.new_session().expect("Failed to open session");
        let _s2 = mgr.new_session().expect("Failed to open session");
        assert!(matches!(mgr.new_session(), Err(Error::SessionLimit(2))));

        // Closing a session frees a slot
        mgr.close_session(s1).expect("Failed to close session");
        mgr.new_session().expect("Failed to reopen session");
    }

    #[test]
    fn test_eviction_skips_pinned() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = small_config(dir.path());
        let mut mgr = sealed_manager(&config, 4);

        let s1 = mgr.new_session().expect("Failed to open session");
        let s2 = mgr.new_session().expect("Failed to open session");

        mgr.get_buffer(0, 0, s1).expect("Failed to read"); // pins 0
        mgr.get_buffer(1, 0, s2).expect("Failed to read"); // pins 1

        // Cache is full and both residents are still pinned when the miss
        // looks for a victim: the cap degrades
        mgr.get_buffer(2, 0, s1).expect("Failed to read"); // s1 moves pin to 2
        assert_eq!(mgr.stats().evictions, 0);
        assert_eq!(mgr.num_open(), 3);

        // Segment 0 is now unpinned and oldest: the next miss evicts it
        // while skipping the pinned segments 1 and 2
        mgr.get_buffer(3, 0, s2).expect("Failed to read"); // s2 moves pin to 3
        assert_eq!(mgr.stats().evictions, 1);
        assert_eq!(mgr.num_open(), 3);
        mgr.get_buffer(1, 0, s1).expect("Failed to read"); // still resident
        assert_eq!(mgr.stats().hits, 1);
    }

    #[test]
    fn test_failed_fetch_keeps_previous_pin() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = small_config(dir.path()).max_open_files(1);
        let mut mgr = sealed_manager(&config, 2);
        fs::remove_file(config.dir.join(segment_file_name(1))).expect("Failed to remove segment");

        let s1 = mgr.new_session().expect("Failed to open session");
        mgr.get_buffer(0, 0, s1).expect("Failed to read"); // pins 0
        assert!(mgr.get_buffer(1, 0, s1).is_err()); // file is gone

        // The failed fetch must not have moved the pin off segment 0, so a
        // rival miss cannot evict it and the re-read below is a cache hit
        let s2 = mgr.new_session().expect("Failed to open session");
        let _ = mgr.get_buffer(1, 0, s2); // miss, would evict 0 if unpinned
        mgr.get_buffer(0, 0, s1).expect("Failed to read");
        assert_eq!(mgr.stats().hits, 1);
        assert_eq!(mgr.stats().evictions, 0);
    }

    #[test]
    fn test_eviction_in_open_order() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = small_config(dir.path()).max_open_files(1);
        let mut mgr = sealed_manager(&config, 2);

        let s1 = mgr.new_session().expect("Failed to open session");
        mgr.get_buffer(0, 0, s1).expect("Failed to read");
        // Moving the session pin away lets segment 0 be evicted
        mgr.get_buffer(1, 0, s1).expect("Failed to read");
        assert_eq!(mgr.stats().evictions, 1);
        assert_eq!(mgr.num_open(), 1);
    }

    #[test]
    fn test_buffer_survives_eviction() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = small_config(dir.path()).max_open_files(1);
        let mut mgr = sealed_manager(&config, 2);

        let s1 = mgr.new_session().expect("Failed to open session");
        let (data, len) = mgr.get_buffer(0, 0, s1).expect("Failed to read");
        mgr.get_buffer(1, 0, s1).expect("Failed to read"); // evicts 0
        assert_eq!(&data[..len as usize], b"segment-0");
    }

    #[test]
    fn test_read_before_seal_fails() {
        let dir = tempdir().expect("Failed to create temp dir");
        let config = small_config(dir.path());
        let mut mgr = SegmentManager::create(&config).expect("Failed to create manager");
        mgr.create_new_segment().expect("Failed to create segment");
        let session = mgr.new_session().expect("Failed to open session");
        assert!(mgr.get_buffer(0, 0, session).is_err());
    }
}
