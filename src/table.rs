//! Table storage façade: one logical pair table built from many blocks.
//!
//! Bulk load buffers appended pairs and commits a block whenever the batch
//! reaches `block_size` and the incoming key1 changes, so a group is never
//! split across blocks. Each committed block gets its layout picked by the
//! strategy selector and its coordinates (first key1, start position, one
//! signature byte) recorded for the coordinate index. `stop_append` seals
//! the partition and persists the coordinates together with the sparse
//! block indices, checksummed.
//!
//! After sealing, readers open cursors over the whole table or a single
//! key; each cursor owns a cache session so its working block cannot be
//! evicted mid-scan.

use std::collections::BTreeMap;
use std::fs::File;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::index::{read_record, write_record, FileIndex};
use crate::layout::cluster::{ClusterReader, ClusterWriter};
use crate::layout::column::{ColumnReader, ColumnWriter};
use crate::layout::indexed::{ColumnId, IndexedReader, IndexedWriter};
use crate::layout::row::{RowReader, RowWriter};
use crate::layout::strategy::determine_strategy;
use crate::layout::{Layout, PairReader, PairWriter, ScanCursor, Signature, WriteState};
use crate::segment::{Position, SegmentManager, SessionGuard};

const META_FILE: &str = "table.meta";

/// Storage coordinates of one committed block, as handed to the upper
/// coordinate index.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlockCoord {
    pub first_key1: u64,
    pub segment: u16,
    pub offset: u64,
    pub signature: u8,
}

#[derive(Serialize, Deserialize)]
struct TableMeta {
    segment_count: u16,
    blocks: Vec<BlockCoord>,
    indexes: BTreeMap<(u16, u64), FileIndex>,
}

/// Writer for one block, dispatched on the signature's layout.
pub enum BlockWriter {
    Row(RowWriter),
    Cluster(ClusterWriter),
    Column(ColumnWriter),
    Indexed(IndexedWriter),
}

impl BlockWriter {
    pub fn start_position(&self) -> Option<Position> {
        match self {
            BlockWriter::Row(w) => w.start_position(),
            BlockWriter::Cluster(w) => w.start_position(),
            BlockWriter::Column(w) => w.start_position(),
            BlockWriter::Indexed(w) => w.start_position(),
        }
    }

    /// The block's sparse index, for layouts that build one.
    pub fn take_index(&mut self) -> Option<FileIndex> {
        match self {
            BlockWriter::Cluster(w) => Some(w.take_index()),
            _ => None,
        }
    }
}

impl PairWriter for BlockWriter {
    fn start_append(&mut self) -> Result<()> {
        match self {
            BlockWriter::Row(w) => w.start_append(),
            BlockWriter::Cluster(w) => w.start_append(),
            BlockWriter::Column(w) => w.start_append(),
            BlockWriter::Indexed(w) => w.start_append(),
        }
    }

    fn append(&mut self, key1: u64, key2: u64) -> Result<()> {
        match self {
            BlockWriter::Row(w) => w.append(key1, key2),
            BlockWriter::Cluster(w) => w.append(key1, key2),
            BlockWriter::Column(w) => w.append(key1, key2),
            BlockWriter::Indexed(w) => w.append(key1, key2),
        }
    }

    fn stop_append(&mut self) -> Result<()> {
        match self {
            BlockWriter::Row(w) => w.stop_append(),
            BlockWriter::Cluster(w) => w.stop_append(),
            BlockWriter::Column(w) => w.stop_append(),
            BlockWriter::Indexed(w) => w.stop_append(),
        }
    }
}

/// Cursor over one block, dispatched on the signature's layout.
pub enum BlockReader {
    Row(RowReader),
    Cluster(ClusterReader),
    Column(ColumnReader),
    Indexed(IndexedReader),
}

impl BlockReader {
    /// Anti-join between two blocks. Only Indexed-Column blocks support
    /// it; every other pairing is a caller error.
    pub fn column_not_in(
        &mut self,
        col: ColumnId,
        other: &mut BlockReader,
        other_col: ColumnId,
        out: &mut dyn crate::layout::SequenceWriter,
    ) -> Result<()> {
        match (self, other) {
            (BlockReader::Indexed(a), BlockReader::Indexed(b)) => {
                a.column_not_in(col, b, other_col, out)
            }
            _ => Err(Error::Unsupported(
                "columnNotIn on a non-indexed-column layout",
            )),
        }
    }
}

impl PairReader for BlockReader {
    fn first(&mut self) -> Result<Option<(u64, u64)>> {
        match self {
            BlockReader::Row(r) => r.first(),
            BlockReader::Cluster(r) => r.first(),
            BlockReader::Column(r) => r.first(),
            BlockReader::Indexed(r) => r.first(),
        }
    }

    fn next_pair(&mut self) -> Result<Option<(u64, u64)>> {
        match self {
            BlockReader::Row(r) => r.next_pair(),
            BlockReader::Cluster(r) => r.next_pair(),
            BlockReader::Column(r) => r.next_pair(),
            BlockReader::Indexed(r) => r.next_pair(),
        }
    }

    fn move_to_closest_first_term(&mut self, c1: u64) -> Result<Option<(u64, u64)>> {
        match self {
            BlockReader::Row(r) => r.move_to_closest_first_term(c1),
            BlockReader::Cluster(r) => r.move_to_closest_first_term(c1),
            BlockReader::Column(r) => r.move_to_closest_first_term(c1),
            BlockReader::Indexed(r) => r.move_to_closest_first_term(c1),
        }
    }

    fn move_to_closest_second_term(&mut self, c1: u64, c2: u64) -> Result<Option<(u64, u64)>> {
        match self {
            BlockReader::Row(r) => r.move_to_closest_second_term(c1, c2),
            BlockReader::Cluster(r) => r.move_to_closest_second_term(c1, c2),
            BlockReader::Column(r) => r.move_to_closest_second_term(c1, c2),
            BlockReader::Indexed(r) => r.move_to_closest_second_term(c1, c2),
        }
    }

    fn mark(&mut self) {
        match self {
            BlockReader::Row(r) => r.mark(),
            BlockReader::Cluster(r) => r.mark(),
            BlockReader::Column(r) => r.mark(),
            BlockReader::Indexed(r) => r.mark(),
        }
    }

    fn reset(&mut self) -> Result<()> {
        match self {
            BlockReader::Row(r) => r.reset(),
            BlockReader::Cluster(r) => r.reset(),
            BlockReader::Column(r) => r.reset(),
            BlockReader::Indexed(r) => r.reset(),
        }
    }

    fn current(&self) -> Option<(u64, u64)> {
        match self {
            BlockReader::Row(r) => r.current(),
            BlockReader::Cluster(r) => r.current(),
            BlockReader::Column(r) => r.current(),
            BlockReader::Indexed(r) => r.current(),
        }
    }
}

/// One logical pair table over a sealed or in-construction partition.
pub struct TableStorage {
    config: StoreConfig,
    manager: Arc<Mutex<SegmentManager>>,
    blocks: Vec<BlockCoord>,
    indexes: BTreeMap<(u16, u64), Arc<FileIndex>>,
    state: WriteState,
    batch: Vec<(u64, u64)>,
}

impl TableStorage {
    /// Creates an empty table ready for one bulk-load pass.
    pub fn create(config: StoreConfig) -> Result<Self> {
        let manager = SegmentManager::create(&config)?;
        Ok(Self {
            config,
            manager: Arc::new(Mutex::new(manager)),
            blocks: Vec::new(),
            indexes: BTreeMap::new(),
            state: WriteState::Idle,
            batch: Vec::new(),
        })
    }

    /// Opens a previously sealed table.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let path = config.dir.join(META_FILE);
        let mut file = File::open(&path).map_err(|e| Error::ReadError("table metadata", e))?;
        let meta: TableMeta = read_record(&mut file).map_err(|e| match e {
            Error::ChecksumMismatch => Error::ChecksumMismatch,
            other => Error::IndexCorruption(other.to_string()),
        })?;
        let manager = SegmentManager::open(&config, meta.segment_count)?;
        Ok(Self {
            config,
            manager: Arc::new(Mutex::new(manager)),
            blocks: meta.blocks,
            indexes: meta
                .indexes
                .into_iter()
                .map(|(k, v)| (k, Arc::new(v)))
                .collect(),
            state: WriteState::Closed,
            batch: Vec::new(),
        })
    }

    pub fn blocks(&self) -> &[BlockCoord] {
        &self.blocks
    }

    // ---- bulk load --------------------------------------------------------

    pub fn start_append(&mut self) -> Result<()> {
        if self.state != WriteState::Idle {
            return Err(Error::InvalidState(
                "Table already loaded or loading".to_string(),
            ));
        }
        self.state = WriteState::Appending;
        Ok(())
    }

    /// Appends one pair. The caller guarantees non-decreasing (key1, key2)
    /// order across the whole load.
    pub fn append(&mut self, key1: u64, key2: u64) -> Result<()> {
        if self.state != WriteState::Appending {
            return Err(Error::InvalidState(
                "append outside a bulk-load pass".to_string(),
            ));
        }
        // Commit only at a key1 boundary so a group never splits
        if self.batch.len() >= self.config.block_size
            && self.batch.last().map(|p| p.0) != Some(key1)
        {
            self.flush_block()?;
        }
        self.batch.push((key1, key2));
        Ok(())
    }

    /// Commits the remaining batch, seals the partition and persists the
    /// block coordinates and indices.
    pub fn stop_append(&mut self) -> Result<()> {
        if self.state != WriteState::Appending {
            return Err(Error::InvalidState(
                "stop_append outside a bulk-load pass".to_string(),
            ));
        }
        if !self.batch.is_empty() {
            self.flush_block()?;
        }
        self.manager.lock()?.seal()?;
        self.save_meta()?;
        self.state = WriteState::Closed;
        tracing::info!(blocks = self.blocks.len(), "Sealed table");
        Ok(())
    }

    /// Instantiates a block writer for an externally chosen signature.
    pub fn start_writer(&self, sig: Signature) -> BlockWriter {
        let manager = Arc::clone(&self.manager);
        match sig.layout {
            Layout::Row => BlockWriter::Row(RowWriter::new(manager, sig)),
            Layout::DeltaCluster => BlockWriter::Cluster(ClusterWriter::new(
                manager,
                sig,
                self.config.first_index_size,
                self.config.additional_index_size,
            )),
            Layout::SimpleColumn => BlockWriter::Column(ColumnWriter::new(manager, sig)),
            Layout::IndexedColumn => BlockWriter::Indexed(IndexedWriter::new(manager, sig)),
        }
    }

    fn flush_block(&mut self) -> Result<()> {
        let key1s: Vec<u64> = self.batch.iter().map(|p| p.0).collect();
        let key2s: Vec<u64> = self.batch.iter().map(|p| p.1).collect();
        let sig = determine_strategy(
            &key1s,
            &key2s,
            self.config.column_threshold,
            self.config.rate_list,
        );

        let mut writer = self.start_writer(sig);
        writer.start_append()?;
        for &(k1, k2) in &self.batch {
            writer.append(k1, k2)?;
        }
        writer.stop_append()?;

        let start = writer.start_position().ok_or_else(|| {
            Error::InvalidState("Block writer closed without a start position".to_string())
        })?;
        if let Some(index) = writer.take_index() {
            self.indexes
                .insert((start.segment, start.offset), Arc::new(index));
        }
        let coord = BlockCoord {
            first_key1: key1s[0],
            segment: start.segment,
            offset: start.offset,
            signature: sig.to_byte(),
        };
        tracing::debug!(
            first_key1 = coord.first_key1,
            segment = coord.segment,
            offset = coord.offset,
            signature = coord.signature,
            pairs = self.batch.len(),
            "Committed block"
        );
        self.blocks.push(coord);
        self.batch.clear();
        Ok(())
    }

    fn save_meta(&self) -> Result<()> {
        let meta = TableMeta {
            segment_count: self.manager.lock()?.segment_count(),
            blocks: self.blocks.clone(),
            indexes: self
                .indexes
                .iter()
                .map(|(k, v)| (*k, (**v).clone()))
                .collect(),
        };
        let path = self.config.dir.join(META_FILE);
        let mut file = File::create(&path).map_err(|e| Error::WriteError("table metadata", e))?;
        write_record(&mut file, &meta)?;
        file.sync_all()?;
        Ok(())
    }

    // ---- read path --------------------------------------------------------

    /// Instantiates a cursor over one block, as the coordinate index
    /// interface prescribes.
    pub fn setup_reader(
        &self,
        signature: u8,
        start: Position,
        session: usize,
    ) -> Result<BlockReader> {
        let sig = Signature::from_byte(signature)?;
        let manager = Arc::clone(&self.manager);
        Ok(match sig.layout {
            Layout::Row => BlockReader::Row(RowReader::new(manager, session, sig, start)?),
            Layout::DeltaCluster => {
                let index = self
                    .indexes
                    .get(&(start.segment, start.offset))
                    .cloned()
                    .unwrap_or_default();
                BlockReader::Cluster(ClusterReader::new(
                    manager,
                    session,
                    sig,
                    start,
                    index,
                    self.config.first_index_size,
                    self.config.additional_index_size,
                )?)
            }
            Layout::SimpleColumn => {
                BlockReader::Column(ColumnReader::new(manager, session, sig, start)?)
            }
            Layout::IndexedColumn => {
                BlockReader::Indexed(IndexedReader::new(manager, session, sig, start)?)
            }
        })
    }

    fn table_reader(&self) -> Result<TableReader> {
        if self.state != WriteState::Closed {
            return Err(Error::InvalidState(
                "Table is not sealed for reading".to_string(),
            ));
        }
        let guard = SessionGuard::new(Arc::clone(&self.manager))?;
        Ok(TableReader {
            config: self.config.clone(),
            manager: Arc::clone(&self.manager),
            blocks: self.blocks.clone(),
            indexes: self.indexes.clone(),
            guard,
            block_idx: 0,
            inner: None,
            marked_block: None,
        })
    }

    /// Cursor over the whole table in (key1, key2) order.
    pub fn scan(&self) -> Result<ScanCursor> {
        Ok(ScanCursor::new(Box::new(self.table_reader()?)))
    }

    /// Cursor over the records of one first key.
    pub fn lookup(&self, key1: u64) -> Result<ScanCursor> {
        Ok(ScanCursor::new(Box::new(self.table_reader()?)).with_constraint1(key1))
    }

    /// Cursor over the records matching both keys.
    pub fn lookup_pair(&self, key1: u64, key2: u64) -> Result<ScanCursor> {
        Ok(ScanCursor::new(Box::new(self.table_reader()?))
            .with_constraint1(key1)
            .with_constraint2(key2))
    }
}

/// Table-wide cursor chaining the per-block readers in coordinate order.
/// Owns its cache session for the lifetime of the scan.
pub struct TableReader {
    config: StoreConfig,
    manager: Arc<Mutex<SegmentManager>>,
    blocks: Vec<BlockCoord>,
    indexes: BTreeMap<(u16, u64), Arc<FileIndex>>,
    guard: SessionGuard,
    block_idx: usize,
    inner: Option<BlockReader>,
    marked_block: Option<usize>,
}

impl TableReader {
    fn open_block(&mut self, idx: usize) -> Result<bool> {
        if idx >= self.blocks.len() {
            self.inner = None;
            return Ok(false);
        }
        let coord = self.blocks[idx];
        let sig = Signature::from_byte(coord.signature)?;
        let start = Position::new(coord.segment, coord.offset);
        let manager = Arc::clone(&self.manager);
        let session = self.guard.id();
        let reader = match sig.layout {
            Layout::Row => BlockReader::Row(RowReader::new(manager, session, sig, start)?),
            Layout::DeltaCluster => {
                let index = self
                    .indexes
                    .get(&(coord.segment, coord.offset))
                    .cloned()
                    .unwrap_or_default();
                BlockReader::Cluster(ClusterReader::new(
                    manager,
                    session,
                    sig,
                    start,
                    index,
                    self.config.first_index_size,
                    self.config.additional_index_size,
                )?)
            }
            Layout::SimpleColumn => {
                BlockReader::Column(ColumnReader::new(manager, session, sig, start)?)
            }
            Layout::IndexedColumn => {
                BlockReader::Indexed(IndexedReader::new(manager, session, sig, start)?)
            }
        };
        self.inner = Some(reader);
        self.block_idx = idx;
        Ok(true)
    }

    /// Opens successive blocks starting at `idx` until one yields a first
    /// record.
    fn first_of_block(&mut self, mut idx: usize) -> Result<Option<(u64, u64)>> {
        while self.open_block(idx)? {
            if let Some(pair) = self.inner.as_mut().expect("block just opened").first()? {
                return Ok(Some(pair));
            }
            idx += 1;
        }
        self.block_idx = self.blocks.len();
        Ok(None)
    }

    /// Index of the block whose key range contains `c1`, i.e. the last
    /// block starting at or before it.
    fn block_for(&self, c1: u64) -> usize {
        let idx = self.blocks.partition_point(|b| b.first_key1 <= c1);
        idx.saturating_sub(1)
    }
}

impl PairReader for TableReader {
    fn first(&mut self) -> Result<Option<(u64, u64)>> {
        self.first_of_block(0)
    }

    fn next_pair(&mut self) -> Result<Option<(u64, u64)>> {
        let reader = match &mut self.inner {
            Some(r) => r,
            None => {
                if self.block_idx >= self.blocks.len() {
                    return Ok(None); // exhausted
                }
                return Err(crate::layout::invalid_before_first());
            }
        };
        if let Some(pair) = reader.next_pair()? {
            return Ok(Some(pair));
        }
        let next = self.block_idx + 1;
        self.first_of_block(next)
    }

    fn move_to_closest_first_term(&mut self, c1: u64) -> Result<Option<(u64, u64)>> {
        if self.inner.is_none() && self.block_idx >= self.blocks.len() {
            return Ok(None); // exhausted (or empty table)
        }
        let target = self.block_for(c1);
        if self.inner.is_some() && target <= self.block_idx {
            // Still inside (or before) the current block: forward-only
            let reader = self.inner.as_mut().expect("cursor has an open block");
            if let Some(pair) = reader.move_to_closest_first_term(c1)? {
                return Ok(Some(pair));
            }
            let next = self.block_idx + 1;
            return self.first_of_block(next);
        }
        if !self.open_block(target)? {
            return Ok(None);
        }
        let reader = self.inner.as_mut().expect("block just opened");
        if let Some(pair) = reader.move_to_closest_first_term(c1)? {
            return Ok(Some(pair));
        }
        let next = self.block_idx + 1;
        self.first_of_block(next)
    }

    fn move_to_closest_second_term(&mut self, c1: u64, c2: u64) -> Result<Option<(u64, u64)>> {
        let reader = match &mut self.inner {
            Some(r) => r,
            None => return Ok(None),
        };
        if let Some(pair) = reader.move_to_closest_second_term(c1, c2)? {
            return Ok(Some(pair));
        }
        let next = self.block_idx + 1;
        self.first_of_block(next)
    }

    fn mark(&mut self) {
        if let Some(reader) = &mut self.inner {
            reader.mark();
            self.marked_block = Some(self.block_idx);
        }
    }

    fn reset(&mut self) -> Result<()> {
        match (self.marked_block, &mut self.inner) {
            (Some(marked), Some(reader)) if marked == self.block_idx => reader.reset(),
            _ => Err(Error::InvalidState(
                "reset after the cursor left the marked block".to_string(),
            )),
        }
    }

    fn current(&self) -> Option<(u64, u64)> {
        self.inner.as_ref().and_then(|r| r.current())
    }
}
