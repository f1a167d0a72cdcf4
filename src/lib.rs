//! Disk-resident, compressed, indexed storage for sorted (key1, key2)
//! pair streams.
//!
//! A partition is bulk-loaded once through [`TableStorage`], which batches
//! appended pairs into blocks, picks the cheapest of four binary layouts
//! per block, and persists one signature byte plus start coordinates per
//! block for the upper coordinate index. After sealing, the partition is
//! read-only and served through per-session cursors backed by a bounded
//! segment cache.

pub mod config;
pub mod encoding;
pub mod error;
pub mod index;
pub mod layout;
pub mod segment;
pub mod table;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use index::{FileIndex, IndexEntry};
pub use layout::{
    ColumnId, Compression, Layout, PairReader, PairWriter, ReadStats, ScanCursor, SequenceWriter,
    Signature,
};
pub use segment::{Position, SegmentManager, SessionGuard};
pub use table::{BlockCoord, BlockReader, BlockWriter, TableStorage};
