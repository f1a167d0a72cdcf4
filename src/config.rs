use std::path::PathBuf;

/// Configuration for a pair store partition.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the partition's segment files and metadata
    pub dir: PathBuf,

    /// Maximum size of one segment file before rolling over (default: 64MB)
    pub max_segment_size: u64,

    /// Hard cap on the number of segments per partition (default: 2048)
    pub max_segments: u16,

    /// Maximum number of simultaneously open segment files (default: 16)
    pub max_open_files: usize,

    /// Maximum number of concurrent reader sessions (default: 64)
    pub max_sessions: usize,

    /// Checkpoint cadence for primary keys: one FileIndex entry every
    /// this many groups (default: 512)
    pub first_index_size: usize,

    /// Checkpoint cadence inside a long group: one entry every this many
    /// second-term values (default: 256)
    pub additional_index_size: usize,

    /// Number of pairs buffered per block before a layout is chosen and
    /// the block is committed (default: 16384)
    pub block_size: usize,

    /// Minimum number of records in a batch before the columnar layouts
    /// are considered (default: 32)
    pub column_threshold: usize,

    /// Size penalty multiplier applied to the projected Row layout size,
    /// biasing against its worse random-seek behavior (default: 1.05)
    pub rate_list: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./tribase"),
            max_segment_size: 64 * 1024 * 1024, // 64MB
            max_segments: 2048,
            max_open_files: 16,
            max_sessions: 64,
            first_index_size: 512,
            additional_index_size: 256,
            block_size: 16384,
            column_threshold: 32,
            rate_list: 1.05,
        }
    }
}

impl StoreConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set maximum segment file size
    pub fn max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Set the hard cap on segment count
    pub fn max_segments(mut self, max: u16) -> Self {
        self.max_segments = max;
        self
    }

    /// Set maximum simultaneously open segment files
    pub fn max_open_files(mut self, max: usize) -> Self {
        self.max_open_files = max;
        self
    }

    /// Set maximum concurrent reader sessions
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Set primary checkpoint cadence
    pub fn first_index_size(mut self, n: usize) -> Self {
        self.first_index_size = n;
        self
    }

    /// Set in-group checkpoint cadence
    pub fn additional_index_size(mut self, n: usize) -> Self {
        self.additional_index_size = n;
        self
    }

    /// Set pairs buffered per block
    pub fn block_size(mut self, n: usize) -> Self {
        self.block_size = n;
        self
    }

    /// Set the distinct-key threshold for columnar layouts
    pub fn column_threshold(mut self, n: usize) -> Self {
        self.column_threshold = n;
        self
    }

    /// Set the Row layout size penalty
    pub fn rate_list(mut self, rate: f64) -> Self {
        self.rate_list = rate;
        self
    }
}
