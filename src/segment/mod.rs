pub mod manager;
#[allow(clippy::module_inception)]
pub mod segment;
pub mod stream;

pub use manager::{SegmentManager, SessionGuard, RECORD_MARGIN};
pub use stream::{StreamReader, StreamWriter};

use serde::{Deserialize, Serialize};

/// A byte position inside the partition's segment stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub segment: u16,
    pub offset: u64,
}

impl Position {
    pub fn new(segment: u16, offset: u64) -> Self {
        Self { segment, offset }
    }
}
