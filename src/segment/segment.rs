use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};

/// A segment is writable while its partition is being bulk-loaded and
/// becomes read-only once finalized. Writable segments accumulate bytes in
/// memory (their size is capped by `StoreConfig::max_segment_size`) so that
/// deferred backpatches can be applied before anything hits the disk.
pub struct WritableSegment {
    path: PathBuf,
    buffer: Vec<u8>,
}

impl WritableSegment {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            buffer: Vec::new(),
        }
    }

    /// Appends bytes, returning the offset they were written at.
    pub fn append(&mut self, bytes: &[u8]) -> u64 {
        let offset = self.buffer.len() as u64;
        self.buffer.extend_from_slice(bytes);
        offset
    }

    /// Overwrites previously appended bytes in place.
    ///
    /// Only meant for fixed-width backpatches (group counts, block record
    /// counts) whose size was reserved up front and cannot change.
    pub fn overwrite(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + bytes.len();
        if end > self.buffer.len() {
            return Err(Error::InvalidOperation(format!(
                "Backpatch of {} bytes at offset {} exceeds segment size {}",
                bytes.len(),
                offset,
                self.buffer.len()
            )));
        }
        self.buffer[start..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn overwrite_byte(&mut self, offset: u64, value: u8) -> Result<()> {
        self.overwrite(offset, &[value])
    }

    pub fn len(&self) -> u64 {
        self.buffer.len() as u64
    }

    /// Flushes the segment to disk and reopens it read-only.
    pub fn finalize(self) -> Result<ReadableSegment> {
        let mut file = File::create(&self.path)
            .map_err(|e| Error::WriteError("segment file", e))?;
        file.write_all(&self.buffer)
            .map_err(|e| Error::WriteError("segment contents", e))?;
        file.sync_all()?;
        Ok(ReadableSegment {
            data: Arc::from(self.buffer),
        })
    }
}

pub struct ReadableSegment {
    data: Arc<[u8]>,
}

impl ReadableSegment {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).map_err(|e| Error::ReadError("segment file", e))?;
        let size = file.metadata()?.len() as usize;
        let mut data = Vec::with_capacity(size);
        file.read_to_end(&mut data)
            .map_err(|e| Error::ReadError("segment contents", e))?;
        Ok(Self {
            data: Arc::from(data),
        })
    }

    /// Shared handle to the full segment contents. Readers keep it alive
    /// across cache evictions for the duration of a scan.
    pub fn data(&self) -> Arc<[u8]> {
        Arc::clone(&self.data)
    }

    pub fn read(&self, offset: u64, length: usize) -> Result<&[u8]> {
        let start = offset as usize;
        let end = start + length;
        if end > self.data.len() {
            return Err(Error::Decode(
                "segment range",
                format!(
                    "range {}..{} out of bounds for segment of {} bytes",
                    start,
                    end,
                    self.data.len()
                ),
            ));
        }
        Ok(&self.data[start..end])
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

/// File name of a segment within the partition directory.
pub fn segment_file_name(id: u16) -> String {
    format!("{:05}.seg", id)
}
