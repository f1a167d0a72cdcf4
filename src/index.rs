use std::collections::BTreeMap;
use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::segment::Position;

/// One sparse checkpoint: the stream position just after the value `key`
/// was encoded. Decoding may resume there with `key` as delta base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: i64,
    pub segment: u16,
    pub offset: u64,
}

/// Sparse secondary index over an ordered stream.
///
/// Entries are strictly increasing in key; `find_floor` binary-searches for
/// the last checkpoint at or before a target, bounding the linear scan a
/// reader has to do from there. Grouped layouts additionally hang one
/// sub-index per large group off `additional`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileIndex {
    entries: Vec<IndexEntry>,
    additional: BTreeMap<u64, FileIndex>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a checkpoint. Called periodically by a writer, never out of
    /// key order; violating that is a programmer error in the caller.
    pub fn add(&mut self, key: i64, pos: Position) -> Result<()> {
        if let Some(last) = self.entries.last() {
            if key <= last.key {
                return Err(Error::InvalidOperation(format!(
                    "Index keys must be strictly increasing: {} after {}",
                    key, last.key
                )));
            }
        }
        self.entries.push(IndexEntry {
            key,
            segment: pos.segment,
            offset: pos.offset,
        });
        Ok(())
    }

    /// Index of the last entry with key <= `key`, or None if the first
    /// entry is already past it. `hint` is the caller's previous result;
    /// repeated nearby lookups resolve without a full binary search.
    pub fn find_floor(&self, key: i64, hint: Option<usize>) -> Option<usize> {
        if let Some(h) = hint {
            if self.is_floor(h, key) {
                return Some(h);
            }
            if self.is_floor(h + 1, key) {
                return Some(h + 1);
            }
        }
        let idx = self.entries.partition_point(|e| e.key <= key);
        if idx == 0 {
            None
        } else {
            Some(idx - 1)
        }
    }

    fn is_floor(&self, idx: usize, key: i64) -> bool {
        match self.entries.get(idx) {
            Some(e) if e.key <= key => match self.entries.get(idx + 1) {
                Some(next) => next.key > key,
                None => true,
            },
            _ => false,
        }
    }

    pub fn get(&self, idx: usize) -> Option<&IndexEntry> {
        self.entries.get(idx)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sub-index for the group of first-term `key`, creating it if absent.
    pub fn additional_mut(&mut self, key: u64) -> &mut FileIndex {
        self.additional.entry(key).or_default()
    }

    pub fn additional(&self, key: u64) -> Option<&FileIndex> {
        self.additional.get(&key)
    }
}

// Persistence uses the manifest record framing:
// [len: u32][crc64: u64][bincode payload], checksum verified on load.

fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Decode("index record", e.to_string()))
}

fn deserialize<T: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Decode("index record", e.to_string()))
}

pub fn write_record<T: Serialize, W: Write>(writer: &mut W, value: &T) -> Result<()> {
    let payload = serialize(value)?;

    let mut digest = crc64fast::Digest::new();
    digest.write(&payload);
    let checksum = digest.sum64();

    writer.write_u32::<BigEndian>(payload.len() as u32)?;
    writer.write_u64::<BigEndian>(checksum)?;
    writer.write_all(&payload)?;
    Ok(())
}

pub fn read_record<T: for<'a> Deserialize<'a>, R: Read>(reader: &mut R) -> Result<T> {
    let len = reader
        .read_u32::<BigEndian>()
        .map_err(|e| Error::ReadError("record length", e))? as usize;
    let stored_checksum = reader
        .read_u64::<BigEndian>()
        .map_err(|e| Error::ReadError("record checksum", e))?;

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| Error::ReadError("record payload", e))?;

    let mut digest = crc64fast::Digest::new();
    digest.write(&payload);
    if digest.sum64() != stored_checksum {
        return Err(Error::ChecksumMismatch);
    }
    deserialize(&payload)
}
