//! On-disk snapshots of the record store.
//!
//! File layout:
//! ```text
//! magic "GQC\0" | version u8 | crc32 u32 LE | length u64 LE | MessagePack body
//! ```
//! The checksum covers the body only.

use crate::error::{CacheError, Result};
use crate::range::Range;
use crate::records::RecordStore;
use crate::types::{DataId, FieldValue, Record};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Magic bytes for snapshot files.
const SNAPSHOT_MAGIC: &[u8; 4] = b"GQC\0";

/// Current snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

/// Point-in-time copy of a store's records, ranges and root calls.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub records: BTreeMap<DataId, Option<Record>>,
    pub ranges: BTreeMap<DataId, Range>,
    pub root_calls: BTreeMap<String, DataId>,
}

impl CacheSnapshot {
    pub fn capture(store: &RecordStore) -> Self {
        Self {
            records: store.entries().map(|(id, r)| (id.clone(), r.clone())).collect(),
            ranges: store.ranges().map(|(id, r)| (id.clone(), r.clone())).collect(),
            root_calls: store.root_calls().map(|(k, id)| (k.clone(), id.clone())).collect(),
        }
    }

    /// Write every entry into `store` through its mutation API.
    ///
    /// Existing entries with the same ids are overwritten; others are kept.
    pub fn replay(&self, store: &mut RecordStore) -> Result<()> {
        for (id, record) in &self.records {
            let Some(record) = record else {
                store.delete_record(id);
                continue;
            };
            store.put_record(id, record.typename.as_deref());
            for (key, value) in &record.fields {
                match value {
                    FieldValue::Scalar(v) => store.put_field(id, key, v.clone())?,
                    FieldValue::Null => store.put_field(id, key, serde_json::Value::Null)?,
                    FieldValue::Link(target) => store.put_linked_record(id, key, Some(target.clone()))?,
                    FieldValue::Links(targets) => store.put_linked_records(id, key, targets.clone())?,
                }
            }
        }
        for (id, range) in &self.ranges {
            store.put_range(id, range.clone())?;
        }
        for (key, id) in &self.root_calls {
            store.put_root_call_id(key, id);
        }
        tracing::debug!(
            records = self.records.len(),
            ranges = self.ranges.len(),
            "snapshot replayed"
        );
        Ok(())
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let encoded = rmp_serde::to_vec(self)?;
        let checksum = crc32fast::hash(&encoded);

        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        writer.write_all(SNAPSHOT_MAGIC)?;
        writer.write_all(&[SNAPSHOT_VERSION])?;
        writer.write_all(&checksum.to_le_bytes())?;
        writer.write_all(&(encoded.len() as u64).to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(CacheError::InvalidFormat("Invalid snapshot magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != SNAPSHOT_VERSION {
            return Err(CacheError::InvalidFormat(format!(
                "Unsupported snapshot version: {}",
                version[0]
            )));
        }

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);

        let mut len_bytes = [0u8; 8];
        reader.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);
        // magic + version + checksum + length
        let header_len = 4 + 1 + 4 + 8;
        if len > file_len.saturating_sub(header_len) {
            return Err(CacheError::InvalidFormat(format!(
                "Snapshot body length {} exceeds file size {}",
                len, file_len
            )));
        }

        let mut encoded = vec![0u8; len as usize];
        reader.read_exact(&mut encoded)?;

        let got = crc32fast::hash(&encoded);
        if got != expected {
            return Err(CacheError::ChecksumMismatch { expected, got });
        }
        Ok(rmp_serde::from_slice(&encoded)?)
    }
}
