use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use crate::{create_parent_dirs, StoreError};

/// Per-record audit trail for kept records: plain text, one line per kept
/// record, `shard,in_shard_index,sequence_id,lat,lng,urban_share`.
///
/// Lines are buffered per shard and written at `flush`, so an aborted shard
/// leaves no audit lines behind.
#[derive(Debug)]
pub struct AuditLog {
    file: File,
    pending: String,
}

impl AuditLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        create_parent_dirs(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            file,
            pending: String::new(),
        })
    }

    pub fn record(
        &mut self,
        shard: &str,
        in_shard_index: u64,
        sequence_id: i64,
        lat: f32,
        lng: f32,
        urban_share: f32,
    ) {
        self.pending.push_str(&format!(
            "{shard},{in_shard_index},{sequence_id},{lat},{lng},{urban_share}\n"
        ));
    }

    /// Writes buffered lines, flushed and synced before return.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.file.write_all(self.pending.as_bytes())?;
        self.file.flush()?;
        self.file.sync_all()?;
        self.pending.clear();
        Ok(())
    }

    /// Drops buffered lines without writing them (aborted shard).
    pub fn discard_pending(&mut self) {
        self.pending.clear();
    }
}
