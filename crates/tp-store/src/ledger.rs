use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::{create_parent_dirs, StoreError};

/// Durable record of fully-ingested shard ids: plain text, one id per line,
/// append-only. An empty file is a valid initial state.
///
/// Invariant: an id is appended only after all of the shard's surviving rows
/// are durable in the table and its working copy has been removed (or is
/// about to be). Each append is flushed and synced before returning, so a
/// crash immediately after `append` never loses the entry; a crash
/// immediately before it causes at most one re-ingest attempt.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    file: File,
    seen: HashSet<String>,
}

impl Ledger {
    /// Opens the ledger, creating an empty file if none exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        create_parent_dirs(&path)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let contents = std::fs::read_to_string(&path)?;
        let seen = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self { path, file, seen })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Appends one completed shard id, durable before return.
    pub fn append(&mut self, id: &str) -> Result<(), StoreError> {
        if id.trim().is_empty() || id.contains('\n') || id.contains('\r') {
            return Err(StoreError::InvalidShardId(id.to_string()));
        }
        if self.seen.contains(id) {
            return Ok(());
        }

        self.file.write_all(id.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        self.file.sync_all()?;
        self.seen.insert(id.to_string());
        Ok(())
    }
}
