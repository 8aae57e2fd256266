#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod audit;
pub mod ledger;
pub mod table;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not a terrapatch table file: {0}")]
    BadHeader(String),
    #[error("table schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("invalid shard id {0:?}")]
    InvalidShardId(String),
    #[error("row does not match table schema: {0}")]
    RowShape(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn create_parent_dirs(path: &std::path::Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
