use std::path::{Path, PathBuf};

use tp_core::mode::Mode;

/// On-disk locations for one run, derived deterministically from a root path
/// and the resolution mode unless individually overridden.
#[derive(Debug, Clone)]
pub struct RunPaths {
    /// Working directory for in-flight shard downloads.
    pub workdir: PathBuf,
    /// Completion ledger (one shard id per line).
    pub ledger: PathBuf,
    /// Per-kept-record audit log.
    pub audit: PathBuf,
    /// The output table.
    pub table: PathBuf,
}

impl RunPaths {
    pub fn for_root(root: impl AsRef<Path>, mode: Mode) -> Self {
        let root = root.as_ref();
        Self {
            workdir: root.join(format!("work_{mode}")),
            ledger: root.join("state").join(format!("processed_shards_{mode}.txt")),
            audit: root.join("state").join(format!("valid_records_{mode}.txt")),
            table: root.join("data").join(format!("{mode}_patches.tbl")),
        }
    }
}
