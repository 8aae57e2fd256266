#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info_span;
use tracing::Instrument;

use tp_core::mode::Mode;
use tp_ingest::config::RunPaths;
use tp_ingest::pipeline::IngestPipeline;
use tp_ingest::source::{FolderLocation, ShardSource};

#[derive(Debug, Parser)]
#[command(name = "tp-ingest", about = "Ingest satellite imagery shards into the patch table")]
struct Args {
    /// Resolution mode: small, large, or mw.
    #[arg(long, env = "TP_MODE")]
    mode: String,

    /// Remote shard folder over http(s); `{url}/listing.json` must list it.
    #[arg(long, env = "TP_SOURCE_URL", conflicts_with = "source_dir")]
    source_url: Option<String>,

    /// Local directory of shard files (mostly for reprocessing and tests).
    #[arg(long, env = "TP_SOURCE_DIR")]
    source_dir: Option<PathBuf>,

    /// Root under which the working dir, state files, and table live.
    #[arg(long, env = "TP_ROOT", default_value = ".")]
    root: PathBuf,

    #[arg(long)]
    workdir: Option<PathBuf>,

    #[arg(long)]
    ledger: Option<PathBuf>,

    #[arg(long)]
    audit_log: Option<PathBuf>,

    #[arg(long)]
    table: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tp_observe::logging::init_tracing();
    let args = Args::parse();

    let mode: Mode = args.mode.parse()?;
    let location = match (&args.source_url, &args.source_dir) {
        (Some(url), None) => FolderLocation::Http {
            base_url: url.clone(),
        },
        (None, Some(dir)) => FolderLocation::Local(dir.clone()),
        _ => anyhow::bail!("exactly one of --source-url or --source-dir is required"),
    };

    let mut paths = RunPaths::for_root(&args.root, mode);
    if let Some(p) = args.workdir {
        paths.workdir = p;
    }
    if let Some(p) = args.ledger {
        paths.ledger = p;
    }
    if let Some(p) = args.audit_log {
        paths.audit = p;
    }
    if let Some(p) = args.table {
        paths.table = p;
    }

    let span = info_span!("tp-ingest", mode = %mode, root = %args.root.display());
    async move {
        let source = ShardSource::new(location, paths.workdir.clone())?;
        let mut pipeline = IngestPipeline::new(mode.config(), source, &paths)?;
        pipeline.run().await?;
        Ok(())
    }
    .instrument(span)
    .await
}
