use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use tp_core::assemble::assemble;
use tp_core::filter::keep;
use tp_core::mode::SchemaDescriptor;
use tp_observe::metrics::{Counter, Gauge};
use tp_store::audit::AuditLog;
use tp_store::ledger::Ledger;
use tp_store::table::Table;
use tp_wire::RecordStream;

use crate::config::RunPaths;
use crate::source::{ShardHandle, ShardSource};

#[derive(Debug, Default)]
pub struct IngestMetrics {
    pub records_processed_total: Counter,
    pub records_kept_total: Counter,
    pub invalid_records_total: Counter,
    pub invalid_shards_total: Counter,
    pub shards_completed_total: Counter,
    pub shards_skipped_total: Counter,
    pub fetch_errors_total: Counter,
    pub table_rows: Gauge,
}

/// End-of-run totals, also emitted as the `run_complete` log event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub records_processed: u64,
    pub records_kept: u64,
    pub invalid_records: u64,
    pub invalid_shards: u64,
    pub shards_completed: u64,
    pub shards_skipped: u64,
    pub fetch_errors: u64,
    pub table_rows: u64,
}

/// The orchestrator: for each unseen shard, fetch, decode, assemble, filter,
/// persist; then record completion in the ledger and drop the working copy.
///
/// Strictly sequential by design: one shard at a time, one record at a time.
/// Per-record and per-shard failures are counted and skipped; ledger, table,
/// and audit write failures abort the run.
pub struct IngestPipeline {
    schema: SchemaDescriptor,
    source: ShardSource,
    ledger: Ledger,
    table: Table,
    audit: AuditLog,
    metrics: Arc<IngestMetrics>,
    /// Highest sequence id assigned so far; seeded from the table row count
    /// so resumed runs continue the sequence instead of reusing ids.
    assigned: i64,
}

impl IngestPipeline {
    pub fn new(schema: SchemaDescriptor, source: ShardSource, paths: &RunPaths) -> Result<Self> {
        let ledger = Ledger::open(&paths.ledger)?;
        let table = Table::open(&paths.table, &schema)?;
        let audit = AuditLog::open(&paths.audit)?;
        let assigned =
            i64::try_from(table.row_count()).context("table row count exceeds sequence range")?;

        let metrics = Arc::new(IngestMetrics::default());
        metrics.table_rows.set(table.row_count());

        Ok(Self {
            schema,
            source,
            ledger,
            table,
            audit,
            metrics,
            assigned,
        })
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        self.metrics.clone()
    }

    pub async fn run(&mut self) -> Result<RunSummary> {
        let handles = self.source.list().await?;
        info!(
            target: "tp_ingest",
            event = "run_start",
            mode = %self.schema.mode,
            shards = handles.len() as u64,
            table_rows = self.table.row_count(),
            "starting ingest run"
        );

        for handle in &handles {
            if self.ledger.contains(&handle.id) {
                debug!(
                    target: "tp_ingest",
                    event = "shard_skipped",
                    shard = handle.title.as_str(),
                    "shard already ingested"
                );
                self.metrics.shards_skipped_total.inc();
                continue;
            }

            let local = match self.source.fetch(handle, &self.ledger).await {
                Ok(Some(path)) => path,
                Ok(None) => {
                    self.metrics.shards_skipped_total.inc();
                    continue;
                }
                Err(err) => {
                    warn!(
                        target: "tp_ingest",
                        event = "fetch_failed",
                        shard = handle.title.as_str(),
                        error = %err,
                        "shard fetch failed; will retry next run"
                    );
                    self.metrics.fetch_errors_total.inc();
                    continue;
                }
            };

            self.ingest_shard(handle, &local)?;
        }

        let summary = self.summary();
        info!(
            target: "tp_ingest",
            event = "run_complete",
            mode = %self.schema.mode,
            records_processed = summary.records_processed,
            records_kept = summary.records_kept,
            invalid_records = summary.invalid_records,
            invalid_shards = summary.invalid_shards,
            shards_completed = summary.shards_completed,
            shards_skipped = summary.shards_skipped,
            fetch_errors = summary.fetch_errors,
            table_rows = summary.table_rows,
            "ingest run complete"
        );
        Ok(summary)
    }

    /// Decodes one local shard file end to end. Returns `Ok` for both
    /// completed and aborted shards; `Err` only for storage failures.
    pub fn ingest_shard(&mut self, handle: &ShardHandle, local: &Path) -> Result<()> {
        let file = match File::open(local) {
            Ok(file) => file,
            Err(err) => {
                warn!(
                    target: "tp_ingest",
                    event = "shard_missing_local",
                    shard = handle.title.as_str(),
                    error = %err,
                    "local shard file unavailable; skipping (resupply to ingest)"
                );
                return Ok(());
            }
        };

        let assigned_at_start = self.assigned;
        let mut stream = RecordStream::new(BufReader::new(file), &self.schema);
        let mut in_shard_index: u64 = 0;
        let mut kept_in_shard: u64 = 0;

        loop {
            match stream.next_record() {
                Ok(Some(raw)) => {
                    in_shard_index += 1;
                    self.metrics.records_processed_total.inc();

                    let obs = match assemble(&self.schema, &raw) {
                        Ok(obs) => obs,
                        Err(err) => {
                            self.metrics.invalid_records_total.inc();
                            warn!(
                                target: "tp_ingest",
                                event = "record_invalid",
                                shard = handle.title.as_str(),
                                record = in_shard_index,
                                error = %err,
                                "dropping malformed record"
                            );
                            continue;
                        }
                    };

                    if !keep(obs.urban_share) {
                        continue;
                    }

                    self.assigned += 1;
                    let sequence_id = self.assigned;
                    self.audit.record(
                        &handle.title,
                        in_shard_index,
                        sequence_id,
                        obs.lat,
                        obs.lng,
                        obs.urban_share,
                    );
                    self.table.append_observation(&obs, sequence_id)?;
                    kept_in_shard += 1;
                }
                Ok(None) => break,
                Err(err) if !err.is_total_loss() => {
                    in_shard_index += 1;
                    self.metrics.records_processed_total.inc();
                    self.metrics.invalid_records_total.inc();
                    warn!(
                        target: "tp_ingest",
                        event = "record_invalid",
                        shard = handle.title.as_str(),
                        record = in_shard_index,
                        error = %err,
                        "dropping malformed record"
                    );
                    continue;
                }
                Err(err) => {
                    // Total loss: nothing from this shard is committed, the
                    // sequence counter rewinds, and the shard stays out of
                    // the ledger so the next run retries it.
                    self.table.discard_pending();
                    self.audit.discard_pending();
                    self.assigned = assigned_at_start;
                    self.metrics.invalid_shards_total.inc();
                    warn!(
                        target: "tp_ingest",
                        event = "shard_corrupt",
                        shard = handle.title.as_str(),
                        record = in_shard_index,
                        error = %err,
                        "shard unreadable; will retry next run"
                    );
                    return Ok(());
                }
            }
        }

        // COMPLETING: rows become durable before the ledger entry, and the
        // working copy goes last.
        let rows_total = self.table.commit()?;
        self.audit.flush()?;
        self.ledger.append(&handle.id)?;
        self.source
            .remove_local(handle)
            .with_context(|| format!("remove working copy of {}", handle.title))?;
        self.metrics.table_rows.set(rows_total);
        self.metrics.records_kept_total.inc_by(kept_in_shard);
        self.metrics.shards_completed_total.inc();

        info!(
            target: "tp_ingest",
            event = "shard_complete",
            shard = handle.title.as_str(),
            records = in_shard_index,
            kept = kept_in_shard,
            rows_total,
            "shard ingested"
        );
        Ok(())
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            records_processed: self.metrics.records_processed_total.get(),
            records_kept: self.metrics.records_kept_total.get(),
            invalid_records: self.metrics.invalid_records_total.get(),
            invalid_shards: self.metrics.invalid_shards_total.get(),
            shards_completed: self.metrics.shards_completed_total.get(),
            shards_skipped: self.metrics.shards_skipped_total.get(),
            fetch_errors: self.metrics.fetch_errors_total.get(),
            table_rows: self.metrics.table_rows.get(),
        }
    }
}
