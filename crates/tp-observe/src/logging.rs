use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `TP_LOG` first, then `RUST_LOG`,
/// then a default of `info`.
///
/// Log field contract for the ingester:
/// - Always include `mode` on run-level events.
/// - Include `shard` (the shard title) on any per-shard event.
/// - Include `sequence_id` on per-record write events.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("TP_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
