use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use tp_observe::time::unix_time_ms;
use tp_store::ledger::Ledger;

/// File-type filter applied to remote listings.
pub const SHARD_EXT: &str = ".shard";

/// One entry of the remote folder listing, as the export job publishes it.
#[derive(Debug, Clone, Deserialize)]
pub struct FolderEntry {
    pub id: String,
    pub title: String,
}

/// Where the shard folder lives.
#[derive(Debug, Clone)]
pub enum FolderLocation {
    /// `{base_url}/listing.json` lists the folder; `{base_url}/{id}`
    /// downloads one shard.
    Http { base_url: String },
    /// A local directory (id == title == file name); download is a copy.
    Local(PathBuf),
}

/// A listed shard, immutable once listed. `order_key` is the trailing
/// integer of the title (last `-` segment, extension stripped) and defines
/// processing order; ties break by title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardHandle {
    pub id: String,
    pub title: String,
    pub order_key: u64,
}

pub fn order_key_for_title(title: &str) -> Option<u64> {
    // Only the trailing extension comes off; a `.shard` elsewhere in the
    // name must not mangle the stem.
    let stem = title.strip_suffix(SHARD_EXT).unwrap_or(title);
    let last = stem.rsplit('-').next()?;
    last.trim().parse().ok()
}

/// Lists, orders, and fetches shards from the remote folder into the local
/// working directory.
#[derive(Debug)]
pub struct ShardSource {
    location: FolderLocation,
    workdir: PathBuf,
    http: Option<reqwest::Client>,
}

impl ShardSource {
    pub fn new(location: FolderLocation, workdir: impl Into<PathBuf>) -> Result<Self> {
        let http = match &location {
            FolderLocation::Http { .. } => Some(
                reqwest::Client::builder()
                    .connect_timeout(std::time::Duration::from_secs(2))
                    .timeout(std::time::Duration::from_secs(120))
                    .build()?,
            ),
            FolderLocation::Local(_) => None,
        };
        Ok(Self {
            location,
            workdir: workdir.into(),
            http,
        })
    }

    pub fn workdir(&self) -> &PathBuf {
        &self.workdir
    }

    /// Returns the filtered listing in processing order.
    pub async fn list(&self) -> Result<Vec<ShardHandle>> {
        let entries = match &self.location {
            FolderLocation::Http { base_url } => self.list_http(base_url).await?,
            FolderLocation::Local(dir) => list_local(dir)?,
        };

        let mut handles = Vec::with_capacity(entries.len());
        for entry in entries {
            if !entry.title.contains(SHARD_EXT) {
                continue;
            }
            match order_key_for_title(&entry.title) {
                Some(order_key) => handles.push(ShardHandle {
                    id: entry.id,
                    title: entry.title,
                    order_key,
                }),
                None => {
                    warn!(
                        target: "tp_ingest",
                        event = "shard_unordered",
                        shard = entry.title.as_str(),
                        "shard title has no numeric suffix; skipping"
                    );
                }
            }
        }
        handles.sort_by(|a, b| {
            (a.order_key, a.title.as_str()).cmp(&(b.order_key, b.title.as_str()))
        });
        Ok(handles)
    }

    async fn list_http(&self, base_url: &str) -> Result<Vec<FolderEntry>> {
        let client = self
            .http
            .as_ref()
            .context("http client not configured for http folder")?;
        let url = format!("{}/listing.json", base_url.trim_end_matches('/'));
        let resp = http_with_retry(0, || client.get(&url).send()).await?;
        anyhow::ensure!(
            resp.status().is_success(),
            "folder listing failed: status={} url={}",
            resp.status(),
            url
        );
        let entries = resp.json::<Vec<FolderEntry>>().await?;
        Ok(entries)
    }

    /// Downloads one shard into the working directory (created if missing).
    ///
    /// Returns `Ok(None)` without touching the network when the shard is
    /// already in the ledger. Download errors are per-shard: the caller logs
    /// and moves on, and the unledgered shard is retried on the next run.
    pub async fn fetch(&self, handle: &ShardHandle, ledger: &Ledger) -> Result<Option<PathBuf>> {
        if ledger.contains(&handle.id) {
            return Ok(None);
        }

        std::fs::create_dir_all(&self.workdir)
            .with_context(|| format!("create workdir {}", self.workdir.display()))?;
        let dest = self.workdir.join(&handle.title);

        match &self.location {
            FolderLocation::Http { base_url } => {
                let client = self
                    .http
                    .as_ref()
                    .context("http client not configured for http folder")?;
                let url = format!("{}/{}", base_url.trim_end_matches('/'), handle.id);
                let resp = http_with_retry(handle.order_key, || client.get(&url).send()).await?;
                anyhow::ensure!(
                    resp.status().is_success(),
                    "shard download failed: status={} url={}",
                    resp.status(),
                    url
                );
                let bytes = resp.bytes().await?;
                std::fs::write(&dest, &bytes)
                    .with_context(|| format!("write shard to {}", dest.display()))?;
            }
            FolderLocation::Local(dir) => {
                let src = dir.join(&handle.title);
                std::fs::copy(&src, &dest)
                    .with_context(|| format!("copy shard from {}", src.display()))?;
            }
        }

        Ok(Some(dest))
    }

    /// Removes the working copy of an ingested shard. A missing file is fine.
    pub fn remove_local(&self, handle: &ShardHandle) -> std::io::Result<()> {
        match std::fs::remove_file(self.workdir.join(&handle.title)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn list_local(dir: &std::path::Path) -> Result<Vec<FolderEntry>> {
    let mut entries = Vec::new();
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("read_dir failed: {}", dir.display()))?
    {
        let entry = entry?;
        if !entry.metadata()?.is_file() {
            continue;
        }
        let title = entry.file_name().to_string_lossy().to_string();
        entries.push(FolderEntry {
            id: title.clone(),
            title,
        });
    }
    Ok(entries)
}

async fn http_with_retry<F, Fut>(seed: u64, mut f: F) -> Result<reqwest::Response>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    const MAX_ATTEMPTS: usize = 5;
    const BASE_DELAY_MS: u64 = 50;
    const MAX_DELAY_MS: u64 = 1000;

    let mut attempt: usize = 0;
    let mut delay_ms: u64 = BASE_DELAY_MS;
    loop {
        attempt = attempt.saturating_add(1);
        match f().await {
            Ok(resp) => {
                let status = resp.status();
                let transient = status == reqwest::StatusCode::TOO_MANY_REQUESTS
                    || status == reqwest::StatusCode::REQUEST_TIMEOUT
                    || status.is_server_error();
                if transient && attempt < MAX_ATTEMPTS {
                    let jitter = unix_time_ms().wrapping_add(seed) % 37;
                    tokio::time::sleep(std::time::Duration::from_millis(
                        delay_ms.saturating_add(jitter),
                    ))
                    .await;
                    delay_ms = (delay_ms.saturating_mul(2)).min(MAX_DELAY_MS);
                    continue;
                }
                return Ok(resp);
            }
            Err(err) => {
                let transient = err.is_timeout() || err.is_connect();
                if transient && attempt < MAX_ATTEMPTS {
                    let jitter = unix_time_ms().wrapping_add(seed) % 37;
                    tokio::time::sleep(std::time::Duration::from_millis(
                        delay_ms.saturating_add(jitter),
                    ))
                    .await;
                    delay_ms = (delay_ms.saturating_mul(2)).min(MAX_DELAY_MS);
                    continue;
                }
                return Err(anyhow::Error::new(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(test_name: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        root.push(format!(
            "tp-source-{test_name}-{}-{}",
            std::process::id(),
            unix_time_ms()
        ));
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn order_key_is_the_trailing_integer() {
        assert_eq!(order_key_for_title("patches-small-12.shard"), Some(12));
        assert_eq!(order_key_for_title("block-0.shard"), Some(0));
        assert_eq!(order_key_for_title("7.shard"), Some(7));
        assert_eq!(order_key_for_title("patches-final.shard"), None);
    }

    #[test]
    fn only_the_trailing_extension_is_stripped() {
        // An interior ".shard" must not collapse "1.shard2" into "12".
        assert_eq!(order_key_for_title("b-1.shard2.shard"), None);
        assert_eq!(order_key_for_title("a.shard-7.shard"), Some(7));
    }

    #[tokio::test]
    async fn listing_filters_and_orders() {
        let root = temp_root("listing");
        let folder = root.join("remote");
        std::fs::create_dir_all(&folder).unwrap();
        for name in [
            "blocks-10.shard",
            "blocks-2.shard",
            "notes.txt",
            "blocks-2b.shard",
        ] {
            std::fs::write(folder.join(name), b"x").unwrap();
        }

        let source =
            ShardSource::new(FolderLocation::Local(folder), root.join("work")).unwrap();
        let handles = source.list().await.unwrap();
        let titles: Vec<&str> = handles.iter().map(|h| h.title.as_str()).collect();
        // "blocks-2b.shard" has no numeric suffix and "notes.txt" is not a shard.
        assert_eq!(titles, vec!["blocks-2.shard", "blocks-10.shard"]);
    }

    #[tokio::test]
    async fn fetch_skips_ledgered_shards_and_copies_others() {
        let root = temp_root("fetch");
        let folder = root.join("remote");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("blocks-1.shard"), b"payload").unwrap();

        let mut ledger = Ledger::open(root.join("ledger.txt")).unwrap();
        let source =
            ShardSource::new(FolderLocation::Local(folder), root.join("work")).unwrap();
        let handle = ShardHandle {
            id: "blocks-1.shard".to_string(),
            title: "blocks-1.shard".to_string(),
            order_key: 1,
        };

        let local = source.fetch(&handle, &ledger).await.unwrap().unwrap();
        assert_eq!(std::fs::read(&local).unwrap(), b"payload");

        ledger.append(&handle.id).unwrap();
        assert!(source.fetch(&handle, &ledger).await.unwrap().is_none());

        source.remove_local(&handle).unwrap();
        assert!(!local.exists());
        // Removing twice is fine.
        source.remove_local(&handle).unwrap();
    }
}
