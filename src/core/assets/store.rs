use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::cache_entry::{AssetIdentity, AssetRequest, CacheEntry, Completeness};
use crate::core::cancel::CancelToken;
use crate::core::downloader::{Checksum, Downloader};
use crate::core::error::{EngineError, EngineResult};
use crate::core::fsio::{read_json_opt, write_json_atomic};
use crate::core::keyed_lock::KeyedLocks;

const INDEX_FILE: &str = "index.json";
const INDEX_SCHEMA_VERSION: u32 = 1;

/// Hosts we only download from when nothing else works.
const RESTRICTED_DOMAINS: &[&str] = &["archive.org"];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct AssetIndex {
    schema_version: u32,
    entries: BTreeMap<String, CacheEntry>,
}

/// Content cache for downloaded archives and runtime components.
///
/// Reads go through a shared lock. Every write to a given identity is
/// serialized by a per-identity mutex, and index persistence is serialized
/// so the file on disk always reflects the latest in-memory state.
pub struct AssetStore {
    root: PathBuf,
    index: RwLock<AssetIndex>,
    persist_lock: tokio::sync::Mutex<()>,
    identity_locks: KeyedLocks,
    downloader: Arc<Downloader>,
}

impl AssetStore {
    /// Open (or create) the cache rooted at `root`.
    ///
    /// Entries whose files disappeared are dropped from the index.
    pub async fn open(root: PathBuf, downloader: Arc<Downloader>) -> EngineResult<Self> {
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| EngineError::io(&root, e))?;

        let index_path = root.join(INDEX_FILE);
        let mut index = match read_json_opt::<AssetIndex>(&index_path).await {
            Ok(Some(index)) => index,
            Ok(None) => AssetIndex::default(),
            Err(e) => {
                warn!("Corrupt asset index at {:?}, starting empty: {}", index_path, e);
                AssetIndex::default()
            }
        };
        index.schema_version = INDEX_SCHEMA_VERSION;

        let before = index.entries.len();
        index.entries.retain(|_, entry| {
            let present = root.join(&entry.path).is_file();
            if !present && entry.completeness == Completeness::Complete {
                warn!("Cached file for {} vanished, dropping entry", entry.identity);
            }
            present || entry.completeness == Completeness::Partial
        });
        if index.entries.len() != before {
            write_json_atomic(&index_path, &index).await?;
        }

        info!(
            "Asset store opened at {:?} with {} entries",
            root,
            index.entries.len()
        );

        Ok(Self {
            root,
            index: RwLock::new(index),
            persist_lock: tokio::sync::Mutex::new(()),
            identity_locks: KeyedLocks::new(),
            downloader,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute_path(&self, entry: &CacheEntry) -> PathBuf {
        self.root.join(&entry.path)
    }

    pub async fn lookup(&self, identity: &AssetIdentity) -> Option<CacheEntry> {
        self.index.read().await.entries.get(&identity.key()).cloned()
    }

    /// A complete entry for `identity` whose checksum matches `checksum`
    /// and whose file is still present.
    pub async fn lookup_complete(
        &self,
        identity: &AssetIdentity,
        checksum: Option<&Checksum>,
    ) -> Option<CacheEntry> {
        let entry = self.lookup(identity).await?;
        if entry.satisfies(checksum) && self.absolute_path(&entry).is_file() {
            Some(entry)
        } else {
            None
        }
    }

    pub async fn entries(&self) -> Vec<CacheEntry> {
        self.index.read().await.entries.values().cloned().collect()
    }

    /// Bytes held by complete entries.
    pub async fn total_size(&self) -> u64 {
        self.index
            .read()
            .await
            .entries
            .values()
            .filter(|e| e.is_complete())
            .map(|e| e.size)
            .sum()
    }

    /// Materialize `request`, downloading only when no complete,
    /// checksum-valid entry exists.
    #[instrument(skip(self, request, cancel), fields(identity = %request.identity))]
    pub async fn acquire(
        &self,
        request: &AssetRequest,
        cancel: &CancelToken,
    ) -> EngineResult<CacheEntry> {
        let _guard = self.identity_locks.lock(&request.identity.key()).await;

        if let Some(hit) = self
            .lookup_complete(&request.identity, request.checksum.as_ref())
            .await
        {
            debug!("Cache hit for {}", request.identity);
            return self.touch(&hit.identity).await.map(|e| e.unwrap_or(hit));
        }

        let sources = prioritize_sources(&request.sources);
        if sources.is_empty() {
            return Err(EngineError::Other(format!(
                "No download source for {}",
                request.identity
            )));
        }

        let rel_path = request.identity.storage_dir().join(&request.filename);
        let final_path = self.root.join(&rel_path);
        let part_path = part_path_for(&final_path);

        self.upsert(CacheEntry::partial(
            request.identity.clone(),
            rel_path.clone(),
            request.checksum.clone(),
        ))
        .await?;

        let mut last_err: Option<EngineError> = None;
        let mut mismatched = false;
        for url in &sources {
            let guard = PartialFile::new(part_path.clone());
            match self
                .downloader
                .download_file(url, &part_path, request.checksum.as_ref(), cancel)
                .await
            {
                Ok(outcome) => {
                    tokio::fs::rename(&part_path, &final_path)
                        .await
                        .map_err(|e| EngineError::io(&final_path, e))?;
                    guard.commit();

                    let mut entry = CacheEntry::partial(
                        request.identity.clone(),
                        rel_path.clone(),
                        Some(outcome.checksum),
                    );
                    entry.size = outcome.size;
                    entry.completeness = Completeness::Complete;
                    entry.source_url = Some(url.clone());
                    self.upsert(entry.clone()).await?;
                    info!("Cached {} ({} bytes) from {}", entry.identity, entry.size, url);
                    return Ok(entry);
                }
                Err(EngineError::Cancelled) => {
                    info!("Fetch of {} cancelled, entry left partial", request.identity);
                    return Err(EngineError::Cancelled);
                }
                Err(err @ EngineError::ChecksumMismatch { .. }) => {
                    warn!("Checksum mismatch from {}: {}", url, err);
                    mismatched = true;
                    last_err = Some(err);
                }
                Err(err) => {
                    warn!("Source {} failed for {}: {}", url, request.identity, err);
                    last_err = Some(err);
                }
            }
        }

        if mismatched {
            self.remove_entry(&request.identity).await?;
        }
        Err(last_err.unwrap_or_else(|| {
            EngineError::Other(format!("All sources failed for {}", request.identity))
        }))
    }

    /// Acquire several assets concurrently, preserving input order.
    pub async fn acquire_many(
        &self,
        requests: &[AssetRequest],
        cancel: &CancelToken,
    ) -> EngineResult<Vec<CacheEntry>> {
        stream::iter(requests.iter())
            .map(|request| self.acquire(request, cancel))
            .buffered(self.downloader.concurrency())
            .try_collect()
            .await
    }

    /// Record a use of `identity`; returns the refreshed entry.
    pub async fn touch(&self, identity: &AssetIdentity) -> EngineResult<Option<CacheEntry>> {
        let _persist = self.persist_lock.lock().await;
        let snapshot = {
            let mut index = self.index.write().await;
            match index.entries.get_mut(&identity.key()) {
                Some(entry) => entry.last_used = Utc::now(),
                None => return Ok(None),
            }
            index.clone()
        };
        write_json_atomic(&self.root.join(INDEX_FILE), &snapshot).await?;
        Ok(snapshot.entries.get(&identity.key()).cloned())
    }

    /// Explicitly evict an entry and its file.
    pub async fn remove(&self, identity: &AssetIdentity) -> EngineResult<()> {
        let _guard = self.identity_locks.lock(&identity.key()).await;
        self.remove_entry(identity).await
    }

    async fn remove_entry(&self, identity: &AssetIdentity) -> EngineResult<()> {
        let _persist = self.persist_lock.lock().await;
        let (removed, snapshot) = {
            let mut index = self.index.write().await;
            let removed = index.entries.remove(&identity.key());
            (removed, index.clone())
        };
        if let Some(entry) = removed {
            let path = self.absolute_path(&entry);
            if path.exists() {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| EngineError::io(&path, e))?;
            }
            debug!("Removed cache entry {}", entry.identity);
        }
        write_json_atomic(&self.root.join(INDEX_FILE), &snapshot).await
    }

    async fn upsert(&self, entry: CacheEntry) -> EngineResult<()> {
        let _persist = self.persist_lock.lock().await;
        let snapshot = {
            let mut index = self.index.write().await;
            if let Some(existing) = index.entries.get(&entry.identity.key()) {
                let mut entry = entry;
                entry.created_at = existing.created_at;
                index.entries.insert(entry.identity.key(), entry);
            } else {
                index.entries.insert(entry.identity.key(), entry);
            }
            index.clone()
        };
        write_json_atomic(&self.root.join(INDEX_FILE), &snapshot).await
    }
}

/// Scoped ownership of an in-progress download file.
///
/// Removes the file on drop unless [`PartialFile::commit`] was called, so
/// every early return, error or cancellation cleans up after itself.
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            committed: false,
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(source) = std::fs::remove_file(&self.path) {
            if source.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove partial file {:?}: {}", self.path, source);
            }
        }
    }
}

fn part_path_for(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    final_path.with_file_name(format!("{name}.part"))
}

/// Stable order with restricted hosts moved to the end.
pub fn prioritize_sources(urls: &[String]) -> Vec<String> {
    let (restricted, open): (Vec<String>, Vec<String>) =
        urls.iter().cloned().partition(|u| is_restricted(u));
    open.into_iter().chain(restricted).collect()
}

fn is_restricted(url: &str) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    RESTRICTED_DOMAINS.iter().any(|d| host.ends_with(d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::downloader::testing::MemoryTransport;
    use crate::core::retry::RetryPolicy;
    use std::time::Duration;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    async fn store_with(transport: Arc<MemoryTransport>, root: &Path) -> AssetStore {
        let downloader = Arc::new(Downloader::new(transport, RetryPolicy::none()));
        AssetStore::open(root.to_path_buf(), downloader).await.unwrap()
    }

    fn hello_request(urls: &[&str]) -> AssetRequest {
        AssetRequest::for_download(
            "hello",
            urls.iter().map(|u| u.to_string()).collect(),
            Some(Checksum::parse(HELLO_SHA256).unwrap()),
            Some("hello.txt".into()),
            None,
        )
    }

    #[test]
    fn restricted_sources_go_last() {
        let urls = vec![
            "https://archive.org/download/x.zip".to_string(),
            "https://cdn.test/x.zip".to_string(),
            "https://ia800.us.archive.org/x.zip".to_string(),
        ];
        assert_eq!(
            prioritize_sources(&urls),
            vec![
                "https://cdn.test/x.zip".to_string(),
                "https://archive.org/download/x.zip".to_string(),
                "https://ia800.us.archive.org/x.zip".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn second_acquire_is_a_cache_hit() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.serve("https://cdn.test/hello", b"hello");
        let store = store_with(transport.clone(), dir.path()).await;
        let cancel = CancelToken::new();

        let first = store
            .acquire(&hello_request(&["https://cdn.test/hello"]), &cancel)
            .await
            .unwrap();
        assert!(first.is_complete());
        let second = store
            .acquire(&hello_request(&["https://cdn.test/hello"]), &cancel)
            .await
            .unwrap();

        assert_eq!(transport.calls(), 1);
        assert_eq!(second.path, first.path);
        assert!(store.identity_locks.is_empty());
        assert_eq!(
            std::fs::read(store.absolute_path(&second)).unwrap(),
            b"hello"
        );
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.serve("https://cdn.test/hello", b"hello");
        {
            let store = store_with(transport.clone(), dir.path()).await;
            store
                .acquire(&hello_request(&["https://cdn.test/hello"]), &CancelToken::new())
                .await
                .unwrap();
        }

        let reopened = store_with(transport.clone(), dir.path()).await;
        let req = hello_request(&["https://cdn.test/hello"]);
        let hit = reopened
            .lookup_complete(&req.identity, req.checksum.as_ref())
            .await;
        assert!(hit.is_some());
        assert_eq!(reopened.total_size().await, 5);
    }

    #[tokio::test]
    async fn mismatching_source_falls_through_to_next_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.serve("https://bad.test/hello", b"tampered");
        transport.serve("https://good.test/hello", b"hello");
        let store = store_with(transport.clone(), dir.path()).await;

        let entry = store
            .acquire(
                &hello_request(&["https://bad.test/hello", "https://good.test/hello"]),
                &CancelToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(entry.source_url.as_deref(), Some("https://good.test/hello"));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn checksum_mismatch_discards_entry() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.serve("https://bad.test/hello", b"tampered");
        let store = store_with(transport, dir.path()).await;

        let req = hello_request(&["https://bad.test/hello"]);
        let err = store.acquire(&req, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::ChecksumMismatch { .. }));
        assert!(store.lookup(&req.identity).await.is_none());
        let stray = part_path_for(&dir.path().join(req.identity.storage_dir()).join("hello.txt"));
        assert!(!stray.exists());
    }

    #[tokio::test]
    async fn cancelled_fetch_leaves_partial_entry_and_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::slow(Duration::from_secs(5)));
        transport.serve("https://cdn.test/hello", b"hello");
        let store = store_with(transport, dir.path()).await;
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let req = hello_request(&["https://cdn.test/hello"]);
        let err = store.acquire(&req, &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));

        let entry = store.lookup(&req.identity).await.unwrap();
        assert_eq!(entry.completeness, Completeness::Partial);
        assert!(store
            .lookup_complete(&req.identity, req.checksum.as_ref())
            .await
            .is_none());
        assert!(!store.absolute_path(&entry).exists());
    }

    #[tokio::test]
    async fn acquire_many_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.serve("https://cdn.test/a.bin", b"aaa");
        transport.serve("https://cdn.test/b.bin", b"bbbb");
        let store = store_with(transport, dir.path()).await;

        let requests = vec![
            AssetRequest::for_download("a", vec!["https://cdn.test/a.bin".into()], None, None, None),
            AssetRequest::for_download("b", vec!["https://cdn.test/b.bin".into()], None, None, None),
        ];
        let entries = store
            .acquire_many(&requests, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(entries[0].size, 3);
        assert_eq!(entries[1].size, 4);
        assert_eq!(store.total_size().await, 7);
    }

    #[tokio::test]
    async fn remove_evicts_file_and_entry() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        transport.serve("https://cdn.test/hello", b"hello");
        let store = store_with(transport, dir.path()).await;
        let req = hello_request(&["https://cdn.test/hello"]);
        let entry = store.acquire(&req, &CancelToken::new()).await.unwrap();

        store.remove(&req.identity).await.unwrap();
        assert!(store.lookup(&req.identity).await.is_none());
        assert!(!store.absolute_path(&entry).exists());
    }
}
