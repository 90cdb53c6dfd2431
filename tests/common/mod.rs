#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use waystone::core::cancel::CancelToken;
use waystone::core::downloader::{Checksum, Transport};
use waystone::core::error::{EngineError, EngineResult};
use waystone::core::retry::RetryPolicy;
use waystone::core::runtime::{Arch, GpuVendor, HostProfile, OsKind};
use waystone::core::sync::{
    GameEntryDelta, LibraryService, PushAck, PushReport, RemoteGameRecord, ServiceCapabilities,
};
use waystone::core::version::{Component, PublicationSource};
use waystone::{Engine, EngineConfig};

/// Serves fixed payloads by URL and counts every request.
#[derive(Default)]
pub struct FakeCdn {
    payloads: Mutex<HashMap<String, Vec<u8>>>,
    calls: AtomicUsize,
    /// Cancelled right after the next successful transfer.
    crash_after_next: Mutex<Option<CancelToken>>,
}

impl FakeCdn {
    pub fn serve(&self, url: &str, bytes: Vec<u8>) {
        self.payloads.lock().unwrap().insert(url.to_string(), bytes);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn crash_after_next(&self, token: CancelToken) {
        *self.crash_after_next.lock().unwrap() = Some(token);
    }
}

#[async_trait]
impl Transport for FakeCdn {
    async fn fetch(&self, url: &str, dest: &Path) -> EngineResult<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bytes = self.payloads.lock().unwrap().get(url).cloned();
        let Some(bytes) = bytes else {
            return Err(EngineError::DownloadFailed {
                url: url.to_string(),
                status: 404,
            });
        };
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| EngineError::io(dest, e))?;
        if let Some(token) = self.crash_after_next.lock().unwrap().take() {
            token.cancel();
        }
        Ok(bytes.len() as u64)
    }
}

/// Component listings that can be taken offline.
#[derive(Default)]
pub struct FakeIndex {
    listings: Mutex<HashMap<String, Vec<Component>>>,
    offline: AtomicBool,
}

impl FakeIndex {
    pub fn publish(&self, component: Component) {
        self.listings
            .lock()
            .unwrap()
            .entry(component.family.clone())
            .or_default()
            .push(component);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait]
impl PublicationSource for FakeIndex {
    async fn list_components(&self, family: &str) -> EngineResult<Vec<Component>> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(EngineError::Network {
                url: format!("index://{family}"),
                message: "connection refused".into(),
            });
        }
        Ok(self
            .listings
            .lock()
            .unwrap()
            .get(family)
            .cloned()
            .unwrap_or_default())
    }
}

/// A library service holding records in memory.
pub struct FakeLibrary {
    name: String,
    caps: ServiceCapabilities,
    records: Mutex<Vec<RemoteGameRecord>>,
    pushed: Mutex<Vec<GameEntryDelta>>,
    pulls: AtomicUsize,
    flaky_pulls: AtomicUsize,
    gate: Mutex<Option<Arc<tokio::sync::Notify>>>,
}

impl FakeLibrary {
    pub fn new(name: &str, caps: ServiceCapabilities) -> Self {
        Self {
            name: name.to_string(),
            caps,
            records: Mutex::new(Vec::new()),
            pushed: Mutex::new(Vec::new()),
            pulls: AtomicUsize::new(0),
            flaky_pulls: AtomicUsize::new(0),
            gate: Mutex::new(None),
        }
    }

    /// The next `count` pulls fail with a transient network error.
    pub fn fail_next_pulls(&self, count: usize) {
        self.flaky_pulls.store(count, Ordering::SeqCst);
    }

    /// The next pull waits until the returned handle is notified.
    pub fn hold_next_pull(&self) -> Arc<tokio::sync::Notify> {
        let gate = Arc::new(tokio::sync::Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn publish(&self, record: RemoteGameRecord) {
        let mut records = self.records.lock().unwrap();
        records.retain(|r| r.external_id != record.external_id);
        records.push(record);
    }

    pub fn pushed(&self) -> Vec<GameEntryDelta> {
        self.pushed.lock().unwrap().clone()
    }
}

#[async_trait]
impl LibraryService for FakeLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ServiceCapabilities {
        self.caps.clone()
    }

    async fn pull(&self, since: Option<DateTime<Utc>>) -> EngineResult<Vec<RemoteGameRecord>> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let flaky = self
            .flaky_pulls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if flaky {
            return Err(EngineError::Network {
                url: format!("https://{}.test/library", self.name),
                message: "connection reset".into(),
            });
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| since.map_or(true, |s| r.modified_at > s))
            .cloned()
            .collect())
    }

    async fn push(&self, deltas: Vec<GameEntryDelta>) -> EngineResult<PushReport> {
        let acks = deltas
            .iter()
            .map(|d| PushAck {
                local_id: d.local_id.clone(),
                external_id: Some(format!("{}:{}", self.name, d.local_id)),
            })
            .collect();
        self.pushed.lock().unwrap().extend(deltas);
        Ok(PushReport {
            acks,
            errors: Vec::new(),
        })
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub cdn: Arc<FakeCdn>,
    pub index: Arc<FakeIndex>,
    pub engine: Engine,
}

pub fn linux_host() -> HostProfile {
    HostProfile::new(OsKind::Linux, Arch::X86_64, vec![GpuVendor::Amd])
}

/// Engine over fakes in a scratch data directory.
pub async fn harness() -> Harness {
    harness_with_retry(RetryPolicy::none()).await
}

pub async fn harness_with_retry(retry: RetryPolicy) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::with_data_dir(dir.path().join("data"));
    config.retry = retry;
    config.index_ttl_secs = 0;
    let cdn = Arc::new(FakeCdn::default());
    let index = Arc::new(FakeIndex::default());
    let engine = Engine::with_parts(config, cdn.clone(), index.clone(), linux_host())
        .await
        .unwrap();
    Harness {
        dir,
        cdn,
        index,
        engine,
    }
}

pub fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, data) in files {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn component(family: &str, version: &str, payload: &[u8]) -> Component {
    Component {
        name: format!("{family}-build"),
        family: family.to_string(),
        version: version.to_string(),
        os: vec![OsKind::Linux],
        arch: vec![Arch::X86_64],
        gpu_vendors: vec![],
        url: format!("https://cdn.test/{family}-{version}.bin"),
        checksum: Checksum::parse(&format!("sha256:{}", sha256_hex(payload))).unwrap(),
        size: Some(payload.len() as u64),
    }
}
