use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::checksum::Checksum;
use crate::core::cancel::CancelToken;
use crate::core::error::{EngineError, EngineResult};
use crate::core::http::build_http_client;
use crate::core::retry::RetryPolicy;
use crate::core::state::EngineConfig;

/// Moves the bytes behind a URL into a local file.
///
/// Implementations must be resumable: when `dest` already holds a prefix of
/// the content they may append to it, otherwise they truncate it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns the final size of `dest` in bytes.
    async fn fetch(&self, url: &str, dest: &Path) -> EngineResult<u64>;
}

/// reqwest-backed transport with HTTP Range resume and `file://` support.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn fetch_local(&self, url: &str, source: &Path, dest: &Path) -> EngineResult<u64> {
        if !source.is_file() {
            return Err(EngineError::DownloadFailed {
                url: url.to_string(),
                status: 404,
            });
        }
        tokio::fs::copy(source, dest)
            .await
            .map_err(|e| EngineError::io(dest, e))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &str, dest: &Path) -> EngineResult<u64> {
        if let Some(local) = url.strip_prefix("file://") {
            return self.fetch_local(url, Path::new(local), dest).await;
        }

        let start_offset = tokio::fs::metadata(dest)
            .await
            .map(|m| m.len())
            .unwrap_or_default();

        let mut request = self.client.get(url);
        if start_offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={start_offset}-"));
        }

        let response = request.send().await.map_err(|e| EngineError::Network {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::DownloadFailed {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let resuming = start_offset > 0 && status.as_u16() == 206;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(resuming)
            .truncate(!resuming)
            .open(dest)
            .await
            .map_err(|e| EngineError::io(dest, e))?;

        let mut written = if resuming { start_offset } else { 0 };
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| EngineError::Network {
                url: url.to_string(),
                message: e.to_string(),
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|e| EngineError::io(dest, e))?;
            written = written.saturating_add(chunk.len() as u64);
        }
        file.flush().await.map_err(|e| EngineError::io(dest, e))?;

        Ok(written)
    }
}

/// A completed, verified download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub size: u64,
    /// The verified checksum: the declared one, or the sha256 computed here
    /// when none was declared.
    pub checksum: Checksum,
}

/// Retrying, cancellable, checksum-validating downloader.
pub struct Downloader {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    /// Maximum number of parallel downloads for batch callers.
    concurrency: usize,
}

impl Downloader {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            retry,
            concurrency: 4,
        }
    }

    /// Downloader over a real HTTP client built from `config`.
    pub fn from_config(config: &EngineConfig) -> EngineResult<Self> {
        let client = build_http_client(config)?;
        Ok(Self::new(Arc::new(HttpTransport::new(client)), config.retry.clone())
            .with_concurrency(config.download_concurrency))
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Download `url` to `dest` and verify it against `expected`.
    ///
    /// Transient failures are retried with backoff. Cancellation aborts the
    /// in-flight transfer and leaves whatever was written in place for the
    /// caller's guard to clean up.
    pub async fn download_file(
        &self,
        url: &str,
        dest: &Path,
        expected: Option<&Checksum>,
        cancel: &CancelToken,
    ) -> EngineResult<DownloadOutcome> {
        cancel.check()?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::io(parent, e))?;
        }

        let transfer = self
            .retry
            .run(url, |_| self.transport.fetch(url, dest));

        let size = tokio::select! {
            result = transfer => result?,
            _ = cancel.cancelled() => {
                info!("Download cancelled: {}", url);
                return Err(EngineError::Cancelled);
            }
        };

        let dest_owned = dest.to_path_buf();
        let expected_owned = expected.cloned();
        let checksum = tokio::task::spawn_blocking(move || -> EngineResult<Checksum> {
            match expected_owned {
                Some(expected) => {
                    expected.verify_file(&dest_owned)?;
                    Ok(expected)
                }
                None => Checksum::sha256_of(&dest_owned),
            }
        })
        .await
        .map_err(|e| EngineError::Other(format!("Task join error: {e}")))??;

        debug!("Downloaded: {} -> {:?} ({} bytes)", url, dest, size);
        Ok(DownloadOutcome {
            path: dest.to_path_buf(),
            size,
            checksum,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// In-memory transport that serves fixed payloads and counts requests.
    #[derive(Default)]
    pub struct MemoryTransport {
        payloads: Mutex<HashMap<String, Vec<u8>>>,
        failures: Mutex<HashMap<String, usize>>,
        pub calls: AtomicUsize,
        delay: Option<std::time::Duration>,
    }

    impl MemoryTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn slow(delay: std::time::Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        pub fn serve(&self, url: &str, bytes: &[u8]) {
            self.payloads
                .lock()
                .unwrap()
                .insert(url.to_string(), bytes.to_vec());
        }

        /// Fail the next `n` requests for `url` with a transient error.
        pub fn fail_times(&self, url: &str, n: usize) {
            self.failures.lock().unwrap().insert(url.to_string(), n);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn fetch(&self, url: &str, dest: &Path) -> EngineResult<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            {
                let mut failures = self.failures.lock().unwrap();
                if let Some(left) = failures.get_mut(url) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(EngineError::Network {
                            url: url.to_string(),
                            message: "simulated reset".into(),
                        });
                    }
                }
            }
            let bytes = self.payloads.lock().unwrap().get(url).cloned();
            match bytes {
                Some(bytes) => {
                    tokio::fs::write(dest, &bytes)
                        .await
                        .map_err(|e| EngineError::io(dest, e))?;
                    Ok(bytes.len() as u64)
                }
                None => Err(EngineError::DownloadFailed {
                    url: url.to_string(),
                    status: 404,
                }),
            }
        }
    }
}
