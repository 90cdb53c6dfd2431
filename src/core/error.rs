use std::path::PathBuf;

use thiserror::Error;

use crate::core::installer::StepKind;

/// Central error type for the whole engine.
/// Every module returns `Result<T, EngineError>`.
#[derive(Debug, Error)]
pub enum EngineError {
    // ── IO ──────────────────────────────────────────────
    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    // ── Network ─────────────────────────────────────────
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Download failed for {url}: HTTP {status}")]
    DownloadFailed { url: String, status: u16 },

    #[error("Network error for {url}: {message}")]
    Network { url: String, message: String },

    // ── Integrity ───────────────────────────────────────
    #[error("{algorithm} mismatch for {path:?}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        algorithm: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid checksum declaration: {0}")]
    InvalidChecksum(String),

    // ── Resolution ──────────────────────────────────────
    #[error(transparent)]
    Unresolved(#[from] UnresolvedRequirementError),

    // ── Installer ───────────────────────────────────────
    #[error(transparent)]
    Install(#[from] InstallError),

    #[error("Invalid recipe: {0}")]
    InvalidRecipe(String),

    #[error("Command {command} exited with status {code:?}")]
    CommandFailed { command: String, code: Option<i32> },

    #[error("Another install is already running for {0:?}")]
    Contention(PathBuf),

    #[error("Not enough disk space at {path:?}: available={available} required={required}")]
    InsufficientSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },

    #[error("Operation cancelled")]
    Cancelled,

    // ── Catalog ─────────────────────────────────────────
    #[error("Game not found: {0}")]
    GameNotFound(String),

    #[error("Game already exists: {0}")]
    GameAlreadyExists(String),

    // ── Sync ────────────────────────────────────────────
    #[error("Service {service} faulted: {message}")]
    ServiceFault { service: String, message: String },

    // ── JSON ────────────────────────────────────────────
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ── Archive ─────────────────────────────────────────
    #[error("Zip extraction error: {0}")]
    Zip(#[from] zip::result::ZipError),

    // ── Generic ─────────────────────────────────────────
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(source: std::io::Error) -> Self {
        EngineError::Io {
            path: PathBuf::new(),
            source,
        }
    }
}

impl EngineError {
    /// Shorthand for the very common `map_err(|source| Io { path, source })`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Transient failures are retried locally with backoff before surfacing.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Network { .. } => true,
            EngineError::Http(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err.is_request()
                    || err.is_body()
                    || err.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            EngineError::DownloadFailed { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// No compatible component satisfies a requirement on this host.
#[derive(Debug, Error)]
#[error("Unresolved requirement {family} ({constraint}): {reason}")]
pub struct UnresolvedRequirementError {
    pub family: String,
    pub constraint: String,
    pub reason: String,
}

/// A recipe step failed. Carries enough context to resume.
#[derive(Debug, Error)]
#[error("Install of {recipe_id} failed at step {step_index} ({step_kind}): {cause}")]
pub struct InstallError {
    pub recipe_id: String,
    pub step_index: usize,
    pub step_kind: StepKind,
    #[source]
    pub cause: Box<EngineError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_are_transient() {
        let err = EngineError::Network {
            url: "https://example.com/a.zip".into(),
            message: "connection reset".into(),
        };
        assert!(err.is_transient());
        assert!(EngineError::DownloadFailed {
            url: "u".into(),
            status: 503
        }
        .is_transient());
    }

    #[test]
    fn checksum_and_client_errors_are_fatal() {
        let err = EngineError::ChecksumMismatch {
            path: PathBuf::from("a.zip"),
            algorithm: "sha256".into(),
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(!err.is_transient());
        assert!(!EngineError::DownloadFailed {
            url: "u".into(),
            status: 404
        }
        .is_transient());
    }

    #[test]
    fn install_error_reports_step_context() {
        let err = InstallError {
            recipe_id: "quake".into(),
            step_index: 2,
            step_kind: StepKind::Extract,
            cause: Box::new(EngineError::Other("bad archive".into())),
        };
        assert_eq!(
            err.to_string(),
            "Install of quake failed at step 2 (extract): bad archive"
        );
    }
}
