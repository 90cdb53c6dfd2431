use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::downloader::Checksum;
use crate::core::fsio::sanitize_component;
use crate::core::version::Component;

/// Identity of a cached asset: `(name, version)`.
///
/// Components use their published name and version. Arbitrary recipe
/// downloads use the file name and, as version, the declared checksum (or a
/// digest of the URL when the recipe declares none).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetIdentity {
    pub name: String,
    pub version: String,
}

impl AssetIdentity {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Stable key used in the persisted index.
    pub fn key(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Relative directory for this identity inside the cache root.
    pub fn storage_dir(&self) -> PathBuf {
        PathBuf::from("objects")
            .join(sanitize_component(&self.name))
            .join(sanitize_component(&self.version))
    }
}

impl fmt::Display for AssetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Completeness {
    /// A transfer was started but never verified. Never handed out.
    Partial,
    /// Fully downloaded and checksum-verified.
    Complete,
}

/// Local materialization of a component or downloaded asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub identity: AssetIdentity,
    /// Path relative to the cache root.
    pub path: PathBuf,
    pub size: u64,
    /// Verified checksum once complete; the declared one while partial.
    pub checksum: Option<Checksum>,
    pub completeness: Completeness,
    pub source_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

impl CacheEntry {
    pub fn partial(identity: AssetIdentity, path: PathBuf, checksum: Option<Checksum>) -> Self {
        let now = Utc::now();
        Self {
            identity,
            path,
            size: 0,
            checksum,
            completeness: Completeness::Partial,
            source_url: None,
            created_at: now,
            last_used: now,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completeness == Completeness::Complete && self.checksum.is_some()
    }

    /// True when this entry can stand in for a request declaring `wanted`.
    pub fn satisfies(&self, wanted: Option<&Checksum>) -> bool {
        if !self.is_complete() {
            return false;
        }
        match wanted {
            None => true,
            Some(wanted) => self.checksum.as_ref() == Some(wanted),
        }
    }
}

/// What the caller wants materialized in the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetRequest {
    pub identity: AssetIdentity,
    /// Candidate URLs, tried in order after restricted hosts are moved last.
    pub sources: Vec<String>,
    pub checksum: Option<Checksum>,
    pub filename: String,
    pub size: Option<u64>,
}

impl AssetRequest {
    pub fn for_component(component: &Component) -> Self {
        Self {
            identity: component.identity(),
            sources: vec![component.url.clone()],
            checksum: Some(component.checksum.clone()),
            filename: file_name_from_url(&component.url)
                .unwrap_or_else(|| format!("{}-{}", component.name, component.version)),
            size: component.size,
        }
    }

    /// Request for an arbitrary recipe download.
    pub fn for_download(
        file_id: &str,
        sources: Vec<String>,
        checksum: Option<Checksum>,
        filename: Option<String>,
        size: Option<u64>,
    ) -> Self {
        let filename = filename
            .or_else(|| sources.first().and_then(|u| file_name_from_url(u)))
            .unwrap_or_else(|| file_id.to_string());
        let version = match &checksum {
            Some(c) => c.to_string(),
            None => {
                let first = sources.first().map(String::as_str).unwrap_or(file_id);
                let digest = hex::encode(Sha256::digest(first.as_bytes()));
                format!("url-{}", &digest[..16])
            }
        };
        Self {
            identity: AssetIdentity::new(filename.clone(), version),
            sources,
            checksum,
            filename,
            size,
        }
    }
}

/// Last path segment of a URL, without query string.
pub fn file_name_from_url(url: &str) -> Option<String> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && !s.contains(':'))
        .map(|s| s.to_string())
}
