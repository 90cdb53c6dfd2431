use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::error::{EngineError, EngineResult};
use crate::core::fsio::write_json_atomic;
use crate::core::retry::RetryPolicy;

const APP_DIR_NAME: &str = "Waystone";
const BOOTSTRAP_FILE: &str = "waystone_bootstrap.json";
const SETTINGS_FILE: &str = "engine_settings.json";
const DEFAULT_INDEX_URL: &str = "https://index.waystone.invalid/v1";

/// Explicit engine configuration, threaded through every store constructor.
///
/// Persisted as `engine_settings.json` inside the data directory. Missing
/// fields fall back to their defaults so older settings files keep loading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    /// Overrides `<data_dir>/cache` when set.
    pub cache_dir: Option<PathBuf>,
    pub index_url: String,
    /// How long a fetched component index is served without asking the network.
    pub index_ttl_secs: i64,
    pub retry: RetryPolicy,
    pub download_concurrency: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BootstrapConfig {
    data_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::with_data_dir(default_data_dir())
    }
}

impl EngineConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            cache_dir: None,
            index_url: DEFAULT_INDEX_URL.to_string(),
            index_ttl_secs: 60 * 30,
            retry: RetryPolicy::default(),
            download_concurrency: 4,
            user_agent: format!("Waystone/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 120,
        }
    }

    /// Load settings from `<data_dir>/engine_settings.json`, falling back to
    /// defaults when the file is missing or unreadable.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join(SETTINGS_FILE);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Self::with_data_dir(data_dir),
        };
        match serde_json::from_str::<EngineConfig>(&raw) {
            Ok(mut cfg) => {
                cfg.data_dir = data_dir.to_path_buf();
                cfg
            }
            Err(e) => {
                warn!("Corrupt settings at {:?}, using defaults: {}", path, e);
                Self::with_data_dir(data_dir)
            }
        }
    }

    /// Load from the platform default location (or the bootstrap override).
    pub fn load_default() -> Self {
        Self::load(&data_dir_from(&default_base_dir()))
    }

    pub async fn save(&self) -> EngineResult<()> {
        write_json_atomic(&self.data_dir.join(SETTINGS_FILE), self).await
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("cache"))
    }

    pub fn catalog_dir(&self) -> PathBuf {
        self.data_dir.join("catalog")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir.join("index")
    }

    pub fn journals_dir(&self) -> PathBuf {
        self.data_dir.join("journals")
    }

    pub fn sync_state_path(&self) -> PathBuf {
        self.data_dir.join("sync_state.json")
    }

    /// Copy the data directory to `target_dir` and remember the choice in
    /// the bootstrap file. Run it before opening an [`Engine`](super::Engine)
    /// on this config; the old directory is left untouched.
    pub async fn relocate(&mut self, target_dir: PathBuf) -> EngineResult<PathBuf> {
        self.relocate_with_bootstrap(target_dir, &default_base_dir()).await
    }

    async fn relocate_with_bootstrap(
        &mut self,
        target_dir: PathBuf,
        bootstrap_base: &Path,
    ) -> EngineResult<PathBuf> {
        let destination = if target_dir
            .file_name()
            .map(|n| n.to_string_lossy() == APP_DIR_NAME)
            .unwrap_or(false)
        {
            target_dir
        } else {
            target_dir.join(APP_DIR_NAME)
        };

        if destination == self.data_dir {
            return Ok(destination);
        }
        if destination.starts_with(&self.data_dir) {
            return Err(EngineError::Other(format!(
                "Cannot move data into its own subdirectory {}",
                destination.display()
            )));
        }

        let (source, target) = (self.data_dir.clone(), destination.clone());
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&target).map_err(|e| EngineError::io(&target, e))?;
            if source.is_dir() {
                copy_dir_recursive(&source, &target)?;
            }
            Ok::<_, EngineError>(())
        })
        .await
        .map_err(|e| EngineError::Other(format!("Task join error: {e}")))??;

        let bootstrap = BootstrapConfig {
            data_dir: destination.clone(),
        };
        write_json_atomic(&bootstrap_path(bootstrap_base), &bootstrap).await?;

        info!("Data directory moved from {:?} to {:?}", self.data_dir, destination);
        self.data_dir = destination.clone();
        self.save().await?;
        Ok(destination)
    }
}

/// Copy the tree at `source` over `destination`, replacing files.
fn copy_dir_recursive(source: &Path, destination: &Path) -> EngineResult<()> {
    let entries = std::fs::read_dir(source).map_err(|e| EngineError::io(source, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| EngineError::io(source, e))?;
        let src_path = entry.path();
        let dst_path = destination.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| EngineError::io(&src_path, e))?;

        if file_type.is_dir() {
            std::fs::create_dir_all(&dst_path).map_err(|e| EngineError::io(&dst_path, e))?;
            copy_dir_recursive(&src_path, &dst_path)?;
        } else if file_type.is_file() {
            std::fs::copy(&src_path, &dst_path).map_err(|e| EngineError::io(&dst_path, e))?;
        }
    }
    Ok(())
}

fn bootstrap_path(base: &Path) -> PathBuf {
    base.join(BOOTSTRAP_FILE)
}

fn default_base_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_data_dir() -> PathBuf {
    data_dir_from(&default_base_dir())
}

/// The bootstrap override under `base`, or `<base>/Waystone`.
fn data_dir_from(base: &Path) -> PathBuf {
    if let Ok(raw) = std::fs::read_to_string(bootstrap_path(base)) {
        if let Ok(cfg) = serde_json::from_str::<BootstrapConfig>(&raw) {
            return cfg.data_dir;
        }
    }

    base.join(APP_DIR_NAME)
}
