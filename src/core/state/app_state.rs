use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use super::config::EngineConfig;
use crate::core::assets::AssetStore;
use crate::core::cancel::CancelToken;
use crate::core::catalog::{CatalogStore, GameEntry};
use crate::core::downloader::{Downloader, HttpTransport, Transport};
use crate::core::error::EngineResult;
use crate::core::http::build_http_client;
use crate::core::installer::{InstallerInterpreter, Recipe};
use crate::core::runtime::{HostProfile, RuntimeResolver};
use crate::core::sync::{LibraryService, SyncEngine, SyncReport};
use crate::core::version::{HttpPublicationSource, PublicationSource, VersionIndexClient};

/// Every store and service of one data directory, wired from an
/// [`EngineConfig`].
pub struct Engine {
    pub config: EngineConfig,
    pub host: HostProfile,
    pub assets: Arc<AssetStore>,
    pub index: Arc<VersionIndexClient>,
    pub resolver: Arc<RuntimeResolver>,
    pub catalog: Arc<CatalogStore>,
    pub installer: InstallerInterpreter,
    pub sync: Arc<SyncEngine>,
}

impl Engine {
    /// Engine talking HTTP to the configured index, for the detected host.
    pub async fn open(config: EngineConfig) -> EngineResult<Self> {
        let client = build_http_client(&config)?;
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(client.clone()));
        let source: Arc<dyn PublicationSource> =
            Arc::new(HttpPublicationSource::new(client, config.index_url.clone()));
        Self::with_parts(config, transport, source, HostProfile::detect()).await
    }

    /// Engine over explicit network collaborators.
    pub async fn with_parts(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        source: Arc<dyn PublicationSource>,
        host: HostProfile,
    ) -> EngineResult<Self> {
        let downloader = Arc::new(
            Downloader::new(transport, config.retry.clone())
                .with_concurrency(config.download_concurrency),
        );
        let assets = Arc::new(AssetStore::open(config.cache_dir(), downloader).await?);
        let index = Arc::new(VersionIndexClient::from_config(&config, source));
        let resolver = Arc::new(RuntimeResolver::new(index.clone(), assets.clone()));
        let catalog = Arc::new(CatalogStore::open(config.catalog_dir()).await?);
        let installer = InstallerInterpreter::new(
            assets.clone(),
            resolver.clone(),
            catalog.clone(),
            config.journals_dir(),
            host.clone(),
        );
        let sync = Arc::new(SyncEngine::new(
            catalog.clone(),
            config.sync_state_path(),
            config.retry.clone(),
        ));

        info!(
            "Engine ready at {:?} (host {}/{})",
            config.data_dir, host.os, host.arch
        );
        Ok(Self {
            config,
            host,
            assets,
            index,
            resolver,
            catalog,
            installer,
            sync,
        })
    }

    pub async fn install(
        &self,
        recipe: &Recipe,
        target_root: &Path,
        cancel: &CancelToken,
    ) -> EngineResult<GameEntry> {
        self.installer.run(recipe, target_root, cancel).await
    }

    /// Mark a game as not installed, deleting its directory when asked.
    pub async fn uninstall(&self, game_id: &str, delete_files: bool) -> EngineResult<GameEntry> {
        self.installer.uninstall(game_id, delete_files).await
    }

    pub async fn register_service(&self, service: Arc<dyn LibraryService>) {
        self.sync.register(service).await;
    }

    pub async fn sync_now(&self) -> EngineResult<SyncReport> {
        self.sync.sync_all().await
    }

    /// Add a finished local play session to an entry.
    pub async fn record_session(&self, game_id: &str, secs: u64) -> EngineResult<GameEntry> {
        let ended_at = Utc::now();
        self.catalog
            .update(game_id, |entry| entry.add_playtime(secs, ended_at))
            .await
    }

    pub async fn set_hidden(&self, game_id: &str, hidden: bool) -> EngineResult<GameEntry> {
        let at = Utc::now();
        self.catalog
            .update(game_id, |entry| entry.set_hidden(hidden, at))
            .await
    }
}
