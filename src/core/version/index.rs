// ─── Version Index Client ───
// Lists the components published for a family, caching each listing on
// disk so resolution keeps working offline.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::component::Component;
use crate::core::error::{EngineError, EngineResult};
use crate::core::fsio::{read_json_opt, sanitize_component, write_json_atomic};
use crate::core::http::build_http_client;
use crate::core::retry::RetryPolicy;
use crate::core::state::EngineConfig;

/// Remote publication endpoint for component listings.
#[async_trait]
pub trait PublicationSource: Send + Sync {
    async fn list_components(&self, family: &str) -> EngineResult<Vec<Component>>;
}

#[derive(Debug, Deserialize)]
struct ComponentListing {
    components: Vec<Component>,
}

/// Fetches `{base_url}/components/{family}.json`.
pub struct HttpPublicationSource {
    client: Client,
    base_url: String,
}

impl HttpPublicationSource {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> EngineResult<Self> {
        Ok(Self::new(build_http_client(config)?, config.index_url.clone()))
    }
}

#[async_trait]
impl PublicationSource for HttpPublicationSource {
    async fn list_components(&self, family: &str) -> EngineResult<Vec<Component>> {
        let url = format!("{}/components/{}.json", self.base_url, family);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Network {
                url: url.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::DownloadFailed {
                url,
                status: status.as_u16(),
            });
        }

        let listing: ComponentListing = response.json().await?;
        Ok(listing.components)
    }
}

/// One family's listing, with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSnapshot {
    pub family: String,
    pub components: Vec<Component>,
    pub fetched_at: DateTime<Utc>,
    /// Served from the on-disk cache because the source was unreachable.
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedListing {
    family: String,
    fetched_at: DateTime<Utc>,
    components: Vec<Component>,
}

pub struct VersionIndexClient {
    source: Arc<dyn PublicationSource>,
    cache_dir: PathBuf,
    ttl: Duration,
    retry: RetryPolicy,
}

impl VersionIndexClient {
    pub fn new(
        source: Arc<dyn PublicationSource>,
        cache_dir: PathBuf,
        ttl_secs: i64,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            cache_dir,
            ttl: Duration::seconds(ttl_secs.max(0)),
            retry,
        }
    }

    pub fn from_config(config: &EngineConfig, source: Arc<dyn PublicationSource>) -> Self {
        Self::new(
            source,
            config.index_dir(),
            config.index_ttl_secs,
            config.retry.clone(),
        )
    }

    /// Listing for `family`.
    ///
    /// A cached listing younger than the TTL is returned as is. Otherwise the
    /// source is queried; if it cannot be reached the last cached listing is
    /// returned flagged as stale. With no cache at all the source error is
    /// returned.
    #[instrument(skip(self))]
    pub async fn list_components(&self, family: &str) -> EngineResult<IndexSnapshot> {
        let cached = self.read_cache(family).await;

        if let Some(cached) = &cached {
            if Utc::now() - cached.fetched_at < self.ttl {
                debug!("Serving fresh cached index for {}", family);
                return Ok(snapshot(cached.clone(), false));
            }
        }

        match self.fetch_and_store(family).await {
            Ok(fresh) => Ok(fresh),
            Err(err) => match cached {
                Some(cached) => {
                    warn!(
                        "Index for {} unreachable, using cache from {}: {}",
                        family, cached.fetched_at, err
                    );
                    Ok(snapshot(cached, true))
                }
                None => Err(err),
            },
        }
    }

    /// Bypass the TTL and query the source.
    pub async fn refresh(&self, family: &str) -> EngineResult<IndexSnapshot> {
        self.fetch_and_store(family).await
    }

    async fn fetch_and_store(&self, family: &str) -> EngineResult<IndexSnapshot> {
        let components = self
            .retry
            .run(&format!("index {family}"), |_| self.source.list_components(family))
            .await?;

        let listing = CachedListing {
            family: family.to_string(),
            fetched_at: Utc::now(),
            components,
        };
        write_json_atomic(&self.cache_path(family), &listing).await?;
        info!(
            "Fetched {} components for family {}",
            listing.components.len(),
            family
        );
        Ok(snapshot(listing, false))
    }

    async fn read_cache(&self, family: &str) -> Option<CachedListing> {
        match read_json_opt::<CachedListing>(&self.cache_path(family)).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Ignoring unreadable index cache for {}: {}", family, e);
                None
            }
        }
    }

    fn cache_path(&self, family: &str) -> PathBuf {
        self.cache_dir
            .join(format!("{}.json", sanitize_component(family)))
    }
}

fn snapshot(listing: CachedListing, stale: bool) -> IndexSnapshot {
    IndexSnapshot {
        family: listing.family,
        components: listing.components,
        fetched_at: listing.fetched_at,
        stale,
    }
}
