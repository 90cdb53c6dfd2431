// ─── Runtime Resolver ───
// Picks the component build a requirement needs on this host and reports
// whether it is already materialized in the asset store.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::host::HostProfile;
use super::requirement::{Requirement, VersionConstraint};
use crate::core::assets::{AssetRequest, AssetStore, CacheEntry};
use crate::core::cancel::CancelToken;
use crate::core::error::{EngineResult, UnresolvedRequirementError};
use crate::core::version::{
    compare_versions, is_prerelease, versions_equal, Component, VersionIndexClient,
};

/// Outcome of resolving one requirement.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub component: Component,
    /// Complete cache entry for the component, if it is already downloaded.
    pub cached_entry: Option<CacheEntry>,
    /// The decision was made from a cached index because the source was down.
    pub stale: bool,
}

impl Resolution {
    pub fn is_cached(&self) -> bool {
        self.cached_entry.is_some()
    }
}

pub struct RuntimeResolver {
    index: Arc<VersionIndexClient>,
    assets: Arc<AssetStore>,
}

impl RuntimeResolver {
    pub fn new(index: Arc<VersionIndexClient>, assets: Arc<AssetStore>) -> Self {
        Self { index, assets }
    }

    #[instrument(skip(self, host), fields(requirement = %requirement))]
    pub async fn resolve(
        &self,
        requirement: &Requirement,
        host: &HostProfile,
    ) -> EngineResult<Resolution> {
        let snapshot = self
            .index
            .list_components(&requirement.family)
            .await
            .map_err(|e| {
                unresolved(
                    requirement,
                    format!("component index unreachable and nothing cached: {e}"),
                )
            })?;

        let compatible: Vec<&Component> = snapshot
            .components
            .iter()
            .filter(|c| c.family == requirement.family && c.supports(host))
            .collect();
        if compatible.is_empty() {
            return Err(unresolved(
                requirement,
                format!(
                    "no published component supports {}/{} (gpu: {:?})",
                    host.os, host.arch, host.gpu_vendors
                ),
            )
            .into());
        }

        let Some(component) = select_candidate(&compatible, &requirement.constraint) else {
            return Err(unresolved(
                requirement,
                format!(
                    "{} compatible versions, none satisfies the constraint",
                    compatible.len()
                ),
            )
            .into());
        };
        let component = component.clone();

        let cached_entry = self
            .assets
            .lookup_complete(&component.identity(), Some(&component.checksum))
            .await;

        info!(
            "Resolved {} to {} {} (cached: {}, stale index: {})",
            requirement,
            component.name,
            component.version,
            cached_entry.is_some(),
            snapshot.stale
        );

        Ok(Resolution {
            component,
            cached_entry,
            stale: snapshot.stale,
        })
    }

    /// Make sure the resolved component is in the asset store.
    pub async fn materialize(
        &self,
        resolution: &Resolution,
        cancel: &CancelToken,
    ) -> EngineResult<CacheEntry> {
        if let Some(entry) = &resolution.cached_entry {
            debug!("{} already cached", entry.identity);
            if let Some(fresh) = self
                .assets
                .lookup_complete(&entry.identity, entry.checksum.as_ref())
                .await
            {
                return Ok(fresh);
            }
        }
        self.assets
            .acquire(&AssetRequest::for_component(&resolution.component), cancel)
            .await
    }
}

/// Highest compatible version for `latest`/`minimum`, the matching one for
/// `exact`. Pre-releases are only picked by `latest`/`minimum` when no
/// final release qualifies.
pub fn select_candidate<'a>(
    candidates: &[&'a Component],
    constraint: &VersionConstraint,
) -> Option<&'a Component> {
    let highest = |filter: &dyn Fn(&Component) -> bool| {
        let pick = |stable_only: bool| {
            candidates
                .iter()
                .copied()
                .filter(|c| filter(c) && !(stable_only && is_prerelease(&c.version)))
                .max_by(|a, b| compare_versions(&a.version, &b.version))
        };
        pick(true).or_else(|| pick(false))
    };

    match constraint {
        VersionConstraint::Latest => highest(&|_| true),
        VersionConstraint::Exact(wanted) => highest(&|c| versions_equal(&c.version, wanted)),
        VersionConstraint::Minimum(floor) => {
            highest(&|c| compare_versions(&c.version, floor) != Ordering::Less)
        }
    }
}

fn unresolved(requirement: &Requirement, reason: String) -> UnresolvedRequirementError {
    UnresolvedRequirementError {
        family: requirement.family.clone(),
        constraint: requirement.constraint.to_string(),
        reason,
    }
}
