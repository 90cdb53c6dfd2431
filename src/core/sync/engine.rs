// ─── Sync Engine ───
// Pulls every registered library service, merges the records into the
// catalog and pushes local changes back. A failing service is isolated:
// the others complete and only its cursor stays where it was.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::reconcile::{correlate, entry_from_remote, merge_remote, outbound_delta, Correlation};
use super::service::{LibraryService, PushItemError, RemoteGameRecord, ServiceCapabilities};
use crate::core::cancel::CancelToken;
use crate::core::catalog::{CatalogStore, GameEntry};
use crate::core::error::{EngineError, EngineResult};
use crate::core::fsio::{read_json_opt, write_json_atomic};
use crate::core::retry::RetryPolicy;

/// Where one service is in its sync cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPhase {
    Idle,
    FetchingRemote,
    Reconciling,
    ApplyingLocal,
    PushingRemote,
    /// The last cycle for this service failed; others are unaffected.
    Faulted(String),
}

/// Persisted per-service progress, `<data>/sync_state.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// Start of the last healthy pull, handed to the next one as `since`.
    #[serde(default)]
    pub cursors: BTreeMap<String, DateTime<Utc>>,
    /// End of the last healthy cycle; local edits after it are pushed.
    #[serde(default)]
    pub pushed_at: BTreeMap<String, DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSyncReport {
    pub service: String,
    pub pulled: usize,
    pub created: usize,
    pub updated: usize,
    pub pushed: usize,
    pub push_errors: Vec<PushItemError>,
    /// Set when the cycle faulted; the cursor was not advanced.
    pub fault: Option<String>,
}

impl ServiceSyncReport {
    fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            ..Default::default()
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.fault.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub services: Vec<ServiceSyncReport>,
}

impl SyncReport {
    pub fn service(&self, name: &str) -> Option<&ServiceSyncReport> {
        self.services.iter().find(|s| s.service == name)
    }

    pub fn faulted(&self) -> impl Iterator<Item = &ServiceSyncReport> {
        self.services.iter().filter(|s| !s.is_healthy())
    }
}

pub struct SyncEngine {
    catalog: Arc<CatalogStore>,
    state_path: PathBuf,
    retry: RetryPolicy,
    services: RwLock<Vec<Arc<dyn LibraryService>>>,
    phases: std::sync::Mutex<HashMap<String, SyncPhase>>,
    /// One cycle at a time.
    running: Mutex<()>,
}

impl SyncEngine {
    pub fn new(catalog: Arc<CatalogStore>, state_path: PathBuf, retry: RetryPolicy) -> Self {
        Self {
            catalog,
            state_path,
            retry,
            services: RwLock::new(Vec::new()),
            phases: std::sync::Mutex::new(HashMap::new()),
            running: Mutex::new(()),
        }
    }

    /// Add a service, replacing any previous one with the same name.
    pub async fn register(&self, service: Arc<dyn LibraryService>) {
        let mut services = self.services.write().await;
        services.retain(|s| s.name() != service.name());
        info!("Registered library service '{}'", service.name());
        self.set_phase(service.name(), SyncPhase::Idle);
        services.push(service);
    }

    pub async fn service_names(&self) -> Vec<String> {
        self.services
            .read()
            .await
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    pub fn phase(&self, service: &str) -> SyncPhase {
        self.lock_phases()
            .get(service)
            .cloned()
            .unwrap_or(SyncPhase::Idle)
    }

    pub async fn state(&self) -> EngineResult<SyncState> {
        Ok(read_json_opt::<SyncState>(&self.state_path)
            .await?
            .unwrap_or_default())
    }

    /// Run one cycle across every service. Pulls and pushes run concurrently;
    /// merging into the catalog goes service by service in registration order.
    #[instrument(skip(self))]
    pub async fn sync_all(&self) -> EngineResult<SyncReport> {
        let _running = self.running.lock().await;
        let services = self.services.read().await.clone();
        let mut state = self.state().await?;

        // FetchingRemote
        let pulls = join_all(services.iter().map(|service| {
            let since = state.cursors.get(service.name()).copied();
            let pushed_at = state.pushed_at.get(service.name()).copied();
            async move {
                let started = Utc::now();
                self.set_phase(service.name(), SyncPhase::FetchingRemote);
                let result = self
                    .retry
                    .run(&format!("pull from {}", service.name()), |_| service.pull(since))
                    .await;
                (started, pushed_at, result)
            }
        }))
        .await;

        // Reconciling + ApplyingLocal
        let mut cycles = Vec::with_capacity(services.len());
        for (service, (started, pushed_at, pulled)) in services.iter().zip(pulls) {
            let name = service.name();
            let mut report = ServiceSyncReport::new(name);
            let records = match pulled {
                Ok(records) => records,
                Err(e) => {
                    self.fault(name, &mut report, e);
                    cycles.push((service.clone(), report, started, pushed_at, None));
                    continue;
                }
            };
            report.pulled = records.len();
            let caps = service.capabilities();
            match self.apply_local(name, &caps, records, &mut report).await {
                Ok(seen) => cycles.push((service.clone(), report, started, pushed_at, Some(seen))),
                Err(e) => {
                    self.fault(name, &mut report, e);
                    cycles.push((service.clone(), report, started, pushed_at, None));
                }
            }
        }

        // PushingRemote
        let finished = join_all(cycles.into_iter().map(
            |(service, mut report, started, pushed_at, seen)| async move {
                if let Some(seen) = seen {
                    if let Err(e) = self.push_local(service.as_ref(), &seen, pushed_at, &mut report).await {
                        self.fault(service.name(), &mut report, e);
                    }
                }
                (report, started, Utc::now())
            },
        ))
        .await;

        let mut summary = SyncReport::default();
        for (report, started, ended) in finished {
            if report.is_healthy() {
                state.cursors.insert(report.service.clone(), started);
                state.pushed_at.insert(report.service.clone(), ended);
                self.set_phase(&report.service, SyncPhase::Idle);
            }
            summary.services.push(report);
        }
        write_json_atomic(&self.state_path, &state).await?;

        info!(
            "Sync finished: {} services, {} faulted",
            summary.services.len(),
            summary.faulted().count()
        );
        Ok(summary)
    }

    /// Run a full cycle and fail with [`EngineError::ServiceFault`] if
    /// `name` faulted.
    pub async fn sync_service(&self, name: &str) -> EngineResult<ServiceSyncReport> {
        let report = self.sync_all().await?;
        let Some(own) = report.service(name).cloned() else {
            return Err(EngineError::ServiceFault {
                service: name.to_string(),
                message: "service is not registered".into(),
            });
        };
        match own.fault.clone() {
            Some(message) => Err(EngineError::ServiceFault {
                service: name.to_string(),
                message,
            }),
            None => Ok(own),
        }
    }

    /// Sync every `interval` until `cancel` fires. Faults are logged, never fatal.
    pub fn spawn_periodic(self: Arc<Self>, interval: Duration, cancel: CancelToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match self.sync_all().await {
                    Ok(report) => {
                        for faulted in report.faulted() {
                            warn!(
                                "Periodic sync: '{}' faulted: {}",
                                faulted.service,
                                faulted.fault.as_deref().unwrap_or_default()
                            );
                        }
                    }
                    Err(e) => warn!("Periodic sync failed: {}", e),
                }
            }
            debug!("Periodic sync stopped");
        })
    }

    /// Merge pulled records into the catalog, one short transaction per
    /// entry. Returns the records keyed by the local id they landed on.
    async fn apply_local(
        &self,
        service: &str,
        caps: &ServiceCapabilities,
        records: Vec<RemoteGameRecord>,
        report: &mut ServiceSyncReport,
    ) -> EngineResult<HashMap<String, RemoteGameRecord>> {
        self.set_phase(service, SyncPhase::Reconciling);
        let local = self.catalog.list().await;
        let plan = correlate(service, &local, records);
        self.apply_plan(service, caps, plan, report).await
    }

    async fn apply_plan(
        &self,
        service: &str,
        caps: &ServiceCapabilities,
        plan: Vec<Correlation>,
        report: &mut ServiceSyncReport,
    ) -> EngineResult<HashMap<String, RemoteGameRecord>> {
        self.set_phase(service, SyncPhase::ApplyingLocal);
        let mut seen = HashMap::with_capacity(plan.len());
        for correlation in plan {
            match correlation {
                Correlation::Existing { local_id, record } => {
                    let mut changed = false;
                    let merged = self
                        .catalog
                        .update(&local_id, |entry| {
                            changed = merge_remote(entry, service, &record, caps);
                        })
                        .await;
                    if skip_vanished(merged, service, &local_id)?.is_none() {
                        continue;
                    }
                    if changed {
                        report.updated += 1;
                    }
                    seen.insert(local_id, record);
                }
                Correlation::New(record) => {
                    let entry = entry_from_remote(service, &record, caps);
                    debug!("New title '{}' from {}", entry.title, service);
                    let entry = self.catalog.insert(entry).await?;
                    report.created += 1;
                    seen.insert(entry.id, record);
                }
            }
        }
        Ok(seen)
    }

    async fn push_local(
        &self,
        service: &dyn LibraryService,
        seen: &HashMap<String, RemoteGameRecord>,
        since: Option<DateTime<Utc>>,
        report: &mut ServiceSyncReport,
    ) -> EngineResult<()> {
        let caps = service.capabilities();
        if !caps.push {
            return Ok(());
        }
        let name = service.name();
        self.set_phase(name, SyncPhase::PushingRemote);

        let deltas: Vec<_> = self
            .catalog
            .list()
            .await
            .iter()
            .filter_map(|entry| outbound_delta(entry, name, seen.get(&entry.id), &caps, since))
            .collect();
        if deltas.is_empty() {
            return Ok(());
        }

        debug!("Pushing {} changes to {}", deltas.len(), name);
        let pushed = self
            .retry
            .run(&format!("push to {}", name), |_| service.push(deltas.clone()))
            .await?;
        for ack in &pushed.acks {
            if let Some(external_id) = &ack.external_id {
                let external_id = external_id.clone();
                let recorded = self
                    .catalog
                    .update(&ack.local_id, |entry| {
                        entry.external_ids.insert(name.to_string(), external_id);
                    })
                    .await;
                skip_vanished(recorded, name, &ack.local_id)?;
            }
        }
        for error in &pushed.errors {
            warn!("{} rejected {}: {}", name, error.local_id, error.message);
        }
        report.pushed = pushed.acks.len();
        report.push_errors = pushed.errors;
        Ok(())
    }

    fn fault(&self, service: &str, report: &mut ServiceSyncReport, error: EngineError) {
        warn!("Library service '{}' faulted: {}", service, error);
        report.fault = Some(error.to_string());
        self.set_phase(service, SyncPhase::Faulted(service.to_string()));
    }

    fn set_phase(&self, service: &str, phase: SyncPhase) {
        self.lock_phases().insert(service.to_string(), phase);
    }

    fn lock_phases(&self) -> std::sync::MutexGuard<'_, HashMap<String, SyncPhase>> {
        match self.phases.lock() {
            Ok(phases) => phases,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// An entry removed locally while a cycle runs is skipped, not fatal.
fn skip_vanished(
    result: EngineResult<GameEntry>,
    service: &str,
    local_id: &str,
) -> EngineResult<Option<GameEntry>> {
    match result {
        Ok(entry) => Ok(Some(entry)),
        Err(EngineError::GameNotFound(_)) => {
            warn!("{}: entry {} was removed during sync, skipping", service, local_id);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
