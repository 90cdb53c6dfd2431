use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::catalog::GameEntry;
use crate::core::error::EngineResult;

/// Library fields a remote service may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncField {
    Title,
    Playtime,
    Categories,
    Hidden,
    LastPlayed,
}

/// What a service negotiated for this session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCapabilities {
    /// Whether `push` is accepted at all.
    pub push: bool,
    /// Fields the service understands; others are omitted from deltas and
    /// ignored in pulled records.
    pub fields: BTreeSet<SyncField>,
}

impl ServiceCapabilities {
    pub fn read_only(fields: impl IntoIterator<Item = SyncField>) -> Self {
        Self {
            push: false,
            fields: fields.into_iter().collect(),
        }
    }

    pub fn read_write(fields: impl IntoIterator<Item = SyncField>) -> Self {
        Self {
            push: true,
            fields: fields.into_iter().collect(),
        }
    }

    pub fn supports(&self, field: SyncField) -> bool {
        self.fields.contains(&field)
    }
}

/// One title as a service reports it. Absent fields are unknown, not empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteGameRecord {
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub playtime_secs: Option<u64>,
    #[serde(default)]
    pub categories: Option<BTreeSet<String>>,
    #[serde(default)]
    pub hidden: Option<bool>,
    /// When `hidden` last changed remotely; `modified_at` is used when absent.
    #[serde(default)]
    pub hidden_changed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_played: Option<DateTime<Utc>>,
    pub modified_at: DateTime<Utc>,
}

impl RemoteGameRecord {
    pub fn new(external_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            title: title.into(),
            playtime_secs: None,
            categories: None,
            hidden: None,
            hidden_changed_at: None,
            last_played: None,
            modified_at: Utc::now(),
        }
    }

    pub fn hidden_clock(&self) -> DateTime<Utc> {
        self.hidden_changed_at.unwrap_or(self.modified_at)
    }
}

/// Outbound change for one local entry. Fields the service does not
/// support are always `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameEntryDelta {
    pub local_id: String,
    /// `None` when the service has never seen this title.
    pub external_id: Option<String>,
    pub title: Option<String>,
    pub playtime_secs: Option<u64>,
    pub categories: Option<BTreeSet<String>>,
    pub hidden: Option<bool>,
    pub hidden_changed_at: Option<DateTime<Utc>>,
    pub last_played: Option<DateTime<Utc>>,
}

impl GameEntryDelta {
    pub fn for_entry(entry: &GameEntry, service: &str, caps: &ServiceCapabilities) -> Self {
        let hidden = caps.supports(SyncField::Hidden);
        Self {
            local_id: entry.id.clone(),
            external_id: entry.external_id(service).map(str::to_string),
            title: caps
                .supports(SyncField::Title)
                .then(|| entry.title.clone()),
            playtime_secs: caps
                .supports(SyncField::Playtime)
                .then_some(entry.playtime_secs),
            categories: caps
                .supports(SyncField::Categories)
                .then(|| entry.categories.clone()),
            hidden: hidden.then_some(entry.hidden),
            hidden_changed_at: hidden.then_some(entry.hidden_changed_at),
            last_played: if caps.supports(SyncField::LastPlayed) {
                entry.last_played
            } else {
                None
            },
        }
    }

    pub fn is_new(&self) -> bool {
        self.external_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    pub local_id: String,
    /// Id the service assigned, for titles it did not know before.
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushItemError {
    pub local_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReport {
    pub acks: Vec<PushAck>,
    pub errors: Vec<PushItemError>,
}

/// A remote library (storefront account, sync server).
#[async_trait]
pub trait LibraryService: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> ServiceCapabilities;

    /// Records changed after `since`, or everything when `None`.
    async fn pull(&self, since: Option<DateTime<Utc>>) -> EngineResult<Vec<RemoteGameRecord>>;

    /// Send local changes. An `Err` means the whole batch failed; per-title
    /// rejections go in [`PushReport::errors`].
    async fn push(&self, deltas: Vec<GameEntryDelta>) -> EngineResult<PushReport>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;
    use crate::core::error::EngineError;

    /// In-memory service double.
    pub struct MemoryService {
        name: String,
        caps: ServiceCapabilities,
        records: Mutex<Vec<RemoteGameRecord>>,
        pushed: Mutex<Vec<GameEntryDelta>>,
        pulls: Mutex<Vec<Option<DateTime<Utc>>>>,
        failing: Mutex<bool>,
        flaky_pulls: Mutex<u32>,
        next_id: Mutex<u32>,
    }

    impl MemoryService {
        pub fn new(name: &str, caps: ServiceCapabilities) -> Self {
            Self {
                name: name.to_string(),
                caps,
                records: Mutex::new(Vec::new()),
                pushed: Mutex::new(Vec::new()),
                pulls: Mutex::new(Vec::new()),
                failing: Mutex::new(false),
                flaky_pulls: Mutex::new(0),
                next_id: Mutex::new(1),
            }
        }

        pub fn publish(&self, record: RemoteGameRecord) {
            let mut records = self.records.lock().unwrap();
            records.retain(|r| r.external_id != record.external_id);
            records.push(record);
        }

        pub fn set_failing(&self, failing: bool) {
            *self.failing.lock().unwrap() = failing;
        }

        /// Fail the next `count` pulls with a transient error.
        pub fn fail_next_pulls(&self, count: u32) {
            *self.flaky_pulls.lock().unwrap() = count;
        }

        pub fn pushed(&self) -> Vec<GameEntryDelta> {
            self.pushed.lock().unwrap().clone()
        }

        pub fn pulls(&self) -> Vec<Option<DateTime<Utc>>> {
            self.pulls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LibraryService for MemoryService {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> ServiceCapabilities {
            self.caps.clone()
        }

        async fn pull(&self, since: Option<DateTime<Utc>>) -> EngineResult<Vec<RemoteGameRecord>> {
            self.pulls.lock().unwrap().push(since);
            let flaky = {
                let mut left = self.flaky_pulls.lock().unwrap();
                let fail = *left > 0;
                *left = left.saturating_sub(1);
                fail
            };
            if flaky || *self.failing.lock().unwrap() {
                return Err(EngineError::Network {
                    url: format!("memory://{}", self.name),
                    message: "unreachable".into(),
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
            let mut report = PushReport::default();
            for delta in deltas {
                let external_id = if delta.is_new() {
                    let mut next = self.next_id.lock().unwrap();
                    *next += 1;
                    Some(format!("{}-{}", self.name, *next - 1))
                } else {
                    None
                };
                report.acks.push(PushAck {
                    local_id: delta.local_id.clone(),
                    external_id,
                });
                self.pushed.lock().unwrap().push(delta);
            }
            Ok(report)
        }
    }
}
