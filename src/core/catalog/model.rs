use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const FAVORITE_CATEGORY: &str = "favorite";

/// Where an entry came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GameSource {
    /// Added by hand.
    Manual,
    /// Produced by running an install recipe.
    Installer,
    /// Imported from a remote library service.
    Service(String),
}

impl fmt::Display for GameSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameSource::Manual => f.write_str("manual"),
            GameSource::Installer => f.write_str("installer"),
            GameSource::Service(name) => f.write_str(name),
        }
    }
}

impl From<String> for GameSource {
    fn from(value: String) -> Self {
        match value.as_str() {
            "manual" | "" => GameSource::Manual,
            "installer" => GameSource::Installer,
            _ => GameSource::Service(value),
        }
    }
}

impl From<GameSource> for String {
    fn from(value: GameSource) -> Self {
        value.to_string()
    }
}

/// The recipe revision an entry was installed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeRef {
    pub id: String,
    pub version: u32,
}

/// One title in the user's library, persisted as `<catalog>/<id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameEntry {
    pub id: String,
    pub title: String,
    pub sort_title: String,
    /// Local-only; never taken from a remote service.
    #[serde(default)]
    pub install_path: Option<PathBuf>,
    #[serde(default)]
    pub runner: Option<String>,
    #[serde(default)]
    pub recipe: Option<RecipeRef>,
    pub source: GameSource,

    // ── Play data ──
    #[serde(default)]
    pub playtime_secs: u64,
    /// Last value each service reported, used to keep per-service playtime
    /// monotonic.
    #[serde(default)]
    pub service_playtime: BTreeMap<String, u64>,
    #[serde(default)]
    pub last_played: Option<DateTime<Utc>>,

    // ── Organisation ──
    #[serde(default)]
    pub categories: BTreeSet<String>,
    #[serde(default)]
    pub hidden: bool,
    pub hidden_changed_at: DateTime<Utc>,

    // ── Launch ──
    #[serde(default)]
    pub executable: Option<PathBuf>,
    #[serde(default)]
    pub launch: BTreeMap<String, serde_json::Value>,

    /// Service name -> that service's id for this title.
    #[serde(default)]
    pub external_ids: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl GameEntry {
    pub fn new(title: impl Into<String>, source: GameSource) -> Self {
        let title = title.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            sort_title: sort_title_for(&title),
            title,
            install_path: None,
            runner: None,
            recipe: None,
            source,
            playtime_secs: 0,
            service_playtime: BTreeMap::new(),
            last_played: None,
            categories: BTreeSet::new(),
            hidden: false,
            hidden_changed_at: now,
            executable: None,
            launch: BTreeMap::new(),
            external_ids: BTreeMap::new(),
            created_at: now,
            last_modified: now,
        }
    }

    pub fn is_installed(&self) -> bool {
        self.install_path.is_some()
    }

    pub fn is_favorite(&self) -> bool {
        self.categories.contains(FAVORITE_CATEGORY)
    }

    pub fn set_favorite(&mut self, favorite: bool) {
        if favorite {
            self.categories.insert(FAVORITE_CATEGORY.to_string());
        } else {
            self.categories.remove(FAVORITE_CATEGORY);
        }
    }

    pub fn set_hidden(&mut self, hidden: bool, at: DateTime<Utc>) {
        if self.hidden != hidden {
            self.hidden = hidden;
            self.hidden_changed_at = at;
        }
    }

    /// Record playtime from a local session.
    pub fn add_playtime(&mut self, secs: u64, ended_at: DateTime<Utc>) {
        self.playtime_secs = self.playtime_secs.saturating_add(secs);
        self.last_played = Some(self.last_played.map_or(ended_at, |p| p.max(ended_at)));
    }

    /// Apply a service-reported total. Lower values than the last report
    /// from the same service are ignored. Returns whether anything changed.
    pub fn observe_service_playtime(&mut self, service: &str, total_secs: u64) -> bool {
        let previous = self.service_playtime.get(service).copied().unwrap_or(0);
        if total_secs < previous {
            return false;
        }
        let mut changed = total_secs != previous;
        self.service_playtime.insert(service.to_string(), total_secs);
        if total_secs > self.playtime_secs {
            self.playtime_secs = total_secs;
            changed = true;
        }
        changed
    }

    pub fn external_id(&self, service: &str) -> Option<&str> {
        self.external_ids.get(service).map(String::as_str)
    }

    pub fn has_external_id(&self, external_id: &str) -> bool {
        self.external_ids.values().any(|id| id == external_id)
    }
}

/// Lowercased title without a leading article, for stable sorting.
pub fn sort_title_for(title: &str) -> String {
    let lower = title.trim().to_lowercase();
    for article in ["the ", "a ", "an "] {
        if let Some(rest) = lower.strip_prefix(article) {
            return rest.trim_start().to_string();
        }
    }
    lower
}
