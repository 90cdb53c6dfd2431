use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::recipe::Recipe;
use crate::core::error::{EngineError, EngineResult};
use crate::core::fsio::{read_json_opt, write_json_atomic};

/// Progress of one recipe against one target directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallJournal {
    pub recipe_id: String,
    pub fingerprint: String,
    pub target: PathBuf,
    /// Indices of target-mutating steps that finished.
    pub completed: BTreeSet<usize>,
    pub updated_at: DateTime<Utc>,
}

impl InstallJournal {
    fn fresh(recipe: &Recipe, target: &Path) -> Self {
        Self {
            recipe_id: recipe.id.clone(),
            fingerprint: recipe.fingerprint(),
            target: target.to_path_buf(),
            completed: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn is_done(&self, step_index: usize) -> bool {
        self.completed.contains(&step_index)
    }
}

/// Journals live under `<data>/journals`, one file per target path.
pub struct JournalStore {
    dir: PathBuf,
}

impl JournalStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Journal for `recipe` on `target`. A journal written by a different
    /// revision of the recipe is discarded.
    pub async fn load(&self, recipe: &Recipe, target: &Path) -> EngineResult<InstallJournal> {
        let path = self.path_for(target);
        let existing = match read_json_opt::<InstallJournal>(&path).await {
            Ok(existing) => existing,
            Err(EngineError::Json(e)) => {
                info!("Discarding unreadable journal {:?}: {}", path, e);
                None
            }
            Err(e) => return Err(e),
        };

        match existing {
            Some(journal) if journal.fingerprint == recipe.fingerprint() => {
                debug!(
                    "Resuming {} with {} completed steps",
                    recipe.id,
                    journal.completed.len()
                );
                Ok(journal)
            }
            Some(_) => {
                info!("Recipe {} changed since last attempt, starting over", recipe.id);
                Ok(InstallJournal::fresh(recipe, target))
            }
            None => Ok(InstallJournal::fresh(recipe, target)),
        }
    }

    pub async fn mark_done(&self, journal: &mut InstallJournal, step_index: usize) -> EngineResult<()> {
        journal.completed.insert(step_index);
        journal.updated_at = Utc::now();
        write_json_atomic(&self.path_for(&journal.target), journal).await
    }

    pub async fn clear(&self, target: &Path) -> EngineResult<()> {
        let path = self.path_for(target);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::io(path, e)),
        }
    }

    pub async fn exists(&self, target: &Path) -> bool {
        tokio::fs::try_exists(self.path_for(target))
            .await
            .unwrap_or(false)
    }

    fn path_for(&self, target: &Path) -> PathBuf {
        let digest = hex::encode(Sha256::digest(target.to_string_lossy().as_bytes()));
        self.dir.join(format!("{}.json", &digest[..24]))
    }
}
