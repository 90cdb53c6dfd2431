use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::model::GameEntry;
use crate::core::error::{EngineError, EngineResult};
use crate::core::fsio::{sanitize_component, write_json_atomic};
use crate::core::keyed_lock::KeyedLocks;

/// Durable set of [`GameEntry`] documents, one JSON file per entry.
///
/// Reads are served from memory. Writes to the same id are serialized and
/// each one replaces the entry's file atomically before the in-memory copy
/// is updated.
pub struct CatalogStore {
    dir: PathBuf,
    entries: RwLock<BTreeMap<String, GameEntry>>,
    id_locks: KeyedLocks,
}

impl CatalogStore {
    pub async fn open(dir: PathBuf) -> EngineResult<Self> {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| EngineError::io(&dir, e))?;

        let mut entries = BTreeMap::new();
        let mut listing = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| EngineError::io(&dir, e))?;
        while let Some(item) = listing
            .next_entry()
            .await
            .map_err(|e| EngineError::io(&dir, e))?
        {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<GameEntry>(&bytes) {
                    Ok(entry) => {
                        entries.insert(entry.id.clone(), entry);
                    }
                    Err(e) => warn!("Corrupt catalog entry at {:?}: {}", path, e),
                },
                Err(e) => warn!("Cannot read {:?}: {}", path, e),
            }
        }

        info!("Catalog opened at {:?} with {} entries", dir, entries.len());
        Ok(Self {
            dir,
            entries: RwLock::new(entries),
            id_locks: KeyedLocks::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn get(&self, id: &str) -> Option<GameEntry> {
        self.entries.read().await.get(id).cloned()
    }

    /// All entries ordered by sort title.
    pub async fn list(&self) -> Vec<GameEntry> {
        let mut all: Vec<GameEntry> = self.entries.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.sort_title.cmp(&b.sort_title).then(a.id.cmp(&b.id)));
        all
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn insert(&self, entry: GameEntry) -> EngineResult<GameEntry> {
        let _guard = self.id_locks.lock(&entry.id).await;
        if self.entries.read().await.contains_key(&entry.id) {
            return Err(EngineError::GameAlreadyExists(entry.id));
        }
        self.persist(entry).await
    }

    /// Insert or replace by id.
    pub async fn upsert(&self, entry: GameEntry) -> EngineResult<GameEntry> {
        let _guard = self.id_locks.lock(&entry.id).await;
        self.persist(entry).await
    }

    /// Read-modify-write one entry as a single transaction.
    pub async fn update<F>(&self, id: &str, apply: F) -> EngineResult<GameEntry>
    where
        F: FnOnce(&mut GameEntry),
    {
        let _guard = self.id_locks.lock(id).await;

        let mut entry = self
            .get(id)
            .await
            .ok_or_else(|| EngineError::GameNotFound(id.to_string()))?;
        let before = entry.clone();
        apply(&mut entry);
        entry.id = before.id.clone();
        if entry == before {
            return Ok(entry);
        }
        entry.last_modified = Utc::now();
        self.persist(entry).await
    }

    pub async fn remove(&self, id: &str) -> EngineResult<GameEntry> {
        let _guard = self.id_locks.lock(id).await;

        let path = self.entry_path(id);
        let removed = self
            .entries
            .write()
            .await
            .remove(id)
            .ok_or_else(|| EngineError::GameNotFound(id.to_string()))?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(EngineError::io(path, e)),
        }
        info!("Removed '{}' ({}) from catalog", removed.title, removed.id);
        Ok(removed)
    }

    pub async fn find_by_external_id(&self, service: &str, external_id: &str) -> Option<GameEntry> {
        self.entries
            .read()
            .await
            .values()
            .find(|e| e.external_id(service) == Some(external_id))
            .cloned()
    }

    /// Entries whose install path and recipe match a previous install.
    pub async fn find_install(&self, recipe_id: &str, install_path: &Path) -> Option<GameEntry> {
        self.entries
            .read()
            .await
            .values()
            .find(|e| {
                e.install_path.as_deref() == Some(install_path)
                    && e.recipe.as_ref().map(|r| r.id.as_str()) == Some(recipe_id)
            })
            .cloned()
    }

    /// An entry of `recipe_id` that was uninstalled but kept.
    pub async fn find_uninstalled(&self, recipe_id: &str) -> Option<GameEntry> {
        self.entries
            .read()
            .await
            .values()
            .find(|e| {
                e.install_path.is_none()
                    && e.recipe.as_ref().map(|r| r.id.as_str()) == Some(recipe_id)
            })
            .cloned()
    }

    async fn persist(&self, entry: GameEntry) -> EngineResult<GameEntry> {
        write_json_atomic(&self.entry_path(&entry.id), &entry).await?;
        self.entries
            .write()
            .await
            .insert(entry.id.clone(), entry.clone());
        debug!("Persisted catalog entry {}", entry.id);
        Ok(entry)
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_component(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::model::{GameSource, RecipeRef};
    use std::sync::Arc;

    #[tokio::test]
    async fn entries_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open(dir.path().to_path_buf()).await.unwrap();
        let mut game = GameEntry::new("Quake", GameSource::Manual);
        game.categories.insert("fps".into());
        let game = store.insert(game).await.unwrap();

        let reopened = CatalogStore::open(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(reopened.get(&game.id).await, Some(game));
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open(dir.path().to_path_buf()).await.unwrap();
        let game = store
            .insert(GameEntry::new("Quake", GameSource::Manual))
            .await
            .unwrap();
        let err = store.insert(game).await.unwrap_err();
        assert!(matches!(err, EngineError::GameAlreadyExists(_)));
    }

    #[tokio::test]
    async fn update_is_atomic_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CatalogStore::open(dir.path().to_path_buf()).await.unwrap());
        let game = store
            .insert(GameEntry::new("Quake", GameSource::Manual))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let id = game.id.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .update(&id, |g| {
                        g.playtime_secs += 1;
                        g.categories.insert(format!("tag{i}"));
                    })
                    .await
                    .unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let stored = store.get(&game.id).await.unwrap();
        assert_eq!(stored.playtime_secs, 20);
        assert_eq!(stored.categories.len(), 20);
        assert!(store.id_locks.is_empty());
    }

    #[tokio::test]
    async fn ids_that_sanitize_alike_keep_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open(dir.path().to_path_buf()).await.unwrap();
        for (id, title) in [("gog/1207", "Doom"), ("gog_1207", "Heretic")] {
            let mut game = GameEntry::new(title, GameSource::Manual);
            game.id = id.to_string();
            store.insert(game).await.unwrap();
        }

        let reopened = CatalogStore::open(dir.path().to_path_buf()).await.unwrap();
        assert_eq!(reopened.len().await, 2);
        assert_eq!(reopened.get("gog/1207").await.unwrap().title, "Doom");
        assert_eq!(reopened.get("gog_1207").await.unwrap().title, "Heretic");
    }

    #[tokio::test]
    async fn update_of_missing_entry_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open(dir.path().to_path_buf()).await.unwrap();
        let err = store.update("nope", |_| {}).await.unwrap_err();
        assert!(matches!(err, EngineError::GameNotFound(_)));
    }

    #[tokio::test]
    async fn lookups_by_external_id_and_install() {
        let dir = tempfile::tempdir().unwrap();
        let store = CatalogStore::open(dir.path().to_path_buf()).await.unwrap();
        let mut game = GameEntry::new("Quake", GameSource::Installer);
        game.external_ids.insert("steam".into(), "2310".into());
        game.install_path = Some(PathBuf::from("/games/quake"));
        game.recipe = Some(RecipeRef {
            id: "quake".into(),
            version: 1,
        });
        let game = store.insert(game).await.unwrap();

        assert_eq!(
            store.find_by_external_id("steam", "2310").await.map(|g| g.id),
            Some(game.id.clone())
        );
        assert!(store.find_by_external_id("gog", "2310").await.is_none());
        assert!(store
            .find_install("quake", Path::new("/games/quake"))
            .await
            .is_some());

        store.remove(&game.id).await.unwrap();
        assert!(store.is_empty().await);
        assert!(!dir.path().join(format!("{}.json", game.id)).exists());
    }
}
