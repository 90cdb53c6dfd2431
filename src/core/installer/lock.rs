use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::error::{EngineError, EngineResult};

const LOCK_FILE: &str = ".waystone-install.lock";

#[derive(Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    recipe: String,
    started_at: i64,
}

/// Install paths currently held by this process.
#[derive(Debug, Clone, Default)]
pub struct InstallLocks {
    active: Arc<Mutex<HashSet<PathBuf>>>,
}

impl InstallLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `target` for one install, failing at once if another install
    /// (in this process or another one) holds it.
    pub fn acquire(&self, target: &Path, recipe_id: &str) -> EngineResult<TargetLock> {
        std::fs::create_dir_all(target).map_err(|e| EngineError::io(target, e))?;
        let key = normalize(target);
        {
            let mut active = lock_set(&self.active);
            if !active.insert(key.clone()) {
                return Err(EngineError::Contention(target.to_path_buf()));
            }
        }

        match lock_file(target, recipe_id) {
            Ok((file, path)) => {
                debug!("Install lock taken on {:?}", target);
                Ok(TargetLock {
                    file,
                    path,
                    key,
                    registry: self.active.clone(),
                })
            }
            Err(err) => {
                lock_set(&self.active).remove(&key);
                Err(err)
            }
        }
    }

    pub fn is_locked(&self, target: &Path) -> bool {
        lock_set(&self.active).contains(&normalize(target))
    }
}

/// Held for the duration of one install; releases both locks on drop.
///
/// The lock file itself stays in place. Unlinking it would let a waiter
/// lock the orphaned inode while a newcomer locks a fresh file at the
/// same path.
#[derive(Debug)]
pub struct TargetLock {
    file: File,
    path: PathBuf,
    key: PathBuf,
    registry: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        if let Err(source) = self.file.set_len(0) {
            warn!("Failed to clear lock {:?}: {}", self.path, source);
        }
        let _ = self.file.unlock();
        lock_set(&self.registry).remove(&self.key);
    }
}

fn lock_file(target: &Path, recipe_id: &str) -> EngineResult<(File, PathBuf)> {
    let path = target.join(LOCK_FILE);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|e| EngineError::io(&path, e))?;

    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if is_contended(&e) => return Err(EngineError::Contention(target.to_path_buf())),
        Err(e) => return Err(EngineError::io(&path, e)),
    }

    let info = LockInfo {
        pid: std::process::id(),
        recipe: recipe_id.to_string(),
        started_at: Utc::now().timestamp(),
    };
    file.set_len(0).map_err(|e| EngineError::io(&path, e))?;
    file.write_all(serde_json::to_string(&info)?.as_bytes())
        .map_err(|e| EngineError::io(&path, e))?;
    Ok((file, path))
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn normalize(target: &Path) -> PathBuf {
    std::fs::canonicalize(target).unwrap_or_else(|_| target.to_path_buf())
}

fn lock_set(set: &Mutex<HashSet<PathBuf>>) -> std::sync::MutexGuard<'_, HashSet<PathBuf>> {
    match set.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
