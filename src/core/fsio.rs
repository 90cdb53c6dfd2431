// ─── Persistence helpers ───
// Every durable document (asset index, catalog entries, component index
// caches, install journals) is written through `write_json_atomic` so a
// crash mid-write never leaves a truncated file behind.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::core::error::{EngineError, EngineResult};

/// Serialize `value` to `path` via a sibling temp file and a rename.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> EngineResult<()> {
    let payload = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| EngineError::io(parent, e))?;
    }

    let tmp = temp_sibling(path);
    tokio::fs::write(&tmp, payload)
        .await
        .map_err(|e| EngineError::io(&tmp, e))?;
    if let Err(source) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(EngineError::io(path, source));
    }
    Ok(())
}

/// Read a JSON document, `Ok(None)` when the file does not exist.
pub async fn read_json_opt<T: DeserializeOwned>(path: &Path) -> EngineResult<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(EngineError::io(path, e)),
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

/// Replace characters that are unsafe in a single path component. Names
/// that had to change get a short hash of the original appended, so two
/// distinct inputs never share a file.
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' | '+' => c,
            _ => '_',
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed == raw && !raw.is_empty() {
        return raw.to_string();
    }
    let digest = hex::encode(Sha256::digest(raw.as_bytes()));
    let stem = if trimmed.is_empty() { "_" } else { trimmed };
    format!("{}-{}", stem, &digest[..8])
}
