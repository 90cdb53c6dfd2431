use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use crate::core::error::{EngineError, EngineResult};

/// `$NAME` / `${NAME}` substitution table for step arguments.
///
/// Unknown variables are left untouched so a literal `$` in a command line
/// survives.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables {
    values: BTreeMap<String, String>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn set_path(&mut self, name: impl Into<String>, path: &Path) {
        self.set(name, path.to_string_lossy().to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn substitute(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let after = &rest[pos + 1..];

            let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
                match braced.find('}') {
                    Some(end) => (&braced[..end], end + 2),
                    None => ("", 0),
                }
            } else {
                let end = after
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(after.len());
                (&after[..end], end)
            };

            match self.values.get(name) {
                Some(value) if !name.is_empty() => {
                    out.push_str(value);
                    rest = &after[consumed..];
                }
                _ => {
                    out.push('$');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Resolve `raw` (already substituted) against `root` and make sure the
/// result stays inside it. Relative paths are taken relative to `root`.
pub fn scoped_path(root: &Path, raw: &str) -> EngineResult<PathBuf> {
    let candidate = Path::new(raw);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let normalized = normalize_lexically(&joined);
    let root = normalize_lexically(root);
    if normalized.starts_with(&root) {
        Ok(normalized)
    } else {
        Err(EngineError::InvalidRecipe(format!(
            "path '{}' escapes the install directory {:?}",
            raw, root
        )))
    }
}

/// True when `path` lies inside any of `roots` once `.`/`..` are folded.
pub fn within_any(path: &Path, roots: &[&Path]) -> bool {
    let path = normalize_lexically(path);
    roots
        .iter()
        .any(|root| path.starts_with(normalize_lexically(root)))
}

/// Fold `.` and `..` without touching the filesystem.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
