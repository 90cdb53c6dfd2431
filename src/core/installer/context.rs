use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::vars::{scoped_path, within_any, Variables};
use crate::core::error::{EngineError, EngineResult};

/// Mutable state threaded through the steps of one install.
#[derive(Debug, Clone)]
pub struct InstallContext {
    pub game_dir: PathBuf,
    pub cache_root: PathBuf,
    pub vars: Variables,
    files: BTreeMap<String, PathBuf>,
}

impl InstallContext {
    pub fn new(game_dir: PathBuf, cache_root: PathBuf) -> Self {
        let mut vars = Variables::new();
        vars.set_path("GAMEDIR", &game_dir);
        vars.set_path("CACHE", &cache_root);
        Self {
            game_dir,
            cache_root,
            vars,
            files: BTreeMap::new(),
        }
    }

    pub fn set_runtime(&mut self, root: &Path) {
        self.vars.set_path("RUNTIME", root);
    }

    /// Expose a materialized component as `$COMPONENT_<FAMILY>`.
    pub fn add_component(&mut self, family: &str, root: &Path) {
        let name: String = family
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        self.vars.set_path(format!("COMPONENT_{name}"), root);
    }

    /// Register a fetched file under its id, usable bare or as `$id`.
    pub fn add_file(&mut self, id: &str, path: PathBuf) {
        self.vars.set_path(id, &path);
        self.files.insert(id.to_string(), path);
    }

    pub fn file(&self, id: &str) -> Option<&Path> {
        self.files.get(id).map(PathBuf::as_path)
    }

    pub fn substitute(&self, raw: &str) -> String {
        self.vars.substitute(raw)
    }

    /// Destination path for a mutating step; must stay in the game directory.
    pub fn scoped(&self, raw: &str) -> EngineResult<PathBuf> {
        scoped_path(&self.game_dir, &self.substitute(raw))
    }

    /// Source path for extract/move: a file id, or a path inside the game
    /// directory or the asset cache.
    pub fn source(&self, raw: &str) -> EngineResult<PathBuf> {
        if let Some(path) = self.file(raw) {
            return Ok(path.to_path_buf());
        }
        let substituted = self.substitute(raw);
        let candidate = Path::new(&substituted);
        let path = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.game_dir.join(candidate)
        };
        if within_any(&path, &[&self.game_dir, &self.cache_root]) {
            Ok(path)
        } else {
            Err(EngineError::InvalidRecipe(format!(
                "source '{raw}' is outside the install and cache directories"
            )))
        }
    }

    /// Files under the cache belong to the asset store and are copied, never moved.
    pub fn is_cached(&self, path: &Path) -> bool {
        within_any(path, &[&self.cache_root])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> InstallContext {
        InstallContext::new(PathBuf::from("/games/quake"), PathBuf::from("/cache"))
    }

    #[test]
    fn file_ids_resolve_bare_and_as_variables() {
        let mut c = ctx();
        c.add_file("setup", PathBuf::from("/cache/objects/setup/x/setup.exe"));
        assert_eq!(
            c.source("setup").unwrap(),
            PathBuf::from("/cache/objects/setup/x/setup.exe")
        );
        assert_eq!(c.substitute("$setup /S"), "/cache/objects/setup/x/setup.exe /S");
        assert!(c.is_cached(c.file("setup").unwrap()));
    }

    #[test]
    fn component_variables_are_uppercased() {
        let mut c = ctx();
        c.add_component("dxvk-nvapi", Path::new("/cache/runtimes/nvapi"));
        assert_eq!(c.vars.get("COMPONENT_DXVK_NVAPI"), Some("/cache/runtimes/nvapi"));
    }

    #[test]
    fn sources_outside_known_roots_are_rejected() {
        let c = ctx();
        assert!(c.source("/etc/shadow").is_err());
        assert!(c.source("$GAMEDIR/../../etc").is_err());
        assert_eq!(
            c.source("drive_c/setup.exe").unwrap(),
            PathBuf::from("/games/quake/drive_c/setup.exe")
        );
        assert!(c.scoped("$CACHE/x").is_err());
    }
}
