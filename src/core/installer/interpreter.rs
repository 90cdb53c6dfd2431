// ─── Installer Interpreter ───
// Runs a recipe's steps in order against one target directory. Progress is
// journaled so an interrupted install resumes without redoing finished
// filesystem work, and every download goes through the asset store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::try_join_all;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::context::InstallContext;
use super::journal::JournalStore;
use super::lock::InstallLocks;
use super::recipe::{ArchiveFormat, Recipe, RegisterGameStep, Step};
use super::steps::{self, CommandSpec};
use crate::core::assets::{AssetRequest, AssetStore, CacheEntry};
use crate::core::cancel::CancelToken;
use crate::core::catalog::{sort_title_for, CatalogStore, GameEntry, GameSource, RecipeRef};
use crate::core::error::{EngineError, EngineResult, InstallError, UnresolvedRequirementError};
use crate::core::fsio::sanitize_component;
use crate::core::runtime::{HostProfile, Requirement, RuntimeResolver};
use crate::core::version::Component;

const UNPACKED_MARKER: &str = ".waystone-unpacked";

/// A runtime or auxiliary component ready for use by the steps.
#[derive(Debug, Clone)]
pub struct PreparedComponent {
    pub requirement: Requirement,
    pub component: Component,
    /// Unpacked directory for archives, the cached file otherwise.
    pub root: PathBuf,
}

pub struct InstallerInterpreter {
    assets: Arc<AssetStore>,
    resolver: Arc<RuntimeResolver>,
    catalog: Arc<CatalogStore>,
    journals: JournalStore,
    locks: InstallLocks,
    host: HostProfile,
}

impl InstallerInterpreter {
    pub fn new(
        assets: Arc<AssetStore>,
        resolver: Arc<RuntimeResolver>,
        catalog: Arc<CatalogStore>,
        journals_dir: PathBuf,
        host: HostProfile,
    ) -> Self {
        Self {
            assets,
            resolver,
            catalog,
            journals: JournalStore::new(journals_dir),
            locks: InstallLocks::new(),
            host,
        }
    }

    pub fn host(&self) -> &HostProfile {
        &self.host
    }

    /// True while an install holds `target_root`.
    pub fn is_installing(&self, target_root: &Path) -> bool {
        self.locks.is_locked(target_root)
    }

    /// Install `recipe` into `target_root` and register the result.
    ///
    /// A failing step aborts the run with an [`InstallError`]; whatever the
    /// earlier steps wrote stays in place and a later run with the same
    /// recipe picks up after the last finished step.
    #[instrument(skip_all, fields(recipe = %recipe.id, target = %target_root.display()))]
    pub async fn run(
        &self,
        recipe: &Recipe,
        target_root: &Path,
        cancel: &CancelToken,
    ) -> EngineResult<GameEntry> {
        recipe.validate()?;
        if !recipe.requirements.host_supported(&self.host) {
            return Err(UnresolvedRequirementError {
                family: "host".into(),
                constraint: format!(
                    "os {:?} arch {:?}",
                    recipe.requirements.os, recipe.requirements.arch
                ),
                reason: format!("this machine is {}/{}", self.host.os, self.host.arch),
            }
            .into());
        }

        let _lock = self.locks.acquire(target_root, &recipe.id)?;
        let game_dir = std::fs::canonicalize(target_root).unwrap_or_else(|_| target_root.to_path_buf());
        if let Some(required) = recipe.requirements.disk_space_bytes {
            ensure_space(&game_dir, available_space(&game_dir), required)?;
        }

        info!("Installing {} (rev {}) into {:?}", recipe.name, recipe.version, game_dir);

        let prepared = self.prepare_components(recipe, cancel).await?;
        let mut ctx = InstallContext::new(game_dir.clone(), self.assets.root().to_path_buf());
        for (position, item) in prepared.iter().enumerate() {
            if position == 0 && recipe.requirements.runtime.is_some() {
                ctx.set_runtime(&item.root);
            }
            ctx.add_component(&item.requirement.family, &item.root);
        }

        let mut journal = self.journals.load(recipe, &game_dir).await?;
        let already_installed = journal.completed.is_empty()
            && self
                .catalog
                .find_install(&recipe.id, &game_dir)
                .await
                .and_then(|e| e.recipe)
                .map(|r| r.version == recipe.version)
                .unwrap_or(false);
        if already_installed {
            info!("{} already installed at {:?}, refreshing registration only", recipe.id, game_dir);
        }

        let mut registered: Option<GameEntry> = None;
        for (index, step) in recipe.steps.iter().enumerate() {
            cancel.check()?;

            let skip = if already_installed {
                !matches!(step, Step::RegisterGame(_))
            } else {
                step.mutates_target() && journal.is_done(index)
            };
            if skip {
                debug!("Step {} ({}) already done, skipping", index, step.kind());
                self.replay_bindings(step, &mut ctx)?;
                continue;
            }

            debug!("Running step {} ({})", index, step.kind());
            match self.run_step(recipe, step, &mut ctx, cancel).await {
                Ok(Some(entry)) => registered = Some(entry),
                Ok(None) => {}
                Err(EngineError::Cancelled) => {
                    info!("Install of {} cancelled at step {}", recipe.id, index);
                    return Err(EngineError::Cancelled);
                }
                Err(cause) => {
                    warn!("Step {} ({}) of {} failed: {}", index, step.kind(), recipe.id, cause);
                    return Err(InstallError {
                        recipe_id: recipe.id.clone(),
                        step_index: index,
                        step_kind: step.kind(),
                        cause: Box::new(cause),
                    }
                    .into());
                }
            }

            if step.mutates_target() {
                self.journals.mark_done(&mut journal, index).await?;
            }
        }

        self.journals.clear(&game_dir).await?;
        let entry = registered.ok_or_else(|| {
            EngineError::InvalidRecipe(format!("{} never registered a game", recipe.id))
        })?;
        info!("Installed '{}' as {}", entry.title, entry.id);
        Ok(entry)
    }

    /// Resolve every required component and make sure each is cached and
    /// unpacked. Requirements are handled concurrently.
    pub async fn prepare_components(
        &self,
        recipe: &Recipe,
        cancel: &CancelToken,
    ) -> EngineResult<Vec<PreparedComponent>> {
        let requirements = recipe.component_requirements();
        try_join_all(requirements.into_iter().map(|requirement| async move {
            let resolution = self.resolver.resolve(&requirement, &self.host).await?;
            if resolution.stale {
                warn!("{} resolved from a stale index", requirement);
            }
            let entry = self.resolver.materialize(&resolution, cancel).await?;
            let root = self.unpack_component(&resolution.component, &entry).await?;
            Ok::<_, EngineError>(PreparedComponent {
                requirement,
                component: resolution.component,
                root,
            })
        }))
        .await
    }

    /// Archive components are unpacked once under `<cache>/runtimes`.
    async fn unpack_component(
        &self,
        component: &Component,
        entry: &CacheEntry,
    ) -> EngineResult<PathBuf> {
        let archive = self.assets.absolute_path(entry);
        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let Some(format) = ArchiveFormat::from_file_name(&file_name) else {
            return Ok(archive);
        };

        let root = self
            .assets
            .root()
            .join("runtimes")
            .join(sanitize_component(&component.name))
            .join(sanitize_component(&component.version));
        if root.join(UNPACKED_MARKER).is_file() {
            return Ok(root);
        }

        let staging = root.with_file_name(format!(".{}.{}", sanitize_component(&component.version), Uuid::new_v4().simple()));
        let target = root.clone();
        blocking(move || {
            let result = steps::extract_archive(&archive, &staging, format, 0).and_then(|_| {
                std::fs::write(staging.join(UNPACKED_MARKER), b"")
                    .map_err(|e| EngineError::io(&staging, e))?;
                if target.exists() {
                    std::fs::remove_dir_all(&target).map_err(|e| EngineError::io(&target, e))?;
                }
                std::fs::rename(&staging, &target).map_err(|e| EngineError::io(&target, e))
            });
            if result.is_err() {
                let _ = std::fs::remove_dir_all(&staging);
            }
            result
        })
        .await?;
        info!("Unpacked {} {} into {:?}", component.name, component.version, root);
        Ok(root)
    }

    async fn run_step(
        &self,
        recipe: &Recipe,
        step: &Step,
        ctx: &mut InstallContext,
        cancel: &CancelToken,
    ) -> EngineResult<Option<GameEntry>> {
        match step {
            Step::Fetch(fetch) => {
                let request = AssetRequest::for_download(
                    &fetch.id,
                    fetch.sources().iter().map(|u| ctx.substitute(u)).collect(),
                    fetch.checksum.clone(),
                    fetch.filename.clone(),
                    fetch.size,
                );
                let entry = self.assets.acquire(&request, cancel).await?;
                ctx.add_file(&fetch.id, self.assets.absolute_path(&entry));
            }
            Step::Extract(extract) => {
                let archive = ctx.source(&extract.archive)?;
                let dest = ctx.scoped(&extract.dest)?;
                let format = match extract.format {
                    Some(format) => format,
                    None => archive
                        .file_name()
                        .and_then(|n| ArchiveFormat::from_file_name(&n.to_string_lossy()))
                        .ok_or_else(|| {
                            EngineError::InvalidRecipe(format!(
                                "cannot tell archive format of {}",
                                archive.display()
                            ))
                        })?,
                };
                let strip = extract.strip_components;
                blocking(move || steps::extract_archive(&archive, &dest, format, strip)).await?;
            }
            Step::Move(mv) => {
                let src = ctx.source(&mv.src)?;
                let dest = ctx.scoped(&mv.dest)?;
                let copy = ctx.is_cached(&src);
                let optional = mv.optional;
                let outcome = blocking(move || steps::move_path(&src, &dest, optional, copy)).await?;
                debug!("move: {:?}", outcome);
            }
            Step::Copy(copy) => {
                let src = ctx.source(&copy.src)?;
                let dest = ctx.scoped(&copy.dest)?;
                let optional = copy.optional;
                let rebinds = ctx.file(&copy.src).is_some();
                let placed = blocking(move || steps::copy_into(&src, &dest, optional)).await?;
                if let (Some(placed), true) = (placed, rebinds) {
                    debug!("'{}' now refers to {:?}", copy.src, placed);
                    ctx.add_file(&copy.src, placed);
                }
            }
            Step::Rename(rename) => {
                let src = ctx.scoped(&rename.src)?;
                let dest = ctx.scoped(&rename.dest)?;
                blocking(move || steps::rename_path(&src, &dest)).await?;
            }
            Step::Chmodx { path } => {
                let file = ctx.source(path)?;
                blocking(move || steps::make_executable(&file)).await?;
            }
            Step::MergeConfig(merge) => {
                let file = ctx.scoped(&merge.file)?;
                let value = match &merge.value {
                    serde_json::Value::String(s) => serde_json::Value::String(ctx.substitute(s)),
                    other => other.clone(),
                };
                let key = merge.key.clone();
                match merge.effective_format() {
                    super::recipe::ConfigFormat::Json => {
                        blocking(move || steps::merge_json(&file, &key, value)).await?;
                    }
                    super::recipe::ConfigFormat::Ini => {
                        let section = merge.section.clone().unwrap_or_default();
                        let text = match value {
                            serde_json::Value::String(s) => s,
                            other => other.to_string(),
                        };
                        blocking(move || steps::merge_ini(&file, &section, &key, &text)).await?;
                    }
                }
            }
            Step::Execute(exec) => {
                let program = match ctx.file(&exec.path) {
                    Some(path) => path.to_path_buf(),
                    None => PathBuf::from(ctx.substitute(&exec.path)),
                };
                let working_dir = match &exec.working_dir {
                    Some(dir) => ctx.scoped(dir)?,
                    None => ctx.game_dir.clone(),
                };
                let spec = CommandSpec {
                    program,
                    args: exec.args.split()?.iter().map(|a| ctx.substitute(a)).collect(),
                    env: exec
                        .env
                        .iter()
                        .map(|(k, v)| (k.clone(), ctx.substitute(v)))
                        .collect(),
                    working_dir,
                    accepted_codes: exec.return_codes.clone(),
                };
                steps::run_command(&spec).await?;
            }
            Step::Mkdir { path } => {
                let dir = ctx.scoped(path)?;
                blocking(move || std::fs::create_dir_all(&dir).map_err(|e| EngineError::io(&dir, e)))
                    .await?;
            }
            Step::WriteFile {
                path,
                content,
                append,
            } => {
                let file = ctx.scoped(path)?;
                let content = ctx.substitute(content);
                let append = *append;
                blocking(move || steps::write_file(&file, &content, append)).await?;
            }
            Step::RegisterGame(manifest) => {
                let entry = self.register(recipe, manifest, ctx).await?;
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Restore what a skipped step would have bound for later steps: a
    /// copied fetch id points at its copy in the game directory.
    fn replay_bindings(&self, step: &Step, ctx: &mut InstallContext) -> EngineResult<()> {
        let Step::Copy(copy) = step else {
            return Ok(());
        };
        let Some(fetched) = ctx.file(&copy.src) else {
            return Ok(());
        };
        let Some(name) = fetched.file_name().map(|n| n.to_os_string()) else {
            return Ok(());
        };
        let placed = ctx.scoped(&copy.dest)?.join(name);
        if placed.is_file() {
            ctx.add_file(&copy.src, placed);
        }
        Ok(())
    }

    /// Mark `game_id` as not installed, optionally deleting its files. The
    /// entry stays in the catalog with its playtime and categories.
    #[instrument(skip(self))]
    pub async fn uninstall(&self, game_id: &str, delete_files: bool) -> EngineResult<GameEntry> {
        let entry = self
            .catalog
            .get(game_id)
            .await
            .ok_or_else(|| EngineError::GameNotFound(game_id.to_string()))?;
        let Some(install_path) = entry.install_path.clone() else {
            debug!("{} is not installed", game_id);
            return Ok(entry);
        };

        if install_path.is_dir() {
            let recipe_id = entry.recipe.as_ref().map(|r| r.id.clone()).unwrap_or_default();
            let lock = self.locks.acquire(&install_path, &recipe_id)?;
            self.journals.clear(&install_path).await?;
            if delete_files {
                info!("Deleting {:?}", install_path);
                let path = install_path.clone();
                blocking(move || {
                    std::fs::remove_dir_all(&path).map_err(|e| EngineError::io(&path, e))
                })
                .await?;
            }
            drop(lock);
        } else if delete_files {
            warn!("Install path {:?} of {} is already gone", install_path, game_id);
        }

        let updated = self
            .catalog
            .update(game_id, |entry| {
                entry.install_path = None;
                entry.executable = None;
            })
            .await?;
        info!("Uninstalled '{}' ({})", updated.title, updated.id);
        Ok(updated)
    }

    /// Insert the installed game, or update the entry a previous run of the
    /// same recipe created at the same path or left behind on uninstall.
    async fn register(
        &self,
        recipe: &Recipe,
        manifest: &RegisterGameStep,
        ctx: &InstallContext,
    ) -> EngineResult<GameEntry> {
        let title = manifest.title.clone().unwrap_or_else(|| recipe.name.clone());
        let sort_title = manifest
            .sort_title
            .clone()
            .unwrap_or_else(|| sort_title_for(&title));
        let executable = match &manifest.executable {
            Some(raw) => Some(ctx.scoped(raw)?),
            None => None,
        };
        let launch: std::collections::BTreeMap<String, serde_json::Value> = manifest
            .launch
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    serde_json::Value::String(s) => serde_json::Value::String(ctx.substitute(s)),
                    other => other.clone(),
                };
                (k.clone(), v)
            })
            .collect();
        let recipe_ref = RecipeRef {
            id: recipe.id.clone(),
            version: recipe.version,
        };

        let apply = |entry: &mut GameEntry| {
            entry.title = title.clone();
            entry.sort_title = sort_title.clone();
            entry.install_path = Some(ctx.game_dir.clone());
            entry.runner = recipe.runner.clone();
            entry.recipe = Some(recipe_ref.clone());
            entry.executable = executable.clone();
            entry.launch = launch.clone();
            entry.categories.extend(manifest.categories.iter().cloned());
        };

        let existing = match self.catalog.find_install(&recipe.id, &ctx.game_dir).await {
            Some(existing) => Some(existing),
            None => self.catalog.find_uninstalled(&recipe.id).await,
        };
        match existing {
            Some(existing) => self.catalog.update(&existing.id, apply).await,
            None => {
                let mut entry = GameEntry::new(title.clone(), GameSource::Installer);
                apply(&mut entry);
                self.catalog.insert(entry).await
            }
        }
    }
}

async fn blocking<T, F>(job: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| EngineError::Other(format!("Task join error: {e}")))?
}

/// Free bytes on the volume holding `path`, if it can be determined.
pub fn available_space(path: &Path) -> Option<u64> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    disks
        .list()
        .iter()
        .filter(|disk| canonical.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

fn ensure_space(path: &Path, available: Option<u64>, required: u64) -> EngineResult<()> {
    match available {
        Some(available) if available < required => Err(EngineError::InsufficientSpace {
            path: path.to_path_buf(),
            available,
            required,
        }),
        _ => Ok(()),
    }
}
