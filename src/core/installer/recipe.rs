// ─── Recipe ───
// Declarative install script: a fixed set of step kinds executed in order.
// Recipes come from a moderated catalog but are still parsed and validated
// as untrusted input.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::downloader::Checksum;
use crate::core::error::{EngineError, EngineResult};
use crate::core::runtime::{Arch, HostProfile, OsKind, Requirement};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    /// Stable slug, e.g. `quake-gog`.
    pub id: String,
    pub name: String,
    #[serde(default = "first_revision")]
    pub version: u32,
    /// Runner that launches the installed game (`wine`, `linux`, `dosbox`...).
    #[serde(default)]
    pub runner: Option<String>,
    #[serde(default)]
    pub requirements: RecipeRequirements,
    pub steps: Vec<Step>,
}

fn first_revision() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecipeRequirements {
    /// Empty means any.
    #[serde(default)]
    pub os: Vec<OsKind>,
    #[serde(default)]
    pub arch: Vec<Arch>,
    #[serde(default)]
    pub runtime: Option<Requirement>,
    /// Auxiliary components such as graphics translation layers.
    #[serde(default)]
    pub components: Vec<Requirement>,
    #[serde(default)]
    pub disk_space_bytes: Option<u64>,
}

impl RecipeRequirements {
    pub fn host_supported(&self, host: &HostProfile) -> bool {
        host.is_recognized()
            && (self.os.is_empty() || self.os.contains(&host.os))
            && (self.arch.is_empty() || self.arch.contains(&host.arch))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    Fetch(FetchStep),
    Extract(ExtractStep),
    Move(MoveStep),
    /// Copy into a directory, merging with what is there.
    #[serde(alias = "merge")]
    Copy(MoveStep),
    Rename(RenameStep),
    /// Set the executable bits on a file.
    Chmodx { path: String },
    MergeConfig(MergeConfigStep),
    Execute(ExecuteStep),
    RegisterGame(RegisterGameStep),
    Mkdir { path: String },
    WriteFile {
        path: String,
        content: String,
        #[serde(default)]
        append: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchStep {
    /// Name later steps use to refer to the downloaded file.
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
    #[serde(default)]
    pub checksum: Option<Checksum>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl FetchStep {
    pub fn sources(&self) -> Vec<String> {
        std::iter::once(self.url.clone())
            .chain(self.mirrors.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveFormat {
    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if lower.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractStep {
    /// A fetch id or a path.
    pub archive: String,
    #[serde(default = "game_dir_var")]
    pub dest: String,
    #[serde(default)]
    pub format: Option<ArchiveFormat>,
    /// Leading path components dropped from every entry.
    #[serde(default)]
    pub strip_components: usize,
}

fn game_dir_var() -> String {
    "$GAMEDIR".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveStep {
    pub src: String,
    pub dest: String,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameStep {
    pub src: String,
    pub dest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigFormat {
    Ini,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfigStep {
    pub file: String,
    /// Key inside `section` for INI files, dotted path for JSON files.
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub format: Option<ConfigFormat>,
}

impl MergeConfigStep {
    pub fn effective_format(&self) -> ConfigFormat {
        self.format.unwrap_or_else(|| {
            if self.file.to_ascii_lowercase().ends_with(".json") {
                ConfigFormat::Json
            } else {
                ConfigFormat::Ini
            }
        })
    }
}

/// Arguments as a list, or as one shell-style string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandArgs {
    Line(String),
    List(Vec<String>),
}

impl Default for CommandArgs {
    fn default() -> Self {
        CommandArgs::List(Vec::new())
    }
}

impl CommandArgs {
    pub fn split(&self) -> EngineResult<Vec<String>> {
        match self {
            CommandArgs::List(args) => Ok(args.clone()),
            CommandArgs::Line(line) => shell_words::split(line)
                .map_err(|e| EngineError::InvalidRecipe(format!("bad args '{line}': {e}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteStep {
    pub path: String,
    #[serde(default)]
    pub args: CommandArgs,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default = "success_only")]
    pub return_codes: Vec<i32>,
}

fn success_only() -> Vec<i32> {
    vec![0]
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RegisterGameStep {
    /// Defaults to the recipe name.
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub sort_title: Option<String>,
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    /// Free-form launch options stored with the entry.
    #[serde(default)]
    pub launch: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Fetch,
    Extract,
    Move,
    Copy,
    Rename,
    Chmodx,
    MergeConfig,
    Execute,
    RegisterGame,
    Mkdir,
    WriteFile,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepKind::Fetch => "fetch",
            StepKind::Extract => "extract",
            StepKind::Move => "move",
            StepKind::Copy => "copy",
            StepKind::Rename => "rename",
            StepKind::Chmodx => "chmodx",
            StepKind::MergeConfig => "merge_config",
            StepKind::Execute => "execute",
            StepKind::RegisterGame => "register_game",
            StepKind::Mkdir => "mkdir",
            StepKind::WriteFile => "write_file",
        };
        f.write_str(name)
    }
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self {
            Step::Fetch(_) => StepKind::Fetch,
            Step::Extract(_) => StepKind::Extract,
            Step::Move(_) => StepKind::Move,
            Step::Copy(_) => StepKind::Copy,
            Step::Rename(_) => StepKind::Rename,
            Step::Chmodx { .. } => StepKind::Chmodx,
            Step::MergeConfig(_) => StepKind::MergeConfig,
            Step::Execute(_) => StepKind::Execute,
            Step::RegisterGame(_) => StepKind::RegisterGame,
            Step::Mkdir { .. } => StepKind::Mkdir,
            Step::WriteFile { .. } => StepKind::WriteFile,
        }
    }

    /// Steps that mutate the target directory and are recorded in the
    /// resume journal once done.
    pub fn mutates_target(&self) -> bool {
        !matches!(self, Step::Fetch(_) | Step::RegisterGame(_))
    }
}

impl Recipe {
    pub fn from_json(raw: &str) -> EngineResult<Self> {
        let recipe: Recipe = serde_json::from_str(raw)
            .map_err(|e| EngineError::InvalidRecipe(format!("unparseable recipe: {e}")))?;
        recipe.validate()?;
        Ok(recipe)
    }

    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |msg: String| Err(EngineError::InvalidRecipe(format!("{}: {}", self.id, msg)));

        if self.id.trim().is_empty() {
            return Err(EngineError::InvalidRecipe("recipe id is empty".into()));
        }
        if self.steps.is_empty() {
            return invalid("no steps".into());
        }

        let mut fetch_ids = HashSet::new();
        let mut register_count = 0;
        for (index, step) in self.steps.iter().enumerate() {
            match step {
                Step::Fetch(fetch) => {
                    if fetch.id.trim().is_empty() {
                        return invalid(format!("step {index}: fetch without id"));
                    }
                    if !fetch_ids.insert(fetch.id.as_str()) {
                        return invalid(format!("step {index}: duplicate fetch id '{}'", fetch.id));
                    }
                }
                Step::Extract(extract) => {
                    let is_path = extract.archive.contains('/') || extract.archive.contains('$');
                    if !is_path && !fetch_ids.contains(extract.archive.as_str()) {
                        return invalid(format!(
                            "step {index}: extract refers to unknown file '{}'",
                            extract.archive
                        ));
                    }
                }
                Step::Execute(exec) => {
                    exec.args.split()?;
                    if exec.return_codes.is_empty() {
                        return invalid(format!("step {index}: empty return_codes"));
                    }
                }
                Step::RegisterGame(_) => register_count += 1,
                _ => {}
            }
        }

        if register_count != 1 {
            return invalid(format!(
                "expected exactly one register_game step, found {register_count}"
            ));
        }
        Ok(())
    }

    /// Content hash identifying this exact recipe revision.
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Every runtime and auxiliary requirement, runtime first.
    pub fn component_requirements(&self) -> Vec<Requirement> {
        self.requirements
            .runtime
            .iter()
            .chain(self.requirements.components.iter())
            .cloned()
            .collect()
    }
}
