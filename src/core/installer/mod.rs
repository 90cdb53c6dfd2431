mod context;
mod interpreter;
mod journal;
mod lock;
mod recipe;
mod steps;
mod vars;

pub use context::InstallContext;
pub use interpreter::{available_space, InstallerInterpreter, PreparedComponent};
pub use journal::{InstallJournal, JournalStore};
pub use lock::{InstallLocks, TargetLock};
pub use recipe::{
    ArchiveFormat, CommandArgs, ConfigFormat, ExecuteStep, ExtractStep, FetchStep,
    MergeConfigStep, MoveStep, Recipe, RecipeRequirements, RegisterGameStep, RenameStep, Step,
    StepKind,
};
pub use steps::{
    copy_into, extract_archive, make_executable, merge_ini, merge_json, move_path, rename_path,
    run_command, write_file, CommandSpec, MoveOutcome,
};
pub use vars::{scoped_path, Variables};
