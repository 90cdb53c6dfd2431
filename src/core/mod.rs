// ─── Waystone Core ───
// Install, runtime resolution and library sync engine for a
// game-preservation launcher.
//
// Architecture:
//   core/
//     assets/      Content-addressed download cache
//     version/     Published component index + version ordering
//     runtime/     Host profile + requirement resolution
//     installer/   Recipe model, step interpreter, resume journal
//     catalog/     Game library, one JSON document per entry
//     sync/        Remote library services + merge rules
//     downloader/  HTTP transport, retries, checksum validation
//     state/       Configuration + engine wiring

pub mod assets;
pub mod cancel;
pub mod catalog;
pub mod downloader;
pub mod error;
pub mod fsio;
pub mod http;
pub mod installer;
pub mod keyed_lock;
pub mod retry;
pub mod runtime;
pub mod state;
pub mod sync;
pub mod version;
