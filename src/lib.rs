pub mod core;

use tracing_subscriber::EnvFilter;

pub use crate::core::error::{EngineError, EngineResult};
pub use crate::core::state::{Engine, EngineConfig};

/// Install the fmt subscriber. `RUST_LOG` wins over the default filter.
/// Calling this more than once is harmless.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,waystone=debug")),
        )
        .try_init();

    tracing::debug!("Waystone engine logging initialised");
}
