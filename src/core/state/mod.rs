mod app_state;
mod config;

pub use app_state::Engine;
pub use config::EngineConfig;
