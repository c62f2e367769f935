//! conductor — multi-source agent-task conductor.
//!
//! This library crate re-exports modules so integration tests
//! (under `tests/`) can access them.

pub mod chat;
pub mod cli;
pub mod comm;
pub mod config;
pub mod dispatcher;
pub mod gateway;
pub mod history;
pub mod invoker;
pub mod logs;
pub mod scheduler;
pub mod secrets;
pub mod slash;
pub mod store;

/// Return the conductor's home directory.
///
/// Resolution order:
/// 1. `CONDUCTOR_HOME` environment variable
/// 2. `$HOME/.conductor`
pub fn conductor_home() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("CONDUCTOR_HOME") {
        std::path::PathBuf::from(p)
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".conductor")
    }
}
