//! Gamewatch library: launch a game command and supervise its process tree
//! until the session really ends.

pub mod app;
pub mod config;
pub mod exclusion;
pub mod launcher;
pub mod local_logger;
pub mod output;
mod prelude;
pub mod process;
pub mod runner;
pub mod supervisor;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::SupervisorConfig;
pub use launcher::{LaunchError, LaunchRequest};
pub use runner::{NullRunner, RunnerAdapter};
pub use supervisor::{SessionOutcome, StopReason, Supervisor};
