use std::collections::HashSet;
use std::path::PathBuf;

use crate::prelude::*;

/// Hooks a game runner (Wine, an emulator, a sandboxing layer) exposes to the
/// supervisor. Every method has a neutral default so plain native launches
/// need no adapter logic at all.
pub trait RunnerAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Preferred working directory when the launch request does not set one.
    fn working_directory(&self) -> Option<PathBuf> {
        None
    }

    /// Pids owned by the runner's process namespace, listed by the runner's
    /// own enumeration mechanism. Wineserver tracks processes that the parent
    /// chain of the launched command does not reach.
    fn managed_pids(&self) -> Result<Vec<u32>> {
        Ok(Vec::new())
    }

    /// Long-lived service processes of the runner itself, never the game.
    fn service_process_names(&self) -> HashSet<String> {
        HashSet::new()
    }

    /// Names added to the session's exclusion set before monitoring starts.
    fn excluded_process_names(&self) -> HashSet<String> {
        HashSet::new()
    }

    /// Runner-specific liveness verdict. `Some(false)` ends the session on the
    /// next heartbeat no matter what the tree walk sees; `None` leaves the
    /// decision entirely to the tree.
    fn is_game_alive(&self) -> Option<bool> {
        None
    }

    /// True when [`RunnerAdapter::managed_pids`] must be merged into every
    /// tree capture.
    fn manages_process_namespace(&self) -> bool {
        false
    }
}

/// Adapter for plain native launches: no namespace, no extra knowledge.
pub struct NullRunner;

impl RunnerAdapter for NullRunner {
    fn name(&self) -> &str {
        "none"
    }
}
