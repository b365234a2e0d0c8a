use std::collections::HashSet;

use lazy_static::lazy_static;

lazy_static! {
    /// Process names that never count as game processes on their own. Mostly
    /// shells, launcher plumbing and Steam/Wine service daemons. Comparison is
    /// against the short command name, which the kernel truncates to 15 bytes,
    /// hence entries like `steamerrorrepor`.
    static ref BASELINE_EXCLUDED: HashSet<&'static str> = HashSet::from([
        "PnkBstrA.exe",
        "Steam.exe",
        "SteamService.ex",
        "bash",
        "bwrap",
        "control",
        "dash",
        "gamewatch",
        "python",
        "python3",
        "regedit",
        "sh",
        "steam",
        "steamer",
        "steamerrorrepor",
        "steamwebhelper",
        "steamwebhelper.",
        "tee",
        "tr",
        "wdfmgr.exe",
        "winecfg.exe",
        "zenity",
    ]);
}

/// Set of process names to ignore when deciding whether the game is still
/// running. Frozen once monitoring starts: names can be added while a session
/// is being set up, never removed.
#[derive(Debug, Clone)]
pub struct ExclusionSet {
    names: HashSet<String>,
}

impl ExclusionSet {
    /// The built-in list of launcher plumbing and service process names.
    pub fn baseline() -> Self {
        Self {
            names: BASELINE_EXCLUDED.iter().map(|name| name.to_string()).collect(),
        }
    }

    /// An empty set, watching everything.
    pub fn empty() -> Self {
        Self {
            names: HashSet::new(),
        }
    }

    pub fn extend(&mut self, names: impl IntoIterator<Item = String>) {
        self.names.extend(names);
    }

    /// Exact, case-sensitive match on the short command name.
    pub fn is_excluded(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for ExclusionSet {
    fn default() -> Self {
        Self::baseline()
    }
}
