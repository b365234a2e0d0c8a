use std::time::Duration;
use std::{env, fs, path::PathBuf};

use nestify::nest;
use serde::{Deserialize, Serialize};

use crate::prelude::*;

/// Delay between two heartbeat ticks of the supervisor.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(1500);
/// Grace period during which an empty process tree means "still starting up".
pub const DEFAULT_WARMUP: Duration = Duration::from_secs(5 * 60);
/// Consecutive ticks without a watched child before the session is declared over.
pub const DEFAULT_MAX_IDLE_TICKS: u32 = 15;
/// Bytes of combined stdout/stderr kept in memory (oldest output dropped first).
pub const DEFAULT_CAPTURE_LIMIT_BYTES: usize = 256 * 1024;

nest! {
    #[derive(Debug, Default, Deserialize, Serialize)]*
    #[serde(rename_all = "kebab-case", default)]*
    /// Persistent configuration for gamewatch.
    ///
    /// Stored in the filesystem following the XDG Base Directory Specification,
    /// typically at `~/.config/gamewatch/config.yaml`. Every field is optional;
    /// command line flags take precedence over file values.
    ///
    /// ```yaml
    /// session:
    ///   heartbeat-ms: 1000
    ///   max-idle-ticks: 10
    /// launch:
    ///   terminal: alacritty
    ///   excluded: [gamemoded, mangohud]
    /// ```
    pub struct FileConfig {
        pub session: pub struct SessionFileConfig {
            pub heartbeat_ms: Option<u64>,
            pub warmup_secs: Option<u64>,
            pub max_idle_ticks: Option<u32>,
            pub capture_limit_bytes: Option<usize>,
            pub echo_output: Option<bool>,
        },
        pub launch: pub struct LaunchFileConfig {
            pub terminal: Option<String>,
            pub excluded: Vec<String>,
        },
    }
}

/// Get the path to the configuration file, following the XDG Base Directory Specification
/// at https://specifications.freedesktop.org/basedir-spec/basedir-spec-latest.html
fn get_configuration_file_path() -> PathBuf {
    let config_dir = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = env::var("HOME").expect("HOME env variable not set");
            PathBuf::from(home).join(".config")
        });
    config_dir.join("gamewatch").join("config.yaml")
}

impl FileConfig {
    /// Load the configuration. If the file does not exist, return a default configuration.
    pub fn load() -> Result<Self> {
        let config_path = get_configuration_file_path();

        match fs::read(&config_path) {
            Ok(config_str) => {
                let config: FileConfig = serde_yaml::from_slice(&config_str).context(format!(
                    "Failed to parse gamewatch config at {}",
                    config_path.display()
                ))?;
                debug!("Config loaded from {}", config_path.display());
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Config file not found at {}", config_path.display());
                Ok(FileConfig::default())
            }
            Err(e) => bail!("Failed to load config: {e}"),
        }
    }
}

/// Resolved knobs driving one supervised session.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub heartbeat: Duration,
    pub warmup: Duration,
    pub max_idle_ticks: u32,
    pub capture_limit_bytes: usize,
    pub echo_output: bool,
    /// Process names ignored on top of the built-in exclusion list.
    pub extra_exclusions: Vec<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT,
            warmup: DEFAULT_WARMUP,
            max_idle_ticks: DEFAULT_MAX_IDLE_TICKS,
            capture_limit_bytes: DEFAULT_CAPTURE_LIMIT_BYTES,
            echo_output: true,
            extra_exclusions: Vec::new(),
        }
    }
}
