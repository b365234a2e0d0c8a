use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tempfile::TempDir;
use thiserror::Error;

use crate::prelude::*;

/// Fixed name of the terminal wrapper script. Kept under the 15 byte comm
/// limit so the script process shows up under exactly this name in the
/// process table and can be excluded from the watched-children count.
pub const TERMINAL_SCRIPT_NAME: &str = "run-in-term.sh";

/// Everything needed to start one game session.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    /// Argv of the game command, first element is the executable.
    pub command: Vec<String>,
    /// Environment entries applied to the game only, not to a wrapping
    /// terminal application.
    pub env: BTreeMap<String, String>,
    /// Working directory, `~` expanded. Falls back to the runner's preferred
    /// directory and then to the system temp directory.
    pub working_directory: Option<String>,
    /// Terminal application to wrap the command in, if any.
    pub terminal: Option<String>,
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("cannot launch an empty command")]
    EmptyCommand,
    #[error("working directory {0:?} does not exist")]
    MissingWorkingDirectory(PathBuf),
    #[error("terminal application {0:?} is not available on PATH")]
    TerminalNotFound(String),
    #[error("failed to write the terminal wrapper script")]
    Script(#[source] std::io::Error),
    #[error("failed to spawn {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// Spawned game process plus the terminal wrapper artifacts keeping it alive.
#[derive(Debug)]
pub struct LaunchedGame {
    pub child: Child,
    pub wrapper: Option<TerminalWrapper>,
}

/// Owns the on-disk wrapper script for the lifetime of the session and knows
/// which extra process names the wrapper introduces into the tree.
#[derive(Debug)]
pub struct TerminalWrapper {
    _dir: TempDir,
    excluded_names: Vec<String>,
}

impl TerminalWrapper {
    /// The wrapper's own process names: the script and the terminal binary.
    pub fn excluded_names(&self) -> &[String] {
        &self.excluded_names
    }
}

/// Spawn the requested command with piped stdout and stderr, either directly
/// or inside a terminal application via a generated wrapper script. Never
/// falls back silently: an unresolvable terminal is the caller's decision to
/// handle.
pub fn launch(request: &LaunchRequest) -> Result<LaunchedGame, LaunchError> {
    if request.command.is_empty() {
        return Err(LaunchError::EmptyCommand);
    }
    let cwd = resolve_working_directory(request.working_directory.as_deref())?;

    match &request.terminal {
        Some(terminal) => {
            let terminal_path = find_executable(terminal)
                .ok_or_else(|| LaunchError::TerminalNotFound(terminal.clone()))?;
            launch_in_terminal(request, &terminal_path, &cwd)
        }
        None => launch_direct(request, &cwd),
    }
}

fn launch_direct(request: &LaunchRequest, cwd: &Path) -> Result<LaunchedGame, LaunchError> {
    debug!("launching: {}", shell_words::join(&request.command));

    let mut command = Command::new(&request.command[0]);
    command
        .args(&request.command[1..])
        .envs(&request.env)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let child = command.spawn().map_err(|source| LaunchError::Spawn {
        command: request.command[0].clone(),
        source,
    })?;

    Ok(LaunchedGame {
        child,
        wrapper: None,
    })
}

fn launch_in_terminal(
    request: &LaunchRequest,
    terminal_path: &Path,
    cwd: &Path,
) -> Result<LaunchedGame, LaunchError> {
    let dir = TempDir::new().map_err(LaunchError::Script)?;
    let script_path = dir.path().join(TERMINAL_SCRIPT_NAME);
    fs::write(&script_path, wrapper_script(request, cwd)).map_err(LaunchError::Script)?;
    fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))
        .map_err(LaunchError::Script)?;

    debug!(
        "launching in {}: {}",
        terminal_path.display(),
        script_path.display()
    );

    // The game env goes into the script, not into the terminal application.
    let mut command = Command::new(terminal_path);
    command
        .arg("-e")
        .arg(&script_path)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let child = command.spawn().map_err(|source| LaunchError::Spawn {
        command: terminal_path.display().to_string(),
        source,
    })?;

    Ok(LaunchedGame {
        child,
        wrapper: Some(TerminalWrapper {
            _dir: dir,
            excluded_names: terminal_excluded_names(terminal_path),
        }),
    })
}

fn terminal_excluded_names(terminal_path: &Path) -> Vec<String> {
    let mut names = vec![TERMINAL_SCRIPT_NAME.to_string()];
    if let Some(terminal_name) = terminal_path.file_name() {
        names.push(terminal_name.to_string_lossy().into_owned());
    }
    names
}

/// Body of the wrapper script: enter the working directory, export the game
/// env, run the command, then keep the terminal window open on a plain shell.
fn wrapper_script(request: &LaunchRequest, cwd: &Path) -> String {
    let mut script = String::from("#!/bin/sh\n");
    script.push_str(&format!(
        "cd {}\n",
        shell_words::quote(&cwd.to_string_lossy())
    ));
    for (key, value) in &request.env {
        script.push_str(&format!("export {}={}\n", key, shell_words::quote(value)));
    }
    script.push_str(&shell_words::join(&request.command));
    script.push('\n');
    script.push_str("exec sh # Keep term open\n");
    script
}

fn resolve_working_directory(dir: Option<&str>) -> Result<PathBuf, LaunchError> {
    let dir = match dir {
        Some(dir) => PathBuf::from(shellexpand::tilde(dir).as_ref()),
        None => std::env::temp_dir(),
    };
    if !dir.is_dir() {
        return Err(LaunchError::MissingWorkingDirectory(dir));
    }
    Ok(dir)
}

/// Resolve a program name against PATH, or check it directly when it already
/// carries a path separator.
fn find_executable(name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let candidate = PathBuf::from(name);
        return is_executable(&candidate).then_some(candidate);
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
