use std::fmt;

use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, RefreshKind, System};
use thiserror::Error;

/// Point-in-time copy of one process table entry. Owns its data so a captured
/// tree stays valid after the table moves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    /// Short command name as reported by the kernel: no path, no arguments,
    /// truncated to 15 bytes on Linux.
    pub name: String,
    pub state: ProcessState,
}

impl ProcessSnapshot {
    pub fn is_zombie(&self) -> bool {
        self.state == ProcessState::Zombie
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Sleeping,
    DiskSleep,
    Zombie,
    Stopped,
    Dead,
    Unknown,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letter = match self {
            ProcessState::Running => 'R',
            ProcessState::Sleeping => 'S',
            ProcessState::DiskSleep => 'D',
            ProcessState::Zombie => 'Z',
            ProcessState::Stopped => 'T',
            ProcessState::Dead => 'X',
            ProcessState::Unknown => '?',
        };
        write!(f, "{letter}")
    }
}

impl From<ProcessStatus> for ProcessState {
    fn from(status: ProcessStatus) -> Self {
        match status {
            ProcessStatus::Run => ProcessState::Running,
            ProcessStatus::Sleep
            | ProcessStatus::Idle
            | ProcessStatus::Parked
            | ProcessStatus::LockBlocked
            | ProcessStatus::Waking
            | ProcessStatus::Wakekill => ProcessState::Sleeping,
            ProcessStatus::UninterruptibleDiskSleep => ProcessState::DiskSleep,
            ProcessStatus::Zombie => ProcessState::Zombie,
            ProcessStatus::Stop | ProcessStatus::Tracing => ProcessState::Stopped,
            ProcessStatus::Dead => ProcessState::Dead,
            _ => ProcessState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("failed to read the process table: {0}")]
pub struct ProcessTableError(pub String);

/// Source of process table snapshots. The system implementation reads the live
/// OS table; tests substitute canned entries.
pub trait ProcessTable: Send {
    fn snapshot(&mut self) -> Result<Vec<ProcessSnapshot>, ProcessTableError>;
}

/// Live process table backed by [`sysinfo`], refreshing only the process list
/// and none of the per-process metrics.
pub struct SystemProcessTable {
    system: System,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: System::new_with_specifics(
                RefreshKind::nothing().with_processes(ProcessRefreshKind::nothing()),
            ),
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn snapshot(&mut self) -> Result<Vec<ProcessSnapshot>, ProcessTableError> {
        self.system.refresh_processes(ProcessesToUpdate::All, true);
        Ok(self
            .system
            .processes()
            .values()
            .map(|process| ProcessSnapshot {
                pid: process.pid().as_u32(),
                parent_pid: process.parent().map(|pid| pid.as_u32()),
                name: process.name().to_string_lossy().into_owned(),
                state: process.status().into(),
            })
            .collect())
    }
}
