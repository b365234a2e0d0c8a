use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("failed to signal pid {pid}: {errno}")]
pub struct SignalDeliveryError {
    pub pid: u32,
    errno: Errno,
}

/// Deliver SIGKILL to a single process. `Ok(true)` means the signal went out,
/// `Ok(false)` that the process was already gone. A pid vanishing between the
/// tree walk and the kill is normal, not a failure.
pub fn kill_process(pid: u32) -> Result<bool, SignalDeliveryError> {
    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(SignalDeliveryError { pid, errno }),
    }
}

/// True once the pid designates neither a live nor a zombie process.
pub fn process_gone(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None) == Err(Errno::ESRCH)
}
