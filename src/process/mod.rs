mod signal;
mod snapshot;
mod tree;

pub use signal::{SignalDeliveryError, kill_process, process_gone};
pub use snapshot::{
    ProcessSnapshot, ProcessState, ProcessTable, ProcessTableError, SystemProcessTable,
};
pub use tree::{ProcessTree, WalkOrder};
