//! Process-wide IPC substrate.
//!
//! Named counting semaphores with the *ended* idiom, named shared-memory
//! segments, and a task registry with a symbol table for launching named
//! tasks. The whole substrate is an explicit context struct ([`Ipc`])
//! threaded through the protocol engines; there are no hidden globals.

mod sem;
mod shm;
mod task;

pub use sem::{Sem, SemDiscipline, SemId, SemTable, SemTake, SM_NO_KEY};
pub use shm::{ShmSegment, ShmTable, SHM_NO_KEY};
pub use task::{TaskArgs, TaskId, TaskRegistry};

use std::sync::Arc;

/// The IPC context shared by every component of a node.
#[derive(Debug, Default)]
pub struct Ipc {
    /// Semaphore table
    pub sems: SemTable,
    /// Shared-memory segment table
    pub shm: ShmTable,
    /// Task registry and symbol table
    pub tasks: TaskRegistry,
}

impl Ipc {
    /// Return a fresh IPC context.
    pub fn new() -> Arc<Ipc> {
        Arc::new(Ipc::default())
    }
}
