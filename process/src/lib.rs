//! Subprocess plumbing: line reassembly, process groups, and single-use
//! tasks that stream their output line by line.

pub mod group;
pub mod lines;

mod task;

pub use lines::{LineReader, LineReassembler};
pub use task::{
    KillHandle, ProcessTask, TaskCommand, TaskError, TaskObserver, TaskOutcome, TaskState,
};
