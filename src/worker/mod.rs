//! # Worker Processes
//!
//! Jobs run in separate OS processes so a crashing decoder or model cannot
//! take the node down. [`supervisor`] spawns and babysits the processes from
//! inside the node; [`runner`] is the claim-and-execute loop each worker
//! process runs.

pub mod runner;
pub mod supervisor;

pub use runner::WorkerRunner;
pub use supervisor::WorkerPool;
