//! # classd
//!
//! Shared-nothing cluster node for long-running media-classification jobs.
//! Each node keeps its own embedded job queue; any node can answer for any
//! job by routing on the id's node-name prefix, and new jobs are spread over
//! healthy nodes round-robin. Jobs execute in supervised worker processes so
//! a crashing pipeline never takes the node down.

pub mod api;
pub mod cluster;
pub mod config;
pub mod pipeline;
pub mod store;
pub mod types;
pub mod worker;

pub use config::NodeConfig;
pub use store::{Job, JobStore, NewJob};
pub use types::{JobId, JobInput, JobMode, JobStatus, OrchestratorError, OrchestratorResult};
