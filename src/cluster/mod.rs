//! # Cluster Coordination
//!
//! Static-membership cluster plumbing: health tracking for configured peers,
//! round-robin dispatch of new jobs, and the HTTP client used for
//! node-to-node traffic.

pub mod dispatch;
pub mod proxy;
pub mod registry;

pub use dispatch::Dispatcher;
pub use proxy::ClusterClient;
pub use registry::NodeRegistry;
