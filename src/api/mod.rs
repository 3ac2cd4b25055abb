//! # HTTP API
//!
//! Public surface of a node. Job reads and deletes are routed to the owning
//! node by id prefix; new jobs are spread over healthy nodes round-robin.
//! Requests carrying the `internal=1` marker came from a peer and are always
//! answered from local state, which keeps every request to at most one hop.

pub mod jobs;
pub mod ops;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Deserialize;

use crate::cluster::{ClusterClient, Dispatcher, NodeRegistry};
use crate::config::NodeConfig;
use crate::store::JobStore;
use crate::types::OrchestratorError;
use crate::worker::WorkerPool;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<NodeConfig>,
    pub store: JobStore,
    pub registry: NodeRegistry,
    pub dispatcher: Arc<Dispatcher>,
    pub client: ClusterClient,
    /// Present only in the node binary; API-only test routers run without a
    /// pool.
    pub workers: Option<WorkerPool>,
}

/// Query parameters shared by every routed endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct RouteQuery {
    /// Set by peers when forwarding. Marked requests are served locally and
    /// never forwarded again.
    internal: Option<String>,
}

impl RouteQuery {
    pub fn forwarded(&self) -> bool {
        matches!(self.internal.as_deref(), Some("1") | Some("true"))
    }
}

/// Build the complete router for one node.
pub fn create_router(state: AppState) -> Router {
    let max_body = state.config.max_upload_mb * 1024 * 1024;
    Router::new()
        .route("/jobs/by-urls", post(jobs::create_by_urls))
        .route("/jobs/by-path", post(jobs::create_by_path))
        .route("/jobs/by-folder", post(jobs::create_by_folder))
        .route("/jobs/upload", post(jobs::create_by_upload))
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id", delete(jobs::delete_job))
        .route("/jobs/:id/result", get(jobs::get_result))
        .route("/jobs/:id/artifacts", get(jobs::get_artifacts))
        .route("/jobs/:id/events", get(jobs::get_events))
        .route("/jobs/:id/stream", get(jobs::stream_job))
        .route("/jobs/bulk-delete", post(ops::bulk_delete))
        .route("/admin/jobs", get(ops::admin_jobs))
        .route("/health", get(ops::health))
        .route("/metrics", get(ops::metrics))
        .route("/cluster/nodes", get(ops::cluster_nodes))
        .route("/cluster/jobs", get(ops::cluster_jobs))
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(state)
}

/// Map orchestrator errors onto HTTP status codes.
pub(crate) fn error_response(err: OrchestratorError) -> (StatusCode, String) {
    let status = match &err {
        OrchestratorError::JobNotFound(_) | OrchestratorError::OwnerUnknown(_) => {
            StatusCode::NOT_FOUND
        }
        OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::Upstream(_) => StatusCode::BAD_GATEWAY,
        OrchestratorError::NoHealthyNodes => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::Configuration(_)
        | OrchestratorError::Store(_)
        | OrchestratorError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}
