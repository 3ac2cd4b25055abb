//! Operational endpoints: health, metrics, admin listing and bulk delete,
//! and the cluster-wide views.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::api::{error_response, AppState, RouteQuery};
use crate::cluster::proxy::dedupe_jobs_by_id;
use crate::types::{JobId, OrchestratorError};

type ApiError = (StatusCode, String);

/// Liveness probe, used both by load balancers and by peer health checks.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "node": state.config.node_name,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Queue depth per status, peer health and live worker count.
pub async fn metrics(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let counts = state
        .store
        .counts_by_status()
        .await
        .map_err(error_response)?;
    let nodes = state.registry.snapshot().await;
    let healthy_nodes = nodes.values().filter(|h| h.healthy).count();
    let workers = match &state.workers {
        Some(pool) => pool.live_workers().await,
        None => 0,
    };

    Ok(Json(json!({
        "node": state.config.node_name,
        "jobs": counts,
        "nodes_total": nodes.len(),
        "nodes_healthy": healthy_nodes,
        "workers_live": workers,
    })))
}

/// Full recent job records for this node. Peers call this (marked internal)
/// to assemble the cluster-wide view.
pub async fn admin_jobs(
    State(state): State<AppState>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    let jobs = state.store.list_recent(500).await.map_err(error_response)?;
    let jobs = jobs
        .into_iter()
        .map(|job| serde_json::to_value(&job))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| error_response(OrchestratorError::Serialization(e)))?;
    Ok(Json(jobs))
}

#[derive(Debug, Deserialize)]
pub struct BulkDeleteRequest {
    pub job_ids: Vec<String>,
}

/// Hard cap on one bulk-delete request.
const BULK_DELETE_MAX: usize = 500;

/// Delete a batch of locally owned jobs. Ids owned elsewhere are simply not
/// found here; callers wanting a cluster-wide purge issue the request to
/// each node.
pub async fn bulk_delete(
    State(state): State<AppState>,
    Json(request): Json<BulkDeleteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.job_ids.len() > BULK_DELETE_MAX {
        return Err(error_response(OrchestratorError::Validation(format!(
            "at most {BULK_DELETE_MAX} job_ids per request"
        ))));
    }
    let ids: Vec<JobId> = request.job_ids.into_iter().map(JobId::from).collect();
    let deleted = state
        .store
        .delete_many(&ids)
        .await
        .map_err(error_response)?;
    Ok(Json(json!({"deleted": deleted})))
}

/// Configured membership with live health, as this node sees it.
pub async fn cluster_nodes(State(state): State<AppState>) -> Json<serde_json::Value> {
    let health = state.registry.snapshot().await;
    let nodes: Vec<_> = state
        .config
        .nodes
        .iter()
        .map(|(name, url)| {
            let h = health.get(name);
            json!({
                "name": name,
                "url": url,
                "healthy": h.map(|h| h.healthy).unwrap_or(false),
                "consecutive_failures": h.map(|h| h.consecutive_failures).unwrap_or(0),
                "last_checked": h.and_then(|h| h.last_checked),
                "is_self": *name == state.config.node_name,
            })
        })
        .collect();
    Json(json!({"self": state.config.node_name, "nodes": nodes}))
}

/// Cluster-wide job listing: local jobs plus a fan-out to every healthy
/// peer, merged and deduplicated. Unreachable peers degrade the view rather
/// than fail it.
pub async fn cluster_jobs(
    State(state): State<AppState>,
    Query(route): Query<RouteQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let local = state.store.list_recent(500).await.map_err(error_response)?;
    let mut all: Vec<serde_json::Value> = local
        .into_iter()
        .map(|job| serde_json::to_value(&job))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| error_response(OrchestratorError::Serialization(e)))?;

    let mut degraded: Vec<String> = Vec::new();
    if !route.forwarded() {
        for (name, url) in &state.config.nodes {
            if *name == state.config.node_name || !state.registry.is_healthy(name).await {
                continue;
            }
            match state.client.fetch_peer_jobs(url).await {
                Ok(jobs) => all.extend(jobs),
                Err(err) => {
                    warn!(node = %name, error = %err, "peer listing failed");
                    degraded.push(name.clone());
                }
            }
        }
    }

    let jobs = dedupe_jobs_by_id(all);
    Ok(Json(json!({
        "count": jobs.len(),
        "jobs": jobs,
        "degraded": degraded,
    })))
}
