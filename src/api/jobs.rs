//! Job submission and per-job endpoints.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{error_response, AppState, RouteQuery};
use crate::cluster::proxy::ProxiedResponse;
use crate::store::{Job, NewJob};
use crate::types::{JobId, JobInput, JobMode, OrchestratorError, OrchestratorResult};

type ApiError = (StatusCode, String);

const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "mov", "mkv", "webm", "avi", "m4v", "mp3", "wav", "aac", "flac", "ogg", "m4a", "jpg",
    "jpeg", "png", "gif", "webp", "bmp",
];

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ByUrlsRequest {
    pub urls: Vec<String>,
    #[serde(default)]
    pub mode: Option<JobMode>,
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct ByPathRequest {
    pub path: String,
    #[serde(default)]
    pub mode: Option<JobMode>,
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct ByFolderRequest {
    pub folder: String,
    #[serde(default)]
    pub mode: Option<JobMode>,
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
}

fn new_job(input: JobInput, mode: Option<JobMode>, settings: Option<serde_json::Value>) -> NewJob {
    NewJob {
        mode: mode.unwrap_or(JobMode::Pipeline),
        input,
        settings: settings.unwrap_or_else(|| json!({})),
    }
}

/// Create one job, placing it on the next healthy node in the rotation.
///
/// Forwarded requests always land locally. Peer placement re-submits the job
/// to the owner's public endpoint with the internal marker set; if the peer
/// turns out to be unreachable it is marked down and the next node in the
/// rotation gets the job instead.
async fn place_job(
    state: &AppState,
    new: NewJob,
    forwarded: bool,
) -> OrchestratorResult<serde_json::Value> {
    if forwarded || matches!(new.input, JobInput::Upload(_)) {
        // Uploads live on the receiving node's disk and are never re-placed.
        let job = state.store.create(&state.config.node_name, new).await?;
        return Ok(serde_json::to_value(&job)?);
    }

    for _ in 0..state.config.nodes.len() {
        let target = state
            .dispatcher
            .select(&state.registry)
            .await
            .ok_or(OrchestratorError::NoHealthyNodes)?;

        if target == state.config.node_name {
            let job = state.store.create(&state.config.node_name, new).await?;
            info!(job_id = %job.id, "job placed locally");
            return Ok(serde_json::to_value(&job)?);
        }

        match place_on_peer(state, &target, &new).await {
            Ok(job) => return Ok(job),
            Err(OrchestratorError::Upstream(err)) => {
                warn!(node = %target, error = %err, "placement forward failed, trying next node");
                state.registry.record_probe(&target, false).await;
            }
            Err(err) => return Err(err),
        }
    }
    Err(OrchestratorError::NoHealthyNodes)
}

async fn place_on_peer(
    state: &AppState,
    target: &str,
    new: &NewJob,
) -> OrchestratorResult<serde_json::Value> {
    let base = state
        .config
        .node_url(target)
        .ok_or_else(|| OrchestratorError::Configuration(format!("no url for node {target}")))?;

    let (path, body) = match &new.input {
        JobInput::Url(url) => (
            "/jobs/by-urls",
            json!({"urls": [url], "mode": new.mode, "settings": new.settings}),
        ),
        JobInput::Path(p) => (
            "/jobs/by-path",
            json!({"path": p, "mode": new.mode, "settings": new.settings}),
        ),
        JobInput::Upload(_) => {
            return Err(OrchestratorError::Validation(
                "uploads are always placed locally".to_string(),
            ))
        }
    };

    let response = state
        .client
        .forward(
            Method::POST,
            base,
            path,
            Some("application/json"),
            Bytes::from(serde_json::to_vec(&body)?),
        )
        .await?;
    if !(200..300).contains(&response.status) {
        return Err(OrchestratorError::Upstream(format!(
            "{target} rejected placement with {}",
            response.status
        )));
    }

    let value: serde_json::Value = serde_json::from_slice(&response.body)?;
    info!(node = %target, "job placed on peer");
    // by-urls answers with a job list, by-path with a single job.
    match value.get("jobs").and_then(|jobs| jobs.as_array()) {
        Some(jobs) => jobs
            .first()
            .cloned()
            .ok_or_else(|| OrchestratorError::Upstream(format!("{target} returned no job"))),
        None => Ok(value),
    }
}

pub async fn create_by_urls(
    State(state): State<AppState>,
    Query(route): Query<RouteQuery>,
    Json(request): Json<ByUrlsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.urls.is_empty() {
        return Err(error_response(OrchestratorError::Validation(
            "urls must not be empty".to_string(),
        )));
    }
    for url in &request.urls {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(error_response(OrchestratorError::Validation(format!(
                "not an http(s) url: {url}"
            ))));
        }
    }

    let mut created = Vec::with_capacity(request.urls.len());
    for url in request.urls {
        let new = new_job(JobInput::Url(url), request.mode, request.settings.clone());
        created.push(
            place_job(&state, new, route.forwarded())
                .await
                .map_err(error_response)?,
        );
    }
    Ok(Json(json!({"count": created.len(), "jobs": created})))
}

pub async fn create_by_path(
    State(state): State<AppState>,
    Query(route): Query<RouteQuery>,
    Json(request): Json<ByPathRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if request.path.is_empty() {
        return Err(error_response(OrchestratorError::Validation(
            "path must not be empty".to_string(),
        )));
    }
    let new = new_job(JobInput::Path(request.path), request.mode, request.settings);
    let job = place_job(&state, new, route.forwarded())
        .await
        .map_err(error_response)?;
    Ok(Json(job))
}

pub async fn create_by_folder(
    State(state): State<AppState>,
    Query(route): Query<RouteQuery>,
    Json(request): Json<ByFolderRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entries = std::fs::read_dir(&request.folder).map_err(|err| {
        error_response(OrchestratorError::Validation(format!(
            "cannot read folder {}: {err}",
            request.folder
        )))
    })?;

    let mut files: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| MEDIA_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
        })
        .map(|path| path.to_string_lossy().into_owned())
        .collect();
    files.sort();

    let mut created = Vec::with_capacity(files.len());
    for file in files {
        let new = new_job(JobInput::Path(file), request.mode, request.settings.clone());
        created.push(
            place_job(&state, new, route.forwarded())
                .await
                .map_err(error_response)?,
        );
    }
    Ok(Json(json!({"count": created.len(), "jobs": created})))
}

/// Multipart upload. The file lands under the upload directory and the job
/// is owned by this node, never dispatched elsewhere.
pub async fn create_by_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut saved: Option<String> = None;
    let mut mode: Option<JobMode> = None;
    let mut settings: Option<serde_json::Value> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error_response(OrchestratorError::Validation(format!("bad multipart: {err}")))
    })? {
        match field.name() {
            Some("file") => {
                let original = field
                    .file_name()
                    .map(sanitize_filename)
                    .unwrap_or_else(|| "upload.bin".to_string());
                let data = field.bytes().await.map_err(|err| {
                    error_response(OrchestratorError::Validation(format!(
                        "upload read failed: {err}"
                    )))
                })?;
                let dest = std::path::Path::new(&state.config.upload_dir)
                    .join(format!("{}-{original}", Uuid::new_v4()));
                let stored = async {
                    tokio::fs::create_dir_all(&state.config.upload_dir).await?;
                    tokio::fs::write(&dest, &data).await
                }
                .await;
                stored.map_err(|err| {
                    error_response(OrchestratorError::Validation(format!(
                        "could not store upload: {err}"
                    )))
                })?;
                saved = Some(dest.to_string_lossy().into_owned());
            }
            Some("mode") => {
                let raw = field.text().await.unwrap_or_default();
                mode = Some(raw.parse().map_err(error_response)?);
            }
            Some("settings") => {
                let raw = field.text().await.unwrap_or_default();
                settings = Some(serde_json::from_str(&raw).map_err(|err| {
                    error_response(OrchestratorError::Validation(format!(
                        "settings is not valid json: {err}"
                    )))
                })?);
            }
            _ => {}
        }
    }

    let Some(path) = saved else {
        return Err(error_response(OrchestratorError::Validation(
            "missing multipart field: file".to_string(),
        )));
    };
    let new = new_job(JobInput::Upload(path), mode, settings);
    let job = state
        .store
        .create(&state.config.node_name, new)
        .await
        .map_err(error_response)?;
    Ok(Json(serde_json::to_value(&job).map_err(|e| {
        error_response(OrchestratorError::Serialization(e))
    })?))
}

fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Ownership-routed reads and deletes
// ---------------------------------------------------------------------------

/// Where a job id points, seen from this node.
enum Owner {
    Local,
    Peer(String),
}

fn resolve_owner(state: &AppState, id: &JobId, forwarded: bool) -> Result<Owner, ApiError> {
    if id.is_owned_by(&state.config.node_name) || forwarded {
        return Ok(Owner::Local);
    }
    match state.config.owner_of(id) {
        Some(owner) if owner == state.config.node_name => Ok(Owner::Local),
        Some(owner) => {
            let base = state.config.node_url(owner).unwrap_or_default().to_string();
            Ok(Owner::Peer(base))
        }
        None => Err(error_response(OrchestratorError::OwnerUnknown(id.clone()))),
    }
}

fn relay(proxied: ProxiedResponse) -> Response {
    let status = StatusCode::from_u16(proxied.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = (status, proxied.body).into_response();
    if let Some(ct) = proxied.content_type.and_then(|ct| ct.parse().ok()) {
        response.headers_mut().insert(header::CONTENT_TYPE, ct);
    }
    response
}

async fn routed(
    state: &AppState,
    id: &JobId,
    forwarded: bool,
    method: Method,
    path: String,
    local: impl std::future::Future<Output = Result<Response, ApiError>>,
) -> Result<Response, ApiError> {
    match resolve_owner(state, id, forwarded)? {
        Owner::Local => local.await,
        Owner::Peer(base) => {
            let proxied = state
                .client
                .forward(method, &base, &path, None, Bytes::new())
                .await
                .map_err(error_response)?;
            Ok(relay(proxied))
        }
    }
}

async fn local_job(state: &AppState, id: &JobId) -> Result<Job, ApiError> {
    state
        .store
        .get(id)
        .await
        .map_err(error_response)?
        .ok_or_else(|| error_response(OrchestratorError::JobNotFound(id.clone())))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(route): Query<RouteQuery>,
) -> Result<Response, ApiError> {
    let id = JobId::from(id);
    let path = format!("/jobs/{id}");
    routed(&state, &id, route.forwarded(), Method::GET, path, async {
        let job = local_job(&state, &id).await?;
        Ok(Json(job).into_response())
    })
    .await
}

pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(route): Query<RouteQuery>,
) -> Result<Response, ApiError> {
    let id = JobId::from(id);
    let path = format!("/jobs/{id}");
    routed(&state, &id, route.forwarded(), Method::DELETE, path, async {
        let deleted = state.store.delete(&id).await.map_err(error_response)?;
        if !deleted {
            return Err(error_response(OrchestratorError::JobNotFound(id.clone())));
        }
        info!(job_id = %id, "job deleted");
        Ok(Json(json!({"deleted": true})).into_response())
    })
    .await
}

pub async fn get_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(route): Query<RouteQuery>,
) -> Result<Response, ApiError> {
    let id = JobId::from(id);
    let path = format!("/jobs/{id}/result");
    routed(&state, &id, route.forwarded(), Method::GET, path, async {
        let job = local_job(&state, &id).await?;
        if !job.status.is_terminal() {
            return Err((
                StatusCode::CONFLICT,
                format!("job is still {}", job.status),
            ));
        }
        Ok(Json(json!({
            "id": job.id,
            "status": job.status,
            "result": job.result,
            "error": job.error,
        }))
        .into_response())
    })
    .await
}

pub async fn get_artifacts(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(route): Query<RouteQuery>,
) -> Result<Response, ApiError> {
    let id = JobId::from(id);
    let path = format!("/jobs/{id}/artifacts");
    routed(&state, &id, route.forwarded(), Method::GET, path, async {
        let job = local_job(&state, &id).await?;
        Ok(Json(json!({
            "id": job.id,
            "artifacts": job.artifacts.unwrap_or_else(|| json!([])),
        }))
        .into_response())
    })
    .await
}

pub async fn get_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(route): Query<RouteQuery>,
) -> Result<Response, ApiError> {
    let id = JobId::from(id);
    let path = format!("/jobs/{id}/events");
    routed(&state, &id, route.forwarded(), Method::GET, path, async {
        let events = state
            .store
            .events(&id)
            .await
            .map_err(error_response)?
            .ok_or_else(|| error_response(OrchestratorError::JobNotFound(id.clone())))?;
        Ok(Json(json!({"id": id, "events": events})).into_response())
    })
    .await
}

/// Server-sent job snapshots, one per second, ending after the terminal one.
///
/// Proxying a long-lived stream through a peer would pin two nodes per
/// watcher, so non-owners answer with a redirect to the owner instead.
pub async fn stream_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(route): Query<RouteQuery>,
) -> Result<Response, ApiError> {
    let id = JobId::from(id);
    match resolve_owner(&state, &id, route.forwarded())? {
        Owner::Peer(base) => {
            let target = format!("{}/jobs/{id}/stream", base.trim_end_matches('/'));
            return Ok(Redirect::temporary(&target).into_response());
        }
        Owner::Local => {}
    }
    // Reject unknown ids before the stream starts.
    local_job(&state, &id).await?;

    let store = state.store.clone();
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(8);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let job = match store.get(&id).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(err) => {
                    warn!(job_id = %id, error = %err, "stream read failed");
                    break;
                }
            };
            let terminal = job.status.is_terminal();
            let event = match Event::default().json_data(&job) {
                Ok(event) => event,
                Err(_) => break,
            };
            if tx.send(Ok(event)).await.is_err() || terminal {
                break;
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::default())
        .into_response())
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

/// Recent jobs owned by this node, newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let jobs = state
        .store
        .list_recent(query.limit.unwrap_or(50).clamp(1, 500))
        .await
        .map_err(error_response)?;
    Ok(Json(json!({"node": state.config.node_name, "jobs": jobs})))
}
