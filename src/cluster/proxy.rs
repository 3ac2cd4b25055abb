//! # Cluster Client
//!
//! HTTP client for node-to-node traffic: health probes, proxying requests to
//! a job's owner, and fanning reads out across the cluster.
//!
//! Every request carries the `internal=1` query marker. A node receiving a
//! marked request answers from local state only and never forwards again, so
//! no request travels more than one hop.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use reqwest::Method;
use tracing::{debug, warn};

use crate::types::{OrchestratorError, OrchestratorResult};

/// Probes use a tighter timeout than proxied requests so one slow peer
/// cannot stall a probe pass.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Query marker identifying node-to-node requests.
pub const INTERNAL_MARKER: &str = "internal=1";

/// A proxied response, relayed to the caller verbatim.
#[derive(Debug)]
pub struct ProxiedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

#[derive(Clone)]
pub struct ClusterClient {
    client: reqwest::Client,
}

impl ClusterClient {
    pub fn new(internal_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(internal_timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// One health probe. Any transport error or non-2xx status counts as a
    /// failure.
    pub async fn probe(&self, base_url: &str) -> bool {
        let url = with_internal_marker(base_url, "/health");
        match self
            .client
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                debug!(url, error = %err, "probe failed");
                false
            }
        }
    }

    /// Relay a request to the owning node, marking it internal.
    ///
    /// The upstream response is returned as-is, including error statuses:
    /// only transport failures become [`OrchestratorError::Upstream`].
    pub async fn forward(
        &self,
        method: Method,
        base_url: &str,
        path: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> OrchestratorResult<ProxiedResponse> {
        let url = with_internal_marker(base_url, path);
        debug!(%method, url, "forwarding to owner");

        let mut request = self.client.request(method, &url);
        if let Some(ct) = content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, ct);
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|err| {
            warn!(url, error = %err, "owner unreachable");
            OrchestratorError::Upstream(err.to_string())
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response
            .bytes()
            .await
            .map_err(|err| OrchestratorError::Upstream(err.to_string()))?;

        Ok(ProxiedResponse {
            status,
            content_type,
            body,
        })
    }

    /// Fetch a peer's recent job list for the cluster-wide view. Errors are
    /// returned so the caller can decide whether to degrade or fail.
    pub async fn fetch_peer_jobs(
        &self,
        base_url: &str,
    ) -> OrchestratorResult<Vec<serde_json::Value>> {
        let url = with_internal_marker(base_url, "/admin/jobs");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| OrchestratorError::Upstream(err.to_string()))?;
        if !response.status().is_success() {
            return Err(OrchestratorError::Upstream(format!(
                "{url} returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|err| OrchestratorError::Upstream(err.to_string()))
    }
}

fn with_internal_marker(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let sep = if path.contains('?') { '&' } else { '?' };
    format!("{base}{path}{sep}{INTERNAL_MARKER}")
}

/// Merge job lists from several nodes, keeping the newest copy of each id.
///
/// Duplicates appear when a deleted-and-recreated id or a proxied write
/// races the fan-out; `updated_at` decides which copy wins.
pub fn dedupe_jobs_by_id(jobs: Vec<serde_json::Value>) -> Vec<serde_json::Value> {
    let mut newest: HashMap<String, serde_json::Value> = HashMap::new();
    for job in jobs {
        let Some(id) = job.get("id").and_then(|v| v.as_str()).map(str::to_string) else {
            continue;
        };
        match newest.get(&id) {
            Some(existing) if updated_at(existing) >= updated_at(&job) => {}
            _ => {
                newest.insert(id, job);
            }
        }
    }
    let mut merged: Vec<_> = newest.into_values().collect();
    // Newest first, matching the per-node listing order.
    merged.sort_by(|a, b| created_at(b).cmp(&created_at(a)));
    merged
}

fn updated_at(job: &serde_json::Value) -> &str {
    job.get("updated_at").and_then(|v| v.as_str()).unwrap_or("")
}

fn created_at(job: &serde_json::Value) -> &str {
    job.get("created_at").and_then(|v| v.as_str()).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn internal_marker_appended_to_plain_and_query_paths() {
        assert_eq!(
            with_internal_marker("http://10.0.0.1:9000/", "/health"),
            "http://10.0.0.1:9000/health?internal=1"
        );
        assert_eq!(
            with_internal_marker("http://10.0.0.1:9000", "/jobs?limit=5"),
            "http://10.0.0.1:9000/jobs?limit=5&internal=1"
        );
    }

    #[test]
    fn dedupe_keeps_newest_copy() {
        let jobs = vec![
            json!({"id": "a-1", "updated_at": "2026-01-01T00:00:00Z", "created_at": "2026-01-01T00:00:00Z"}),
            json!({"id": "a-1", "updated_at": "2026-01-02T00:00:00Z", "created_at": "2026-01-01T00:00:00Z"}),
            json!({"id": "b-1", "updated_at": "2026-01-01T00:00:00Z", "created_at": "2026-01-03T00:00:00Z"}),
        ];
        let merged = dedupe_jobs_by_id(jobs);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0]["id"], "b-1");
        assert_eq!(merged[1]["id"], "a-1");
        assert_eq!(merged[1]["updated_at"], "2026-01-02T00:00:00Z");
    }

    #[test]
    fn dedupe_skips_malformed_entries() {
        let jobs = vec![json!({"updated_at": "2026-01-01T00:00:00Z"}), json!({"id": "a-1"})];
        let merged = dedupe_jobs_by_id(jobs);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0]["id"], "a-1");
    }
}
