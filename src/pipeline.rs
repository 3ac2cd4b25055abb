//! # Job Execution Contract
//!
//! The seam between the orchestrator and whatever actually classifies media.
//! Workers drive a [`Pipeline`] and report progress through a [`StageSink`];
//! the orchestrator never sees stage names, only the persisted trail.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::store::Job;

/// What a finished pipeline hands back. `result` lands in the job's result
/// document, `artifacts` (file paths, thumbnails) in its artifact list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub result: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<serde_json::Value>,
}

/// Progress reporting callback handed to a running pipeline.
///
/// `progress` is a fraction in `[0, 1]`. Sinks persist every call, so
/// pipelines should report per stage rather than per frame.
#[async_trait]
pub trait StageSink: Send + Sync {
    async fn stage(&self, stage: &str, progress: f64, detail: &str) -> anyhow::Result<()>;
}

/// A media-classification pipeline.
///
/// Implementations must be cancel-safe up to the final sink call: the
/// orchestrator may requeue the job if the worker dies, and a second run of
/// the same job must be able to start from scratch.
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn run(&self, job: &Job, sink: &dyn StageSink) -> anyhow::Result<PipelineOutput>;
}

/// Built-in classifier that types media by container extension.
///
/// Stands in where no model-backed pipeline is wired up. Deterministic and
/// offline, which also makes it the pipeline the worker tests run against.
pub struct MediaTypeClassifier;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "webm", "avi", "m4v"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "aac", "flac", "ogg", "m4a"];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];

impl MediaTypeClassifier {
    fn classify(value: &str) -> (&'static str, f64) {
        let ext = value
            .rsplit('.')
            .next()
            .map(|e| e.split(['?', '#']).next().unwrap_or(e).to_ascii_lowercase())
            .unwrap_or_default();
        if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            ("video", 0.9)
        } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
            ("audio", 0.9)
        } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            ("image", 0.9)
        } else {
            ("unknown", 0.2)
        }
    }
}

#[async_trait]
impl Pipeline for MediaTypeClassifier {
    async fn run(&self, job: &Job, sink: &dyn StageSink) -> anyhow::Result<PipelineOutput> {
        let input = job.input.value();
        sink.stage("probe", 0.1, input).await?;

        let (media_type, confidence) = Self::classify(input);
        sink.stage("classify", 0.8, media_type).await?;

        Ok(PipelineOutput {
            result: serde_json::json!({
                "media_type": media_type,
                "confidence": confidence,
                "input_kind": job.input.kind(),
            }),
            artifacts: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_extension() {
        assert_eq!(MediaTypeClassifier::classify("clip.mp4").0, "video");
        assert_eq!(MediaTypeClassifier::classify("/data/track.FLAC").0, "audio");
        assert_eq!(
            MediaTypeClassifier::classify("https://cdn.example.com/a.png?sig=abc").0,
            "image"
        );
        assert_eq!(MediaTypeClassifier::classify("mystery").0, "unknown");
    }
}
