use crate::models::TaskStatus;
use crate::{EngineError, Result};
use serde::Serialize;
use std::time::Duration;

const STATUS_API_TIMEOUT_SECS: u64 = 10;

/// Outward-facing status notifications. Callers treat both calls as best-effort.
pub trait StatusReporter: Send + Sync {
    fn notify_status(&self, video_id: &str, task_id: &str, status: TaskStatus) -> Result<()>;

    fn notify_completion(
        &self,
        video_id: &str,
        task_id: &str,
        file_size: u64,
        file_path: &str,
        status: TaskStatus,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStatusReporter;

impl StatusReporter for NoopStatusReporter {
    fn notify_status(&self, _video_id: &str, _task_id: &str, _status: TaskStatus) -> Result<()> {
        Ok(())
    }

    fn notify_completion(
        &self,
        _video_id: &str,
        _task_id: &str,
        _file_size: u64,
        _file_path: &str,
        _status: TaskStatus,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
struct StatusPayload<'a> {
    task_id: &'a str,
    status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_path: Option<&'a str>,
}

/// Posts status changes as JSON to `<base_url>/api/videos/<video_id>/download-status`.
#[derive(Debug, Clone)]
pub struct HttpStatusReporter {
    base_url: url::Url,
    agent: ureq::Agent,
}

impl HttpStatusReporter {
    pub fn new(base_url: &str) -> Result<Self> {
        let parsed = url::Url::parse(base_url.trim())
            .map_err(|e| EngineError::InvalidConfig(format!("invalid status api url: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.cannot_be_a_base() {
            return Err(EngineError::InvalidConfig(format!(
                "status api url must be http(s): {base_url}"
            )));
        }
        Ok(Self {
            base_url: parsed,
            agent: build_http_agent(STATUS_API_TIMEOUT_SECS),
        })
    }

    /// `video_id` is pushed as a single path segment, so `/` and spaces are
    /// percent-encoded.
    pub fn endpoint_for(&self, video_id: &str) -> String {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["api", "videos", video_id, "download-status"]);
        }
        url.to_string()
    }

    fn post(&self, video_id: &str, payload: &StatusPayload<'_>) -> Result<()> {
        let body = serde_json::to_string(payload)?;
        let resp = self
            .agent
            .post(&self.endpoint_for(video_id))
            .header("Content-Type", "application/json")
            .send(body.as_str())
            .map_err(|e| EngineError::Http(e.to_string()))?;
        let status = resp.status();
        if status.as_u16() >= 400 {
            return Err(EngineError::Http(format!(
                "status api rejected update for {video_id} (status={status})"
            )));
        }
        Ok(())
    }
}

pub(crate) fn build_http_agent(timeout_secs: u64) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .http_status_as_error(false)
        .timeout_global(Some(Duration::from_secs(timeout_secs.max(1))))
        .build();
    config.into()
}

impl StatusReporter for HttpStatusReporter {
    fn notify_status(&self, video_id: &str, task_id: &str, status: TaskStatus) -> Result<()> {
        self.post(
            video_id,
            &StatusPayload {
                task_id,
                status,
                file_size: None,
                file_path: None,
            },
        )
    }

    fn notify_completion(
        &self,
        video_id: &str,
        task_id: &str,
        file_size: u64,
        file_path: &str,
        status: TaskStatus,
    ) -> Result<()> {
        self.post(
            video_id,
            &StatusPayload {
                task_id,
                status,
                file_size: Some(file_size),
                file_path: Some(file_path),
            },
        )
    }
}
