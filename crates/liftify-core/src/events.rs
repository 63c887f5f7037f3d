//! Inbound events: run triggers and sandbox job completions

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{JobId, JobStatus, LiftifyError, Result, RunKey};

/// Request to start (or resume) the run for a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub key: RunKey,
    /// Store path of the specification document
    pub spec_location: String,
}

impl TriggerEvent {
    /// Parse an uploaded specification object key
    ///
    /// Expected shape: `{tenant}/{service}/{date}/{file}`.
    pub fn from_object_key(object_key: &str) -> Result<Self> {
        let parts: Vec<&str> = object_key.split('/').collect();
        if parts.len() < 4 {
            return Err(LiftifyError::InputShape(format!(
                "object key '{}' must look like {{tenant}}/{{service}}/{{date}}/{{file}}",
                object_key
            )));
        }
        if parts[3..].iter().any(|p| p.is_empty()) {
            return Err(LiftifyError::InputShape(format!(
                "object key '{}' has an empty file name",
                object_key
            )));
        }

        let key = RunKey::new(parts[0], parts[1], parts[2])?;
        Ok(Self {
            key,
            spec_location: object_key.to_string(),
        })
    }
}

/// Out-of-band notification that a sandbox job changed status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Link to the runner's own log viewer
    #[serde(default)]
    pub logs_url: Option<String>,
}

impl CompletionEvent {
    pub fn new(job_id: JobId, status: JobStatus) -> Self {
        Self {
            job_id,
            status,
            logs_url: None,
        }
    }

    /// Parse a completion event from JSON
    ///
    /// Accepts the build-state-change shape
    /// (`{"detail": {"build-id": "project:ID", "build-status": ..}}`, id is the
    /// segment after the last `:`) and a direct shape with `build_id`/`BuildId`
    /// and `build_status`.
    pub fn from_json(value: &Value) -> Result<Self> {
        if let Some(detail) = value.get("detail") {
            let raw_id = str_field(detail, "build-id").ok_or_else(|| {
                LiftifyError::InputShape("completion event detail has no build-id".to_string())
            })?;
            let job_id = raw_id.rsplit(':').next().unwrap_or(raw_id);
            let status = str_field(detail, "build-status").ok_or_else(|| {
                LiftifyError::InputShape("completion event detail has no build-status".to_string())
            })?;
            let logs_url = detail
                .get("logs")
                .and_then(|l| str_field(l, "deepLink"))
                .filter(|s| !s.is_empty())
                .map(str::to_string);

            return Self::build(job_id, status, logs_url);
        }

        let job_id = str_field(value, "build_id")
            .or_else(|| str_field(value, "BuildId"))
            .or_else(|| str_field(value, "job_id"))
            .ok_or_else(|| {
                LiftifyError::InputShape("completion event has no build id".to_string())
            })?;
        let status = str_field(value, "build_status")
            .or_else(|| str_field(value, "status"))
            .ok_or_else(|| {
                LiftifyError::InputShape("completion event has no build status".to_string())
            })?;
        let logs_url = str_field(value, "logs_url")
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        Self::build(job_id, status, logs_url)
    }

    fn build(job_id: &str, status: &str, logs_url: Option<String>) -> Result<Self> {
        if job_id.trim().is_empty() {
            return Err(LiftifyError::InputShape(
                "completion event has an empty build id".to_string(),
            ));
        }
        Ok(Self {
            job_id: JobId(job_id.to_string()),
            status: JobStatus::from(status.to_string()),
            logs_url,
        })
    }
}

fn str_field<'a>(value: &'a Value, name: &str) -> Option<&'a str> {
    value.get(name).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trigger_from_object_key() {
        let event = TriggerEvent::from_object_key("acme/shop/20250101/spec.txt").unwrap();
        assert_eq!(event.key.tenant, "acme");
        assert_eq!(event.key.service, "shop");
        assert_eq!(event.key.run_date, "20250101");
        assert_eq!(event.spec_location, "acme/shop/20250101/spec.txt");
    }

    #[test]
    fn test_trigger_rejects_short_key() {
        let err = TriggerEvent::from_object_key("acme/shop/spec.txt").unwrap_err();
        assert!(matches!(err, LiftifyError::InputShape(_)));
    }

    #[test]
    fn test_trigger_rejects_trailing_slash() {
        assert!(TriggerEvent::from_object_key("acme/shop/20250101/").is_err());
    }

    #[test]
    fn test_completion_from_detail_shape() {
        let value = json!({
            "detail": {
                "build-id": "arn:aws:codebuild:region:123:build/terratest:abc-123",
                "build-status": "FAILED",
                "logs": { "deepLink": "https://logs.example/abc" }
            }
        });
        let event = CompletionEvent::from_json(&value).unwrap();
        assert_eq!(event.job_id, JobId("abc-123".to_string()));
        assert_eq!(event.status, JobStatus::Failed);
        assert_eq!(event.logs_url.as_deref(), Some("https://logs.example/abc"));
    }

    #[test]
    fn test_completion_from_direct_shape() {
        let value = json!({ "BuildId": "job-9", "build_status": "IN_PROGRESS" });
        let event = CompletionEvent::from_json(&value).unwrap();
        assert_eq!(event.job_id.as_str(), "job-9");
        assert!(!event.status.is_terminal());
        assert!(event.logs_url.is_none());
    }

    #[test]
    fn test_completion_ignores_reported_log_location() {
        let value = json!({
            "build_id": "job-3",
            "build_status": "SUCCEEDED",
            "log_path": "acme/shop/20250101/spec.txt"
        });
        let event = CompletionEvent::from_json(&value).unwrap();
        assert_eq!(event, CompletionEvent::new(JobId("job-3".to_string()), JobStatus::Succeeded));
    }

    #[test]
    fn test_completion_missing_id() {
        let value = json!({ "build_status": "SUCCEEDED" });
        assert!(matches!(
            CompletionEvent::from_json(&value),
            Err(LiftifyError::InputShape(_))
        ));
    }
}
