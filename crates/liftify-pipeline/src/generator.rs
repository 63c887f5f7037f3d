//! HTTP code generator client
//!
//! Posts the specification (plus prior code and the failing log on a repair
//! cycle) to a generation endpoint and expects a bundle back. Each call is
//! stateless; all context travels in the request.

use async_trait::async_trait;
use liftify_core::config::GeneratorConfig;
use liftify_core::{CodeBundle, LiftifyError, Result};
use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::collaborators::{CodeGenerator, GenerationRequest};

/// File name used when the endpoint returns a single code string
const DEFAULT_FILE_NAME: &str = "main.tf";

static FENCE_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

#[derive(Debug, Serialize)]
struct GenerateBody<'a> {
    tenant: &'a str,
    service: &'a str,
    run_date: &'a str,
    attempt: u32,
    spec: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prior_code: Option<&'a BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_log: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    files: BTreeMap<String, String>,
    #[serde(default)]
    code: Option<String>,
}

/// Generator backed by an HTTP endpoint
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpGenerator {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LiftifyError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token,
        })
    }

    /// Build from config; the bearer token is read from `api_key_env` if set
    pub fn from_config(config: &GeneratorConfig) -> Result<Self> {
        let token = std::env::var(&config.api_key_env)
            .ok()
            .filter(|t| !t.trim().is_empty());
        if token.is_none() {
            debug!("{} not set, calling generator without credentials", config.api_key_env);
        }
        Self::new(
            config.endpoint.clone(),
            token,
            Duration::from_secs(config.timeout_secs),
        )
    }
}

#[async_trait]
impl CodeGenerator for HttpGenerator {
    #[instrument(skip(self, request), fields(key = %request.key, attempt = request.attempt))]
    async fn generate(&self, request: &GenerationRequest) -> Result<CodeBundle> {
        let body = GenerateBody {
            tenant: &request.key.tenant,
            service: &request.key.service,
            run_date: &request.key.run_date,
            attempt: request.attempt,
            spec: &request.spec,
            prior_code: request.prior_code.as_ref().map(|b| &b.files),
            failure_log: request.failure_log.as_deref(),
        };

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| LiftifyError::transient("generator.send", e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &error_text));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| LiftifyError::Collaborator(format!("unreadable generator response: {}", e)))?;
        bundle_from_response(parsed)
    }
}

/// Map a non-success HTTP status to a pipeline error
fn status_error(status: StatusCode, body: &str) -> LiftifyError {
    let message = format!("generator returned {}: {}", status, body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        warn!("{}", message);
        LiftifyError::transient("generator.generate", message)
    } else {
        LiftifyError::Collaborator(message)
    }
}

fn bundle_from_response(response: GenerateResponse) -> Result<CodeBundle> {
    let mut files = response.files;
    if files.is_empty() {
        if let Some(code) = response.code {
            files.insert(DEFAULT_FILE_NAME.to_string(), code);
        }
    }

    let bundle = CodeBundle {
        files: files
            .into_iter()
            .map(|(name, content)| (name, strip_code_fences(&content)))
            .collect(),
    };
    if bundle.is_empty() {
        return Err(LiftifyError::Collaborator(
            "generator returned no code".to_string(),
        ));
    }
    Ok(bundle)
}

/// Remove markdown code fences a model may wrap its output in
pub fn strip_code_fences(content: &str) -> String {
    let pattern = FENCE_PATTERN.get_or_init(|| Regex::new(r"```[A-Za-z0-9_+-]*\n|\n?```").ok());
    match pattern {
        Some(re) => re.replace_all(content, "").trim().to_string() + "\n",
        None => content.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftify_core::RunKey;

    #[test]
    fn test_strip_code_fences() {
        let raw = "```hcl\nresource \"aws_s3_bucket\" \"b\" {}\n```";
        assert_eq!(strip_code_fences(raw), "resource \"aws_s3_bucket\" \"b\" {}\n");
        assert_eq!(strip_code_fences("variable \"x\" {}"), "variable \"x\" {}\n");
    }

    #[test]
    fn test_single_code_response_becomes_main_tf() {
        let response: GenerateResponse =
            serde_json::from_str(r#"{"code": "```terraform\nterraform {}\n```"}"#).unwrap();
        let bundle = bundle_from_response(response).unwrap();
        assert_eq!(bundle.files.get("main.tf").map(String::as_str), Some("terraform {}\n"));
    }

    #[test]
    fn test_files_response() {
        let response: GenerateResponse = serde_json::from_str(
            r#"{"files": {"main.tf": "a {}", "variables.tf": "variable \"v\" {}"}}"#,
        )
        .unwrap();
        let bundle = bundle_from_response(response).unwrap();
        assert_eq!(bundle.files.len(), 2);
    }

    #[test]
    fn test_empty_response_is_rejected() {
        let response: GenerateResponse = serde_json::from_str(r#"{"files": {}}"#).unwrap();
        assert!(matches!(
            bundle_from_response(response),
            Err(LiftifyError::Collaborator(_))
        ));
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "slow down").is_transient());
        assert!(status_error(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!status_error(StatusCode::BAD_REQUEST, "bad spec").is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let generator =
            HttpGenerator::new("http://127.0.0.1:1/v1/generate", None, Duration::from_secs(2))
                .unwrap();
        let request = GenerationRequest {
            key: RunKey::new("acme", "shop", "20250101").unwrap(),
            attempt: 0,
            spec: "an s3 bucket".to_string(),
            prior_code: None,
            failure_log: None,
        };
        let err = generator.generate(&request).await.unwrap_err();
        assert!(err.is_transient());
    }
}
