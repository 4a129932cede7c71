//! Code execution proxy.
//!
//! Forwards run requests to a Judge0-compatible execution API so untrusted
//! code never runs in this process. The service is optional: without an
//! `EXEC_API_URL` in the environment every request fails fast with a clear
//! error instead of hanging.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while executing code
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Execution service is not configured")]
    NotConfigured,

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Execution API request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Execution API returned malformed response: {0}")]
    MalformedResponse(String),
}

/// Configuration for the execution service
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Base URL of the Judge0-compatible API
    pub api_url: String,
    /// Optional API key sent as `X-Auth-Token`
    pub api_key: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl ExecConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self, ExecError> {
        let api_url = std::env::var("EXEC_API_URL").map_err(|_| ExecError::NotConfigured)?;
        let api_key = std::env::var("EXEC_API_KEY").ok();
        Ok(Self {
            api_key,
            ..Self::new(api_url)
        })
    }
}

/// A run request from a client
#[derive(Debug, Clone, Deserialize)]
pub struct ExecRequest {
    pub language: String,
    pub source: String,
    #[serde(default)]
    pub stdin: String,
}

/// The outcome of a run
#[derive(Debug, Clone, Serialize)]
pub struct ExecResponse {
    pub stdout: String,
    pub stderr: String,
    pub status: String,
}

#[derive(Serialize)]
struct SubmissionRequest<'a> {
    language_id: u32,
    source_code: &'a str,
    stdin: &'a str,
}

#[derive(Deserialize)]
struct SubmissionResponse {
    stdout: Option<String>,
    stderr: Option<String>,
    compile_output: Option<String>,
    status: Option<SubmissionStatus>,
}

#[derive(Deserialize)]
struct SubmissionStatus {
    description: String,
}

/// Judge0 language IDs for the languages the editor offers.
fn language_id(language: &str) -> Option<u32> {
    match language {
        "c" => Some(50),
        "cpp" => Some(54),
        "go" => Some(60),
        "java" => Some(62),
        "javascript" => Some(63),
        "python" => Some(71),
        "ruby" => Some(72),
        "rust" => Some(73),
        "typescript" => Some(74),
        _ => None,
    }
}

/// Client for the execution API
pub struct ExecService {
    config: Option<ExecConfig>,
    client: Client,
}

impl ExecService {
    pub fn new(config: ExecConfig) -> Self {
        Self {
            config: Some(config),
            client: Client::new(),
        }
    }

    /// Create a service that rejects every request
    pub fn unconfigured() -> Self {
        Self {
            config: None,
            client: Client::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    /// Run a snippet and wait for the result
    pub async fn run(&self, request: &ExecRequest) -> Result<ExecResponse, ExecError> {
        let config = self.config.as_ref().ok_or(ExecError::NotConfigured)?;
        let language_id = language_id(&request.language)
            .ok_or_else(|| ExecError::UnsupportedLanguage(request.language.clone()))?;

        debug!(
            "Submitting {} snippet ({} bytes) for execution",
            request.language,
            request.source.len()
        );

        let url = format!(
            "{}/submissions?base64_encoded=false&wait=true",
            config.api_url.trim_end_matches('/')
        );

        let mut req = self
            .client
            .post(&url)
            .timeout(config.timeout)
            .json(&SubmissionRequest {
                language_id,
                source_code: &request.source,
                stdin: &request.stdin,
            });
        if let Some(key) = &config.api_key {
            req = req.header("X-Auth-Token", key);
        }

        let response = req.send().await?.error_for_status()?;
        let submission: SubmissionResponse = response
            .json()
            .await
            .map_err(|e| ExecError::MalformedResponse(e.to_string()))?;

        // Compile errors arrive in a separate field; fold them into stderr so
        // clients have one place to look.
        let mut stderr = submission.stderr.unwrap_or_default();
        if let Some(compile_output) = submission.compile_output {
            if !compile_output.is_empty() {
                if !stderr.is_empty() {
                    stderr.push('\n');
                }
                stderr.push_str(&compile_output);
            }
        }

        Ok(ExecResponse {
            stdout: submission.stdout.unwrap_or_default(),
            stderr,
            status: submission
                .status
                .map(|s| s.description)
                .unwrap_or_else(|| "Unknown".to_string()),
        })
    }
}
