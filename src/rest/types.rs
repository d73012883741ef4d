use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::NoxError;
use crate::types::{ExecutionMode, ExecutionStatus, ScriptLanguage};

/// Body of `POST /api/execute`.
///
/// Exactly one of `script_content` or `script_id` must be set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<ScriptLanguage>,
    pub mode: ExecutionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    pub capture_output: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<String>>,
}

impl ExecutionRequest {
    /// Inline script in safe mode with output capture, the common case.
    pub fn inline(script_content: impl Into<String>, language: ScriptLanguage) -> Self {
        Self {
            script_content: Some(script_content.into()),
            language: Some(language),
            capture_output: true,
            ..Default::default()
        }
    }

    /// Client-side checks that fail fast before any dispatch.
    pub fn validate(&self) -> Result<(), NoxError> {
        match (&self.script_content, &self.script_id) {
            (None, None) => {
                return Err(NoxError::Validation(
                    "one of script_content or script_id is required".into(),
                ));
            }
            (Some(_), Some(_)) => {
                return Err(NoxError::Validation(
                    "script_content and script_id are mutually exclusive".into(),
                ));
            }
            _ => {}
        }
        if let Some(content) = &self.script_content {
            if content.trim().is_empty() {
                return Err(NoxError::Validation("script_content is empty".into()));
            }
            if self.language.is_none() {
                return Err(NoxError::Validation(
                    "language is required with script_content".into(),
                ));
            }
        }
        if self.timeout_secs == Some(0) {
            return Err(NoxError::Validation("timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Execution record returned by `/api/execute` and `/api/executions/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub last_login: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub uptime_seconds: Option<u64>,
}
