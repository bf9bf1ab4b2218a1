//! What an executor reports back after driving one delivery.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    Success,
    Failure,
}

/// Something produced or observed during a delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Artifact {
    /// Screenshot or other file captured by the driver.
    FilePath(String),

    /// Link to the published item.
    Url(String),

    Log(String),

    Json(serde_json::Value),
}

/// Result of one executor call that completed without raising.
///
/// A `Failure` report is routed exactly like an executor error: the message is
/// matched against the retryable allow-list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: ReportStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl ExecutionReport {
    pub fn success() -> Self {
        Self {
            status: ReportStatus::Success,
            message: None,
            artifacts: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: ReportStatus::Failure,
            message: Some(message.into()),
            artifacts: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ReportStatus::Success
    }
}
