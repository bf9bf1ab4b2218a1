//! AlertSink port: operator notifications.
//!
//! # Implementations
//! - TracingAlertSink: writes alerts to the log (default)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    CircuitOpened,
    CircuitHalfOpen,
    CircuitClosed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Must not block: alerts are raised while component state is being updated.
pub trait AlertSink: Send + Sync {
    fn alert(&self, alert: Alert);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn alert(&self, alert: Alert) {
        match alert.kind {
            AlertKind::CircuitOpened => tracing::warn!(
                kind = ?alert.kind,
                details = %alert.details,
                "{}",
                alert.message
            ),
            _ => tracing::info!(kind = ?alert.kind, "{}", alert.message),
        }
    }
}
