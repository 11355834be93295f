use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum TrophyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Method not allowed: {method}")]
    MethodNotAllowed { method: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TrophyError {
    /// Short error code string sent to clients in JSON error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            TrophyError::Config(_) => "CONFIG_ERROR",
            TrophyError::MethodNotAllowed { .. } => "METHOD_NOT_ALLOWED",
            TrophyError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            TrophyError::MethodNotAllowed { .. } => ErrorCategory::Validation,
            _ => ErrorCategory::System,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            TrophyError::MethodNotAllowed { .. } => Severity::Low,
            TrophyError::Config(_) | TrophyError::Serialization(_) => Severity::High,
        }
    }
}

pub type Result<T> = std::result::Result<T, TrophyError>;

/// Where an error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// A single client's stream (write failure, setup after headers).
    Connection,
    /// Fan-out of one event.
    Broadcast,
    /// Bookkeeping and serialization.
    System,
    /// Rejected request.
    Validation,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Broadcast => write!(f, "broadcast"),
            Self::System => write!(f, "system"),
            Self::Validation => write!(f, "validation"),
        }
    }
}

/// Severity picks the log level; it never changes control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Structured diagnostic emitted to the log.
///
/// `context` is free-form and must never carry secrets (webhook tokens,
/// signatures).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub code: &'static str,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl ErrorReport {
    pub fn new(
        category: ErrorCategory,
        code: &'static str,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code,
            message: message.into(),
            timestamp: Utc::now(),
            severity,
            context: None,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Emit at the level the severity maps to.
    pub fn log(&self) {
        let context = self
            .context
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_default();
        match self.severity {
            Severity::Critical | Severity::High => error!(
                category = %self.category,
                code = self.code,
                severity = %self.severity,
                context = %context,
                "{}",
                self.message
            ),
            Severity::Medium => warn!(
                category = %self.category,
                code = self.code,
                severity = %self.severity,
                context = %context,
                "{}",
                self.message
            ),
            Severity::Low => info!(
                category = %self.category,
                code = self.code,
                severity = %self.severity,
                context = %context,
                "{}",
                self.message
            ),
        }
    }
}

impl From<&TrophyError> for ErrorReport {
    fn from(err: &TrophyError) -> Self {
        ErrorReport::new(err.category(), err.code(), err.severity(), err.to_string())
    }
}
