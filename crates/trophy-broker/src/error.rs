use thiserror::Error;
use trophy_core::error::{ErrorCategory, ErrorReport, Severity};

/// Errors raised by broker bookkeeping.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// A connection id was generated twice.
    #[error("Connection already registered: {id}")]
    DuplicateConnection { id: String },

    /// An event id is still retained from an earlier publish.
    #[error("Event already published: {id}")]
    DuplicateEvent { id: String },
}

impl BrokerError {
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::DuplicateConnection { .. } => "DUPLICATE_CONNECTION",
            BrokerError::DuplicateEvent { .. } => "DUPLICATE_EVENT",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            BrokerError::DuplicateConnection { .. } => ErrorCategory::Connection,
            BrokerError::DuplicateEvent { .. } => ErrorCategory::Validation,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            BrokerError::DuplicateConnection { .. } => Severity::High,
            BrokerError::DuplicateEvent { .. } => Severity::Low,
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport::new(self.category(), self.code(), self.severity(), self.to_string())
    }
}

/// A write to one client's stream did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The client went away or the stream was closed locally.
    #[error("stream closed")]
    Closed,

    /// The client is not draining its stream fast enough.
    #[error("send buffer full")]
    Full,
}

impl SinkError {
    pub fn report(&self, conn_id: &str) -> ErrorReport {
        ErrorReport::new(
            ErrorCategory::Connection,
            "WRITE_FAILED",
            Severity::Medium,
            format!("write to {conn_id} failed: {self}"),
        )
        .with_context(serde_json::json!({ "connectionId": conn_id }))
    }
}
