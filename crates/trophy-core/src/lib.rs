pub mod config;
pub mod error;
pub mod types;

pub use config::TrophyConfig;
pub use error::{ErrorCategory, ErrorReport, Result, Severity, TrophyError};
pub use types::{ChallengeCompletion, ConnectionId, Event, EventId, EventPayload};
