pub mod frames;
pub mod payloads;

pub use frames::{parse_stream, SseFrame};
pub use payloads::{
    ConnectedPayload, EmptyStatePayload, ErrorBody, HeartbeatPayload, PerformanceSummary,
};
