//! In-process pub/sub broker for challenge-completion streams.
//!
//! ```text
//!   producer ──► Hub::publish ──► EventStore.append_unique
//!                                └► Broadcaster.broadcast ──► registry.list() ──► sink.write
//!
//!   client GET ──► Hub::open_stream ──► connected ──► registry.add ──► replay
//!                                     └► heartbeat task: reap ─► heartbeat frame
//! ```
//!
//! Every teardown path (transport drop, write failure, reaping, shutdown)
//! funnels into `ConnectionRegistry::disconnect`, which acts once per
//! connection.

pub mod broadcast;
pub mod error;
mod heartbeat;
pub mod hub;
pub mod reaper;
pub mod registry;
pub mod sink;
pub mod store;

pub use broadcast::{BroadcastReport, Broadcaster};
pub use error::{BrokerError, SinkError};
pub use hub::Hub;
pub use reaper::StalenessReaper;
pub use registry::{CloseReason, Connection, ConnectionRegistry, ConnectionStats, PerformanceSnapshot};
pub use sink::{ChannelSink, EventSink, FrameStream};
pub use store::EventStore;
