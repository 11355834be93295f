//! HTTP surface of the live challenge feed.
//!
//! The binary in `main.rs` only loads config and serves [`app::build_router`];
//! everything routable lives here so integration tests can drive it in-process.

pub mod app;
pub mod http;
pub mod shutdown;
