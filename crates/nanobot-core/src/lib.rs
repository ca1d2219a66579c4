//! Nanobot core — message bus, session store, config, and shared types.
//!
//! This crate has no knowledge of LLMs, tools, or channels; it only defines
//! the contracts (`InboundMessage`/`OutboundMessage`, `Session`, `Config`)
//! and the primitives (`MessageBus`, `SessionManager`, `HeartbeatService`)
//! that the rest of the workspace is built on.

pub mod bus;
pub mod config;
pub mod errors;
pub mod heartbeat;
pub mod session;
pub mod types;
pub mod utils;

pub use errors::{NanobotError, NanobotResult};
