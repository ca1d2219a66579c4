//! Message bus — bounded inbound/outbound FIFO queues.

pub mod queue;
pub mod types;

pub use queue::MessageBus;
pub use types::{InboundMessage, OutboundMessage};
