//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - The bounded channel pool used for every publish
//! - The outbound message type derived from inbound webhooks

pub mod pool;
pub mod types;

pub use pool::{ChannelPool, Lease, PoolError};
pub use types::OutboundMessage;
