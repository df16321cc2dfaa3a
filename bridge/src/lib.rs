//! HookBridge - webhook-to-broker bridge.
//!
//! Accepts error-notification callbacks over HTTP and republishes each
//! one as a message on a RabbitMQ exchange, so downstream consumers
//! (alerting, ticketing, analytics) process error events asynchronously.
//!
//! ## Architecture
//!
//! ```text
//! Provider → POST /{endpoint} → channel pool → exchange → consumers
//! ```
//!
//! The channel pool is the core: it bounds broker channel growth under
//! request bursts and coordinates the drain-before-exit shutdown.

pub mod config;
pub mod queue;
pub mod shutdown;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use queue::{ChannelPool, OutboundMessage, PoolError};
pub use web::AppState;
