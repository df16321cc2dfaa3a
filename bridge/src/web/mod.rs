//! Web server module for handling inbound webhooks.
//!
//! A thin, fast layer: the handler validates the body, checks a channel
//! out of the pool, publishes, and maps the outcome to a status code.
//! Everything downstream of the broker is someone else's job.

pub mod handlers;

pub use handlers::{app_router, health, notify, AppState, HealthResponse};
