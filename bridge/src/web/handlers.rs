//! Webhook endpoint handler.
//!
//! The handler does as little as possible:
//! 1. Validate the body (non-empty, within the size limit)
//! 2. Check a channel out of the pool
//! 3. Publish and map the outcome to a status code
//!
//! A non-2xx response tells the error-reporting provider to redeliver,
//! so nothing here retries.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::queue::{ChannelPool, OutboundMessage, PoolError};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: ChannelPool,
}

impl AppState {
    pub fn new(config: Config, pool: ChannelPool) -> Self {
        Self {
            config: Arc::new(config),
            pool,
        }
    }
}

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Webhook endpoint: republish the raw notification body on the broker.
///
/// One checkout, one publish attempt per request; the lease returns the
/// channel on every path out of this function.
pub async fn notify(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Err(status) = validate_body(&body, state.config.max_body_bytes) {
        warn!(
            body_length = body.len(),
            limit = state.config.max_body_bytes,
            "webhook_body_rejected"
        );
        return status;
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let message = OutboundMessage::new(
        &state.config.exchange_name,
        &state.config.routing_key,
        body.to_vec(),
        content_type,
    );

    let mut lease = match state.pool.checkout().await {
        Ok(lease) => lease,
        Err(e) => {
            warn!(error = %e, "webhook_checkout_failed");
            return status_for(&e);
        }
    };

    if let Err(e) = lease.publish(&message).await {
        error!(error = %e, "webhook_publish_failed");
        return status_for(&e);
    }

    info!(
        exchange = %message.exchange,
        body_length = message.body.len(),
        "webhook_published"
    );

    StatusCode::OK
}

/// Validate the raw body before any pool interaction.
///
/// Empty and oversized bodies are both the caller's fault and both get
/// 400; neither consumes a channel checkout.
fn validate_body(body: &[u8], max_bytes: usize) -> Result<(), StatusCode> {
    if body.is_empty() || body.len() > max_bytes {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(())
}

/// Map a pool or publish failure to the response status.
///
/// 503 means "retry later" (exhausted or draining), 500 means the
/// publish itself failed on a live pool.
fn status_for(error: &PoolError) -> StatusCode {
    match error {
        PoolError::Exhausted | PoolError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        PoolError::Broker(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Build the application router for the configured endpoint path.
pub fn app_router(state: AppState) -> Router {
    let path = format!("/{}", state.config.endpoint_path.trim_start_matches('/'));

    // Keep axum's limit above the handler's own check so oversized bodies
    // up to the configured cap reach `notify` and get the 400 mapping
    // rather than a framework 413.
    let body_limit = DefaultBodyLimit::max(state.config.max_body_bytes + 1024);

    Router::new()
        .route("/health", get(health))
        .route(&path, post(notify))
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
