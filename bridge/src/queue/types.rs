//! Message types for the bridge's single publishing path.

/// A message ready to be published to the broker.
///
/// Derived deterministically from one inbound webhook request: the body is
/// carried verbatim, the content type comes from the request headers.
/// Immutable once constructed.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Exchange the message is published to
    pub exchange: String,
    /// Routing key, fixed per deployment
    pub routing_key: String,
    /// Raw notification payload
    pub body: Vec<u8>,
    /// MIME type the webhook caller declared
    pub content_type: String,
}

impl OutboundMessage {
    /// Build a message from a request body and its declared content type.
    ///
    /// Callers that omit `Content-Type` get `application/octet-stream`,
    /// since the payload is treated as opaque bytes either way.
    pub fn new(
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Self {
        Self {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            content_type: content_type
                .unwrap_or("application/octet-stream")
                .to_string(),
        }
    }
}
