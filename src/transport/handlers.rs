use super::http::{Envelope, HttpTransport};

use axum::{Extension, body::Bytes, http::StatusCode};
use std::sync::Arc;

pub async fn handle_deploy_message(
    Extension(transport): Extension<Arc<HttpTransport>>,
    body: Bytes,
) -> StatusCode {
    let envelope: Envelope = match bincode::deserialize(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Rejecting malformed deploy message: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };

    tracing::trace!(
        "Deploy message from {} on '{}' ({} bytes)",
        envelope.from,
        envelope.topic,
        envelope.payload.len()
    );

    if transport.dispatch(envelope) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}
