use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::warn;

use crate::server::GatewayState;

pub const API_KEY_HEADER: &str = "x-api-key";

fn secure_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (&x, &y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Compares against every configured key without stopping at the first match.
pub fn key_is_valid(presented: &str, keys: &[String]) -> bool {
    keys.iter()
        .fold(false, |found, key| secure_eq(presented, key) | found)
}

pub async fn require_api_key(State(state): State<GatewayState>, req: Request, next: Next) -> Response {
    let presented = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match presented {
        Some(key) if key_is_valid(key, &state.api_keys) => next.run(req).await,
        _ => {
            warn!(path = %req.uri().path(), "Rejected request without a valid API key");
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "detail": "Invalid or missing API key" })),
            )
                .into_response()
        }
    }
}
