//! Bearer authentication: `hero_` API keys or magic-link session
//! tokens. The resolved user lands in request extensions.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::unauthorized;
use crate::state::AppState;

#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: String,
}

pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Constant-time comparison of two hex digests.
pub fn digest_matches(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let Some(token) = token else {
        return unauthorized("missing bearer token").into_response();
    };

    let user_id = if token.starts_with(hero_store::users::API_KEY_PREFIX) {
        match state.store.find_api_key(token).await {
            Ok(Some(key)) => Some(key.user_id),
            Ok(None) => None,
            Err(e) => {
                tracing::error!(error = %e, "api key lookup failed");
                None
            }
        }
    } else {
        match state.store.find_auth_token_user(token).await {
            Ok(user_id) => user_id,
            Err(e) => {
                tracing::error!(error = %e, "auth token lookup failed");
                None
            }
        }
    };

    let Some(user_id) = user_id else {
        return unauthorized("invalid or expired credentials").into_response();
    };

    request.extensions_mut().insert(CurrentUser { id: user_id });
    next.run(request).await
}
