//! Magic-link login. Tokens are single-use, expire quickly, and are
//! delivered out of band; verification mints a bearer session token.

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;

use hero_schema::User;

use crate::error::{unauthorized, ApiResult};
use crate::state::AppState;

const AUTH_TOKEN_TTL_HOURS: i64 = 24 * 7;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users/auth/magic-link/request", post(request_magic_link))
        .route("/users/auth/magic-link/verify", get(verify_magic_link))
}

#[derive(Deserialize)]
struct MagicLinkRequest {
    email: String,
}

async fn request_magic_link(
    State(state): State<AppState>,
    Json(body): Json<MagicLinkRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let email = body.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Ok(Json(serde_json::json!({ "status": "sent" })));
    }

    let token = state.store.create_magic_link(&email).await?;
    // Delivery is an external concern; the token never appears in the
    // response.
    tracing::info!(email = %email, token = %token, "magic link issued");

    Ok(Json(serde_json::json!({ "status": "sent" })))
}

#[derive(Deserialize)]
struct VerifyQuery {
    token: String,
}

async fn verify_magic_link(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let Some(email) = state.store.consume_magic_link(&query.token).await? else {
        return Err(unauthorized("invalid or expired magic link"));
    };

    let user = match state.store.get_user_by_email(&email).await? {
        Some(user) => user,
        None => {
            let user = User {
                id: uuid::Uuid::new_v4().to_string(),
                email: email.clone(),
                display_name: None,
                password_sha256: None,
                created_at: Utc::now(),
            };
            state.store.create_user(user.clone()).await?;
            user
        }
    };

    let token = state
        .store
        .create_auth_token(&user.id, AUTH_TOKEN_TTL_HOURS)
        .await?;

    Ok(Json(serde_json::json!({
        "token": token,
        "user": user,
    })))
}
