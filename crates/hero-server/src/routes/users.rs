//! Profile, password, and API-key management for the current user.

use axum::extract::{Path, State};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use hero_schema::ApiKey;
use hero_store::users::{generate_api_key, sha256_hex};

use crate::auth::{digest_matches, CurrentUser};
use crate::error::{not_found, unauthorized, ApiResult};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users/me/profile", get(get_profile).put(update_profile))
        .route("/users/me/password", put(change_password))
        .route("/users/me/api-keys", post(create_api_key).get(list_api_keys))
        .route("/users/me/api-keys/{id}", axum::routing::delete(delete_api_key))
}

async fn get_profile(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> ApiResult<Json<hero_schema::User>> {
    let user = state
        .store
        .get_user(&user.id)
        .await?
        .ok_or_else(|| not_found("user"))?;
    Ok(Json(user))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileUpdate {
    display_name: Option<String>,
    email: Option<String>,
}

async fn update_profile(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(body): Json<ProfileUpdate>,
) -> ApiResult<Json<hero_schema::User>> {
    state
        .store
        .update_user_profile(&user.id, body.display_name, body.email)
        .await?;
    let user = state
        .store
        .get_user(&user.id)
        .await?
        .ok_or_else(|| not_found("user"))?;
    Ok(Json(user))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PasswordChange {
    current_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(body): Json<PasswordChange>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = state
        .store
        .get_user(&user.id)
        .await?
        .ok_or_else(|| not_found("user"))?;

    if let Some(stored) = &record.password_sha256 {
        let provided = sha256_hex(&body.current_password);
        if !digest_matches(stored, &provided) {
            return Err(unauthorized("wrong current password"));
        }
    }

    state
        .store
        .set_user_password(&user.id, &sha256_hex(&body.new_password))
        .await?;
    Ok(Json(serde_json::json!({ "status": "updated" })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiKeyRequest {
    name: String,
    #[serde(default)]
    scopes: Vec<String>,
    expires_at: Option<DateTime<Utc>>,
}

/// The plaintext key appears in this response and never again.
async fn create_api_key(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(body): Json<ApiKeyRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let generated = generate_api_key();
    let key = ApiKey {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user.id.clone(),
        name: body.name,
        prefix: generated.prefix.clone(),
        sha256: generated.sha256.clone(),
        scopes: body.scopes,
        expires_at: body.expires_at,
        created_at: Utc::now(),
        last_used_at: None,
    };
    state.store.insert_api_key(key.clone()).await?;

    Ok(Json(serde_json::json!({
        "key": key,
        "plaintext": generated.plaintext,
    })))
}

async fn list_api_keys(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> ApiResult<Json<Vec<ApiKey>>> {
    Ok(Json(state.store.list_api_keys(&user.id).await?))
}

async fn delete_api_key(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.store.delete_api_key(&user.id, &id).await? {
        return Err(not_found("api key"));
    }
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}
