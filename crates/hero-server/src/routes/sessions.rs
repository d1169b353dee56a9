//! Session CRUD, the frame log surface, and the streaming turn
//! endpoint.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use hero_core::{dedup_paragraphs, friendly_error_message, strip_interactions, ServerEvent};
use hero_schema::{
    Frame, FrameType, Participant, ParticipantRole, ParticipantType, PromptAnswer, Session,
    SessionStatus,
};
use hero_store::{FrameFilter, SearchFilter, SearchHit};

use crate::auth::CurrentUser;
use crate::error::{forbidden, not_found, ApiError, ApiResult};
use crate::state::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(create_session).get(list_sessions))
        .route(
            "/sessions/{id}",
            get(get_session).put(update_session).delete(delete_session),
        )
        .route("/sessions/{id}/frames", get(list_frames))
        .route("/sessions/{id}/participants", get(list_participants).post(add_participant))
        .route("/sessions/{id}/messages/stream", post(stream_message))
        .route("/sessions/{id}/permission-response", post(permission_response))
        .route("/sessions/{id}/abort", post(abort_session))
        .route("/frames/search", get(search_frames))
}

async fn owned_session(state: &AppState, user: &CurrentUser, id: &str) -> ApiResult<Session> {
    let session = state
        .store
        .get_session(id)
        .await?
        .ok_or_else(|| not_found(format!("session: {id}")))?;
    if session.owner_user_id != user.id {
        return Err(forbidden("not the session owner"));
    }
    Ok(session)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSession {
    name: String,
    agent_id: Option<String>,
}

async fn create_session(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(body): Json<CreateSession>,
) -> ApiResult<Json<Session>> {
    let session = state
        .engine
        .create_session(&user.id, &body.name, body.agent_id)
        .await?;
    Ok(Json(session))
}

async fn list_sessions(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> ApiResult<Json<Vec<Session>>> {
    Ok(Json(state.store.list_sessions(&user.id).await?))
}

async fn get_session(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Session>> {
    Ok(Json(owned_session(&state, &user, &id).await?))
}

#[derive(Deserialize)]
struct SessionUpdate {
    name: Option<String>,
    status: Option<SessionStatus>,
}

async fn update_session(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
    Json(body): Json<SessionUpdate>,
) -> ApiResult<Json<Session>> {
    owned_session(&state, &user, &id).await?;

    if let Some(name) = &body.name {
        state.store.rename_session(&id, name).await?;
    }
    if let Some(status) = body.status {
        state.store.set_session_status(&id, status).await?;
    }

    let session = state
        .store
        .get_session(&id)
        .await?
        .ok_or_else(|| not_found("session"))?;
    Ok(Json(session))
}

/// Deletion cascades to frames and participants.
async fn delete_session(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    owned_session(&state, &user, &id).await?;
    state.store.delete_session(&id).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

#[derive(Deserialize)]
struct FrameQuery {
    since_id: Option<String>,
    /// CSV of frame types.
    types: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    /// Apply display cleanup (dedup + interaction stripping) to message
    /// content. The stored payload keeps the raw form.
    #[serde(default)]
    display: bool,
}

fn parse_types(raw: &Option<String>) -> Option<Vec<FrameType>> {
    raw.as_ref().map(|csv| {
        csv.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(FrameType::parse)
            .collect()
    })
}

async fn list_frames(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
    Query(query): Query<FrameQuery>,
) -> ApiResult<Json<Vec<Frame>>> {
    owned_session(&state, &user, &id).await?;
    let mut frames = state
        .store
        .list_frames(
            &id,
            FrameFilter {
                since_id: query.since_id,
                types: parse_types(&query.types),
                limit: query.limit,
                offset: query.offset,
            },
        )
        .await?;

    if query.display {
        for frame in &mut frames {
            if frame.frame_type != FrameType::Message {
                continue;
            }
            if let Some(content) = frame.payload.get("content").and_then(|c| c.as_str()) {
                let cleaned = dedup_paragraphs(&strip_interactions(content));
                frame.payload["content"] = serde_json::Value::String(cleaned);
            }
        }
    }

    Ok(Json(frames))
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    session_id: Option<String>,
    types: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn search_frames(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<SearchHit>>> {
    let hits = state
        .store
        .search_frames(
            &user.id,
            &query.q,
            SearchFilter {
                session_id: query.session_id,
                types: parse_types(&query.types),
                limit: query.limit,
                offset: query.offset,
            },
        )
        .await?;
    Ok(Json(hits))
}

async fn list_participants(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Participant>>> {
    owned_session(&state, &user, &id).await?;
    Ok(Json(
        state.engine.participants().get_session_participants(&id).await?,
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddParticipant {
    participant_type: ParticipantType,
    participant_id: String,
    role: ParticipantRole,
    alias: Option<String>,
}

async fn add_participant(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
    Json(body): Json<AddParticipant>,
) -> ApiResult<Json<serde_json::Value>> {
    owned_session(&state, &user, &id).await?;
    state
        .engine
        .participants()
        .add(Participant {
            session_id: id,
            participant_type: body.participant_type,
            participant_id: body.participant_id,
            role: body.role,
            alias: body.alias,
            joined_at: chrono::Utc::now(),
        })
        .await?;
    Ok(Json(serde_json::json!({ "status": "added" })))
}

#[derive(Deserialize)]
struct MessageBody {
    content: String,
    #[serde(default)]
    #[allow(dead_code)]
    files: Vec<serde_json::Value>,
    #[serde(default)]
    #[allow(dead_code)]
    streaming: Option<bool>,
}

/// The streaming turn. Emits `:ok`, then SSE events mirrored from the
/// session broadcaster, with `:heartbeat-N` comments every 500 ms.
/// Dropping the response body (client disconnect) cancels the turn.
async fn stream_message(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
    Json(body): Json<MessageBody>,
) -> ApiResult<Response> {
    // Validate access before committing to a stream response.
    state
        .engine
        .participants()
        .load_session_with_agent(&id, &user.id)
        .await?;

    let mut subscription = state.engine.broadcaster().subscribe(&id);
    let cancel = CancellationToken::new();

    {
        let engine = state.engine.clone();
        let session_id = id.clone();
        let user_id = user.id.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = engine
                .process_message(&session_id, &user_id, &body.content, cancel)
                .await
            {
                // The engine publishes its own terminal events; this
                // covers failures before the turn loop starts.
                let message = friendly_error_message(&e.to_string());
                tracing::error!(session_id = %session_id, error = %e, "turn setup failed");
                engine
                    .broadcaster()
                    .publish(&session_id, ServerEvent::Error { message })
                    .await;
            }
        });
    }

    let stream = async_stream::stream! {
        // Cancels the turn when the client goes away; tied to the
        // response body, not the request.
        let _disconnect_guard = cancel.drop_guard();

        yield Ok::<Bytes, Infallible>(Bytes::from(":ok\n\n"));

        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut beats: u64 = 0;

        loop {
            tokio::select! {
                event = subscription.recv() => {
                    let Some(event) = event else { break };
                    let payload = format!(
                        "event: {}\ndata: {}\n\n",
                        event.name(),
                        event.data(),
                    );
                    yield Ok(Bytes::from(payload));
                    if event.is_terminal() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    beats += 1;
                    yield Ok(Bytes::from(format!(":heartbeat-{beats}\n\n")));
                }
            }
        }
    };

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError(e.into()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PermissionResponse {
    prompt_id: String,
    answer: String,
}

async fn permission_response(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
    Json(body): Json<PermissionResponse>,
) -> ApiResult<Json<serde_json::Value>> {
    owned_session(&state, &user, &id).await?;

    let Some(answer) = PromptAnswer::parse(&body.answer) else {
        return Ok(Json(serde_json::json!({ "resolved": false })));
    };
    let resolved = state
        .engine
        .broker()
        .handle_permission_response(&body.prompt_id, answer)
        .await?;
    Ok(Json(serde_json::json!({ "resolved": resolved })))
}

async fn abort_session(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    owned_session(&state, &user, &id).await?;
    let aborted = state.engine.abort_session(&id).await;
    Ok(Json(serde_json::json!({ "aborted": aborted })))
}
