use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime: u64,
    pub db: &'static str,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

/// Unauthenticated. A failing database probe is reported in the body
/// but does not change the 200.
async fn health(State(state): State<AppState>) -> Json<Health> {
    let db = match state.store.ping().await {
        Ok(()) => "ok",
        Err(e) => {
            tracing::warn!(error = %e, "health db probe failed");
            "error"
        }
    };

    Json(Health {
        status: "ok",
        version: state.version,
        uptime: state.started_at.elapsed().as_secs(),
        db,
    })
}
