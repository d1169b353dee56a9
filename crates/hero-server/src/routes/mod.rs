pub mod auth;
pub mod health;
pub mod sessions;
pub mod users;

use axum::middleware;
use axum::Router;

use crate::state::AppState;

pub fn api_router(state: &AppState) -> Router<AppState> {
    let protected = Router::new()
        .merge(sessions::router())
        .merge(users::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::auth::auth_middleware,
        ));

    Router::new()
        .merge(health::router())
        .merge(auth::router())
        .merge(protected)
}
