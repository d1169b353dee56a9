//! HTTP surface tests against the full router with the stub provider.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use tower::ServiceExt;

use hero_core::{Engine, EngineConfig};
use hero_provider::StubProvider;
use hero_schema::User;
use hero_server::rate_limit::RateLimiter;
use hero_server::state::AppState;
use hero_store::Store;

async fn setup() -> (Router, Store, String) {
    setup_with_limiter(RateLimiter::new(1000, Duration::from_secs(60))).await
}

async fn setup_with_limiter(limiter: RateLimiter) -> (Router, Store, String) {
    let store = Store::open_in_memory().unwrap();
    store
        .create_user(User {
            id: "u1".into(),
            email: "me@example.com".into(),
            display_name: Some("Me".into()),
            password_sha256: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    let token = store.create_auth_token("u1", 24).await.unwrap();

    let engine = Engine::new(store.clone(), Arc::new(StubProvider), EngineConfig::default());
    let app = hero_server::create_router(AppState::new(engine, limiter));
    (app, store, token)
}

fn get(path: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(path);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

fn post_json(path: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_needs_no_auth_and_reports_db() {
    let (app, ..) = setup().await;
    let response = app.oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["db"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn protected_routes_require_bearer_token() {
    let (app, ..) = setup().await;
    let response = app
        .clone()
        .oneshot(get("/sessions", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.oneshot(get("/sessions", Some("bogus"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn session_crud_round_trip() {
    let (app, _, token) = setup().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/sessions",
            Some(&token),
            serde_json::json!({"name": "my chat", "agentId": "a1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session = body_json(response).await;
    let session_id = session["id"].as_str().unwrap().to_string();
    assert_eq!(session["status"], "active");

    let response = app
        .clone()
        .oneshot(get(&format!("/sessions/{session_id}"), Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Owner and coordinator participants were seeded.
    let response = app
        .clone()
        .oneshot(get(
            &format!("/sessions/{session_id}/participants"),
            Some(&token),
        ))
        .await
        .unwrap();
    let participants = body_json(response).await;
    assert_eq!(participants.as_array().unwrap().len(), 2);

    let response = app
        .clone()
        .oneshot(get("/sessions/ghost", Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/sessions/{session_id}"))
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(get(&format!("/sessions/{session_id}"), Some(&token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn message_stream_emits_ok_preamble_and_terminal_event() {
    let (app, _, token) = setup().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/sessions",
            Some(&token),
            serde_json::json!({"name": "chat", "agentId": "a1"}),
        ))
        .await
        .unwrap();
    let session_id = body_json(response).await["id"].as_str().unwrap().to_string();

    let response = app
        .oneshot(post_json(
            &format!("/sessions/{session_id}/messages/stream"),
            Some(&token),
            serde_json::json!({"content": "ping"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );

    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.starts_with(":ok\n\n"), "stream starts with :ok");
    assert!(text.contains("event: text"));
    assert!(text.contains("event: frame"));
    // Exactly one terminal event.
    assert_eq!(text.matches("event: done").count(), 1);
    assert!(!text.contains("event: error"));
}

#[tokio::test]
async fn magic_link_login_flow() {
    let (app, store, _) = setup().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/users/auth/magic-link/request",
            None,
            serde_json::json!({"email": "new@example.com"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "sent");

    // The token is delivered out of band; fetch it through the store.
    let token = store.create_magic_link("new@example.com").await.unwrap();
    let response = app
        .clone()
        .oneshot(get(
            &format!("/users/auth/magic-link/verify?token={token}"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let bearer = body["token"].as_str().unwrap().to_string();
    assert_eq!(body["user"]["email"], "new@example.com");

    // The minted token authenticates.
    let response = app
        .clone()
        .oneshot(get("/users/me/profile", Some(&bearer)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Tokens are single use.
    let response = app
        .oneshot(get(
            &format!("/users/auth/magic-link/verify?token={token}"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn api_key_lifecycle() {
    let (app, _, token) = setup().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/users/me/api-keys",
            Some(&token),
            serde_json::json!({"name": "ci"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let plaintext = body["plaintext"].as_str().unwrap().to_string();
    let key_id = body["key"]["id"].as_str().unwrap().to_string();
    assert!(plaintext.starts_with("hero_"));
    assert!(body["key"].get("sha256").is_none());

    // The key authenticates as a bearer token.
    let response = app
        .clone()
        .oneshot(get("/sessions", Some(&plaintext)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Listing never exposes the plaintext.
    let response = app
        .clone()
        .oneshot(get("/users/me/api-keys", Some(&token)))
        .await
        .unwrap();
    let keys = body_json(response).await;
    assert_eq!(keys.as_array().unwrap().len(), 1);
    assert!(keys[0].get("sha256").is_none());
    assert!(keys[0].get("plaintext").is_none());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/users/me/api-keys/{key_id}"))
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Deleted keys stop working.
    let response = app
        .oneshot(get("/sessions", Some(&plaintext)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn password_change_requires_current() {
    let (app, store, token) = setup().await;

    // First change: no password stored yet.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/users/me/password")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::from(
                    serde_json::json!({"currentPassword": "", "newPassword": "hunter2"})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Wrong current password is a 401.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/users/me/password")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::from(
                    serde_json::json!({"currentPassword": "wrong", "newPassword": "other"})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let user = store.get_user("u1").await.unwrap().unwrap();
    assert!(user.password_sha256.is_some());
}

#[tokio::test]
async fn rate_limit_exhaustion_and_headers() {
    let limiter = RateLimiter::new(3, Duration::from_secs(60));
    let (app, ..) = setup_with_limiter(limiter).await;

    for expected_remaining in [2, 1, 0] {
        let response = app.clone().oneshot(get("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["X-RateLimit-Limit"], "3");
        assert_eq!(
            response.headers()["X-RateLimit-Remaining"],
            expected_remaining.to_string().as_str()
        );
    }

    let response = app.clone().oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()["Retry-After"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);

    // A different route has its own bucket.
    let response = app.oneshot(get("/sessions", None)).await.unwrap();
    assert_ne!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn profile_update_round_trip() {
    let (app, _, token) = setup().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/users/me/profile")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::from(
                    serde_json::json!({"displayName": "New Name"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["display_name"], "New Name");
    assert_eq!(body["email"], "me@example.com");
}
