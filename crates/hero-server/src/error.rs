//! Route-boundary error mapping. Typed `HeroError`s surface with their
//! status code; everything else is a redacted 500.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use hero_schema::HeroError;

pub struct ApiError(pub anyhow::Error);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Some(hero) = self.0.downcast_ref::<HeroError>() {
            let status = StatusCode::from_u16(hero.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let mut response =
                (status, Json(serde_json::json!({ "error": hero.to_string() }))).into_response();
            if let HeroError::RateLimited { retry_after_secs } = hero {
                if let Ok(value) = retry_after_secs.to_string().parse() {
                    response.headers_mut().insert("Retry-After", value);
                }
            }
            return response;
        }

        tracing::error!(error = ?self.0, "internal error");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": "internal error" })),
        )
            .into_response()
    }
}

pub fn not_found(what: impl Into<String>) -> ApiError {
    ApiError(HeroError::not_found(what.into()).into())
}

pub fn forbidden(what: impl Into<String>) -> ApiError {
    ApiError(HeroError::Permission(what.into()).into())
}

pub fn unauthorized(what: impl Into<String>) -> ApiError {
    ApiError(HeroError::Auth(what.into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hero_errors_keep_status() {
        let response = ApiError(HeroError::NotFound("session".into()).into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ApiError(HeroError::Auth("bad key".into()).into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let response = ApiError(
            HeroError::RateLimited {
                retry_after_secs: 7,
            }
            .into(),
        )
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["Retry-After"], "7");
    }

    #[test]
    fn unknown_errors_are_redacted_500s() {
        let response = ApiError(anyhow::anyhow!("secret detail")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
