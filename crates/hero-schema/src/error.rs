//! Typed failure taxonomy shared by the engine and the HTTP surface.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeroError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Wraps upstream LLM failures; never surfaced raw to clients.
    #[error("provider error: {0}")]
    Provider(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("aborted")]
    Aborted,

    #[error("session busy: {0}")]
    SessionBusy(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl HeroError {
    /// HTTP status the error maps to at the route boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Auth(_) => 401,
            Self::Permission(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) | Self::SessionBusy(_) => 409,
            Self::RateLimited { .. } => 429,
            Self::Timeout(_) => 408,
            Self::Aborted => 499,
            Self::Provider(_) | Self::Internal(_) => 500,
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(HeroError::Auth("x".into()).status_code(), 401);
        assert_eq!(HeroError::Permission("x".into()).status_code(), 403);
        assert_eq!(HeroError::NotFound("x".into()).status_code(), 404);
        assert_eq!(HeroError::Conflict("x".into()).status_code(), 409);
        assert_eq!(
            HeroError::RateLimited {
                retry_after_secs: 3
            }
            .status_code(),
            429
        );
    }

    #[test]
    fn internal_redacts_detail() {
        let err = HeroError::Internal(anyhow::anyhow!("secret database path"));
        assert_eq!(err.to_string(), "internal error");
    }
}
