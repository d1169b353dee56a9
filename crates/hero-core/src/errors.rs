//! User-facing conversion of raw provider and transport failures. Raw
//! error bodies are never echoed to clients.

/// Map a raw error string onto a short, friendly message.
pub fn friendly_error_message(raw: &str) -> String {
    let lower = raw.to_lowercase();

    if lower.contains("429") {
        return "The assistant is busy right now. Please try again in a moment.".into();
    }
    if lower.contains("401") {
        return "Authentication with the language model failed. Check the configured credentials."
            .into();
    }
    if lower.contains("529") || lower.contains("overloaded") {
        return "The language model is overloaded. Please try again shortly.".into();
    }
    if lower.contains("timed out") || lower.contains("etimedout") || lower.contains("(timeout)") {
        return "The request to the language model timed out.".into();
    }
    if lower.contains("econnrefused") || lower.contains("connect") {
        return "Could not connect to the language model.".into();
    }
    // Raw JSON error bodies are never echoed.
    if raw.trim_start().starts_with('{') || raw.trim_start().starts_with('[') {
        return "The language model returned an unexpected error.".into();
    }

    "Something went wrong while generating a response.".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_rate_limit() {
        let msg = friendly_error_message("provider error (429 Too Many Requests) [retryable]");
        assert!(msg.contains("busy"));
    }

    #[test]
    fn maps_auth() {
        let msg = friendly_error_message("provider error (401 Unauthorized)");
        assert!(msg.to_lowercase().contains("authentication"));
    }

    #[test]
    fn maps_overloaded() {
        let msg = friendly_error_message("provider error (529) [retryable]");
        assert!(msg.contains("overloaded"));
    }

    #[test]
    fn maps_timeout() {
        let msg = friendly_error_message("request timed out after 60s");
        assert!(msg.contains("timed out"));
    }

    #[test]
    fn maps_connection_refused() {
        let msg = friendly_error_message("tcp connect error: ECONNREFUSED");
        assert!(msg.contains("connect"));
    }

    #[test]
    fn json_bodies_become_generic() {
        let msg = friendly_error_message(r#"{"type":"error","error":{"message":"secret"}}"#);
        assert!(!msg.contains("secret"));
        assert!(msg.contains("unexpected"));
    }

    #[test]
    fn unknown_errors_become_generic() {
        let msg = friendly_error_message("weird internal thing");
        assert!(!msg.contains("weird"));
    }
}
