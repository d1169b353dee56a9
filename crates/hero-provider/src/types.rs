use serde::{Deserialize, Serialize};

/// One message in the provider conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<LlmMessage>,
    pub max_tokens: u32,
}

impl LlmRequest {
    pub fn simple(model: String, system: Option<String>, user_text: String) -> Self {
        Self {
            model,
            system,
            messages: vec![LlmMessage::user(user_text)],
            max_tokens: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub stop_reason: Option<String>,
}

/// One unit of a streamed response. The final chunk carries usage and
/// the stop reason with an empty delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub delta: String,
    pub is_final: bool,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub stop_reason: Option<String>,
}

impl StreamChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            is_final: false,
            input_tokens: None,
            output_tokens: None,
            stop_reason: None,
        }
    }

    pub fn final_chunk(
        input_tokens: Option<u32>,
        output_tokens: Option<u32>,
        stop_reason: Option<String>,
    ) -> Self {
        Self {
            delta: String::new(),
            is_final: true,
            input_tokens,
            output_tokens,
            stop_reason,
        }
    }
}
