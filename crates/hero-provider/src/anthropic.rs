//! Anthropic-protocol chat provider with SSE streaming.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_core::Stream;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;

use crate::{ChunkStream, LlmProvider, LlmRequest, LlmResponse, StreamChunk};

#[derive(Debug, Clone)]
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderErrorKind {
    RateLimit,
    Overloaded,
    ServerError,
    Timeout,
    AuthError,
    InvalidRequest,
    Unknown,
}

impl ProviderErrorKind {
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            429 => Self::RateLimit,
            529 => Self::Overloaded,
            401 | 403 => Self::AuthError,
            400 | 422 => Self::InvalidRequest,
            500..=528 | 530..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Overloaded | Self::ServerError | Self::Timeout
        )
    }
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn to_api_request(request: LlmRequest, stream: bool) -> ApiRequest {
        ApiRequest {
            model: request.model,
            system: request.system,
            max_tokens: request.max_tokens,
            messages: request
                .messages
                .into_iter()
                .map(|m| ApiMessage {
                    role: m.role,
                    content: m.content,
                })
                .collect(),
            stream,
        }
    }

    async fn send(&self, payload: &ApiRequest) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.api_base);
        let resp = match self
            .client
            .post(url)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .json(payload)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(anyhow!(
                    "provider error (timeout) [retryable]: request timed out after 60s"
                ));
            }
            Err(e) if e.is_connect() => {
                return Err(anyhow!("provider error (connect) [retryable]: {e}"));
            }
            Err(e) => return Err(e.into()),
        };

        let status = resp.status();
        if status != StatusCode::OK {
            let text = resp.text().await?;
            let parsed = serde_json::from_str::<ApiError>(&text).ok();
            return Err(format_api_error(status, parsed));
        }
        Ok(resp)
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let payload = Self::to_api_request(request, false);
        let resp = self.send(&payload).await?;
        let body: ApiResponse = resp.json().await?;

        let text = body
            .content
            .iter()
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(LlmResponse {
            text,
            input_tokens: body.usage.as_ref().map(|u| u.input_tokens),
            output_tokens: body.usage.as_ref().map(|u| u.output_tokens),
            stop_reason: body.stop_reason,
        })
    }

    async fn stream(&self, request: LlmRequest) -> Result<ChunkStream> {
        let payload = Self::to_api_request(request, true);
        let resp = self.send(&payload).await?;
        Ok(Box::pin(parse_sse_stream(resp.bytes_stream())))
    }
}

fn parse_sse_stream(
    byte_stream: impl Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>>
        + Send
        + 'static,
) -> impl Stream<Item = Result<StreamChunk>> + Send {
    async_stream::stream! {
        tokio::pin!(byte_stream);
        let mut buffer = String::new();

        while let Some(chunk_result) = byte_stream.next().await {
            match chunk_result {
                Ok(bytes) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    while let Some(pos) = buffer.find("\n\n") {
                        let event_text = buffer[..pos].to_string();
                        buffer = buffer[pos + 2..].to_string();

                        for line in event_text.lines() {
                            let Some(data) = line.strip_prefix("data: ") else {
                                continue;
                            };
                            if data == "[DONE]" {
                                continue;
                            }

                            match serde_json::from_str::<serde_json::Value>(data) {
                                Ok(event) => {
                                    if let Some(chunk) = parse_sse_event(&event) {
                                        yield Ok(chunk);
                                    }
                                }
                                Err(e) => {
                                    yield Err(anyhow!("invalid sse event payload: {e}"));
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    yield Err(anyhow!("stream error: {e}"));
                    return;
                }
            }
        }
    }
}

fn parse_sse_event(event: &serde_json::Value) -> Option<StreamChunk> {
    let event_type = event.get("type")?.as_str()?;

    match event_type {
        "content_block_delta" => {
            let delta = event.get("delta")?;
            let text = delta.get("text")?.as_str()?.to_string();
            Some(StreamChunk::delta(text))
        }
        "message_delta" => {
            let delta = event.get("delta")?;
            let stop_reason = delta
                .get("stop_reason")
                .and_then(|value| value.as_str())
                .map(ToString::to_string);
            let output_tokens = event
                .get("usage")
                .and_then(|u| u.get("output_tokens"))
                .and_then(|value| value.as_u64())
                .and_then(|value| u32::try_from(value).ok());
            Some(StreamChunk::final_chunk(None, output_tokens, stop_reason))
        }
        "message_start" => {
            let input_tokens = event
                .get("message")?
                .get("usage")?
                .get("input_tokens")
                .and_then(|value| value.as_u64())
                .and_then(|value| u32::try_from(value).ok());
            Some(StreamChunk {
                delta: String::new(),
                is_final: false,
                input_tokens,
                output_tokens: None,
                stop_reason: None,
            })
        }
        _ => None,
    }
}

fn format_api_error(status: StatusCode, parsed: Option<ApiError>) -> anyhow::Error {
    let kind = ProviderErrorKind::from_status(status);
    let retryable = if kind.is_retryable() {
        " [retryable]"
    } else {
        ""
    };
    if let Some(api_error) = parsed {
        let detail = api_error.error;
        anyhow!(
            "provider error ({status}){retryable}: {} ({})",
            detail.message,
            detail.r#type
        )
    } else {
        anyhow!("provider error ({status}){retryable}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: u32,
    messages: Vec<ApiMessage>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    usage: Option<ApiUsage>,
    stop_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiErrorDetail {
    #[serde(rename = "type")]
    r#type: String,
    message: String,
}
