pub mod anthropic;
pub mod types;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_core::Stream;
use tokio_stream::iter as stream_iter;

pub use anthropic::AnthropicProvider;
pub use types::*;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

/// A streaming chat provider. The engine treats the upstream protocol as
/// opaque; implementations translate to their wire format.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse>;

    async fn stream(&self, _request: LlmRequest) -> Result<ChunkStream> {
        anyhow::bail!("streaming not supported by this provider")
    }

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn LlmProvider>) {
        let id = id.into();
        tracing::debug!(provider = %id, "registered provider");
        self.providers.insert(id, provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn LlmProvider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("provider not found: {id}"))
    }

    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }
}

/// Deterministic echo provider used by engine tests and local dev.
pub struct StubProvider;

#[async_trait]
impl LlmProvider for StubProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let user_text = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(LlmResponse {
            text: format!("[stub:{}] {user_text}", request.model),
            input_tokens: Some(10),
            output_tokens: Some(20),
            stop_reason: Some("end_turn".into()),
        })
    }

    async fn stream(&self, request: LlmRequest) -> Result<ChunkStream> {
        let user_text = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let full_text = format!("[stub:{}] {user_text}", request.model);

        let mut chunks: Vec<Result<StreamChunk>> = full_text
            .split_whitespace()
            .map(|word| Ok(StreamChunk::delta(format!("{word} "))))
            .collect();
        chunks.push(Ok(StreamChunk::final_chunk(
            Some(10),
            Some(20),
            Some("end_turn".into()),
        )));

        Ok(Box::pin(stream_iter(chunks)))
    }
}

/// Scripted provider for tests: plays back canned responses in order and
/// repeats the last one when exhausted.
pub struct ScriptedProvider {
    responses: std::sync::Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: std::sync::Mutex::new(responses),
        }
    }

    fn next_response(&self) -> String {
        let mut responses = self.responses.lock().expect("scripted responses lock");
        if responses.len() > 1 {
            responses.remove(0)
        } else {
            responses.first().cloned().unwrap_or_default()
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, _request: LlmRequest) -> Result<LlmResponse> {
        Ok(LlmResponse {
            text: self.next_response(),
            input_tokens: Some(1),
            output_tokens: Some(1),
            stop_reason: Some("end_turn".into()),
        })
    }

    async fn stream(&self, _request: LlmRequest) -> Result<ChunkStream> {
        let text = self.next_response();
        let chunks: Vec<Result<StreamChunk>> = vec![
            Ok(StreamChunk::delta(text)),
            Ok(StreamChunk::final_chunk(
                Some(1),
                Some(1),
                Some("end_turn".into()),
            )),
        ];
        Ok(Box::pin(stream_iter(chunks)))
    }
}
