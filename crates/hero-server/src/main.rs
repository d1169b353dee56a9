use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use hero_core::{Engine, EngineConfig};
use hero_provider::{AnthropicProvider, LlmProvider, StubProvider};
use hero_server::rate_limit::RateLimiter;
use hero_server::state::AppState;
use hero_store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let db_path = std::env::var("HERO_DB_PATH").unwrap_or_else(|_| "hero.db".into());
    let addr = std::env::var("HERO_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".into());

    let store = Store::open(&db_path)?;

    let provider: Arc<dyn LlmProvider> = match std::env::var("ANTHROPIC_API_KEY") {
        Ok(key) if !key.is_empty() => {
            let base = std::env::var("ANTHROPIC_API_BASE")
                .unwrap_or_else(|_| "https://api.anthropic.com".into());
            Arc::new(AnthropicProvider::new(key, base))
        }
        _ => {
            tracing::warn!("ANTHROPIC_API_KEY not set, using the stub provider");
            Arc::new(StubProvider)
        }
    };

    let mut config = EngineConfig::default();
    if let Ok(model) = std::env::var("HERO_MODEL") {
        config.model = model;
    }

    let engine = Engine::new(store, provider, config);
    let limiter = RateLimiter::new(60, Duration::from_secs(60));
    let state = AppState::new(engine, limiter);

    hero_server::serve(state, &addr).await
}
