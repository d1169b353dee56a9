use std::time::Instant;

use hero_core::Engine;
use hero_store::Store;

use crate::rate_limit::RateLimiter;

/// Shared application state accessible from all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub store: Store,
    pub limiter: RateLimiter,
    pub started_at: Instant,
    pub version: &'static str,
}

impl AppState {
    pub fn new(engine: Engine, limiter: RateLimiter) -> Self {
        let store = engine.store().clone();
        Self {
            engine,
            store,
            limiter,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}
