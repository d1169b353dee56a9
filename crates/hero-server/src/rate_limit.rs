//! Token-bucket rate limiting middleware.
//!
//! One bucket per key (`ip:route` by default). Buckets refill
//! proportionally to elapsed time over the window. Refused requests get
//! a 429 with `Retry-After`; every decorated response carries the
//! `X-RateLimit-*` triplet. The bucket map is process-local.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after_secs: u64,
    pub reset_secs: u64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
    max: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            max,
            window,
        }
    }

    /// Refill proportionally, then try to consume one token.
    pub fn check(&self, key: &str) -> RateDecision {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter lock");
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: f64::from(self.max),
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill);
        let refill = elapsed.as_secs_f64() / self.window.as_secs_f64() * f64::from(self.max);
        bucket.tokens = (bucket.tokens + refill).min(f64::from(self.max));
        bucket.last_refill = now;

        let per_token_secs = self.window.as_secs_f64() / f64::from(self.max);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            let reset_secs =
                ((f64::from(self.max) - bucket.tokens) * per_token_secs).ceil() as u64;
            RateDecision {
                allowed: true,
                limit: self.max,
                remaining: bucket.tokens.floor() as u32,
                retry_after_secs: 0,
                reset_secs,
            }
        } else {
            let retry_after_secs = ((1.0 - bucket.tokens) * per_token_secs).ceil().max(1.0) as u64;
            RateDecision {
                allowed: false,
                limit: self.max,
                remaining: 0,
                retry_after_secs,
                reset_secs: retry_after_secs,
            }
        }
    }
}

fn client_key(request: &Request<Body>) -> String {
    let ip = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("local");
    format!("{ip}:{}", request.uri().path())
}

fn decorate(response: &mut Response, decision: &RateDecision) {
    let headers = response.headers_mut();
    headers.insert(
        "X-RateLimit-Limit",
        HeaderValue::from_str(&decision.limit.to_string()).expect("numeric header"),
    );
    headers.insert(
        "X-RateLimit-Remaining",
        HeaderValue::from_str(&decision.remaining.to_string()).expect("numeric header"),
    );
    headers.insert(
        "X-RateLimit-Reset",
        HeaderValue::from_str(&decision.reset_secs.to_string()).expect("numeric header"),
    );
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let key = client_key(&request);
    let decision = limiter.check(&key);

    if !decision.allowed {
        let mut response = Response::builder()
            .status(429)
            .header("Retry-After", decision.retry_after_secs.to_string())
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "error": "rate limited" }).to_string(),
            ))
            .expect("static response");
        decorate(&mut response, &decision);
        return response;
    }

    let mut response = next.run(request).await;
    decorate(&mut response, &decision);
    response
}
