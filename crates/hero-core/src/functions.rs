//! Named function handlers invokable from agent interactions.
//!
//! Handlers are registered under a name; several handlers may stack on
//! the same name. A handler that does not recognize the request calls
//! `next` to pass it down the stack (middleware semantics).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use hero_schema::FunctionOutcome;
use hero_store::Store;

const MAX_OUTPUT_BYTES: usize = 50_000;

/// Execution context handed to every function handler.
#[derive(Clone)]
pub struct FunctionCtx {
    pub session_id: String,
    pub user_id: String,
    pub agent_id: Option<String>,
    pub store: Store,
    pub delegation_depth: u32,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait FunctionHandler: Send + Sync {
    fn name(&self) -> &str;

    /// JSON schema describing the accepted arguments.
    fn schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &FunctionCtx,
        next: Next<'_>,
    ) -> Result<FunctionOutcome>;
}

/// Remaining handler stack below the current one.
pub struct Next<'a> {
    remaining: &'a [Arc<dyn FunctionHandler>],
    ctx: &'a FunctionCtx,
}

impl<'a> Next<'a> {
    pub fn run(self, args: serde_json::Value) -> BoxFuture<'a, Result<FunctionOutcome>> {
        Box::pin(async move {
            match self.remaining.split_first() {
                Some((head, rest)) => {
                    head.execute(
                        args,
                        self.ctx,
                        Next {
                            remaining: rest,
                            ctx: self.ctx,
                        },
                    )
                    .await
                }
                None => Ok(FunctionOutcome::failed("no handler accepted the request")),
            }
        })
    }
}

#[derive(Clone, Default)]
pub struct FunctionRegistry {
    handlers: HashMap<String, Vec<Arc<dyn FunctionHandler>>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ExecuteCommandFunction::new(30)));
        registry
    }

    /// Register a handler. Later registrations run first, deferring to
    /// earlier ones via `next`.
    pub fn register(&mut self, handler: Arc<dyn FunctionHandler>) {
        self.handlers
            .entry(handler.name().to_string())
            .or_default()
            .insert(0, handler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn schemas(&self) -> Vec<(String, serde_json::Value)> {
        self.handlers
            .iter()
            .filter_map(|(name, stack)| {
                stack.first().map(|h| (name.clone(), h.schema()))
            })
            .collect()
    }

    pub async fn execute(
        &self,
        name: &str,
        args: serde_json::Value,
        ctx: &FunctionCtx,
    ) -> Result<FunctionOutcome> {
        let stack = self
            .handlers
            .get(name)
            .ok_or_else(|| anyhow!("function not found: {name}"))?;
        Next {
            remaining: stack,
            ctx,
        }
        .run(args)
        .await
    }
}

// ------------------------------------------------------------
// Builtins
// ------------------------------------------------------------

/// Runs a shell command with a timeout, capturing stdout and stderr.
pub struct ExecuteCommandFunction {
    default_timeout_secs: u64,
}

impl ExecuteCommandFunction {
    pub fn new(default_timeout_secs: u64) -> Self {
        Self {
            default_timeout_secs,
        }
    }
}

#[async_trait]
impl FunctionHandler for ExecuteCommandFunction {
    fn name(&self) -> &str {
        "bash"
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute (passed to sh -c)"
                },
                "timeout_seconds": {
                    "type": "integer",
                    "description": "Timeout in seconds (default: 30)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &FunctionCtx,
        _next: Next<'_>,
    ) -> Result<FunctionOutcome> {
        let Some(command) = args["command"].as_str() else {
            return Ok(FunctionOutcome::failed("missing 'command' field"));
        };
        let timeout_secs = args["timeout_seconds"]
            .as_u64()
            .unwrap_or(self.default_timeout_secs);

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::select! {
            result = child.wait_with_output() => result?,
            _ = tokio::time::sleep(std::time::Duration::from_secs(timeout_secs.max(1))) => {
                return Ok(FunctionOutcome::failed(format!(
                    "command timed out after {timeout_secs}s"
                )));
            }
            _ = ctx.cancel.cancelled() => {
                return Ok(FunctionOutcome::Aborted);
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str("[stderr]\n");
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        if combined.len() > MAX_OUTPUT_BYTES {
            combined.truncate(MAX_OUTPUT_BYTES);
            combined.push_str("\n...(output truncated)");
        }

        if output.status.success() {
            Ok(FunctionOutcome::completed(serde_json::json!({
                "output": combined,
                "exit_code": 0,
            })))
        } else {
            Ok(FunctionOutcome::failed(format!(
                "exit code {}: {combined}",
                output.status.code().unwrap_or(-1)
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> FunctionCtx {
        FunctionCtx {
            session_id: "s1".into(),
            user_id: "u1".into(),
            agent_id: Some("a1".into()),
            store: Store::open_in_memory().unwrap(),
            delegation_depth: 0,
            cancel: CancellationToken::new(),
        }
    }

    struct EchoFunction;

    #[async_trait]
    impl FunctionHandler for EchoFunction {
        fn name(&self) -> &str {
            "echo"
        }

        fn schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }

        async fn execute(
            &self,
            args: serde_json::Value,
            _ctx: &FunctionCtx,
            _next: Next<'_>,
        ) -> Result<FunctionOutcome> {
            Ok(FunctionOutcome::completed(args))
        }
    }

    /// Only handles requests whose args carry `special`; defers the rest.
    struct PickyFunction;

    #[async_trait]
    impl FunctionHandler for PickyFunction {
        fn name(&self) -> &str {
            "echo"
        }

        fn schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }

        async fn execute(
            &self,
            args: serde_json::Value,
            _ctx: &FunctionCtx,
            next: Next<'_>,
        ) -> Result<FunctionOutcome> {
            if args.get("special").is_some() {
                return Ok(FunctionOutcome::completed(serde_json::json!("picky")));
            }
            next.run(args).await
        }
    }

    #[tokio::test]
    async fn registry_executes_registered_handler() {
        let mut registry = FunctionRegistry::new();
        registry.register(Arc::new(EchoFunction));

        let outcome = registry
            .execute("echo", serde_json::json!({"x": 1}), &ctx())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            FunctionOutcome::Completed { ref result } if result["x"] == 1
        ));
    }

    #[tokio::test]
    async fn unknown_function_is_an_error() {
        let registry = FunctionRegistry::new();
        assert!(registry
            .execute("nope", serde_json::json!({}), &ctx())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn chaining_falls_through_to_next_handler() {
        let mut registry = FunctionRegistry::new();
        registry.register(Arc::new(EchoFunction));
        registry.register(Arc::new(PickyFunction));

        // Picky handles this one itself.
        let outcome = registry
            .execute("echo", serde_json::json!({"special": true}), &ctx())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            FunctionOutcome::Completed { ref result } if result == "picky"
        ));

        // This one falls through to Echo.
        let outcome = registry
            .execute("echo", serde_json::json!({"plain": 1}), &ctx())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            FunctionOutcome::Completed { ref result } if result["plain"] == 1
        ));
    }

    #[tokio::test]
    async fn exhausted_chain_fails() {
        struct AlwaysDefer;

        #[async_trait]
        impl FunctionHandler for AlwaysDefer {
            fn name(&self) -> &str {
                "defer"
            }

            fn schema(&self) -> serde_json::Value {
                serde_json::json!({"type": "object"})
            }

            async fn execute(
                &self,
                args: serde_json::Value,
                _ctx: &FunctionCtx,
                next: Next<'_>,
            ) -> Result<FunctionOutcome> {
                next.run(args).await
            }
        }

        let mut registry = FunctionRegistry::new();
        registry.register(Arc::new(AlwaysDefer));
        let outcome = registry
            .execute("defer", serde_json::json!({}), &ctx())
            .await
            .unwrap();
        assert!(matches!(outcome, FunctionOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn bash_runs_and_captures_output() {
        let registry = FunctionRegistry::with_builtins();
        let outcome = registry
            .execute(
                "bash",
                serde_json::json!({"command": "echo hello"}),
                &ctx(),
            )
            .await
            .unwrap();
        match outcome {
            FunctionOutcome::Completed { result } => {
                assert!(result["output"].as_str().unwrap().contains("hello"));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bash_nonzero_exit_fails() {
        let registry = FunctionRegistry::with_builtins();
        let outcome = registry
            .execute("bash", serde_json::json!({"command": "exit 3"}), &ctx())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            FunctionOutcome::Failed { ref error } if error.contains("exit code 3")
        ));
    }

    #[tokio::test]
    async fn bash_timeout_fails() {
        let registry = FunctionRegistry::with_builtins();
        let outcome = registry
            .execute(
                "bash",
                serde_json::json!({"command": "sleep 5", "timeout_seconds": 1}),
                &ctx(),
            )
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            FunctionOutcome::Failed { ref error } if error.contains("timed out")
        ));
    }
}
