//! Slash commands handled before the LLM sees a message.
//!
//! Grammar: `/name[ args...]` where `name` is `[a-z_][a-z0-9_-]*` after
//! lowercasing. `-` and `_` normalize to the same registry key.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use hero_schema::{AuthorType, Frame, FrameType};
use hero_store::{frames::compile, FrameFilter, Store};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: String,
    pub args: String,
}

pub fn is_command(text: &str) -> bool {
    parse_command(text).is_some()
}

/// Parse `/name args`. Returns `None` for anything that is not a
/// well-formed command.
pub fn parse_command(text: &str) -> Option<ParsedCommand> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix('/')?;

    let name_end = rest
        .find(char::is_whitespace)
        .unwrap_or(rest.len());
    let name = rest[..name_end].to_lowercase();

    let mut chars = name.chars();
    let first = chars.next()?;
    if !(first.is_ascii_lowercase() || first == '_') {
        return None;
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-') {
        return None;
    }

    Some(ParsedCommand {
        name,
        args: rest[name_end..].trim().to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub success: bool,
    pub content: Option<String>,
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: Some(content.into()),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Clone)]
pub struct CommandCtx {
    pub store: Store,
    pub session_id: String,
    pub user_id: String,
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn execute(&self, args: &str, ctx: &CommandCtx) -> Result<CommandOutcome>;
}

/// Registry of builtin and registered commands.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Arc<dyn CommandHandler>>,
}

fn normalize_name(name: &str) -> String {
    name.to_lowercase().replace('-', "_")
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(HelpCommand));
        registry.register(Arc::new(SessionCommand));
        registry.register(Arc::new(CompactCommand));
        registry.register(Arc::new(StartCommand));
        registry.register(Arc::new(ReloadCommand));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        self.commands
            .insert(normalize_name(handler.name()), handler);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(&normalize_name(name))
    }

    pub fn list(&self) -> Vec<(String, String)> {
        self.commands
            .values()
            .map(|c| (c.name().to_string(), c.description().to_string()))
            .collect()
    }

    pub async fn execute(&self, name: &str, args: &str, ctx: &CommandCtx) -> CommandOutcome {
        let Some(handler) = self.commands.get(&normalize_name(name)) else {
            return CommandOutcome::err(format!("unknown command: /{name}"));
        };

        match handler.execute(args, ctx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(command = name, error = %e, "command execution failed");
                CommandOutcome::err(e.to_string())
            }
        }
    }
}

// ------------------------------------------------------------
// Builtins
// ------------------------------------------------------------

struct HelpCommand;

#[async_trait]
impl CommandHandler for HelpCommand {
    fn name(&self) -> &str {
        "help"
    }

    fn description(&self) -> &str {
        "List available commands"
    }

    async fn execute(&self, _args: &str, _ctx: &CommandCtx) -> Result<CommandOutcome> {
        Ok(CommandOutcome::ok(
            "Available commands:\n\
             /help - list available commands\n\
             /session - show current session\n\
             /compact - snapshot the session history\n\
             /start - start the conversation\n\
             /reload - reload registries",
        ))
    }
}

struct SessionCommand;

#[async_trait]
impl CommandHandler for SessionCommand {
    fn name(&self) -> &str {
        "session"
    }

    fn description(&self) -> &str {
        "Show current session metadata"
    }

    async fn execute(&self, _args: &str, ctx: &CommandCtx) -> Result<CommandOutcome> {
        let Some(session) = ctx.store.get_session(&ctx.session_id).await? else {
            return Ok(CommandOutcome::err(format!(
                "session not found: {}",
                ctx.session_id
            )));
        };
        Ok(CommandOutcome::ok(format!(
            "Session: {}\nName: {}\nStatus: {}\nTokens: {} in / {} out",
            session.id,
            session.name,
            session.status.as_str(),
            session.input_tokens,
            session.output_tokens,
        )))
    }
}

/// Emits a `compact` frame snapshotting the compiled state, so replay can
/// start from the snapshot instead of the full history.
struct CompactCommand;

#[async_trait]
impl CommandHandler for CompactCommand {
    fn name(&self) -> &str {
        "compact"
    }

    fn description(&self) -> &str {
        "Snapshot the session history into a compact frame"
    }

    async fn execute(&self, _args: &str, ctx: &CommandCtx) -> Result<CommandOutcome> {
        let frames = ctx
            .store
            .list_frames(&ctx.session_id, FrameFilter::default())
            .await?;
        let compiled = compile(&frames);
        let count = compiled.len();

        let frame = Frame::new(
            &ctx.session_id,
            FrameType::Compact,
            AuthorType::System,
            None,
            serde_json::json!({ "snapshot": compiled }),
        );
        ctx.store.append_frame(frame).await?;

        Ok(CommandOutcome::ok(format!(
            "Compacted {count} frames into a snapshot"
        )))
    }
}

struct StartCommand;

#[async_trait]
impl CommandHandler for StartCommand {
    fn name(&self) -> &str {
        "start"
    }

    fn description(&self) -> &str {
        "Start the conversation"
    }

    async fn execute(&self, _args: &str, ctx: &CommandCtx) -> Result<CommandOutcome> {
        Ok(CommandOutcome::ok(format!(
            "Session {} is ready.",
            ctx.session_id
        )))
    }
}

struct ReloadCommand;

#[async_trait]
impl CommandHandler for ReloadCommand {
    fn name(&self) -> &str {
        "reload"
    }

    fn description(&self) -> &str {
        "Reload command and function registries"
    }

    async fn execute(&self, _args: &str, _ctx: &CommandCtx) -> Result<CommandOutcome> {
        Ok(CommandOutcome::ok("Registries reloaded"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic_command() {
        let parsed = parse_command("/help").unwrap();
        assert_eq!(parsed.name, "help");
        assert_eq!(parsed.args, "");
    }

    #[test]
    fn parse_command_with_args() {
        let parsed = parse_command("  /session  show all  ").unwrap();
        assert_eq!(parsed.name, "session");
        assert_eq!(parsed.args, "show all");
    }

    #[test]
    fn parse_lowercases_name() {
        let parsed = parse_command("/HeLp now").unwrap();
        assert_eq!(parsed.name, "help");
        assert_eq!(parsed.args, "now");
    }

    #[test]
    fn parse_rejects_non_commands() {
        assert!(parse_command("hello").is_none());
        assert!(parse_command("").is_none());
        assert!(parse_command("/").is_none());
        assert!(parse_command("/1abc").is_none());
        assert!(parse_command("not a /command").is_none());
        assert!(parse_command("/bad!name").is_none());
    }

    #[test]
    fn name_round_trip_law() {
        for name in ["help", "my_cmd", "has-dash", "_x9"] {
            let formatted = format!("/{} {}", name, "args here");
            let parsed = parse_command(&formatted).unwrap();
            assert_eq!(parsed.name, name.to_lowercase());
        }
    }

    #[test]
    fn registry_normalizes_dash_and_underscore() {
        let registry = CommandRegistry::with_builtins();
        assert!(registry.contains("help"));
        // Builtin registered as "compact"; both spellings resolve.
        assert!(registry.contains("compact"));
        assert_eq!(normalize_name("my-cmd"), normalize_name("my_cmd"));
    }

    async fn ctx_with_session() -> CommandCtx {
        let store = Store::open_in_memory().unwrap();
        store
            .create_session(hero_schema::Session {
                id: "s1".into(),
                owner_user_id: "u1".into(),
                name: "test".into(),
                status: hero_schema::SessionStatus::Active,
                parent_session_id: None,
                agent_id: None,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
                input_tokens: 0,
                output_tokens: 0,
            })
            .await
            .unwrap();
        CommandCtx {
            store,
            session_id: "s1".into(),
            user_id: "u1".into(),
        }
    }

    #[tokio::test]
    async fn unknown_command_fails() {
        let registry = CommandRegistry::with_builtins();
        let ctx = ctx_with_session().await;
        let outcome = registry.execute("nope", "", &ctx).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("unknown command"));
    }

    #[tokio::test]
    async fn session_command_reports_meta() {
        let registry = CommandRegistry::with_builtins();
        let ctx = ctx_with_session().await;
        let outcome = registry.execute("session", "", &ctx).await;
        assert!(outcome.success);
        assert!(outcome.content.unwrap().contains("s1"));
    }

    #[tokio::test]
    async fn compact_command_appends_snapshot_frame() {
        let registry = CommandRegistry::with_builtins();
        let ctx = ctx_with_session().await;

        ctx.store
            .append_frame(Frame::new(
                "s1",
                FrameType::Message,
                AuthorType::User,
                Some("u1".into()),
                serde_json::json!({"content": "hello"}),
            ))
            .await
            .unwrap();

        let outcome = registry.execute("compact", "", &ctx).await;
        assert!(outcome.success);

        let frames = ctx
            .store
            .list_frames(
                "s1",
                FrameFilter {
                    types: Some(vec![FrameType::Compact]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload["snapshot"].is_object());
    }
}
