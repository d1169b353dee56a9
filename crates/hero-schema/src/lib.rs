pub mod error;
pub mod id;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use error::HeroError;
pub use id::frame_id;

/// Result alias used across the workspace for typed failures.
pub type HeroResult<T> = std::result::Result<T, HeroError>;

// ============================================================
// Sessions & participants
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Archived,
    /// Sub-session created by delegation.
    Agent,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub owner_user_id: String,
    pub name: String,
    pub status: SessionStatus,
    #[serde(default)]
    pub parent_session_id: Option<String>,
    /// Legacy seed agent, used as the coordinator fallback.
    #[serde(default)]
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantType {
    User,
    Agent,
}

impl ParticipantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Owner,
    Coordinator,
    Member,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Coordinator => "coordinator",
            Self::Member => "member",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(Self::Owner),
            "coordinator" => Some(Self::Coordinator),
            "member" => Some(Self::Member),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub session_id: String,
    pub participant_type: ParticipantType,
    pub participant_id: String,
    pub role: ParticipantRole,
    #[serde(default)]
    pub alias: Option<String>,
    pub joined_at: DateTime<Utc>,
}

// ============================================================
// Frames
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Message,
    Request,
    Result,
    Update,
    Compact,
    /// Forward-compatibility: unrecognized types replay like `message`.
    #[serde(other)]
    Unknown,
}

impl FrameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Request => "request",
            Self::Result => "result",
            Self::Update => "update",
            Self::Compact => "compact",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "message" => Self::Message,
            "request" => Self::Request,
            "result" => Self::Result,
            "update" => Self::Update,
            "compact" => Self::Compact,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorType {
    User,
    Agent,
    System,
}

impl AuthorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "agent" => Some(Self::Agent),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// An immutable typed event in the append-only session log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: String,
    pub session_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// `update` frames address their targets as `frame:<id>`.
    #[serde(default)]
    pub target_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub author_type: AuthorType,
    #[serde(default)]
    pub author_id: Option<String>,
    pub payload: serde_json::Value,
}

impl Frame {
    pub fn new(
        session_id: impl Into<String>,
        frame_type: FrameType,
        author_type: AuthorType,
        author_id: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: frame_id(),
            session_id: session_id.into(),
            parent_id: None,
            target_ids: Vec::new(),
            timestamp: Utc::now(),
            frame_type,
            author_type,
            author_id,
            payload,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_targets(mut self, target_ids: Vec<String>) -> Self {
        self.target_ids = target_ids;
        self
    }

    /// Target reference for an `update` frame.
    pub fn frame_target(frame_id: &str) -> String {
        format!("frame:{frame_id}")
    }
}

/// Compiled state derived by replaying frames. Never persisted.
pub type CompiledState = BTreeMap<String, serde_json::Value>;

// ============================================================
// Message payloads
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Message,
    Interaction,
    System,
    Feedback,
}

/// Payload of a `message` frame.
///
/// `hidden` messages stay in the LLM context but are not shown by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub role: MessageRole,
    /// String or an array of content blocks.
    pub content: serde_json::Value,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default = "MessagePayload::default_kind")]
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}

impl MessagePayload {
    fn default_kind() -> MessageKind {
        MessageKind::Message
    }

    pub fn text(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: serde_json::Value::String(content.into()),
            hidden: false,
            kind: MessageKind::Message,
            created_at: Utc::now(),
        }
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Flatten the content to plain text (joins text blocks).
    pub fn content_text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Array(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        }
    }
}

/// Payload of a `compact` frame: a full snapshot of the compiled state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactPayload {
    pub snapshot: CompiledState,
}

// ============================================================
// Permissions
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionAction {
    Allow,
    Deny,
    Prompt,
}

impl PermissionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Prompt => "prompt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Self::Allow),
            "deny" => Some(Self::Deny),
            "prompt" => Some(Self::Prompt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionScope {
    Once,
    Session,
    Permanent,
}

impl PermissionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Session => "session",
            Self::Permanent => "permanent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "once" => Some(Self::Once),
            "session" => Some(Self::Session),
            "permanent" => Some(Self::Permanent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubjectType {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "agent")]
    Agent,
    #[serde(rename = "plugin")]
    Plugin,
    #[serde(rename = "*")]
    Any,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
            Self::Plugin => "plugin",
            Self::Any => "*",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "agent" => Some(Self::Agent),
            "plugin" => Some(Self::Plugin),
            "*" => Some(Self::Any),
            _ => None,
        }
    }

    pub fn matches(&self, concrete: SubjectType) -> bool {
        *self == SubjectType::Any || *self == concrete
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    #[serde(rename = "command")]
    Command,
    #[serde(rename = "tool")]
    Tool,
    #[serde(rename = "ability")]
    Ability,
    #[serde(rename = "*")]
    Any,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Tool => "tool",
            Self::Ability => "ability",
            Self::Any => "*",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "command" => Some(Self::Command),
            "tool" => Some(Self::Tool),
            "ability" => Some(Self::Ability),
            "*" => Some(Self::Any),
            _ => None,
        }
    }

    pub fn matches(&self, concrete: ResourceType) -> bool {
        *self == ResourceType::Any || *self == concrete
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRule {
    pub id: String,
    #[serde(default)]
    pub owner_user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub subject_type: SubjectType,
    #[serde(default)]
    pub subject_id: Option<String>,
    pub resource_type: ResourceType,
    /// `None` acts as a wildcard over resource names.
    #[serde(default)]
    pub resource_name: Option<String>,
    pub action: PermissionAction,
    pub scope: PermissionScope,
    /// Fixed-schema predicate; unparseable conditions are returned as null.
    #[serde(default)]
    pub conditions: Option<serde_json::Value>,
    #[serde(default)]
    pub priority: i64,
    pub created_at: DateTime<Utc>,
}

/// The acting party of a permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub subject_type: SubjectType,
    pub id: String,
}

impl Subject {
    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            subject_type: SubjectType::Agent,
            id: id.into(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            subject_type: SubjectType::User,
            id: id.into(),
        }
    }
}

/// The thing a permission check is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub resource_type: ResourceType,
    pub name: String,
}

impl Resource {
    pub fn command(name: impl Into<String>) -> Self {
        Self {
            resource_type: ResourceType::Command,
            name: name.into(),
        }
    }

    pub fn tool(name: impl Into<String>) -> Self {
        Self {
            resource_type: ResourceType::Tool,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub action: PermissionAction,
    #[serde(default)]
    pub rule_id: Option<String>,
    #[serde(default)]
    pub scope: Option<PermissionScope>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl PermissionDecision {
    pub fn prompt() -> Self {
        Self {
            action: PermissionAction::Prompt,
            rule_id: None,
            scope: None,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            action: PermissionAction::Deny,
            rule_id: None,
            scope: None,
            reason: Some(reason.into()),
        }
    }
}

/// Answer choices carried by a permission-prompt element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptAnswer {
    AllowOnce,
    AllowSession,
    AllowAlways,
    Deny,
}

impl PromptAnswer {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow_once" => Some(Self::AllowOnce),
            "allow_session" => Some(Self::AllowSession),
            "allow_always" => Some(Self::AllowAlways),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }

    pub fn grants(&self) -> bool {
        !matches!(self, Self::Deny)
    }
}

// ============================================================
// Interactions
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Assertion {
    Command,
    Question,
    Function,
}

/// One actionable unit parsed out of assistant output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub assertion: Assertion,
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    Sequential,
    Parallel,
}

/// A named group of interactions executed together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(default)]
    pub name: Option<String>,
    pub mode: PipelineMode,
    pub items: Vec<Interaction>,
}

/// Result of executing one interaction handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FunctionOutcome {
    Completed { result: serde_json::Value },
    Failed { error: String },
    Aborted,
}

impl FunctionOutcome {
    pub fn completed(result: serde_json::Value) -> Self {
        Self::Completed { result }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

// ============================================================
// Users & API keys
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// SHA-256 hex of the password; never serialized to clients.
    #[serde(skip_serializing)]
    #[serde(default)]
    pub password_sha256: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub user_id: String,
    pub name: String,
    /// Short display prefix of the plaintext key.
    pub prefix: String,
    /// SHA-256 hex of the full plaintext key; never returned to clients.
    #[serde(skip_serializing)]
    pub sha256: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}
