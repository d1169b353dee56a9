//! Session execution engine: frame-sourced conversations, permission
//! gating, interaction dispatch, and the streaming turn pipeline.

pub mod broadcast;
pub mod commands;
pub mod delegation;
pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod functions;
pub mod interaction;
pub mod markup;
pub mod participants;
pub mod permissions;
pub mod prompt_broker;
pub mod session_lock;

pub use broadcast::{Broadcaster, ElementPhase, ServerEvent, Subscription};
pub use commands::{is_command, parse_command, CommandCtx, CommandHandler, CommandRegistry};
pub use dispatcher::{DispatchEntry, DispatchReport, TurnCtx};
pub use engine::{Engine, EngineConfig};
pub use errors::friendly_error_message;
pub use functions::{FunctionCtx, FunctionHandler, FunctionRegistry};
pub use interaction::{dedup_paragraphs, detect_interactions, strip_interactions};
pub use participants::{LoadedSession, ParticipantRegistry};
pub use permissions::{PermissionCtx, PermissionEngine};
pub use prompt_broker::{PromptBroker, PromptOutcome, DEFAULT_PROMPT_TIMEOUT};
pub use session_lock::{SessionLockGuard, SessionLockManager};
