//! The session execution engine: one struct wiring the store, provider,
//! registries, permission machinery, and broadcaster, and driving the
//! streaming turn pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use hero_provider::{LlmMessage, LlmProvider, LlmRequest};
use hero_schema::{
    AuthorType, Frame, FrameType, MessageKind, MessagePayload, MessageRole, Session, SessionStatus,
};
use hero_store::{frames::compile, FrameFilter, Store};

use crate::broadcast::{Broadcaster, ServerEvent};
use crate::commands::{parse_command, CommandCtx, CommandRegistry};
use crate::dispatcher::{self, TurnCtx};
use crate::errors::friendly_error_message;
use crate::functions::FunctionRegistry;
use crate::interaction::detect_interactions;
use crate::markup::{extract_elements, inject_results, InjectedResult, ResultStatus};
use crate::participants::{LoadedSession, ParticipantRegistry};
use crate::permissions::PermissionEngine;
use crate::prompt_broker::PromptBroker;
use crate::session_lock::SessionLockManager;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model: String,
    pub max_tokens: u32,
    /// Cap on assistant turns per stream; prevents interaction loops.
    pub max_turns: u32,
    pub max_delegation_depth: u32,
    pub delegation_timeout: Duration,
    pub prompt_timeout: Duration,
    /// Conservative bound on one provider stream.
    pub provider_turn_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5".into(),
            max_tokens: 2048,
            max_turns: 8,
            max_delegation_depth: 3,
            delegation_timeout: Duration::from_secs(120),
            prompt_timeout: Duration::from_secs(300),
            provider_turn_timeout: Duration::from_secs(600),
        }
    }
}

pub(crate) struct EngineInner {
    pub(crate) store: Store,
    pub(crate) provider: Arc<dyn LlmProvider>,
    pub(crate) functions: FunctionRegistry,
    pub(crate) commands: CommandRegistry,
    pub(crate) permissions: PermissionEngine,
    pub(crate) broker: PromptBroker,
    pub(crate) broadcaster: Broadcaster,
    pub(crate) locks: SessionLockManager,
    pub(crate) participants: ParticipantRegistry,
    pub(crate) config: EngineConfig,
    active_turns: Mutex<HashMap<String, CancellationToken>>,
}

#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<EngineInner>,
}

/// What a finished turn loop reports back.
pub(crate) struct TurnSummary {
    pub turns: u32,
    pub aborted: bool,
    pub last_text: String,
}

impl Engine {
    pub fn new(store: Store, provider: Arc<dyn LlmProvider>, config: EngineConfig) -> Self {
        Self::with_registries(
            store,
            provider,
            config,
            FunctionRegistry::with_builtins(),
            CommandRegistry::with_builtins(),
        )
    }

    pub fn with_registries(
        store: Store,
        provider: Arc<dyn LlmProvider>,
        config: EngineConfig,
        functions: FunctionRegistry,
        commands: CommandRegistry,
    ) -> Self {
        let broadcaster = Broadcaster::new();
        Self {
            inner: Arc::new(EngineInner {
                permissions: PermissionEngine::new(store.clone()),
                broker: PromptBroker::new(store.clone(), broadcaster.clone()),
                participants: ParticipantRegistry::new(store.clone()),
                locks: SessionLockManager::new(),
                broadcaster,
                functions,
                commands,
                provider,
                config,
                active_turns: Mutex::new(HashMap::new()),
                store,
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.inner.broadcaster
    }

    pub fn broker(&self) -> &PromptBroker {
        &self.inner.broker
    }

    pub fn permissions(&self) -> &PermissionEngine {
        &self.inner.permissions
    }

    pub fn participants(&self) -> &ParticipantRegistry {
        &self.inner.participants
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.inner.commands
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Cancel the in-flight turn of a session, if any.
    pub async fn abort_session(&self, session_id: &str) -> bool {
        let turns = self.inner.active_turns.lock().await;
        match turns.get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Shutdown: deny pending prompts and cancel running turns.
    pub async fn shutdown(&self) {
        self.inner.broker.cancel_all().await;
        let turns = self.inner.active_turns.lock().await;
        for token in turns.values() {
            token.cancel();
        }
    }

    /// Entry point for `POST /sessions/:id/messages/stream`.
    ///
    /// The user's message frame is recorded even when every later step
    /// fails; the stream always ends with exactly one terminal event.
    pub async fn process_message(
        &self,
        session_id: &str,
        user_id: &str,
        content: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        let loaded = self
            .inner
            .participants
            .load_session_with_agent(session_id, user_id)
            .await?;

        let _lease = self.inner.locks.acquire(session_id).await;
        self.inner
            .active_turns
            .lock()
            .await
            .insert(session_id.to_string(), cancel.clone());

        let result = self
            .process_message_locked(&loaded, user_id, content, &cancel)
            .await;

        self.inner.active_turns.lock().await.remove(session_id);
        result
    }

    async fn process_message_locked(
        &self,
        loaded: &LoadedSession,
        user_id: &str,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let session_id = loaded.session.id.clone();

        // The user-visible message must be recorded even if everything
        // downstream fails, so it goes first and its error is primary.
        let user_frame = Frame::new(
            &session_id,
            FrameType::Message,
            AuthorType::User,
            Some(user_id.to_string()),
            serde_json::to_value(MessagePayload::text(MessageRole::User, content))?,
        );
        self.inner.store.append_frame(user_frame.clone()).await?;
        self.publish(&session_id, ServerEvent::Frame { frame: user_frame })
            .await;

        // Slash commands short-circuit before the LLM.
        if let Some(parsed) = parse_command(content) {
            let ctx = CommandCtx {
                store: self.inner.store.clone(),
                session_id: session_id.clone(),
                user_id: user_id.to_string(),
            };
            let outcome = self
                .inner
                .commands
                .execute(&parsed.name, &parsed.args, &ctx)
                .await;
            let text = if outcome.success {
                outcome.content.unwrap_or_default()
            } else {
                outcome.error.unwrap_or_else(|| "command failed".into())
            };

            let frame = Frame::new(
                &session_id,
                FrameType::Message,
                AuthorType::System,
                None,
                serde_json::to_value(
                    MessagePayload::text(MessageRole::System, text).with_kind(MessageKind::System),
                )?,
            );
            if let Err(e) = self.inner.store.append_frame(frame.clone()).await {
                tracing::warn!(error = %e, "failed to record command result frame");
            } else {
                self.publish(&session_id, ServerEvent::Frame { frame }).await;
            }
            self.publish(&session_id, ServerEvent::Done { turns: 0 }).await;
            return Ok(());
        }

        match self.run_turns(loaded, user_id, 0, true, cancel).await {
            Ok(summary) if summary.aborted => {
                self.publish(&session_id, ServerEvent::Aborted).await;
            }
            Ok(summary) => {
                self.publish(
                    &session_id,
                    ServerEvent::Done {
                        turns: summary.turns,
                    },
                )
                .await;
            }
            Err(e) => {
                let friendly = friendly_error_message(&e.to_string());
                tracing::error!(session_id = %session_id, error = %e, "turn failed");

                let frame = Frame::new(
                    &session_id,
                    FrameType::Message,
                    AuthorType::System,
                    None,
                    serde_json::json!({
                        "role": "system",
                        "content": friendly,
                        "hidden": false,
                        "kind": "system",
                        "error": true,
                        "created_at": chrono::Utc::now(),
                    }),
                );
                if let Err(e) = self.inner.store.append_frame(frame.clone()).await {
                    tracing::warn!(error = %e, "failed to record error frame");
                } else {
                    self.publish(&session_id, ServerEvent::Frame { frame }).await;
                }
                self.publish(&session_id, ServerEvent::Error { message: friendly })
                    .await;
            }
        }

        Ok(())
    }

    /// The assistant turn loop shared by streaming turns and delegated
    /// child sessions. Feeds interaction results back as feedback
    /// messages until the assistant stops requesting work or the turn
    /// cap is reached.
    pub(crate) async fn run_turns(
        &self,
        loaded: &LoadedSession,
        user_id: &str,
        delegation_depth: u32,
        streaming: bool,
        cancel: &CancellationToken,
    ) -> Result<TurnSummary> {
        let session_id = loaded.session.id.clone();
        let ctx = TurnCtx {
            session_id: session_id.clone(),
            owner_id: loaded.session.owner_user_id.clone(),
            user_id: user_id.to_string(),
            agent_id: loaded.agent_id.clone(),
            delegation_depth,
        };

        let mut turns = 0;
        let mut last_text = String::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(TurnSummary {
                    turns,
                    aborted: true,
                    last_text,
                });
            }

            turns += 1;
            self.publish(&session_id, ServerEvent::status("calling_api"))
                .await;

            let request = LlmRequest {
                model: self.inner.config.model.clone(),
                system: Some(self.build_system_prompt(loaded).await?),
                messages: self.compose_context(&session_id).await?,
                max_tokens: self.inner.config.max_tokens,
            };

            let (text, usage, aborted) = if streaming {
                self.stream_one_response(&session_id, request, cancel)
                    .await?
            } else {
                let response = self.inner.provider.chat(request).await?;
                (
                    response.text,
                    (response.input_tokens, response.output_tokens),
                    false,
                )
            };

            if aborted {
                return Ok(TurnSummary {
                    turns,
                    aborted: true,
                    last_text,
                });
            }

            if usage.0.is_some() || usage.1.is_some() {
                if let Err(e) = self
                    .inner
                    .store
                    .add_session_usage(
                        &session_id,
                        u64::from(usage.0.unwrap_or(0)),
                        u64::from(usage.1.unwrap_or(0)),
                    )
                    .await
                {
                    tracing::warn!(error = %e, "failed to record session usage");
                }
            }

            let assistant_frame = Frame::new(
                &session_id,
                FrameType::Message,
                AuthorType::Agent,
                loaded.agent_id.clone(),
                serde_json::to_value(MessagePayload::text(MessageRole::Assistant, &text))?,
            );
            self.inner.store.append_frame(assistant_frame.clone()).await?;
            self.publish(
                &session_id,
                ServerEvent::Frame {
                    frame: assistant_frame,
                },
            )
            .await;
            last_text = text.clone();

            let pipelines = detect_interactions(&text);
            if pipelines.is_empty() || turns >= self.inner.config.max_turns {
                return Ok(TurnSummary {
                    turns,
                    aborted: false,
                    last_text,
                });
            }

            // Inline element interactions map 1:1 onto scanner matches;
            // their results are injected back into the original text so
            // the model sees them in place.
            let elements = extract_elements(&text);
            let inline_ids: Option<Vec<String>> = match pipelines.as_slice() {
                [pipeline]
                    if pipeline.name.is_none()
                        && !elements.is_empty()
                        && pipeline.items.len() == elements.len() =>
                {
                    Some(pipeline.items.iter().map(|i| i.id.clone()).collect())
                }
                _ => None,
            };

            let report = dispatcher::dispatch(self, &ctx, pipelines, cancel).await?;
            let feedback = match inline_ids {
                Some(ids) => {
                    let pairs: Vec<_> = elements
                        .into_iter()
                        .zip(ids)
                        .filter_map(|(element, id)| {
                            report
                                .outcome_for(&id)
                                .map(|outcome| (element, injected_result(outcome)))
                        })
                        .collect();
                    inject_results(&text, &pairs)
                }
                None => report.feedback(),
            };
            if feedback.is_empty() {
                return Ok(TurnSummary {
                    turns,
                    aborted: false,
                    last_text,
                });
            }

            let feedback_frame = Frame::new(
                &session_id,
                FrameType::Message,
                AuthorType::System,
                None,
                serde_json::to_value(
                    MessagePayload::text(MessageRole::User, feedback)
                        .with_kind(MessageKind::Feedback)
                        .hidden(),
                )?,
            );
            if let Err(e) = self.inner.store.append_frame(feedback_frame.clone()).await {
                tracing::warn!(error = %e, "failed to record feedback frame");
                return Ok(TurnSummary {
                    turns,
                    aborted: false,
                    last_text,
                });
            }
            self.publish(
                &session_id,
                ServerEvent::Frame {
                    frame: feedback_frame,
                },
            )
            .await;
        }
    }

    /// Consume one provider stream, publishing text deltas. Returns the
    /// accumulated text, usage, and whether the turn was aborted.
    async fn stream_one_response(
        &self,
        session_id: &str,
        request: LlmRequest,
        cancel: &CancellationToken,
    ) -> Result<(String, (Option<u32>, Option<u32>), bool)> {
        let mut stream = self.inner.provider.stream(request).await?;
        let deadline = tokio::time::sleep(self.inner.config.provider_turn_timeout);
        tokio::pin!(deadline);

        let mut text = String::new();
        let mut input_tokens = None;
        let mut output_tokens = None;

        loop {
            tokio::select! {
                chunk = stream.next() => {
                    let Some(chunk) = chunk else {
                        break;
                    };
                    let chunk = chunk?;
                    if let Some(tokens) = chunk.input_tokens {
                        input_tokens = Some(tokens);
                    }
                    if let Some(tokens) = chunk.output_tokens {
                        output_tokens = Some(tokens);
                    }
                    if !chunk.delta.is_empty() {
                        text.push_str(&chunk.delta);
                        self.publish(
                            session_id,
                            ServerEvent::Text {
                                delta: chunk.delta,
                            },
                        )
                        .await;
                    }
                    if chunk.is_final {
                        break;
                    }
                }
                // Abort at the next safe point: the end of the current event.
                _ = cancel.cancelled() => {
                    return Ok((text, (input_tokens, output_tokens), true));
                }
                _ = &mut deadline => {
                    return Err(anyhow!("provider stream timed out"));
                }
            }
        }

        Ok((text, (input_tokens, output_tokens), false))
    }

    /// Replay the log, apply updates, and map message frames onto the
    /// provider's role schema.
    async fn compose_context(&self, session_id: &str) -> Result<Vec<LlmMessage>> {
        let frames = self
            .inner
            .store
            .list_frames(session_id, FrameFilter::default())
            .await?;
        let compiled = compile(&frames);

        let mut messages = Vec::new();
        for frame in &frames {
            if frame.frame_type != FrameType::Message {
                continue;
            }
            let Some(payload) = compiled.get(&frame.id) else {
                continue;
            };
            // Parsing enforces the context kind filter: payloads whose
            // kind is outside {message, system, interaction, feedback}
            // fail to parse and are skipped.
            let Ok(payload) = serde_json::from_value::<MessagePayload>(payload.clone()) else {
                continue;
            };

            let content = payload.content_text();
            if content.is_empty() {
                continue;
            }
            let role = match payload.role {
                MessageRole::Assistant => "assistant",
                MessageRole::User | MessageRole::System => "user",
            };
            messages.push(LlmMessage {
                role: role.into(),
                content,
            });
        }

        Ok(messages)
    }

    async fn build_system_prompt(&self, loaded: &LoadedSession) -> Result<String> {
        let participants = self
            .inner
            .participants
            .get_session_participants(&loaded.session.id)
            .await?;

        let agent_name = loaded
            .agent_alias
            .clone()
            .or_else(|| loaded.agent_id.clone())
            .unwrap_or_else(|| "assistant".into());

        let mut prompt = format!(
            "You are {agent_name}, the coordinator of the conversation \"{}\".\n\
             To request an action, reply with a fenced ```json block of \
             interactions, or embed <websearch>, <bash>, or <ask> elements \
             in your text. Results are fed back to you.",
            loaded.session.name,
        );

        if !participants.is_empty() {
            prompt.push_str("\n\nParticipants:");
            for p in &participants {
                let alias = p
                    .alias
                    .as_deref()
                    .map(|a| format!(" ({a})"))
                    .unwrap_or_default();
                prompt.push_str(&format!(
                    "\n- {} {}{alias} [{}]",
                    p.participant_type.as_str(),
                    p.participant_id,
                    p.role.as_str(),
                ));
            }
        }

        Ok(prompt)
    }

    /// Create a delegation child session and run the delegated agent on
    /// the task, bounded by the delegation timeout. Boxed because
    /// delegated agents can delegate again (bounded by depth).
    pub(crate) fn run_child_session<'a>(
        &'a self,
        child: Session,
        user_id: String,
        depth: u32,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let loaded = self
                .inner
                .participants
                .load_session_with_agent(&child.id, &user_id)
                .await?;
            let _lease = self.inner.locks.acquire(&child.id).await;
            let summary = self
                .run_turns(&loaded, &user_id, depth, false, &cancel)
                .await?;
            if summary.aborted {
                anyhow::bail!("delegation aborted");
            }
            Ok(summary.last_text)
        })
    }

    pub(crate) async fn publish(&self, session_id: &str, event: ServerEvent) {
        self.inner.broadcaster.publish(session_id, event).await;
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.inner.functions
    }

    /// Create a session with its owner participant, the normal entry
    /// point for the HTTP surface.
    pub async fn create_session(
        &self,
        owner_user_id: &str,
        name: &str,
        agent_id: Option<String>,
    ) -> Result<Session> {
        let now = chrono::Utc::now();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            owner_user_id: owner_user_id.to_string(),
            name: name.to_string(),
            status: SessionStatus::Active,
            parent_session_id: None,
            agent_id: agent_id.clone(),
            created_at: now,
            updated_at: now,
            input_tokens: 0,
            output_tokens: 0,
        };
        self.inner.store.create_session(session.clone()).await?;

        self.inner
            .participants
            .add(hero_schema::Participant {
                session_id: session.id.clone(),
                participant_type: hero_schema::ParticipantType::User,
                participant_id: owner_user_id.to_string(),
                role: hero_schema::ParticipantRole::Owner,
                alias: None,
                joined_at: now,
            })
            .await?;

        if let Some(agent_id) = agent_id {
            self.inner
                .participants
                .add(hero_schema::Participant {
                    session_id: session.id.clone(),
                    participant_type: hero_schema::ParticipantType::Agent,
                    participant_id: agent_id,
                    role: hero_schema::ParticipantRole::Coordinator,
                    alias: None,
                    joined_at: now,
                })
                .await?;
        }

        Ok(session)
    }
}

fn injected_result(outcome: &hero_schema::FunctionOutcome) -> InjectedResult {
    match outcome {
        hero_schema::FunctionOutcome::Completed { result } => InjectedResult {
            status: ResultStatus::Success,
            content: result
                .get("output")
                .and_then(|o| o.as_str())
                .map(ToOwned::to_owned)
                .unwrap_or_else(|| result.to_string()),
        },
        hero_schema::FunctionOutcome::Failed { error } => InjectedResult {
            status: ResultStatus::Error,
            content: error.clone(),
        },
        hero_schema::FunctionOutcome::Aborted => InjectedResult {
            status: ResultStatus::Error,
            content: "aborted".into(),
        },
    }
}
