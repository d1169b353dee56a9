//! Permission-gated execution of detected interactions.
//!
//! Each interaction is evaluated against the permission engine, routed
//! through a prompt when required, executed via the command system,
//! function registry, or delegation, and recorded as a REQUEST frame
//! followed by a RESULT frame. The aggregate feedback string goes back
//! into the next LLM turn.

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use anyhow::Result;

use hero_schema::{
    Assertion, AuthorType, Frame, FrameType, FunctionOutcome, Interaction, MessageKind,
    MessagePayload, MessageRole, PermissionAction, Pipeline, PipelineMode, PromptAnswer, Resource,
    ResourceType, Subject,
};

use crate::broadcast::{ElementPhase, ServerEvent};
use crate::commands::CommandCtx;
use crate::engine::Engine;
use crate::functions::FunctionCtx;
use crate::markup::escape_text;
use crate::permissions::PermissionCtx;

/// Identity and scope of the turn driving a dispatch.
#[derive(Debug, Clone)]
pub struct TurnCtx {
    pub session_id: String,
    /// Session owner, the authority permission rules are scoped to.
    pub owner_id: String,
    /// The user whose request started the turn.
    pub user_id: String,
    pub agent_id: Option<String>,
    pub delegation_depth: u32,
}

/// One executed interaction and what came of it.
#[derive(Debug, Clone)]
pub struct DispatchEntry {
    pub interaction_id: String,
    pub name: String,
    pub outcome: FunctionOutcome,
}

/// Everything a dispatch produced, for feedback composition and inline
/// result injection.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub entries: Vec<DispatchEntry>,
}

impl DispatchReport {
    /// Aggregate feedback text for the next LLM turn.
    pub fn feedback(&self) -> String {
        self.entries
            .iter()
            .map(feedback_line)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn outcome_for(&self, interaction_id: &str) -> Option<&FunctionOutcome> {
        self.entries
            .iter()
            .find(|e| e.interaction_id == interaction_id)
            .map(|e| &e.outcome)
    }
}

/// Run every pipeline: sequential pipelines one at a time and in order,
/// parallel pipelines concurrently.
pub async fn dispatch(
    engine: &Engine,
    ctx: &TurnCtx,
    pipelines: Vec<Pipeline>,
    cancel: &CancellationToken,
) -> Result<DispatchReport> {
    let (parallel, sequential): (Vec<Pipeline>, Vec<Pipeline>) = pipelines
        .into_iter()
        .partition(|p| p.mode == PipelineMode::Parallel);

    let mut entries = Vec::new();

    for pipeline in sequential {
        entries.extend(run_pipeline(engine, ctx, pipeline, cancel).await);
    }

    if !parallel.is_empty() {
        let results = join_all(
            parallel
                .into_iter()
                .map(|pipeline| run_pipeline(engine, ctx, pipeline, cancel)),
        )
        .await;
        for result in results {
            entries.extend(result);
        }
    }

    Ok(DispatchReport { entries })
}

/// Items within one pipeline always run sequentially; cancellation marks
/// the remaining items aborted.
async fn run_pipeline(
    engine: &Engine,
    ctx: &TurnCtx,
    pipeline: Pipeline,
    cancel: &CancellationToken,
) -> Vec<DispatchEntry> {
    let mut entries = Vec::new();
    let mut aborted = false;

    for interaction in pipeline.items {
        if aborted || cancel.is_cancelled() {
            aborted = true;
            let request_id = record_request(engine, ctx, &interaction).await;
            record_outcome(engine, ctx, &interaction, request_id, &FunctionOutcome::Aborted).await;
            entries.push(DispatchEntry {
                interaction_id: interaction.id.clone(),
                name: interaction.name.clone(),
                outcome: FunctionOutcome::Aborted,
            });
            continue;
        }

        entries.push(run_interaction(engine, ctx, interaction, cancel).await);
    }

    entries
}

async fn run_interaction(
    engine: &Engine,
    ctx: &TurnCtx,
    interaction: Interaction,
    cancel: &CancellationToken,
) -> DispatchEntry {
    let subject = match &ctx.agent_id {
        Some(agent_id) => Subject::agent(agent_id.clone()),
        None => Subject::user(ctx.user_id.clone()),
    };
    let resource = Resource {
        resource_type: match interaction.assertion {
            Assertion::Command => ResourceType::Command,
            Assertion::Function => ResourceType::Tool,
            Assertion::Question => ResourceType::Ability,
        },
        name: interaction.name.clone(),
    };
    let permission_ctx = PermissionCtx {
        owner_id: ctx.owner_id.clone(),
        session_id: ctx.session_id.clone(),
        context: serde_json::json!({
            "name": interaction.name,
            "assertion": interaction.assertion,
            "args": interaction.args,
        }),
    };

    let decision = engine
        .permissions()
        .evaluate(&subject, &resource, &permission_ctx)
        .await;

    let mut allowed = false;
    let mut denial_reason = None;

    match decision.action {
        PermissionAction::Allow => {
            allowed = true;
            if let Err(e) = engine.permissions().consume_once(&decision).await {
                tracing::warn!(error = %e, "failed to consume once-scoped rule");
            }
        }
        PermissionAction::Deny => {
            denial_reason = Some(
                decision
                    .reason
                    .clone()
                    .unwrap_or_else(|| "denied by permission rule".into()),
            );
        }
        PermissionAction::Prompt => {
            match engine
                .broker()
                .request_prompt(
                    subject.clone(),
                    resource.clone(),
                    &ctx.session_id,
                    &ctx.owner_id,
                    engine.config().prompt_timeout,
                    cancel,
                )
                .await
            {
                Ok(outcome) if outcome.answer.grants() => {
                    allowed = true;
                    // An allow-once answer authorizes exactly this
                    // execution; its rule is consumed immediately.
                    if outcome.answer == PromptAnswer::AllowOnce {
                        if let Some(rule_id) = &outcome.rule_id {
                            if let Err(e) = engine.store().delete_rule(rule_id).await {
                                tracing::warn!(error = %e, "failed to consume prompt rule");
                            }
                        }
                    }
                }
                Ok(_) => {
                    denial_reason = Some("denied by user".into());
                }
                Err(e) => {
                    tracing::error!(error = %e, "permission prompt failed");
                    denial_reason = Some("permission prompt failed".into());
                }
            }
        }
    }

    let request_frame_id = record_request(engine, ctx, &interaction).await;

    let outcome = if allowed {
        engine
            .publish(
                &ctx.session_id,
                ServerEvent::HmlElement {
                    id: interaction.id.clone(),
                    element_type: interaction.name.clone(),
                    phase: ElementPhase::Start,
                    message: None,
                },
            )
            .await;
        let outcome = execute(engine, ctx, &interaction, cancel).await;
        let phase = match &outcome {
            FunctionOutcome::Completed { .. } => ElementPhase::Complete,
            _ => ElementPhase::Error,
        };
        engine
            .publish(
                &ctx.session_id,
                ServerEvent::HmlElement {
                    id: interaction.id.clone(),
                    element_type: interaction.name.clone(),
                    phase,
                    message: match &outcome {
                        FunctionOutcome::Failed { error } => Some(error.clone()),
                        _ => None,
                    },
                },
            )
            .await;
        outcome
    } else {
        FunctionOutcome::failed(format!(
            "permission denied: {}",
            denial_reason.unwrap_or_else(|| "no matching rule".into())
        ))
    };

    record_outcome(engine, ctx, &interaction, request_frame_id, &outcome).await;
    DispatchEntry {
        interaction_id: interaction.id.clone(),
        name: interaction.name.clone(),
        outcome,
    }
}

async fn execute(
    engine: &Engine,
    ctx: &TurnCtx,
    interaction: &Interaction,
    cancel: &CancellationToken,
) -> FunctionOutcome {
    match interaction.assertion {
        Assertion::Command => execute_command(engine, ctx, interaction, cancel).await,
        Assertion::Question => deliver_question(engine, ctx, interaction).await,
        Assertion::Function if interaction.name == "delegate" => {
            engine.delegate(ctx, &interaction.args, cancel).await
        }
        Assertion::Function => execute_function(engine, ctx, interaction, cancel).await,
    }
}

async fn execute_command(
    engine: &Engine,
    ctx: &TurnCtx,
    interaction: &Interaction,
    cancel: &CancellationToken,
) -> FunctionOutcome {
    if engine.commands().contains(&interaction.name) {
        let command_ctx = CommandCtx {
            store: engine.store().clone(),
            session_id: ctx.session_id.clone(),
            user_id: ctx.user_id.clone(),
        };
        let args = interaction
            .args
            .as_str()
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| interaction.args["args"].as_str().unwrap_or("").to_owned());
        let outcome = engine
            .commands()
            .execute(&interaction.name, &args, &command_ctx)
            .await;
        return if outcome.success {
            FunctionOutcome::completed(serde_json::json!({
                "content": outcome.content.unwrap_or_default()
            }))
        } else {
            FunctionOutcome::failed(outcome.error.unwrap_or_else(|| "command failed".into()))
        };
    }

    // Commands without a slash handler fall through to the function
    // registry (e.g. `bash`).
    execute_function(engine, ctx, interaction, cancel).await
}

async fn execute_function(
    engine: &Engine,
    ctx: &TurnCtx,
    interaction: &Interaction,
    cancel: &CancellationToken,
) -> FunctionOutcome {
    let function_ctx = FunctionCtx {
        session_id: ctx.session_id.clone(),
        user_id: ctx.user_id.clone(),
        agent_id: ctx.agent_id.clone(),
        store: engine.store().clone(),
        delegation_depth: ctx.delegation_depth,
        cancel: cancel.clone(),
    };
    match engine
        .inner
        .functions
        .execute(&interaction.name, interaction.args.clone(), &function_ctx)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => FunctionOutcome::failed(e.to_string()),
    }
}

/// Questions are delivered to the user as a system frame carrying the
/// ask element; they resolve out of band.
async fn deliver_question(
    engine: &Engine,
    ctx: &TurnCtx,
    interaction: &Interaction,
) -> FunctionOutcome {
    let message = interaction.message.clone().unwrap_or_default();
    let options = interaction
        .options
        .as_ref()
        .map(|options| {
            options
                .iter()
                .map(|o| format!("<option value=\"{o}\">{o}</option>"))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    let html = format!(
        "<ask id=\"{}\">{}{options}</ask>",
        interaction.id,
        escape_text(&message),
    );

    let frame = Frame::new(
        &ctx.session_id,
        FrameType::Message,
        AuthorType::System,
        None,
        match serde_json::to_value(
            MessagePayload::text(MessageRole::System, html).with_kind(MessageKind::System),
        ) {
            Ok(payload) => payload,
            Err(e) => return FunctionOutcome::failed(e.to_string()),
        },
    );
    match engine.store().append_frame(frame.clone()).await {
        Ok(_) => {
            engine
                .publish(&ctx.session_id, ServerEvent::Frame { frame })
                .await;
            FunctionOutcome::completed(serde_json::json!({"delivered": true}))
        }
        Err(e) => FunctionOutcome::failed(e.to_string()),
    }
}

/// REQUEST frames precede execution. Failures are logged, never fatal.
async fn record_request(engine: &Engine, ctx: &TurnCtx, interaction: &Interaction) -> Option<String> {
    let frame = Frame::new(
        &ctx.session_id,
        FrameType::Request,
        AuthorType::Agent,
        ctx.agent_id.clone(),
        serde_json::json!({
            "interaction_id": interaction.id,
            "assertion": interaction.assertion,
            "name": interaction.name,
            "args": interaction.args,
        }),
    );
    let id = frame.id.clone();
    match engine.store().append_frame(frame.clone()).await {
        Ok(_) => {
            engine
                .publish(&ctx.session_id, ServerEvent::Frame { frame })
                .await;
            Some(id)
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to record request frame");
            None
        }
    }
}

/// RESULT frames follow their REQUEST frame in the same turn.
async fn record_outcome(
    engine: &Engine,
    ctx: &TurnCtx,
    interaction: &Interaction,
    request_frame_id: Option<String>,
    outcome: &FunctionOutcome,
) {
    let mut frame = Frame::new(
        &ctx.session_id,
        FrameType::Result,
        AuthorType::Agent,
        ctx.agent_id.clone(),
        serde_json::json!({
            "interaction_id": interaction.id,
            "name": interaction.name,
            "outcome": outcome,
        }),
    );
    if let Some(parent) = request_frame_id {
        frame = frame.with_parent(parent);
    }
    match engine.store().append_frame(frame.clone()).await {
        Ok(_) => {
            engine
                .publish(&ctx.session_id, ServerEvent::Frame { frame })
                .await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to record result frame");
        }
    }
}

fn feedback_line(entry: &DispatchEntry) -> String {
    match &entry.outcome {
        FunctionOutcome::Completed { result } => {
            format!("{}: completed -> {}", entry.name, result)
        }
        FunctionOutcome::Failed { error } => {
            format!("{}: failed -> {}", entry.name, error)
        }
        FunctionOutcome::Aborted => format!("{}: aborted", entry.name),
    }
}
