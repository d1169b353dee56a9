//! Delegation: a parent agent hands a bounded task to another agent in
//! a child session.

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use hero_schema::{
    AuthorType, Frame, FrameType, FunctionOutcome, MessagePayload, MessageRole, Participant,
    ParticipantRole, ParticipantType, Session, SessionStatus,
};

use crate::dispatcher::TurnCtx;
use crate::engine::Engine;

impl Engine {
    /// Spawn a child session for the delegated agent, post the task as a
    /// user-role message, and wait for the agent's reply bounded by the
    /// delegation timeout.
    pub async fn delegate(
        &self,
        ctx: &TurnCtx,
        args: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> FunctionOutcome {
        let Some(target_agent_id) = args
            .get("agent_id")
            .or_else(|| args.get("target_agent_id"))
            .and_then(|v| v.as_str())
        else {
            return FunctionOutcome::failed("missing 'agent_id' field");
        };
        let Some(task) = args.get("task").and_then(|v| v.as_str()) else {
            return FunctionOutcome::failed("missing 'task' field");
        };

        if ctx.agent_id.as_deref() == Some(target_agent_id) {
            return FunctionOutcome::failed("cannot delegate to itself");
        }
        if ctx.delegation_depth >= self.config().max_delegation_depth {
            return FunctionOutcome::failed(format!(
                "delegation depth {} exceeds maximum {}",
                ctx.delegation_depth,
                self.config().max_delegation_depth
            ));
        }

        match self
            .store()
            .is_participant(&ctx.session_id, ParticipantType::Agent, target_agent_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                return FunctionOutcome::failed(format!(
                    "agent {target_agent_id} is not a participant of this session"
                ));
            }
            Err(e) => return FunctionOutcome::failed(e.to_string()),
        }

        let child = match self
            .spawn_child_session(ctx, target_agent_id, task)
            .await
        {
            Ok(child) => child,
            Err(e) => return FunctionOutcome::failed(e.to_string()),
        };

        let reply = tokio::select! {
            result = tokio::time::timeout(
                self.config().delegation_timeout,
                self.run_child_session(
                    child,
                    ctx.owner_id.clone(),
                    ctx.delegation_depth + 1,
                    cancel.clone(),
                ),
            ) => match result {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => return FunctionOutcome::failed(e.to_string()),
                Err(_) => return FunctionOutcome::failed("Delegation timed out"),
            },
            _ = cancel.cancelled() => return FunctionOutcome::Aborted,
        };

        FunctionOutcome::completed(serde_json::json!({
            "agent_id": target_agent_id,
            "reply": reply,
        }))
    }

    async fn spawn_child_session(
        &self,
        ctx: &TurnCtx,
        target_agent_id: &str,
        task: &str,
    ) -> anyhow::Result<Session> {
        let now = Utc::now();
        let child = Session {
            id: uuid::Uuid::new_v4().to_string(),
            owner_user_id: ctx.owner_id.clone(),
            name: format!("delegation to {target_agent_id}"),
            status: SessionStatus::Agent,
            parent_session_id: Some(ctx.session_id.clone()),
            agent_id: Some(target_agent_id.to_string()),
            created_at: now,
            updated_at: now,
            input_tokens: 0,
            output_tokens: 0,
        };
        self.store().create_session(child.clone()).await?;

        self.participants()
            .add(Participant {
                session_id: child.id.clone(),
                participant_type: ParticipantType::User,
                participant_id: ctx.owner_id.clone(),
                role: ParticipantRole::Owner,
                alias: None,
                joined_at: now,
            })
            .await?;
        self.participants()
            .add(Participant {
                session_id: child.id.clone(),
                participant_type: ParticipantType::Agent,
                participant_id: target_agent_id.to_string(),
                role: ParticipantRole::Coordinator,
                alias: None,
                joined_at: now,
            })
            .await?;
        if let Some(parent_agent) = &ctx.agent_id {
            self.participants()
                .add(Participant {
                    session_id: child.id.clone(),
                    participant_type: ParticipantType::Agent,
                    participant_id: parent_agent.clone(),
                    role: ParticipantRole::Member,
                    alias: None,
                    joined_at: now,
                })
                .await?;
        }

        let task_frame = Frame::new(
            &child.id,
            FrameType::Message,
            AuthorType::Agent,
            ctx.agent_id.clone(),
            serde_json::to_value(MessagePayload::text(MessageRole::User, task))?,
        );
        self.store().append_frame(task_frame).await?;

        Ok(child)
    }
}
