//! Interactive permission prompts.
//!
//! When the engine evaluates to `prompt`, the broker materializes the
//! question as a system frame carrying a prompt element, then parks the
//! caller on a oneshot until the user answers, the prompt is cancelled,
//! or the timeout fires. `allow_*` answers also create the matching
//! permission rule. The pending map is process-local and must be torn
//! down on shutdown.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use hero_schema::id::{is_permission_prompt, prompt_id};
use hero_schema::{
    AuthorType, Frame, FrameType, MessageKind, MessagePayload, MessageRole, PermissionAction,
    PermissionRule, PermissionScope, PromptAnswer, Resource, Subject,
};
use hero_store::Store;

use crate::broadcast::{Broadcaster, ServerEvent};

pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(300);

/// How a prompt resolved, with the rule an `allow_*` answer created.
#[derive(Debug, Clone)]
pub struct PromptOutcome {
    pub answer: PromptAnswer,
    pub rule_id: Option<String>,
}

struct PendingPrompt {
    subject: Subject,
    resource: Resource,
    session_id: String,
    owner_id: String,
    #[allow(dead_code)]
    request_hash: String,
    tx: oneshot::Sender<PromptOutcome>,
    requested_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone)]
pub struct PromptBroker {
    pending: Arc<Mutex<HashMap<String, PendingPrompt>>>,
    store: Store,
    broadcaster: Broadcaster,
}

impl PromptBroker {
    pub fn new(store: Store, broadcaster: Broadcaster) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            store,
            broadcaster,
        }
    }

    /// Open a prompt and wait for its resolution. Timeout and
    /// cancellation both resolve to deny.
    pub async fn request_prompt(
        &self,
        subject: Subject,
        resource: Resource,
        session_id: &str,
        owner_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<PromptOutcome> {
        let id = prompt_id();
        let rx = self
            .open(&id, subject, resource, session_id, owner_id)
            .await?;

        tokio::select! {
            outcome = rx => Ok(outcome.unwrap_or(PromptOutcome {
                answer: PromptAnswer::Deny,
                rule_id: None,
            })),
            _ = tokio::time::sleep(timeout) => {
                self.pending.lock().await.remove(&id);
                tracing::info!(prompt_id = %id, "permission prompt timed out");
                Ok(PromptOutcome { answer: PromptAnswer::Deny, rule_id: None })
            }
            _ = cancel.cancelled() => {
                self.pending.lock().await.remove(&id);
                Ok(PromptOutcome { answer: PromptAnswer::Deny, rule_id: None })
            }
        }
    }

    async fn open(
        &self,
        id: &str,
        subject: Subject,
        resource: Resource,
        session_id: &str,
        owner_id: &str,
    ) -> Result<oneshot::Receiver<PromptOutcome>> {
        let html = prompt_html(id, &subject, &resource);
        let frame = Frame::new(
            session_id,
            FrameType::Message,
            AuthorType::System,
            None,
            serde_json::to_value(
                MessagePayload::text(MessageRole::System, html).with_kind(MessageKind::System),
            )?,
        );
        self.store.append_frame(frame.clone()).await?;
        self.broadcaster
            .publish(session_id, ServerEvent::Frame { frame })
            .await;

        let (tx, rx) = oneshot::channel();
        let entry = PendingPrompt {
            request_hash: request_hash(&subject, &resource, session_id),
            subject,
            resource,
            session_id: session_id.to_owned(),
            owner_id: owner_id.to_owned(),
            tx,
            requested_at: Utc::now(),
        };
        self.pending.lock().await.insert(id.to_owned(), entry);
        Ok(rx)
    }

    /// Route a user's answer to the waiting prompt. Returns `false` when
    /// the prompt is unknown or already resolved (no-op, first answer
    /// wins). `allow_*` answers create the corresponding rule first.
    pub async fn handle_permission_response(
        &self,
        prompt_id: &str,
        answer: PromptAnswer,
    ) -> Result<bool> {
        if !is_permission_prompt(prompt_id) {
            return Ok(false);
        }
        let Some(entry) = self.pending.lock().await.remove(prompt_id) else {
            return Ok(false);
        };

        let rule_id = match answer {
            PromptAnswer::Deny => None,
            granted => {
                let rule = rule_for_answer(granted, &entry);
                let rule_id = rule.id.clone();
                self.store.insert_rule(rule).await?;
                Some(rule_id)
            }
        };

        let _ = entry.tx.send(PromptOutcome { answer, rule_id });
        Ok(true)
    }

    /// Resolve a prompt as denied without creating a rule.
    pub async fn cancel_prompt(&self, prompt_id: &str) -> bool {
        let Some(entry) = self.pending.lock().await.remove(prompt_id) else {
            return false;
        };
        let _ = entry.tx.send(PromptOutcome {
            answer: PromptAnswer::Deny,
            rule_id: None,
        });
        true
    }

    /// Teardown: deny every pending prompt. Prompt tokens never survive
    /// a restart.
    pub async fn cancel_all(&self) {
        let entries: Vec<PendingPrompt> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            let _ = entry.tx.send(PromptOutcome {
                answer: PromptAnswer::Deny,
                rule_id: None,
            });
        }
    }

    /// Snapshot for UI display: `(prompt_id, subject_id, resource_name,
    /// requested_at)`.
    pub async fn pending_list(
        &self,
    ) -> Vec<(String, String, String, chrono::DateTime<chrono::Utc>)> {
        self.pending
            .lock()
            .await
            .iter()
            .map(|(id, entry)| {
                (
                    id.clone(),
                    entry.subject.id.clone(),
                    entry.resource.name.clone(),
                    entry.requested_at,
                )
            })
            .collect()
    }

    pub async fn has_pending(&self) -> bool {
        !self.pending.lock().await.is_empty()
    }
}

fn rule_for_answer(answer: PromptAnswer, entry: &PendingPrompt) -> PermissionRule {
    let scope = match answer {
        PromptAnswer::AllowOnce => PermissionScope::Once,
        PromptAnswer::AllowSession => PermissionScope::Session,
        PromptAnswer::AllowAlways | PromptAnswer::Deny => PermissionScope::Permanent,
    };
    PermissionRule {
        id: uuid::Uuid::new_v4().to_string(),
        owner_user_id: Some(entry.owner_id.clone()),
        session_id: match scope {
            PermissionScope::Permanent => None,
            _ => Some(entry.session_id.clone()),
        },
        subject_type: entry.subject.subject_type,
        subject_id: Some(entry.subject.id.clone()),
        resource_type: entry.resource.resource_type,
        resource_name: Some(entry.resource.name.clone()),
        action: PermissionAction::Allow,
        scope,
        conditions: None,
        priority: 0,
        created_at: Utc::now(),
    }
}

fn prompt_html(id: &str, subject: &Subject, resource: &Resource) -> String {
    format!(
        "<prompt id=\"{id}\" kind=\"permission\">\n\
         <p>{} <b>{}</b> requests access to {} <b>{}</b>.</p>\n\
         <radio name=\"answer\" value=\"allow_once\">Allow once</radio>\n\
         <radio name=\"answer\" value=\"allow_session\">Allow for this session</radio>\n\
         <radio name=\"answer\" value=\"allow_always\">Always allow</radio>\n\
         <radio name=\"answer\" value=\"deny\">Deny</radio>\n\
         </prompt>",
        subject.subject_type.as_str(),
        subject.id,
        resource.resource_type.as_str(),
        resource.name,
    )
}

fn request_hash(subject: &Subject, resource: &Resource, session_id: &str) -> String {
    let mut hasher = DefaultHasher::new();
    subject.id.hash(&mut hasher);
    subject.subject_type.as_str().hash(&mut hasher);
    resource.name.hash(&mut hasher);
    resource.resource_type.as_str().hash(&mut hasher);
    session_id.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hero_schema::{Session, SessionStatus};
    use hero_store::FrameFilter;

    async fn broker() -> PromptBroker {
        let store = Store::open_in_memory().unwrap();
        store
            .create_session(Session {
                id: "s1".into(),
                owner_user_id: "u1".into(),
                name: "test".into(),
                status: SessionStatus::Active,
                parent_session_id: None,
                agent_id: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                input_tokens: 0,
                output_tokens: 0,
            })
            .await
            .unwrap();
        PromptBroker::new(store, Broadcaster::new())
    }

    async fn answer_first_pending(broker: &PromptBroker, answer: PromptAnswer) {
        for _ in 0..100 {
            let pending = broker.pending_list().await;
            if let Some((id, ..)) = pending.into_iter().next() {
                broker.handle_permission_response(&id, answer).await.unwrap();
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no prompt appeared");
    }

    #[tokio::test]
    async fn prompt_materializes_as_system_frame() {
        let broker = broker().await;
        let broker2 = broker.clone();
        let waiter = tokio::spawn(async move {
            broker2
                .request_prompt(
                    Subject::agent("a1"),
                    Resource::command("grep"),
                    "s1",
                    "u1",
                    Duration::from_secs(5),
                    &CancellationToken::new(),
                )
                .await
                .unwrap()
        });

        answer_first_pending(&broker, PromptAnswer::Deny).await;
        let outcome = waiter.await.unwrap();
        assert_eq!(outcome.answer, PromptAnswer::Deny);
        assert!(outcome.rule_id.is_none());

        let frames = broker
            .store
            .list_frames("s1", FrameFilter::default())
            .await
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].author_type, AuthorType::System);
        let content = frames[0].payload["content"].as_str().unwrap();
        assert!(content.contains("perm-"));
        assert!(content.contains("allow_once"));
        assert!(content.contains("allow_session"));
        assert!(content.contains("allow_always"));
        assert!(content.contains("deny"));
    }

    #[tokio::test]
    async fn allow_session_creates_session_scoped_rule() {
        let broker = broker().await;
        let broker2 = broker.clone();
        let waiter = tokio::spawn(async move {
            broker2
                .request_prompt(
                    Subject::agent("a1"),
                    Resource::command("grep"),
                    "s1",
                    "u1",
                    Duration::from_secs(5),
                    &CancellationToken::new(),
                )
                .await
                .unwrap()
        });

        answer_first_pending(&broker, PromptAnswer::AllowSession).await;
        let outcome = waiter.await.unwrap();
        assert_eq!(outcome.answer, PromptAnswer::AllowSession);
        assert!(outcome.rule_id.is_some());

        let rules = broker.store.list_candidate_rules("u1", "s1").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].scope, PermissionScope::Session);
        assert_eq!(rules[0].session_id.as_deref(), Some("s1"));
        assert_eq!(rules[0].resource_name.as_deref(), Some("grep"));
    }

    #[tokio::test]
    async fn allow_always_creates_permanent_rule() {
        let broker = broker().await;
        let broker2 = broker.clone();
        let waiter = tokio::spawn(async move {
            broker2
                .request_prompt(
                    Subject::agent("a1"),
                    Resource::command("grep"),
                    "s1",
                    "u1",
                    Duration::from_secs(5),
                    &CancellationToken::new(),
                )
                .await
                .unwrap()
        });

        answer_first_pending(&broker, PromptAnswer::AllowAlways).await;
        let outcome = waiter.await.unwrap();
        assert_eq!(outcome.answer, PromptAnswer::AllowAlways);

        let rules = broker.store.list_candidate_rules("u1", "s1").await.unwrap();
        assert_eq!(rules[0].scope, PermissionScope::Permanent);
        assert!(rules[0].session_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resolves_deny() {
        let broker = broker().await;
        let outcome = broker
            .request_prompt(
                Subject::agent("a1"),
                Resource::command("grep"),
                "s1",
                "u1",
                Duration::from_millis(50),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.answer, PromptAnswer::Deny);
        assert!(!broker.has_pending().await);
    }

    #[tokio::test]
    async fn cancellation_resolves_deny() {
        let broker = broker().await;
        let cancel = CancellationToken::new();
        let broker2 = broker.clone();
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move {
            broker2
                .request_prompt(
                    Subject::agent("a1"),
                    Resource::command("grep"),
                    "s1",
                    "u1",
                    Duration::from_secs(60),
                    &cancel2,
                )
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let outcome = waiter.await.unwrap();
        assert_eq!(outcome.answer, PromptAnswer::Deny);
        assert!(outcome.rule_id.is_none());
    }

    #[tokio::test]
    async fn double_resolution_is_noop() {
        let broker = broker().await;
        let broker2 = broker.clone();
        let waiter = tokio::spawn(async move {
            broker2
                .request_prompt(
                    Subject::agent("a1"),
                    Resource::command("grep"),
                    "s1",
                    "u1",
                    Duration::from_secs(5),
                    &CancellationToken::new(),
                )
                .await
                .unwrap()
        });

        let id = loop {
            let pending = broker.pending_list().await;
            if let Some((id, ..)) = pending.into_iter().next() {
                break id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        assert!(broker
            .handle_permission_response(&id, PromptAnswer::AllowOnce)
            .await
            .unwrap());
        // Second answer loses.
        assert!(!broker
            .handle_permission_response(&id, PromptAnswer::Deny)
            .await
            .unwrap());

        assert_eq!(waiter.await.unwrap().answer, PromptAnswer::AllowOnce);
    }

    #[tokio::test]
    async fn unknown_prompt_id_is_noop() {
        let broker = broker().await;
        assert!(!broker
            .handle_permission_response("perm-missing", PromptAnswer::Deny)
            .await
            .unwrap());
        assert!(!broker
            .handle_permission_response("not-a-prompt", PromptAnswer::Deny)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cancel_all_denies_everything() {
        let broker = broker().await;
        let broker2 = broker.clone();
        let waiter = tokio::spawn(async move {
            broker2
                .request_prompt(
                    Subject::agent("a1"),
                    Resource::command("grep"),
                    "s1",
                    "u1",
                    Duration::from_secs(60),
                    &CancellationToken::new(),
                )
                .await
                .unwrap()
        });

        while !broker.has_pending().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        broker.cancel_all().await;
        assert_eq!(waiter.await.unwrap().answer, PromptAnswer::Deny);
        assert!(!broker.has_pending().await);
    }
}
