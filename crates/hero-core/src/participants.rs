//! Session membership and coordinator routing.
//!
//! Unaddressed messages go to the active coordinator; members never
//! receive them.

use anyhow::Result;

use hero_schema::{
    HeroError, Participant, ParticipantRole, ParticipantType, Session,
};
use hero_store::Store;

/// A session resolved together with the agent that should answer.
#[derive(Debug, Clone)]
pub struct LoadedSession {
    pub session: Session,
    pub agent_id: Option<String>,
    pub agent_alias: Option<String>,
}

#[derive(Clone)]
pub struct ParticipantRegistry {
    store: Store,
}

impl ParticipantRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn add(&self, participant: Participant) -> Result<()> {
        self.store.add_participant(participant).await
    }

    pub async fn remove(
        &self,
        session_id: &str,
        participant_type: ParticipantType,
        participant_id: &str,
    ) -> Result<bool> {
        self.store
            .remove_participant(session_id, participant_type, participant_id)
            .await
    }

    pub async fn update_role(
        &self,
        session_id: &str,
        participant_type: ParticipantType,
        participant_id: &str,
        role: ParticipantRole,
    ) -> Result<bool> {
        self.store
            .update_participant_role(session_id, participant_type, participant_id, role)
            .await
    }

    pub async fn get_session_participants(&self, session_id: &str) -> Result<Vec<Participant>> {
        self.store.get_session_participants(session_id).await
    }

    pub async fn is_participant(
        &self,
        session_id: &str,
        participant_type: ParticipantType,
        participant_id: &str,
    ) -> Result<bool> {
        self.store
            .is_participant(session_id, participant_type, participant_id)
            .await
    }

    /// All agents holding the coordinator role, oldest first.
    pub async fn get_coordinators(&self, session_id: &str) -> Result<Vec<Participant>> {
        Ok(self
            .get_session_participants(session_id)
            .await?
            .into_iter()
            .filter(|p| {
                p.participant_type == ParticipantType::Agent
                    && p.role == ParticipantRole::Coordinator
            })
            .collect())
    }

    /// The single active coordinator, when there is one.
    pub async fn get_coordinator(&self, session_id: &str) -> Result<Option<Participant>> {
        Ok(self.get_coordinators(session_id).await?.into_iter().next())
    }

    /// Resolve a session and the agent that answers unaddressed
    /// messages:
    /// 1. the single coordinator agent, or
    /// 2. of several coordinators, the earliest joined, or
    /// 3. the session's legacy seed agent, or
    /// 4. no agent.
    pub async fn load_session_with_agent(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<LoadedSession> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| HeroError::not_found(format!("session: {session_id}")))?;

        if session.owner_user_id != user_id {
            let member = self
                .is_participant(session_id, ParticipantType::User, user_id)
                .await?;
            if !member {
                return Err(
                    HeroError::Permission(format!("not a participant of {session_id}")).into(),
                );
            }
        }

        // Participants come back ordered by joined_at, so the first
        // coordinator is also the earliest.
        let coordinators = self.get_coordinators(session_id).await?;
        if let Some(coordinator) = coordinators.into_iter().next() {
            return Ok(LoadedSession {
                session,
                agent_id: Some(coordinator.participant_id.clone()),
                agent_alias: coordinator.alias,
            });
        }

        let agent_id = session.agent_id.clone();
        Ok(LoadedSession {
            session,
            agent_id,
            agent_alias: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use hero_schema::SessionStatus;

    async fn setup(seed_agent: Option<&str>) -> ParticipantRegistry {
        let store = Store::open_in_memory().unwrap();
        store
            .create_session(Session {
                id: "s1".into(),
                owner_user_id: "u1".into(),
                name: "test".into(),
                status: SessionStatus::Active,
                parent_session_id: None,
                agent_id: seed_agent.map(ToOwned::to_owned),
                created_at: Utc::now(),
                updated_at: Utc::now(),
                input_tokens: 0,
                output_tokens: 0,
            })
            .await
            .unwrap();
        ParticipantRegistry::new(store)
    }

    fn agent(id: &str, role: ParticipantRole, joined_offset_secs: i64) -> Participant {
        Participant {
            session_id: "s1".into(),
            participant_type: ParticipantType::Agent,
            participant_id: id.into(),
            role,
            alias: Some(format!("alias-{id}")),
            joined_at: Utc::now() + Duration::seconds(joined_offset_secs),
        }
    }

    #[tokio::test]
    async fn single_coordinator_wins() {
        let registry = setup(None).await;
        registry
            .add(agent("a1", ParticipantRole::Coordinator, 0))
            .await
            .unwrap();
        registry
            .add(agent("a2", ParticipantRole::Member, 1))
            .await
            .unwrap();

        let loaded = registry.load_session_with_agent("s1", "u1").await.unwrap();
        assert_eq!(loaded.agent_id.as_deref(), Some("a1"));
        assert_eq!(loaded.agent_alias.as_deref(), Some("alias-a1"));
    }

    #[tokio::test]
    async fn earliest_of_multiple_coordinators_wins() {
        let registry = setup(None).await;
        registry
            .add(agent("late", ParticipantRole::Coordinator, 60))
            .await
            .unwrap();
        registry
            .add(agent("early", ParticipantRole::Coordinator, -60))
            .await
            .unwrap();

        let loaded = registry.load_session_with_agent("s1", "u1").await.unwrap();
        assert_eq!(loaded.agent_id.as_deref(), Some("early"));
    }

    #[tokio::test]
    async fn falls_back_to_seed_agent() {
        let registry = setup(Some("seed")).await;
        registry
            .add(agent("member", ParticipantRole::Member, 0))
            .await
            .unwrap();

        let loaded = registry.load_session_with_agent("s1", "u1").await.unwrap();
        assert_eq!(loaded.agent_id.as_deref(), Some("seed"));
        assert!(loaded.agent_alias.is_none());
    }

    #[tokio::test]
    async fn no_agent_fields_when_nothing_matches() {
        let registry = setup(None).await;
        let loaded = registry.load_session_with_agent("s1", "u1").await.unwrap();
        assert!(loaded.agent_id.is_none());
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let registry = setup(None).await;
        let err = registry
            .load_session_with_agent("ghost", "u1")
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HeroError>(),
            Some(HeroError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn non_participant_stranger_denied() {
        let registry = setup(None).await;
        let err = registry
            .load_session_with_agent("s1", "stranger")
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HeroError>(),
            Some(HeroError::Permission(_))
        ));
    }

    #[tokio::test]
    async fn promotion_changes_routing() {
        let registry = setup(None).await;
        registry
            .add(agent("a1", ParticipantRole::Member, 0))
            .await
            .unwrap();
        assert!(registry
            .load_session_with_agent("s1", "u1")
            .await
            .unwrap()
            .agent_id
            .is_none());

        registry
            .update_role(
                "s1",
                ParticipantType::Agent,
                "a1",
                ParticipantRole::Coordinator,
            )
            .await
            .unwrap();

        let loaded = registry.load_session_with_agent("s1", "u1").await.unwrap();
        assert_eq!(loaded.agent_id.as_deref(), Some("a1"));
    }
}
