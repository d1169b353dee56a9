//! Participant rows: membership and roles within a session.

use anyhow::{anyhow, Result};
use rusqlite::{params, Row};
use tokio::task;

use hero_schema::{HeroError, Participant, ParticipantRole, ParticipantType};

use crate::{ts_from_sql, ts_to_sql, Store};

impl Store {
    /// Add a participant. `(session, type, id)` is unique; duplicates are
    /// a `Conflict`. At most one owner per session.
    pub async fn add_participant(&self, participant: Participant) -> Result<()> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;

            if participant.role == ParticipantRole::Owner {
                let owners: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM participants WHERE session_id = ?1 AND role = 'owner'",
                    params![participant.session_id],
                    |row| row.get(0),
                )?;
                if owners > 0 {
                    return Err(HeroError::Conflict(format!(
                        "session {} already has an owner",
                        participant.session_id
                    ))
                    .into());
                }
            }

            let inserted = conn.execute(
                r#"
                INSERT OR IGNORE INTO participants (
                    session_id, participant_type, participant_id, role, alias, joined_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    participant.session_id,
                    participant.participant_type.as_str(),
                    participant.participant_id,
                    participant.role.as_str(),
                    participant.alias,
                    ts_to_sql(participant.joined_at),
                ],
            )?;
            if inserted == 0 {
                return Err(HeroError::Conflict(format!(
                    "participant {}:{} already in session {}",
                    participant.participant_type.as_str(),
                    participant.participant_id,
                    participant.session_id
                ))
                .into());
            }
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    pub async fn remove_participant(
        &self,
        session_id: &str,
        participant_type: ParticipantType,
        participant_id: &str,
    ) -> Result<bool> {
        let db = self.conn();
        let session_id = session_id.to_owned();
        let participant_id = participant_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let removed = conn.execute(
                "DELETE FROM participants WHERE session_id = ?1 AND participant_type = ?2 \
                 AND participant_id = ?3",
                params![session_id, participant_type.as_str(), participant_id],
            )?;
            Ok::<bool, anyhow::Error>(removed > 0)
        })
        .await?
    }

    pub async fn update_participant_role(
        &self,
        session_id: &str,
        participant_type: ParticipantType,
        participant_id: &str,
        role: ParticipantRole,
    ) -> Result<bool> {
        let db = self.conn();
        let session_id = session_id.to_owned();
        let participant_id = participant_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let changed = conn.execute(
                "UPDATE participants SET role = ?4 WHERE session_id = ?1 \
                 AND participant_type = ?2 AND participant_id = ?3",
                params![
                    session_id,
                    participant_type.as_str(),
                    participant_id,
                    role.as_str()
                ],
            )?;
            Ok::<bool, anyhow::Error>(changed > 0)
        })
        .await?
    }

    pub async fn get_session_participants(&self, session_id: &str) -> Result<Vec<Participant>> {
        let db = self.conn();
        let session_id = session_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                "SELECT session_id, participant_type, participant_id, role, alias, joined_at \
                 FROM participants WHERE session_id = ?1 ORDER BY joined_at ASC, rowid ASC",
            )?;
            let rows = stmt.query_map(params![session_id], row_to_participant)?;
            let mut participants = Vec::new();
            for row in rows {
                participants.push(row?);
            }
            Ok::<Vec<Participant>, anyhow::Error>(participants)
        })
        .await?
    }

    pub async fn is_participant(
        &self,
        session_id: &str,
        participant_type: ParticipantType,
        participant_id: &str,
    ) -> Result<bool> {
        let db = self.conn();
        let session_id = session_id.to_owned();
        let participant_id = participant_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM participants WHERE session_id = ?1 \
                 AND participant_type = ?2 AND participant_id = ?3)",
                params![session_id, participant_type.as_str(), participant_id],
                |row| row.get(0),
            )?;
            Ok::<bool, anyhow::Error>(exists)
        })
        .await?
    }
}

fn row_to_participant(row: &Row<'_>) -> rusqlite::Result<Participant> {
    let type_raw: String = row.get(1)?;
    let role_raw: String = row.get(3)?;
    let joined_raw: String = row.get(5)?;

    Ok(Participant {
        session_id: row.get(0)?,
        participant_type: ParticipantType::parse(&type_raw).unwrap_or(ParticipantType::User),
        participant_id: row.get(2)?,
        role: ParticipantRole::parse(&role_raw).unwrap_or(ParticipantRole::Member),
        alias: row.get(4)?,
        joined_at: ts_from_sql(&joined_raw).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hero_schema::{Session, SessionStatus};

    async fn store_with_session() -> Store {
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
        store
    }

    fn participant(
        ptype: ParticipantType,
        id: &str,
        role: ParticipantRole,
    ) -> Participant {
        Participant {
            session_id: "s1".into(),
            participant_type: ptype,
            participant_id: id.into(),
            role,
            alias: None,
            joined_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn add_and_query_participants() {
        let store = store_with_session().await;
        store
            .add_participant(participant(
                ParticipantType::User,
                "u1",
                ParticipantRole::Owner,
            ))
            .await
            .unwrap();
        store
            .add_participant(participant(
                ParticipantType::Agent,
                "a1",
                ParticipantRole::Coordinator,
            ))
            .await
            .unwrap();

        assert!(store
            .is_participant("s1", ParticipantType::Agent, "a1")
            .await
            .unwrap());
        assert!(!store
            .is_participant("s1", ParticipantType::Agent, "a2")
            .await
            .unwrap());

        let all = store.get_session_participants("s1").await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_participant_is_conflict() {
        let store = store_with_session().await;
        store
            .add_participant(participant(
                ParticipantType::Agent,
                "a1",
                ParticipantRole::Member,
            ))
            .await
            .unwrap();
        let err = store
            .add_participant(participant(
                ParticipantType::Agent,
                "a1",
                ParticipantRole::Member,
            ))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HeroError>(),
            Some(HeroError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn second_owner_rejected() {
        let store = store_with_session().await;
        store
            .add_participant(participant(
                ParticipantType::User,
                "u1",
                ParticipantRole::Owner,
            ))
            .await
            .unwrap();
        let err = store
            .add_participant(participant(
                ParticipantType::User,
                "u2",
                ParticipantRole::Owner,
            ))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HeroError>(),
            Some(HeroError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn promote_and_remove() {
        let store = store_with_session().await;
        store
            .add_participant(participant(
                ParticipantType::Agent,
                "a1",
                ParticipantRole::Member,
            ))
            .await
            .unwrap();

        assert!(store
            .update_participant_role(
                "s1",
                ParticipantType::Agent,
                "a1",
                ParticipantRole::Coordinator
            )
            .await
            .unwrap());
        let all = store.get_session_participants("s1").await.unwrap();
        assert_eq!(all[0].role, ParticipantRole::Coordinator);

        assert!(store
            .remove_participant("s1", ParticipantType::Agent, "a1")
            .await
            .unwrap());
        assert!(store
            .get_session_participants("s1")
            .await
            .unwrap()
            .is_empty());
    }
}
