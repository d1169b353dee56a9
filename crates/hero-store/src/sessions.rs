//! Session rows: lifecycle, ownership, and token accounting.

use anyhow::{anyhow, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tokio::task;

use hero_schema::{HeroError, Session, SessionStatus};

use crate::{ts_from_sql, ts_to_sql, Store};

impl Store {
    pub async fn create_session(&self, session: Session) -> Result<()> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let inserted = conn.execute(
                r#"
                INSERT OR IGNORE INTO sessions (
                    id, owner_user_id, name, status, parent_session_id, agent_id,
                    created_at, updated_at, input_tokens, output_tokens
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    session.id,
                    session.owner_user_id,
                    session.name,
                    session.status.as_str(),
                    session.parent_session_id,
                    session.agent_id,
                    ts_to_sql(session.created_at),
                    ts_to_sql(session.updated_at),
                    session.input_tokens as i64,
                    session.output_tokens as i64,
                ],
            )?;
            if inserted == 0 {
                return Err(
                    HeroError::Conflict(format!("duplicate session id: {}", session.id)).into(),
                );
            }
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let db = self.conn();
        let id = id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let session = conn
                .query_row(
                    "SELECT id, owner_user_id, name, status, parent_session_id, agent_id, \
                            created_at, updated_at, input_tokens, output_tokens \
                     FROM sessions WHERE id = ?1",
                    params![id],
                    row_to_session,
                )
                .optional()?;
            Ok::<Option<Session>, anyhow::Error>(session)
        })
        .await?
    }

    pub async fn list_sessions(&self, owner_user_id: &str) -> Result<Vec<Session>> {
        let db = self.conn();
        let owner = owner_user_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                "SELECT id, owner_user_id, name, status, parent_session_id, agent_id, \
                        created_at, updated_at, input_tokens, output_tokens \
                 FROM sessions WHERE owner_user_id = ?1 ORDER BY updated_at DESC",
            )?;
            let rows = stmt.query_map(params![owner], row_to_session)?;
            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row?);
            }
            Ok::<Vec<Session>, anyhow::Error>(sessions)
        })
        .await?
    }

    pub async fn rename_session(&self, id: &str, name: &str) -> Result<bool> {
        self.update_session_fields(id, Some(name.to_owned()), None)
            .await
    }

    pub async fn set_session_status(&self, id: &str, status: SessionStatus) -> Result<bool> {
        self.update_session_fields(id, None, Some(status)).await
    }

    async fn update_session_fields(
        &self,
        id: &str,
        name: Option<String>,
        status: Option<SessionStatus>,
    ) -> Result<bool> {
        let db = self.conn();
        let id = id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let now = ts_to_sql(Utc::now());
            let changed = match (&name, &status) {
                (Some(n), Some(s)) => conn.execute(
                    "UPDATE sessions SET name = ?2, status = ?3, updated_at = ?4 WHERE id = ?1",
                    params![id, n, s.as_str(), now],
                )?,
                (Some(n), None) => conn.execute(
                    "UPDATE sessions SET name = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, n, now],
                )?,
                (None, Some(s)) => conn.execute(
                    "UPDATE sessions SET status = ?2, updated_at = ?3 WHERE id = ?1",
                    params![id, s.as_str(), now],
                )?,
                (None, None) => 0,
            };
            Ok::<bool, anyhow::Error>(changed > 0)
        })
        .await?
    }

    /// Delete a session. Frames and participants cascade.
    pub async fn delete_session(&self, id: &str) -> Result<bool> {
        let db = self.conn();
        let id = id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
            Ok::<bool, anyhow::Error>(deleted > 0)
        })
        .await?
    }

    /// Accumulate provider usage onto the session counters.
    pub async fn add_session_usage(
        &self,
        id: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<()> {
        let db = self.conn();
        let id = id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            conn.execute(
                "UPDATE sessions SET input_tokens = input_tokens + ?2, \
                        output_tokens = output_tokens + ?3, updated_at = ?4 \
                 WHERE id = ?1",
                params![
                    id,
                    input_tokens as i64,
                    output_tokens as i64,
                    ts_to_sql(Utc::now())
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }
}

fn row_to_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    let status_raw: String = row.get(3)?;
    let created_raw: String = row.get(6)?;
    let updated_raw: String = row.get(7)?;
    let input_tokens: i64 = row.get(8)?;
    let output_tokens: i64 = row.get(9)?;

    Ok(Session {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        name: row.get(2)?,
        status: SessionStatus::parse(&status_raw).unwrap_or(SessionStatus::Active),
        parent_session_id: row.get(4)?,
        agent_id: row.get(5)?,
        created_at: ts_from_sql(&created_raw).unwrap_or_default(),
        updated_at: ts_from_sql(&updated_raw).unwrap_or_default(),
        input_tokens: input_tokens.max(0) as u64,
        output_tokens: output_tokens.max(0) as u64,
    })
}
