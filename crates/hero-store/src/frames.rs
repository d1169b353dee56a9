//! Append-only frame log and the deterministic replay compiler.

use anyhow::{anyhow, Result};
use chrono::Utc;
use rusqlite::{params, params_from_iter, Row};
use serde::{Deserialize, Serialize};
use tokio::task;

use hero_schema::{AuthorType, CompiledState, Frame, FrameType, HeroError};

use crate::{ts_from_sql, ts_to_sql, Store};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FrameFilter {
    pub since_id: Option<String>,
    pub types: Option<Vec<FrameType>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchFilter {
    pub session_id: Option<String>,
    pub types: Option<Vec<FrameType>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub frame: Frame,
    pub session_name: String,
}

impl Store {
    /// Append a frame. Fails with `Conflict` on a duplicate id and
    /// assigns the timestamp when the caller left it unset.
    pub async fn append_frame(&self, mut frame: Frame) -> Result<String> {
        if frame.timestamp.timestamp_millis() == 0 {
            frame.timestamp = Utc::now();
        }

        let db = self.conn();
        let id = frame.id.clone();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;

            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM frames WHERE id = ?1)",
                    params![frame.id],
                    |row| row.get(0),
                )?;
            if exists {
                return Err(HeroError::Conflict(format!("duplicate frame id: {}", frame.id)).into());
            }

            let target_ids = if frame.target_ids.is_empty() {
                None
            } else {
                Some(frame.target_ids.join(","))
            };

            conn.execute(
                r#"
                INSERT INTO frames (
                    id, session_id, parent_id, target_ids, timestamp, type, author_type, author_id, payload
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    frame.id,
                    frame.session_id,
                    frame.parent_id,
                    target_ids,
                    ts_to_sql(frame.timestamp),
                    frame.frame_type.as_str(),
                    frame.author_type.as_str(),
                    frame.author_id,
                    serde_json::to_string(&frame.payload)?,
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;

        Ok(id)
    }

    /// List frames in replay order: ascending timestamp, then insertion
    /// order.
    pub async fn list_frames(&self, session_id: &str, filter: FrameFilter) -> Result<Vec<Frame>> {
        let db = self.conn();
        let session_id = session_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;

            let mut sql = String::from(
                "SELECT id, session_id, parent_id, target_ids, timestamp, type, author_type, author_id, payload \
                 FROM frames WHERE session_id = ?",
            );
            let mut args: Vec<String> = vec![session_id];

            if let Some(since) = &filter.since_id {
                sql.push_str(" AND id > ?");
                args.push(since.clone());
            }
            if let Some(types) = &filter.types {
                if !types.is_empty() {
                    let marks = vec!["?"; types.len()].join(", ");
                    sql.push_str(&format!(" AND type IN ({marks})"));
                    args.extend(types.iter().map(|t| t.as_str().to_owned()));
                }
            }
            sql.push_str(" ORDER BY timestamp ASC, rowid ASC");
            sql.push_str(&format!(
                " LIMIT {} OFFSET {}",
                filter.limit.map(|l| l as i64).unwrap_or(-1),
                filter.offset.unwrap_or(0)
            ));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args), row_to_frame)?;
            let mut frames = Vec::new();
            for row in rows {
                frames.push(row?);
            }
            Ok::<Vec<Frame>, anyhow::Error>(frames)
        })
        .await?
    }

    /// Substring search over serialized payloads, scoped to sessions the
    /// user owns. Results carry the session name for display.
    pub async fn search_frames(
        &self,
        user_id: &str,
        query: &str,
        filter: SearchFilter,
    ) -> Result<Vec<SearchHit>> {
        let db = self.conn();
        let user_id = user_id.to_owned();
        let needle = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;

            let mut sql = String::from(
                "SELECT f.id, f.session_id, f.parent_id, f.target_ids, f.timestamp, f.type, \
                        f.author_type, f.author_id, f.payload, s.name \
                 FROM frames f JOIN sessions s ON s.id = f.session_id \
                 WHERE s.owner_user_id = ? AND f.payload LIKE ? ESCAPE '\\'",
            );
            let mut args: Vec<String> = vec![user_id, needle];

            if let Some(session_id) = &filter.session_id {
                sql.push_str(" AND f.session_id = ?");
                args.push(session_id.clone());
            }
            if let Some(types) = &filter.types {
                if !types.is_empty() {
                    let marks = vec!["?"; types.len()].join(", ");
                    sql.push_str(&format!(" AND f.type IN ({marks})"));
                    args.extend(types.iter().map(|t| t.as_str().to_owned()));
                }
            }
            sql.push_str(" ORDER BY f.timestamp DESC, f.rowid DESC");
            sql.push_str(&format!(
                " LIMIT {} OFFSET {}",
                filter.limit.map(|l| l as i64).unwrap_or(50),
                filter.offset.unwrap_or(0)
            ));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args), |row| {
                let frame = row_to_frame(row)?;
                let session_name: String = row.get(9)?;
                Ok(SearchHit {
                    frame,
                    session_name,
                })
            })?;
            let mut hits = Vec::new();
            for row in rows {
                hits.push(row?);
            }
            Ok::<Vec<SearchHit>, anyhow::Error>(hits)
        })
        .await?
    }
}

/// Deterministic replay: fold frames in order into the compiled state.
///
/// `message`/`request`/`result` and unknown types overwrite by id
/// (last write wins). `update` frames rewrite their existing targets and
/// are not themselves stored. `compact` frames load their snapshot.
pub fn compile(frames: &[Frame]) -> CompiledState {
    let mut compiled = CompiledState::new();

    for frame in frames {
        match frame.frame_type {
            FrameType::Update => {
                for tid in &frame.target_ids {
                    let Some(target) = tid.strip_prefix("frame:") else {
                        continue;
                    };
                    if compiled.contains_key(target) {
                        compiled.insert(target.to_owned(), frame.payload.clone());
                    }
                }
            }
            FrameType::Compact => {
                if let Some(snapshot) = frame.payload.get("snapshot").and_then(|s| s.as_object()) {
                    for (id, payload) in snapshot {
                        compiled.insert(id.clone(), payload.clone());
                    }
                }
            }
            _ => {
                compiled.insert(frame.id.clone(), frame.payload.clone());
            }
        }
    }

    compiled
}

fn row_to_frame(row: &Row<'_>) -> rusqlite::Result<Frame> {
    let target_ids: Option<String> = row.get(3)?;
    let ts_raw: String = row.get(4)?;
    let type_raw: String = row.get(5)?;
    let author_raw: String = row.get(6)?;
    let payload_raw: String = row.get(8)?;

    Ok(Frame {
        id: row.get(0)?,
        session_id: row.get(1)?,
        parent_id: row.get(2)?,
        target_ids: target_ids
            .map(|csv| {
                csv.split(',')
                    .filter(|s| !s.is_empty())
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default(),
        timestamp: ts_from_sql(&ts_raw).unwrap_or_default(),
        frame_type: FrameType::parse(&type_raw),
        author_type: AuthorType::parse(&author_raw).unwrap_or(AuthorType::System),
        author_id: row.get(7)?,
        // Corrupt payloads read as empty rather than failing replay.
        payload: serde_json::from_str(&payload_raw)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hero_schema::{MessagePayload, MessageRole, SessionStatus};

    async fn seeded_store() -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .create_session(hero_schema::Session {
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

    fn message_frame(session: &str, content: &str) -> Frame {
        Frame::new(
            session,
            FrameType::Message,
            AuthorType::User,
            Some("u1".into()),
            serde_json::to_value(MessagePayload::text(MessageRole::User, content)).unwrap(),
        )
    }

    #[tokio::test]
    async fn append_and_list_preserves_insertion_order() {
        let store = seeded_store().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let frame = message_frame("s1", &format!("msg-{i}"));
            ids.push(store.append_frame(frame).await.unwrap());
        }

        let frames = store
            .list_frames("s1", FrameFilter::default())
            .await
            .unwrap();
        let listed: Vec<_> = frames.iter().map(|f| f.id.clone()).collect();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn append_duplicate_id_is_conflict() {
        let store = seeded_store().await;
        let frame = message_frame("s1", "hello");
        let dup = frame.clone();
        store.append_frame(frame).await.unwrap();

        let err = store.append_frame(dup).await.unwrap_err();
        let hero = err.downcast_ref::<HeroError>().expect("typed error");
        assert!(matches!(hero, HeroError::Conflict(_)));
    }

    #[tokio::test]
    async fn list_filters_by_type_and_since() {
        let store = seeded_store().await;
        let m1 = store
            .append_frame(message_frame("s1", "first"))
            .await
            .unwrap();
        let request = Frame::new(
            "s1",
            FrameType::Request,
            AuthorType::Agent,
            Some("a1".into()),
            serde_json::json!({"name": "grep"}),
        );
        store.append_frame(request).await.unwrap();

        let only_requests = store
            .list_frames(
                "s1",
                FrameFilter {
                    types: Some(vec![FrameType::Request]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(only_requests.len(), 1);
        assert_eq!(only_requests[0].frame_type, FrameType::Request);

        let after_m1 = store
            .list_frames(
                "s1",
                FrameFilter {
                    since_id: Some(m1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(after_m1.len(), 1);
    }

    #[tokio::test]
    async fn update_frame_rewrites_existing_target() {
        let store = seeded_store().await;
        let m1 = store
            .append_frame(message_frame("s1", "A"))
            .await
            .unwrap();
        let update = Frame::new(
            "s1",
            FrameType::Update,
            AuthorType::System,
            None,
            serde_json::json!({"content": "B"}),
        )
        .with_targets(vec![Frame::frame_target(&m1)]);
        let update_id = store.append_frame(update).await.unwrap();

        let frames = store
            .list_frames("s1", FrameFilter::default())
            .await
            .unwrap();
        let compiled = compile(&frames);
        assert_eq!(compiled[&m1]["content"], "B");
        assert!(!compiled.contains_key(&update_id));
    }

    #[tokio::test]
    async fn update_with_missing_target_drops_silently() {
        let store = seeded_store().await;
        let update = Frame::new(
            "s1",
            FrameType::Update,
            AuthorType::System,
            None,
            serde_json::json!({"content": "B"}),
        )
        .with_targets(vec!["frame:ghost".into()]);
        store.append_frame(update).await.unwrap();

        let frames = store
            .list_frames("s1", FrameFilter::default())
            .await
            .unwrap();
        assert!(compile(&frames).is_empty());
    }

    #[tokio::test]
    async fn compact_snapshot_then_live_event() {
        let store = seeded_store().await;
        let compact = Frame::new(
            "s1",
            FrameType::Compact,
            AuthorType::System,
            None,
            serde_json::json!({"snapshot": {"M1": {"v": 1}}}),
        );
        store.append_frame(compact).await.unwrap();
        let m2 = store
            .append_frame(message_frame("s1", "live"))
            .await
            .unwrap();

        let frames = store
            .list_frames("s1", FrameFilter::default())
            .await
            .unwrap();
        let compiled = compile(&frames);
        assert_eq!(compiled["M1"]["v"], 1);
        assert!(compiled.contains_key(&m2));
    }

    #[test]
    fn compile_is_deterministic_and_idempotent() {
        let frames = vec![
            Frame::new(
                "s1",
                FrameType::Message,
                AuthorType::User,
                None,
                serde_json::json!({"v": 1}),
            ),
            Frame::new(
                "s1",
                FrameType::Message,
                AuthorType::User,
                None,
                serde_json::json!({"v": 2}),
            ),
        ];
        assert_eq!(compile(&frames), compile(&frames));
    }

    #[test]
    fn compile_same_id_last_write_wins() {
        let mut a = Frame::new(
            "s1",
            FrameType::Message,
            AuthorType::User,
            None,
            serde_json::json!({"v": 1}),
        );
        a.id = "dup".into();
        let mut b = a.clone();
        b.payload = serde_json::json!({"v": 2});

        let compiled = compile(&[a, b]);
        assert_eq!(compiled["dup"]["v"], 2);
    }

    #[tokio::test]
    async fn search_scopes_to_owner_and_joins_session_name() {
        let store = seeded_store().await;
        store
            .create_session(hero_schema::Session {
                id: "s2".into(),
                owner_user_id: "other".into(),
                name: "theirs".into(),
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
            .append_frame(message_frame("s1", "needle in mine"))
            .await
            .unwrap();
        store
            .append_frame(message_frame("s2", "needle in theirs"))
            .await
            .unwrap();

        let hits = store
            .search_frames("u1", "needle", SearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].session_name, "test");
        assert_eq!(hits[0].frame.session_id, "s1");
    }
}
