pub mod frames;
pub mod migrations;
pub mod participants;
pub mod permissions;
pub mod sessions;
pub mod users;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

pub use frames::{FrameFilter, SearchFilter, SearchHit};

/// SQLite-backed store for sessions, frames, participants, permission
/// rules, and accounts. All queries run on the blocking pool; the
/// connection is shared behind a mutex.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }

    /// Lightweight liveness probe for the health endpoint.
    pub async fn ping(&self) -> Result<()> {
        let db = self.conn();
        tokio::task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow::anyhow!("failed to lock sqlite connection"))?;
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }
}

/// Fixed-width RFC 3339 so text columns sort chronologically.
pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn ts_from_sql(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}
