use anyhow::Result;
use rusqlite::Connection;
use std::collections::HashSet;

type Migration = (i64, &'static str);

fn migrations() -> Vec<Migration> {
    vec![
        (
            1,
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                owner_user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                parent_session_id TEXT,
                agent_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_owner ON sessions(owner_user_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_session_id);

            CREATE TABLE IF NOT EXISTS frames (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                parent_id TEXT,
                target_ids TEXT,
                timestamp TEXT NOT NULL,
                type TEXT NOT NULL,
                author_type TEXT NOT NULL,
                author_id TEXT,
                payload TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_frames_session_ts ON frames(session_id, timestamp);

            CREATE TABLE IF NOT EXISTS participants (
                session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                participant_type TEXT NOT NULL,
                participant_id TEXT NOT NULL,
                role TEXT NOT NULL,
                alias TEXT,
                joined_at TEXT NOT NULL,
                UNIQUE(session_id, participant_type, participant_id)
            );

            CREATE INDEX IF NOT EXISTS idx_participants_session ON participants(session_id);
            "#,
        ),
        (
            2,
            r#"
            CREATE TABLE IF NOT EXISTS permission_rules (
                id TEXT PRIMARY KEY,
                owner_user_id TEXT,
                session_id TEXT,
                subject_type TEXT NOT NULL,
                subject_id TEXT,
                resource_type TEXT NOT NULL,
                resource_name TEXT,
                action TEXT NOT NULL,
                scope TEXT NOT NULL,
                conditions TEXT,
                priority INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_rules_owner ON permission_rules(owner_user_id);
            CREATE INDEX IF NOT EXISTS idx_rules_session ON permission_rules(session_id);
            "#,
        ),
        (
            3,
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                display_name TEXT,
                password_sha256 TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS api_keys (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                prefix TEXT NOT NULL,
                sha256 TEXT NOT NULL UNIQUE,
                scopes TEXT NOT NULL DEFAULT '[]',
                expires_at TEXT,
                created_at TEXT NOT NULL,
                last_used_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_api_keys_user ON api_keys(user_id);

            CREATE TABLE IF NOT EXISTS magic_links (
                token_sha256 TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                used INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS auth_tokens (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                sha256 TEXT NOT NULL UNIQUE,
                expires_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        ),
    ]
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS __schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        "#,
    )?;

    let mut stmt = conn.prepare("SELECT version FROM __schema_version")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    let mut applied = HashSet::new();
    for row in rows {
        applied.insert(row?);
    }

    for (version, sql) in migrations() {
        if applied.contains(&version) {
            continue;
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO __schema_version(version, applied_at) VALUES (?1, datetime('now'))",
            [version],
        )?;
        tx.commit()?;
        tracing::debug!(version, "applied schema migration");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM __schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, migrations().len() as i64);
    }
}
