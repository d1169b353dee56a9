//! Accounts: users, API keys, magic-link tokens, session auth tokens.
//!
//! API keys are stored as SHA-256 hex plus a short display prefix; the
//! plaintext (`hero_` + random token) is returned exactly once at
//! creation.

use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use rand::RngCore;
use rusqlite::{params, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use tokio::task;

use hero_schema::{ApiKey, HeroError, User};

use crate::{ts_from_sql, ts_to_sql, Store};

pub const API_KEY_PREFIX: &str = "hero_";
const MAGIC_LINK_TTL_MINUTES: i64 = 15;

/// Freshly generated key material: the plaintext leaves the process once.
pub struct GeneratedKey {
    pub plaintext: String,
    pub prefix: String,
    pub sha256: String,
}

pub fn generate_api_key() -> GeneratedKey {
    let mut raw = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut raw);
    let plaintext = format!("{API_KEY_PREFIX}{}", hex::encode(raw));
    GeneratedKey {
        prefix: plaintext[..API_KEY_PREFIX.len() + 4].to_owned(),
        sha256: sha256_hex(&plaintext),
        plaintext,
    }
}

pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

impl Store {
    pub async fn create_user(&self, user: User) -> Result<()> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO users (id, email, display_name, password_sha256, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user.id,
                    user.email,
                    user.display_name,
                    user.password_sha256,
                    ts_to_sql(user.created_at),
                ],
            )?;
            if inserted == 0 {
                return Err(
                    HeroError::Conflict(format!("user {} already exists", user.email)).into(),
                );
            }
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let db = self.conn();
        let id = id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let user = conn
                .query_row(
                    "SELECT id, email, display_name, password_sha256, created_at \
                     FROM users WHERE id = ?1",
                    params![id],
                    row_to_user,
                )
                .optional()?;
            Ok::<Option<User>, anyhow::Error>(user)
        })
        .await?
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let db = self.conn();
        let email = email.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let user = conn
                .query_row(
                    "SELECT id, email, display_name, password_sha256, created_at \
                     FROM users WHERE email = ?1",
                    params![email],
                    row_to_user,
                )
                .optional()?;
            Ok::<Option<User>, anyhow::Error>(user)
        })
        .await?
    }

    pub async fn update_user_profile(
        &self,
        id: &str,
        display_name: Option<String>,
        email: Option<String>,
    ) -> Result<bool> {
        let db = self.conn();
        let id = id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let changed = match (&display_name, &email) {
                (Some(d), Some(e)) => conn.execute(
                    "UPDATE users SET display_name = ?2, email = ?3 WHERE id = ?1",
                    params![id, d, e],
                )?,
                (Some(d), None) => conn.execute(
                    "UPDATE users SET display_name = ?2 WHERE id = ?1",
                    params![id, d],
                )?,
                (None, Some(e)) => {
                    conn.execute("UPDATE users SET email = ?2 WHERE id = ?1", params![id, e])?
                }
                (None, None) => 0,
            };
            Ok::<bool, anyhow::Error>(changed > 0)
        })
        .await?
    }

    pub async fn set_user_password(&self, id: &str, password_sha256: &str) -> Result<bool> {
        let db = self.conn();
        let id = id.to_owned();
        let hash = password_sha256.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let changed = conn.execute(
                "UPDATE users SET password_sha256 = ?2 WHERE id = ?1",
                params![id, hash],
            )?;
            Ok::<bool, anyhow::Error>(changed > 0)
        })
        .await?
    }

    // ------------------------------------------------------------
    // API keys
    // ------------------------------------------------------------

    pub async fn insert_api_key(&self, key: ApiKey) -> Result<()> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            conn.execute(
                r#"
                INSERT INTO api_keys (
                    id, user_id, name, prefix, sha256, scopes, expires_at, created_at, last_used_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    key.id,
                    key.user_id,
                    key.name,
                    key.prefix,
                    key.sha256,
                    serde_json::to_string(&key.scopes)?,
                    key.expires_at.map(ts_to_sql),
                    ts_to_sql(key.created_at),
                    key.last_used_at.map(ts_to_sql),
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    pub async fn list_api_keys(&self, user_id: &str) -> Result<Vec<ApiKey>> {
        let db = self.conn();
        let user_id = user_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                "SELECT id, user_id, name, prefix, sha256, scopes, expires_at, created_at, last_used_at \
                 FROM api_keys WHERE user_id = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map(params![user_id], row_to_api_key)?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row?);
            }
            Ok::<Vec<ApiKey>, anyhow::Error>(keys)
        })
        .await?
    }

    pub async fn delete_api_key(&self, user_id: &str, key_id: &str) -> Result<bool> {
        let db = self.conn();
        let user_id = user_id.to_owned();
        let key_id = key_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let deleted = conn.execute(
                "DELETE FROM api_keys WHERE id = ?1 AND user_id = ?2",
                params![key_id, user_id],
            )?;
            Ok::<bool, anyhow::Error>(deleted > 0)
        })
        .await?
    }

    /// Resolve a plaintext API key to its owner, bumping `last_used_at`.
    /// Expired keys resolve to `None`.
    pub async fn find_api_key(&self, plaintext: &str) -> Result<Option<ApiKey>> {
        let db = self.conn();
        let hash = sha256_hex(plaintext);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let key = conn
                .query_row(
                    "SELECT id, user_id, name, prefix, sha256, scopes, expires_at, created_at, last_used_at \
                     FROM api_keys WHERE sha256 = ?1",
                    params![hash],
                    row_to_api_key,
                )
                .optional()?;

            let Some(key) = key else {
                return Ok::<Option<ApiKey>, anyhow::Error>(None);
            };
            if let Some(expires) = key.expires_at {
                if expires < Utc::now() {
                    return Ok(None);
                }
            }
            conn.execute(
                "UPDATE api_keys SET last_used_at = ?2 WHERE id = ?1",
                params![key.id, ts_to_sql(Utc::now())],
            )?;
            Ok(Some(key))
        })
        .await?
    }

    // ------------------------------------------------------------
    // Magic links & session tokens
    // ------------------------------------------------------------

    /// Record a magic-link token for an email. Returns the plaintext
    /// token to embed in the link.
    pub async fn create_magic_link(&self, email: &str) -> Result<String> {
        let mut raw = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);
        let hash = sha256_hex(&token);

        let db = self.conn();
        let email = email.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            conn.execute(
                "INSERT INTO magic_links (token_sha256, email, expires_at, used, created_at) \
                 VALUES (?1, ?2, ?3, 0, ?4)",
                params![
                    hash,
                    email,
                    ts_to_sql(Utc::now() + Duration::minutes(MAGIC_LINK_TTL_MINUTES)),
                    ts_to_sql(Utc::now()),
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(token)
    }

    /// Consume a magic-link token. Single use; expired or unknown tokens
    /// return `None`.
    pub async fn consume_magic_link(&self, token: &str) -> Result<Option<String>> {
        let db = self.conn();
        let hash = sha256_hex(token);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let row = conn
                .query_row(
                    "SELECT email, expires_at, used FROM magic_links WHERE token_sha256 = ?1",
                    params![hash],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )
                .optional()?;

            let Some((email, expires_raw, used)) = row else {
                return Ok::<Option<String>, anyhow::Error>(None);
            };
            if used != 0 || ts_from_sql(&expires_raw)? < Utc::now() {
                return Ok(None);
            }
            conn.execute(
                "UPDATE magic_links SET used = 1 WHERE token_sha256 = ?1",
                params![hash],
            )?;
            Ok(Some(email))
        })
        .await?
    }

    /// Mint a bearer session token for a user. Returns the plaintext.
    pub async fn create_auth_token(&self, user_id: &str, ttl_hours: i64) -> Result<String> {
        let mut raw = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);
        let hash = sha256_hex(&token);

        let db = self.conn();
        let user_id = user_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            conn.execute(
                "INSERT INTO auth_tokens (id, user_id, sha256, expires_at, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    user_id,
                    hash,
                    ts_to_sql(Utc::now() + Duration::hours(ttl_hours)),
                    ts_to_sql(Utc::now()),
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(token)
    }

    pub async fn find_auth_token_user(&self, token: &str) -> Result<Option<String>> {
        let db = self.conn();
        let hash = sha256_hex(token);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let row = conn
                .query_row(
                    "SELECT user_id, expires_at FROM auth_tokens WHERE sha256 = ?1",
                    params![hash],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .optional()?;
            let Some((user_id, expires_raw)) = row else {
                return Ok::<Option<String>, anyhow::Error>(None);
            };
            if ts_from_sql(&expires_raw)? < Utc::now() {
                return Ok(None);
            }
            Ok(Some(user_id))
        })
        .await?
    }
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    let created_raw: String = row.get(4)?;
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        display_name: row.get(2)?,
        password_sha256: row.get(3)?,
        created_at: ts_from_sql(&created_raw).unwrap_or_default(),
    })
}

fn row_to_api_key(row: &Row<'_>) -> rusqlite::Result<ApiKey> {
    let scopes_raw: String = row.get(5)?;
    let expires_raw: Option<String> = row.get(6)?;
    let created_raw: String = row.get(7)?;
    let last_used_raw: Option<String> = row.get(8)?;

    Ok(ApiKey {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        prefix: row.get(3)?,
        sha256: row.get(4)?,
        scopes: serde_json::from_str(&scopes_raw).unwrap_or_default(),
        expires_at: expires_raw.and_then(|raw| ts_from_sql(&raw).ok()),
        created_at: ts_from_sql(&created_raw).unwrap_or_default(),
        last_used_at: last_used_raw.and_then(|raw| ts_from_sql(&raw).ok()),
    })
}
