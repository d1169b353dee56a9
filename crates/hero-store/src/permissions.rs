//! Permission-rule rows. Matching logic lives in the engine; the store
//! only narrows by owner/session scope.

use anyhow::{anyhow, Result};
use rusqlite::{params, Row};
use tokio::task;

use hero_schema::{
    PermissionAction, PermissionRule, PermissionScope, ResourceType, SubjectType,
};

use crate::{ts_from_sql, ts_to_sql, Store};

impl Store {
    pub async fn insert_rule(&self, rule: PermissionRule) -> Result<()> {
        let db = self.conn();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let conditions = rule
                .conditions
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            conn.execute(
                r#"
                INSERT INTO permission_rules (
                    id, owner_user_id, session_id, subject_type, subject_id,
                    resource_type, resource_name, action, scope, conditions,
                    priority, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                "#,
                params![
                    rule.id,
                    rule.owner_user_id,
                    rule.session_id,
                    rule.subject_type.as_str(),
                    rule.subject_id,
                    rule.resource_type.as_str(),
                    rule.resource_name,
                    rule.action.as_str(),
                    rule.scope.as_str(),
                    conditions,
                    rule.priority,
                    ts_to_sql(rule.created_at),
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;
        Ok(())
    }

    pub async fn delete_rule(&self, rule_id: &str) -> Result<bool> {
        let db = self.conn();
        let rule_id = rule_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let deleted =
                conn.execute("DELETE FROM permission_rules WHERE id = ?1", params![rule_id])?;
            Ok::<bool, anyhow::Error>(deleted > 0)
        })
        .await?
    }

    /// Rules that could apply in the given owner/session context:
    /// `permanent` rules of the owner, `session` rules of the session,
    /// and `once` rules bound to either.
    pub async fn list_candidate_rules(
        &self,
        owner_user_id: &str,
        session_id: &str,
    ) -> Result<Vec<PermissionRule>> {
        let db = self.conn();
        let owner = owner_user_id.to_owned();
        let session = session_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                "SELECT id, owner_user_id, session_id, subject_type, subject_id, \
                        resource_type, resource_name, action, scope, conditions, \
                        priority, created_at \
                 FROM permission_rules \
                 WHERE (scope = 'permanent' AND owner_user_id = ?1) \
                    OR (scope = 'session' AND session_id = ?2) \
                    OR (scope = 'once' AND (session_id = ?2 \
                        OR (session_id IS NULL AND owner_user_id = ?1)))",
            )?;
            let rows = stmt.query_map(params![owner, session], row_to_rule)?;
            let mut rules = Vec::new();
            for row in rows {
                rules.push(row?);
            }
            Ok::<Vec<PermissionRule>, anyhow::Error>(rules)
        })
        .await?
    }

    pub async fn list_rules_for_owner(&self, owner_user_id: &str) -> Result<Vec<PermissionRule>> {
        let db = self.conn();
        let owner = owner_user_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                "SELECT id, owner_user_id, session_id, subject_type, subject_id, \
                        resource_type, resource_name, action, scope, conditions, \
                        priority, created_at \
                 FROM permission_rules WHERE owner_user_id = ?1 \
                 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map(params![owner], row_to_rule)?;
            let mut rules = Vec::new();
            for row in rows {
                rules.push(row?);
            }
            Ok::<Vec<PermissionRule>, anyhow::Error>(rules)
        })
        .await?
    }
}

fn row_to_rule(row: &Row<'_>) -> rusqlite::Result<PermissionRule> {
    let subject_raw: String = row.get(3)?;
    let resource_raw: String = row.get(5)?;
    let action_raw: String = row.get(7)?;
    let scope_raw: String = row.get(8)?;
    let conditions_raw: Option<String> = row.get(9)?;
    let created_raw: String = row.get(11)?;

    Ok(PermissionRule {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        session_id: row.get(2)?,
        subject_type: SubjectType::parse(&subject_raw).unwrap_or(SubjectType::Any),
        subject_id: row.get(4)?,
        resource_type: ResourceType::parse(&resource_raw).unwrap_or(ResourceType::Any),
        resource_name: row.get(6)?,
        action: PermissionAction::parse(&action_raw).unwrap_or(PermissionAction::Prompt),
        scope: PermissionScope::parse(&scope_raw).unwrap_or(PermissionScope::Once),
        // Unparseable conditions are returned as null.
        conditions: conditions_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        priority: row.get(10)?,
        created_at: ts_from_sql(&created_raw).unwrap_or_default(),
    })
}
