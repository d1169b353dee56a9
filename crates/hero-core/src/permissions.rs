//! First-match-wins permission evaluation.
//!
//! Rules are loaded for the owner/session context, filtered by subject
//! and resource (explicit id or wildcard), checked against their
//! conditions, then ordered by priority, specificity, and age. No rule
//! means `prompt`. Internal failures evaluate to `deny`; an exception
//! can never become an allow.

use anyhow::Result;

use hero_schema::{
    PermissionDecision, PermissionRule, PermissionScope, Resource, Subject,
};
use hero_store::Store;

#[derive(Debug, Clone)]
pub struct PermissionCtx {
    pub owner_id: String,
    pub session_id: String,
    /// Data the rule conditions evaluate against (e.g. interaction args).
    pub context: serde_json::Value,
}

#[derive(Clone)]
pub struct PermissionEngine {
    store: Store,
}

impl PermissionEngine {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Evaluate a subject/resource pair. Never errors: failures collapse
    /// to a deny with a reason.
    pub async fn evaluate(
        &self,
        subject: &Subject,
        resource: &Resource,
        ctx: &PermissionCtx,
    ) -> PermissionDecision {
        match self.evaluate_inner(subject, resource, ctx).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::error!(error = %e, "permission evaluation failed");
                PermissionDecision::deny(format!("permission evaluation failed: {e}"))
            }
        }
    }

    async fn evaluate_inner(
        &self,
        subject: &Subject,
        resource: &Resource,
        ctx: &PermissionCtx,
    ) -> Result<PermissionDecision> {
        let rules = self
            .store
            .list_candidate_rules(&ctx.owner_id, &ctx.session_id)
            .await?;

        let mut matching: Vec<&PermissionRule> = rules
            .iter()
            .filter(|rule| rule_matches(rule, subject, resource, ctx))
            .collect();

        matching.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| specificity(b).cmp(&specificity(a)))
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let Some(rule) = matching.first() else {
            // Safe default.
            return Ok(PermissionDecision::prompt());
        };

        Ok(PermissionDecision {
            action: rule.action,
            rule_id: Some(rule.id.clone()),
            scope: Some(rule.scope),
            reason: None,
        })
    }

    /// Delete a `once` rule after its single allowed evaluation commits.
    pub async fn consume_once(&self, decision: &PermissionDecision) -> Result<()> {
        if decision.scope == Some(PermissionScope::Once) {
            if let Some(rule_id) = &decision.rule_id {
                self.store.delete_rule(rule_id).await?;
            }
        }
        Ok(())
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

fn specificity(rule: &PermissionRule) -> u8 {
    ((rule.subject_id.is_some() as u8) << 1) | (rule.resource_name.is_some() as u8)
}

fn rule_matches(
    rule: &PermissionRule,
    subject: &Subject,
    resource: &Resource,
    ctx: &PermissionCtx,
) -> bool {
    rule.subject_type.matches(subject.subject_type)
        && rule
            .subject_id
            .as_deref()
            .map_or(true, |id| id == subject.id)
        && rule.resource_type.matches(resource.resource_type)
        && rule
            .resource_name
            .as_deref()
            .map_or(true, |name| name == resource.name)
        && conditions_match(rule.conditions.as_ref(), ctx)
}

/// Fixed condition schema: `equals`, `in`, `range`, `sessionIdMatches`.
/// Malformed conditions count as null (always match); a well-formed
/// object with unknown keys fails closed.
fn conditions_match(conditions: Option<&serde_json::Value>, ctx: &PermissionCtx) -> bool {
    let Some(conditions) = conditions else {
        return true;
    };
    let Some(map) = conditions.as_object() else {
        return true;
    };

    for (key, clause) in map {
        let holds = match key.as_str() {
            "equals" => clause.as_object().is_some_and(|pairs| {
                pairs
                    .iter()
                    .all(|(path, expected)| lookup(&ctx.context, path) == Some(expected))
            }),
            "in" => clause.as_object().is_some_and(|pairs| {
                pairs.iter().all(|(path, allowed)| {
                    let Some(values) = allowed.as_array() else {
                        return false;
                    };
                    lookup(&ctx.context, path)
                        .map(|actual| values.contains(actual))
                        .unwrap_or(false)
                })
            }),
            "range" => clause.as_object().is_some_and(|pairs| {
                pairs.iter().all(|(path, bounds)| {
                    let Some(actual) =
                        lookup(&ctx.context, path).and_then(serde_json::Value::as_f64)
                    else {
                        return false;
                    };
                    let min_ok = bounds
                        .get("min")
                        .and_then(serde_json::Value::as_f64)
                        .map_or(true, |min| actual >= min);
                    let max_ok = bounds
                        .get("max")
                        .and_then(serde_json::Value::as_f64)
                        .map_or(true, |max| actual <= max);
                    min_ok && max_ok
                })
            }),
            "sessionIdMatches" => clause.as_str().is_some_and(|pattern| {
                match pattern.strip_suffix('*') {
                    Some(prefix) => ctx.session_id.starts_with(prefix),
                    None => ctx.session_id == pattern,
                }
            }),
            _ => false,
        };

        if !holds {
            return false;
        }
    }

    true
}

fn lookup<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}
