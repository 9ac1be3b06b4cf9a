//! Rules: guidance attached to file-path trigger patterns, with
//! applied/accepted analytics.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSetBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use super::links::{delete_links, load_links, normalize_tags, replace_links, touch_tags};
use super::{lexical_score, like_pattern, queued, string_list, to_json};
use crate::embedding::pipeline::{EmbeddingEvents, EmbeddingJob};
use crate::embedding::text::rule_text;
use crate::models::{now_ts, EntityKind, NewRule, Rule};
use crate::storage::StorageCoordinator;

const COLUMNS: &str = "id, name, description, guidance, code_template, trigger_patterns_json, \
                       parent_id, tags_json, applied_count, accepted_count, last_applied_at, \
                       created_at, updated_at";

#[derive(Clone)]
pub struct RuleRepository {
    storage: Arc<StorageCoordinator>,
    events: EmbeddingEvents,
}

impl RuleRepository {
    pub fn new(storage: Arc<StorageCoordinator>, events: EmbeddingEvents) -> Self {
        Self { storage, events }
    }

    fn pool(&self) -> &SqlitePool {
        self.storage.meta().pool()
    }

    pub async fn create(&self, new: NewRule) -> Result<Rule> {
        if new.name.trim().is_empty() {
            bail!("rule name must not be empty");
        }
        for pattern in &new.trigger_patterns {
            Glob::new(pattern).with_context(|| format!("Invalid trigger pattern: {}", pattern))?;
        }
        let now = now_ts();
        let rule = Rule {
            id: format!("rule_{}", uuid::Uuid::new_v4().simple()),
            name: new.name,
            description: new.description,
            guidance: new.guidance,
            code_template: new.code_template,
            trigger_patterns: new.trigger_patterns,
            parent_id: new.parent_id,
            tags: new.tags,
            links: new.links,
            applied_count: 0,
            accepted_count: 0,
            last_applied_at: None,
            created_at: now,
            updated_at: now,
        };
        self.save(rule).await
    }

    /// Persist the rule's content fields. Analytics counters are only
    /// changed through [`RuleRepository::record_application`].
    pub async fn save(&self, mut rule: Rule) -> Result<Rule> {
        rule.tags = normalize_tags(&rule.tags);
        rule.updated_at = now_ts();
        let row = rule.clone();
        queued(
            self.storage
                .meta()
                .run_write(move |pool| async move {
                    let mut tx = pool.begin().await?;
                    sqlx::query(
                        r#"
                        INSERT INTO rules (id, name, description, guidance, code_template,
                            trigger_patterns_json, parent_id, tags_json, applied_count,
                            accepted_count, last_applied_at, created_at, updated_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0, NULL, ?, ?)
                        ON CONFLICT(id) DO UPDATE SET
                            name = excluded.name,
                            description = excluded.description,
                            guidance = excluded.guidance,
                            code_template = excluded.code_template,
                            trigger_patterns_json = excluded.trigger_patterns_json,
                            parent_id = excluded.parent_id,
                            tags_json = excluded.tags_json,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(&row.id)
                    .bind(&row.name)
                    .bind(&row.description)
                    .bind(&row.guidance)
                    .bind(&row.code_template)
                    .bind(to_json(&row.trigger_patterns)?)
                    .bind(&row.parent_id)
                    .bind(to_json(&row.tags)?)
                    .bind(row.created_at)
                    .bind(row.updated_at)
                    .execute(&mut *tx)
                    .await?;
                    replace_links(&mut tx, EntityKind::Rule, &row.id, &row.links).await?;
                    touch_tags(&mut tx, &row.tags).await?;
                    tx.commit().await?;
                    Ok(())
                })
                .await,
        )?;

        self.events
            .upsert(EmbeddingJob::new(EntityKind::Rule, &rule.id, rule_text(&rule)));
        Ok(rule)
    }

    /// Count one application of the rule; `accepted` also bumps the accepted counter.
    pub async fn record_application(&self, id: &str, accepted: bool) -> Result<Rule> {
        let owned = id.to_string();
        let updated = queued(
            self.storage
                .meta()
                .run_write(move |pool| async move {
                    let result = sqlx::query(
                        "UPDATE rules SET applied_count = applied_count + 1, \
                         accepted_count = accepted_count + ?, last_applied_at = ? WHERE id = ?",
                    )
                    .bind(accepted as i64)
                    .bind(now_ts())
                    .bind(&owned)
                    .execute(&pool)
                    .await?;
                    Ok(result.rows_affected())
                })
                .await,
        )?;
        if updated == 0 {
            bail!("rule not found: {}", id);
        }
        self.get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("rule not found: {}", id))
    }

    /// Rules with at least one trigger pattern matching `file_path`.
    /// Rules whose patterns fail to compile are skipped.
    pub async fn matching_rules(&self, file_path: &str) -> Result<Vec<Rule>> {
        let mut out = Vec::new();
        for rule in self.list().await? {
            if rule.trigger_patterns.is_empty() {
                continue;
            }
            let mut builder = GlobSetBuilder::new();
            let mut valid = true;
            for pattern in &rule.trigger_patterns {
                match Glob::new(pattern) {
                    Ok(glob) => {
                        builder.add(glob);
                    }
                    Err(e) => {
                        tracing::debug!(rule = %rule.id, pattern = %pattern, error = %e, "skipping rule with invalid pattern");
                        valid = false;
                        break;
                    }
                }
            }
            if !valid {
                continue;
            }
            if let Ok(set) = builder.build() {
                if set.is_match(file_path) {
                    out.push(rule);
                }
            }
        }
        Ok(out)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Rule>> {
        let row = sqlx::query(&format!("SELECT {} FROM rules WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> Result<Vec<Rule>> {
        let rows = sqlx::query(&format!("SELECT {} FROM rules ORDER BY created_at, id", COLUMNS))
            .fetch_all(self.pool())
            .await?;
        self.hydrate_all(&rows).await
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rules")
            .fetch_one(self.pool())
            .await?;
        Ok(n)
    }

    pub async fn by_id_prefix(&self, prefix: &str, limit: i64) -> Result<Vec<Rule>> {
        let mut pattern = like_pattern(prefix);
        pattern.remove(0);
        let rows = sqlx::query(&format!(
            "SELECT {} FROM rules WHERE id LIKE ? ESCAPE '\\' ORDER BY id LIMIT ?",
            COLUMNS
        ))
        .bind(pattern)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        self.hydrate_all(&rows).await
    }

    pub async fn search_lexical(&self, query: &str, limit: usize) -> Result<Vec<(Rule, f64)>> {
        let mut scored = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for term in query.split_whitespace() {
            let rows = sqlx::query(&format!(
                "SELECT {} FROM rules WHERE name LIKE ?1 ESCAPE '\\' \
                 OR description LIKE ?1 ESCAPE '\\' OR guidance LIKE ?1 ESCAPE '\\' LIMIT ?2",
                COLUMNS
            ))
            .bind(like_pattern(term))
            .bind((limit * 4) as i64)
            .fetch_all(self.pool())
            .await?;
            for row in &rows {
                let rule = self.hydrate(row).await?;
                if !seen.insert(rule.id.clone()) {
                    continue;
                }
                let name = lexical_score(query, &[&rule.name]);
                let body = lexical_score(query, &[&rule.description, &rule.guidance]) * 0.6;
                scored.push((rule, name.max(body)));
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let owned = id.to_string();
        let removed = queued(
            self.storage
                .meta()
                .run_write(move |pool| async move {
                    let mut tx = pool.begin().await?;
                    sqlx::query("UPDATE rules SET parent_id = NULL WHERE parent_id = ?")
                        .bind(&owned)
                        .execute(&mut *tx)
                        .await?;
                    delete_links(&mut tx, EntityKind::Rule, &owned).await?;
                    sqlx::query("DELETE FROM embeddings WHERE entity_kind = 'rule' AND entity_id = ?")
                        .bind(&owned)
                        .execute(&mut *tx)
                        .await?;
                    let result = sqlx::query("DELETE FROM rules WHERE id = ?")
                        .bind(&owned)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;
                    Ok(result.rows_affected() > 0)
                })
                .await,
        )?;
        if removed {
            self.events.removed(EntityKind::Rule, id);
        }
        Ok(removed)
    }

    async fn hydrate(&self, row: &SqliteRow) -> Result<Rule> {
        let id: String = row.get("id");
        let tags: String = row.get("tags_json");
        let patterns: String = row.get("trigger_patterns_json");
        let links = load_links(self.pool(), EntityKind::Rule, &id).await?;
        Ok(Rule {
            id,
            name: row.get("name"),
            description: row.get("description"),
            guidance: row.get("guidance"),
            code_template: row.get("code_template"),
            trigger_patterns: string_list(&patterns),
            parent_id: row.get("parent_id"),
            tags: string_list(&tags),
            links,
            applied_count: row.get("applied_count"),
            accepted_count: row.get("accepted_count"),
            last_applied_at: row.get("last_applied_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn hydrate_all(&self, rows: &[SqliteRow]) -> Result<Vec<Rule>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(self.hydrate(row).await?);
        }
        Ok(out)
    }
}
