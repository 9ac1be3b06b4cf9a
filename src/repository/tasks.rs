use anyhow::{bail, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use super::links::{delete_links, load_links, normalize_tags, owners_linking_to, replace_links, touch_tags};
use super::{lexical_score, like_pattern, queued, string_list, to_json};
use crate::embedding::pipeline::{EmbeddingEvents, EmbeddingJob};
use crate::embedding::text::task_text;
use crate::models::{now_ts, EntityKind, NewTask, Task};
use crate::storage::StorageCoordinator;

const COLUMNS: &str =
    "id, title, description, status, priority, parent_id, tags_json, created_at, updated_at";

#[derive(Clone)]
pub struct TaskRepository {
    storage: Arc<StorageCoordinator>,
    events: EmbeddingEvents,
}

impl TaskRepository {
    pub fn new(storage: Arc<StorageCoordinator>, events: EmbeddingEvents) -> Self {
        Self { storage, events }
    }

    fn pool(&self) -> &SqlitePool {
        self.storage.meta().pool()
    }

    pub async fn create(&self, new: NewTask) -> Result<Task> {
        if new.title.trim().is_empty() {
            bail!("task title must not be empty");
        }
        let now = now_ts();
        let task = Task {
            id: format!("task_{}", uuid::Uuid::new_v4().simple()),
            title: new.title,
            description: new.description,
            status: new.status.unwrap_or_else(|| "todo".to_string()),
            priority: new.priority,
            parent_id: new.parent_id,
            tags: normalize_tags(&new.tags),
            links: new.links,
            created_at: now,
            updated_at: now,
        };
        self.save(task).await
    }

    /// Persist every field of `task` and publish its text for embedding.
    pub async fn save(&self, mut task: Task) -> Result<Task> {
        task.tags = normalize_tags(&task.tags);
        task.updated_at = now_ts();
        let row = task.clone();
        queued(
            self.storage
                .meta()
                .run_write(move |pool| async move {
                    let mut tx = pool.begin().await?;
                    sqlx::query(
                        r#"
                        INSERT INTO tasks (id, title, description, status, priority, parent_id,
                            tags_json, created_at, updated_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                        ON CONFLICT(id) DO UPDATE SET
                            title = excluded.title,
                            description = excluded.description,
                            status = excluded.status,
                            priority = excluded.priority,
                            parent_id = excluded.parent_id,
                            tags_json = excluded.tags_json,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(&row.id)
                    .bind(&row.title)
                    .bind(&row.description)
                    .bind(&row.status)
                    .bind(&row.priority)
                    .bind(&row.parent_id)
                    .bind(to_json(&row.tags)?)
                    .bind(row.created_at)
                    .bind(row.updated_at)
                    .execute(&mut *tx)
                    .await?;
                    replace_links(&mut tx, EntityKind::Task, &row.id, &row.links).await?;
                    touch_tags(&mut tx, &row.tags).await?;
                    tx.commit().await?;
                    Ok(())
                })
                .await,
        )?;

        self.events
            .upsert(EmbeddingJob::new(EntityKind::Task, &task.id, task_text(&task)));
        Ok(task)
    }

    pub async fn update_status(&self, id: &str, status: &str) -> Result<Task> {
        let mut task = self
            .get(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task not found: {}", id))?;
        task.status = status.to_string();
        self.save(task).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!("SELECT {} FROM tasks ORDER BY created_at, id", COLUMNS))
            .fetch_all(self.pool())
            .await?;
        self.hydrate_all(&rows).await
    }

    pub async fn children(&self, parent_id: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE parent_id = ? ORDER BY created_at, id",
            COLUMNS
        ))
        .bind(parent_id)
        .fetch_all(self.pool())
        .await?;
        self.hydrate_all(&rows).await
    }

    /// Tasks that link to the given entity.
    pub async fn tasks_for_entity(&self, kind: EntityKind, id: &str) -> Result<Vec<Task>> {
        let ids = owners_linking_to(self.pool(), EntityKind::Task, kind, id).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(t) = self.get(&id).await? {
                out.push(t);
            }
        }
        Ok(out)
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(self.pool())
            .await?;
        Ok(n)
    }

    pub async fn by_id_prefix(&self, prefix: &str, limit: i64) -> Result<Vec<Task>> {
        let mut pattern = like_pattern(prefix);
        pattern.remove(0);
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE id LIKE ? ESCAPE '\\' ORDER BY id LIMIT ?",
            COLUMNS
        ))
        .bind(pattern)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        self.hydrate_all(&rows).await
    }

    pub async fn search_lexical(&self, query: &str, limit: usize) -> Result<Vec<(Task, f64)>> {
        let mut scored = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for term in query.split_whitespace() {
            let rows = sqlx::query(&format!(
                "SELECT {} FROM tasks WHERE title LIKE ?1 ESCAPE '\\' \
                 OR description LIKE ?1 ESCAPE '\\' OR tags_json LIKE ?1 ESCAPE '\\' LIMIT ?2",
                COLUMNS
            ))
            .bind(like_pattern(term))
            .bind((limit * 4) as i64)
            .fetch_all(self.pool())
            .await?;
            for row in &rows {
                let task = self.hydrate(row).await?;
                if !seen.insert(task.id.clone()) {
                    continue;
                }
                let title = lexical_score(query, &[&task.title]);
                let body = lexical_score(query, &[&task.description]) * 0.6;
                scored.push((task, title.max(body)));
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Delete a task with its links and vector. Children are detached, not deleted.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let owned = id.to_string();
        let removed = queued(
            self.storage
                .meta()
                .run_write(move |pool| async move {
                    let mut tx = pool.begin().await?;
                    sqlx::query("UPDATE tasks SET parent_id = NULL WHERE parent_id = ?")
                        .bind(&owned)
                        .execute(&mut *tx)
                        .await?;
                    delete_links(&mut tx, EntityKind::Task, &owned).await?;
                    sqlx::query("DELETE FROM embeddings WHERE entity_kind = 'task' AND entity_id = ?")
                        .bind(&owned)
                        .execute(&mut *tx)
                        .await?;
                    let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
                        .bind(&owned)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;
                    Ok(result.rows_affected() > 0)
                })
                .await,
        )?;
        if removed {
            self.events.removed(EntityKind::Task, id);
        }
        Ok(removed)
    }

    async fn hydrate(&self, row: &SqliteRow) -> Result<Task> {
        let id: String = row.get("id");
        let tags: String = row.get("tags_json");
        let links = load_links(self.pool(), EntityKind::Task, &id).await?;
        Ok(Task {
            id,
            title: row.get("title"),
            description: row.get("description"),
            status: row.get("status"),
            priority: row.get("priority"),
            parent_id: row.get("parent_id"),
            tags: string_list(&tags),
            links,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn hydrate_all(&self, rows: &[SqliteRow]) -> Result<Vec<Task>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(self.hydrate(row).await?);
        }
        Ok(out)
    }
}
