use anyhow::{bail, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use super::links::{delete_links, load_links, normalize_tags, owners_linking_to, replace_links, touch_tags};
use super::{lexical_score, like_pattern, queued, string_list, to_json};
use crate::embedding::pipeline::{EmbeddingEvents, EmbeddingJob};
use crate::embedding::text::note_text;
use crate::models::{now_ts, EntityKind, NewNote, Note};
use crate::storage::StorageCoordinator;

const COLUMNS: &str = "id, title, content, parent_id, tags_json, created_at, updated_at";

#[derive(Clone)]
pub struct NoteRepository {
    storage: Arc<StorageCoordinator>,
    events: EmbeddingEvents,
}

impl NoteRepository {
    pub fn new(storage: Arc<StorageCoordinator>, events: EmbeddingEvents) -> Self {
        Self { storage, events }
    }

    fn pool(&self) -> &SqlitePool {
        self.storage.meta().pool()
    }

    pub async fn create(&self, new: NewNote) -> Result<Note> {
        if new.title.trim().is_empty() {
            bail!("note title must not be empty");
        }
        let now = now_ts();
        let note = Note {
            id: format!("note_{}", uuid::Uuid::new_v4().simple()),
            title: new.title,
            content: new.content,
            parent_id: new.parent_id,
            tags: new.tags,
            links: new.links,
            created_at: now,
            updated_at: now,
        };
        self.save(note).await
    }

    pub async fn save(&self, mut note: Note) -> Result<Note> {
        note.tags = normalize_tags(&note.tags);
        note.updated_at = now_ts();
        let row = note.clone();
        queued(
            self.storage
                .meta()
                .run_write(move |pool| async move {
                    let mut tx = pool.begin().await?;
                    sqlx::query(
                        r#"
                        INSERT INTO notes (id, title, content, parent_id, tags_json, created_at, updated_at)
                        VALUES (?, ?, ?, ?, ?, ?, ?)
                        ON CONFLICT(id) DO UPDATE SET
                            title = excluded.title,
                            content = excluded.content,
                            parent_id = excluded.parent_id,
                            tags_json = excluded.tags_json,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(&row.id)
                    .bind(&row.title)
                    .bind(&row.content)
                    .bind(&row.parent_id)
                    .bind(to_json(&row.tags)?)
                    .bind(row.created_at)
                    .bind(row.updated_at)
                    .execute(&mut *tx)
                    .await?;
                    replace_links(&mut tx, EntityKind::Note, &row.id, &row.links).await?;
                    touch_tags(&mut tx, &row.tags).await?;
                    tx.commit().await?;
                    Ok(())
                })
                .await,
        )?;

        self.events
            .upsert(EmbeddingJob::new(EntityKind::Note, &note.id, note_text(&note)));
        Ok(note)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Note>> {
        let row = sqlx::query(&format!("SELECT {} FROM notes WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> Result<Vec<Note>> {
        let rows = sqlx::query(&format!("SELECT {} FROM notes ORDER BY created_at, id", COLUMNS))
            .fetch_all(self.pool())
            .await?;
        self.hydrate_all(&rows).await
    }

    pub async fn children(&self, parent_id: &str) -> Result<Vec<Note>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM notes WHERE parent_id = ? ORDER BY created_at, id",
            COLUMNS
        ))
        .bind(parent_id)
        .fetch_all(self.pool())
        .await?;
        self.hydrate_all(&rows).await
    }

    /// Notes that link to the given entity ("notes for this component").
    pub async fn notes_for_entity(&self, kind: EntityKind, id: &str) -> Result<Vec<Note>> {
        let ids = owners_linking_to(self.pool(), EntityKind::Note, kind, id).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(n) = self.get(&id).await? {
                out.push(n);
            }
        }
        Ok(out)
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notes")
            .fetch_one(self.pool())
            .await?;
        Ok(n)
    }

    pub async fn by_id_prefix(&self, prefix: &str, limit: i64) -> Result<Vec<Note>> {
        let mut pattern = like_pattern(prefix);
        pattern.remove(0);
        let rows = sqlx::query(&format!(
            "SELECT {} FROM notes WHERE id LIKE ? ESCAPE '\\' ORDER BY id LIMIT ?",
            COLUMNS
        ))
        .bind(pattern)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        self.hydrate_all(&rows).await
    }

    pub async fn search_lexical(&self, query: &str, limit: usize) -> Result<Vec<(Note, f64)>> {
        let mut scored = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for term in query.split_whitespace() {
            let rows = sqlx::query(&format!(
                "SELECT {} FROM notes WHERE title LIKE ?1 ESCAPE '\\' \
                 OR content LIKE ?1 ESCAPE '\\' OR tags_json LIKE ?1 ESCAPE '\\' LIMIT ?2",
                COLUMNS
            ))
            .bind(like_pattern(term))
            .bind((limit * 4) as i64)
            .fetch_all(self.pool())
            .await?;
            for row in &rows {
                let note = self.hydrate(row).await?;
                if !seen.insert(note.id.clone()) {
                    continue;
                }
                let title = lexical_score(query, &[&note.title]);
                let body = lexical_score(query, &[&note.content]) * 0.6;
                scored.push((note, title.max(body)));
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
                    sqlx::query("UPDATE notes SET parent_id = NULL WHERE parent_id = ?")
                        .bind(&owned)
                        .execute(&mut *tx)
                        .await?;
                    delete_links(&mut tx, EntityKind::Note, &owned).await?;
                    sqlx::query("DELETE FROM embeddings WHERE entity_kind = 'note' AND entity_id = ?")
                        .bind(&owned)
                        .execute(&mut *tx)
                        .await?;
                    let result = sqlx::query("DELETE FROM notes WHERE id = ?")
                        .bind(&owned)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;
                    Ok(result.rows_affected() > 0)
                })
                .await,
        )?;
        if removed {
            self.events.removed(EntityKind::Note, id);
        }
        Ok(removed)
    }

    async fn hydrate(&self, row: &SqliteRow) -> Result<Note> {
        let id: String = row.get("id");
        let tags: String = row.get("tags_json");
        let links = load_links(self.pool(), EntityKind::Note, &id).await?;
        Ok(Note {
            id,
            title: row.get("title"),
            content: row.get("content"),
            parent_id: row.get("parent_id"),
            tags: string_list(&tags),
            links,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn hydrate_all(&self, rows: &[SqliteRow]) -> Result<Vec<Note>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(self.hydrate(row).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::models::EntityLink;

    #[tokio::test]
    async fn test_notes_for_entity_and_search() {
        let tmp = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(
            StorageCoordinator::initialize(tmp.path(), &DbConfig::default())
                .await
                .unwrap(),
        );
        let repo = NoteRepository::new(storage, EmbeddingEvents::disabled());

        let note = repo
            .create(NewNote {
                title: "Cache invalidation".into(),
                content: "The session cache is flushed on logout.".into(),
                links: vec![EntityLink::new(EntityKind::Component, "SessionCache")],
                ..Default::default()
            })
            .await
            .unwrap();
        repo.create(NewNote {
            title: "Release checklist".into(),
            content: "Bump versions.".into(),
            ..Default::default()
        })
        .await
        .unwrap();

        let linked = repo
            .notes_for_entity(EntityKind::Component, "SessionCache")
            .await
            .unwrap();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].id, note.id);
        assert_eq!(linked[0].links.len(), 1);

        let hits = repo.search_lexical("cache", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.id, note.id);

        let prefix = &note.id[..10];
        assert_eq!(repo.by_id_prefix(prefix, 5).await.unwrap().len(), 1);

        assert!(repo.delete(&note.id).await.unwrap());
        assert!(repo
            .notes_for_entity(EntityKind::Component, "SessionCache")
            .await
            .unwrap()
            .is_empty());
    }
}
