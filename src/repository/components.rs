//! Component reads, lexical lookup and cascade delete.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::sync::Arc;

use super::{json_value, lexical_score, like_pattern, queued, to_json};
use crate::models::{now_ts, Component, ComponentType, EntityKind, SourceSpan};
use crate::storage::StorageCoordinator;

const COLUMNS: &str = "id, name, component_type, language, file_path, start_line, start_column, \
                       end_line, end_column, code_snippet, metadata_json";

#[derive(Clone)]
pub struct ComponentRepository {
    storage: Arc<StorageCoordinator>,
}

impl ComponentRepository {
    pub fn new(storage: Arc<StorageCoordinator>) -> Self {
        Self { storage }
    }

    fn pool(&self) -> &SqlitePool {
        self.storage.code().pool()
    }

    pub async fn get(&self, id: &str) -> Result<Option<Component>> {
        let row = sqlx::query(&format!("SELECT {} FROM components WHERE id = ?", COLUMNS))
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.as_ref().map(row_to_component))
    }

    pub async fn get_many(&self, ids: &[String]) -> Result<Vec<Component>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(c) = self.get(id).await? {
                out.push(c);
            }
        }
        Ok(out)
    }

    pub async fn by_file(&self, file_path: &str) -> Result<Vec<Component>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM components WHERE file_path = ? ORDER BY start_line, id",
            COLUMNS
        ))
        .bind(file_path)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(row_to_component).collect())
    }

    pub async fn all(&self) -> Result<Vec<Component>> {
        let rows = sqlx::query(&format!("SELECT {} FROM components ORDER BY id", COLUMNS))
            .fetch_all(self.pool())
            .await?;
        Ok(rows.iter().map(row_to_component).collect())
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM components")
            .fetch_one(self.pool())
            .await?;
        Ok(n)
    }

    /// Components whose id starts with `prefix`.
    pub async fn by_id_prefix(&self, prefix: &str, limit: i64) -> Result<Vec<Component>> {
        let mut pattern = like_pattern(prefix);
        pattern.remove(0);
        let rows = sqlx::query(&format!(
            "SELECT {} FROM components WHERE id LIKE ? ESCAPE '\\' ORDER BY id LIMIT ?",
            COLUMNS
        ))
        .bind(pattern)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(row_to_component).collect())
    }

    /// Lexical candidates: each query term is matched against name, path
    /// and snippet; rows are scored in Rust and the best `limit` returned.
    pub async fn search_lexical(&self, query: &str, limit: usize) -> Result<Vec<(Component, f64)>> {
        let mut seen = HashSet::new();
        let mut scored = Vec::new();
        for term in query.split_whitespace() {
            let rows = sqlx::query(&format!(
                "SELECT {} FROM components \
                 WHERE name LIKE ?1 ESCAPE '\\' OR file_path LIKE ?1 ESCAPE '\\' \
                    OR code_snippet LIKE ?1 ESCAPE '\\' \
                 LIMIT ?2",
                COLUMNS
            ))
            .bind(like_pattern(term))
            .bind((limit * 4) as i64)
            .fetch_all(self.pool())
            .await?;

            for row in &rows {
                let component = row_to_component(row);
                if !seen.insert(component.id.clone()) {
                    continue;
                }
                let snippet = component.code_snippet.as_deref().unwrap_or("");
                let name_score = lexical_score(query, &[&component.name]);
                let other = lexical_score(query, &[&component.file_path, snippet]) * 0.5;
                scored.push((component, name_score.max(other)));
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Components one relationship hop away from `id`, in either direction.
    pub async fn neighbors(&self, id: &str) -> Result<Vec<Component>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT target_id FROM relationships WHERE source_id = ?1
            UNION
            SELECT source_id FROM relationships WHERE target_id = ?1
            "#,
        )
        .bind(id)
        .fetch_all(self.pool())
        .await?;
        self.get_many(&ids).await
    }

    /// Insert or replace a single component.
    pub async fn upsert(&self, component: Component) -> Result<()> {
        queued(
            self.storage
                .code()
                .run_write(move |pool| async move {
                    let mut tx = pool.begin().await?;
                    upsert_component(&mut tx, &component).await?;
                    tx.commit().await?;
                    Ok(())
                })
                .await,
        )
    }

    /// Delete a component, every relationship touching it, and its embedding.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        queued(
            self.storage
                .code()
                .run_write(move |pool| async move {
                    let mut tx = pool.begin().await?;
                    let removed = delete_component_cascade(&mut tx, &id).await?;
                    tx.commit().await?;
                    Ok(removed)
                })
                .await,
        )
    }
}

pub(crate) async fn upsert_component(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    c: &Component,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO components (id, name, component_type, language, file_path,
            start_line, start_column, end_line, end_column, code_snippet, metadata_json, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            component_type = excluded.component_type,
            language = excluded.language,
            file_path = excluded.file_path,
            start_line = excluded.start_line,
            start_column = excluded.start_column,
            end_line = excluded.end_line,
            end_column = excluded.end_column,
            code_snippet = excluded.code_snippet,
            metadata_json = excluded.metadata_json,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&c.id)
    .bind(&c.name)
    .bind(c.component_type.as_str())
    .bind(&c.language)
    .bind(&c.file_path)
    .bind(c.span.start_line as i64)
    .bind(c.span.start_column as i64)
    .bind(c.span.end_line as i64)
    .bind(c.span.end_column as i64)
    .bind(&c.code_snippet)
    .bind(to_json(&c.metadata)?)
    .bind(now_ts())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Remove a component with its edges and vector. Returns whether the row existed.
pub(crate) async fn delete_component_cascade(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    id: &str,
) -> Result<bool> {
    sqlx::query("DELETE FROM relationships WHERE source_id = ?1 OR target_id = ?1")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM embeddings WHERE entity_kind = ? AND entity_id = ?")
        .bind(EntityKind::Component.as_str())
        .bind(id)
        .execute(&mut **tx)
        .await?;
    let result = sqlx::query("DELETE FROM components WHERE id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub(crate) fn row_to_component(row: &SqliteRow) -> Component {
    let metadata: String = row.get("metadata_json");
    let component_type: String = row.get("component_type");
    Component {
        id: row.get("id"),
        name: row.get("name"),
        component_type: ComponentType::parse(&component_type),
        language: row.get("language"),
        file_path: row.get("file_path"),
        span: SourceSpan {
            start_line: row.get::<i64, _>("start_line") as u32,
            start_column: row.get::<i64, _>("start_column") as u32,
            end_line: row.get::<i64, _>("end_line") as u32,
            end_column: row.get::<i64, _>("end_column") as u32,
        },
        code_snippet: row.get("code_snippet"),
        metadata: json_value(&metadata),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::models::{Relationship, RelationshipType};
    use crate::repository::RelationshipRepository;

    fn component(id: &str, name: &str) -> Component {
        Component {
            id: id.to_string(),
            name: name.to_string(),
            component_type: ComponentType::Class,
            language: "typescript".into(),
            file_path: "src/a.ts".into(),
            span: SourceSpan::lines(1, 10),
            code_snippet: Some(format!("class {} {{}}", name)),
            metadata: serde_json::json!({}),
        }
    }

    async fn storage() -> (tempfile::TempDir, Arc<StorageCoordinator>) {
        let tmp = tempfile::TempDir::new().unwrap();
        let storage = StorageCoordinator::initialize(tmp.path(), &DbConfig::default())
            .await
            .unwrap();
        (tmp, Arc::new(storage))
    }

    #[tokio::test]
    async fn test_delete_cascades_relationships() {
        let (_tmp, storage) = storage().await;
        let components = ComponentRepository::new(Arc::clone(&storage));
        let relationships = RelationshipRepository::new(Arc::clone(&storage));

        components.upsert(component("A", "Alpha")).await.unwrap();
        components.upsert(component("B", "Beta")).await.unwrap();
        components.upsert(component("C", "Gamma")).await.unwrap();
        relationships
            .upsert(Relationship::new("A", "B", RelationshipType::Uses, 0.9), "src/a.ts")
            .await
            .unwrap();
        relationships
            .upsert(Relationship::new("C", "A", RelationshipType::Extends, 0.9), "src/a.ts")
            .await
            .unwrap();

        assert!(components.delete("A").await.unwrap());

        assert!(relationships.by_source("A").await.unwrap().is_empty());
        assert!(relationships.by_target("A").await.unwrap().is_empty());
        assert!(relationships.by_source("C").await.unwrap().is_empty());
        assert!(components.get("A").await.unwrap().is_none());
        assert_eq!(components.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_lexical_search_prefers_name_matches() {
        let (_tmp, storage) = storage().await;
        let components = ComponentRepository::new(storage);
        components.upsert(component("svc", "UserService")).await.unwrap();
        components.upsert(component("repo", "UserRepository")).await.unwrap();
        components.upsert(component("other", "Billing")).await.unwrap();

        let hits = components.search_lexical("UserService", 10).await.unwrap();
        assert_eq!(hits[0].0.id, "svc");
        assert!(hits.iter().all(|(c, _)| c.id != "other"));

        let by_prefix = components.by_id_prefix("re", 5).await.unwrap();
        assert_eq!(by_prefix.len(), 1);
        assert_eq!(by_prefix[0].id, "repo");
    }
}
