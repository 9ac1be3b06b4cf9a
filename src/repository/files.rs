//! File fingerprints and the per-file graph replacement transaction.

use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::sync::Arc;

use super::components::{delete_component_cascade, upsert_component};
use super::queued;
use super::relationships::upsert_relationship;
use crate::models::{Component, FileRecord, Relationship};
use crate::storage::StorageCoordinator;

/// Counts produced by one [`FileRepository::replace_file_graph`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileGraphWrite {
    pub components_written: usize,
    pub relationships_written: usize,
    /// Ids that were in the file before and are absent now.
    pub removed_component_ids: Vec<String>,
}

#[derive(Clone)]
pub struct FileRepository {
    storage: Arc<StorageCoordinator>,
}

impl FileRepository {
    pub fn new(storage: Arc<StorageCoordinator>) -> Self {
        Self { storage }
    }

    fn pool(&self) -> &SqlitePool {
        self.storage.code().pool()
    }

    pub async fn get(&self, path: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query(
            "SELECT path, content_hash, size, modified_at, indexed_at, component_count \
             FROM files WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.as_ref().map(row_to_file))
    }

    pub async fn all(&self) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(
            "SELECT path, content_hash, size, modified_at, indexed_at, component_count \
             FROM files ORDER BY path",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(row_to_file).collect())
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(self.pool())
            .await?;
        Ok(n)
    }

    /// Atomically replace everything `record.path` contributed to the graph.
    ///
    /// In one transaction: drop the edges this file produced, cascade-delete
    /// components the file no longer defines, upsert the new components and
    /// edges, then store the fingerprint. Edges other files produced that
    /// point at surviving components are left alone.
    pub async fn replace_file_graph(
        &self,
        record: FileRecord,
        components: Vec<Component>,
        relationships: Vec<Relationship>,
    ) -> Result<FileGraphWrite> {
        queued(
            self.storage
                .code()
                .run_write(move |pool| async move {
                    let mut tx = pool.begin().await?;

                    let previous: Vec<String> =
                        sqlx::query_scalar("SELECT id FROM components WHERE file_path = ?")
                            .bind(&record.path)
                            .fetch_all(&mut *tx)
                            .await?;
                    sqlx::query("DELETE FROM relationships WHERE file_path = ?")
                        .bind(&record.path)
                        .execute(&mut *tx)
                        .await?;

                    let current: HashSet<&str> =
                        components.iter().map(|c| c.id.as_str()).collect();
                    let mut removed = Vec::new();
                    for id in previous {
                        if !current.contains(id.as_str()) {
                            delete_component_cascade(&mut tx, &id).await?;
                            removed.push(id);
                        }
                    }

                    for component in &components {
                        upsert_component(&mut tx, component).await?;
                    }
                    for relationship in &relationships {
                        upsert_relationship(&mut tx, relationship, &record.path).await?;
                    }
                    upsert_file(&mut tx, &record).await?;

                    tx.commit().await?;
                    Ok(FileGraphWrite {
                        components_written: components.len(),
                        relationships_written: relationships.len(),
                        removed_component_ids: removed,
                    })
                })
                .await,
        )
    }

    /// Remove a file's components (with cascade), its edges, and its fingerprint.
    /// Returns the removed component ids.
    pub async fn remove_file(&self, path: &str) -> Result<Vec<String>> {
        let path = path.to_string();
        queued(
            self.storage
                .code()
                .run_write(move |pool| async move {
                    let mut tx = pool.begin().await?;
                    let ids: Vec<String> =
                        sqlx::query_scalar("SELECT id FROM components WHERE file_path = ?")
                            .bind(&path)
                            .fetch_all(&mut *tx)
                            .await?;
                    sqlx::query("DELETE FROM relationships WHERE file_path = ?")
                        .bind(&path)
                        .execute(&mut *tx)
                        .await?;
                    for id in &ids {
                        delete_component_cascade(&mut tx, id).await?;
                    }
                    sqlx::query("DELETE FROM files WHERE path = ?")
                        .bind(&path)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;
                    Ok(ids)
                })
                .await,
        )
    }
}

async fn upsert_file(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, f: &FileRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO files (path, content_hash, size, modified_at, indexed_at, component_count)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(path) DO UPDATE SET
            content_hash = excluded.content_hash,
            size = excluded.size,
            modified_at = excluded.modified_at,
            indexed_at = excluded.indexed_at,
            component_count = excluded.component_count
        "#,
    )
    .bind(&f.path)
    .bind(&f.content_hash)
    .bind(f.size)
    .bind(f.modified_at)
    .bind(f.indexed_at)
    .bind(f.component_count)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn row_to_file(row: &SqliteRow) -> FileRecord {
    FileRecord {
        path: row.get("path"),
        content_hash: row.get("content_hash"),
        size: row.get("size"),
        modified_at: row.get("modified_at"),
        indexed_at: row.get("indexed_at"),
        component_count: row.get("component_count"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::models::{ComponentType, RelationshipType, SourceSpan};
    use crate::repository::{ComponentRepository, RelationshipRepository};

    fn component(id: &str, file: &str) -> Component {
        Component {
            id: id.into(),
            name: id.into(),
            component_type: ComponentType::Function,
            language: "rust".into(),
            file_path: file.into(),
            span: SourceSpan::lines(1, 2),
            code_snippet: None,
            metadata: serde_json::json!({}),
        }
    }

    fn record(path: &str, count: i64) -> FileRecord {
        FileRecord {
            path: path.into(),
            content_hash: "h".into(),
            size: 1,
            modified_at: 0,
            indexed_at: 0,
            component_count: count,
        }
    }

    #[tokio::test]
    async fn test_replace_preserves_cross_file_edges() {
        let tmp = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(
            StorageCoordinator::initialize(tmp.path(), &DbConfig::default())
                .await
                .unwrap(),
        );
        let files = FileRepository::new(Arc::clone(&storage));
        let components = ComponentRepository::new(Arc::clone(&storage));
        let relationships = RelationshipRepository::new(Arc::clone(&storage));

        files
            .replace_file_graph(record("a.rs", 2), vec![component("a1", "a.rs"), component("a2", "a.rs")], vec![])
            .await
            .unwrap();
        files
            .replace_file_graph(
                record("b.rs", 1),
                vec![component("b1", "b.rs")],
                vec![
                    Relationship::new("b1", "a1", RelationshipType::Calls, 0.8),
                    Relationship::new("b1", "a2", RelationshipType::Calls, 0.8),
                ],
            )
            .await
            .unwrap();

        // a.rs drops a2: the b1→a2 edge goes with it, b1→a1 survives.
        let write = files
            .replace_file_graph(record("a.rs", 1), vec![component("a1", "a.rs")], vec![])
            .await
            .unwrap();
        assert_eq!(write.removed_component_ids, vec!["a2".to_string()]);

        let edges = relationships.by_source("b1").await.unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].target_id, "a1");

        let removed = files.remove_file("b.rs").await.unwrap();
        assert_eq!(removed, vec!["b1".to_string()]);
        assert!(relationships.all().await.unwrap().is_empty());
        assert_eq!(components.count().await.unwrap(), 1);
        assert_eq!(files.count().await.unwrap(), 1);
        assert!(files.get("b.rs").await.unwrap().is_none());
    }
}
