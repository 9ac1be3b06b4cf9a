//! Vector storage. Component vectors live in the code store; task, note
//! and rule vectors live in the meta store. One row per (kind, id).

use anyhow::Result;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;

use super::queued;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{EmbeddingRecord, EntityKind};
use crate::storage::StorageCoordinator;

#[derive(Clone)]
pub struct EmbeddingRepository {
    storage: Arc<StorageCoordinator>,
}

impl EmbeddingRepository {
    pub fn new(storage: Arc<StorageCoordinator>) -> Self {
        Self { storage }
    }

    /// Write a vector, overwriting any previous one for the same entity.
    /// Returns the stored version, or `None` when the entity no longer
    /// exists and nothing was written.
    pub async fn upsert(&self, record: EmbeddingRecord) -> Result<Option<i64>> {
        let store = self.storage.store(record.entity_kind.store());
        let sql = format!(
            r#"
            INSERT INTO embeddings (entity_kind, entity_id, version, model, dims,
                content_hash, embedding, created_at)
            SELECT ?, ?, 1, ?, ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM {} WHERE id = ?)
            ON CONFLICT(entity_kind, entity_id) DO UPDATE SET
                version = embeddings.version + 1,
                model = excluded.model,
                dims = excluded.dims,
                content_hash = excluded.content_hash,
                embedding = excluded.embedding,
                created_at = excluded.created_at
            "#,
            record.entity_kind.table()
        );
        queued(
            store
                .run_write(move |pool| async move {
                    let mut tx = pool.begin().await?;
                    let written = sqlx::query(&sql)
                        .bind(record.entity_kind.as_str())
                        .bind(&record.entity_id)
                        .bind(&record.model)
                        .bind(record.dims as i64)
                        .bind(&record.content_hash)
                        .bind(vec_to_blob(&record.vector))
                        .bind(record.created_at)
                        .bind(&record.entity_id)
                        .execute(&mut *tx)
                        .await?
                        .rows_affected();
                    if written == 0 {
                        tx.rollback().await?;
                        return Ok(None);
                    }
                    let version: i64 = sqlx::query_scalar(
                        "SELECT version FROM embeddings WHERE entity_kind = ? AND entity_id = ?",
                    )
                    .bind(record.entity_kind.as_str())
                    .bind(&record.entity_id)
                    .fetch_one(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    Ok(Some(version))
                })
                .await,
        )
    }

    pub async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EmbeddingRecord>> {
        let row = sqlx::query(
            "SELECT entity_id, version, model, dims, content_hash, embedding, created_at \
             FROM embeddings WHERE entity_kind = ? AND entity_id = ?",
        )
        .bind(kind.as_str())
        .bind(id)
        .fetch_optional(self.storage.store(kind.store()).pool())
        .await?;

        Ok(row.map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            EmbeddingRecord {
                entity_id: row.get("entity_id"),
                entity_kind: kind,
                version: row.get("version"),
                model: row.get("model"),
                dims: row.get::<i64, _>("dims") as usize,
                content_hash: row.get("content_hash"),
                vector: blob_to_vec(&blob),
                created_at: row.get("created_at"),
            }
        }))
    }

    /// Every stored vector of `kind`, as `(entity_id, vector)`.
    pub async fn vectors(&self, kind: EntityKind) -> Result<Vec<(String, Vec<f32>)>> {
        let rows = sqlx::query(
            "SELECT entity_id, embedding FROM embeddings WHERE entity_kind = ? ORDER BY entity_id",
        )
        .bind(kind.as_str())
        .fetch_all(self.storage.store(kind.store()).pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                (row.get("entity_id"), blob_to_vec(&blob))
            })
            .collect())
    }

    /// `entity_id → content_hash` for every stored vector of `kind`.
    pub async fn content_hashes(&self, kind: EntityKind) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT entity_id, content_hash FROM embeddings WHERE entity_kind = ?",
        )
        .bind(kind.as_str())
        .fetch_all(self.storage.store(kind.store()).pool())
        .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn count(&self, kind: EntityKind) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE entity_kind = ?")
            .bind(kind.as_str())
            .fetch_one(self.storage.store(kind.store()).pool())
            .await?;
        Ok(n)
    }

    pub async fn delete(&self, kind: EntityKind, id: &str) -> Result<bool> {
        let id = id.to_string();
        queued(
            self.storage
                .store(kind.store())
                .run_write(move |pool| async move {
                    let result =
                        sqlx::query("DELETE FROM embeddings WHERE entity_kind = ? AND entity_id = ?")
                            .bind(kind.as_str())
                            .bind(&id)
                            .execute(&pool)
                            .await?;
                    Ok(result.rows_affected() > 0)
                })
                .await,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;
    use crate::models::now_ts;

    fn record(kind: EntityKind, id: &str, vector: Vec<f32>, hash: &str) -> EmbeddingRecord {
        EmbeddingRecord {
            entity_id: id.into(),
            entity_kind: kind,
            version: 0,
            model: "test".into(),
            dims: vector.len(),
            content_hash: hash.into(),
            vector,
            created_at: now_ts(),
        }
    }

    async fn insert_note(storage: &StorageCoordinator, id: &str) {
        sqlx::query("INSERT INTO notes (id, title, created_at, updated_at) VALUES (?, 'n', 0, 0)")
            .bind(id)
            .execute(storage.meta().pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_overwrite_bumps_version_and_routes_by_kind() {
        let tmp = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(
            StorageCoordinator::initialize(tmp.path(), &DbConfig::default())
                .await
                .unwrap(),
        );
        insert_note(&storage, "note_1").await;
        sqlx::query(
            "INSERT INTO components (id, name, component_type, language, file_path, updated_at) \
             VALUES ('c1', 'C', 'class', 'rust', 'c.rs', 0)",
        )
        .execute(storage.code().pool())
        .await
        .unwrap();
        let repo = EmbeddingRepository::new(Arc::clone(&storage));

        assert_eq!(repo.upsert(record(EntityKind::Note, "note_1", vec![1.0, 0.0], "a")).await.unwrap(), Some(1));
        assert_eq!(repo.upsert(record(EntityKind::Note, "note_1", vec![0.0, 1.0], "b")).await.unwrap(), Some(2));
        repo.upsert(record(EntityKind::Component, "c1", vec![0.5, 0.5], "c"))
            .await
            .unwrap();

        let stored = repo.get(EntityKind::Note, "note_1").await.unwrap().unwrap();
        assert_eq!(stored.vector, vec![0.0, 1.0]);
        assert_eq!(stored.content_hash, "b");
        assert_eq!(repo.count(EntityKind::Note).await.unwrap(), 1);
        assert_eq!(repo.count(EntityKind::Component).await.unwrap(), 1);

        // Component vectors are in the code store only.
        let in_meta: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE entity_kind = 'component'")
            .fetch_one(storage.meta().pool())
            .await
            .unwrap();
        assert_eq!(in_meta, 0);

        assert_eq!(
            repo.content_hashes(EntityKind::Note).await.unwrap().get("note_1"),
            Some(&"b".to_string())
        );
        assert!(repo.delete(EntityKind::Note, "note_1").await.unwrap());
        assert!(repo.vectors(EntityKind::Note).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_skips_missing_entity() {
        let tmp = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(
            StorageCoordinator::initialize(tmp.path(), &DbConfig::default())
                .await
                .unwrap(),
        );
        let repo = EmbeddingRepository::new(Arc::clone(&storage));

        let written = repo
            .upsert(record(EntityKind::Note, "note_gone", vec![1.0], "a"))
            .await
            .unwrap();
        assert_eq!(written, None);
        assert_eq!(repo.count(EntityKind::Note).await.unwrap(), 0);

        // A rule with the same id does not count as the note.
        sqlx::query("INSERT INTO rules (id, name, created_at, updated_at) VALUES ('note_gone', 'r', 0, 0)")
            .execute(storage.meta().pool())
            .await
            .unwrap();
        assert_eq!(
            repo.upsert(record(EntityKind::Note, "note_gone", vec![1.0], "a")).await.unwrap(),
            None
        );
    }
}
