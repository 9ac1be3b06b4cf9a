use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use super::{json_value, queued, string_list, to_json};
use crate::models::{Relationship, RelationshipType};
use crate::storage::StorageCoordinator;

const COLUMNS: &str = "id, source_id, target_id, relationship_type, confidence, metadata_json, \
                       detectors_json, detection_count, inferred";

#[derive(Clone)]
pub struct RelationshipRepository {
    storage: Arc<StorageCoordinator>,
}

impl RelationshipRepository {
    pub fn new(storage: Arc<StorageCoordinator>) -> Self {
        Self { storage }
    }

    fn pool(&self) -> &SqlitePool {
        self.storage.code().pool()
    }

    pub async fn by_source(&self, source_id: &str) -> Result<Vec<Relationship>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM relationships WHERE source_id = ? ORDER BY id",
            COLUMNS
        ))
        .bind(source_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().filter_map(row_to_relationship).collect())
    }

    pub async fn by_target(&self, target_id: &str) -> Result<Vec<Relationship>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM relationships WHERE target_id = ? ORDER BY id",
            COLUMNS
        ))
        .bind(target_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().filter_map(row_to_relationship).collect())
    }

    pub async fn all(&self) -> Result<Vec<Relationship>> {
        let rows = sqlx::query(&format!("SELECT {} FROM relationships ORDER BY id", COLUMNS))
            .fetch_all(self.pool())
            .await?;
        Ok(rows.iter().filter_map(row_to_relationship).collect())
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM relationships")
            .fetch_one(self.pool())
            .await?;
        Ok(n)
    }

    /// Write one edge, attributing it to `file_path`.
    pub async fn upsert(&self, relationship: Relationship, file_path: &str) -> Result<()> {
        let file_path = file_path.to_string();
        queued(
            self.storage
                .code()
                .run_write(move |pool| async move {
                    let mut tx = pool.begin().await?;
                    upsert_relationship(&mut tx, &relationship, &file_path).await?;
                    tx.commit().await?;
                    Ok(())
                })
                .await,
        )
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        queued(
            self.storage
                .code()
                .run_write(move |pool| async move {
                    let result = sqlx::query("DELETE FROM relationships WHERE id = ?")
                        .bind(&id)
                        .execute(&pool)
                        .await?;
                    Ok(result.rows_affected() > 0)
                })
                .await,
        )
    }
}

/// Insert an edge, or merge into an existing one with the same id by
/// keeping the higher confidence. Ownership (`file_path`) stays with the
/// first writer.
pub(crate) async fn upsert_relationship(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    r: &Relationship,
    file_path: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO relationships (id, source_id, target_id, relationship_type, confidence,
            metadata_json, detectors_json, detection_count, inferred, file_path)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            confidence = MAX(relationships.confidence, excluded.confidence),
            metadata_json = excluded.metadata_json,
            detectors_json = excluded.detectors_json,
            detection_count = excluded.detection_count,
            inferred = MIN(relationships.inferred, excluded.inferred)
        "#,
    )
    .bind(&r.id)
    .bind(&r.source_id)
    .bind(&r.target_id)
    .bind(r.relationship_type.as_str())
    .bind(r.confidence)
    .bind(to_json(&r.metadata)?)
    .bind(to_json(&r.detectors)?)
    .bind(r.detection_count as i64)
    .bind(r.inferred as i64)
    .bind(file_path)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Rows with an unrecognized type are skipped rather than failing the read.
fn row_to_relationship(row: &SqliteRow) -> Option<Relationship> {
    let ty: String = row.get("relationship_type");
    let relationship_type = RelationshipType::parse(&ty)?;
    let metadata: String = row.get("metadata_json");
    let detectors: String = row.get("detectors_json");
    Some(Relationship {
        id: row.get("id"),
        source_id: row.get("source_id"),
        target_id: row.get("target_id"),
        relationship_type,
        confidence: row.get("confidence"),
        metadata: json_value(&metadata),
        detectors: string_list(&detectors),
        detection_count: row.get::<i64, _>("detection_count") as u32,
        inferred: row.get::<i64, _>("inferred") != 0,
    })
}
