//! Idempotent schema setup for the two stores.
//!
//! Each `migrate_*` function can run on every open. [`reset_code_store`]
//! drops the code-graph tables and recreates them, which is how
//! `clear_index` wipes the graph without touching tasks, notes, or rules.

use anyhow::Result;
use sqlx::SqlitePool;

/// Shared by both stores: one vector per (kind, id), overwritten in place.
const EMBEDDINGS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS embeddings (
        entity_kind TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        model TEXT NOT NULL,
        dims INTEGER NOT NULL,
        content_hash TEXT NOT NULL,
        embedding BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (entity_kind, entity_id)
    )
"#;

pub async fn migrate_code_store(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS components (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            component_type TEXT NOT NULL,
            language TEXT NOT NULL,
            file_path TEXT NOT NULL,
            start_line INTEGER NOT NULL DEFAULT 0,
            start_column INTEGER NOT NULL DEFAULT 0,
            end_line INTEGER NOT NULL DEFAULT 0,
            end_column INTEGER NOT NULL DEFAULT 0,
            code_snippet TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // file_path records which file's parse produced the edge, so re-indexing
    // that file replaces exactly its own edges.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS relationships (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            relationship_type TEXT NOT NULL,
            confidence REAL NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            detectors_json TEXT NOT NULL DEFAULT '[]',
            detection_count INTEGER NOT NULL DEFAULT 1,
            inferred INTEGER NOT NULL DEFAULT 0,
            file_path TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            path TEXT PRIMARY KEY,
            content_hash TEXT NOT NULL,
            size INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            indexed_at INTEGER NOT NULL,
            component_count INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(EMBEDDINGS_TABLE).execute(pool).await?;

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_components_file_path ON components(file_path)",
        "CREATE INDEX IF NOT EXISTS idx_components_name ON components(name)",
        "CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships(source_id)",
        "CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target_id)",
        "CREATE INDEX IF NOT EXISTS idx_relationships_file_path ON relationships(file_path)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}

pub async fn migrate_meta_store(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'todo',
            priority TEXT,
            parent_id TEXT,
            tags_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS notes (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            parent_id TEXT,
            tags_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rules (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            guidance TEXT NOT NULL DEFAULT '',
            code_template TEXT,
            trigger_patterns_json TEXT NOT NULL DEFAULT '[]',
            parent_id TEXT,
            tags_json TEXT NOT NULL DEFAULT '[]',
            applied_count INTEGER NOT NULL DEFAULT 0,
            accepted_count INTEGER NOT NULL DEFAULT 0,
            last_applied_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entity_links (
            owner_kind TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            target_kind TEXT NOT NULL,
            target_id TEXT NOT NULL,
            PRIMARY KEY (owner_kind, owner_id, target_kind, target_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tags (
            name TEXT PRIMARY KEY,
            weight REAL NOT NULL DEFAULT 1.0,
            usage_count INTEGER NOT NULL DEFAULT 0,
            last_used_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(EMBEDDINGS_TABLE).execute(pool).await?;

    for stmt in [
        "CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id)",
        "CREATE INDEX IF NOT EXISTS idx_notes_parent ON notes(parent_id)",
        "CREATE INDEX IF NOT EXISTS idx_rules_parent ON rules(parent_id)",
        "CREATE INDEX IF NOT EXISTS idx_entity_links_target ON entity_links(target_kind, target_id)",
    ] {
        sqlx::query(stmt).execute(pool).await?;
    }

    Ok(())
}

/// Drop and recreate every code-graph table.
pub async fn reset_code_store(pool: &SqlitePool) -> Result<()> {
    let mut tx = pool.begin().await?;
    for table in ["relationships", "components", "files", "embeddings"] {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    migrate_code_store(pool).await
}
