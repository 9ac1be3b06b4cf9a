//! Entity links and tags shared by the task, note and rule repositories.
//!
//! Links are typed references (kind + id) from a metadata entity to any
//! other entity. They are not foreign keys: the target may not exist.

use anyhow::Result;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::models::{now_ts, EntityKind, EntityLink};

/// Replace every link owned by `(owner_kind, owner_id)`.
pub(crate) async fn replace_links(
    tx: &mut Transaction<'_, Sqlite>,
    owner_kind: EntityKind,
    owner_id: &str,
    links: &[EntityLink],
) -> Result<()> {
    sqlx::query("DELETE FROM entity_links WHERE owner_kind = ? AND owner_id = ?")
        .bind(owner_kind.as_str())
        .bind(owner_id)
        .execute(&mut **tx)
        .await?;
    for link in links {
        sqlx::query(
            "INSERT OR IGNORE INTO entity_links (owner_kind, owner_id, target_kind, target_id) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(owner_kind.as_str())
        .bind(owner_id)
        .bind(link.kind.as_str())
        .bind(&link.id)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Delete links owned by the entity and links pointing at it.
pub(crate) async fn delete_links(
    tx: &mut Transaction<'_, Sqlite>,
    kind: EntityKind,
    id: &str,
) -> Result<()> {
    sqlx::query(
        "DELETE FROM entity_links WHERE (owner_kind = ?1 AND owner_id = ?2) \
         OR (target_kind = ?1 AND target_id = ?2)",
    )
    .bind(kind.as_str())
    .bind(id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub(crate) async fn load_links(
    pool: &SqlitePool,
    owner_kind: EntityKind,
    owner_id: &str,
) -> Result<Vec<EntityLink>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT target_kind, target_id FROM entity_links \
         WHERE owner_kind = ? AND owner_id = ? ORDER BY target_kind, target_id",
    )
    .bind(owner_kind.as_str())
    .bind(owner_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(kind, id)| kind.parse().ok().map(|kind| EntityLink::new(kind, id)))
        .collect())
}

/// Ids of `owner_kind` entities that link to `(target_kind, target_id)`.
pub(crate) async fn owners_linking_to(
    pool: &SqlitePool,
    owner_kind: EntityKind,
    target_kind: EntityKind,
    target_id: &str,
) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar(
        "SELECT owner_id FROM entity_links \
         WHERE owner_kind = ? AND target_kind = ? AND target_id = ? ORDER BY owner_id",
    )
    .bind(owner_kind.as_str())
    .bind(target_kind.as_str())
    .bind(target_id)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Record a use of each tag: create it at full weight or restore its
/// weight and bump its usage count.
pub(crate) async fn touch_tags(tx: &mut Transaction<'_, Sqlite>, tags: &[String]) -> Result<()> {
    let now = now_ts();
    for tag in tags {
        let name = normalize_tag(tag);
        if name.is_empty() {
            continue;
        }
        sqlx::query(
            r#"
            INSERT INTO tags (name, weight, usage_count, last_used_at, created_at)
            VALUES (?, 1.0, 1, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                weight = 1.0,
                usage_count = tags.usage_count + 1,
                last_used_at = excluded.last_used_at
            "#,
        )
        .bind(&name)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

pub(crate) fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut out: Vec<String> = tags
        .iter()
        .map(|t| normalize_tag(t))
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_tags_dedups() {
        let tags = vec!["Auth".to_string(), " auth ".into(), "".into(), "db".into()];
        assert_eq!(normalize_tags(&tags), vec!["auth".to_string(), "db".to_string()]);
    }
}
