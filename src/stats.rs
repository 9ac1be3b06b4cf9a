//! Index statistics.
//!
//! Aggregate counts per entity kind, embedding coverage per kind, and a
//! per-component-type breakdown. Used by `chx stats`.

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;
use std::collections::BTreeMap;

use crate::models::{EntityKind, StoreKind};
use crate::storage::StorageCoordinator;

#[derive(Debug, Clone, Default, Serialize)]
pub struct KindStats {
    pub count: i64,
    pub embedded: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub kinds: BTreeMap<EntityKind, KindStats>,
    pub relationships: i64,
    pub files: i64,
    pub component_types: BTreeMap<String, i64>,
    pub last_indexed_at: Option<i64>,
    pub code_store_bytes: u64,
    pub meta_store_bytes: u64,
}

impl IndexStats {
    pub fn count(&self, kind: EntityKind) -> i64 {
        self.kinds.get(&kind).map_or(0, |k| k.count)
    }

    pub fn embedded(&self, kind: EntityKind) -> i64 {
        self.kinds.get(&kind).map_or(0, |k| k.embedded)
    }
}

pub async fn collect_stats(storage: &StorageCoordinator) -> Result<IndexStats> {
    let mut stats = IndexStats::default();

    for kind in EntityKind::ALL {
        let pool = storage.store(kind.store()).pool();
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", kind.table()))
            .fetch_one(pool)
            .await?;
        let embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE entity_kind = ?")
            .bind(kind.as_str())
            .fetch_one(pool)
            .await?;
        stats.kinds.insert(kind, KindStats { count, embedded });
    }

    let code = storage.code().pool();
    stats.relationships = sqlx::query_scalar("SELECT COUNT(*) FROM relationships")
        .fetch_one(code)
        .await?;
    stats.files = sqlx::query_scalar("SELECT COUNT(*) FROM files")
        .fetch_one(code)
        .await?;
    stats.last_indexed_at = sqlx::query_scalar("SELECT MAX(indexed_at) FROM files")
        .fetch_one(code)
        .await?;

    let rows = sqlx::query(
        "SELECT component_type, COUNT(*) AS n FROM components GROUP BY component_type ORDER BY component_type",
    )
    .fetch_all(code)
    .await?;
    for row in &rows {
        stats
            .component_types
            .insert(row.get("component_type"), row.get("n"));
    }

    stats.code_store_bytes = file_size(storage, StoreKind::Code);
    stats.meta_store_bytes = file_size(storage, StoreKind::Meta);
    Ok(stats)
}

fn file_size(storage: &StorageCoordinator, kind: StoreKind) -> u64 {
    std::fs::metadata(storage.store(kind).path())
        .map(|m| m.len())
        .unwrap_or(0)
}

/// Print `stats` as a plain-text report on stdout.
pub fn print_stats(stats: &IndexStats) {
    println!("Code Harness Index Stats");
    println!("========================");
    println!();
    println!(
        "  Stores:      {} code, {} meta",
        format_bytes(stats.code_store_bytes),
        format_bytes(stats.meta_store_bytes)
    );
    println!("  Files:       {}", stats.files);
    println!("  Relations:   {}", stats.relationships);
    println!(
        "  Last index:  {}",
        stats
            .last_indexed_at
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    println!();
    println!("  {:<12} {:>8} {:>10}", "KIND", "COUNT", "EMBEDDED");
    println!("  {}", "-".repeat(32));
    for (kind, k) in &stats.kinds {
        println!("  {:<12} {:>8} {:>10}", kind.as_str(), k.count, k.embedded);
    }

    if !stats.component_types.is_empty() {
        println!();
        println!("  By component type:");
        for (ty, n) in &stats.component_types {
            println!("    {:<14} {:>8}", ty, n);
        }
    }
    println!();
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
