use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create all tables and indexes. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Catalog entities. `identity_key` is the resolved key (`id:`, `ns:`,
    // `name:`), the *_key columns hold the normalized lookup values.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            family TEXT NOT NULL,
            identity_key TEXT NOT NULL,
            scope TEXT NOT NULL DEFAULT '',
            ext_key TEXT,
            ns_key TEXT,
            name_key TEXT NOT NULL,
            external_id TEXT,
            namespace TEXT,
            name TEXT NOT NULL,
            description TEXT,
            categories_json TEXT NOT NULL DEFAULT '[]',
            badges_json TEXT NOT NULL DEFAULT '[]',
            repository_url TEXT,
            source_connector TEXT NOT NULL,
            parent_id TEXT,
            stars INTEGER NOT NULL DEFAULT 0,
            installs INTEGER NOT NULL DEFAULT 0,
            downloads INTEGER NOT NULL DEFAULT 0,
            plugin_count INTEGER NOT NULL DEFAULT 0,
            skill_count INTEGER NOT NULL DEFAULT 0,
            verified INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'active',
            content_hash TEXT NOT NULL,
            first_indexed_at INTEGER NOT NULL,
            last_indexed_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(family, identity_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only history, one row per entity per run.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stat_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_id TEXT NOT NULL,
            run_id TEXT NOT NULL,
            plugin_count INTEGER NOT NULL,
            skill_count INTEGER NOT NULL,
            stars INTEGER NOT NULL,
            recorded_at INTEGER NOT NULL,
            UNIQUE(entity_id, run_id),
            FOREIGN KEY (entity_id) REFERENCES entities(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_runs (
            id TEXT PRIMARY KEY,
            pipeline TEXT NOT NULL,
            trigger_source TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            success INTEGER,
            abandoned INTEGER NOT NULL DEFAULT 0,
            stages_json TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await?;

    // The run lock: at most one unfinished run per pipeline.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_index_runs_inflight ON index_runs(pipeline) WHERE finished_at IS NULL",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stage_checkpoints (
            stage TEXT PRIMARY KEY,
            last_success_at INTEGER NOT NULL,
            items INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_family_status ON entities(family, status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_ext_key ON entities(family, ext_key)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entities_ns_key ON entities(family, scope, ns_key)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_entities_name_key ON entities(family, scope, name_key)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_snapshots_entity ON stat_snapshots(entity_id, recorded_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_index_runs_started ON index_runs(started_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
