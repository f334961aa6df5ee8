//! Read access to stored catalog entities.
//!
//! Writes belong to [`upsert`](crate::upsert) (content) and
//! [`reconcile`](crate::reconcile) (status); this module only maps rows.

use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use crate::models::{EntityStatus, SourceEntity, SourceFamily};

pub(crate) const ENTITY_COLUMNS: &str = "id, family, identity_key, external_id, namespace, name, \
    description, categories_json, badges_json, repository_url, source_connector, parent_id, \
    stars, installs, downloads, plugin_count, skill_count, verified, status, content_hash, \
    first_indexed_at, last_indexed_at, created_at, updated_at";

/// A stored entity together with its content hash.
#[derive(Debug, Clone)]
pub(crate) struct StoredEntity {
    pub entity: SourceEntity,
    pub content_hash: String,
}

pub(crate) fn stored_from_row(row: &SqliteRow) -> Result<StoredEntity> {
    let family: String = row.try_get("family")?;
    let status: String = row.try_get("status")?;
    let categories_json: String = row.try_get("categories_json")?;
    let badges_json: String = row.try_get("badges_json")?;
    let verified: i64 = row.try_get("verified")?;

    let entity = SourceEntity {
        id: row.try_get("id")?,
        family: family.parse()?,
        identity_key: row.try_get("identity_key")?,
        external_id: row.try_get("external_id")?,
        namespace: row.try_get("namespace")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        categories: serde_json::from_str(&categories_json)
            .context("corrupt categories_json column")?,
        badges: serde_json::from_str(&badges_json).context("corrupt badges_json column")?,
        repository_url: row.try_get("repository_url")?,
        source_connector: row.try_get("source_connector")?,
        parent_id: row.try_get("parent_id")?,
        stars: row.try_get("stars")?,
        installs: row.try_get("installs")?,
        downloads: row.try_get("downloads")?,
        plugin_count: row.try_get("plugin_count")?,
        skill_count: row.try_get("skill_count")?,
        verified: verified != 0,
        status: status.parse()?,
        first_indexed_at: row.try_get("first_indexed_at")?,
        last_indexed_at: row.try_get("last_indexed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    };

    Ok(StoredEntity {
        entity,
        content_hash: row.try_get("content_hash")?,
    })
}

/// Fetch the first row of an entity query, if any.
pub(crate) async fn fetch_stored<'q>(
    conn: &mut SqliteConnection,
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
) -> Result<Option<StoredEntity>, sqlx::Error> {
    let row = query.fetch_optional(&mut *conn).await?;
    match row {
        Some(row) => stored_from_row(&row)
            .map(Some)
            .map_err(|e| sqlx::Error::Decode(e.into())),
        None => Ok(None),
    }
}

pub async fn get_entity(pool: &SqlitePool, id: &str) -> Result<Option<SourceEntity>> {
    let sql = format!("SELECT {} FROM entities WHERE id = ?", ENTITY_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    row.map(|r| stored_from_row(&r).map(|s| s.entity))
        .transpose()
}

pub async fn find_by_identity(
    pool: &SqlitePool,
    family: SourceFamily,
    identity_key: &str,
) -> Result<Option<SourceEntity>> {
    let sql = format!(
        "SELECT {} FROM entities WHERE family = ? AND identity_key = ?",
        ENTITY_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(family.as_str())
        .bind(identity_key)
        .fetch_optional(pool)
        .await?;
    row.map(|r| stored_from_row(&r).map(|s| s.entity))
        .transpose()
}

/// All entities of a family, optionally filtered by status, oldest first.
pub async fn list_entities(
    pool: &SqlitePool,
    family: SourceFamily,
    status: Option<EntityStatus>,
) -> Result<Vec<SourceEntity>> {
    let sql = format!(
        "SELECT {} FROM entities WHERE family = ? AND (? IS NULL OR status = ?) ORDER BY first_indexed_at, id",
        ENTITY_COLUMNS
    );
    let status = status.map(|s| s.as_str());
    let rows = sqlx::query(&sql)
        .bind(family.as_str())
        .bind(status)
        .bind(status)
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|r| stored_from_row(r).map(|s| s.entity))
        .collect()
}
