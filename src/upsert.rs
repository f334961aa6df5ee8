//! Upsert/dedup engine.
//!
//! Resolves each fetched record to a stored entity by its identity key,
//! decides insert vs update, and appends one immutable stat snapshot per
//! entity per run. Each [`apply`] is a single transaction, so two records
//! resolving to the same key can never produce two rows: the
//! `UNIQUE(family, identity_key)` constraint turns a lost race into a
//! [`UpsertError::PersistenceConflict`] that the caller retries for that
//! record alone.
//!
//! # Field normalization
//!
//! Counts are clamped to non-negative integers. Missing or malformed
//! upstream values fall back to the entity's last known value so a transient
//! upstream glitch does not show up as a drop to zero in trend history.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::entities::{fetch_stored, StoredEntity, ENTITY_COLUMNS};
use crate::error::UpsertError;
use crate::identity::{normalize, KeyRank, RecordKeys};
use crate::models::{RawRecord, SourceFamily, Stage};

/// Per-run context shared by every apply call in a stage.
#[derive(Debug, Clone)]
pub struct ApplyContext {
    pub run_id: String,
    /// Snapshots are timestamped at the run's start.
    pub started_at: DateTime<Utc>,
    /// Name of the connector that produced the records (provenance).
    pub connector: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
    /// The record depends on an entity that does not exist (yet).
    Skipped(String),
}

#[derive(Debug, Clone)]
pub struct Applied {
    pub outcome: UpsertOutcome,
    pub entity_id: Option<String>,
    pub identity_key: Option<String>,
}

impl Applied {
    fn skipped(reason: String) -> Self {
        Self {
            outcome: UpsertOutcome::Skipped(reason),
            entity_id: None,
            identity_key: None,
        }
    }
}

/// The normalized content of an entity. Its hash decides whether a write is
/// needed.
#[derive(Debug, Clone, PartialEq, Serialize)]
struct EntityFields {
    external_id: Option<String>,
    namespace: Option<String>,
    name: String,
    description: Option<String>,
    categories: Vec<String>,
    badges: Vec<String>,
    repository_url: Option<String>,
    source_connector: String,
    parent_id: Option<String>,
    stars: i64,
    installs: i64,
    downloads: i64,
    plugin_count: i64,
    skill_count: i64,
    verified: bool,
}

impl EntityFields {
    fn content_hash(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        format!("{:x}", hasher.finalize())
    }

    fn keys(&self, scope: &str) -> RecordKeys {
        RecordKeys {
            ext: self.external_id.as_deref().and_then(normalize),
            ns: self.namespace.as_deref().and_then(normalize),
            name: normalize(&self.name),
            scope: scope.to_string(),
        }
    }
}

/// Coerce an upstream count to a non-negative integer.
///
/// Accepts integers, finite floats (floored), and numeric strings with
/// thousands separators or a `k`/`m` suffix (`"1,234"`, `"1.2k"`).
/// Missing or malformed values yield `last_known` (0 when there is none).
pub fn coerce_count(raw: Option<&Value>, last_known: Option<i64>) -> i64 {
    let fallback = last_known.unwrap_or(0).max(0);
    let parsed = match raw {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|u| i64::try_from(u).unwrap_or(i64::MAX)))
            .or_else(|| n.as_f64().and_then(float_to_count)),
        Some(Value::String(s)) => parse_count_str(s),
        Some(_) => None,
    };
    match parsed {
        Some(v) => v.max(0),
        None => {
            if raw.is_some_and(|v| !v.is_null()) {
                tracing::debug!(value = ?raw, fallback, "malformed upstream count, keeping last known value");
            }
            fallback
        }
    }
}

fn float_to_count(f: f64) -> Option<i64> {
    if f.is_finite() {
        Some(f.floor().clamp(i64::MIN as f64, i64::MAX as f64) as i64)
    } else {
        None
    }
}

fn parse_count_str(s: &str) -> Option<i64> {
    let cleaned: String = s
        .trim()
        .chars()
        .filter(|c| *c != ',' && *c != '_' && !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    if cleaned.is_empty() {
        return None;
    }
    let (digits, multiplier) = match cleaned.chars().last() {
        Some('k') => (&cleaned[..cleaned.len() - 1], 1_000.0),
        Some('m') => (&cleaned[..cleaned.len() - 1], 1_000_000.0),
        _ => (cleaned.as_str(), 1.0),
    };
    if let Ok(v) = digits.parse::<i64>() {
        return Some(v.saturating_mul(multiplier as i64));
    }
    digits
        .parse::<f64>()
        .ok()
        .and_then(|f| float_to_count(f * multiplier))
}

/// Apply one record from `stage` to the store.
///
/// Returns a [`UpsertError::Record`] for records that cannot be identified,
/// [`UpsertError::PersistenceConflict`] when a concurrent writer raced on the
/// same key, and [`UpsertError::Store`] for anything else.
pub async fn apply(
    pool: &SqlitePool,
    ctx: &ApplyContext,
    stage: Stage,
    record: &RawRecord,
) -> Result<Applied, UpsertError> {
    let family = stage.family();

    let parent_id = if family == SourceFamily::Plugin {
        let Some(parent_ref) = record.parent.as_deref() else {
            return Ok(Applied::skipped(format!(
                "plugin '{}' names no marketplace",
                record.label()
            )));
        };
        match resolve_parent(pool, parent_ref).await? {
            Some(id) => Some(id),
            None => {
                return Ok(Applied::skipped(format!(
                    "plugin '{}' references unknown marketplace '{}'",
                    record.label(),
                    parent_ref
                )))
            }
        }
    } else {
        None
    };

    let scope = parent_id.clone().unwrap_or_default();
    let keys = RecordKeys::from_record(record, &scope)?;
    let rendered = keys.render();

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| UpsertError::from_db(&rendered, e))?;

    let existing = resolve(&mut *tx, family, &keys)
        .await
        .map_err(|e| UpsertError::from_db(&rendered, e))?;

    let written = if stage == Stage::McpStats {
        let Some(existing) = existing else {
            return Ok(Applied::skipped(format!(
                "usage stats for unknown MCP server '{}'",
                record.label()
            )));
        };
        apply_stats(&mut *tx, ctx, record, existing).await.map(Some)
    } else {
        let fields = merge_fields(ctx, record, existing.as_ref(), parent_id);
        let stored_keys = fields.keys(&scope);
        match existing {
            None => insert(&mut *tx, ctx, family, &stored_keys, &fields).await,
            Some(existing) => update(&mut *tx, ctx, &stored_keys, &fields, existing)
                .await
                .map(Some),
        }
    };

    // `None` means another writer inserted the same key after our lookup;
    // the retry will resolve to their row.
    let applied = written
        .map_err(|e| UpsertError::from_db(&rendered, e))?
        .ok_or_else(|| UpsertError::PersistenceConflict {
            key: rendered.clone(),
            message: "identity key inserted concurrently".to_string(),
        })?;

    tx.commit()
        .await
        .map_err(|e| UpsertError::from_db(&rendered, e))?;

    Ok(applied)
}

/// Find the stored entity for `keys`.
///
/// Tries the rendered primary key first, then the record's namespace and name
/// against entities that were stored under a weaker key. A candidate whose
/// own stronger key disagrees with the record is a different entity. Ties
/// resolve to the oldest entity so resolution is deterministic.
async fn resolve(
    conn: &mut SqliteConnection,
    family: SourceFamily,
    keys: &RecordKeys,
) -> Result<Option<StoredEntity>, sqlx::Error> {
    let exact = format!(
        "SELECT {} FROM entities WHERE family = ? AND identity_key = ?",
        ENTITY_COLUMNS
    );
    let rendered = keys.render();
    if let Some(found) = fetch_stored(
        conn,
        sqlx::query(&exact).bind(family.as_str()).bind(&rendered),
    )
    .await?
    {
        return Ok(Some(found));
    }

    if let Some(ns) = &keys.ns {
        let sql = format!(
            "SELECT {} FROM entities WHERE family = ? AND scope = ? AND ns_key = ? \
             AND (ext_key IS NULL OR ? IS NULL OR ext_key = ?) \
             ORDER BY first_indexed_at, id LIMIT 1",
            ENTITY_COLUMNS
        );
        let query = sqlx::query(&sql)
            .bind(family.as_str())
            .bind(&keys.scope)
            .bind(ns)
            .bind(&keys.ext)
            .bind(&keys.ext);
        if let Some(found) = fetch_stored(conn, query).await? {
            return Ok(Some(found));
        }
    }

    if let Some(name) = &keys.name {
        let sql = format!(
            "SELECT {} FROM entities WHERE family = ? AND scope = ? AND name_key = ? \
             AND (ext_key IS NULL OR ? IS NULL OR ext_key = ?) \
             AND (ns_key IS NULL OR ? IS NULL OR ns_key = ?) \
             ORDER BY first_indexed_at, id LIMIT 1",
            ENTITY_COLUMNS
        );
        let query = sqlx::query(&sql)
            .bind(family.as_str())
            .bind(&keys.scope)
            .bind(name)
            .bind(&keys.ext)
            .bind(&keys.ext)
            .bind(&keys.ns)
            .bind(&keys.ns);
        if let Some(found) = fetch_stored(conn, query).await? {
            return Ok(Some(found));
        }
    }

    Ok(None)
}

/// Resolve a plugin's marketplace reference to the marketplace entity id.
async fn resolve_parent(pool: &SqlitePool, parent_ref: &str) -> Result<Option<String>, UpsertError> {
    let Some(key) = normalize(parent_ref) else {
        return Ok(None);
    };
    let id: Option<String> = sqlx::query_scalar(
        r#"
        SELECT id FROM entities
        WHERE family = ?
          AND (ext_key = ? OR ns_key = ? OR name_key = ?)
        ORDER BY CASE WHEN ext_key = ? THEN 0 WHEN ns_key = ? THEN 1 ELSE 2 END,
                 first_indexed_at, id
        LIMIT 1
        "#,
    )
    .bind(SourceFamily::Marketplace.as_str())
    .bind(&key)
    .bind(&key)
    .bind(&key)
    .bind(&key)
    .bind(&key)
    .fetch_optional(pool)
    .await
    .map_err(|e| UpsertError::from_db(parent_ref, e))?;
    Ok(id)
}

/// Build the normalized field set from a record and the last known state.
///
/// Identity fields never regress: an external id or namespace the entity was
/// already known by is kept when the record omits it.
fn merge_fields(
    ctx: &ApplyContext,
    record: &RawRecord,
    existing: Option<&StoredEntity>,
    parent_id: Option<String>,
) -> EntityFields {
    let last = existing.map(|s| &s.entity);
    let clean = |v: &Option<String>| {
        v.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
    };

    let external_id = clean(&record.external_id).or_else(|| last.and_then(|e| e.external_id.clone()));
    let namespace = clean(&record.namespace).or_else(|| last.and_then(|e| e.namespace.clone()));
    let name = clean(&record.name)
        .or_else(|| last.map(|e| e.name.clone()))
        .or_else(|| namespace.clone())
        .or_else(|| external_id.clone())
        .unwrap_or_default();

    EntityFields {
        external_id,
        namespace,
        name,
        description: clean(&record.description),
        categories: clean_list(&record.categories),
        badges: clean_list(&record.badges),
        repository_url: clean(&record.repository_url),
        source_connector: ctx.connector.clone(),
        parent_id,
        stars: coerce_count(record.stars.as_ref(), last.map(|e| e.stars)),
        installs: coerce_count(record.installs.as_ref(), last.map(|e| e.installs)),
        downloads: coerce_count(record.downloads.as_ref(), last.map(|e| e.downloads)),
        plugin_count: coerce_count(record.plugin_count.as_ref(), last.map(|e| e.plugin_count)),
        skill_count: coerce_count(record.skill_count.as_ref(), last.map(|e| e.skill_count)),
        verified: record
            .verified
            .or_else(|| last.map(|e| e.verified))
            .unwrap_or(false),
    }
}

fn clean_list(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

fn fields_of(stored: &StoredEntity) -> EntityFields {
    let e = &stored.entity;
    EntityFields {
        external_id: e.external_id.clone(),
        namespace: e.namespace.clone(),
        name: e.name.clone(),
        description: e.description.clone(),
        categories: e.categories.clone(),
        badges: e.badges.clone(),
        repository_url: e.repository_url.clone(),
        source_connector: e.source_connector.clone(),
        parent_id: e.parent_id.clone(),
        stars: e.stars,
        installs: e.installs,
        downloads: e.downloads,
        plugin_count: e.plugin_count,
        skill_count: e.skill_count,
        verified: e.verified,
    }
}

async fn insert(
    conn: &mut SqliteConnection,
    ctx: &ApplyContext,
    family: SourceFamily,
    keys: &RecordKeys,
    fields: &EntityFields,
) -> Result<Option<Applied>, sqlx::Error> {
    let id = Uuid::new_v4().to_string();
    let identity_key = keys.render();
    let now = Utc::now().timestamp();

    let result = sqlx::query(
        r#"
        INSERT INTO entities (id, family, identity_key, scope, ext_key, ns_key, name_key,
                              external_id, namespace, name, description, categories_json,
                              badges_json, repository_url, source_connector, parent_id,
                              stars, installs, downloads, plugin_count, skill_count, verified,
                              status, content_hash, first_indexed_at, last_indexed_at,
                              created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?, ?, ?, ?)
        ON CONFLICT(family, identity_key) DO NOTHING
        "#,
    )
    .bind(&id)
    .bind(family.as_str())
    .bind(&identity_key)
    .bind(&keys.scope)
    .bind(&keys.ext)
    .bind(&keys.ns)
    .bind(keys.name.clone().unwrap_or_default())
    .bind(&fields.external_id)
    .bind(&fields.namespace)
    .bind(&fields.name)
    .bind(&fields.description)
    .bind(to_json(&fields.categories))
    .bind(to_json(&fields.badges))
    .bind(&fields.repository_url)
    .bind(&fields.source_connector)
    .bind(&fields.parent_id)
    .bind(fields.stars)
    .bind(fields.installs)
    .bind(fields.downloads)
    .bind(fields.plugin_count)
    .bind(fields.skill_count)
    .bind(fields.verified)
    .bind(fields.content_hash())
    .bind(now)
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }

    append_snapshot(conn, ctx, &id, fields).await?;

    Ok(Some(Applied {
        outcome: UpsertOutcome::Created,
        entity_id: Some(id),
        identity_key: Some(identity_key),
    }))
}

async fn update(
    conn: &mut SqliteConnection,
    ctx: &ApplyContext,
    keys: &RecordKeys,
    fields: &EntityFields,
    existing: StoredEntity,
) -> Result<Applied, sqlx::Error> {
    let hash = fields.content_hash();
    // Never demote a stored key (e.g. when upstream temporarily drops an id).
    let identity_key = if keys.rank() >= KeyRank::of_rendered(&existing.entity.identity_key) {
        keys.render()
    } else {
        existing.entity.identity_key.clone()
    };
    let key_changed = identity_key != existing.entity.identity_key;

    let outcome = if hash != existing.content_hash || key_changed {
        if key_changed {
            tracing::info!(
                entity = %existing.entity.id,
                from = %existing.entity.identity_key,
                to = %identity_key,
                "promoting identity key"
            );
        }
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            UPDATE entities SET
                identity_key = ?, ext_key = ?, ns_key = ?, name_key = ?,
                external_id = ?, namespace = ?, name = ?, description = ?,
                categories_json = ?, badges_json = ?, repository_url = ?,
                source_connector = ?, parent_id = ?,
                stars = ?, installs = ?, downloads = ?, plugin_count = ?, skill_count = ?,
                verified = ?, content_hash = ?, last_indexed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&identity_key)
        .bind(&keys.ext)
        .bind(&keys.ns)
        .bind(keys.name.clone().unwrap_or_default())
        .bind(&fields.external_id)
        .bind(&fields.namespace)
        .bind(&fields.name)
        .bind(&fields.description)
        .bind(to_json(&fields.categories))
        .bind(to_json(&fields.badges))
        .bind(&fields.repository_url)
        .bind(&fields.source_connector)
        .bind(&fields.parent_id)
        .bind(fields.stars)
        .bind(fields.installs)
        .bind(fields.downloads)
        .bind(fields.plugin_count)
        .bind(fields.skill_count)
        .bind(fields.verified)
        .bind(&hash)
        .bind(now)
        .bind(now)
        .bind(&existing.entity.id)
        .execute(&mut *conn)
        .await?;
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Unchanged
    };

    append_snapshot(conn, ctx, &existing.entity.id, fields).await?;

    Ok(Applied {
        outcome,
        entity_id: Some(existing.entity.id),
        identity_key: Some(identity_key),
    })
}

/// Usage-stats records only refresh popularity signals of a known server.
async fn apply_stats(
    conn: &mut SqliteConnection,
    ctx: &ApplyContext,
    record: &RawRecord,
    existing: StoredEntity,
) -> Result<Applied, sqlx::Error> {
    let mut fields = fields_of(&existing);
    fields.stars = coerce_count(record.stars.as_ref(), Some(fields.stars));
    fields.installs = coerce_count(record.installs.as_ref(), Some(fields.installs));
    fields.downloads = coerce_count(record.downloads.as_ref(), Some(fields.downloads));
    let hash = fields.content_hash();

    let outcome = if hash != existing.content_hash {
        sqlx::query(
            "UPDATE entities SET stars = ?, installs = ?, downloads = ?, content_hash = ?, last_indexed_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(fields.stars)
        .bind(fields.installs)
        .bind(fields.downloads)
        .bind(&hash)
        .bind(Utc::now().timestamp())
        .bind(Utc::now().timestamp())
        .bind(&existing.entity.id)
        .execute(&mut *conn)
        .await?;
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Unchanged
    };

    append_snapshot(conn, ctx, &existing.entity.id, &fields).await?;

    Ok(Applied {
        outcome,
        entity_id: Some(existing.entity.id),
        identity_key: Some(existing.entity.identity_key),
    })
}

/// Record the run's snapshot for an entity. A later observation of the same
/// entity within one run (a duplicate record, or the stats sync after the
/// server crawl) refreshes that run's row instead of adding another.
async fn append_snapshot(
    conn: &mut SqliteConnection,
    ctx: &ApplyContext,
    entity_id: &str,
    fields: &EntityFields,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO stat_snapshots (entity_id, run_id, plugin_count, skill_count, stars, recorded_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(entity_id, run_id) DO UPDATE SET
            plugin_count = excluded.plugin_count,
            skill_count = excluded.skill_count,
            stars = excluded.stars
        "#,
    )
    .bind(entity_id)
    .bind(&ctx.run_id)
    .bind(fields.plugin_count)
    .bind(fields.skill_count)
    .bind(fields.stars)
    .bind(ctx.started_at.timestamp())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn to_json(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}
