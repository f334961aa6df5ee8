//! Staleness reconciliation.
//!
//! After a full crawl of a family, entities that were not observed become
//! `stale` and stale entities that were observed become `active` again. Only
//! the `status` column (and `updated_at`) is ever touched; history and
//! content stay intact so existing install references keep resolving.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;

use crate::models::{EntityStatus, SourceFamily};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub marked_stale: u64,
    pub reactivated: u64,
}

/// Reconcile `family` against the identity keys seen in a full crawl.
///
/// Callers must only pass the key set of a complete crawl; a partial set
/// would mark live entities stale.
pub async fn reconcile(
    pool: &SqlitePool,
    family: SourceFamily,
    seen: &HashSet<String>,
) -> Result<ReconcileOutcome> {
    let mut tx = pool.begin().await?;

    let rows = sqlx::query("SELECT id, identity_key, status FROM entities WHERE family = ?")
        .bind(family.as_str())
        .fetch_all(&mut *tx)
        .await?;

    let now = Utc::now().timestamp();
    let mut outcome = ReconcileOutcome::default();

    for row in rows {
        let id: String = row.get("id");
        let key: String = row.get("identity_key");
        let status: EntityStatus = row.get::<String, _>("status").parse()?;

        let target = match (status, seen.contains(&key)) {
            (EntityStatus::Active, false) => EntityStatus::Stale,
            (EntityStatus::Stale, true) => EntityStatus::Active,
            _ => continue,
        };

        sqlx::query("UPDATE entities SET status = ?, updated_at = ? WHERE id = ?")
            .bind(target.as_str())
            .bind(now)
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        match target {
            EntityStatus::Stale => outcome.marked_stale += 1,
            EntityStatus::Active => outcome.reactivated += 1,
        }
    }

    tx.commit().await?;

    if outcome.marked_stale > 0 || outcome.reactivated > 0 {
        tracing::info!(
            family = %family,
            marked_stale = outcome.marked_stale,
            reactivated = outcome.reactivated,
            "reconciled entity status"
        );
    }

    Ok(outcome)
}
