//! Popularity history read from `stat_snapshots`.
//!
//! Each run that observes an entity leaves exactly one snapshot, so the
//! last N snapshots are the last N observations.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::models::StatSnapshot;

/// The `limit` most recent snapshots of an entity, oldest first.
pub async fn recent_snapshots(
    pool: &SqlitePool,
    entity_id: &str,
    limit: i64,
) -> Result<Vec<StatSnapshot>> {
    let rows = sqlx::query(
        r#"
        SELECT entity_id, run_id, plugin_count, skill_count, stars, recorded_at
        FROM stat_snapshots
        WHERE entity_id = ?
        ORDER BY recorded_at DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(entity_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut snapshots: Vec<StatSnapshot> = rows
        .iter()
        .map(|row| StatSnapshot {
            entity_id: row.get("entity_id"),
            run_id: row.get("run_id"),
            plugin_count: row.get("plugin_count"),
            skill_count: row.get("skill_count"),
            stars: row.get("stars"),
            recorded_at: row.get("recorded_at"),
        })
        .collect();
    snapshots.reverse();
    Ok(snapshots)
}

/// Change between the first and last of a series of observations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trend {
    pub observations: usize,
    pub from: i64,
    pub to: i64,
    pub stars: i64,
    pub plugin_count: i64,
    pub skill_count: i64,
}

/// `None` when there are fewer than two observations.
pub fn trend(snapshots: &[StatSnapshot]) -> Option<Trend> {
    let (first, last) = match snapshots {
        [first, .., last] => (first, last),
        _ => return None,
    };
    Some(Trend {
        observations: snapshots.len(),
        from: first.recorded_at,
        to: last.recorded_at,
        stars: last.stars - first.stars,
        plugin_count: last.plugin_count - first.plugin_count,
        skill_count: last.skill_count - first.skill_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(at: i64, stars: i64, plugins: i64) -> StatSnapshot {
        StatSnapshot {
            entity_id: "e".into(),
            run_id: format!("r{}", at),
            plugin_count: plugins,
            skill_count: 0,
            stars,
            recorded_at: at,
        }
    }

    #[test]
    fn trend_needs_two_points() {
        assert_eq!(trend(&[]), None);
        assert_eq!(trend(&[snap(1, 5, 1)]), None);
    }

    #[test]
    fn trend_is_last_minus_first() {
        let t = trend(&[snap(10, 5, 2), snap(20, 3, 2), snap(30, 12, 4)]).unwrap();
        assert_eq!(t.observations, 3);
        assert_eq!(t.from, 10);
        assert_eq!(t.to, 30);
        assert_eq!(t.stars, 7);
        assert_eq!(t.plugin_count, 2);
        assert_eq!(t.skill_count, 0);
    }
}
