//! Durable run records and the run lock.
//!
//! The lock is not an in-process flag: it is the unfinished row in
//! `index_runs`, guarded by a partial unique index on
//! `pipeline WHERE finished_at IS NULL`. Two triggers racing from different
//! processes both try to insert; exactly one wins. A run that never
//! finalizes (process killed mid-run) is reaped as abandoned once it is
//! older than `stale_run_after_secs`, so a crash cannot wedge a pipeline.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

use crate::error::TriggerError;
use crate::models::{IndexRunRecord, Pipeline, Stage, StageReport, TriggerSource};
use crate::traits::PreviousState;

/// Acquire the run lock for `pipeline` by creating its run record.
pub async fn begin_run(
    pool: &SqlitePool,
    pipeline: Pipeline,
    trigger: TriggerSource,
    started_at: DateTime<Utc>,
    stale_after: Duration,
) -> Result<String, TriggerError> {
    let now = started_at.timestamp();
    let cutoff = now - i64::try_from(stale_after.as_secs()).unwrap_or(i64::MAX);

    let reaped = sqlx::query(
        r#"
        UPDATE index_runs SET finished_at = ?, success = 0, abandoned = 1
        WHERE pipeline = ? AND finished_at IS NULL AND started_at <= ?
        "#,
    )
    .bind(now)
    .bind(pipeline.as_str())
    .bind(cutoff)
    .execute(pool)
    .await
    .context("Failed to reap abandoned runs")?;

    if reaped.rows_affected() > 0 {
        tracing::warn!(
            pipeline = %pipeline,
            count = reaped.rows_affected(),
            "released lock held by abandoned run"
        );
    }

    let run_id = Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        "INSERT INTO index_runs (id, pipeline, trigger_source, started_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&run_id)
    .bind(pipeline.as_str())
    .bind(trigger.as_str())
    .bind(now)
    .execute(pool)
    .await;

    match inserted {
        Ok(_) => Ok(run_id),
        Err(e) if is_lock_held(&e) => {
            let holder = in_flight(pool, pipeline).await?;
            let (run_id, started_at) = holder
                .map(|r| (r.run_id, r.started_at))
                .unwrap_or_else(|| ("unknown".to_string(), now));
            Err(TriggerError::RunAlreadyInProgress {
                pipeline: pipeline.as_str().to_string(),
                run_id,
                started_at,
            })
        }
        Err(e) => Err(TriggerError::Infrastructure(
            anyhow::Error::new(e).context("Failed to create run record"),
        )),
    }
}

/// Whether a failed run insert means another run of the pipeline holds the
/// lock. Only the partial unique index says so; a busy store is an
/// infrastructure failure and is retried as one.
fn is_lock_held(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Persist stage results of a run that is still in progress.
pub async fn record_progress(pool: &SqlitePool, run_id: &str, stages: &[StageReport]) -> Result<()> {
    sqlx::query("UPDATE index_runs SET stages_json = ? WHERE id = ? AND finished_at IS NULL")
        .bind(serde_json::to_string(stages)?)
        .bind(run_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Finalize a run and release its lock.
///
/// A run that was already reaped as abandoned keeps its original
/// `finished_at` but still gets its stage results.
pub async fn finish_run(
    pool: &SqlitePool,
    run_id: &str,
    finished_at: DateTime<Utc>,
    success: bool,
    stages: &[StageReport],
) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE index_runs
        SET finished_at = COALESCE(finished_at, ?), success = ?, stages_json = ?
        WHERE id = ?
        "#,
    )
    .bind(finished_at.timestamp())
    .bind(success)
    .bind(serde_json::to_string(stages)?)
    .bind(run_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        anyhow::bail!("run record {} disappeared before finalization", run_id);
    }
    Ok(())
}

const RUN_COLUMNS: &str =
    "id, pipeline, trigger_source, started_at, finished_at, success, abandoned, stages_json";

fn run_from_row(row: &SqliteRow) -> Result<IndexRunRecord> {
    let pipeline: String = row.try_get("pipeline")?;
    let trigger: String = row.try_get("trigger_source")?;
    let success: Option<i64> = row.try_get("success")?;
    let abandoned: i64 = row.try_get("abandoned")?;
    let stages_json: String = row.try_get("stages_json")?;

    Ok(IndexRunRecord {
        run_id: row.try_get("id")?,
        pipeline: pipeline.parse()?,
        trigger: trigger.parse()?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        success: success.map(|s| s != 0),
        abandoned: abandoned != 0,
        stages: serde_json::from_str(&stages_json).context("corrupt stages_json column")?,
    })
}

/// The unfinished run currently holding the lock of `pipeline`, if any.
pub async fn in_flight(pool: &SqlitePool, pipeline: Pipeline) -> Result<Option<IndexRunRecord>> {
    let sql = format!(
        "SELECT {} FROM index_runs WHERE pipeline = ? AND finished_at IS NULL",
        RUN_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(pipeline.as_str())
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(run_from_row).transpose()
}

pub async fn get_run(pool: &SqlitePool, run_id: &str) -> Result<Option<IndexRunRecord>> {
    let sql = format!("SELECT {} FROM index_runs WHERE id = ?", RUN_COLUMNS);
    let row = sqlx::query(&sql).bind(run_id).fetch_optional(pool).await?;
    row.as_ref().map(run_from_row).transpose()
}

/// Most recent runs first.
pub async fn recent_runs(pool: &SqlitePool, limit: i64) -> Result<Vec<IndexRunRecord>> {
    let sql = format!(
        "SELECT {} FROM index_runs ORDER BY started_at DESC, rowid DESC LIMIT ?",
        RUN_COLUMNS
    );
    let rows = sqlx::query(&sql).bind(limit).fetch_all(pool).await?;
    rows.iter().map(run_from_row).collect()
}

pub async fn load_checkpoint(pool: &SqlitePool, stage: Stage) -> Result<Option<PreviousState>> {
    let row = sqlx::query("SELECT last_success_at, items FROM stage_checkpoints WHERE stage = ?")
        .bind(stage.as_str())
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(|row| {
        let ts: i64 = row.get("last_success_at");
        let items: i64 = row.get("items");
        Utc.timestamp_opt(ts, 0).single().map(|at| PreviousState {
            last_success_at: at,
            items: u64::try_from(items).unwrap_or(0),
        })
    }))
}

pub async fn save_checkpoint(
    pool: &SqlitePool,
    stage: Stage,
    at: DateTime<Utc>,
    items: u64,
) -> Result<()> {
    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO stage_checkpoints (stage, last_success_at, items, updated_at) VALUES (?, ?, ?, ?)
        ON CONFLICT(stage) DO UPDATE SET
            last_success_at = excluded.last_success_at,
            items = excluded.items,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(stage.as_str())
    .bind(at.timestamp())
    .bind(i64::try_from(items).unwrap_or(i64::MAX))
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::is_conflict;
    use sqlx::sqlite::SqliteConnectOptions;
    use sqlx::{ConnectOptions, SqliteConnection};
    use tempfile::TempDir;

    async fn open(path: &std::path::Path) -> SqliteConnection {
        SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .busy_timeout(Duration::ZERO)
            .connect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn only_unique_violations_mean_the_lock_is_held() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("lock.sqlite");
        let mut writer = open(&path).await;
        let mut other = open(&path).await;

        sqlx::query("CREATE TABLE t (name TEXT NOT NULL UNIQUE)")
            .execute(&mut writer)
            .await
            .unwrap();
        sqlx::query("INSERT INTO t (name) VALUES ('a')")
            .execute(&mut writer)
            .await
            .unwrap();

        let duplicate = sqlx::query("INSERT INTO t (name) VALUES ('a')")
            .execute(&mut writer)
            .await
            .unwrap_err();
        assert!(is_lock_held(&duplicate));

        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut writer)
            .await
            .unwrap();
        let busy = sqlx::query("INSERT INTO t (name) VALUES ('b')")
            .execute(&mut other)
            .await
            .unwrap_err();
        assert!(is_conflict(&busy));
        assert!(!is_lock_held(&busy));

        sqlx::query("ROLLBACK").execute(&mut writer).await.unwrap();
    }
}
