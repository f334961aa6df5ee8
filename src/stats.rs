//! Index status overview.
//!
//! Summarizes what the store holds: entity counts per family and status,
//! snapshot volume, and the latest run of every pipeline. Used by
//! `pidx status` to confirm that scheduled runs are landing.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::models::{IndexRunRecord, Pipeline, SourceFamily};
use crate::runs;

/// Active and stale entity counts for one family.
#[derive(Debug, Clone, Serialize)]
pub struct FamilyCounts {
    pub family: SourceFamily,
    pub active: i64,
    pub stale: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub families: Vec<FamilyCounts>,
    pub snapshots: i64,
    pub runs: i64,
    pub last_runs: Vec<IndexRunRecord>,
}

pub async fn collect_status(pool: &SqlitePool) -> Result<StatusSummary> {
    let rows = sqlx::query(
        r#"
        SELECT family,
               SUM(CASE WHEN status = 'active' THEN 1 ELSE 0 END) AS active,
               SUM(CASE WHEN status = 'stale' THEN 1 ELSE 0 END) AS stale
        FROM entities
        GROUP BY family
        "#,
    )
    .fetch_all(pool)
    .await?;

    let families = SourceFamily::ALL
        .into_iter()
        .map(|family| {
            let row = rows.iter().find(|r| r.get::<String, _>("family") == family.as_str());
            FamilyCounts {
                family,
                active: row.map(|r| r.get("active")).unwrap_or(0),
                stale: row.map(|r| r.get("stale")).unwrap_or(0),
            }
        })
        .collect();

    let snapshots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stat_snapshots")
        .fetch_one(pool)
        .await?;

    let runs_total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_runs")
        .fetch_one(pool)
        .await?;

    // Latest run per pipeline, most recent first.
    let mut last_runs: Vec<IndexRunRecord> = Vec::new();
    for run in runs::recent_runs(pool, 200).await? {
        if !last_runs.iter().any(|r| r.pipeline == run.pipeline) {
            last_runs.push(run);
        }
    }

    Ok(StatusSummary {
        families,
        snapshots,
        runs: runs_total,
        last_runs,
    })
}

/// Run the status command: query the database and print a summary.
pub async fn run_status(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let summary = collect_status(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Plugin Index — Status");
    println!("=====================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!("  Snapshots:   {}", summary.snapshots);
    println!("  Runs:        {}", summary.runs);
    println!();
    println!("  {:<14} {:>8} {:>8}", "FAMILY", "ACTIVE", "STALE");
    println!("  {}", "-".repeat(32));
    for f in &summary.families {
        println!("  {:<14} {:>8} {:>8}", f.family.as_str(), f.active, f.stale);
    }

    println!();
    println!(
        "  {:<14} {:<10} {:<10} {}",
        "PIPELINE", "TRIGGER", "RESULT", "STARTED"
    );
    println!("  {}", "-".repeat(60));
    for pipeline in [
        Pipeline::All,
        Pipeline::Marketplaces,
        Pipeline::McpServers,
        Pipeline::Plugins,
        Pipeline::McpStats,
    ] {
        match summary.last_runs.iter().find(|r| r.pipeline == pipeline) {
            Some(run) => println!(
                "  {:<14} {:<10} {:<10} {}",
                pipeline.as_str(),
                run.trigger.as_str(),
                run_result(run),
                format_ts_relative(run.started_at)
            ),
            None => println!("  {:<14} {:<10} {:<10} never", pipeline.as_str(), "-", "-"),
        }
    }
    println!();

    pool.close().await;
    Ok(())
}

/// One-word outcome of a run for tabular output.
pub fn run_result(run: &IndexRunRecord) -> &'static str {
    match (run.finished_at, run.success, run.abandoned) {
        (None, _, _) => "running",
        (Some(_), _, true) => "abandoned",
        (Some(_), Some(true), _) => "ok",
        (Some(_), _, _) => "failed",
    }
}

/// Format a byte count as a human-readable string.
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

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

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

pub fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn run_result_labels() {
        let mut run = IndexRunRecord {
            run_id: "r".into(),
            pipeline: Pipeline::All,
            trigger: crate::models::TriggerSource::Cli,
            started_at: 0,
            finished_at: None,
            success: None,
            abandoned: false,
            stages: vec![],
        };
        assert_eq!(run_result(&run), "running");
        run.finished_at = Some(10);
        run.success = Some(true);
        assert_eq!(run_result(&run), "ok");
        run.success = Some(false);
        assert_eq!(run_result(&run), "failed");
        run.abandoned = true;
        assert_eq!(run_result(&run), "abandoned");
    }
}
