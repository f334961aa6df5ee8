//! Run coordinator.
//!
//! Serializes one logical pipeline run: acquires the durable run lock,
//! executes the pipeline's stages in dependency order, isolates every stage
//! from the others, and finalizes the run record.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──begin_run──▶ Running ──(all stages)──▶ Finalizing ──finish_run──▶ Idle
//!                      │
//!                      ├─ Registries   marketplaces, mcp-servers
//!                      ├─ Dependents   plugins
//!                      └─ StatsSync    mcp-stats
//! ```
//!
//! A second trigger while a run of the same pipeline is unfinished is
//! rejected with [`TriggerError::RunAlreadyInProgress`] before anything is
//! written. Within a run, each stage runs on its own task under a time
//! budget (its fair share of what is left of the run budget). A stage that
//! times out, panics, or whose connector is unavailable is recorded as fatal
//! and the next stage still runs.
//!
//! The run itself is a spawned task as well. A caller that stops waiting
//! (an HTTP client hanging up, a timed-out cron request) does not cancel
//! it, so the run still finalizes and releases its lock within the budget.

use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::PipelineConfig;
use crate::error::{TriggerError, UpsertError};
use crate::models::{Pipeline, RawRecord, RunReport, Stage, StageReport, TriggerSource};
use crate::reconcile::reconcile;
use crate::runs;
use crate::traits::{Connector, ConnectorRegistry, PreviousState};
use crate::upsert::{self, ApplyContext, Applied, UpsertOutcome};

#[derive(Clone)]
pub struct RunCoordinator {
    pool: SqlitePool,
    connectors: ConnectorRegistry,
    settings: PipelineConfig,
}

impl RunCoordinator {
    pub fn new(pool: SqlitePool, connectors: ConnectorRegistry, settings: PipelineConfig) -> Self {
        Self {
            pool,
            connectors,
            settings,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn connectors(&self) -> &ConnectorRegistry {
        &self.connectors
    }

    /// Run `pipeline` end to end on behalf of `trigger`.
    ///
    /// Stage failures never surface here; they are in the returned report.
    /// Errors are limited to the lock being held and to failures of the
    /// coordinator's own bookkeeping. Dropping the returned future detaches
    /// the run instead of cancelling it.
    pub async fn trigger(
        &self,
        pipeline: Pipeline,
        trigger: TriggerSource,
    ) -> Result<RunReport, TriggerError> {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.execute_run(pipeline, trigger).await })
            .await
            .map_err(|e| {
                TriggerError::Infrastructure(anyhow::anyhow!(
                    "run task of pipeline '{}' failed: {}",
                    pipeline,
                    e
                ))
            })?
    }

    async fn execute_run(
        &self,
        pipeline: Pipeline,
        trigger: TriggerSource,
    ) -> Result<RunReport, TriggerError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let stale_after = Duration::from_secs(self.settings.stale_run_after_secs);

        let run_id = match runs::begin_run(&self.pool, pipeline, trigger, started_at, stale_after)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(pipeline = %pipeline, trigger = trigger.as_str(), "run rejected: {}", e);
                return Err(e);
            }
        };

        tracing::info!(run = %run_id, pipeline = %pipeline, trigger = trigger.as_str(), "run started");

        let deadline = clock + self.settings.run_timeout();
        let stages = pipeline.stages();
        let mut reports: Vec<StageReport> = Vec::with_capacity(stages.len());

        for (i, &stage) in stages.iter().enumerate() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let budget = remaining / u32::try_from(stages.len() - i).unwrap_or(1);

            let report = self.run_stage(stage, &run_id, started_at, budget).await;
            tracing::info!(
                run = %run_id,
                stage = %stage,
                indexed = report.indexed,
                created = report.created,
                updated = report.updated,
                failed = report.failed,
                skipped = report.skipped,
                marked_stale = report.marked_stale,
                fatal = report.fatal,
                duration_ms = report.duration_ms,
                "stage finished"
            );
            reports.push(report);

            if let Err(e) = runs::record_progress(&self.pool, &run_id, &reports).await {
                tracing::warn!(run = %run_id, "failed to record stage progress: {:#}", e);
            }
        }

        let success = reports.iter().all(|r| !r.fatal);
        let finished_at = Utc::now();

        if let Err(e) = runs::finish_run(&self.pool, &run_id, finished_at, success, &reports).await {
            // The lock stays held until the stale-run timeout reaps it.
            tracing::error!(run = %run_id, "failed to finalize run: {:#}", e);
            return Err(TriggerError::Infrastructure(
                e.context(format!("Failed to finalize run {}", run_id)),
            ));
        }

        let report = RunReport {
            run_id,
            pipeline,
            trigger,
            started_at,
            finished_at,
            duration_ms: elapsed_ms(clock),
            success,
            stages: reports,
        };

        tracing::info!(
            run = %report.run_id,
            success = report.success,
            indexed = report.indexed(),
            failed = report.failed(),
            duration_ms = report.duration_ms,
            "run finished"
        );

        Ok(report)
    }

    async fn run_stage(
        &self,
        stage: Stage,
        run_id: &str,
        started_at: chrono::DateTime<Utc>,
        budget: Duration,
    ) -> StageReport {
        let clock = Instant::now();

        let Some(connector) = self.connectors.get(stage) else {
            return StageReport::fatal(stage, "connector unavailable: no connector configured", 0);
        };

        let previous = match runs::load_checkpoint(&self.pool, stage).await {
            Ok(previous) => previous,
            Err(e) => {
                tracing::warn!(stage = %stage, "failed to load stage checkpoint: {:#}", e);
                None
            }
        };

        let ctx = ApplyContext {
            run_id: run_id.to_string(),
            started_at,
            connector: connector.name().to_string(),
        };
        let pool = self.pool.clone();
        let attempts = self.settings.max_upsert_attempts;

        let mut handle = tokio::spawn(execute_stage(pool, connector, stage, ctx, previous, attempts));

        match tokio::time::timeout(budget, &mut handle).await {
            Ok(Ok(mut report)) => {
                report.duration_ms = elapsed_ms(clock);
                report
            }
            Ok(Err(join_err)) => {
                let what = if join_err.is_panic() { "panicked" } else { "was cancelled" };
                StageReport::fatal(stage, format!("stage task {}", what), elapsed_ms(clock))
            }
            Err(_) => {
                handle.abort();
                StageReport::fatal(
                    stage,
                    format!("stage exceeded its time budget of {}ms", budget.as_millis()),
                    elapsed_ms(clock),
                )
            }
        }
    }
}

/// Connector invocation, upserts, and reconciliation for one stage.
async fn execute_stage(
    pool: SqlitePool,
    connector: Arc<dyn Connector>,
    stage: Stage,
    ctx: ApplyContext,
    previous: Option<PreviousState>,
    attempts: u32,
) -> StageReport {
    let mut report = StageReport::new(stage);

    let result = match connector.run(previous.as_ref()).await {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(stage = %stage, connector = connector.name(), "{}", e);
            report.fatal = true;
            report.errors.push(e.to_string());
            return report;
        }
    };

    for err in &result.source_errors {
        report.failed += 1;
        report.errors.push(err.clone());
    }

    let mut seen: HashSet<String> = HashSet::new();
    for record in &result.items {
        match apply_with_retry(&pool, &ctx, stage, record, attempts).await {
            Ok(applied) => {
                if let Some(key) = &applied.identity_key {
                    seen.insert(key.clone());
                }
                count_outcome(&mut report, &applied);
            }
            Err(e) => {
                tracing::warn!(stage = %stage, record = %record.label(), "record failed: {}", e);
                report.failed += 1;
                report.errors.push(format!("{}: {}", record.label(), e));
            }
        }
    }

    // Only a clean, complete listing defines which entities still exist.
    let full_crawl = result.complete && report.failed == 0 && !seen.is_empty();
    if stage.reconciles() {
        if full_crawl {
            match reconcile(&pool, stage.family(), &seen).await {
                Ok(outcome) => {
                    report.marked_stale = outcome.marked_stale;
                    report.reactivated = outcome.reactivated;
                }
                Err(e) => report.errors.push(format!("staleness reconciliation failed: {:#}", e)),
            }
        } else {
            tracing::debug!(stage = %stage, "partial crawl, skipping staleness reconciliation");
        }
    }

    // A failed record must be fetched again by the next incremental crawl.
    if report.failed == 0 {
        let fetched = u64::try_from(result.items.len()).unwrap_or(u64::MAX);
        if let Err(e) = runs::save_checkpoint(&pool, stage, ctx.started_at, fetched).await {
            tracing::warn!(stage = %stage, "failed to save stage checkpoint: {:#}", e);
        }
    } else {
        tracing::debug!(stage = %stage, failed = report.failed, "checkpoint kept at previous crawl");
    }

    report
}

/// Apply a record, retrying only that record on persistence conflicts.
async fn apply_with_retry(
    pool: &SqlitePool,
    ctx: &ApplyContext,
    stage: Stage,
    record: &RawRecord,
    attempts: u32,
) -> Result<Applied, UpsertError> {
    let mut attempt = 1;
    loop {
        match upsert::apply(pool, ctx, stage, record).await {
            Err(UpsertError::PersistenceConflict { key, message }) if attempt < attempts => {
                tracing::debug!(%key, attempt, "persistence conflict, retrying: {}", message);
                tokio::time::sleep(Duration::from_millis(25 * u64::from(attempt))).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

fn count_outcome(report: &mut StageReport, applied: &Applied) {
    match &applied.outcome {
        UpsertOutcome::Created => {
            report.created += 1;
            report.indexed += 1;
        }
        UpsertOutcome::Updated => {
            report.updated += 1;
            report.indexed += 1;
        }
        UpsertOutcome::Unchanged => {
            report.unchanged += 1;
            report.indexed += 1;
        }
        UpsertOutcome::Skipped(reason) => {
            tracing::debug!(stage = %report.stage, "skipped: {}", reason);
            report.skipped += 1;
        }
    }
}

fn elapsed_ms(clock: Instant) -> u64 {
    u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX)
}
