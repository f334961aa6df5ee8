//! Scheduled weekly trigger.
//!
//! Each weekday maps to one pipeline. The default cadence gives every
//! source family two days a week and leaves Sunday for the stats sync:
//!
//! | Day | Pipeline |
//! |-----|----------|
//! | Mon, Thu | `marketplaces` |
//! | Tue, Fri | `mcp-servers` |
//! | Wed, Sat | `plugins` |
//! | Sun | `mcp-stats` |
//!
//! `[schedule.days]` overrides individual days. The scheduled path is the
//! only one that retries, and it retries only the coordinator call.

use chrono::{DateTime, Datelike, Utc, Weekday};
use serde::Serialize;

use crate::config::{parse_weekday, ScheduleConfig};
use crate::coordinator::RunCoordinator;
use crate::error::TriggerError;
use crate::models::{Pipeline, RunReport, TriggerSource};
use crate::trigger::{retry_with_backoff, RetryPolicy};

/// Built-in weekday cadence.
pub fn default_pipeline_for(day: Weekday) -> Pipeline {
    match day {
        Weekday::Mon | Weekday::Thu => Pipeline::Marketplaces,
        Weekday::Tue | Weekday::Fri => Pipeline::McpServers,
        Weekday::Wed | Weekday::Sat => Pipeline::Plugins,
        Weekday::Sun => Pipeline::McpStats,
    }
}

/// Pipeline to run on the (UTC) weekday of `at`.
pub fn pipeline_for(config: &ScheduleConfig, at: DateTime<Utc>) -> Pipeline {
    let day = at.weekday();
    config
        .days
        .iter()
        .find(|(name, _)| parse_weekday(name).map(|d| d == day).unwrap_or(false))
        .map(|(_, pipeline)| *pipeline)
        .unwrap_or_else(|| default_pipeline_for(day))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledReport {
    pub scheduled_at: DateTime<Utc>,
    pub pipeline: Pipeline,
    pub attempts: u32,
    pub report: RunReport,
}

/// Run the pipeline scheduled for `at`, retrying infrastructure failures.
pub async fn run_scheduled(
    coordinator: &RunCoordinator,
    config: &ScheduleConfig,
    at: DateTime<Utc>,
) -> Result<ScheduledReport, TriggerError> {
    let pipeline = pipeline_for(config, at);
    let policy = RetryPolicy::from(config);

    tracing::info!(pipeline = %pipeline, scheduled_at = %at.to_rfc3339(), "scheduled run");

    let retried = retry_with_backoff(policy, |attempt| {
        tracing::debug!(pipeline = %pipeline, attempt, "invoking coordinator");
        coordinator.trigger(pipeline, TriggerSource::Scheduled)
    })
    .await;

    let report = retried.result?;
    Ok(ScheduledReport {
        scheduled_at: at,
        pipeline,
        attempts: retried.attempts,
        report,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn on(day: u32) -> DateTime<Utc> {
        // 2026-03-02 is a Monday.
        Utc.with_ymd_and_hms(2026, 3, day, 6, 0, 0).unwrap()
    }

    #[test]
    fn default_cadence_covers_each_family_twice() {
        let config = ScheduleConfig::default();
        let week: Vec<Pipeline> = (2..=8).map(|d| pipeline_for(&config, on(d))).collect();
        assert_eq!(
            week,
            vec![
                Pipeline::Marketplaces,
                Pipeline::McpServers,
                Pipeline::Plugins,
                Pipeline::Marketplaces,
                Pipeline::McpServers,
                Pipeline::Plugins,
                Pipeline::McpStats,
            ]
        );
    }

    #[test]
    fn configured_days_override_defaults() {
        let mut config = ScheduleConfig::default();
        config.days.insert("sunday".into(), Pipeline::All);
        config.days.insert("Mon".into(), Pipeline::Plugins);
        assert_eq!(pipeline_for(&config, on(8)), Pipeline::All);
        assert_eq!(pipeline_for(&config, on(2)), Pipeline::Plugins);
        assert_eq!(pipeline_for(&config, on(3)), Pipeline::McpServers);
    }
}
