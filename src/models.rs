//! Core data models used throughout the indexer.
//!
//! These types describe the records that flow from connectors into the
//! store, the entities and history rows kept there, and the run records and
//! reports produced by the coordinator.

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// The kind of catalog entity a connector produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFamily {
    Marketplace,
    Plugin,
    McpServer,
}

impl SourceFamily {
    pub const ALL: [SourceFamily; 3] = [
        SourceFamily::Marketplace,
        SourceFamily::Plugin,
        SourceFamily::McpServer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceFamily::Marketplace => "marketplace",
            SourceFamily::Plugin => "plugin",
            SourceFamily::McpServer => "mcp_server",
        }
    }
}

impl fmt::Display for SourceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceFamily {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "marketplace" => Ok(SourceFamily::Marketplace),
            "plugin" => Ok(SourceFamily::Plugin),
            "mcp_server" => Ok(SourceFamily::McpServer),
            other => bail!("Unknown source family: '{}'", other),
        }
    }
}

/// Soft-delete status of a stored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Active,
    Stale,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Active => "active",
            EntityStatus::Stale => "stale",
        }
    }
}

impl FromStr for EntityStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(EntityStatus::Active),
            "stale" => Ok(EntityStatus::Stale),
            other => bail!("Unknown entity status: '{}'", other),
        }
    }
}

/// Raw record produced by a connector before normalization.
///
/// Popularity and count signals are kept as raw JSON so the upsert engine can
/// tell a missing value from a malformed one and coerce accordingly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    #[serde(default, alias = "id")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub badges: Vec<String>,
    #[serde(default, alias = "repository")]
    pub repository_url: Option<String>,
    /// Reference to the owning marketplace (plugins only): its external id,
    /// namespace, or name.
    #[serde(default, alias = "marketplace")]
    pub parent: Option<String>,
    #[serde(default)]
    pub verified: Option<bool>,
    #[serde(default)]
    pub stars: Option<Value>,
    #[serde(default)]
    pub installs: Option<Value>,
    #[serde(default)]
    pub downloads: Option<Value>,
    #[serde(default)]
    pub plugin_count: Option<Value>,
    #[serde(default)]
    pub skill_count: Option<Value>,
}

impl RawRecord {
    /// Best human-readable label for logs and error messages.
    pub fn label(&self) -> String {
        self.name
            .as_deref()
            .or(self.namespace.as_deref())
            .or(self.external_id.as_deref())
            .unwrap_or("<unnamed>")
            .to_string()
    }
}

/// Catalog entity stored in SQLite.
#[derive(Debug, Clone, Serialize)]
pub struct SourceEntity {
    pub id: String,
    pub family: SourceFamily,
    pub identity_key: String,
    pub external_id: Option<String>,
    pub namespace: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub categories: Vec<String>,
    pub badges: Vec<String>,
    pub repository_url: Option<String>,
    pub source_connector: String,
    pub parent_id: Option<String>,
    pub stars: i64,
    pub installs: i64,
    pub downloads: i64,
    pub plugin_count: i64,
    pub skill_count: i64,
    pub verified: bool,
    pub status: EntityStatus,
    pub first_indexed_at: i64,
    pub last_indexed_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Immutable history row, one per entity per run that observed it.
#[derive(Debug, Clone, Serialize)]
pub struct StatSnapshot {
    pub entity_id: String,
    pub run_id: String,
    pub plugin_count: i64,
    pub skill_count: i64,
    pub stars: i64,
    pub recorded_at: i64,
}

/// Ordered group a stage belongs to within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    Registries,
    Dependents,
    StatsSync,
}

/// One connector invocation plus its upsert and reconcile work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "marketplaces")]
    Marketplaces,
    #[serde(rename = "mcp-servers")]
    McpServers,
    #[serde(rename = "plugins")]
    Plugins,
    #[serde(rename = "mcp-stats")]
    McpStats,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Marketplaces,
        Stage::McpServers,
        Stage::Plugins,
        Stage::McpStats,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Marketplaces => "marketplaces",
            Stage::McpServers => "mcp-servers",
            Stage::Plugins => "plugins",
            Stage::McpStats => "mcp-stats",
        }
    }

    /// The entity family whose rows this stage writes.
    pub fn family(&self) -> SourceFamily {
        match self {
            Stage::Marketplaces => SourceFamily::Marketplace,
            Stage::Plugins => SourceFamily::Plugin,
            Stage::McpServers | Stage::McpStats => SourceFamily::McpServer,
        }
    }

    pub fn phase(&self) -> StagePhase {
        match self {
            Stage::Marketplaces | Stage::McpServers => StagePhase::Registries,
            Stage::Plugins => StagePhase::Dependents,
            Stage::McpStats => StagePhase::StatsSync,
        }
    }

    /// Whether a full crawl of this stage defines the live set of its family.
    ///
    /// Stats sync only decorates existing servers, so it never reconciles.
    pub fn reconciles(&self) -> bool {
        !matches!(self, Stage::McpStats)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown stage: '{}'. Available: marketplaces, mcp-servers, plugins, mcp-stats",
                    s
                )
            })
    }
}

/// A named, lockable sequence of stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pipeline {
    #[serde(rename = "all")]
    All,
    #[serde(rename = "marketplaces")]
    Marketplaces,
    #[serde(rename = "mcp-servers")]
    McpServers,
    #[serde(rename = "plugins")]
    Plugins,
    #[serde(rename = "mcp-stats")]
    McpStats,
}

impl Pipeline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pipeline::All => "all",
            Pipeline::Marketplaces => "marketplaces",
            Pipeline::McpServers => "mcp-servers",
            Pipeline::Plugins => "plugins",
            Pipeline::McpStats => "mcp-stats",
        }
    }

    /// Stages in dependency order: registries before dependents, servers
    /// before the stats sync that needs their identities.
    pub fn stages(&self) -> &'static [Stage] {
        match self {
            Pipeline::All => &Stage::ALL,
            Pipeline::Marketplaces => &[Stage::Marketplaces],
            Pipeline::McpServers => &[Stage::McpServers],
            Pipeline::Plugins => &[Stage::Plugins],
            Pipeline::McpStats => &[Stage::McpStats],
        }
    }
}

impl From<Stage> for Pipeline {
    /// The single-stage pipeline running only `stage`.
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Marketplaces => Pipeline::Marketplaces,
            Stage::McpServers => Pipeline::McpServers,
            Stage::Plugins => Pipeline::Plugins,
            Stage::McpStats => Pipeline::McpStats,
        }
    }
}

impl fmt::Display for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pipeline {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Pipeline::All),
            "marketplaces" => Ok(Pipeline::Marketplaces),
            "mcp-servers" => Ok(Pipeline::McpServers),
            "plugins" => Ok(Pipeline::Plugins),
            "mcp-stats" => Ok(Pipeline::McpStats),
            other => bail!(
                "Unknown pipeline: '{}'. Available: all, marketplaces, mcp-servers, plugins, mcp-stats",
                other
            ),
        }
    }
}

/// Which admission path started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Admin,
    Cron,
    Scheduled,
    Cli,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Admin => "admin",
            TriggerSource::Cron => "cron",
            TriggerSource::Scheduled => "scheduled",
            TriggerSource::Cli => "cli",
        }
    }
}

impl FromStr for TriggerSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(TriggerSource::Admin),
            "cron" => Ok(TriggerSource::Cron),
            "scheduled" => Ok(TriggerSource::Scheduled),
            "cli" => Ok(TriggerSource::Cli),
            other => bail!("Unknown trigger source: '{}'", other),
        }
    }
}

/// Aggregated outcome of one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub stage: Stage,
    pub indexed: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
    pub skipped: u64,
    pub marked_stale: u64,
    pub reactivated: u64,
    pub duration_ms: u64,
    /// Connector unavailable, stage timed out, or stage task crashed.
    pub fatal: bool,
    pub errors: Vec<String>,
}

impl StageReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            indexed: 0,
            created: 0,
            updated: 0,
            unchanged: 0,
            failed: 0,
            skipped: 0,
            marked_stale: 0,
            reactivated: 0,
            duration_ms: 0,
            fatal: false,
            errors: Vec::new(),
        }
    }

    /// A stage that did no work because of a stage-level failure.
    pub fn fatal(stage: Stage, message: impl Into<String>, duration_ms: u64) -> Self {
        let mut report = Self::new(stage);
        report.fatal = true;
        report.duration_ms = duration_ms;
        report.errors.push(message.into());
        report
    }
}

/// Aggregated outcome of a whole run, returned to every trigger path.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub pipeline: Pipeline,
    pub trigger: TriggerSource,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub stages: Vec<StageReport>,
}

impl RunReport {
    pub fn indexed(&self) -> u64 {
        self.stages.iter().map(|s| s.indexed).sum()
    }

    pub fn failed(&self) -> u64 {
        self.stages.iter().map(|s| s.failed).sum()
    }

    pub fn skipped(&self) -> u64 {
        self.stages.iter().map(|s| s.skipped).sum()
    }

    /// All stage errors, prefixed with the stage name.
    pub fn errors(&self) -> Vec<String> {
        self.stages
            .iter()
            .flat_map(|s| s.errors.iter().map(move |e| format!("{}: {}", s.stage, e)))
            .collect()
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// Durable record of one pipeline execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRunRecord {
    pub run_id: String,
    pub pipeline: Pipeline,
    pub trigger: TriggerSource,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub success: Option<bool>,
    pub abandoned: bool,
    pub stages: Vec<StageReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_pipeline_runs_stages_in_dependency_order() {
        let phases: Vec<StagePhase> = Pipeline::All.stages().iter().map(|s| s.phase()).collect();
        let mut sorted = phases.clone();
        sorted.sort();
        assert_eq!(phases, sorted);
        assert_eq!(Pipeline::All.stages().len(), 4);
    }

    #[test]
    fn pipeline_names_round_trip() {
        for name in ["all", "marketplaces", "mcp-servers", "plugins", "mcp-stats"] {
            let pipeline: Pipeline = name.parse().unwrap();
            assert_eq!(pipeline.as_str(), name);
        }
        assert!("everything".parse::<Pipeline>().is_err());
    }

    #[test]
    fn raw_record_accepts_camel_case_and_aliases() {
        let record: RawRecord = serde_json::from_value(serde_json::json!({
            "id": "abc",
            "name": "Tools",
            "repository": "https://github.com/acme/tools",
            "pluginCount": 4,
            "stars": "12"
        }))
        .unwrap();
        assert_eq!(record.external_id.as_deref(), Some("abc"));
        assert_eq!(
            record.repository_url.as_deref(),
            Some("https://github.com/acme/tools")
        );
        assert_eq!(record.plugin_count, Some(serde_json::json!(4)));
        assert_eq!(record.stars, Some(serde_json::json!("12")));
    }

    #[test]
    fn run_report_prefixes_errors_with_stage() {
        let mut stage = StageReport::new(Stage::Plugins);
        stage.errors.push("bad record".into());
        let report = RunReport {
            run_id: "r".into(),
            pipeline: Pipeline::Plugins,
            trigger: TriggerSource::Cli,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            duration_ms: 0,
            success: true,
            stages: vec![stage],
        };
        assert_eq!(report.errors(), vec!["plugins: bad record".to_string()]);
    }
}
