use anyhow::{Context, Result};
use chrono::Weekday;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{Pipeline, Stage};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// Names of the environment variables holding the bearer secrets.
#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default = "default_admin_token_env")]
    pub admin_token_env: String,
    #[serde(default = "default_cron_secret_env")]
    pub cron_secret_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_token_env: default_admin_token_env(),
            cron_secret_env: default_cron_secret_env(),
        }
    }
}

fn default_admin_token_env() -> String {
    "ADMIN_API_TOKEN".to_string()
}
fn default_cron_secret_env() -> String {
    "CRON_SECRET".to_string()
}

/// Secrets resolved from the environment at startup.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub admin_token: Option<String>,
    pub cron_secret: Option<String>,
}

impl Secrets {
    pub fn from_env(auth: &AuthConfig) -> Self {
        Self {
            admin_token: read_secret(&auth.admin_token_env),
            cron_secret: read_secret(&auth.cron_secret_env),
        }
    }
}

fn read_secret(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Hard wall-clock budget for a whole run.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    /// Unfinished runs older than this are treated as abandoned.
    #[serde(default = "default_stale_run_after_secs")]
    pub stale_run_after_secs: u64,
    #[serde(default = "default_max_upsert_attempts")]
    pub max_upsert_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            run_timeout_secs: default_run_timeout_secs(),
            stale_run_after_secs: default_stale_run_after_secs(),
            max_upsert_attempts: default_max_upsert_attempts(),
        }
    }
}

impl PipelineConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

fn default_run_timeout_secs() -> u64 {
    900
}
fn default_stale_run_after_secs() -> u64 {
    3600
}
fn default_max_upsert_attempts() -> u32 {
    3
}

/// Weekly cadence and retry policy of the scheduled trigger.
///
/// Weekday keys are lower-case English day names; missing days fall back to
/// the built-in cadence.
#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub days: HashMap<String, Pipeline>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            days: HashMap::new(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    1000
}
fn default_max_backoff_ms() -> u64 {
    10_000
}

/// One connector per stage, keyed by stage name.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    pub marketplaces: Option<ConnectorConfig>,
    #[serde(rename = "mcp-servers")]
    pub mcp_servers: Option<ConnectorConfig>,
    pub plugins: Option<ConnectorConfig>,
    #[serde(rename = "mcp-stats")]
    pub mcp_stats: Option<ConnectorConfig>,
}

impl ConnectorsConfig {
    pub fn for_stage(&self, stage: Stage) -> Option<&ConnectorConfig> {
        match stage {
            Stage::Marketplaces => self.marketplaces.as_ref(),
            Stage::McpServers => self.mcp_servers.as_ref(),
            Stage::Plugins => self.plugins.as_ref(),
            Stage::McpStats => self.mcp_stats.as_ref(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConnectorConfig {
    File(FileConnectorConfig),
    Http(HttpConnectorConfig),
}

#[derive(Debug, Deserialize, Clone)]
pub struct FileConnectorConfig {
    /// A JSON file, or a directory walked for JSON files.
    pub path: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.json".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConnectorConfig {
    pub url: String,
    /// Environment variable holding a bearer token for the upstream.
    #[serde(default)]
    pub token_env: Option<String>,
    /// Query parameter used to request only records changed since the last
    /// successful crawl. Such crawls are incomplete and never reconcile.
    #[serde(default)]
    pub since_param: Option<String>,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_http_timeout_secs() -> u64 {
    30
}

pub fn parse_weekday(name: &str) -> Result<Weekday> {
    name.parse::<Weekday>()
        .map_err(|_| anyhow::anyhow!("Unknown weekday in [schedule.days]: '{}'", name))
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.pipeline.run_timeout_secs == 0 {
        anyhow::bail!("pipeline.run_timeout_secs must be > 0");
    }

    if config.pipeline.stale_run_after_secs < config.pipeline.run_timeout_secs {
        anyhow::bail!("pipeline.stale_run_after_secs must be >= pipeline.run_timeout_secs");
    }

    if config.pipeline.max_upsert_attempts == 0 {
        anyhow::bail!("pipeline.max_upsert_attempts must be >= 1");
    }

    if config.schedule.max_attempts == 0 {
        anyhow::bail!("schedule.max_attempts must be >= 1");
    }

    for day in config.schedule.days.keys() {
        parse_weekday(day)?;
    }

    for stage in Stage::ALL {
        if let Some(ConnectorConfig::Http(http)) = config.connectors.for_stage(stage) {
            if !http.url.starts_with("http://") && !http.url.starts_with("https://") {
                anyhow::bail!(
                    "connectors.{}.url must be an http(s) URL, got '{}'",
                    stage,
                    http.url
                );
            }
        }
    }

    Ok(())
}
