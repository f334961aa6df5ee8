//! Connector contract and registry.
//!
//! A [`Connector`] is the only thing the coordinator knows about a source:
//! it fetches one source family and hands back an [`IndexResult`]. How it
//! talks to GitHub, Docker Hub or an MCP registry is its own business.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │           ConnectorRegistry              │
//! │  marketplaces │ mcp-servers │ plugins │ mcp-stats
//! │   (file/http/custom Rust, one per stage) │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!        RunCoordinator::trigger() → upsert → reconcile
//! ```
//!
//! # Usage
//!
//! ```rust
//! use plugin_index::config::FileConnectorConfig;
//! use plugin_index::connector_file::FileConnector;
//! use plugin_index::models::Stage;
//! use plugin_index::traits::ConnectorRegistry;
//! use std::sync::Arc;
//!
//! let mut connectors = ConnectorRegistry::new();
//! connectors.register(
//!     Stage::Marketplaces,
//!     Arc::new(FileConnector::new(
//!         "file:marketplaces".into(),
//!         FileConnectorConfig {
//!             path: "./data/marketplaces.json".into(),
//!             include_globs: vec!["**/*.json".into()],
//!             exclude_globs: vec![],
//!         },
//!     )),
//! );
//!
//! assert_eq!(connectors.len(), 1);
//! assert_eq!(connectors.get(Stage::Marketplaces).unwrap().name(), "file:marketplaces");
//! assert!(connectors.get(Stage::Plugins).is_none());
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{Config, ConnectorConfig};
use crate::error::ConnectorError;
use crate::models::{RawRecord, Stage};

/// What a connector knows about the last successful crawl of its stage.
#[derive(Debug, Clone)]
pub struct PreviousState {
    pub last_success_at: DateTime<Utc>,
    /// Number of records the last successful crawl returned.
    pub items: u64,
}

/// Output of one connector invocation.
#[derive(Debug, Clone, Default)]
pub struct IndexResult {
    pub items: Vec<RawRecord>,
    /// Per-item failures (one entry per record that could not be fetched or
    /// decoded). Never aborts the stage.
    pub source_errors: Vec<String>,
    /// `false` when the connector knows `items` is not the full listing
    /// (incremental fetch). Incomplete crawls never reconcile staleness.
    pub complete: bool,
}

impl IndexResult {
    /// A full listing.
    pub fn complete(items: Vec<RawRecord>, source_errors: Vec<String>) -> Self {
        Self {
            items,
            source_errors,
            complete: true,
        }
    }
}

/// A source-specific crawler producing raw records for one data family.
///
/// Implementations must be safe to call repeatedly: no side effects beyond
/// their own network reads. Bad upstream records go into
/// [`IndexResult::source_errors`]; only a wholly unreachable upstream returns
/// [`ConnectorError::Unavailable`].
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use plugin_index::error::ConnectorError;
/// use plugin_index::traits::{Connector, IndexResult, PreviousState};
///
/// pub struct StaticConnector;
///
/// #[async_trait]
/// impl Connector for StaticConnector {
///     fn name(&self) -> &str { "static" }
///     fn description(&self) -> &str { "Returns nothing" }
///
///     async fn run(&self, _previous: Option<&PreviousState>) -> Result<IndexResult, ConnectorError> {
///         Ok(IndexResult::complete(vec![], vec![]))
///     }
/// }
/// ```
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connector instance name, recorded as provenance on every entity.
    fn name(&self) -> &str;

    /// One-line description for `pidx sources`.
    fn description(&self) -> &str;

    /// Fetch the source family.
    async fn run(&self, previous: Option<&PreviousState>) -> Result<IndexResult, ConnectorError>;
}

/// One connector per stage.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<Stage, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self {
            connectors: HashMap::new(),
        }
    }

    /// Create a registry with the file and HTTP connectors declared in
    /// `[connectors.<stage>]`.
    pub fn from_config(config: &Config) -> Self {
        use crate::connector_file::FileConnector;
        use crate::connector_http::HttpConnector;

        let mut registry = Self::new();
        for stage in Stage::ALL {
            let Some(cfg) = config.connectors.for_stage(stage) else {
                continue;
            };
            let connector: Arc<dyn Connector> = match cfg {
                ConnectorConfig::File(file) => {
                    Arc::new(FileConnector::new(format!("file:{}", stage), file.clone()))
                }
                ConnectorConfig::Http(http) => {
                    Arc::new(HttpConnector::new(format!("http:{}", stage), http.clone()))
                }
            };
            registry.register(stage, connector);
        }
        registry
    }

    /// Register (or replace) the connector for a stage.
    pub fn register(&mut self, stage: Stage, connector: Arc<dyn Connector>) {
        self.connectors.insert(stage, connector);
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn Connector>> {
        self.connectors.get(&stage).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }
}
