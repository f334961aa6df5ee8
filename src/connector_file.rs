//! JSON file connector.
//!
//! Reads records from a single JSON file or from every JSON file under a
//! directory (filtered by include/exclude globs). Each file holds either an
//! array of records or an object with an `items` array. Useful for mirrored
//! registry dumps and for local development.

use anyhow::Result;
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::FileConnectorConfig;
use crate::error::ConnectorError;
use crate::models::RawRecord;
use crate::traits::{Connector, IndexResult, PreviousState};

pub struct FileConnector {
    name: String,
    config: FileConnectorConfig,
}

impl FileConnector {
    pub fn new(name: String, config: FileConnectorConfig) -> Self {
        Self { name, config }
    }
}

#[async_trait]
impl Connector for FileConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Records from local JSON files"
    }

    async fn run(&self, _previous: Option<&PreviousState>) -> Result<IndexResult, ConnectorError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || scan_files(&config))
            .await
            .map_err(|e| ConnectorError::Unavailable(format!("file scan task failed: {}", e)))?
    }
}

/// Scan the configured path and decode every record found.
pub fn scan_files(config: &FileConnectorConfig) -> Result<IndexResult, ConnectorError> {
    let root = &config.path;
    if !root.exists() {
        return Err(ConnectorError::Unavailable(format!(
            "path does not exist: {}",
            root.display()
        )));
    }

    let files = if root.is_file() {
        vec![root.clone()]
    } else {
        list_files(root, config)
            .map_err(|e| ConnectorError::Unavailable(format!("{}: {:#}", root.display(), e)))?
    };

    let mut result = IndexResult::complete(Vec::new(), Vec::new());
    for path in files {
        // An unreadable file loses all of its records, so the listing is no
        // longer complete. The other files still contribute.
        match read_file(&path) {
            Ok(elements) => decode_elements(elements, &path.display().to_string(), &mut result),
            Err(message) => {
                result.source_errors.push(message);
                result.complete = false;
            }
        }
    }
    Ok(result)
}

fn list_files(root: &Path, config: &FileConnectorConfig) -> Result<Vec<PathBuf>> {
    let include_set = build_globset(&config.include_globs)?;
    let exclude_set = build_globset(&config.exclude_globs)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        files.push(path.to_path_buf());
    }

    // Sort for deterministic ordering
    files.sort();
    Ok(files)
}

/// Load the record elements of one file.
fn read_file(path: &Path) -> Result<Vec<Value>, String> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;

    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(Value::Object(mut obj)) => match obj.remove("items") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(format!(
                "{}: expected an array or an object with `items`",
                path.display()
            )),
        },
        Ok(_) => Err(format!(
            "{}: expected an array or an object with `items`",
            path.display()
        )),
        Err(e) => Err(format!("{}: invalid JSON: {}", path.display(), e)),
    }
}

/// Decode JSON elements into records, collecting per-element failures.
pub(crate) fn decode_elements(elements: Vec<Value>, origin: &str, result: &mut IndexResult) {
    for (index, element) in elements.into_iter().enumerate() {
        match serde_json::from_value::<RawRecord>(element) {
            Ok(record) => result.items.push(record),
            Err(e) => result
                .source_errors
                .push(format!("{}[{}]: {}", origin, index, e)),
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
