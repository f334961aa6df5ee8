use anyhow::Result;

use crate::config::{Config, ConnectorConfig};
use crate::models::Stage;

/// Print the connector configured for every stage and whether it looks usable.
pub fn list_sources(config: &Config) -> Result<()> {
    println!("{:<14} {:<6} {:<40} HEALTHY", "STAGE", "KIND", "TARGET");

    for stage in Stage::ALL {
        let (kind, target, healthy) = match config.connectors.for_stage(stage) {
            Some(ConnectorConfig::File(file)) => (
                "file",
                file.path.display().to_string(),
                file.path.exists(),
            ),
            Some(ConnectorConfig::Http(http)) => {
                // Reachability is only known at run time.
                let token_ok = http
                    .token_env
                    .as_ref()
                    .map(|var| std::env::var(var).is_ok())
                    .unwrap_or(true);
                ("http", http.url.clone(), token_ok)
            }
            None => ("-", "NOT CONFIGURED".to_string(), false),
        };
        println!("{:<14} {:<6} {:<40} {}", stage.as_str(), kind, target, healthy);
    }

    Ok(())
}
