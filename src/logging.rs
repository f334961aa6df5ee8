//! Tracing subscriber setup for the `pidx` binary.
//!
//! Log lines go to stderr so that command output on stdout stays
//! machine-readable (`pidx run all | jq`).

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "info,plugin_index=debug";

/// Initialize the global subscriber.
///
/// `level` takes any `EnvFilter` directive (`debug`, `plugin_index=trace`).
/// Without it `RUST_LOG` is used, then [`DEFAULT_FILTER`].
pub fn init(level: Option<&str>) -> Result<()> {
    let env_filter = match level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
