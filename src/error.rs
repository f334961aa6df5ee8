//! Error taxonomy for the indexing pipeline.
//!
//! Errors fall into two tiers. [`TriggerError`] is what an admission path
//! sees: either the run was rejected before any work started, or the
//! coordinator itself failed. Everything below that ([`ConnectorError`],
//! [`RecordError`], [`UpsertError`]) is captured into a stage report and
//! never surfaces to the trigger, so no retry wrapper can ever replay it.

use thiserror::Error;

/// Bearer-token admission failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthRejected {
    /// The endpoint requires a secret but none is configured (fail closed).
    #[error("admin token is not configured")]
    Unconfigured,
    #[error("missing bearer token")]
    Missing,
    #[error("invalid bearer token")]
    Mismatch,
}

/// Stage-level connector failure.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The upstream could not be reached at all. The stage is recorded as
    /// failed with nothing indexed and the run moves on.
    #[error("connector unavailable: {0}")]
    Unavailable(String),
}

/// A single record that could not be turned into a stored entity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record has no external id, namespace, or name")]
    MissingIdentity,
}

/// Failure of a single upsert.
#[derive(Debug, Error)]
pub enum UpsertError {
    #[error(transparent)]
    Record(#[from] RecordError),
    /// Another writer touched the same identity key; retry this record only.
    #[error("persistence conflict on {key}: {message}")]
    PersistenceConflict { key: String, message: String },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl UpsertError {
    /// Classify a database error raised while writing `key`.
    pub fn from_db(key: &str, err: sqlx::Error) -> Self {
        if is_conflict(&err) {
            UpsertError::PersistenceConflict {
                key: key.to_string(),
                message: err.to_string(),
            }
        } else {
            UpsertError::Store(err.into())
        }
    }
}

/// Returns `true` for unique violations and SQLite busy/locked errors.
pub fn is_conflict(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() {
                return true;
            }
            // SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
            db.code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| matches!(code & 0xff, 5 | 6))
                .unwrap_or(false)
        }
        _ => false,
    }
}

/// Admission-level failure of [`RunCoordinator::trigger`](crate::coordinator::RunCoordinator::trigger).
#[derive(Debug, Error)]
pub enum TriggerError {
    /// An unfinished run of the same pipeline holds the lock. Never queued.
    #[error("run {run_id} of pipeline '{pipeline}' is already in progress (started at {started_at})")]
    RunAlreadyInProgress {
        pipeline: String,
        run_id: String,
        started_at: i64,
    },
    /// The coordinator itself failed (store unreachable, finalization failed).
    /// The only tier the scheduled-task retry wrapper retries.
    #[error("indexing infrastructure failure: {0:#}")]
    Infrastructure(#[from] anyhow::Error),
}

impl TriggerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TriggerError::Infrastructure(_))
    }
}
