use std::time::Duration;

use thiserror::Error;

/// Errors produced by the episode pipeline.
///
/// The taxonomy matters to callers: [`PipelineError::DuplicateEpisode`] means
/// another path already owns the identity and must never be retried, while
/// transient process/network/database faults are retried by the resource
/// governor before they surface here.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("required binary `{0}` was not found")]
    MissingBinary(String),

    #[error("{tool} exited with status {status}: {detail}")]
    ProcessFailed {
        tool: String,
        status: i32,
        detail: String,
    },

    #[error("{tool} did not finish within {timeout:?} and was killed")]
    ProcessTimeout { tool: String, timeout: Duration },

    #[error("invalid media: {0}")]
    InvalidMedia(String),

    #[error("episode not found: {0}")]
    NotFound(String),

    #[error("duplicate episode: {0}")]
    DuplicateEpisode(String),

    #[error("row is being modified concurrently, retry later: {0}")]
    LockUnavailable(String),

    #[error("post-write validation failed after {attempts} attempts: {detail}")]
    ValidationFailed { attempts: u32, detail: String },

    #[error("episode store is not open")]
    StoreClosed,

    #[error("{stage} failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

/// Postgres SQLSTATE codes the store treats as transient.
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";
const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";

impl PipelineError {
    /// Wrap this error with the pipeline stage it escaped from. The cause is
    /// preserved unwrapped underneath so operators can still see the low-level
    /// fault.
    pub fn into_stage(self, stage: &'static str) -> Self {
        match self {
            // Never bury the duplicate signal under a stage wrapper; callers
            // match on it to stop work.
            err @ PipelineError::DuplicateEpisode(_) => err,
            err => PipelineError::Stage {
                stage,
                source: Box::new(err),
            },
        }
    }

    /// Whether the governor's retry policy may re-attempt the operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Io(_)
            | PipelineError::Http(_)
            | PipelineError::ProcessFailed { .. }
            | PipelineError::ProcessTimeout { .. }
            | PipelineError::LockUnavailable(_) => true,
            PipelineError::Database(err) => is_transient_sql_error(err),
            PipelineError::Stage { source, .. } => source.is_retryable(),
            PipelineError::MissingBinary(_)
            | PipelineError::Serialization(_)
            | PipelineError::InvalidMedia(_)
            | PipelineError::NotFound(_)
            | PipelineError::DuplicateEpisode(_)
            | PipelineError::ValidationFailed { .. }
            | PipelineError::StoreClosed
            | PipelineError::Internal(_) => false,
        }
    }

    /// True for the lock-not-available signal, regardless of stage wrapping.
    pub fn is_lock_unavailable(&self) -> bool {
        match self {
            PipelineError::LockUnavailable(_) => true,
            PipelineError::Database(err) => {
                sqlstate(err) == Some(SQLSTATE_LOCK_NOT_AVAILABLE.into())
            }
            PipelineError::Stage { source, .. } => source.is_lock_unavailable(),
            _ => false,
        }
    }

    /// True for the duplicate-episode signal, regardless of stage wrapping.
    pub fn is_duplicate(&self) -> bool {
        match self {
            PipelineError::DuplicateEpisode(_) => true,
            PipelineError::Stage { source, .. } => source.is_duplicate(),
            _ => false,
        }
    }
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

/// Serialization failures, deadlocks, and lock-unavailable states are safe to
/// retry; constraint violations and the rest are not.
pub fn is_transient_sql_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        _ => matches!(
            sqlstate(err).as_deref(),
            Some(
                SQLSTATE_SERIALIZATION_FAILURE
                    | SQLSTATE_DEADLOCK_DETECTED
                    | SQLSTATE_LOCK_NOT_AVAILABLE
            )
        ),
    }
}

/// True when the database error is Postgres' lock_not_available state raised
/// by `FOR UPDATE NOWAIT`.
pub fn is_lock_not_available(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some(SQLSTATE_LOCK_NOT_AVAILABLE)
}

pub type Result<T> = std::result::Result<T, PipelineError>;
