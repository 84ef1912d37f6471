use std::time::Duration;

use rules_common::error::CommonError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("config error: {0}")]
    Config(String),

    #[error("parse error in {file}: {message}")]
    Parse { file: String, message: String },

    #[error("index error: {0}")]
    Index(String),

    #[error("sql engine error: {0}")]
    SqlEngine(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single retrieval or verification stage.
///
/// These never escape to the caller of `resolve` or `verify`: the orchestrator degrades
/// to the next-best candidate and the gate fails closed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StageError {
    #[error("stage unavailable: {0}")]
    Unavailable(String),

    #[error("stage timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    MalformedVerdict(String),
}
