use crate::change_event::Timestamp;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("stream ordering violated: observed ts {observed} behind current ts {current}")]
    StreamOrder {
        current: Timestamp,
        observed: Timestamp,
    },

    #[error("checkpoint for {subscription} would regress: {attempted} < {committed}")]
    CheckpointRegression {
        subscription: String,
        attempted: Timestamp,
        committed: Timestamp,
    },

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        source: anyhow::Error,
    },

    #[error("change feed error: {0}")]
    Feed(anyhow::Error),

    #[error("checkpoint store error: {0}")]
    Store(anyhow::Error),

    #[error("notification dispatch error: {0}")]
    Dispatch(anyhow::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type DomainResult<T> = Result<T, DomainError>;
