use thiserror::Error;

use crate::codec::CodecError;
use crate::store::StoreError;

pub type PlanResult<T> = Result<T, PlanError>;

#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Query depth {depth} exceeds the maximum of {max}")]
    DepthExceeded { depth: usize, max: usize },

    #[error("Index-only field '{0}' cannot be bounded by the index and would require a full table scan")]
    UnboundedIndexOnlyField(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid date: {0}")]
    InvalidDate(#[from] chrono::ParseError),

    #[error("Invalid number: {0}")]
    InvalidNumber(#[from] std::num::ParseIntError),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Malformed settings file: {0}")]
    Settings(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker pool '{0}' is shut down")]
    PoolClosed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlanError {
    /// Fatal planning errors abort the query and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PlanError::DepthExceeded { .. } | PlanError::UnboundedIndexOnlyField(_)
        )
    }
}
