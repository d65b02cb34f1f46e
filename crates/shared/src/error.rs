//! Error types shared across MyHealth Guide crates

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SharedError {
    #[error("Unknown plan tag: {0}")]
    UnknownPlanTag(String),

    #[error("Unknown subscription status: {0}")]
    UnknownStatus(String),

    #[error("Invalid identifier: {0}")]
    InvalidId(String),
}
