//! Error types for the network engine.

use thiserror::Error;

use crate::validation::ValidationError;
use crate::wg::ToolError;

/// Errors returned by the allocator, renderer, supervisor and service layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Every host address of the range is reserved.
    #[error("No free address left in {cidr}")]
    AllocationExhausted { cidr: String },

    /// Interface identifier failed the allow-list check.
    #[error("Invalid interface identifier: {0:?}")]
    InvalidIdentifier(String),

    /// External bring-up/bring-down failed or timed out.
    #[error("Interface {interface} operation failed: {source}")]
    Interface {
        interface: String,
        #[source]
        source: ToolError,
    },

    /// Counter query for one group failed during a sampling tick.
    #[error("Sampling group {group_id} failed: {reason}")]
    Sampling { group_id: i64, reason: String },

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Key generation or other tool call outside an interface operation.
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Diagnostic output captured from the external command, if any.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Error::Interface { source, .. } | Error::Tool(source) => source.diagnostic(),
            _ => None,
        }
    }
}
