//! Error types for rack operations.

use thiserror::Error;

/// Errors returned by a [`crate::Rack`] implementation.
#[derive(Debug, Error)]
pub enum RackError {
    /// The named app, process or resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A tunnel could not be established.
    #[error("tunnel to {target} failed: {detail}")]
    Tunnel { target: String, detail: String },

    /// The rack description could not be read or parsed.
    #[error("invalid rack description: {0}")]
    Description(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RackError {
    /// Returns true if the error means the requested object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RackError::NotFound(_))
    }
}
