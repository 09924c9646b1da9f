//! Error taxonomy for the OVN container-network plugin.
//!
//! Kinds mirror the ones spelled out by the driver's contract: each maps to
//! a distinct RPC-visible failure mode, not to a particular library we
//! happened to call into.

use thiserror::Error;

/// Errors surfaced by every component in this crate.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Error::AlreadyExists(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Error::Busy(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Error::Unavailable(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// True for error kinds that a delete-like verb should swallow and
    /// treat as success (spec §7: NotFound, AlreadyExists).
    pub fn is_idempotent_noop(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::AlreadyExists(_))
    }

    /// Render the sentence that goes into the RPC `Err` field.
    pub fn to_rpc_message(&self) -> String {
        self.to_string()
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_noop_kinds() {
        assert!(Error::not_found("x").is_idempotent_noop());
        assert!(Error::already_exists("x").is_idempotent_noop());
        assert!(!Error::busy("x").is_idempotent_noop());
    }

    #[test]
    fn rpc_message_is_the_display_string() {
        let err = Error::busy("network N1 has live endpoints");
        assert_eq!(err.to_rpc_message(), "busy: network N1 has live endpoints");
    }
}
