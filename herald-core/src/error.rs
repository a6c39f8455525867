//! Error types shared across the Herald crates.

use thiserror::Error;

/// Main error type for core Herald operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A message or command could not be parsed from its wire form.
    #[error("invalid message: {reason}")]
    InvalidMessage {
        /// What made the input unparseable.
        reason: String,
    },

    /// A client command was malformed.
    #[error("bad request: {reason}")]
    BadRequest {
        /// What was wrong with the command.
        reason: String,
    },

    /// Delivery was attempted on a route whose channel is closed or timed out.
    #[error("invalid route")]
    InvalidRoute,

    /// A public operation was called while the module is shutting down.
    #[error("module {module} is stopping")]
    ModuleStopping {
        /// Name of the stopping module.
        module: String,
    },

    /// A mandatory collaborator (message store, KV store) was not configured.
    #[error("service not provided: {service}")]
    ServiceNotProvided {
        /// Name of the missing service.
        service: String,
    },

    /// Message persistence failed.
    #[error("store error: {reason}")]
    Store {
        /// Underlying store failure, as text.
        reason: String,
    },

    /// Configuration was rejected at validation time.
    #[error("configuration error: {reason}")]
    Configuration {
        /// Why the configuration is invalid.
        reason: String,
    },

    /// Cluster communication failed.
    #[error("cluster error: {reason}")]
    Cluster {
        /// Underlying cluster failure, as text.
        reason: String,
    },

    /// A health check reported a degraded component.
    #[error("health check failed: {reason}")]
    HealthCheck {
        /// What the check found.
        reason: String,
    },
}

impl Error {
    /// Shorthand for a [`Error::ModuleStopping`] of the named module.
    pub fn stopping(module: impl Into<String>) -> Self {
        Self::ModuleStopping { module: module.into() }
    }

    /// Shorthand for a [`Error::InvalidMessage`] with the given reason.
    pub fn invalid_message(reason: impl Into<String>) -> Self {
        Self::InvalidMessage { reason: reason.into() }
    }

    /// Shorthand for a [`Error::BadRequest`] with the given reason.
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest { reason: reason.into() }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidMessage { reason: err.to_string() }
    }
}

/// Result type alias for core Herald operations.
pub type Result<T> = std::result::Result<T, Error>;
