//! Error taxonomy for the tidepool driver.
//!
//! Every failure a caller can observe is a [`DriverError`]. The variants fall
//! into three families that callers are expected to branch on:
//!
//! - **configuration**: the client was misconfigured; no I/O was attempted.
//! - **connection failure**: the transport is unusable. The affected
//!   connection has been discarded and a retry on a fresh connection may
//!   succeed. [`DriverError::AutoReconnect`] and
//!   [`DriverError::NetworkTimeout`] are the transient members of this family.
//! - **operation failure**: the server rejected the request over a healthy
//!   transport. The connection went back to the pool.

use std::time::Duration;

use bson::Document;
use thiserror::Error;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors surfaced by the driver.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    /// Invalid client configuration, detected before any network I/O.
    #[error("{0}")]
    Configuration(String),

    /// The server could not be reached or the connection is unusable.
    #[error("{0}")]
    ConnectionFailure(String),

    /// A connect attempt (TCP connect or TLS handshake) exceeded `connectTimeoutMS`.
    #[error("connection to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },

    /// No connection became available within `waitQueueTimeoutMS`.
    #[error("connection pool exhausted for {address} (waited {timeout:?})")]
    PoolExhausted { address: String, timeout: Duration },

    /// The pool was shut down by `Client::close`.
    #[error("connection pool for {0} is closed")]
    PoolClosed(String),

    /// A transport error on an established connection (reset, broken pipe, EOF).
    #[error("{0}")]
    AutoReconnect(String),

    /// A send or receive exceeded `socketTimeoutMS`.
    #[error("timed out")]
    NetworkTimeout,

    /// The server sent bytes that do not form a valid reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server reported that the operation failed.
    #[error("{message}")]
    OperationFailure {
        message: String,
        code: Option<i32>,
        document: Option<Document>,
    },

    /// A document could not be encoded or decoded.
    #[error("bson error: {0}")]
    Bson(String),

    /// The caller used an API in a state that does not allow it.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl DriverError {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        DriverError::Configuration(message.into())
    }

    /// Shorthand for a server-reported failure.
    pub fn operation(message: impl Into<String>, code: Option<i32>, document: Option<Document>) -> Self {
        DriverError::OperationFailure {
            message: message.into(),
            code,
            document,
        }
    }

    /// True for every transport-level failure (the connection was discarded).
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            DriverError::ConnectionFailure(_)
                | DriverError::ConnectTimeout { .. }
                | DriverError::PoolExhausted { .. }
                | DriverError::PoolClosed(_)
                | DriverError::AutoReconnect(_)
                | DriverError::NetworkTimeout
                | DriverError::Protocol(_)
        )
    }

    /// True for transient transport failures on an established connection.
    pub fn is_auto_reconnect(&self) -> bool {
        matches!(self, DriverError::AutoReconnect(_) | DriverError::NetworkTimeout)
    }

    /// True when a deadline expired (connect or socket I/O).
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            DriverError::NetworkTimeout | DriverError::ConnectTimeout { .. }
        )
    }

    pub fn is_operation_failure(&self) -> bool {
        matches!(self, DriverError::OperationFailure { .. })
    }

    pub fn is_configuration_error(&self) -> bool {
        matches!(self, DriverError::Configuration(_))
    }

    /// The server error code, for operation failures that carry one.
    pub fn code(&self) -> Option<i32> {
        match self {
            DriverError::OperationFailure { code, .. } => *code,
            _ => None,
        }
    }
}
