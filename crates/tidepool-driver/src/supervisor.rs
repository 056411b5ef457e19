//! Timeout and failure supervision.
//!
//! Every connect, send, and receive runs under a deadline taken from the
//! client options. Expired deadlines and `std::io` failures are mapped onto
//! [`DriverError`], and [`fate_after`] decides whether the connection that
//! produced an error can go back to the pool.

use std::future::Future;
use std::io;
use std::time::Duration;

use tidepool_core::{DriverError, Result, ServerAddress};

use crate::pool::PooledConnection;

/// Which I/O step failed. Used to pick the error variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Handshake,
    Send,
    Receive,
}

/// What happens to a connection after an operation failed on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionFate {
    /// Transport is healthy; return it to the idle set.
    Reuse,
    /// Transport state is unknown or broken; close it.
    Discard,
}

/// Run a send or receive under `limit`. `None` waits forever.
pub async fn with_deadline<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::NetworkTimeout),
        },
        None => fut.await,
    }
}

/// Run a connect or TLS handshake under `limit`.
pub async fn with_connect_deadline<T, F>(
    limit: Option<Duration>,
    address: &ServerAddress,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::ConnectTimeout {
                address: address.to_string(),
                timeout: limit,
            }),
        },
        None => fut.await,
    }
}

/// Map an I/O error to the driver taxonomy.
pub fn classify_io(err: &io::Error, phase: Phase, address: &ServerAddress) -> DriverError {
    match phase {
        Phase::Connect | Phase::Handshake => {
            DriverError::ConnectionFailure(format!("{address}: {err}"))
        }
        Phase::Send | Phase::Receive => match err.kind() {
            io::ErrorKind::TimedOut => DriverError::NetworkTimeout,
            io::ErrorKind::UnexpectedEof => {
                DriverError::AutoReconnect(format!("connection closed by {address}"))
            }
            _ => DriverError::AutoReconnect(format!("{address}: {err}")),
        },
    }
}

/// Decide a connection's fate after `err`.
pub fn fate_after(err: &DriverError) -> ConnectionFate {
    match err {
        DriverError::OperationFailure { .. }
        | DriverError::Bson(_)
        | DriverError::InvalidOperation(_)
        | DriverError::Configuration(_) => ConnectionFate::Reuse,
        _ => ConnectionFate::Discard,
    }
}

/// Return or close `conn` according to [`fate_after`].
pub fn settle(conn: PooledConnection, err: &DriverError) {
    match fate_after(err) {
        ConnectionFate::Reuse => conn.release(),
        ConnectionFate::Discard => {
            tracing::warn!(
                conn_id = conn.id(),
                address = %conn.address(),
                error = %err,
                "discarding connection after failure"
            );
            conn.discard();
        }
    }
}

/// Whether a retryable operation may run once more on a fresh connection.
///
/// Timeouts are excluded: the server may still be executing the request.
/// Pool-level failures are excluded because a second attempt would hit the
/// same pool state.
pub fn is_retryable(err: &DriverError) -> bool {
    matches!(
        err,
        DriverError::AutoReconnect(_) | DriverError::ConnectionFailure(_) | DriverError::Protocol(_)
    )
}
