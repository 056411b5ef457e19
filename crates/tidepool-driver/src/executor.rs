//! Operation executor: acquire, send, await the reply, settle the connection.
//!
//! ```text
//! execute(op)
//!   → pool.acquire(waitQueueTimeoutMS)
//!   → send(encode(op, request_id))          socketTimeoutMS
//!   → [receive reply, check responseTo]      socketTimeoutMS
//!   → release (healthy) | discard (transport failure)
//! ```
//!
//! Every await point holds the connection inside a [`PooledConnection`], so
//! dropping the future at any point closes the socket instead of leaking it
//! back into the pool mid-message.

use std::time::Duration;

use tidepool_core::{DriverError, Result};

use crate::exhaust;
use crate::operation::{Operation, ResponseShape};
use crate::pool::{Pool, PooledConnection};
use crate::supervisor;
use crate::wire::{Reply, Request, next_request_id};

/// Runs [`Operation`]s against one server pool.
#[derive(Clone, Debug)]
pub struct Executor {
    pool: Pool,
    socket_timeout: Option<Duration>,
}

impl Executor {
    pub fn new(pool: Pool, socket_timeout: Option<Duration>) -> Self {
        Self { pool, socket_timeout }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn socket_timeout(&self) -> Option<Duration> {
        self.socket_timeout
    }

    /// Execute `op`, retrying once on a fresh connection when it is
    /// retryable and the failure was a non-timeout transport error.
    ///
    /// Returns `None` for operations that expect no reply.
    pub async fn execute(&self, op: &Operation) -> Result<Option<Reply>> {
        if op.response == ResponseShape::Exhaust || exhaust::is_exhaust(&op.request) {
            return Err(DriverError::InvalidOperation(
                "exhaust queries must be run through an exhaust cursor".to_string(),
            ));
        }

        match self.execute_once(op).await {
            Err(err) if op.retryable && supervisor::is_retryable(&err) => {
                tracing::warn!(
                    address = %self.pool.address(),
                    error = %err,
                    "retrying operation on a fresh connection"
                );
                self.execute_once(op).await
            }
            other => other,
        }
    }

    async fn execute_once(&self, op: &Operation) -> Result<Option<Reply>> {
        let conn = self.pool.acquire(self.pool.wait_queue_timeout()).await?;
        self.execute_on(conn, op).await
    }

    /// Execute `op` on an already checked-out connection. The connection is
    /// released or discarded before this returns.
    pub async fn execute_on(&self, mut conn: PooledConnection, op: &Operation) -> Result<Option<Reply>> {
        let timeout = op.timeout.or(self.socket_timeout);
        let request_id = match self.send(&mut conn, &op.request, timeout).await {
            Ok(id) => id,
            Err(err) => {
                supervisor::settle(conn, &err);
                return Err(err);
            }
        };

        if op.response == ResponseShape::None {
            conn.release();
            return Ok(None);
        }

        let reply = match self.receive(&mut conn, request_id, timeout).await {
            Ok(reply) => reply,
            Err(err) => {
                supervisor::settle(conn, &err);
                return Err(err);
            }
        };
        conn.release();
        reply.check()?;
        Ok(Some(reply))
    }

    /// Encode and write `request`; returns the request id used.
    pub(crate) async fn send(
        &self,
        conn: &mut PooledConnection,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<i32> {
        let request_id = next_request_id();
        let message = request.encode(request_id)?;
        conn.send(&message, timeout).await?;
        Ok(request_id)
    }

    /// Read the reply to `request_id`. A mismatched `responseTo` closes the
    /// connection.
    pub(crate) async fn receive(
        &self,
        conn: &mut PooledConnection,
        request_id: i32,
        timeout: Option<Duration>,
    ) -> Result<Reply> {
        let reply = conn.receive(timeout).await?;
        if reply.response_to != request_id {
            conn.close();
            return Err(DriverError::Protocol(format!(
                "reply responseTo {} does not match request id {request_id}",
                reply.response_to
            )));
        }
        Ok(reply)
    }
}
