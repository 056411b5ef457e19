//! Exhaust cursors.
//!
//! An exhaust query asks the server to push every batch over one connection
//! without further requests. The cursor owns that connection exclusively
//! until the stream ends:
//!
//! ```text
//! Init ──first fetch──► Streaming ──cursor id 0──► Exhausted   (connection released)
//!   │                      │
//!   │                      ├──server error────────► Failed      (connection released)
//!   │                      ├──transport error─────► Failed      (connection discarded)
//!   └──end_stream/drop─────┴──end_stream/drop─────► Abandoned   (connection discarded)
//! ```
//!
//! Each pushed reply answers the previous reply's `requestID`; anything else
//! is a protocol error.

use std::collections::VecDeque;
use std::time::Duration;

use bson::Document;
use tidepool_core::{DriverError, Result};

use crate::executor::Executor;
use crate::operation::Operation;
use crate::pool::PooledConnection;
use crate::supervisor;
use crate::wire::{Query, QueryFlags, Reply, Request};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExhaustState {
    Init,
    Streaming,
    Exhausted,
    Failed,
    Abandoned,
}

impl ExhaustState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExhaustState::Exhausted | ExhaustState::Failed | ExhaustState::Abandoned
        )
    }
}

pub struct ExhaustCursor {
    executor: Executor,
    query: Query,
    state: ExhaustState,
    conn: Option<PooledConnection>,
    cursor_id: i64,
    buffer: VecDeque<Document>,
    /// Id of the request or reply the next pushed reply must answer.
    last_request_id: i32,
    batches: usize,
}

impl std::fmt::Debug for ExhaustCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExhaustCursor")
            .field("namespace", &self.query.namespace)
            .field("state", &self.state)
            .field("cursor_id", &self.cursor_id)
            .field("buffered", &self.buffer.len())
            .field("batches", &self.batches)
            .finish()
    }
}

impl ExhaustCursor {
    /// Create a cursor in `Init`. No I/O happens until the first fetch.
    pub fn new(executor: Executor, mut query: Query) -> Self {
        query.flags = query.flags.with(QueryFlags::EXHAUST);
        Self {
            executor,
            query,
            state: ExhaustState::Init,
            conn: None,
            cursor_id: 0,
            buffer: VecDeque::new(),
            last_request_id: 0,
            batches: 0,
        }
    }

    pub fn state(&self) -> ExhaustState {
        self.state
    }

    pub fn cursor_id(&self) -> i64 {
        self.cursor_id
    }

    /// Number of reply batches received so far.
    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Id of the connection currently held by the stream, if any.
    pub fn connection_id(&self) -> Option<u64> {
        self.conn.as_ref().map(|c| c.id())
    }

    pub fn namespace(&self) -> &str {
        &self.query.namespace
    }

    pub fn filter(&self) -> &Document {
        &self.query.query
    }

    /// Ensure at least one document is buffered. Returns `false` once the
    /// stream has ended and the buffer is empty.
    pub async fn fetch_next(&mut self) -> Result<bool> {
        loop {
            if !self.buffer.is_empty() {
                return Ok(true);
            }
            match self.state {
                ExhaustState::Init => self.start().await?,
                ExhaustState::Streaming => self.read_batch().await?,
                _ => return Ok(false),
            }
        }
    }

    /// Pop the next buffered document without any I/O.
    pub fn next_object(&mut self) -> Option<Document> {
        self.buffer.pop_front()
    }

    async fn start(&mut self) -> Result<()> {
        let pool = self.executor.pool().clone();
        let mut conn = pool.acquire(pool.wait_queue_timeout()).await.inspect_err(|_| {
            self.state = ExhaustState::Failed;
        })?;

        let op = Operation::exhaust(self.query.clone());
        let timeout = op.timeout.or(self.executor.socket_timeout());
        match self.executor.send(&mut conn, &op.request, timeout).await {
            Ok(request_id) => {
                self.last_request_id = request_id;
                self.conn = Some(conn);
                self.state = ExhaustState::Streaming;
                tracing::debug!(
                    conn_id = self.connection_id(),
                    namespace = %self.query.namespace,
                    "exhaust stream started"
                );
                Ok(())
            }
            Err(err) => {
                self.state = ExhaustState::Failed;
                supervisor::settle(conn, &err);
                Err(err)
            }
        }
    }

    async fn read_batch(&mut self) -> Result<()> {
        let timeout = self.executor.socket_timeout();
        // Held outside `self` while reading: a cancelled fetch drops the guard
        // mid-message, which discards the connection.
        let Some(mut conn) = self.conn.take() else {
            self.state = ExhaustState::Failed;
            return Err(DriverError::AutoReconnect(
                "exhaust stream was interrupted mid-batch".to_string(),
            ));
        };

        let received = self
            .executor
            .receive(&mut conn, self.last_request_id, timeout)
            .await;
        self.conn = Some(conn);
        let reply = match received {
            Ok(reply) => reply,
            Err(err) => {
                self.fail(&err);
                return Err(err);
            }
        };

        if let Err(err) = reply.check() {
            // The server stops pushing after an error reply; the socket is clean.
            self.fail(&err);
            return Err(err);
        }

        self.accept(reply);
        Ok(())
    }

    fn accept(&mut self, reply: Reply) {
        self.batches += 1;
        self.last_request_id = reply.request_id;
        self.cursor_id = reply.cursor_id;
        self.buffer.extend(reply.documents);

        if self.cursor_id == 0 {
            self.state = ExhaustState::Exhausted;
            if let Some(mut conn) = self.conn.take() {
                conn.set_exhaust_cursor(None);
                tracing::debug!(conn_id = conn.id(), batches = self.batches, "exhaust stream complete");
                conn.release();
            }
        } else if let Some(conn) = self.conn.as_mut() {
            conn.set_exhaust_cursor(Some(reply.cursor_id));
        }
    }

    fn fail(&mut self, err: &DriverError) {
        self.state = ExhaustState::Failed;
        if let Some(mut conn) = self.conn.take() {
            conn.set_exhaust_cursor(None);
            supervisor::settle(conn, err);
        }
    }

    /// Stop consuming. A stream still being pushed closes its connection;
    /// buffered documents are dropped.
    pub fn end_stream(&mut self) {
        self.buffer.clear();
        match self.state {
            ExhaustState::Init => self.state = ExhaustState::Abandoned,
            ExhaustState::Streaming => {
                self.state = ExhaustState::Abandoned;
                if let Some(mut conn) = self.conn.take() {
                    tracing::debug!(
                        conn_id = conn.id(),
                        cursor_id = self.cursor_id,
                        "abandoning exhaust stream"
                    );
                    conn.close();
                    conn.discard();
                }
            }
            _ => {}
        }
    }

    /// Socket timeout applied to each pushed batch.
    pub fn timeout(&self) -> Option<Duration> {
        self.executor.socket_timeout()
    }
}

impl Drop for ExhaustCursor {
    fn drop(&mut self) {
        self.end_stream();
    }
}

/// Whether `request` would start an exhaust stream.
pub fn is_exhaust(request: &Request) -> bool {
    matches!(request, Request::Query(q) if q.flags.contains(QueryFlags::EXHAUST))
}
