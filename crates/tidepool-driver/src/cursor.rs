//! Query cursors.
//!
//! [`Cursor`] is what `Collection::find` returns. It does no I/O until the
//! first fetch, then runs either a regular cursor (OP_QUERY followed by
//! OP_GET_MORE, OP_KILL_CURSORS on close) or an [`ExhaustCursor`].

use std::collections::VecDeque;

use bson::{Document, doc};
use tidepool_core::{DriverError, Result};

use crate::client::Client;
use crate::exhaust::ExhaustCursor;
use crate::executor::Executor;
use crate::operation::{Operation, read_count};
use crate::wire::{Query, QueryFlags, Reply};

/// Options for `Collection::find`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FindOptions {
    /// Stream every batch over one dedicated connection.
    pub exhaust: bool,
    /// Documents per batch; 0 lets the server decide.
    pub batch_size: u32,
    /// Maximum documents returned; 0 means no limit.
    pub limit: u32,
    pub skip: u32,
    pub projection: Option<Document>,
    /// Ask the server not to time out an idle cursor.
    pub no_cursor_timeout: bool,
}

impl FindOptions {
    pub fn exhaust() -> Self {
        Self {
            exhaust: true,
            ..Self::default()
        }
    }

    fn query(&self, namespace: &str, filter: Document) -> Query {
        let mut flags = QueryFlags::default();
        if self.no_cursor_timeout {
            flags = flags.with(QueryFlags::NO_CURSOR_TIMEOUT);
        }
        Query {
            flags,
            namespace: namespace.to_string(),
            skip: clamp(self.skip),
            number_to_return: 0,
            query: filter,
            fields: self.projection.clone(),
        }
    }
}

fn clamp(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

// ── StandardCursor ───────────────────────────────────────────────────

/// OP_QUERY / OP_GET_MORE cursor. Each batch borrows a pooled connection
/// only for its own round trip.
pub struct StandardCursor {
    executor: Executor,
    query: Query,
    batch_size: i32,
    limit: i32,
    cursor_id: i64,
    started: bool,
    returned: u64,
    buffer: VecDeque<Document>,
}

impl StandardCursor {
    pub fn new(executor: Executor, query: Query, batch_size: u32, limit: u32) -> Self {
        Self {
            executor,
            query,
            batch_size: clamp(batch_size),
            limit: clamp(limit),
            cursor_id: 0,
            started: false,
            returned: 0,
            buffer: VecDeque::new(),
        }
    }

    pub fn cursor_id(&self) -> i64 {
        self.cursor_id
    }

    fn limit_reached(&self) -> bool {
        self.limit > 0 && self.returned >= self.limit as u64
    }

    /// `numberToReturn` for the next request.
    fn batch_request(&self) -> i32 {
        if self.limit == 0 {
            return self.batch_size;
        }
        let remaining = (self.limit as u64).saturating_sub(self.returned) as i32;
        match self.batch_size {
            0 => remaining,
            batch => batch.min(remaining),
        }
    }

    pub async fn fetch_next(&mut self) -> Result<bool> {
        loop {
            if !self.buffer.is_empty() {
                return Ok(true);
            }
            if self.started && (self.cursor_id == 0 || self.limit_reached()) {
                return Ok(false);
            }

            let op = if self.started {
                Operation::get_more(&self.query.namespace, self.cursor_id, self.batch_request())
            } else {
                let mut query = self.query.clone();
                query.number_to_return = self.batch_request();
                Operation::find(query)
            };
            self.started = true;

            let reply = match self.executor.execute(&op).await {
                Ok(Some(reply)) => reply,
                Ok(None) => {
                    self.cursor_id = 0;
                    return Err(DriverError::Protocol("query produced no reply".to_string()));
                }
                Err(err) => {
                    self.cursor_id = 0;
                    return Err(err);
                }
            };
            self.absorb(reply);

            if self.limit_reached() && self.cursor_id != 0 {
                self.kill().await;
            }
        }
    }

    fn absorb(&mut self, reply: Reply) {
        self.cursor_id = reply.cursor_id;
        let mut documents = reply.documents;
        if self.limit > 0 {
            let remaining = (self.limit as u64).saturating_sub(self.returned) as usize;
            documents.truncate(remaining);
        }
        self.returned = self.returned.saturating_add(documents.len() as u64);
        self.buffer.extend(documents);
    }

    pub fn next_object(&mut self) -> Option<Document> {
        self.buffer.pop_front()
    }

    async fn kill(&mut self) {
        let cursor_id = std::mem::take(&mut self.cursor_id);
        if cursor_id == 0 {
            return;
        }
        if let Err(err) = self.executor.execute(&Operation::kill_cursors(vec![cursor_id])).await {
            tracing::warn!(cursor_id, error = %err, "failed to kill cursor");
        }
    }

    pub async fn close(&mut self) {
        self.buffer.clear();
        self.kill().await;
    }
}

impl Drop for StandardCursor {
    fn drop(&mut self) {
        let cursor_id = self.cursor_id;
        if cursor_id == 0 {
            return;
        }
        // Best effort: release the server-side cursor in the background.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let executor = self.executor.clone();
            handle.spawn(async move {
                let _ = executor.execute(&Operation::kill_cursors(vec![cursor_id])).await;
            });
        }
    }
}

// ── Cursor ───────────────────────────────────────────────────────────

enum CursorKind {
    Unstarted,
    Standard(StandardCursor),
    Exhaust(ExhaustCursor),
    Closed,
}

/// Cursor over the results of a find.
pub struct Cursor {
    client: Client,
    db: String,
    collection: String,
    filter: Document,
    options: FindOptions,
    kind: CursorKind,
    delivered: u32,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            CursorKind::Unstarted => "unstarted",
            CursorKind::Standard(_) => "standard",
            CursorKind::Exhaust(_) => "exhaust",
            CursorKind::Closed => "closed",
        };
        f.debug_struct("Cursor")
            .field("namespace", &self.namespace())
            .field("filter", &self.filter)
            .field("kind", &kind)
            .finish()
    }
}

impl Cursor {
    pub(crate) fn new(
        client: Client,
        db: &str,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> Self {
        Self {
            client,
            db: db.to_string(),
            collection: collection.to_string(),
            filter,
            options,
            kind: CursorKind::Unstarted,
            delivered: 0,
        }
    }

    pub fn namespace(&self) -> String {
        format!("{}.{}", self.db, self.collection)
    }

    pub fn is_exhaust(&self) -> bool {
        self.options.exhaust
    }

    /// The exhaust state machine, once started.
    pub fn exhaust_cursor(&self) -> Option<&ExhaustCursor> {
        match &self.kind {
            CursorKind::Exhaust(cursor) => Some(cursor),
            _ => None,
        }
    }

    /// Whether more documents may still arrive.
    pub fn alive(&self) -> bool {
        match &self.kind {
            CursorKind::Unstarted => true,
            CursorKind::Standard(c) => c.cursor_id() != 0 || !c.buffer.is_empty(),
            CursorKind::Exhaust(c) => !c.state().is_terminal() || c.buffered() > 0,
            CursorKind::Closed => false,
        }
    }

    fn limit_reached(&self) -> bool {
        self.options.limit > 0 && self.delivered >= self.options.limit
    }

    async fn start(&mut self) -> Result<()> {
        let executor = self.client.executor().await?;
        let query = self.options.query(&self.namespace(), self.filter.clone());
        self.kind = if self.options.exhaust {
            let mut query = query;
            query.number_to_return = clamp(self.options.batch_size);
            CursorKind::Exhaust(ExhaustCursor::new(executor, query))
        } else {
            CursorKind::Standard(StandardCursor::new(
                executor,
                query,
                self.options.batch_size,
                self.options.limit,
            ))
        };
        Ok(())
    }

    /// Buffer the next batch if needed. Returns `false` when exhausted.
    pub async fn fetch_next(&mut self) -> Result<bool> {
        if self.limit_reached() {
            self.close().await;
            return Ok(false);
        }
        if matches!(self.kind, CursorKind::Unstarted) {
            self.start().await?;
        }
        match &mut self.kind {
            CursorKind::Standard(cursor) => cursor.fetch_next().await,
            CursorKind::Exhaust(cursor) => cursor.fetch_next().await,
            CursorKind::Unstarted | CursorKind::Closed => Ok(false),
        }
    }

    /// Next already-buffered document, without I/O.
    pub fn next_object(&mut self) -> Option<Document> {
        if self.limit_reached() {
            return None;
        }
        let doc = match &mut self.kind {
            CursorKind::Standard(cursor) => cursor.next_object(),
            CursorKind::Exhaust(cursor) => cursor.next_object(),
            CursorKind::Unstarted | CursorKind::Closed => None,
        };
        if doc.is_some() {
            self.delivered += 1;
        }
        doc
    }

    pub async fn next(&mut self) -> Result<Option<Document>> {
        if self.fetch_next().await? {
            Ok(self.next_object())
        } else {
            Ok(None)
        }
    }

    /// Drain the cursor into a vector.
    pub async fn collect(&mut self) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        while let Some(doc) = self.next().await? {
            documents.push(doc);
        }
        Ok(documents)
    }

    /// Server-side count of documents matching the filter, ignoring
    /// limit and skip. Does not move the cursor.
    pub async fn count(&self) -> Result<u64> {
        let reply = self
            .client
            .command(
                &self.db,
                doc! { "count": self.collection.as_str(), "query": self.filter.clone() },
            )
            .await?;
        Ok(read_count(&reply, "n"))
    }

    /// Release server and connection resources. Idempotent.
    pub async fn close(&mut self) {
        match std::mem::replace(&mut self.kind, CursorKind::Closed) {
            CursorKind::Standard(mut cursor) => cursor.close().await,
            CursorKind::Exhaust(mut cursor) => cursor.end_stream(),
            CursorKind::Unstarted | CursorKind::Closed => {}
        }
    }
}
