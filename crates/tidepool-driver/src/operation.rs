//! Logical operations and server reply interpretation.

use std::time::Duration;

use bson::{Bson, Document};
use tidepool_core::{DriverError, Result};

use crate::wire::{self, Delete, GetMore, Insert, KillCursors, Query, QueryFlags, Reply, Request, Update};

/// What the executor reads back after sending a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseShape {
    /// Exactly one OP_REPLY.
    Single,
    /// A stream of OP_REPLYs pushed by the server; see [`crate::exhaust`].
    Exhaust,
    /// Nothing; unacknowledged writes and OP_KILL_CURSORS.
    None,
}

/// One logical request bound for a single connection.
#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    pub request: Request,
    pub response: ResponseShape,
    /// Retried once on a fresh connection after a non-timeout transport error.
    pub retryable: bool,
    /// Per-operation override of `socketTimeoutMS`.
    pub timeout: Option<Duration>,
}

impl Operation {
    fn new(request: Request, response: ResponseShape, retryable: bool) -> Self {
        Self {
            request,
            response,
            retryable,
            timeout: None,
        }
    }

    /// Run `command` against `<db>.$cmd`. Not retryable unless marked so.
    pub fn command(db: &str, command: Document) -> Self {
        Self::new(
            Request::Query(Query {
                flags: QueryFlags::default(),
                namespace: format!("{db}.$cmd"),
                skip: 0,
                number_to_return: -1,
                query: command,
                fields: None,
            }),
            ResponseShape::Single,
            false,
        )
    }

    /// Initial batch of a regular query.
    pub fn find(query: Query) -> Self {
        Self::new(Request::Query(query), ResponseShape::Single, true)
    }

    /// Start an exhaust query. The Exhaust flag is forced on.
    pub fn exhaust(mut query: Query) -> Self {
        query.flags = query.flags.with(QueryFlags::EXHAUST);
        Self::new(Request::Query(query), ResponseShape::Exhaust, false)
    }

    /// Next batch of a regular cursor. Not retried: a lost reply would skip
    /// documents.
    pub fn get_more(namespace: &str, cursor_id: i64, number_to_return: i32) -> Self {
        Self::new(
            Request::GetMore(GetMore {
                namespace: namespace.to_string(),
                number_to_return,
                cursor_id,
            }),
            ResponseShape::Single,
            false,
        )
    }

    pub fn kill_cursors(cursor_ids: Vec<i64>) -> Self {
        Self::new(
            Request::KillCursors(KillCursors { cursor_ids }),
            ResponseShape::None,
            false,
        )
    }

    /// Fire-and-forget OP_INSERT for `w: 0`.
    pub fn unacknowledged_insert(namespace: &str, documents: Vec<Document>) -> Self {
        Self::new(
            Request::Insert(Insert {
                continue_on_error: false,
                namespace: namespace.to_string(),
                documents,
            }),
            ResponseShape::None,
            false,
        )
    }

    /// Fire-and-forget OP_UPDATE for `w: 0`.
    pub fn unacknowledged_update(
        namespace: &str,
        selector: Document,
        update: Document,
        upsert: bool,
        multi: bool,
    ) -> Self {
        Self::new(
            Request::Update(Update {
                namespace: namespace.to_string(),
                upsert,
                multi,
                selector,
                update,
            }),
            ResponseShape::None,
            false,
        )
    }

    /// Fire-and-forget OP_DELETE for `w: 0`.
    pub fn unacknowledged_delete(namespace: &str, selector: Document, single_remove: bool) -> Self {
        Self::new(
            Request::Delete(Delete {
                namespace: namespace.to_string(),
                single_remove,
                selector,
            }),
            ResponseShape::None,
            false,
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

/// Extract a command's result document, turning `ok: 0`, write errors, and
/// write concern errors into `OperationFailure`.
pub fn command_result(reply: Reply) -> Result<Document> {
    reply.check()?;
    let doc = reply
        .documents
        .into_iter()
        .next()
        .ok_or_else(|| DriverError::Protocol("command reply contained no document".to_string()))?;

    if !is_ok(&doc) {
        let message = doc
            .get_str("errmsg")
            .unwrap_or("command failed")
            .to_string();
        let code = wire::error_code(&doc);
        return Err(DriverError::operation(message, code, Some(doc)));
    }

    if let Ok(errors) = doc.get_array("writeErrors") {
        if let Some(Bson::Document(first)) = errors.first() {
            let message = first.get_str("errmsg").unwrap_or("write error").to_string();
            let code = wire::error_code(first);
            return Err(DriverError::operation(message, code, Some(doc)));
        }
    }

    if let Ok(wc_error) = doc.get_document("writeConcernError") {
        let message = wc_error
            .get_str("errmsg")
            .unwrap_or("write concern error")
            .to_string();
        let code = wire::error_code(wc_error);
        return Err(DriverError::operation(message, code, Some(doc)));
    }

    Ok(doc)
}

fn is_ok(doc: &Document) -> bool {
    match doc.get("ok") {
        Some(Bson::Double(v)) => *v == 1.0,
        Some(Bson::Int32(v)) => *v == 1,
        Some(Bson::Int64(v)) => *v == 1,
        Some(Bson::Boolean(v)) => *v,
        _ => false,
    }
}

/// Read a server count (`n`, `nModified`, ...) that may arrive as any numeric type.
pub fn read_count(doc: &Document, key: &str) -> u64 {
    match doc.get(key) {
        Some(Bson::Int32(n)) => (*n).max(0) as u64,
        Some(Bson::Int64(n)) => (*n).max(0) as u64,
        Some(Bson::Double(n)) if *n > 0.0 => *n as u64,
        _ => 0,
    }
}
