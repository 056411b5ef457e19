//! MongoDB legacy wire protocol framing.
//!
//! Every message starts with a 16-byte little-endian header:
//!
//! ```text
//! int32 messageLength   total size including the header
//! int32 requestID       client- or server-generated identifier
//! int32 responseTo      requestID this message answers (0 for requests)
//! int32 opCode          see [`OpCode`]
//! ```
//!
//! Bodies hold C strings, little-endian integers, and BSON documents. BSON
//! itself is delegated to the `bson` crate; this module only moves document
//! buffers in and out of messages. Both directions are implemented so the
//! same codec backs the client and the test servers.

use std::sync::atomic::{AtomicI32, Ordering};

use bson::{Bson, Document};
use tidepool_core::{DriverError, Result};

/// Size of the standard message header.
pub const HEADER_LEN: usize = 16;

/// Largest message the driver will read or write (server default).
pub const MAX_MESSAGE_SIZE: usize = 48 * 1000 * 1000;

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Allocate a process-unique, positive request id.
pub fn next_request_id() -> i32 {
    loop {
        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        if id > 0 {
            return id;
        }
        // Wrapped past i32::MAX; restart the sequence.
        let _ = NEXT_REQUEST_ID.compare_exchange(id.wrapping_add(1), 1, Ordering::Relaxed, Ordering::Relaxed);
    }
}

// ── OpCode ───────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
}

impl OpCode {
    pub fn from_i32(code: i32) -> Result<Self> {
        Ok(match code {
            1 => OpCode::Reply,
            2001 => OpCode::Update,
            2002 => OpCode::Insert,
            2004 => OpCode::Query,
            2005 => OpCode::GetMore,
            2006 => OpCode::Delete,
            2007 => OpCode::KillCursors,
            other => {
                return Err(DriverError::Protocol(format!("unsupported opcode {other}")));
            }
        })
    }
}

// ── MessageHeader ────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MessageHeader {
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self> {
        let mut pos = 0;
        let length = read_i32(bytes, &mut pos)?;
        let request_id = read_i32(bytes, &mut pos)?;
        let response_to = read_i32(bytes, &mut pos)?;
        let op_code = OpCode::from_i32(read_i32(bytes, &mut pos)?)?;

        if length < HEADER_LEN as i32 || length as usize > MAX_MESSAGE_SIZE {
            return Err(DriverError::Protocol(format!(
                "message length {length} outside {HEADER_LEN}..={MAX_MESSAGE_SIZE}"
            )));
        }
        Ok(Self {
            length,
            request_id,
            response_to,
            op_code,
        })
    }

    /// Number of body bytes following the header.
    pub fn body_len(&self) -> usize {
        self.length as usize - HEADER_LEN
    }
}

// ── Flags ────────────────────────────────────────────────────────────

/// OP_QUERY flag bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryFlags(pub u32);

impl QueryFlags {
    pub const TAILABLE_CURSOR: QueryFlags = QueryFlags(1 << 1);
    pub const SLAVE_OK: QueryFlags = QueryFlags(1 << 2);
    pub const NO_CURSOR_TIMEOUT: QueryFlags = QueryFlags(1 << 4);
    pub const AWAIT_DATA: QueryFlags = QueryFlags(1 << 5);
    pub const EXHAUST: QueryFlags = QueryFlags(1 << 6);
    pub const PARTIAL: QueryFlags = QueryFlags(1 << 7);

    pub fn contains(self, other: QueryFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: QueryFlags) -> QueryFlags {
        QueryFlags(self.0 | other.0)
    }
}

/// OP_REPLY responseFlags bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplyFlags(pub u32);

impl ReplyFlags {
    pub const CURSOR_NOT_FOUND: ReplyFlags = ReplyFlags(1 << 0);
    pub const QUERY_FAILURE: ReplyFlags = ReplyFlags(1 << 1);
    pub const SHARD_CONFIG_STALE: ReplyFlags = ReplyFlags(1 << 2);
    pub const AWAIT_CAPABLE: ReplyFlags = ReplyFlags(1 << 3);

    pub fn contains(self, other: ReplyFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: ReplyFlags) -> ReplyFlags {
        ReplyFlags(self.0 | other.0)
    }
}

// ── Requests ─────────────────────────────────────────────────────────

/// OP_QUERY: a find or, against `<db>.$cmd`, a command.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub flags: QueryFlags,
    pub namespace: String,
    pub skip: i32,
    /// `numberToReturn`: 0 = server default, negative = single batch then close.
    pub number_to_return: i32,
    pub query: Document,
    pub fields: Option<Document>,
}

/// OP_GET_MORE: next batch of an open cursor.
#[derive(Clone, Debug, PartialEq)]
pub struct GetMore {
    pub namespace: String,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

/// OP_KILL_CURSORS: release server-side cursors. Never answered.
#[derive(Clone, Debug, PartialEq)]
pub struct KillCursors {
    pub cursor_ids: Vec<i64>,
}

/// OP_INSERT: unacknowledged insert.
#[derive(Clone, Debug, PartialEq)]
pub struct Insert {
    pub continue_on_error: bool,
    pub namespace: String,
    pub documents: Vec<Document>,
}

/// OP_UPDATE: unacknowledged update.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub namespace: String,
    pub upsert: bool,
    pub multi: bool,
    pub selector: Document,
    pub update: Document,
}

/// OP_DELETE: unacknowledged delete.
#[derive(Clone, Debug, PartialEq)]
pub struct Delete {
    pub namespace: String,
    pub single_remove: bool,
    pub selector: Document,
}

/// Any client-to-server message.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    Query(Query),
    GetMore(GetMore),
    KillCursors(KillCursors),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
}

impl Request {
    pub fn op_code(&self) -> OpCode {
        match self {
            Request::Query(_) => OpCode::Query,
            Request::GetMore(_) => OpCode::GetMore,
            Request::KillCursors(_) => OpCode::KillCursors,
            Request::Insert(_) => OpCode::Insert,
            Request::Update(_) => OpCode::Update,
            Request::Delete(_) => OpCode::Delete,
        }
    }

    /// Whether the server answers this message with an OP_REPLY.
    pub fn expects_reply(&self) -> bool {
        matches!(self, Request::Query(_) | Request::GetMore(_))
    }

    /// Namespace the request targets, if any.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Request::Query(q) => Some(&q.namespace),
            Request::GetMore(g) => Some(&g.namespace),
            Request::Insert(i) => Some(&i.namespace),
            Request::Update(u) => Some(&u.namespace),
            Request::Delete(d) => Some(&d.namespace),
            Request::KillCursors(_) => None,
        }
    }

    /// Encode the full message, header included.
    pub fn encode(&self, request_id: i32) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(128);
        match self {
            Request::Query(q) => {
                put_u32(&mut body, q.flags.0);
                put_cstring(&mut body, &q.namespace)?;
                put_i32(&mut body, q.skip);
                put_i32(&mut body, q.number_to_return);
                put_document(&mut body, &q.query)?;
                if let Some(fields) = &q.fields {
                    put_document(&mut body, fields)?;
                }
            }
            Request::GetMore(g) => {
                put_i32(&mut body, 0);
                put_cstring(&mut body, &g.namespace)?;
                put_i32(&mut body, g.number_to_return);
                put_i64(&mut body, g.cursor_id);
            }
            Request::KillCursors(k) => {
                put_i32(&mut body, 0);
                put_i32(&mut body, k.cursor_ids.len() as i32);
                for id in &k.cursor_ids {
                    put_i64(&mut body, *id);
                }
            }
            Request::Insert(i) => {
                put_u32(&mut body, u32::from(i.continue_on_error));
                put_cstring(&mut body, &i.namespace)?;
                if i.documents.is_empty() {
                    return Err(DriverError::InvalidOperation(
                        "insert requires at least one document".to_string(),
                    ));
                }
                for doc in &i.documents {
                    put_document(&mut body, doc)?;
                }
            }
            Request::Update(u) => {
                put_i32(&mut body, 0);
                put_cstring(&mut body, &u.namespace)?;
                put_u32(&mut body, u32::from(u.upsert) | (u32::from(u.multi) << 1));
                put_document(&mut body, &u.selector)?;
                put_document(&mut body, &u.update)?;
            }
            Request::Delete(d) => {
                put_i32(&mut body, 0);
                put_cstring(&mut body, &d.namespace)?;
                put_u32(&mut body, u32::from(d.single_remove));
                put_document(&mut body, &d.selector)?;
            }
        }
        frame(request_id, 0, self.op_code(), body)
    }

    /// Decode a client message body. Used by servers and tests.
    pub fn decode(header: &MessageHeader, body: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let request = match header.op_code {
            OpCode::Query => {
                let flags = QueryFlags(read_i32(body, &mut pos)? as u32);
                let namespace = read_cstring(body, &mut pos)?;
                let skip = read_i32(body, &mut pos)?;
                let number_to_return = read_i32(body, &mut pos)?;
                let query = read_document(body, &mut pos)?;
                let fields = if pos < body.len() {
                    Some(read_document(body, &mut pos)?)
                } else {
                    None
                };
                Request::Query(Query {
                    flags,
                    namespace,
                    skip,
                    number_to_return,
                    query,
                    fields,
                })
            }
            OpCode::GetMore => {
                read_i32(body, &mut pos)?;
                let namespace = read_cstring(body, &mut pos)?;
                let number_to_return = read_i32(body, &mut pos)?;
                let cursor_id = read_i64(body, &mut pos)?;
                Request::GetMore(GetMore {
                    namespace,
                    number_to_return,
                    cursor_id,
                })
            }
            OpCode::KillCursors => {
                read_i32(body, &mut pos)?;
                let count = read_i32(body, &mut pos)?;
                let remaining = (body.len() - pos) / 8;
                let mut cursor_ids = Vec::with_capacity((count.max(0) as usize).min(remaining));
                for _ in 0..count {
                    cursor_ids.push(read_i64(body, &mut pos)?);
                }
                Request::KillCursors(KillCursors { cursor_ids })
            }
            OpCode::Insert => {
                let flags = read_i32(body, &mut pos)?;
                let namespace = read_cstring(body, &mut pos)?;
                let mut documents = Vec::new();
                while pos < body.len() {
                    documents.push(read_document(body, &mut pos)?);
                }
                Request::Insert(Insert {
                    continue_on_error: flags & 1 == 1,
                    namespace,
                    documents,
                })
            }
            OpCode::Update => {
                read_i32(body, &mut pos)?;
                let namespace = read_cstring(body, &mut pos)?;
                let flags = read_i32(body, &mut pos)?;
                let selector = read_document(body, &mut pos)?;
                let update = read_document(body, &mut pos)?;
                Request::Update(Update {
                    namespace,
                    upsert: flags & 1 == 1,
                    multi: flags & 2 == 2,
                    selector,
                    update,
                })
            }
            OpCode::Delete => {
                read_i32(body, &mut pos)?;
                let namespace = read_cstring(body, &mut pos)?;
                let flags = read_i32(body, &mut pos)?;
                let selector = read_document(body, &mut pos)?;
                Request::Delete(Delete {
                    namespace,
                    single_remove: flags & 1 == 1,
                    selector,
                })
            }
            OpCode::Reply => {
                return Err(DriverError::Protocol("OP_REPLY is not a request".to_string()));
            }
        };
        Ok(request)
    }
}

// ── Reply ────────────────────────────────────────────────────────────

/// OP_REPLY: the server's answer to OP_QUERY / OP_GET_MORE, and each pushed
/// batch of an exhaust stream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Reply {
    /// Server-assigned id of this reply; the next exhaust batch answers it.
    pub request_id: i32,
    pub response_to: i32,
    pub flags: ReplyFlags,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

impl Reply {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            documents,
            ..Self::default()
        }
    }

    pub fn decode(header: &MessageHeader, body: &[u8]) -> Result<Self> {
        if header.op_code != OpCode::Reply {
            return Err(DriverError::Protocol(format!(
                "expected OP_REPLY, got {:?}",
                header.op_code
            )));
        }
        let mut pos = 0;
        let flags = ReplyFlags(read_i32(body, &mut pos)? as u32);
        let cursor_id = read_i64(body, &mut pos)?;
        let starting_from = read_i32(body, &mut pos)?;
        let number_returned = read_i32(body, &mut pos)?;
        if number_returned < 0 {
            return Err(DriverError::Protocol(format!(
                "negative numberReturned {number_returned}"
            )));
        }
        // The smallest BSON document is 5 bytes.
        let capacity = (number_returned as usize).min((body.len() - pos) / 5);
        let mut documents = Vec::with_capacity(capacity);
        for _ in 0..number_returned {
            documents.push(read_document(body, &mut pos)?);
        }
        if pos != body.len() {
            return Err(DriverError::Protocol(format!(
                "{} trailing bytes after {number_returned} documents",
                body.len() - pos
            )));
        }
        Ok(Self {
            request_id: header.request_id,
            response_to: header.response_to,
            flags,
            cursor_id,
            starting_from,
            documents,
        })
    }

    /// Surface a server-reported query failure as `OperationFailure`.
    pub fn check(&self) -> Result<()> {
        if self.flags.contains(ReplyFlags::CURSOR_NOT_FOUND) {
            return Err(DriverError::operation("cursor not found", Some(43), None));
        }
        let first = self.documents.first();
        let has_err = first.is_some_and(|d| d.contains_key("$err"));
        if self.flags.contains(ReplyFlags::QUERY_FAILURE) || has_err {
            let message = first
                .and_then(|d| d.get_str("$err").ok())
                .unwrap_or("query failure")
                .to_string();
            let code = first.and_then(error_code);
            return Err(DriverError::operation(message, code, first.cloned()));
        }
        Ok(())
    }

    /// Encode as a full message; `request_id`/`response_to` come from `self`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(64);
        put_u32(&mut body, self.flags.0);
        put_i64(&mut body, self.cursor_id);
        put_i32(&mut body, self.starting_from);
        put_i32(&mut body, self.documents.len() as i32);
        for doc in &self.documents {
            put_document(&mut body, doc)?;
        }
        frame(self.request_id, self.response_to, OpCode::Reply, body)
    }
}

/// Numeric `code` field of a server error document.
pub fn error_code(doc: &Document) -> Option<i32> {
    match doc.get("code")? {
        Bson::Int32(n) => Some(*n),
        Bson::Int64(n) => i32::try_from(*n).ok(),
        Bson::Double(n) => Some(*n as i32),
        _ => None,
    }
}

// ── Encoding helpers ─────────────────────────────────────────────────

fn frame(request_id: i32, response_to: i32, op_code: OpCode, body: Vec<u8>) -> Result<Vec<u8>> {
    let length = HEADER_LEN + body.len();
    if length > MAX_MESSAGE_SIZE {
        return Err(DriverError::InvalidOperation(format!(
            "message of {length} bytes exceeds maximum of {MAX_MESSAGE_SIZE}"
        )));
    }
    let mut out = Vec::with_capacity(length);
    put_i32(&mut out, length as i32);
    put_i32(&mut out, request_id);
    put_i32(&mut out, response_to);
    put_i32(&mut out, op_code as i32);
    out.extend_from_slice(&body);
    Ok(out)
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_cstring(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(DriverError::InvalidOperation(format!(
            "namespace contains a NUL byte: {s:?}"
        )));
    }
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    Ok(())
}

fn put_document(buf: &mut Vec<u8>, doc: &Document) -> Result<()> {
    let bytes = bson::to_vec(doc).map_err(|e| DriverError::Bson(e.to_string()))?;
    buf.extend_from_slice(&bytes);
    Ok(())
}

// ── Decoding helpers ─────────────────────────────────────────────────

fn truncated(what: &str) -> DriverError {
    DriverError::Protocol(format!("message truncated while reading {what}"))
}

fn read_i32(buf: &[u8], pos: &mut usize) -> Result<i32> {
    let bytes = buf.get(*pos..*pos + 4).ok_or_else(|| truncated("int32"))?;
    *pos += 4;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_i64(buf: &[u8], pos: &mut usize) -> Result<i64> {
    let bytes = buf.get(*pos..*pos + 8).ok_or_else(|| truncated("int64"))?;
    *pos += 8;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(i64::from_le_bytes(raw))
}

fn read_cstring(buf: &[u8], pos: &mut usize) -> Result<String> {
    let rest = buf.get(*pos..).ok_or_else(|| truncated("cstring"))?;
    let nul = rest
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| truncated("cstring"))?;
    let s = std::str::from_utf8(&rest[..nul])
        .map_err(|e| DriverError::Protocol(format!("cstring is not utf-8: {e}")))?
        .to_string();
    *pos += nul + 1;
    Ok(s)
}

fn read_document(buf: &[u8], pos: &mut usize) -> Result<Document> {
    let start = *pos;
    let len = read_i32(buf, pos)?;
    if len < 5 {
        return Err(DriverError::Protocol(format!("invalid document length {len}")));
    }
    let end = start + len as usize;
    let bytes = buf.get(start..end).ok_or_else(|| truncated("document"))?;
    let doc = bson::from_slice::<Document>(bytes)
        .map_err(|e| DriverError::Protocol(format!("invalid bson document: {e}")))?;
    *pos = end;
    Ok(doc)
}
