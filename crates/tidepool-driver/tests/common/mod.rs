//! In-process MongoDB stand-in for the integration tests.
//!
//! `MockMongo` speaks the legacy wire protocol over real TCP and keeps its
//! data in memory. It understands the handful of commands the driver sends,
//! plain and exhaust queries, OP_GET_MORE, OP_KILL_CURSORS and the three
//! unacknowledged write opcodes. Faults queued with [`MockMongo::inject`]
//! are consumed by the next request that expects a reply, so tests call
//! `client.open()` first to keep the handshake out of the way.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use bson::oid::ObjectId;
use bson::{Bson, Document, doc};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use tidepool_driver::ServerAddress;
use tidepool_driver::wire::{
    Delete, GetMore, HEADER_LEN, Insert, MessageHeader, Query, QueryFlags, Reply, ReplyFlags,
    Request, Update,
};

// ── Tracing setup ────────────────────────────────────────────────

static TRACING_INIT: Once = Once::new();

/// Route driver logs to the test harness. Filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ── Faults ───────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub enum Fault {
    /// Answer with the QueryFailure flag and this `$err`.
    QueryFailure(String),
    /// Close the socket without answering.
    HangUp,
    /// Never answer.
    Stall,
    /// Push this many exhaust batches, then close the socket.
    HangUpMidStream(usize),
    /// Push this many exhaust batches, then a QueryFailure reply.
    ErrorMidStream(usize, String),
}

enum Ending {
    Keep,
    HangUp,
    Stall,
}

// ── Server state ─────────────────────────────────────────────────

type Collections = BTreeMap<String, Vec<Document>>;

struct State {
    primary: bool,
    databases: BTreeMap<String, Collections>,
    cursors: HashMap<i64, VecDeque<Document>>,
    next_cursor_id: i64,
    killed_cursors: usize,
    faults: VecDeque<Fault>,
    commands: Vec<String>,
}

struct Shared {
    state: Mutex<State>,
    connections: AtomicUsize,
    requests: AtomicUsize,
    next_reply_id: AtomicI32,
    disconnect: Notify,
}

pub struct MockMongo {
    port: u16,
    shared: Arc<Shared>,
    accept: JoinHandle<()>,
}

impl Drop for MockMongo {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

impl MockMongo {
    /// Start a server that reports itself primary.
    pub async fn start() -> Self {
        Self::spawn(true).await
    }

    /// Start a server that answers `ismaster: false`.
    pub async fn start_secondary() -> Self {
        Self::spawn(false).await
    }

    async fn spawn(primary: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
        let port = listener.local_addr().expect("local addr").port();
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                primary,
                databases: BTreeMap::new(),
                cursors: HashMap::new(),
                next_cursor_id: 1000,
                killed_cursors: 0,
                faults: VecDeque::new(),
                commands: Vec::new(),
            }),
            connections: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            next_reply_id: AtomicI32::new(1),
            disconnect: Notify::new(),
        });

        let accept_shared = Arc::clone(&shared);
        let accept = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accept_shared.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(Arc::clone(&accept_shared), socket));
            }
        });

        Self { port, shared, accept }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> ServerAddress {
        ServerAddress::tcp("127.0.0.1", self.port)
    }

    pub fn uri(&self) -> String {
        format!("mongodb://127.0.0.1:{}/", self.port)
    }

    /// URI with a query string, e.g. `uri_with("maxPoolSize=2")`.
    pub fn uri_with(&self, options: &str) -> String {
        format!("mongodb://127.0.0.1:{}/?{options}", self.port)
    }

    pub fn set_primary(&self, primary: bool) {
        self.shared.state.lock().primary = primary;
    }

    pub fn inject(&self, fault: Fault) {
        self.shared.state.lock().faults.push_back(fault);
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Messages received so far, replies expected or not.
    pub fn requests(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }

    pub fn killed_cursors(&self) -> usize {
        self.shared.state.lock().killed_cursors
    }

    pub fn open_cursors(&self) -> usize {
        self.shared.state.lock().cursors.len()
    }

    /// Close every open client socket. Idle pooled connections go dead.
    pub fn disconnect_all(&self) {
        self.shared.disconnect.notify_waiters();
    }

    /// Drop every server-side cursor, as a server restart or cursor timeout would.
    pub fn forget_cursors(&self) {
        self.shared.state.lock().cursors.clear();
    }

    /// Names of the commands run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.shared.state.lock().commands.clone()
    }

    pub fn seed(&self, db: &str, collection: &str, documents: Vec<Document>) {
        self.shared
            .state
            .lock()
            .collection_mut(db, collection)
            .extend(documents);
    }

    pub fn documents(&self, db: &str, collection: &str) -> Vec<Document> {
        self.shared
            .state
            .lock()
            .databases
            .get(db)
            .and_then(|c| c.get(collection))
            .cloned()
            .unwrap_or_default()
    }

    pub fn database_exists(&self, db: &str) -> bool {
        self.shared.state.lock().databases.contains_key(db)
    }
}

/// Seed documents `{ _id: i, n: i }` for `i` in `0..count`.
pub fn numbered(count: i32) -> Vec<Document> {
    (0..count).map(|i| doc! { "_id": i, "n": i }).collect()
}

// ── Connection handling ──────────────────────────────────────────

async fn read_request(socket: &mut TcpStream) -> Option<(MessageHeader, Request)> {
    let mut raw = [0u8; HEADER_LEN];
    socket.read_exact(&mut raw).await.ok()?;
    let header = MessageHeader::parse(&raw).ok()?;
    let mut body = vec![0u8; header.body_len()];
    socket.read_exact(&mut body).await.ok()?;
    let request = Request::decode(&header, &body).ok()?;
    Some((header, request))
}

async fn serve(shared: Arc<Shared>, mut socket: TcpStream) {
    loop {
        let next = tokio::select! {
            next = read_request(&mut socket) => next,
            _ = shared.disconnect.notified() => return,
        };
        let Some((header, request)) = next else {
            return;
        };
        shared.requests.fetch_add(1, Ordering::SeqCst);
        if !request.expects_reply() {
            shared.state.lock().apply_write(request);
            continue;
        }

        let (replies, ending) = shared.plan(&request);
        let mut response_to = header.request_id;
        for mut reply in replies {
            reply.request_id = shared.next_reply_id.fetch_add(1, Ordering::SeqCst);
            reply.response_to = response_to;
            response_to = reply.request_id;
            let Ok(bytes) = reply.encode() else {
                return;
            };
            if socket.write_all(&bytes).await.is_err() {
                return;
            }
        }

        match ending {
            Ending::Keep => {}
            Ending::HangUp => return,
            Ending::Stall => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                return;
            }
        }
    }
}

impl Shared {
    fn plan(&self, request: &Request) -> (Vec<Reply>, Ending) {
        let mut state = self.state.lock();
        match state.faults.pop_front() {
            None => (state.respond(request), Ending::Keep),
            Some(Fault::HangUp) => (Vec::new(), Ending::HangUp),
            Some(Fault::Stall) => (Vec::new(), Ending::Stall),
            Some(Fault::QueryFailure(message)) => (vec![query_failure(&message)], Ending::Keep),
            Some(Fault::HangUpMidStream(batches)) => {
                let mut replies = state.respond(request);
                replies.truncate(batches);
                (replies, Ending::HangUp)
            }
            Some(Fault::ErrorMidStream(batches, message)) => {
                let mut replies = state.respond(request);
                replies.truncate(batches);
                replies.push(query_failure(&message));
                (replies, Ending::Keep)
            }
        }
    }
}

fn query_failure(message: &str) -> Reply {
    Reply {
        flags: ReplyFlags::QUERY_FAILURE,
        documents: vec![doc! { "$err": message, "code": 2 }],
        ..Reply::default()
    }
}

fn split_namespace(namespace: &str) -> (&str, &str) {
    namespace.split_once('.').unwrap_or((namespace, ""))
}

fn batch_size(number_to_return: i32) -> (usize, bool) {
    match number_to_return {
        0 => (101, false),
        1 => (1, true),
        n if n < 0 => (n.unsigned_abs() as usize, true),
        n => (n as usize, false),
    }
}

fn ok(mut body: Document) -> Document {
    body.insert("ok", 1.0);
    body
}

fn failure(message: &str, code: i32) -> Document {
    doc! { "ok": 0.0, "errmsg": message, "code": code }
}

fn matches(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, value)| document.get(key) == Some(value))
}

fn add(current: Option<&Bson>, delta: &Bson) -> Bson {
    match (current, delta) {
        (Some(Bson::Int32(a)), Bson::Int32(b)) => Bson::Int32(a + b),
        (Some(Bson::Int64(a)), Bson::Int64(b)) => Bson::Int64(a + b),
        (Some(Bson::Int32(a)), Bson::Int64(b)) => Bson::Int64(i64::from(*a) + b),
        (Some(Bson::Int64(a)), Bson::Int32(b)) => Bson::Int64(a + i64::from(*b)),
        (Some(Bson::Double(a)), Bson::Double(b)) => Bson::Double(a + b),
        (None, delta) => delta.clone(),
        (Some(other), _) => other.clone(),
    }
}

fn apply_update(document: &Document, update: &Document) -> Document {
    let is_operator = update.keys().next().is_some_and(|k| k.starts_with('$'));
    if !is_operator {
        let mut replaced = Document::new();
        if let Some(id) = document.get("_id") {
            replaced.insert("_id", id.clone());
        }
        for (key, value) in update {
            if key != "_id" {
                replaced.insert(key.clone(), value.clone());
            }
        }
        return replaced;
    }

    let mut updated = document.clone();
    if let Ok(fields) = update.get_document("$set") {
        for (key, value) in fields {
            updated.insert(key.clone(), value.clone());
        }
    }
    if let Ok(fields) = update.get_document("$inc") {
        for (key, delta) in fields {
            let next = add(updated.get(key), delta);
            updated.insert(key.clone(), next);
        }
    }
    if let Ok(fields) = update.get_document("$unset") {
        for key in fields.keys() {
            updated.remove(key);
        }
    }
    updated
}

struct UpdateOutcome {
    matched: i32,
    modified: i32,
    upserted: Option<Bson>,
}

impl State {
    fn collection_mut(&mut self, db: &str, collection: &str) -> &mut Vec<Document> {
        self.databases
            .entry(db.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default()
    }

    fn collection(&self, db: &str, collection: &str) -> Vec<Document> {
        self.databases
            .get(db)
            .and_then(|c| c.get(collection))
            .cloned()
            .unwrap_or_default()
    }

    fn respond(&mut self, request: &Request) -> Vec<Reply> {
        match request {
            Request::Query(q) if q.namespace.ends_with(".$cmd") => {
                let (db, _) = split_namespace(&q.namespace);
                let db = db.to_string();
                vec![Reply::new(vec![self.command(&db, &q.query)])]
            }
            Request::Query(q) if q.flags.contains(QueryFlags::EXHAUST) => self.exhaust(q),
            Request::Query(q) => vec![self.find(q)],
            Request::GetMore(g) => vec![self.get_more(g)],
            _ => Vec::new(),
        }
    }

    fn select(&self, q: &Query) -> Vec<Document> {
        let (db, collection) = split_namespace(&q.namespace);
        self.collection(db, collection)
            .into_iter()
            .filter(|d| matches(d, &q.query))
            .skip(q.skip.max(0) as usize)
            .collect()
    }

    fn find(&mut self, q: &Query) -> Reply {
        let mut remaining: VecDeque<Document> = self.select(q).into();
        let (batch, single) = batch_size(q.number_to_return);
        let documents: Vec<Document> = remaining.drain(..batch.min(remaining.len())).collect();

        let mut cursor_id = 0;
        if !single && !remaining.is_empty() {
            cursor_id = self.next_cursor_id;
            self.next_cursor_id += 1;
            self.cursors.insert(cursor_id, remaining);
        }
        Reply {
            cursor_id,
            documents,
            ..Reply::default()
        }
    }

    fn exhaust(&mut self, q: &Query) -> Vec<Reply> {
        let documents = self.select(q);
        let (batch, _) = batch_size(q.number_to_return.max(0));
        let cursor_id = self.next_cursor_id;
        self.next_cursor_id += 1;

        let chunks: Vec<Vec<Document>> = documents.chunks(batch).map(<[Document]>::to_vec).collect();
        if chunks.is_empty() {
            return vec![Reply::default()];
        }
        let last = chunks.len() - 1;
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, documents)| Reply {
                cursor_id: if i == last { 0 } else { cursor_id },
                documents,
                ..Reply::default()
            })
            .collect()
    }

    fn get_more(&mut self, g: &GetMore) -> Reply {
        let Some(remaining) = self.cursors.get_mut(&g.cursor_id) else {
            return Reply {
                flags: ReplyFlags::CURSOR_NOT_FOUND,
                ..Reply::default()
            };
        };
        let (batch, _) = batch_size(g.number_to_return.max(0));
        let documents: Vec<Document> = remaining.drain(..batch.min(remaining.len())).collect();
        let mut cursor_id = g.cursor_id;
        if remaining.is_empty() {
            self.cursors.remove(&g.cursor_id);
            cursor_id = 0;
        }
        Reply {
            cursor_id,
            documents,
            ..Reply::default()
        }
    }

    fn apply_write(&mut self, request: Request) {
        match request {
            Request::Insert(Insert {
                namespace,
                documents,
                ..
            }) => {
                let (db, collection) = split_namespace(&namespace);
                let (db, collection) = (db.to_string(), collection.to_string());
                for document in documents {
                    let _ = self.insert(&db, &collection, document);
                }
            }
            Request::Update(Update {
                namespace,
                upsert,
                multi,
                selector,
                update,
            }) => {
                let (db, collection) = split_namespace(&namespace);
                let (db, collection) = (db.to_string(), collection.to_string());
                self.update(&db, &collection, &selector, &update, upsert, multi);
            }
            Request::Delete(Delete {
                namespace,
                single_remove,
                selector,
            }) => {
                let (db, collection) = split_namespace(&namespace);
                let (db, collection) = (db.to_string(), collection.to_string());
                self.delete(&db, &collection, &selector, single_remove);
            }
            Request::KillCursors(k) => {
                for id in &k.cursor_ids {
                    self.cursors.remove(id);
                }
                self.killed_cursors += k.cursor_ids.len();
            }
            Request::Query(_) | Request::GetMore(_) => {}
        }
    }

    /// Returns `false` on a duplicate `_id`.
    fn insert(&mut self, db: &str, collection: &str, document: Document) -> bool {
        let documents = self.collection_mut(db, collection);
        if let Some(id) = document.get("_id") {
            if documents.iter().any(|d| d.get("_id") == Some(id)) {
                return false;
            }
        }
        documents.push(document);
        true
    }

    fn update(
        &mut self,
        db: &str,
        collection: &str,
        selector: &Document,
        update: &Document,
        upsert: bool,
        multi: bool,
    ) -> UpdateOutcome {
        let documents = self.collection_mut(db, collection);
        let mut outcome = UpdateOutcome {
            matched: 0,
            modified: 0,
            upserted: None,
        };
        for document in documents.iter_mut().filter(|d| matches(d, selector)) {
            outcome.matched += 1;
            let updated = apply_update(document, update);
            if updated != *document {
                outcome.modified += 1;
                *document = updated;
            }
            if !multi {
                break;
            }
        }

        if outcome.matched == 0 && upsert {
            let base: Document = selector
                .iter()
                .filter(|(k, _)| !k.starts_with('$'))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let mut created = apply_update(&base, update);
            let id = match created.get("_id").cloned() {
                Some(id) => id,
                None => {
                    let id = Bson::ObjectId(ObjectId::new());
                    created.insert("_id", id.clone());
                    id
                }
            };
            documents.push(created);
            outcome.upserted = Some(id);
        }
        outcome
    }

    fn delete(&mut self, db: &str, collection: &str, selector: &Document, single: bool) -> i32 {
        let documents = self.collection_mut(db, collection);
        let mut removed = 0;
        documents.retain(|d| {
            if (single && removed > 0) || !matches(d, selector) {
                return true;
            }
            removed += 1;
            false
        });
        removed
    }

    fn command(&mut self, db: &str, command: &Document) -> Document {
        let Some(name) = command.keys().next().map(|k| k.to_string()) else {
            return failure("empty command", 59);
        };
        self.commands.push(name.clone());

        match name.to_ascii_lowercase().as_str() {
            "ismaster" | "hello" => ok(doc! {
                "ismaster": self.primary,
                "maxWireVersion": 5,
                "maxBsonObjectSize": 16 * 1024 * 1024,
            }),
            "ping" => ok(doc! {}),
            "buildinfo" => ok(doc! { "version": "3.4.24", "versionArray": [3, 4, 24, 0] }),
            "listdatabases" => {
                let databases: Vec<Document> = self
                    .databases
                    .keys()
                    .map(|name| doc! { "name": name.as_str(), "sizeOnDisk": 1.0, "empty": false })
                    .collect();
                ok(doc! { "databases": databases, "totalSize": 1.0 })
            }
            "dropdatabase" => {
                self.databases.remove(db);
                ok(doc! { "dropped": db })
            }
            "drop" => {
                let collection = command.get_str(&name).unwrap_or_default();
                let removed = self
                    .databases
                    .get_mut(db)
                    .and_then(|c| c.remove(collection))
                    .is_some();
                if removed {
                    ok(doc! { "ns": format!("{db}.{collection}") })
                } else {
                    failure("ns not found", 26)
                }
            }
            "insert" => self.insert_command(db, &name, command),
            "update" => self.update_command(db, &name, command),
            "delete" => self.delete_command(db, &name, command),
            "count" => {
                let collection = command.get_str(&name).unwrap_or_default();
                let filter = command.get_document("query").cloned().unwrap_or_default();
                let n = self
                    .collection(db, collection)
                    .iter()
                    .filter(|d| matches(d, &filter))
                    .count();
                ok(doc! { "n": n as i32 })
            }
            "listcollections" => {
                let batch: Vec<Document> = self
                    .databases
                    .get(db)
                    .map(|c| c.keys().map(|name| doc! { "name": name.as_str() }).collect())
                    .unwrap_or_default();
                ok(doc! {
                    "cursor": {
                        "id": 0_i64,
                        "ns": format!("{db}.$cmd.listCollections"),
                        "firstBatch": batch,
                    }
                })
            }
            _ => failure(&format!("no such command: '{name}'"), 59),
        }
    }

    fn insert_command(&mut self, db: &str, name: &str, command: &Document) -> Document {
        let collection = command.get_str(name).unwrap_or_default().to_string();
        let documents = command.get_array("documents").cloned().unwrap_or_default();
        let mut inserted = 0;
        let mut write_errors = Vec::new();
        for (index, document) in documents.into_iter().enumerate() {
            let Bson::Document(document) = document else {
                continue;
            };
            if self.insert(db, &collection, document) {
                inserted += 1;
            } else {
                write_errors.push(doc! {
                    "index": index as i32,
                    "code": 11000,
                    "errmsg": "E11000 duplicate key error",
                });
                break;
            }
        }
        let mut reply = doc! { "n": inserted };
        if !write_errors.is_empty() {
            reply.insert("writeErrors", write_errors);
        }
        ok(reply)
    }

    fn update_command(&mut self, db: &str, name: &str, command: &Document) -> Document {
        let collection = command.get_str(name).unwrap_or_default().to_string();
        let updates = command.get_array("updates").cloned().unwrap_or_default();
        let (mut n, mut modified) = (0, 0);
        let mut upserted = Vec::new();
        for (index, entry) in updates.into_iter().enumerate() {
            let Bson::Document(entry) = entry else {
                continue;
            };
            let selector = entry.get_document("q").cloned().unwrap_or_default();
            let update = entry.get_document("u").cloned().unwrap_or_default();
            let upsert = entry.get_bool("upsert").unwrap_or(false);
            let multi = entry.get_bool("multi").unwrap_or(false);
            let outcome = self.update(db, &collection, &selector, &update, upsert, multi);
            n += outcome.matched;
            modified += outcome.modified;
            if let Some(id) = outcome.upserted {
                n += 1;
                upserted.push(doc! { "index": index as i32, "_id": id });
            }
        }
        let mut reply = doc! { "n": n, "nModified": modified };
        if !upserted.is_empty() {
            reply.insert("upserted", upserted);
        }
        ok(reply)
    }

    fn delete_command(&mut self, db: &str, name: &str, command: &Document) -> Document {
        let collection = command.get_str(name).unwrap_or_default().to_string();
        let deletes = command.get_array("deletes").cloned().unwrap_or_default();
        let mut n = 0;
        for entry in deletes {
            let Bson::Document(entry) = entry else {
                continue;
            };
            let selector = entry.get_document("q").cloned().unwrap_or_default();
            let single = matches!(entry.get("limit"), Some(Bson::Int32(1)) | Some(Bson::Int64(1)));
            n += self.delete(db, &collection, &selector, single);
        }
        ok(doc! { "n": n })
    }
}
