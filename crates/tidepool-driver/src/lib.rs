//! tidepool-driver — asynchronous MongoDB driver core.
//!
//! - **wire**: legacy wire protocol framing (OP_QUERY / OP_REPLY family)
//! - **connection**: TCP, TLS, and Unix-domain sockets to one server
//! - **pool**: bounded per-server connection pool
//! - **supervisor**: deadlines, I/O error classification, connection fate
//! - **operation** / **executor**: logical requests and their execution
//! - **exhaust**: exhaust-cursor state machine
//! - **cursor**: regular and exhaust query cursors
//! - **client** / **database** / **collection**: the caller-facing API
//! - **adapters**: blocking and callback wrappers

pub mod adapters;
pub mod client;
pub mod collection;
pub mod connection;
pub mod cursor;
pub mod database;
pub mod exhaust;
pub mod executor;
pub mod operation;
pub mod pool;
pub mod supervisor;
pub mod wire;

pub use adapters::{BlockingClient, with_callback};
pub use client::Client;
pub use collection::{Collection, UpdateOptions, UpdateResult};
pub use connection::{Connection, Connector, TcpConnector};
pub use cursor::{Cursor, FindOptions};
pub use database::{Database, DatabaseOptions};
pub use exhaust::{ExhaustCursor, ExhaustState};
pub use executor::Executor;
pub use operation::{Operation, ResponseShape};
pub use pool::{Pool, PoolOptions, PoolStats, PooledConnection};
pub use tidepool_core::{
    Acknowledgment, ClientOptions, DriverError, LivenessCheck, Result, ServerAddress, UuidRepresentation,
    WriteConcern,
};
