//! The client: owns the primary pool and runs commands against it.

use std::sync::Arc;
use std::time::Duration;

use bson::spec::BinarySubtype;
use bson::{Document, doc};
use parking_lot::Mutex;
use tidepool_core::{ClientOptions, DriverError, Result, UuidRepresentation, WriteConcern};
use tokio::task::JoinHandle;

use crate::connection::{Connector, TcpConnector};
use crate::database::{Database, DatabaseOptions};
use crate::executor::Executor;
use crate::operation::{Operation, command_result};
use crate::pool::{Pool, PoolOptions};

const MIN_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(10);

struct Primary {
    executor: Executor,
    maintenance: Option<JoinHandle<()>>,
}

struct ClientInner {
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    primary: Mutex<Option<Primary>>,
    /// Serializes `open` so concurrent callers share one discovery.
    open_lock: tokio::sync::Mutex<()>,
    uuid_representation: Mutex<UuidRepresentation>,
}

/// Handle to a MongoDB deployment. Cheap to clone; clones share the pool.
///
/// Construction validates options and never touches the network. The first
/// operation (or an explicit [`open`](Client::open)) connects.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("hosts", &self.inner.options.hosts)
            .field("open", &self.primary_pool().is_some())
            .finish()
    }
}

impl Client {
    pub fn new(options: ClientOptions) -> Result<Self> {
        options.validate()?;
        let connector = Arc::new(TcpConnector::new(&options)?);
        Self::with_connector(options, connector)
    }

    /// Parse `uri` and build a client. Fails with a configuration error on a
    /// bad connection string.
    pub fn with_uri_str(uri: &str) -> Result<Self> {
        Self::new(ClientOptions::parse(uri)?)
    }

    /// Build a client that opens connections through `connector`.
    pub fn with_connector(options: ClientOptions, connector: Arc<dyn Connector>) -> Result<Self> {
        options.validate()?;
        let uuid_representation = options.uuid_representation;
        Ok(Self {
            inner: Arc::new(ClientInner {
                options,
                connector,
                primary: Mutex::new(None),
                open_lock: tokio::sync::Mutex::new(()),
                uuid_representation: Mutex::new(uuid_representation),
            }),
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn max_pool_size(&self) -> u32 {
        self.inner.options.max_pool_size
    }

    pub fn write_concern(&self) -> &WriteConcern {
        &self.inner.options.write_concern
    }

    pub fn uuid_representation(&self) -> UuidRepresentation {
        *self.inner.uuid_representation.lock()
    }

    pub fn set_uuid_representation(&self, representation: UuidRepresentation) {
        *self.inner.uuid_representation.lock() = representation;
    }

    /// Binary subtype used for UUIDs under the current representation.
    pub fn uuid_subtype(&self) -> BinarySubtype {
        self.uuid_representation().binary_subtype()
    }

    /// The pool of the server chosen by [`open`](Client::open), if open.
    pub fn primary_pool(&self) -> Option<Pool> {
        self.inner
            .primary
            .lock()
            .as_ref()
            .map(|p| p.executor.pool().clone())
    }

    fn primary_executor(&self) -> Option<Executor> {
        self.inner.primary.lock().as_ref().map(|p| p.executor.clone())
    }

    /// Connect to the first seed that reports itself primary. Idempotent;
    /// concurrent calls share one attempt. Returns a handle to this client.
    pub async fn open(&self) -> Result<Client> {
        self.executor().await?;
        Ok(self.clone())
    }

    /// Whether `other` is a handle to the same client.
    pub fn ptr_eq(&self, other: &Client) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Executor for the primary pool, opening the client if needed.
    pub(crate) async fn executor(&self) -> Result<Executor> {
        if let Some(executor) = self.primary_executor() {
            return Ok(executor);
        }
        let _guard = self.inner.open_lock.lock().await;
        if let Some(executor) = self.primary_executor() {
            return Ok(executor);
        }

        let executor = self.discover().await?;
        let maintenance = self.inner.options.max_idle_time.map(|max_idle| {
            executor
                .pool()
                .spawn_maintenance((max_idle / 2).max(MIN_MAINTENANCE_INTERVAL))
        });
        *self.inner.primary.lock() = Some(Primary {
            executor: executor.clone(),
            maintenance,
        });
        Ok(executor)
    }

    async fn discover(&self) -> Result<Executor> {
        let options = &self.inner.options;
        let mut last_err = None;

        for address in &options.hosts {
            let pool = Pool::new(
                address.clone(),
                PoolOptions::from_client_options(options),
                Arc::clone(&self.inner.connector),
            );
            let executor = Executor::new(pool, options.socket_timeout);

            match self.handshake(&executor).await {
                Ok(true) => {
                    tracing::info!(address = %address, "connected to primary");
                    return Ok(executor);
                }
                Ok(false) => {
                    tracing::info!(address = %address, "server is not primary, trying next seed");
                    last_err = Some(DriverError::ConnectionFailure(format!(
                        "{address} is not primary"
                    )));
                }
                Err(err) => {
                    tracing::warn!(address = %address, error = %err, "seed unreachable");
                    last_err = Some(err);
                }
            }
            executor.pool().close_all();
        }

        Err(last_err.unwrap_or_else(|| DriverError::config("no hosts to connect to")))
    }

    async fn handshake(&self, executor: &Executor) -> Result<bool> {
        let command = doc! {
            "ismaster": 1,
            "client": self.inner.options.handshake_metadata(),
        };
        let reply = executor
            .execute(&Operation::command("admin", command))
            .await?
            .ok_or_else(|| DriverError::Protocol("handshake produced no reply".to_string()))?;
        let result = command_result(reply)?;
        Ok(result.get_bool("ismaster").unwrap_or(false))
    }

    /// Close the primary pool. A later operation reopens lazily.
    pub fn close(&self) {
        let primary = self.inner.primary.lock().take();
        if let Some(primary) = primary {
            if let Some(task) = primary.maintenance {
                task.abort();
            }
            primary.executor.pool().close_all();
        }
    }

    /// Run `command` against database `db`.
    pub async fn command(&self, db: &str, command: Document) -> Result<Document> {
        self.run(Operation::command(db, command)).await
    }

    /// Like [`command`](Client::command), retried once on a transport error.
    /// For reads and idempotent commands only.
    pub(crate) async fn read_command(&self, db: &str, command: Document) -> Result<Document> {
        self.run(Operation::command(db, command).retryable(true)).await
    }

    pub(crate) async fn run(&self, op: Operation) -> Result<Document> {
        let executor = self.executor().await?;
        let reply = executor
            .execute(&op)
            .await?
            .ok_or_else(|| DriverError::Protocol("command produced no reply".to_string()))?;
        command_result(reply)
    }

    /// Names of all databases on the server.
    pub async fn database_names(&self) -> Result<Vec<String>> {
        let result = self.read_command("admin", doc! { "listDatabases": 1 }).await?;
        let databases = result
            .get_array("databases")
            .map_err(|e| DriverError::Protocol(format!("listDatabases reply: {e}")))?;
        Ok(databases
            .iter()
            .filter_map(|db| db.as_document())
            .filter_map(|db| db.get_str("name").ok())
            .map(str::to_string)
            .collect())
    }

    pub async fn drop_database(&self, name: impl AsRef<str>) -> Result<()> {
        self.command(name.as_ref(), doc! { "dropDatabase": 1 }).await?;
        Ok(())
    }

    /// The server's `buildinfo` document.
    pub async fn server_info(&self) -> Result<Document> {
        self.read_command("admin", doc! { "buildinfo": 1 }).await
    }

    pub fn database(&self, name: &str) -> Database {
        self.database_with_options(name, DatabaseOptions::default())
    }

    /// A database handle with its own write concern or UUID representation.
    pub fn database_with_options(&self, name: &str, options: DatabaseOptions) -> Database {
        Database::new(self.clone(), name, options)
    }

    /// The database named in the connection string, if any.
    pub fn default_database(&self) -> Option<Database> {
        self.inner
            .options
            .default_database
            .as_deref()
            .map(|name| self.database(name))
    }
}
