//! Thin wrappers over the async API for callers that are not async.
//!
//! [`BlockingClient`] owns a tokio runtime and blocks the calling thread on
//! each operation. It must not be used from inside another runtime.
//! [`with_callback`] runs a driver future in the background and hands the
//! result to a callback.

use std::future::Future;

use bson::{Bson, Document};
use tidepool_core::{ClientOptions, DriverError, Result};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use crate::client::Client;
use crate::cursor::FindOptions;

/// Spawn `future` on the current runtime and pass its result to `callback`.
pub fn with_callback<T, F, C>(future: F, callback: C) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
    C: FnOnce(Result<T>) + Send + 'static,
{
    tokio::spawn(async move {
        callback(future.await);
    })
}

/// Blocking facade over [`Client`].
pub struct BlockingClient {
    runtime: Runtime,
    client: Client,
}

impl std::fmt::Debug for BlockingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingClient").field("client", &self.client).finish()
    }
}

impl BlockingClient {
    pub fn new(options: ClientOptions) -> Result<Self> {
        let client = Client::new(options)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("tidepool-blocking")
            .enable_all()
            .build()
            .map_err(|e| DriverError::InvalidOperation(format!("failed to start runtime: {e}")))?;
        Ok(Self { runtime, client })
    }

    pub fn with_uri_str(uri: &str) -> Result<Self> {
        Self::new(ClientOptions::parse(uri)?)
    }

    /// The async client this facade drives.
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn open(&self) -> Result<()> {
        self.runtime.block_on(self.client.open()).map(|_| ())
    }

    pub fn command(&self, db: &str, command: Document) -> Result<Document> {
        self.runtime.block_on(self.client.command(db, command))
    }

    pub fn database_names(&self) -> Result<Vec<String>> {
        self.runtime.block_on(self.client.database_names())
    }

    pub fn drop_database(&self, name: &str) -> Result<()> {
        self.runtime.block_on(self.client.drop_database(name))
    }

    pub fn insert_one(&self, db: &str, collection: &str, document: Document) -> Result<Bson> {
        let collection = self.client.database(db).collection(collection);
        self.runtime.block_on(collection.insert_one(document))
    }

    /// Run a find and collect every result.
    pub fn find_all(
        &self,
        db: &str,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> Result<Vec<Document>> {
        let collection = self.client.database(db).collection(collection);
        self.runtime.block_on(async {
            let mut cursor = collection.find(filter, options);
            let documents = cursor.collect().await;
            cursor.close().await;
            documents
        })
    }

    pub fn count(&self, db: &str, collection: &str, filter: Document) -> Result<u64> {
        let collection = self.client.database(db).collection(collection);
        self.runtime.block_on(collection.count(filter))
    }

    pub fn close(&self) {
        let _runtime = self.runtime.enter();
        self.client.close();
    }
}
