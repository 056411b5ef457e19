use bson::spec::BinarySubtype;
use bson::{Document, doc};
use tidepool_core::{Result, UuidRepresentation, WriteConcern};

use crate::client::Client;
use crate::collection::Collection;

/// Per-database overrides. Unset fields inherit from the client when the
/// database handle is created.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DatabaseOptions {
    pub write_concern: Option<WriteConcern>,
    pub uuid_representation: Option<UuidRepresentation>,
}

/// A database on the client's primary server.
#[derive(Clone, Debug)]
pub struct Database {
    client: Client,
    name: String,
    write_concern: WriteConcern,
    uuid_representation: UuidRepresentation,
}

impl Database {
    pub(crate) fn new(client: Client, name: &str, options: DatabaseOptions) -> Self {
        let write_concern = options
            .write_concern
            .unwrap_or_else(|| client.write_concern().clone());
        let uuid_representation = options
            .uuid_representation
            .unwrap_or_else(|| client.uuid_representation());
        Self {
            client,
            name: name.to_string(),
            write_concern,
            uuid_representation,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn write_concern(&self) -> &WriteConcern {
        &self.write_concern
    }

    pub fn uuid_representation(&self) -> UuidRepresentation {
        self.uuid_representation
    }

    pub fn uuid_subtype(&self) -> BinarySubtype {
        self.uuid_representation.binary_subtype()
    }

    pub async fn command(&self, command: Document) -> Result<Document> {
        self.client.command(&self.name, command).await
    }

    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(self, name)
    }

    /// Names of the collections in this database.
    pub async fn collection_names(&self) -> Result<Vec<String>> {
        let result = self
            .client
            .read_command(&self.name, doc! { "listCollections": 1, "nameOnly": true })
            .await?;
        let batch = result
            .get_document("cursor")
            .and_then(|c| c.get_array("firstBatch"))
            .map(|b| b.as_slice())
            .unwrap_or_default();
        Ok(batch
            .iter()
            .filter_map(|c| c.as_document())
            .filter_map(|c| c.get_str("name").ok())
            .map(str::to_string)
            .collect())
    }

    pub async fn drop(&self) -> Result<()> {
        self.client.drop_database(self).await
    }
}

impl AsRef<str> for Database {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

