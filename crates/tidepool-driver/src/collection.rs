use bson::oid::ObjectId;
use bson::{Bson, Document, doc};
use tidepool_core::{DriverError, Result, UuidRepresentation, WriteConcern};

use crate::client::Client;
use crate::database::Database;
use crate::cursor::{Cursor, FindOptions};
use crate::operation::{Operation, read_count};

/// Server error code for "ns not found".
const NAMESPACE_NOT_FOUND: i32 = 26;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    pub upsert: bool,
    /// Update every matching document instead of the first.
    pub multi: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Bson>,
}

/// A collection within a database.
#[derive(Clone, Debug)]
pub struct Collection {
    client: Client,
    db: String,
    name: String,
    write_concern: WriteConcern,
    uuid_representation: UuidRepresentation,
}

impl Collection {
    pub(crate) fn new(database: &Database, name: &str) -> Self {
        Self {
            client: database.client().clone(),
            db: database.name().to_string(),
            name: name.to_string(),
            write_concern: database.write_concern().clone(),
            uuid_representation: database.uuid_representation(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database_name(&self) -> &str {
        &self.db
    }

    /// `<db>.<collection>`.
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.db, self.name)
    }

    /// Inherited from the database this handle was created from.
    pub fn write_concern(&self) -> &WriteConcern {
        &self.write_concern
    }

    pub fn uuid_representation(&self) -> UuidRepresentation {
        self.uuid_representation
    }

    fn acknowledged(&self) -> bool {
        self.write_concern.is_acknowledged()
    }

    fn with_write_concern(&self, mut command: Document) -> Document {
        if let Some(wc) = self.write_concern.to_document() {
            command.insert("writeConcern", wc);
        }
        command
    }

    /// Insert one document, assigning an `ObjectId` `_id` when missing.
    /// Returns the `_id`.
    pub async fn insert_one(&self, document: Document) -> Result<Bson> {
        let mut ids = self.insert_many(vec![document]).await?;
        ids.pop()
            .ok_or_else(|| DriverError::Protocol("insert returned no id".to_string()))
    }

    /// Insert documents in order. Returns their `_id`s.
    pub async fn insert_many(&self, documents: Vec<Document>) -> Result<Vec<Bson>> {
        if documents.is_empty() {
            return Err(DriverError::InvalidOperation(
                "insert_many requires at least one document".to_string(),
            ));
        }
        let mut ids = Vec::with_capacity(documents.len());
        let documents: Vec<Document> = documents
            .into_iter()
            .map(|mut doc| {
                let id = match doc.get("_id").cloned() {
                    Some(id) => id,
                    None => {
                        let id = Bson::ObjectId(ObjectId::new());
                        // `_id` first, as the server stores it.
                        let mut with_id = doc! { "_id": id.clone() };
                        with_id.extend(std::mem::take(&mut doc));
                        doc = with_id;
                        id
                    }
                };
                ids.push(id);
                doc
            })
            .collect();

        if !self.acknowledged() {
            let op = Operation::unacknowledged_insert(&self.namespace(), documents);
            self.client.executor().await?.execute(&op).await?;
            return Ok(ids);
        }

        let command = self.with_write_concern(doc! {
            "insert": self.name.as_str(),
            "documents": documents,
            "ordered": true,
        });
        self.client.command(&self.db, command).await?;
        Ok(ids)
    }

    pub async fn update(
        &self,
        filter: Document,
        update: Document,
        options: UpdateOptions,
    ) -> Result<UpdateResult> {
        if !self.acknowledged() {
            let op = Operation::unacknowledged_update(
                &self.namespace(),
                filter,
                update,
                options.upsert,
                options.multi,
            );
            self.client.executor().await?.execute(&op).await?;
            return Ok(UpdateResult::default());
        }

        let command = self.with_write_concern(doc! {
            "update": self.name.as_str(),
            "updates": [{
                "q": filter,
                "u": update,
                "upsert": options.upsert,
                "multi": options.multi,
            }],
            "ordered": true,
        });
        let result = self.client.command(&self.db, command).await?;

        let upserted_id = result
            .get_array("upserted")
            .ok()
            .and_then(|u| u.first())
            .and_then(|u| u.as_document())
            .and_then(|u| u.get("_id"))
            .cloned();
        Ok(UpdateResult {
            matched: read_count(&result, "n"),
            modified: read_count(&result, "nModified"),
            upserted_id,
        })
    }

    /// Remove every document matching `filter`. Returns the number removed.
    pub async fn remove(&self, filter: Document) -> Result<u64> {
        if !self.acknowledged() {
            let op = Operation::unacknowledged_delete(&self.namespace(), filter, false);
            self.client.executor().await?.execute(&op).await?;
            return Ok(0);
        }

        let command = self.with_write_concern(doc! {
            "delete": self.name.as_str(),
            "deletes": [{ "q": filter, "limit": 0 }],
            "ordered": true,
        });
        let result = self.client.command(&self.db, command).await?;
        Ok(read_count(&result, "n"))
    }

    /// Query the collection. No I/O happens until the cursor is first fetched.
    pub fn find(&self, filter: Document, options: FindOptions) -> Cursor {
        Cursor::new(self.client.clone(), &self.db, &self.name, filter, options)
    }

    pub async fn find_one(&self, filter: Document) -> Result<Option<Document>> {
        let options = FindOptions {
            limit: 1,
            ..FindOptions::default()
        };
        let mut cursor = self.find(filter, options);
        let doc = cursor.next().await?;
        cursor.close().await;
        Ok(doc)
    }

    pub async fn count(&self, filter: Document) -> Result<u64> {
        let result = self
            .client
            .read_command(&self.db, doc! { "count": self.name.as_str(), "query": filter })
            .await?;
        Ok(read_count(&result, "n"))
    }

    /// Drop the collection. Dropping a missing collection is not an error.
    pub async fn drop(&self) -> Result<()> {
        match self
            .client
            .command(&self.db, doc! { "drop": self.name.as_str() })
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.code() == Some(NAMESPACE_NOT_FOUND) => Ok(()),
            Err(err) if err.is_operation_failure() && err.to_string() == "ns not found" => Ok(()),
            Err(err) => Err(err),
        }
    }
}
