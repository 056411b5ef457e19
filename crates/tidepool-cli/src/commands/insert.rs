use anyhow::Context;
use bson::Bson;
use tidepool_driver::Client;

use super::parse_document;

pub async fn insert(client: &Client, db: &str, collection: &str, document: &str) -> anyhow::Result<()> {
    let document = parse_document(document)?;
    let id = client
        .database(db)
        .collection(collection)
        .insert_one(document)
        .await
        .with_context(|| format!("insert into {db}.{collection} failed"))?;

    println!("{}", Bson::into_relaxed_extjson(id));
    Ok(())
}
