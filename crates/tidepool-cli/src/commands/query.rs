use anyhow::Context;
use tidepool_driver::{Client, FindOptions};

use super::{parse_document, to_json};

pub struct FindArgs {
    pub filter: String,
    pub exhaust: bool,
    pub limit: u32,
    pub batch_size: u32,
}

pub async fn find(client: &Client, db: &str, collection: &str, args: FindArgs) -> anyhow::Result<()> {
    let filter = parse_document(&args.filter)?;
    let options = FindOptions {
        exhaust: args.exhaust,
        limit: args.limit,
        batch_size: args.batch_size,
        ..FindOptions::default()
    };

    let mut cursor = client.database(db).collection(collection).find(filter, options);
    let mut printed = 0usize;
    let outcome = loop {
        match cursor.next().await {
            Ok(Some(doc)) => {
                println!("{}", serde_json::to_string(&to_json(doc))?);
                printed += 1;
            }
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        }
    };
    cursor.close().await;
    outcome.with_context(|| format!("query on {db}.{collection} failed after {printed} documents"))?;

    tracing::debug!(printed, exhaust = args.exhaust, "find complete");
    Ok(())
}

pub async fn count(client: &Client, db: &str, collection: &str, filter: &str) -> anyhow::Result<()> {
    let filter = parse_document(filter)?;
    let n = client
        .database(db)
        .collection(collection)
        .count(filter)
        .await
        .with_context(|| format!("count on {db}.{collection} failed"))?;
    println!("{n}");
    Ok(())
}
