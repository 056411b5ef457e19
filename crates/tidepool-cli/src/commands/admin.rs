use std::time::Instant;

use anyhow::Context;
use bson::doc;
use tidepool_driver::Client;

use super::to_json;

pub async fn ping(client: &Client) -> anyhow::Result<()> {
    let started = Instant::now();
    client
        .command("admin", doc! { "ping": 1 })
        .await
        .context("ping failed")?;
    println!("ok ({} ms)", started.elapsed().as_millis());
    Ok(())
}

pub async fn databases(client: &Client) -> anyhow::Result<()> {
    for name in client.database_names().await.context("listDatabases failed")? {
        println!("{name}");
    }
    Ok(())
}

pub async fn drop_database(client: &Client, name: &str) -> anyhow::Result<()> {
    client
        .drop_database(name)
        .await
        .with_context(|| format!("failed to drop database {name}"))?;
    println!("✓ Dropped {name}");
    Ok(())
}

pub async fn server_info(client: &Client) -> anyhow::Result<()> {
    let info = client.server_info().await.context("buildinfo failed")?;
    println!("{}", serde_json::to_string_pretty(&to_json(info))?);
    Ok(())
}
