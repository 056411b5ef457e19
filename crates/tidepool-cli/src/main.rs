//! tidepool — command-line client for MongoDB servers.
//!
//! # Usage
//!
//! ```text
//! tidepool --uri mongodb://localhost:27017 ping
//! tidepool find app users --filter '{"active": true}' --exhaust
//! tidepool --config tidepool.toml databases
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tidepool_core::TidepoolConfig;
use tidepool_driver::Client;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "tidepool",
    about = "tidepool — MongoDB command-line client",
    version,
    propagate_version = true
)]
struct Cli {
    /// Connection string. Overrides `[client].uri` from the config file.
    #[arg(long, global = true)]
    uri: Option<String>,

    /// Path to a tidepool.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check that the server answers.
    Ping,
    /// List database names.
    Databases,
    /// Drop a database.
    DropDatabase { name: String },
    /// Print the server's buildinfo document.
    ServerInfo,
    /// Query a collection; prints one JSON document per line.
    Find {
        db: String,
        collection: String,
        /// Filter as (extended) JSON.
        #[arg(long, default_value = "{}")]
        filter: String,
        /// Stream all batches over one connection.
        #[arg(long)]
        exhaust: bool,
        /// Maximum number of documents; 0 means no limit.
        #[arg(long, default_value = "0")]
        limit: u32,
        #[arg(long, default_value = "0")]
        batch_size: u32,
    },
    /// Insert one document given as (extended) JSON.
    Insert {
        db: String,
        collection: String,
        document: String,
    },
    /// Count documents matching a filter.
    Count {
        db: String,
        collection: String,
        #[arg(long, default_value = "{}")]
        filter: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<TidepoolConfig> {
    match path {
        Some(path) => TidepoolConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(TidepoolConfig::default()),
    }
}

fn init_tracing(config: &TidepoolConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter()));
    let json = config.logging.as_ref().and_then(|l| l.json).unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config);

    let options = config
        .client_options(cli.uri.as_deref())
        .context("invalid client configuration")?;
    let client = Client::new(options).context("failed to create client")?;

    let result = match cli.command {
        Command::Ping => commands::admin::ping(&client).await,
        Command::Databases => commands::admin::databases(&client).await,
        Command::DropDatabase { name } => commands::admin::drop_database(&client, &name).await,
        Command::ServerInfo => commands::admin::server_info(&client).await,
        Command::Find {
            db,
            collection,
            filter,
            exhaust,
            limit,
            batch_size,
        } => {
            let options = commands::query::FindArgs {
                filter,
                exhaust,
                limit,
                batch_size,
            };
            commands::query::find(&client, &db, &collection, options).await
        }
        Command::Insert {
            db,
            collection,
            document,
        } => commands::insert::insert(&client, &db, &collection, &document).await,
        Command::Count {
            db,
            collection,
            filter,
        } => commands::query::count(&client, &db, &collection, &filter).await,
    };

    client.close();
    result
}
