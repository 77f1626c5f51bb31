use std::path::PathBuf;

use anyhow::{bail, Context};
use bson::{doc, Bson, Document};
use clap::{Parser, Subcommand};
use docwire::{Client, ClientOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "docwire")]
#[command(about = "Run commands against a document-store server over the wire protocol", long_about = None)]
struct Args {
    /// Server address (e.g., localhost:27017); overrides the config file
    #[arg(short, long)]
    address: Option<String>,

    /// TOML file with client options
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the server answers
    Ping,
    /// Run a raw command given as JSON, e.g. '{"listCollections": 1}'
    Run {
        database: String,
        command: String,
    },
    /// Print the documents of a collection matching an optional JSON filter
    Find {
        database: String,
        collection: String,
        filter: Option<String>,
        /// Documents fetched per round trip
        #[arg(long)]
        batch_size: Option<i32>,
        /// Stop after this many documents
        #[arg(long)]
        limit: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docwire=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut options = match &args.config {
        Some(path) => ClientOptions::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClientOptions::default(),
    };
    if let Some(address) = args.address {
        options.address = address;
    }

    let client = Client::connect(options).await?;
    let outcome = run(&client, args.command).await;
    client.close_all().await;
    outcome
}

async fn run(client: &Client, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Ping => {
            let started = std::time::Instant::now();
            client.ping().await?;
            println!("ok ({:?})", started.elapsed());
        }
        Command::Run { database, command } => {
            let command = parse_document(&command)?;
            let reply = client.execute(&database, command, None).await?;
            print_document(reply)?;
        }
        Command::Find {
            database,
            collection,
            filter,
            batch_size,
            limit,
        } => {
            let filter = match filter {
                Some(json) => parse_document(&json)?,
                None => Document::new(),
            };
            let mut find = doc! { "find": collection, "filter": filter };
            if let Some(batch_size) = batch_size {
                find.insert("batchSize", batch_size);
            }
            if let Some(limit) = limit {
                find.insert("limit", limit);
            }

            let mut cursor = client.open_cursor(&database, find).await?;
            let mut count = 0usize;
            while let Some(doc) = cursor.next().await? {
                print_document(doc)?;
                count += 1;
            }
            tracing::info!("Fetched {} documents", count);
        }
    }
    Ok(())
}

/// Parse (extended) JSON into a document.
fn parse_document(json: &str) -> anyhow::Result<Document> {
    let value: serde_json::Value = serde_json::from_str(json).context("invalid JSON")?;
    match Bson::try_from(value).context("invalid extended JSON")? {
        Bson::Document(doc) => Ok(doc),
        other => bail!("expected a JSON object, got {:?}", other.element_type()),
    }
}

fn print_document(doc: Document) -> anyhow::Result<()> {
    let json = Bson::Document(doc).into_relaxed_extjson();
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
