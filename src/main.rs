use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use rustentitydb::{EntityRecord, FileStorage, StorageAdapter};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "rustentitydb")]
#[command(about = "Inspect entity records kept by a RustEntityDB file store")]
struct Cli {
    /// Root directory of the file store
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List collections
    Collections,
    /// List every record of a collection
    Scan {
        #[arg(long)]
        collection: String,
    },
    /// Pretty-print one record
    Show {
        #[arg(long)]
        collection: String,
        #[arg(long)]
        id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let storage = FileStorage::open(&cli.root)
        .with_context(|| format!("Failed to open store at '{}'", cli.root.display()))?;

    match cli.command {
        Command::Collections => list_collections(&storage),
        Command::Scan { collection } => scan_collection(&storage, &collection).await,
        Command::Show { collection, id } => show_record(&storage, &collection, id).await,
    }
}

fn list_collections(storage: &FileStorage) -> Result<()> {
    let collections = storage
        .collections()
        .context("Failed to list collections")?;
    if collections.is_empty() {
        println!("No collections in {}", storage.root().display());
    }
    for name in collections {
        println!("{}", name);
    }
    Ok(())
}

async fn scan_collection(storage: &FileStorage, collection: &str) -> Result<()> {
    let records = storage
        .scan(collection)
        .await
        .with_context(|| format!("Failed to scan collection '{}'", collection))?;

    let mut undecodable = 0usize;
    for data in &records {
        match EntityRecord::<serde_json::Value>::decode(data) {
            Ok(record) => println!(
                "{}  v{}  {}  saved={}",
                record.id,
                record.version,
                record.persistence_state,
                record
                    .saved
                    .map(|saved| saved.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string())
            ),
            Err(err) => {
                undecodable += 1;
                eprintln!("undecodable record: {}", err);
            }
        }
    }

    println!(
        "{} record(s), {} undecodable",
        records.len(),
        undecodable
    );
    Ok(())
}

async fn show_record(storage: &FileStorage, collection: &str, id: Uuid) -> Result<()> {
    let data = storage
        .get(collection, id)
        .await
        .with_context(|| format!("Failed to read '{}' from '{}'", id, collection))?
        .ok_or_else(|| anyhow!("No record '{}' in collection '{}'", id, collection))?;

    let record = EntityRecord::<serde_json::Value>::decode(&data)
        .with_context(|| format!("Record '{}' is corrupt", id))?;
    let pretty = serde_json::to_string_pretty(&record).context("Failed to render record")?;
    println!("{}", pretty);
    Ok(())
}
