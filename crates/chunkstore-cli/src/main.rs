//! Chunkstore CLI - Command-line interface
//!
//! Usage:
//!   chunkstore init [--drop]
//!   chunkstore upsert <chunks.json>
//!   chunkstore query <queries.json>
//!   chunkstore delete [--all] [--id <doc>]... [--filter <json>]
//!   chunkstore schema
//!
//! Author: hephaex@gmail.com

use anyhow::Context;
use chunkstore_core::{
    ChunksByDocument, DataStore, LoggingConfig, MetadataFilter, QueryWithEmbedding, StoreConfig,
};
use chunkstore_vector::{MilvusDataStore, SchemaVersion};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "chunkstore")]
#[command(about = "Chunk storage and similarity search on Milvus")]
#[command(version)]
struct Cli {
    /// TOML configuration file; environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Tenant (source) id selecting the collection
    #[arg(short, long, global = true, default_value = "default")]
    tenant: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the tenant's collection and index if missing
    Init {
        /// Drop an existing collection first
        #[arg(long)]
        drop: bool,
    },
    /// Store chunks from a JSON file mapping document ids to chunks
    Upsert {
        /// Path to the chunks file
        path: PathBuf,
    },
    /// Run queries with pre-computed embeddings from a JSON file
    Query {
        /// Path to a query or a list of queries
        path: PathBuf,
    },
    /// Delete stored chunks
    Delete {
        /// Drop everything and recreate the collection
        #[arg(long)]
        all: bool,
        /// Document id to delete (repeatable)
        #[arg(long = "id")]
        ids: Vec<String>,
        /// Metadata filter as JSON
        #[arg(long)]
        filter: Option<String>,
    },
    /// Show the schema version and fields of the tenant's collection
    Schema,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.clone().into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<StoreConfig> {
    let config = match path {
        Some(path) => StoreConfig::from_file(path)?.with_env_override()?,
        None => StoreConfig::from_env()?,
    };
    Ok(config)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

/// A single query or a batch of them
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum QueryFile {
    Many(Vec<QueryWithEmbedding>),
    One(QueryWithEmbedding),
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    let store = MilvusDataStore::from_config(&config);
    let tenant = cli.tenant.as_str();

    match cli.command {
        Commands::Init { drop } => {
            let version = store.ensure_collection(tenant, drop).await?;
            info!(tenant = %tenant, schema = %version, "Collection ready");
            print_json(&serde_json::json!({ "tenant": tenant, "schema": version }))?;
        }
        Commands::Upsert { path } => {
            let chunks: ChunksByDocument = read_json(&path)?;
            let requested = chunks.len();
            let ids = store.upsert(chunks, tenant).await;
            if ids.is_empty() && requested > 0 {
                anyhow::bail!("Upsert failed, see log for details");
            }
            print_json(&ids)?;
        }
        Commands::Query { path } => {
            let queries = match read_json::<QueryFile>(&path)? {
                QueryFile::Many(queries) => queries,
                QueryFile::One(query) => vec![query],
            };
            let results = store.query(queries).await;
            print_json(&results)?;
        }
        Commands::Delete { all, ids, filter } => {
            let filter: Option<MetadataFilter> = filter
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Invalid filter JSON")?;
            if !all && ids.is_empty() && filter.is_none() {
                anyhow::bail!("Nothing to delete: pass --all, --id or --filter");
            }
            let ids = (!ids.is_empty()).then_some(ids.as_slice());
            let deleted = store.delete(tenant, ids, filter.as_ref(), all).await;
            if !deleted {
                anyhow::bail!("Delete failed, see log for details");
            }
            print_json(&serde_json::json!({ "deleted": deleted }))?;
        }
        Commands::Schema => {
            let version = store.schema_version(tenant).await?;
            let fields: Vec<_> = store
                .registry()
                .fields(version)
                .iter()
                .map(|f| &f.schema)
                .collect();
            let primary_key = store.registry().primary_key_name(version);
            print_json(&serde_json::json!({
                "tenant": tenant,
                "schema": version,
                "primary_key": primary_key,
                "fields": fields,
            }))?;
            if version == SchemaVersion::V1 {
                info!(tenant = %tenant, "Collection uses the legacy layout, run `init --drop` to migrate");
            }
        }
    }

    store.close().await;
    Ok(())
}
