//! `restkit`: CRUD and cache validators against stores named in a config file.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use restkit_core::{Page, ResourceId, StoreResult, Value};
use restkit_store::cache::{http_date, ConditionalCache, EntityTag, Preconditions};
use restkit_store::{StorageDriver, Store, ToolkitConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "restkit", version, about = "Pluggable REST resource storage")]
struct Cli {
    /// Config file (TOML, or JSON by `.json` extension).
    #[arg(short, long, env = "RESTKIT_CONFIG", default_value = "restkit.toml", global = true)]
    config: PathBuf,

    /// Named store to operate on.
    #[arg(short, long, env = "RESTKIT_STORE", global = true)]
    store: Option<String>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Debug logging (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    #[command(flatten)]
    Store(StoreCommand),
    #[command(flatten)]
    Cache(CacheCommand),
}

/// Commands that run against the store named by `--store`.
#[derive(Subcommand)]
enum StoreCommand {
    /// Create a record from JSON; prints the new id.
    Create {
        record: String,
        #[arg(long)]
        id: Option<String>,
        /// Resource URI whose cache entry to bump.
        #[arg(long)]
        uri: Option<String>,
    },
    /// Print one record.
    Read { id: String },
    /// Merge JSON fields into a record; prints the merged record.
    Update {
        id: String,
        record: String,
        #[arg(long)]
        uri: Option<String>,
    },
    /// Delete a record; prints what was deleted.
    Delete {
        id: String,
        /// Resource URI whose cache entry to drop.
        #[arg(long)]
        uri: Option<String>,
    },
    /// Print every record, optionally one page.
    List {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 1)]
        page: usize,
    },
    /// Print the record count.
    Count,
    /// Print records whose field equals the value (JSON, or plain text).
    Search { field: String, value: String },
}

/// Commands that only touch the configured cache store.
#[derive(Subcommand)]
enum CacheCommand {
    /// Print the validators of a URI, or check a client tag against them.
    Etag {
        uri: String,
        #[arg(long)]
        if_none_match: Option<String>,
    },
    /// Record a write to a URI without touching any store.
    Touch {
        uri: String,
        #[arg(long = "type")]
        resource_type: Option<String>,
    },
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

/// Parses a record argument: JSON when it parses, else a bare string.
fn parse_value(text: &str) -> Value {
    serde_json::from_str::<serde_json::Value>(text)
        .map_or_else(|_| Value::from(text), Value::from)
}

fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Commits after success; rolls back after any failure.
async fn finish<T>(store: &Store, result: StoreResult<T>) -> anyhow::Result<T> {
    let result = match result {
        Ok(value) => store.commit().await.map(|()| value),
        Err(e) => Err(e),
    };
    if result.is_err() {
        if let Err(rollback) = store.rollback().await {
            tracing::warn!(error = %rollback, "rollback failed");
        }
    }
    result.map_err(anyhow::Error::from)
}

async fn open_cache(config: &ToolkitConfig) -> anyhow::Result<ConditionalCache> {
    let cache = config
        .cache
        .as_ref()
        .context("no [cache] store is configured")?;
    Ok(ConditionalCache::open(cache).await?)
}

async fn run_store(store: &Store, command: StoreCommand, config: &ToolkitConfig) -> anyhow::Result<()> {
    store.begin().await?;
    match command {
        StoreCommand::Create { record, id, uri } => {
            let id = id.as_deref().map(ResourceId::parse);
            let result = store.create(parse_value(&record), id).await;
            let id = finish(store, result).await?;
            if let Some(uri) = uri {
                open_cache(config).await?.mark_modified(&uri).await?;
            }
            println!("{id}");
        }
        StoreCommand::Read { id } => {
            let result = store.read(&ResourceId::parse(&id)).await;
            print_json(&finish(store, result).await?.to_json())?;
        }
        StoreCommand::Update { id, record, uri } => {
            let result = store
                .update(parse_value(&record), &ResourceId::parse(&id))
                .await;
            let merged = finish(store, result).await?;
            if let Some(uri) = uri {
                open_cache(config).await?.mark_modified(&uri).await?;
            }
            print_json(&merged.to_json())?;
        }
        StoreCommand::Delete { id, uri } => {
            let result = store.delete(&ResourceId::parse(&id)).await;
            let deleted = finish(store, result).await?;
            if let Some(uri) = uri {
                open_cache(config).await?.forget(&uri).await?;
            }
            print_json(&deleted.to_json())?;
        }
        StoreCommand::List { limit, page } => {
            let result = store.all(limit.map(|limit| Page::new(limit, page))).await;
            let records = finish(store, result).await?;
            let listing: serde_json::Map<String, serde_json::Value> = records
                .iter()
                .map(|(id, record)| (id.to_string(), record.to_json()))
                .collect();
            print_json(&serde_json::Value::Object(listing))?;
        }
        StoreCommand::Count => {
            let result = store.count().await;
            println!("{}", finish(store, result).await?);
        }
        StoreCommand::Search { field, value } => {
            let result = store.search(&field, &parse_value(&value)).await;
            let records = finish(store, result).await?;
            let listing: serde_json::Map<String, serde_json::Value> = records
                .iter()
                .map(|(id, record)| (id.to_string(), record.to_json()))
                .collect();
            print_json(&serde_json::Value::Object(listing))?;
        }
    }
    Ok(())
}

async fn run_cache(command: CacheCommand, config: &ToolkitConfig) -> anyhow::Result<()> {
    let cache = open_cache(config).await?;
    match command {
        CacheCommand::Etag { uri, if_none_match } => {
            let Some(entry) = cache.entry(&uri).await? else {
                anyhow::bail!("no cache entry for {uri}");
            };
            if let Some(tag) = if_none_match {
                let tag = tag.trim_matches('"');
                let preconditions = Preconditions::if_none_match(EntityTag::new(tag));
                let modified = cache.is_modified(&uri, &preconditions).await?;
                println!("{}", if modified { "modified" } else { "not modified" });
            } else {
                println!("ETag: {}", entry.entity_tag());
                println!("Last-Modified: {}", http_date(entry.modified));
                println!("Version: {}", entry.version);
            }
        }
        CacheCommand::Touch { uri, resource_type } => {
            let entry = cache
                .mark_modified_with(&uri, resource_type.as_deref(), None)
                .await?;
            println!("{}", entry.entity_tag());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = ToolkitConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::Store(command) => {
            let name = cli
                .store
                .as_deref()
                .context("--store (or RESTKIT_STORE) is required for this command")?;
            let store = Store::open(config.store(name)?).await?;
            tracing::info!(store = name, driver = %store.kind(), "store opened");
            run_store(&store, command, &config).await
        }
        Command::Cache(command) => run_cache(command, &config).await,
    }
}
