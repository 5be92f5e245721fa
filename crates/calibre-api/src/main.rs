//! calibre-api - Cached search and statistics over a Calibre library

mod cli;

use anyhow::{bail, Context, Result};
use calibre_api_core::cache::FingerprintPattern;
use calibre_api_core::models::{BookRecord, SearchParams, StatisticsSnapshot};
use calibre_api_core::{LibraryService, QueryCache, ServiceConfig};
use calibre_api_web::ApiState;
use clap::{Parser, Subcommand};
use figment::providers::Serialized;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "calibre-api",
    version,
    about = "Cached search and statistics over a Calibre library",
    long_about = "Read-only HTTP API over a Calibre library's metadata.db.\n\
                  \n\
                  Query results are cached in memory and on disk, so repeated\n\
                  searches and statistics never touch the library twice.\n\
                  \n\
                  Examples:\n\
                    calibre-api                              # Serve on 0.0.0.0:8000 (default)\n\
                    calibre-api serve --bind 127.0.0.1:9000  # Custom address\n\
                    calibre-api stats                        # Print library statistics\n\
                    calibre-api search --author herbert      # Search from the terminal\n\
                    calibre-api clear-cache --pattern 'search*'\n\
                  \n\
                  Environment Variables:\n\
                    CALIBRE_LIBRARY_PATH                     # Library directory\n\
                    API_TOKEN                                # Single access token\n\
                    CALIBRE_API_<KEY>                        # Any config key, nested with __\n\
                    RUST_LOG                                 # Overrides --log-level"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// TOML configuration file
    #[arg(long, short = 'c', global = true, env = "CALIBRE_API_CONFIG")]
    config: Option<PathBuf>,

    /// Calibre library directory (the one holding metadata.db)
    #[arg(long, global = true)]
    library: Option<PathBuf>,

    /// Durable cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server (default)
    Serve {
        /// Listen address
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Print library statistics and exit
    Stats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Search the library and exit
    Search {
        /// Title substring
        #[arg(long)]
        title: Option<String>,
        /// Author substring
        #[arg(long)]
        author: Option<String>,
        /// Required tag (repeatable)
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Published on or after (YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,
        /// Published on or before (YYYY-MM-DD)
        #[arg(long)]
        to: Option<String>,
        /// Max results
        #[arg(long, short = 'n')]
        limit: Option<usize>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove cached query results and exit
    ClearCache {
        /// Glob over cache keys, e.g. 'search*'; everything when omitted
        #[arg(long)]
        pattern: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match &cli.command {
        None => run_serve(&cli, None).await,
        Some(Command::Serve { bind }) => run_serve(&cli, *bind).await,
        Some(Command::Stats { json }) => run_stats(&cli, *json).await,
        Some(Command::Search {
            title,
            author,
            tags,
            from,
            to,
            limit,
            json,
        }) => {
            let params = SearchParams {
                title: title.clone(),
                author: author.clone(),
                tags: (!tags.is_empty()).then(|| tags.join(",")),
                published_from: from.clone(),
                published_to: to.clone(),
                limit: limit.map(|n| n.to_string()),
            };
            run_search(&cli, params, *json).await
        }
        Some(Command::ClearCache { pattern }) => run_clear_cache(&cli, pattern.as_deref()).await,
    }
}

/// Standard layers plus whatever the command line overrides
fn load_config(cli: &Cli, bind: Option<SocketAddr>) -> Result<ServiceConfig> {
    let mut figment = ServiceConfig::figment(cli.config.as_deref());

    if let Some(ref library) = cli.library {
        figment = figment.merge(Serialized::default("library_path", library));
    }
    if let Some(ref dir) = cli.cache_dir {
        figment = figment.merge(Serialized::default("cache.dir", dir));
    }
    if let Some(bind) = bind {
        figment = figment.merge(Serialized::default("server.bind", bind));
    }

    let config: ServiceConfig = figment.extract().context("Failed to load configuration")?;
    config
        .validate_cache()
        .context("Invalid cache configuration")?;
    Ok(config)
}

fn open_service(config: &ServiceConfig) -> Result<LibraryService> {
    LibraryService::from_config(config).with_context(|| {
        format!(
            "Failed to open Calibre library at {}",
            config.library_path.display()
        )
    })
}

async fn run_serve(cli: &Cli, bind: Option<SocketAddr>) -> Result<()> {
    let config = load_config(cli, bind)?;
    config
        .validate_tokens()
        .context("Refusing to serve without valid access tokens")?;

    let state = ApiState::from_config(&config).with_context(|| {
        format!(
            "Failed to open Calibre library at {}",
            config.library_path.display()
        )
    })?;
    info!(
        library = %config.library_path.display(),
        tokens = config.tokens.len(),
        "Starting calibre-api"
    );

    calibre_api_web::run(state, config.server.bind).await
}

async fn run_stats(cli: &Cli, json: bool) -> Result<()> {
    let config = load_config(cli, None)?;
    let service = open_service(&config)?;

    let result = service.statistics().await;
    service.shutdown().await;
    let entry = result.context("Failed to compute statistics")?;

    let snapshot: StatisticsSnapshot =
        serde_json::from_str(&entry.payload).context("Corrupt cached statistics")?;
    println!("{}", cli::format_statistics(&snapshot, json));
    Ok(())
}

async fn run_search(cli: &Cli, params: SearchParams, json: bool) -> Result<()> {
    let config = load_config(cli, None)?;
    let service = open_service(&config)?;

    let result = service.search(&params).await;
    service.shutdown().await;
    let entry = result.context("Search failed")?;

    let books: Vec<BookRecord> =
        serde_json::from_str(&entry.payload).context("Corrupt cached search result")?;
    println!("{}", cli::format_book_table(&books, json));
    Ok(())
}

/// Works on the cache alone so a missing library does not block cleanup
async fn run_clear_cache(cli: &Cli, pattern: Option<&str>) -> Result<()> {
    let config = load_config(cli, None)?;
    let cache_dir = config.cache.resolved_dir();
    let cache = QueryCache::open(
        &cache_dir,
        config.cache.store_options(),
        config.cache.memory_capacity,
    );
    if cache.degraded_state().is_degraded() {
        bail!("Cache at {} could not be opened", cache_dir.display());
    }

    let removed = match pattern.map(str::trim).filter(|p| !p.is_empty()) {
        Some(raw) => {
            let pattern = FingerprintPattern::parse(raw).context("Invalid cache pattern")?;
            cache.invalidate_matching(&pattern).await
        }
        None => cache.invalidate_all().await,
    };
    cache.shutdown().await;

    println!(
        "✓ Removed {} cached {} from {}",
        removed,
        if removed == 1 { "entry" } else { "entries" },
        cache_dir.display()
    );
    Ok(())
}
