//! memfile-cache - serve files from an in-memory mirror
//!
//! Loads the given files into a `MemFileCache`, logs every lifecycle event,
//! and serves the cached content over HTTP.

use clap::Parser;
use memfile_cache::error::{CacheError, Result};
use memfile_cache::server::{start_server, ServerState, SharedState};
use memfile_cache::{MemFileCache, PartialOptions, ServeConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "memfile-cache", about = "Serve files from an in-memory cache")]
struct Args {
    /// Files to cache
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Content type for the files (text/* files are cached as text)
    #[arg(long)]
    content_type: Option<String>,

    /// Poll each file for changes
    #[arg(long)]
    on_change: bool,

    /// Change poll interval in milliseconds
    #[arg(long)]
    change_interval_ms: Option<i64>,

    /// Re-read each file on this interval in milliseconds
    #[arg(long)]
    update_interval_ms: Option<i64>,

    /// Drop each file this many milliseconds after it is cached
    #[arg(long)]
    expire_ms: Option<i64>,

    /// HTTP port (overrides PORT)
    #[arg(long)]
    port: Option<u16>,
}

impl Args {
    fn entry_options(&self) -> PartialOptions {
        PartialOptions {
            content_type: self.content_type.clone(),
            on_change: self.on_change.then_some(true),
            change_interval: self.change_interval_ms.map(millis),
            update_interval: self.update_interval_ms.map(millis),
            expire_interval: self.expire_ms.map(millis),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let env_filter = EnvFilter::from_default_env().add_directive("memfile_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting memfile-cache...");

    let (config, defaults) = load_config(args.port)?;
    info!("Port: {}", config.port);

    let cache = MemFileCache::with_accessor(memfile_cache::FsAccessor, config.event_capacity);
    cache.setup(defaults);
    info!("Defaults: {:?}", cache.defaults());

    // Log every lifecycle event
    let mut events = cache.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(event = %event.kind, "{}", json),
                    Err(e) => warn!(error = %e, "Failed to encode event"),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let options = args.entry_options();
    let mut loaded = 0;
    for file in &args.files {
        match cache.set(file, options.clone()).await {
            Ok(_) => loaded += 1,
            Err(e) => error!("Skipping {}: {}", file.display(), e),
        }
    }
    info!("Cached {}/{} files", loaded, args.files.len());

    let state: SharedState = Arc::new(ServerState::new(cache.clone()));

    let result = start_server(state, config.port)
        .await
        .map_err(|e| CacheError::Config(format!("Server error: {}", e)));
    cache.close();
    result
}

/// Non-positive values disable the corresponding policy
fn millis(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(value) => value
            .parse::<i64>()
            .map(|ms| Some(millis(ms)))
            .map_err(|_| CacheError::Config(format!("{} must be an integer, got {:?}", name, value))),
        Err(_) => Ok(None),
    }
}

fn load_config(port_override: Option<u16>) -> Result<(ServeConfig, PartialOptions)> {
    let defaults = ServeConfig::default();

    let port = port_override
        .or_else(|| {
            std::env::var("PORT")
                .ok()
                .and_then(|s| s.parse::<u16>().ok())
        })
        .unwrap_or(defaults.port);

    let event_capacity = std::env::var("EVENT_CAPACITY")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(defaults.event_capacity);

    let options = PartialOptions {
        content_type: std::env::var("MEMFILE_CONTENT_TYPE").ok(),
        on_change: std::env::var("MEMFILE_ON_CHANGE")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true")),
        change_interval: env_millis("MEMFILE_CHANGE_INTERVAL_MS")?,
        update_interval: env_millis("MEMFILE_UPDATE_INTERVAL_MS")?,
        expire_interval: env_millis("MEMFILE_EXPIRE_MS")?,
    };

    Ok((
        ServeConfig {
            port,
            event_capacity,
        },
        options,
    ))
}
