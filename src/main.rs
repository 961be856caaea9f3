//! TideKV - An In-Memory Key-Value Engine with Durable Logging
//!
//! This is the main entry point for the TideKV server.
//! It loads configuration, recovers the keyspace from disk, starts the
//! background tasks and accepts client connections.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tidekv::config::{Config, FsyncPolicy};
use tidekv::connection::{handle_connection, ConnectionStats};
use tidekv::storage::{ExpiryDriver, Keyspace, MemorySampler};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Command-line options. Every flag overrides the config file.
#[derive(Debug, Parser)]
#[command(name = "tidekv", version, about = "An in-memory key-value engine with durable logging")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory holding the log and snapshot files
    #[arg(long)]
    dir: Option<PathBuf>,

    /// Number of logical databases
    #[arg(long)]
    databases: Option<usize>,

    /// Enable the append-only log
    #[arg(long)]
    appendonly: Option<bool>,

    /// Fsync policy of the append-only log
    #[arg(long, value_enum)]
    appendfsync: Option<FsyncPolicy>,

    /// Rewrite the log with a binary snapshot preamble
    #[arg(long)]
    aof_use_rdb_preamble: Option<bool>,

    /// Memory ceiling in bytes (0 disables eviction)
    #[arg(long)]
    maxmemory: Option<u64>,
}

impl Cli {
    /// Builds the effective configuration: defaults, then file, then flags.
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)
                .with_context(|| format!("loading config file {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(dir) = self.dir {
            config.dir = dir;
        }
        if let Some(databases) = self.databases {
            config.databases = databases;
        }
        if let Some(appendonly) = self.appendonly {
            config.appendonly = appendonly;
        }
        if let Some(policy) = self.appendfsync {
            config.appendfsync = policy;
        }
        if let Some(preamble) = self.aof_use_rdb_preamble {
            config.aof_use_rdb_preamble = preamble;
        }
        if let Some(maxmemory) = self.maxmemory {
            config.maxmemory = maxmemory;
        }

        config.validate()?;
        Ok(config)
    }
}

fn print_banner(config: &Config) {
    println!(
        r#"
TideKV v{} - In-Memory Key-Value Engine
──────────────────────────────────────────────────────────────
Server started on {}
Append-only log: {} (fsync {})
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        tidekv::VERSION,
        config.bind_address(),
        if config.appendonly { "on" } else { "off" },
        config.appendfsync.as_str(),
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Cli::parse().into_config()?;

    // Set up logging; RUST_LOG overrides the default level
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    std::fs::create_dir_all(&config.dir)
        .with_context(|| format!("creating data directory {}", config.dir.display()))?;

    let keyspace = Arc::new(Keyspace::new(&config));
    info!(databases = config.databases, "Keyspace initialized");

    let persister = tidekv::persistence::recover(&keyspace).context("recovering keyspace")?;
    info!(keys = keyspace.key_count(), "Recovery finished");

    let expiry = ExpiryDriver::start(Arc::clone(&keyspace));
    let sampler = MemorySampler::start(Arc::clone(&keyspace), config.memory_sample_interval());

    let stats = Arc::new(ConnectionStats::new());

    let listener = TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("binding {}", config.bind_address()))?;
    print_banner(&config);
    info!("Listening on {}", config.bind_address());

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
    };

    tokio::select! {
        _ = accept_loop(listener, Arc::clone(&keyspace), stats) => {}
        _ = shutdown => {}
    }

    expiry.stop();
    sampler.stop();
    if let Some(persister) = persister {
        persister.close();
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Main loop that accepts incoming connections
async fn accept_loop(listener: TcpListener, keyspace: Arc<Keyspace>, stats: Arc<ConnectionStats>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(handle_connection(
                    stream,
                    addr,
                    Arc::clone(&keyspace),
                    Arc::clone(&stats),
                ));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
