//! # Command Line Interface
//!
//! Argument parsing and command implementations for the `treesync` binary.
//!
//! ## Commands
//!
//! - `init` - Write a default configuration file
//! - `serve` - Accept clients and serve a directory tree
//! - `client` - Keep a local tree in sync with a server until interrupted
//! - `sync` - Run a single sync pass and exit
//! - `manifest` - Print the manifest of a local directory as JSON

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::info;

use crate::client::Client;
use crate::config::Config;
use crate::diff::ConflictPolicy;
use crate::events::{ConsoleObserver, NullObserver};
use crate::manifest::{build_manifest, ScanOptions, SymlinkPolicy};
use crate::protocol::Connection;
use crate::server::Server;
use crate::sync::run_sync;
use crate::watcher::FsWatcher;

/// Command-line interface structure for treesync.
#[derive(Parser)]
#[command(name = "treesync")]
#[command(about = "Bidirectional directory tree synchronization over TCP")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands for treesync.
#[derive(Subcommand)]
pub enum Commands {
    /// Write a default configuration file
    Init {
        /// Where to write the file instead of the default location
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Serve a directory tree to clients
    Serve {
        /// Address to listen on, e.g. 0.0.0.0:5000
        #[arg(short, long)]
        bind: Option<String>,
        /// Directory to serve
        #[arg(short, long)]
        root: Option<PathBuf>,
        /// Configuration file to read
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Keep a local tree in sync with a server until interrupted
    Client {
        /// Server address, e.g. 127.0.0.1:5000
        #[arg(short, long)]
        server: Option<String>,
        /// Local directory to keep in sync
        #[arg(short, long)]
        root: Option<PathBuf>,
        /// Seconds between full sync passes (0 disables periodic passes)
        #[arg(short, long)]
        interval: Option<u64>,
        /// Do not watch the local tree for changes
        #[arg(long)]
        no_watch: bool,
        /// Print every transfer
        #[arg(short, long)]
        verbose: bool,
        /// Configuration file to read
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run one sync pass against a server and exit
    Sync {
        /// Server address, e.g. 127.0.0.1:5000
        #[arg(short, long)]
        server: Option<String>,
        /// Local directory to sync
        #[arg(short, long)]
        root: Option<PathBuf>,
        /// Which side wins when both changed the same file
        #[arg(short, long, value_enum)]
        policy: Option<ConflictPolicy>,
        /// Configuration file to read
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the manifest of a local directory as JSON
    Manifest {
        /// Directory to scan
        dir: PathBuf,
        /// Hash the targets of symbolic links instead of skipping them
        #[arg(long)]
        follow_symlinks: bool,
    },
}

/// Dispatch a parsed command line to its handler.
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { config } => init(config).await,
        Commands::Serve { bind, root, config } => serve(bind, root, config).await,
        Commands::Client {
            server,
            root,
            interval,
            no_watch,
            verbose,
            config,
        } => run_client(server, root, interval, no_watch, verbose, config).await,
        Commands::Sync {
            server,
            root,
            policy,
            config,
        } => sync_once(server, root, policy, config).await,
        Commands::Manifest {
            dir,
            follow_symlinks,
        } => print_manifest(dir, follow_symlinks).await,
    }
}

/// Write a default configuration file.
///
/// # Errors
///
/// Fails if a configuration file already exists at the target location.
pub async fn init(path: Option<PathBuf>) -> Result<()> {
    let config = match path {
        Some(path) => Config::init_at(&path).await?,
        None => Config::init().await?,
    };
    info!("Configuration initialized at: {}", config.config_path().display());

    println!("✅ treesync initialized!");
    println!("Configuration: {}", config.config_path().display());
    Ok(())
}

/// Serve a directory tree until Ctrl+C.
///
/// Command-line values override the `[server]` table of the configuration.
pub async fn serve(
    bind: Option<String>,
    root: Option<PathBuf>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let mut config = Config::load_or_default(config_path.as_deref()).await?.server;
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    if let Some(root) = root {
        config.root = root;
    }

    let root = config.root.clone();
    let server = Server::bind(config).await?;
    let addr = server.local_addr()?;

    println!("🚀 Serving {} on {}", root.display().to_string().bold(), addr);
    println!("Press Ctrl+C to stop");

    let handle = server.spawn();
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    println!("\n🛑 Shutting down...");
    handle.shutdown().await;
    Ok(())
}

/// Connect to a server and keep the local tree in sync until Ctrl+C.
///
/// The client reconnects on its own after connection loss. When watching is
/// enabled, local edits are pushed between full passes.
pub async fn run_client(
    server: Option<String>,
    root: Option<PathBuf>,
    interval: Option<u64>,
    no_watch: bool,
    verbose: bool,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let mut config = Config::load_or_default(config_path.as_deref()).await?.client;
    if let Some(server) = server {
        config.server_addr = server;
    }
    if let Some(root) = root {
        config.root = root;
    }
    if let Some(interval) = interval {
        config.sync_interval_secs = interval;
    }
    if no_watch {
        config.watch = false;
    }

    let watch = config.watch;
    println!(
        "🔄 Syncing {} with {}",
        config.root.display().to_string().bold(),
        config.server_addr
    );

    let mut client = Client::new(config, Arc::new(ConsoleObserver::new(verbose)));
    client.connect().await?;

    let handle = client.handle();
    let watcher = if watch {
        Some(FsWatcher::start(handle.root(), handle.clone())?)
    } else {
        None
    };

    println!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    println!("\n🛑 Disconnecting...");
    drop(watcher);
    client.disconnect().await;
    Ok(())
}

/// Run a single sync pass and print its report.
///
/// # Errors
///
/// Fails if the server is unreachable, the pass aborts, or any file could
/// not be synced.
pub async fn sync_once(
    server: Option<String>,
    root: Option<PathBuf>,
    policy: Option<ConflictPolicy>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let mut config = Config::load_or_default(config_path.as_deref()).await?.client;
    if let Some(server) = server {
        config.server_addr = server;
    }
    if let Some(root) = root {
        config.root = root;
    }
    if let Some(policy) = policy {
        config.conflict_policy = policy;
    }

    tokio::fs::create_dir_all(&config.root)
        .await
        .with_context(|| format!("Failed to create {}", config.root.display()))?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(format!("Connecting to {}", config.server_addr));

    let stream = TcpStream::connect(&config.server_addr)
        .await
        .with_context(|| format!("Failed to connect to {}", config.server_addr))?;
    stream.set_nodelay(true)?;
    let mut conn = Connection::new(stream, config.server_addr.clone());

    spinner.set_message(format!("Syncing {}", config.root.display()));
    let options = config.sync_options();
    let result = run_sync(&mut conn, &config.root, &options, None, &NullObserver).await;
    spinner.finish_and_clear();

    let report = result?.report;
    if report.is_clean() {
        println!("✅ {} ({:.1}s)", report, report.duration().num_milliseconds() as f64 / 1000.0);
        return Ok(());
    }

    println!("⚠️  {}", report.to_string().yellow());
    for failure in &report.failures {
        println!(
            "   {} {} ({}): {}",
            "•".red(),
            failure.path,
            failure.action.label(),
            failure.reason
        );
    }
    anyhow::bail!("{} path(s) failed to sync", report.failures.len())
}

/// Print the manifest of `dir` to stdout.
pub async fn print_manifest(dir: PathBuf, follow_symlinks: bool) -> Result<()> {
    let options = scan_options(follow_symlinks);
    let manifest = build_manifest(&dir, &options).await?;
    let json = serde_json::to_string_pretty(&manifest)
        .with_context(|| format!("Failed to encode manifest of {}", dir.display()))?;
    println!("{}", json);
    Ok(())
}

fn scan_options(follow_symlinks: bool) -> ScanOptions {
    ScanOptions {
        symlinks: if follow_symlinks {
            SymlinkPolicy::Follow
        } else {
            SymlinkPolicy::Skip
        },
    }
}
