//! # Observer Interface
//!
//! The sync core reports what it is doing through [`SyncObserver`] instead of
//! talking to any particular front end. The CLI plugs in [`ConsoleObserver`];
//! embedders can implement the trait themselves.

use colored::*;
use std::fmt;

use crate::sync::SyncReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Client connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Syncing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Syncing => "syncing",
        };
        f.write_str(s)
    }
}

/// Receives events from the sync core. All methods default to no-ops.
///
/// Callbacks run on the connection worker, so they should return quickly.
pub trait SyncObserver: Send + Sync {
    fn on_log(&self, _level: LogLevel, _message: &str) {}

    fn on_sync_completed(&self, _report: &SyncReport) {}

    fn on_connection_state_changed(&self, _state: ConnectionState) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl SyncObserver for NullObserver {}

/// Records completions and state changes in the `tracing` log.
///
/// Log lines already go through `tracing` via [`emit`], so `on_log` is left
/// as the no-op default.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn on_sync_completed(&self, report: &SyncReport) {
        if report.failures.is_empty() {
            tracing::info!("Sync completed: {}", report);
        } else {
            tracing::warn!("Sync completed with failures: {}", report);
        }
    }

    fn on_connection_state_changed(&self, state: ConnectionState) {
        tracing::info!("Connection state: {}", state);
    }
}

/// Human-readable status lines for the terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleObserver {
    pub verbose: bool,
}

impl ConsoleObserver {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl SyncObserver for ConsoleObserver {
    fn on_log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Error => eprintln!("{} {}", "✗".red().bold(), message.red()),
            LogLevel::Warn => eprintln!("{} {}", "!".yellow().bold(), message.yellow()),
            LogLevel::Info if self.verbose => println!("  {}", message),
            LogLevel::Debug | LogLevel::Info => {}
        }
    }

    fn on_sync_completed(&self, report: &SyncReport) {
        if report.failures.is_empty() {
            println!("{} Sync complete: {}", "✅".green(), report);
        } else {
            println!("{} Sync finished with failures: {}", "⚠️".yellow(), report);
            for failure in &report.failures {
                println!("   {} {} ({}): {}", "•".red(), failure.path, failure.action.label(), failure.reason);
            }
        }
    }

    fn on_connection_state_changed(&self, state: ConnectionState) {
        let label = state.to_string();
        let colored = match state {
            ConnectionState::Connected => label.green(),
            ConnectionState::Syncing => label.cyan(),
            ConnectionState::Connecting => label.yellow(),
            ConnectionState::Disconnected => label.red(),
        };
        println!("{} {}", "●".bold(), colored);
    }
}

/// Log `message` through `tracing` and forward it to the observer.
pub fn emit(observer: &dyn SyncObserver, level: LogLevel, message: impl AsRef<str>) {
    let message = message.as_ref();
    match level {
        LogLevel::Debug => tracing::debug!("{}", message),
        LogLevel::Info => tracing::info!("{}", message),
        LogLevel::Warn => tracing::warn!("{}", message),
        LogLevel::Error => tracing::error!("{}", message),
    }
    observer.on_log(level, message);
}
