//! # Sync Client
//!
//! The client keeps one connection to the server and hands it to a single
//! worker task. Nothing else ever touches the socket: manual triggers, the
//! periodic timer and filesystem events only leave a note in shared state
//! and wake the worker, which performs the work one operation at a time.
//!
//! ```text
//!  trigger_sync() ──┐
//!  notify_change() ─┼─> Shared { flags, dirty set } ──wake──> worker ──> Connection
//!  interval tick ───┘
//! ```
//!
//! Between full passes the worker pushes changed paths from the dirty set.
//! A path is uploaded only if its digest differs from the last agreed one,
//! which also keeps files the worker just downloaded from bouncing back.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Interval, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::config::ClientConfig;
use crate::error::{ConnectionError, Result, SyncError};
use crate::events::{emit, ConnectionState, LogLevel, SyncObserver};
use crate::hash::digest_file;
use crate::manifest::{is_temp_artifact, relative_path, resolve, validate_relative_path, Manifest};
use crate::protocol::Connection;
use crate::sync::{run_sync, SyncGate, SyncOptions};
use crate::transfer;

/// How long [`Client::disconnect`] waits before aborting the worker.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

struct Shared {
    config: ClientConfig,
    root: PathBuf,
    /// `root` with symlinks resolved, once it exists.
    canonical_root: Mutex<Option<PathBuf>>,
    observer: Arc<dyn SyncObserver>,
    state_tx: watch::Sender<ConnectionState>,
    gate: SyncGate,
    sync_requested: AtomicBool,
    dirty: Mutex<BTreeMap<String, ChangeKind>>,
    wake: Notify,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            debug!("Client state -> {}", state);
            self.observer.on_connection_state_changed(state);
        }
    }

    fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        emit(self.observer.as_ref(), level, message);
    }
}

/// Cheap, clonable access to a running client.
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<Shared>,
}

impl ClientHandle {
    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Ask for a full sync pass.
    ///
    /// Returns `false` without queueing anything when the client is not
    /// connected, a pass is already running, or one is already queued.
    pub fn trigger_sync(&self) -> bool {
        if self.state() != ConnectionState::Connected || self.shared.gate.is_busy() {
            return false;
        }
        if self.shared.sync_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.shared.wake.notify_one();
        true
    }

    /// Record that `path` changed. Absolute paths must lie under the root;
    /// relative paths are taken relative to it.
    pub fn notify_change(&self, path: &Path, kind: ChangeKind) {
        let Some(rel) = self.to_relative(path) else {
            debug!("Ignoring change outside the sync root: {}", path.display());
            return;
        };
        if is_temp_artifact(&rel) {
            return;
        }
        if let Err(e) = validate_relative_path(&rel) {
            warn!("Ignoring change to {}: {}", path.display(), e);
            return;
        }

        debug!("{:?}: {}", kind, rel);
        self.shared.dirty.lock().insert(rel, kind);
        self.shared.wake.notify_one();
    }

    /// Changes recorded but not yet pushed, in path order.
    pub fn pending_changes(&self) -> Vec<(String, ChangeKind)> {
        self.shared
            .dirty
            .lock()
            .iter()
            .map(|(path, kind)| (path.clone(), *kind))
            .collect()
    }

    fn to_relative(&self, path: &Path) -> Option<String> {
        if path.is_relative() {
            return relative_path(Path::new(""), path);
        }
        if let Some(rel) = relative_path(&self.shared.root, path) {
            return Some(rel);
        }
        // Watchers may report canonical paths (resolved symlinks in the root).
        let canonical = self.shared.canonical_root.lock().clone()?;
        relative_path(&canonical, path)
    }
}

struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct Client {
    handle: ClientHandle,
    worker: Option<WorkerHandle>,
}

impl Client {
    pub fn new(config: ClientConfig, observer: Arc<dyn SyncObserver>) -> Self {
        let root = if config.root.is_absolute() {
            config.root.clone()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&config.root))
                .unwrap_or_else(|_| config.root.clone())
        };
        let canonical_root = std::fs::canonicalize(&root).ok();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            handle: ClientHandle {
                shared: Arc::new(Shared {
                    config,
                    root,
                    canonical_root: Mutex::new(canonical_root),
                    observer,
                    state_tx,
                    gate: SyncGate::new(),
                    sync_requested: AtomicBool::new(false),
                    dirty: Mutex::new(BTreeMap::new()),
                    wake: Notify::new(),
                }),
            },
            worker: None,
        }
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Start the connection worker. Does nothing if it is already running.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let shared = self.handle.shared.clone();
        tokio::fs::create_dir_all(&shared.root)
            .await
            .map_err(|e| SyncError::io(&shared.root, e))?;
        let canonical = tokio::fs::canonicalize(&shared.root)
            .await
            .map_err(|e| SyncError::io(&shared.root, e))?;
        *shared.canonical_root.lock() = Some(canonical);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker = Worker {
            options: shared.config.sync_options(),
            shared,
            baseline: None,
        };
        let task = tokio::spawn(worker.run(shutdown_rx));
        self.worker = Some(WorkerHandle { shutdown_tx, task });
        Ok(())
    }

    /// Stop the worker and close the connection.
    pub async fn disconnect(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = worker.shutdown_tx.send(true);

        let mut task = worker.task;
        match tokio::time::timeout(DISCONNECT_GRACE, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Connection worker failed: {}", e),
            Err(_) => {
                warn!("Connection worker did not stop within {:?}; aborting", DISCONNECT_GRACE);
                task.abort();
            }
        }
        self.handle.shared.set_state(ConnectionState::Disconnected);
    }

    /// Whether the worker task is alive (connecting, connected or retrying).
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(false, |worker| !worker.task.is_finished())
    }

    pub fn trigger_sync(&self) -> bool {
        self.handle.trigger_sync()
    }

    pub fn notify_change(&self, path: &Path, kind: ChangeKind) {
        self.handle.notify_change(path, kind)
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.handle.subscribe_state()
    }
}

/// Sole owner of the connection.
struct Worker {
    shared: Arc<Shared>,
    options: SyncOptions,
    /// Manifest agreed with the server; reset on every reconnect.
    baseline: Option<Manifest>,
}

impl Worker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let shared = self.shared.clone();
        if let Err(e) = transfer::sweep_partials(&shared.root).await {
            shared.log(LogLevel::Warn, format!("Could not clean partial files: {}", e));
        }

        loop {
            let Some(mut conn) = self.connect_with_retry(&mut shutdown).await else {
                break;
            };
            self.baseline = None;

            let result = tokio::select! {
                result = self.drive(&mut conn) => result,
                _ = wait_for_shutdown(&mut shutdown) => break,
            };
            if let Err(e) = result {
                shared.log(
                    LogLevel::Error,
                    format!("Connection to {} lost: {}", shared.config.server_addr, e),
                );
            }
            shared.set_state(ConnectionState::Disconnected);

            // Do not hammer a server that keeps dropping us.
            tokio::select! {
                _ = sleep(shared.config.retry.delay_for(1)) => {}
                _ = wait_for_shutdown(&mut shutdown) => break,
            }
        }

        debug!("Connection worker for {} stopped", shared.config.server_addr);
        shared.set_state(ConnectionState::Disconnected);
    }

    /// `None` when shutdown was requested or retries ran out.
    async fn connect_with_retry(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<Connection<TcpStream>> {
        let shared = &self.shared;
        let addr = shared.config.server_addr.as_str();
        let mut failures = 0u32;

        loop {
            shared.set_state(ConnectionState::Connecting);
            let attempt = tokio::select! {
                attempt = TcpStream::connect(addr) => attempt,
                _ = wait_for_shutdown(shutdown) => return None,
            };

            let error = match attempt {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Could not set TCP_NODELAY: {}", e);
                    }
                    shared.log(LogLevel::Info, format!("Connected to {}", addr));
                    shared.set_state(ConnectionState::Connected);
                    return Some(Connection::new(stream, addr));
                }
                Err(e) => ConnectionError::Connect {
                    addr: addr.to_string(),
                    source: e,
                },
            };

            failures += 1;
            shared.set_state(ConnectionState::Disconnected);
            if !shared.config.retry.allows(failures) {
                let exhausted = ConnectionError::RetriesExhausted {
                    addr: addr.to_string(),
                    attempts: failures,
                };
                shared.log(LogLevel::Error, format!("{} (last error: {})", exhausted, error));
                return None;
            }

            let delay = shared.config.retry.delay_for(failures);
            shared.log(LogLevel::Warn, format!("{}; retrying in {:?}", error, delay));
            tokio::select! {
                _ = sleep(delay) => {}
                _ = wait_for_shutdown(shutdown) => return None,
            }
        }
    }

    /// Serve triggers on an open connection until a fatal error.
    async fn drive(&mut self, conn: &mut Connection<TcpStream>) -> Result<()> {
        let mut ticker = self.shared.config.sync_interval().map(|period| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        // The first tick completes immediately and stands for the initial pass.
        if let Some(ticker) = ticker.as_mut() {
            ticker.tick().await;
        }
        self.full_sync(conn).await?;

        let shared = self.shared.clone();
        loop {
            tokio::select! {
                _ = next_tick(&mut ticker) => self.full_sync(conn).await?,
                _ = shared.wake.notified() => {
                    if shared.sync_requested.swap(false, Ordering::AcqRel) {
                        self.full_sync(conn).await?;
                    }
                    self.flush_dirty(conn).await?;
                }
            }
        }
    }

    async fn full_sync(&mut self, conn: &mut Connection<TcpStream>) -> Result<()> {
        let shared = self.shared.clone();
        let Some(_guard) = shared.gate.try_begin() else {
            debug!("Sync pass already running");
            return Ok(());
        };

        shared.set_state(ConnectionState::Syncing);
        let result = run_sync(
            conn,
            &shared.root,
            &self.options,
            self.baseline.as_ref(),
            shared.observer.as_ref(),
        )
        .await;

        match result {
            Ok(outcome) => {
                self.baseline = Some(outcome.baseline);
                shared.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                shared.log(LogLevel::Warn, format!("Sync pass failed: {}", e));
                shared.set_state(ConnectionState::Connected);
                Ok(())
            }
        }
    }

    /// Push recorded changes. Waits for the first full pass to set a baseline.
    async fn flush_dirty(&mut self, conn: &mut Connection<TcpStream>) -> Result<()> {
        if self.baseline.is_none() {
            return Ok(());
        }
        let shared = self.shared.clone();
        let Some(_guard) = shared.gate.try_begin() else {
            return Ok(());
        };

        let pending = std::mem::take(&mut *shared.dirty.lock());
        if pending.is_empty() {
            return Ok(());
        }

        shared.set_state(ConnectionState::Syncing);
        for (path, kind) in pending {
            match self.push_change(conn, &path).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => shared.log(
                    LogLevel::Warn,
                    format!("Could not push {:?} change of {}: {}", kind, path, e),
                ),
            }
        }
        shared.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn push_change(&mut self, conn: &mut Connection<TcpStream>, rel: &str) -> Result<()> {
        let root = &self.shared.root;
        let path = resolve(root, rel)?;
        let baseline = self.baseline.get_or_insert_with(Manifest::new);

        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // A removed file, or a removed directory and everything under it.
                let gone: Vec<String> = if baseline.contains(rel) {
                    vec![rel.to_string()]
                } else {
                    baseline.paths_under(rel).map(str::to_string).collect()
                };
                for gone_path in gone {
                    transfer::request_delete(conn, &gone_path).await?;
                    baseline.remove(&gone_path);
                    self.shared
                        .log(LogLevel::Info, format!("Deleted {} on {}", gone_path, conn.peer()));
                }
                return Ok(());
            }
            Err(e) => return Err(SyncError::io(&path, e)),
        };

        if !metadata.is_file() {
            // Directories and links are picked up by the next full pass.
            return Ok(());
        }

        let digest = match digest_file(&path).await {
            Ok(digest) => digest,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(SyncError::io(&path, e)),
        };
        if baseline.get(rel) == Some(&digest) {
            return Ok(());
        }

        transfer::send_file(conn, root, rel, &self.options.bandwidth).await?;
        baseline.insert(rel, digest);
        Ok(())
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
