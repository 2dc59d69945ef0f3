//! # Sync Server
//!
//! Accepts client connections and runs one [`Session`] task per socket. Every
//! session reads one command at a time and answers it before reading the
//! next, so a connection never has two requests in flight. Sessions share
//! only the sync root on disk; concurrent writes to the same file from two
//! clients are not coordinated and the last rename wins.
//!
//! ```rust,no_run
//! use treesync::config::ServerConfig;
//! use treesync::server::Server;
//!
//! async fn serve() -> anyhow::Result<()> {
//!     let server = Server::bind(ServerConfig::default()).await?;
//!     let handle = server.spawn();
//!     // ...
//!     handle.shutdown().await;
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::bandwidth::BandwidthManager;
use crate::config::ServerConfig;
use crate::error::{ConnectionError, ProtocolError, Result, SyncError};
use crate::manifest::{build_manifest, ScanOptions};
use crate::protocol::{Command, Connection};
use crate::transfer;

pub struct Server {
    listener: TcpListener,
    root: PathBuf,
    scan: ScanOptions,
    bandwidth: Arc<BandwidthManager>,
}

impl Server {
    /// Bind the listening socket, creating the sync root if needed.
    ///
    /// Partial files left by an earlier crash are removed here.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.root)
            .await
            .map_err(|e| SyncError::io(&config.root, e))?;
        transfer::sweep_partials(&config.root).await?;

        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .map_err(|e| ConnectionError::Connect {
                addr: config.bind_addr.clone(),
                source: e,
            })?;

        info!(
            "Serving {} on {}",
            config.root.display(),
            listener.local_addr().map_err(ConnectionError::Socket)?
        );

        Ok(Self {
            listener,
            scan: config.scan_options(),
            bandwidth: Arc::new(config.bandwidth()),
            root: config.root,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(ConnectionError::Socket)?)
    }

    /// Accept connections until `shutdown` flips to `true`, then stop every
    /// session and return.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = socket.set_nodelay(true) {
                        debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
                    }

                    info!("Accepted connection from {}", peer);
                    let session = Session::new(
                        peer.to_string(),
                        self.root.clone(),
                        self.scan.clone(),
                        self.bandwidth.clone(),
                    );
                    sessions.spawn(session.run(socket, shutdown.clone()));
                }
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("Session task failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Shutting down server ({} active session(s))", sessions.len());
        while let Some(joined) = sessions.join_next().await {
            if let Err(e) = joined {
                error!("Session task failed: {}", e);
            }
        }

        // Uploads cut short by shutdown leave partial files behind.
        transfer::sweep_partials(&self.root).await?;

        let stats = self.bandwidth.get_stats();
        info!(
            "Server stopped: {} byte(s) received, {} byte(s) sent",
            stats.bytes_downloaded, stats.bytes_uploaded
        );
        Ok(())
    }

    /// Run the accept loop on a background task.
    pub fn spawn(self) -> ServerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let local_addr = self.listener.local_addr().ok();
        let task = tokio::spawn(self.run(shutdown_rx));
        ServerHandle {
            local_addr,
            shutdown_tx,
            task,
        }
    }
}

pub struct ServerHandle {
    local_addr: Option<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop accepting, end all sessions and wait for the server task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.join().await;
    }

    pub async fn join(self) {
        match self.task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Server stopped with error: {}", e),
            Err(e) => error!("Server task failed: {}", e),
        }
    }
}

/// Server-side state of one client connection.
pub struct Session {
    peer: String,
    root: PathBuf,
    started_at: DateTime<Utc>,
    commands_handled: u64,
    scan: ScanOptions,
    bandwidth: Arc<BandwidthManager>,
}

impl Session {
    pub fn new(
        peer: impl Into<String>,
        root: PathBuf,
        scan: ScanOptions,
        bandwidth: Arc<BandwidthManager>,
    ) -> Self {
        Self {
            peer: peer.into(),
            root,
            started_at: Utc::now(),
            commands_handled: 0,
            scan,
            bandwidth,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn commands_handled(&self) -> u64 {
        self.commands_handled
    }

    /// Serve a TCP client until it disconnects, misbehaves or shutdown is signalled.
    pub async fn run(mut self, socket: TcpStream, mut shutdown: watch::Receiver<bool>) {
        let mut conn = Connection::new(socket, self.peer.clone());
        match self.serve(&mut conn, &mut shutdown).await {
            Ok(()) => info!(
                "Session with {} ended after {} command(s) ({}s)",
                self.peer,
                self.commands_handled,
                (Utc::now() - self.started_at).num_seconds()
            ),
            Err(e) if matches!(e, SyncError::Protocol(_)) => {
                warn!("Dropping session with {}: {}", self.peer, e)
            }
            Err(e) => warn!("Session with {} failed: {}", self.peer, e),
        }
    }

    /// Command loop over any byte stream.
    pub async fn serve<S>(
        &mut self,
        conn: &mut Connection<S>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            if *shutdown.borrow() {
                debug!("Session with {} stopping for shutdown", self.peer);
                return Ok(());
            }

            let command = tokio::select! {
                command = conn.read_command() => command,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Server gone.
                        return Ok(());
                    }
                    continue;
                }
            };

            let command = match command {
                Ok(command) => command,
                Err(SyncError::Connection(ConnectionError::Closed)) => {
                    debug!("{} closed the connection", self.peer);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            self.commands_handled += 1;
            let name = command.name();
            debug!("{} sent {}", self.peer, name);

            // A peer stalled mid-transfer must not hold up shutdown.
            let dispatched = tokio::select! {
                result = self.dispatch(conn, command) => result,
                _ = shutdown_requested(shutdown) => {
                    info!("Interrupted {} from {} for shutdown", name, self.peer);
                    return Ok(());
                }
            };
            dispatched?;
        }
    }

    async fn dispatch<S>(&mut self, conn: &mut Connection<S>, command: Command) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match command {
            Command::SyncRequest => self.send_manifest(conn).await,
            Command::Upload { path, size } => {
                transfer::serve_upload(conn, &self.root, &path, size, &self.bandwidth).await
            }
            Command::Download { path } => {
                transfer::serve_download(conn, &self.root, &path, &self.bandwidth).await
            }
            Command::Delete { path } => transfer::serve_delete(conn, &self.root, &path).await,
            other => Err(ProtocolError::Unexpected {
                expected: "a request",
                got: other.name(),
            }
            .into()),
        }
    }

    async fn send_manifest<S>(&self, conn: &mut Connection<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match build_manifest(&self.root, &self.scan).await {
            Ok(manifest) => {
                debug!("Sending manifest of {} file(s) to {}", manifest.len(), self.peer);
                conn.send(&Command::Manifest(manifest)).await
            }
            Err(e) if !e.is_fatal() => {
                warn!("Cannot build manifest for {}: {}", self.peer, e);
                conn.send(&Command::Error {
                    message: e.to_string(),
                })
                .await
            }
            Err(e) => Err(e),
        }
    }
}

/// Resolves once shutdown is signalled or the server is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
