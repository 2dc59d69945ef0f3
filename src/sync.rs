//! # Sync Coordinator
//!
//! One sync pass over an established connection:
//!
//! 1. `SYNC_REQUEST` and read back the peer's manifest
//! 2. build the local manifest
//! 3. [`diff::plan`] the two against the last agreed baseline
//! 4. uploads, downloads, remote deletes, local deletes, in that order
//!
//! Per-file failures are collected in the [`SyncReport`] and the pass moves
//! on. Protocol and connection errors abort the pass, since the stream can no
//! longer be trusted.

use chrono::{DateTime, Utc};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::bandwidth::BandwidthManager;
use crate::diff::{self, ConflictPolicy, Delta};
use crate::error::{ProtocolError, Result, SyncError, TransferError};
use crate::events::{emit, LogLevel, SyncObserver};
use crate::manifest::{build_manifest, Manifest, ScanOptions};
use crate::protocol::{Command, Connection};
use crate::transfer;

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub scan: ScanOptions,
    pub conflict_policy: ConflictPolicy,
    pub bandwidth: Arc<BandwidthManager>,
}

/// A path whose action failed during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFailure {
    pub path: String,
    pub action: Delta,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct SyncReport {
    pub uploaded: Vec<String>,
    pub downloaded: Vec<String>,
    pub deleted_local: Vec<String>,
    pub deleted_remote: Vec<String>,
    pub failures: Vec<TransferFailure>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            uploaded: Vec::new(),
            downloaded: Vec::new(),
            deleted_local: Vec::new(),
            deleted_remote: Vec::new(),
            failures: Vec::new(),
            bytes_sent: 0,
            bytes_received: 0,
            started_at,
            finished_at: started_at,
        }
    }

    pub fn deleted(&self) -> usize {
        self.deleted_local.len() + self.deleted_remote.len()
    }

    /// Successful transfers and deletes.
    pub fn action_count(&self) -> usize {
        self.uploaded.len() + self.downloaded.len() + self.deleted()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} uploaded, {} downloaded, {} deleted",
            self.uploaded.len(),
            self.downloaded.len(),
            self.deleted()
        )?;
        if !self.failures.is_empty() {
            write!(f, ", {} failed", self.failures.len())?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct SyncOutcome {
    pub report: SyncReport,
    /// Manifest both sides agree on after this pass.
    pub baseline: Manifest,
}

/// Ask the peer for its manifest.
pub async fn request_manifest<S>(conn: &mut Connection<S>) -> Result<Manifest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.send(&Command::SyncRequest).await?;
    match conn.read_command().await? {
        Command::Manifest(manifest) => Ok(manifest),
        Command::Error { message } => Err(TransferError::PeerFailed {
            command: "SYNC_REQUEST",
            message,
        }
        .into()),
        other => Err(ProtocolError::Unexpected {
            expected: "MANIFEST",
            got: other.name(),
        }
        .into()),
    }
}

/// Run one full sync pass against the peer on `conn`.
///
/// `baseline` is the manifest returned by the previous successful pass on
/// this connection, or `None` on the first pass (nothing is deleted then).
pub async fn run_sync<S>(
    conn: &mut Connection<S>,
    root: &Path,
    options: &SyncOptions,
    baseline: Option<&Manifest>,
    observer: &dyn SyncObserver,
) -> Result<SyncOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut report = SyncReport::new(Utc::now());

    let remote = request_manifest(conn).await?;
    let local = build_manifest(root, &options.scan).await?;
    let plan = diff::plan(&local, &remote, baseline, options.conflict_policy);

    emit(
        observer,
        LogLevel::Info,
        format!(
            "Sync with {}: {} to upload, {} to download, {} to delete remotely, {} to delete locally",
            conn.peer(),
            plan.upload.len(),
            plan.download.len(),
            plan.delete_remote.len(),
            plan.delete_local.len()
        ),
    );

    let mut agreed: Manifest = plan
        .unchanged
        .iter()
        .filter_map(|path| local.get(path).map(|digest| (path.clone(), *digest)))
        .collect();

    // A failed path keeps whatever the sides agreed on before, so the next
    // pass still knows which side changed.
    let keep_previous = |agreed: &mut Manifest, path: &str| {
        if let Some(digest) = baseline.and_then(|b| b.get(path)) {
            agreed.insert(path, *digest);
        }
    };

    for path in &plan.upload {
        match transfer::send_file(conn, root, path, &options.bandwidth).await {
            Ok(descriptor) => {
                report.bytes_sent += descriptor.bytes_moved;
                report.uploaded.push(path.clone());
                if let Some(digest) = local.get(path) {
                    agreed.insert(path.as_str(), *digest);
                }
            }
            Err(e) => {
                record_failure(&mut report, observer, path, Delta::ToUpload, e)?;
                keep_previous(&mut agreed, path);
            }
        }
    }

    for path in &plan.download {
        match transfer::request_download(conn, root, path, &options.bandwidth).await {
            Ok(descriptor) => {
                report.bytes_received += descriptor.bytes_moved;
                report.downloaded.push(path.clone());
                if let Some(digest) = remote.get(path) {
                    agreed.insert(path.as_str(), *digest);
                }
            }
            Err(e) => {
                record_failure(&mut report, observer, path, Delta::ToDownload, e)?;
                keep_previous(&mut agreed, path);
            }
        }
    }

    for path in &plan.delete_remote {
        match transfer::request_delete(conn, path).await {
            Ok(()) => report.deleted_remote.push(path.clone()),
            Err(e) => {
                record_failure(&mut report, observer, path, Delta::ToDeleteRemote, e)?;
                keep_previous(&mut agreed, path);
            }
        }
    }

    for path in &plan.delete_local {
        match transfer::delete_local(root, path).await {
            Ok(_) => report.deleted_local.push(path.clone()),
            Err(e) => {
                record_failure(&mut report, observer, path, Delta::ToDeleteLocal, e)?;
                keep_previous(&mut agreed, path);
            }
        }
    }

    report.finished_at = Utc::now();
    let level = if report.is_clean() { LogLevel::Info } else { LogLevel::Warn };
    emit(observer, level, format!("Sync with {} finished: {}", conn.peer(), report));
    observer.on_sync_completed(&report);

    Ok(SyncOutcome {
        report,
        baseline: agreed,
    })
}

/// Record a per-file failure, or hand back errors that end the pass.
fn record_failure(
    report: &mut SyncReport,
    observer: &dyn SyncObserver,
    path: &str,
    action: Delta,
    error: SyncError,
) -> Result<()> {
    if error.is_fatal() {
        emit(
            observer,
            LogLevel::Error,
            format!("{} of {} aborted the sync pass: {}", action.label(), path, error),
        );
        return Err(error);
    }

    emit(observer, LogLevel::Warn, format!("{} of {} failed: {}", action.label(), path, error));
    report.failures.push(TransferFailure {
        path: path.to_string(),
        action,
        reason: error.to_string(),
    });
    Ok(())
}

/// At most one sync pass in flight per connection.
#[derive(Debug, Clone, Default)]
pub struct SyncGate {
    busy: Arc<AtomicBool>,
}

impl SyncGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the gate. `None` when a pass is already running.
    pub fn try_begin(&self) -> Option<SyncGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SyncGuard {
                busy: self.busy.clone(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the [`SyncGate`] when dropped.
#[derive(Debug)]
pub struct SyncGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
