//! # Transfer Engine
//!
//! Moves one whole file across an established [`Connection`], in either
//! direction, plus the matching server halves. Bodies are streamed in
//! [`CHUNK_SIZE`] pieces so memory use does not depend on file size.
//!
//! Received files are written to a hidden temporary next to the destination
//! (`.<name>.<uuid>.tsync-part`) and renamed into place only once every
//! declared byte has arrived and been flushed to disk. An interrupted
//! download therefore never shows up under the final name.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bandwidth::BandwidthManager;
use crate::error::{ConnectionError, ProtocolError, Result, SyncError, TransferError};
use crate::manifest::{resolve, TEMP_SUFFIX};
use crate::protocol::{Command, Connection, CHUNK_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Progress of one transfer. Lives for the duration of a single call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub path: String,
    pub direction: Direction,
    pub declared_size: u64,
    pub bytes_moved: u64,
}

impl TransferDescriptor {
    fn new(path: &str, direction: Direction, declared_size: u64) -> Self {
        Self {
            path: path.to_string(),
            direction,
            declared_size,
            bytes_moved: 0,
        }
    }

    fn remaining(&self) -> u64 {
        self.declared_size - self.bytes_moved
    }
}

/// Hidden sibling used while `final_path` is being received.
pub fn temp_path_for(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!(".{}.{}{}", name, Uuid::new_v4().simple(), TEMP_SUFFIX))
}

/// Push `rel_path` to the peer: `UPLOAD`, wait for `READY`, stream, wait for `UPLOAD_ACK`.
pub async fn send_file<S>(
    conn: &mut Connection<S>,
    root: &Path,
    rel_path: &str,
    bandwidth: &BandwidthManager,
) -> Result<TransferDescriptor>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let path = resolve(root, rel_path)?;
    let (file, size) = match open_source(&path).await {
        Ok(Some(source)) => source,
        Ok(None) => {
            return Err(TransferError::SourceVanished {
                path: rel_path.to_string(),
            }
            .into())
        }
        Err(e) => return Err(SyncError::io(&path, e)),
    };

    let mut descriptor = TransferDescriptor::new(rel_path, Direction::Upload, size);
    conn.send(&Command::Upload {
        path: rel_path.to_string(),
        size,
    })
    .await?;

    if let Err(message) = conn.expect(Command::Ready).await? {
        return Err(TransferError::Rejected {
            path: rel_path.to_string(),
            message,
        }
        .into());
    }

    stream_body(conn, file, &mut descriptor, bandwidth).await?;

    if let Err(message) = conn.expect(Command::UploadAck).await? {
        return Err(TransferError::Rejected {
            path: rel_path.to_string(),
            message,
        }
        .into());
    }

    info!("Uploaded {} ({} bytes) to {}", rel_path, descriptor.bytes_moved, conn.peer());
    Ok(descriptor)
}

/// Receive exactly `declared_size` body bytes into `rel_path`.
///
/// The declared bytes are always consumed from the stream, even when the
/// local write fails, so the connection stays aligned on frame boundaries.
pub async fn receive_file<S>(
    conn: &mut Connection<S>,
    root: &Path,
    rel_path: &str,
    declared_size: u64,
    bandwidth: &BandwidthManager,
) -> Result<TransferDescriptor>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let final_path = resolve(root, rel_path)?;
    let temp_path = temp_path_for(&final_path);
    let mut descriptor = TransferDescriptor::new(rel_path, Direction::Download, declared_size);

    let mut sink = open_temp(&final_path, &temp_path).await;
    let mut buffer = vec![0u8; CHUNK_SIZE];

    while descriptor.remaining() > 0 {
        let n = descriptor.remaining().min(CHUNK_SIZE as u64) as usize;
        if let Err(e) = conn.read_blob_into(&mut buffer[..n]).await {
            drop(sink);
            discard(&temp_path).await;
            return Err(e);
        }
        bandwidth.request_download_quota(n as u64).await;
        descriptor.bytes_moved += n as u64;

        if let Ok(file) = &mut sink {
            if let Err(e) = file.write_all(&buffer[..n]).await {
                sink = Err(SyncError::io(&temp_path, e));
            }
        }
    }

    let committed = match sink {
        Ok(file) => commit(file, &temp_path, &final_path, &descriptor).await,
        Err(e) => Err(e),
    };
    if let Err(e) = committed {
        discard(&temp_path).await;
        return Err(e);
    }

    info!("Received {} ({} bytes) from {}", rel_path, descriptor.bytes_moved, conn.peer());
    Ok(descriptor)
}

/// Pull `rel_path` from the peer: `DOWNLOAD`, then `FILE_NOT_FOUND` or
/// `FILE_SIZE`, reply `READY`, receive.
pub async fn request_download<S>(
    conn: &mut Connection<S>,
    root: &Path,
    rel_path: &str,
    bandwidth: &BandwidthManager,
) -> Result<TransferDescriptor>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.send(&Command::Download {
        path: rel_path.to_string(),
    })
    .await?;

    match conn.read_command().await? {
        Command::FileSize { size } => {
            conn.send(&Command::Ready).await?;
            receive_file(conn, root, rel_path, size, bandwidth).await
        }
        Command::FileNotFound => Err(TransferError::NotFound {
            path: rel_path.to_string(),
        }
        .into()),
        Command::Error { message } => Err(TransferError::Rejected {
            path: rel_path.to_string(),
            message,
        }
        .into()),
        other => Err(ProtocolError::Unexpected {
            expected: "FILE_SIZE",
            got: other.name(),
        }
        .into()),
    }
}

/// Ask the peer to delete `rel_path`.
pub async fn request_delete<S>(conn: &mut Connection<S>, rel_path: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.send(&Command::Delete {
        path: rel_path.to_string(),
    })
    .await?;

    if let Err(message) = conn.expect(Command::DeleteAck).await? {
        return Err(TransferError::Rejected {
            path: rel_path.to_string(),
            message,
        }
        .into());
    }
    debug!("Peer {} deleted {}", conn.peer(), rel_path);
    Ok(())
}

/// Answer an `UPLOAD` command.
///
/// A local write failure is reported to the peer with an `ERROR` frame and
/// does not end the session.
pub async fn serve_upload<S>(
    conn: &mut Connection<S>,
    root: &Path,
    rel_path: &str,
    size: u64,
    bandwidth: &BandwidthManager,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.send(&Command::Ready).await?;

    match receive_file(conn, root, rel_path, size, bandwidth).await {
        Ok(_) => conn.send(&Command::UploadAck).await,
        Err(e) if !e.is_fatal() => {
            warn!("Upload of {} from {} failed: {}", rel_path, conn.peer(), e);
            conn.send(&Command::Error {
                message: e.to_string(),
            })
            .await
        }
        Err(e) => Err(e),
    }
}

/// Answer a `DOWNLOAD` command.
pub async fn serve_download<S>(
    conn: &mut Connection<S>,
    root: &Path,
    rel_path: &str,
    bandwidth: &BandwidthManager,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let path = resolve(root, rel_path)?;
    let (file, size) = match open_source(&path).await {
        Ok(Some(source)) => source,
        Ok(None) => {
            debug!("{} asked for missing {}", conn.peer(), rel_path);
            return conn.send(&Command::FileNotFound).await;
        }
        Err(e) => {
            warn!("Cannot serve {} to {}: {}", rel_path, conn.peer(), e);
            return conn
                .send(&Command::Error {
                    message: format!("cannot read {}: {}", rel_path, e),
                })
                .await;
        }
    };

    conn.send(&Command::FileSize { size }).await?;
    if let Err(message) = conn.expect(Command::Ready).await? {
        debug!("{} declined {}: {}", conn.peer(), rel_path, message);
        return Ok(());
    }

    let mut descriptor = TransferDescriptor::new(rel_path, Direction::Upload, size);
    stream_body(conn, file, &mut descriptor, bandwidth).await?;
    info!("Sent {} ({} bytes) to {}", rel_path, descriptor.bytes_moved, conn.peer());
    Ok(())
}

/// Answer a `DELETE` command. Deleting a missing path succeeds.
pub async fn serve_delete<S>(conn: &mut Connection<S>, root: &Path, rel_path: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match delete_local(root, rel_path).await {
        Ok(_) => conn.send(&Command::DeleteAck).await,
        Err(e) if !e.is_fatal() => {
            warn!("Delete of {} for {} failed: {}", rel_path, conn.peer(), e);
            conn.send(&Command::Error {
                message: e.to_string(),
            })
            .await
        }
        Err(e) => Err(e),
    }
}

/// Remove a file under `root`, then prune parent directories left empty.
///
/// Returns whether a file was actually removed.
pub async fn delete_local(root: &Path, rel_path: &str) -> Result<bool> {
    let path = resolve(root, rel_path)?;

    match tokio::fs::remove_file(&path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(SyncError::io(&path, e)),
    }

    let mut dir = path.parent();
    while let Some(current) = dir {
        if current == root || !current.starts_with(root) {
            break;
        }
        // Fails on the first non-empty directory.
        if tokio::fs::remove_dir(current).await.is_err() {
            break;
        }
        dir = current.parent();
    }

    info!("Deleted {}", rel_path);
    Ok(true)
}

/// Remove `.tsync-part` leftovers from interrupted transfers under `root`.
pub async fn sweep_partials(root: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(SyncError::io(&dir, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SyncError::io(&dir, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| SyncError::io(entry.path(), e))?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() && entry.file_name().to_string_lossy().ends_with(TEMP_SUFFIX) {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| SyncError::io(&path, e))?;
                removed += 1;
            }
        }
    }

    if removed > 0 {
        info!("Removed {} stale partial file(s) under {}", removed, root.display());
    }
    Ok(removed)
}

/// Open a regular file for sending. `Ok(None)` when it is gone.
async fn open_source(path: &Path) -> io::Result<Option<(File, u64)>> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let metadata = file.metadata().await?;
    if !metadata.is_file() {
        return Ok(None);
    }
    Ok(Some((file, metadata.len())))
}

async fn stream_body<S, R>(
    conn: &mut Connection<S>,
    mut reader: R,
    descriptor: &mut TransferDescriptor,
    bandwidth: &BandwidthManager,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];

    while descriptor.remaining() > 0 {
        let want = descriptor.remaining().min(CHUNK_SIZE as u64) as usize;
        // Bytes already promised to the peer cannot be taken back, so any
        // failure here leaves the stream unusable.
        let n = reader.read(&mut buffer[..want]).await.map_err(|e| {
            ConnectionError::Aborted(format!("reading {} failed mid-transfer: {}", descriptor.path, e))
        })?;
        if n == 0 {
            return Err(ConnectionError::Aborted(format!(
                "{} shrank to {} of {} declared bytes",
                descriptor.path, descriptor.bytes_moved, descriptor.declared_size
            ))
            .into());
        }

        bandwidth.request_upload_quota(n as u64).await;
        conn.write_blob(&buffer[..n]).await?;
        descriptor.bytes_moved += n as u64;
    }

    conn.flush().await
}

async fn open_temp(final_path: &Path, temp_path: &Path) -> Result<File> {
    if let Some(parent) = final_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::io(parent, e))?;
    }
    File::create(temp_path)
        .await
        .map_err(|e| SyncError::io(temp_path, e))
}

async fn commit(
    mut file: File,
    temp_path: &Path,
    final_path: &Path,
    descriptor: &TransferDescriptor,
) -> Result<()> {
    file.flush().await.map_err(|e| SyncError::io(temp_path, e))?;
    file.sync_all().await.map_err(|e| SyncError::io(temp_path, e))?;

    let actual = file
        .metadata()
        .await
        .map_err(|e| SyncError::io(temp_path, e))?
        .len();
    if actual != descriptor.declared_size {
        return Err(TransferError::SizeMismatch {
            path: descriptor.path.clone(),
            expected: descriptor.declared_size,
            actual,
        }
        .into());
    }
    drop(file);

    tokio::fs::rename(temp_path, final_path)
        .await
        .map_err(|e| SyncError::io(final_path, e))
}

async fn discard(temp_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(temp_path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove partial file {}: {}", temp_path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;
    use tokio::io::{duplex, DuplexStream};

    fn pair() -> (Connection<DuplexStream>, Connection<DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        (Connection::new(a, "client"), Connection::new(b, "server"))
    }

    /// Minimal server loop: answers commands until the client hangs up.
    fn spawn_peer(mut conn: Connection<DuplexStream>, root: PathBuf) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move {
            let bandwidth = BandwidthManager::unlimited();
            loop {
                match conn.read_command().await {
                    Ok(Command::Upload { path, size }) => {
                        serve_upload(&mut conn, &root, &path, size, &bandwidth).await?
                    }
                    Ok(Command::Download { path }) => serve_download(&mut conn, &root, &path, &bandwidth).await?,
                    Ok(Command::Delete { path }) => serve_delete(&mut conn, &root, &path).await?,
                    Ok(other) => panic!("unexpected {:?}", other),
                    Err(SyncError::Connection(ConnectionError::Closed)) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        })
    }

    async fn names_in(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        names
    }

    #[test]
    fn test_temp_path_is_hidden_sibling() {
        let temp = temp_path_for(Path::new("/srv/root/docs/a.txt"));
        assert_eq!(temp.parent(), Some(Path::new("/srv/root/docs")));
        let name = temp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".a.txt."));
        assert!(name.ends_with(TEMP_SUFFIX));
    }

    #[tokio::test]
    async fn test_upload_then_download_round_trip() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let fresh = TempDir::new().unwrap();

        // Several chunks plus a tail.
        let data: Vec<u8> = (0..(CHUNK_SIZE * 2 + 123)).map(|i| (i % 7) as u8).collect();
        tokio::fs::create_dir_all(local.path().join("nested")).await.unwrap();
        tokio::fs::write(local.path().join("nested/blob.bin"), &data).await.unwrap();

        let (mut client, server) = pair();
        let peer = spawn_peer(server, remote.path().to_path_buf());
        let bandwidth = BandwidthManager::unlimited();

        let sent = send_file(&mut client, local.path(), "nested/blob.bin", &bandwidth).await.unwrap();
        assert_eq!(sent.bytes_moved, data.len() as u64);
        assert_eq!(tokio::fs::read(remote.path().join("nested/blob.bin")).await.unwrap(), data);

        let received = request_download(&mut client, fresh.path(), "nested/blob.bin", &bandwidth).await.unwrap();
        assert_eq!(received.direction, Direction::Download);
        assert_eq!(tokio::fs::read(fresh.path().join("nested/blob.bin")).await.unwrap(), data);
        assert_eq!(names_in(&fresh.path().join("nested")).await, vec!["blob.bin"]);

        drop(client);
        peer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_empty_file_transfers() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        tokio::fs::write(local.path().join("empty"), b"").await.unwrap();

        let (mut client, server) = pair();
        let _peer = spawn_peer(server, remote.path().to_path_buf());

        send_file(&mut client, local.path(), "empty", &BandwidthManager::unlimited()).await.unwrap();
        assert_eq!(tokio::fs::read(remote.path().join("empty")).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_vanished_source_sends_nothing() {
        let local = TempDir::new().unwrap();
        let (mut client, mut server) = pair();

        let result = send_file(&mut client, local.path(), "gone.txt", &BandwidthManager::unlimited()).await;
        assert_matches!(result, Err(SyncError::Transfer(TransferError::SourceVanished { .. })));

        drop(client);
        assert_matches!(
            server.read_command().await,
            Err(SyncError::Connection(ConnectionError::Closed))
        );
    }

    #[tokio::test]
    async fn test_download_missing_is_not_found() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        let (mut client, server) = pair();
        let _peer = spawn_peer(server, remote.path().to_path_buf());

        let result = request_download(&mut client, local.path(), "nope.txt", &BandwidthManager::unlimited()).await;
        assert_matches!(result, Err(SyncError::Transfer(TransferError::NotFound { .. })));
        assert!(!local.path().join("nope.txt").exists());
    }

    #[tokio::test]
    async fn test_truncated_body_leaves_no_file() {
        let root = TempDir::new().unwrap();
        let (mut sender, mut receiver) = pair();

        sender.write_blob(b"abc").await.unwrap();
        sender.flush().await.unwrap();
        drop(sender);

        let result = receive_file(&mut receiver, root.path(), "dir/partial.txt", 10, &BandwidthManager::unlimited()).await;
        assert_matches!(result, Err(SyncError::Protocol(ProtocolError::Truncated(_))));
        assert!(!root.path().join("dir/partial.txt").exists());
        assert!(names_in(&root.path().join("dir")).await.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_upload_keeps_connection_usable() {
        let local = TempDir::new().unwrap();
        let remote = TempDir::new().unwrap();
        // A file where the server would need a directory.
        tokio::fs::write(remote.path().join("blocker"), b"file").await.unwrap();
        tokio::fs::create_dir_all(local.path().join("blocker")).await.unwrap();
        tokio::fs::write(local.path().join("blocker/inner.txt"), b"payload").await.unwrap();
        tokio::fs::write(local.path().join("ok.txt"), b"fine").await.unwrap();

        let (mut client, server) = pair();
        let _peer = spawn_peer(server, remote.path().to_path_buf());
        let bandwidth = BandwidthManager::unlimited();

        let result = send_file(&mut client, local.path(), "blocker/inner.txt", &bandwidth).await;
        assert_matches!(result, Err(SyncError::Transfer(TransferError::Rejected { .. })));

        send_file(&mut client, local.path(), "ok.txt", &bandwidth).await.unwrap();
        assert_eq!(tokio::fs::read(remote.path().join("ok.txt")).await.unwrap(), b"fine");
    }

    #[tokio::test]
    async fn test_remote_delete_is_idempotent() {
        let remote = TempDir::new().unwrap();
        tokio::fs::write(remote.path().join("a.txt"), b"x").await.unwrap();

        let (mut client, server) = pair();
        let _peer = spawn_peer(server, remote.path().to_path_buf());

        request_delete(&mut client, "a.txt").await.unwrap();
        request_delete(&mut client, "a.txt").await.unwrap();
        assert!(!remote.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_delete_local_prunes_empty_parents() {
        let root = TempDir::new().unwrap();
        tokio::fs::create_dir_all(root.path().join("a/b/c")).await.unwrap();
        tokio::fs::write(root.path().join("a/b/c/file"), b"1").await.unwrap();
        tokio::fs::write(root.path().join("a/keep"), b"2").await.unwrap();

        assert!(delete_local(root.path(), "a/b/c/file").await.unwrap());
        assert!(!root.path().join("a/b").exists());
        assert!(root.path().join("a/keep").exists());
        assert!(root.path().exists());

        assert!(!delete_local(root.path(), "a/b/c/file").await.unwrap());
        assert_matches!(
            delete_local(root.path(), "../outside").await,
            Err(SyncError::Protocol(ProtocolError::InvalidPath(_)))
        );
    }

    #[tokio::test]
    async fn test_sweep_partials() {
        let root = TempDir::new().unwrap();
        tokio::fs::create_dir_all(root.path().join("sub")).await.unwrap();
        tokio::fs::write(root.path().join("sub/.a.txt.1234.tsync-part"), b"half").await.unwrap();
        tokio::fs::write(root.path().join("real.txt"), b"whole").await.unwrap();

        assert_eq!(sweep_partials(root.path()).await.unwrap(), 1);
        assert!(names_in(&root.path().join("sub")).await.is_empty());
        assert!(root.path().join("real.txt").exists());
    }
}
