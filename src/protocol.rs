//! # Wire Codec
//!
//! Every message is one frame:
//!
//! ```text
//! +--------+----------------+-------------------+
//! | tag u8 | length u32 BE  | payload[length]   |
//! +--------+----------------+-------------------+
//! ```
//!
//! Strings inside a payload are `u32 BE length | UTF-8 bytes`, integers are
//! big-endian. File bodies are not framed: they follow an `Upload` or
//! `FileSize` command as exactly the declared number of raw bytes.
//!
//! A stream that ends exactly between two frames is a clean disconnect
//! ([`ConnectionError::Closed`]). Ending anywhere else is a
//! [`ProtocolError::Truncated`].

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tracing::trace;

use crate::error::{ConnectionError, ProtocolError, Result, SyncError};
use crate::manifest::{validate_relative_path, Manifest};

/// Largest payload a single frame may carry.
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// Bounded chunk used when streaming file bodies.
pub const CHUNK_SIZE: usize = 64 * 1024;

const TAG_SYNC_REQUEST: u8 = 1;
const TAG_MANIFEST: u8 = 2;
const TAG_UPLOAD: u8 = 3;
const TAG_READY: u8 = 4;
const TAG_UPLOAD_ACK: u8 = 5;
const TAG_DOWNLOAD: u8 = 6;
const TAG_FILE_NOT_FOUND: u8 = 7;
const TAG_FILE_SIZE: u8 = 8;
const TAG_DELETE: u8 = 9;
const TAG_DELETE_ACK: u8 = 10;
const TAG_ERROR: u8 = 11;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SyncRequest,
    Manifest(Manifest),
    Upload { path: String, size: u64 },
    Ready,
    UploadAck,
    Download { path: String },
    FileNotFound,
    FileSize { size: u64 },
    Delete { path: String },
    DeleteAck,
    /// Semantic failure reported by the peer. The connection stays usable.
    Error { message: String },
}

impl Command {
    pub fn tag(&self) -> u8 {
        match self {
            Command::SyncRequest => TAG_SYNC_REQUEST,
            Command::Manifest(_) => TAG_MANIFEST,
            Command::Upload { .. } => TAG_UPLOAD,
            Command::Ready => TAG_READY,
            Command::UploadAck => TAG_UPLOAD_ACK,
            Command::Download { .. } => TAG_DOWNLOAD,
            Command::FileNotFound => TAG_FILE_NOT_FOUND,
            Command::FileSize { .. } => TAG_FILE_SIZE,
            Command::Delete { .. } => TAG_DELETE,
            Command::DeleteAck => TAG_DELETE_ACK,
            Command::Error { .. } => TAG_ERROR,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::SyncRequest => "SYNC_REQUEST",
            Command::Manifest(_) => "MANIFEST",
            Command::Upload { .. } => "UPLOAD",
            Command::Ready => "READY",
            Command::UploadAck => "UPLOAD_ACK",
            Command::Download { .. } => "DOWNLOAD",
            Command::FileNotFound => "FILE_NOT_FOUND",
            Command::FileSize { .. } => "FILE_SIZE",
            Command::Delete { .. } => "DELETE",
            Command::DeleteAck => "DELETE_ACK",
            Command::Error { .. } => "ERROR",
        }
    }

    /// Encode the complete frame, header included.
    pub fn encode(&self) -> std::result::Result<BytesMut, ProtocolError> {
        let mut payload = BytesMut::new();
        match self {
            Command::Manifest(manifest) => {
                let json = manifest.to_json().map_err(|e| ProtocolError::Malformed {
                    command: "MANIFEST",
                    reason: e.to_string(),
                })?;
                payload.put_slice(&json);
            }
            Command::Upload { path, size } => {
                put_string(&mut payload, path);
                payload.put_u64(*size);
            }
            Command::Download { path } | Command::Delete { path } => put_string(&mut payload, path),
            Command::FileSize { size } => payload.put_u64(*size),
            Command::Error { message } => put_string(&mut payload, message),
            Command::SyncRequest
            | Command::Ready
            | Command::UploadAck
            | Command::FileNotFound
            | Command::DeleteAck => {}
        }

        if payload.len() > MAX_FRAME_LEN as usize {
            return Err(ProtocolError::FrameTooLarge {
                len: payload.len() as u64,
                max: MAX_FRAME_LEN as u64,
            });
        }

        let mut frame = BytesMut::with_capacity(5 + payload.len());
        frame.put_u8(self.tag());
        frame.put_u32(payload.len() as u32);
        frame.put_slice(&payload);
        Ok(frame)
    }

    /// Decode one frame from its tag and complete payload.
    pub fn decode(tag: u8, payload: &[u8]) -> std::result::Result<Command, ProtocolError> {
        let name = tag_name(tag).ok_or(ProtocolError::UnknownTag(tag))?;
        let mut reader = PayloadReader { command: name, buf: payload };

        let command = match tag {
            TAG_SYNC_REQUEST => Command::SyncRequest,
            TAG_MANIFEST => {
                let manifest = Manifest::from_json(reader.buf)?;
                reader.buf = &[];
                Command::Manifest(manifest)
            }
            TAG_UPLOAD => {
                let path = reader.path()?;
                let size = reader.u64()?;
                Command::Upload { path, size }
            }
            TAG_READY => Command::Ready,
            TAG_UPLOAD_ACK => Command::UploadAck,
            TAG_DOWNLOAD => Command::Download { path: reader.path()? },
            TAG_FILE_NOT_FOUND => Command::FileNotFound,
            TAG_FILE_SIZE => Command::FileSize { size: reader.u64()? },
            TAG_DELETE => Command::Delete { path: reader.path()? },
            TAG_DELETE_ACK => Command::DeleteAck,
            TAG_ERROR => Command::Error { message: reader.string()? },
            other => return Err(ProtocolError::UnknownTag(other)),
        };

        reader.finish()?;
        Ok(command)
    }
}

fn tag_name(tag: u8) -> Option<&'static str> {
    let name = match tag {
        TAG_SYNC_REQUEST => "SYNC_REQUEST",
        TAG_MANIFEST => "MANIFEST",
        TAG_UPLOAD => "UPLOAD",
        TAG_READY => "READY",
        TAG_UPLOAD_ACK => "UPLOAD_ACK",
        TAG_DOWNLOAD => "DOWNLOAD",
        TAG_FILE_NOT_FOUND => "FILE_NOT_FOUND",
        TAG_FILE_SIZE => "FILE_SIZE",
        TAG_DELETE => "DELETE",
        TAG_DELETE_ACK => "DELETE_ACK",
        TAG_ERROR => "ERROR",
        _ => return None,
    };
    Some(name)
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

struct PayloadReader<'a> {
    command: &'static str,
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn malformed(&self, reason: impl Into<String>) -> ProtocolError {
        ProtocolError::Malformed {
            command: self.command,
            reason: reason.into(),
        }
    }

    fn u64(&mut self) -> std::result::Result<u64, ProtocolError> {
        if self.buf.remaining() < 8 {
            return Err(self.malformed("payload too short for u64"));
        }
        Ok(self.buf.get_u64())
    }

    fn string(&mut self) -> std::result::Result<String, ProtocolError> {
        if self.buf.remaining() < 4 {
            return Err(self.malformed("payload too short for string length"));
        }
        let len = self.buf.get_u32() as usize;
        if self.buf.remaining() < len {
            return Err(self.malformed(format!("string of {} bytes overruns payload", len)));
        }
        let (bytes, rest) = self.buf.split_at(len);
        self.buf = rest;
        String::from_utf8(bytes.to_vec()).map_err(|e| self.malformed(e.to_string()))
    }

    fn path(&mut self) -> std::result::Result<String, ProtocolError> {
        let path = self.string()?;
        validate_relative_path(&path)?;
        Ok(path)
    }

    fn finish(&self) -> std::result::Result<(), ProtocolError> {
        if self.buf.has_remaining() {
            return Err(self.malformed(format!("{} trailing bytes", self.buf.remaining())));
        }
        Ok(())
    }
}

fn read_error(err: io::Error, what: &'static str) -> SyncError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::Truncated(what).into()
    } else {
        ConnectionError::Socket(err).into()
    }
}

/// A framed, buffered byte stream to one peer.
///
/// All reads and writes go through `&mut self`, so whoever owns the
/// connection is its only reader and writer.
pub struct Connection<S> {
    stream: BufStream<S>,
    peer: String,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream: BufStream::new(stream),
            peer: peer.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Buffer one frame. Call [`flush`](Self::flush) or use [`send`](Self::send).
    pub async fn write_command(&mut self, command: &Command) -> Result<()> {
        let frame = command.encode()?;
        trace!("-> {} {} ({} bytes)", self.peer, command.name(), frame.len());
        self.stream
            .write_all(&frame)
            .await
            .map_err(ConnectionError::Socket)?;
        Ok(())
    }

    /// Write one frame and flush it to the socket.
    pub async fn send(&mut self, command: &Command) -> Result<()> {
        self.write_command(command).await?;
        self.flush().await
    }

    pub async fn read_command(&mut self) -> Result<Command> {
        let tag = match self.stream.read_u8().await {
            Ok(tag) => tag,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(ConnectionError::Closed.into())
            }
            Err(e) => return Err(ConnectionError::Socket(e).into()),
        };
        if tag_name(tag).is_none() {
            return Err(ProtocolError::UnknownTag(tag).into());
        }

        let len = self
            .stream
            .read_u32()
            .await
            .map_err(|e| read_error(e, "frame header"))?;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge {
                len: len as u64,
                max: MAX_FRAME_LEN as u64,
            }
            .into());
        }

        let mut payload = vec![0u8; len as usize];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| read_error(e, "frame payload"))?;

        let command = Command::decode(tag, &payload)?;
        trace!("<- {} {} ({} bytes)", self.peer, command.name(), len);
        Ok(command)
    }

    /// Read the next frame and require the unit reply `expected`.
    ///
    /// An `Error` frame from the peer is returned as the inner `Err` so the
    /// caller can treat it as a per-file failure.
    pub async fn expect(&mut self, expected: Command) -> Result<std::result::Result<(), String>> {
        match self.read_command().await? {
            Command::Error { message } => Ok(Err(message)),
            got if got == expected => Ok(Ok(())),
            got => Err(ProtocolError::Unexpected {
                expected: expected.name(),
                got: got.name(),
            }
            .into()),
        }
    }

    /// Buffer raw body bytes.
    pub async fn write_blob(&mut self, data: &[u8]) -> Result<()> {
        self.stream
            .write_all(data)
            .await
            .map_err(ConnectionError::Socket)?;
        Ok(())
    }

    /// Read exactly `expected_len` raw body bytes.
    pub async fn read_blob(&mut self, expected_len: u64) -> Result<Vec<u8>> {
        if expected_len > MAX_FRAME_LEN as u64 {
            return Err(ProtocolError::FrameTooLarge {
                len: expected_len,
                max: MAX_FRAME_LEN as u64,
            }
            .into());
        }
        let mut data = vec![0u8; expected_len as usize];
        self.read_blob_into(&mut data).await?;
        Ok(data)
    }

    /// Fill `buf` completely with raw body bytes.
    pub async fn read_blob_into(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream
            .read_exact(buf)
            .await
            .map_err(|e| read_error(e, "file body"))?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.stream.flush().await.map_err(ConnectionError::Socket)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Digest;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tokio::io::{duplex, DuplexStream};

    fn pair() -> (Connection<DuplexStream>, Connection<DuplexStream>) {
        let (a, b) = duplex(256 * 1024);
        (Connection::new(a, "left"), Connection::new(b, "right"))
    }

    #[test]
    fn test_frame_layout() {
        let frame = Command::Download { path: "a/b.txt".into() }.encode().unwrap();
        assert_eq!(frame[0], 6);
        assert_eq!(&frame[1..5], &11u32.to_be_bytes());
        assert_eq!(&frame[5..9], &7u32.to_be_bytes());
        assert_eq!(&frame[9..], b"a/b.txt");

        let frame = Command::Ready.encode().unwrap();
        assert_eq!(&frame[..], &[4, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_conversation_survives_stream_boundaries() {
        let (mut left, mut right) = pair();
        let manifest: Manifest = [("dir/x.bin".to_string(), Digest::of_bytes(b"x"))].into_iter().collect();

        let sent = vec![
            Command::SyncRequest,
            Command::Manifest(manifest),
            Command::Upload { path: "dir/x.bin".into(), size: 3 },
            Command::FileSize { size: u64::MAX },
            Command::Delete { path: "old.txt".into() },
            Command::Error { message: "disk full".into() },
            Command::DeleteAck,
        ];

        let writer = tokio::spawn(async move {
            for command in &sent {
                left.write_command(command).await.unwrap();
            }
            left.flush().await.unwrap();
            (left, sent)
        });

        let mut received = Vec::new();
        for _ in 0..7 {
            received.push(right.read_command().await.unwrap());
        }
        let (_left, sent) = writer.await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_eof_at_boundary_is_closed() {
        let (mut left, mut right) = pair();
        left.send(&Command::Ready).await.unwrap();
        drop(left);

        assert_eq!(right.read_command().await.unwrap(), Command::Ready);
        assert_matches!(
            right.read_command().await,
            Err(SyncError::Connection(ConnectionError::Closed))
        );
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_truncated() {
        let (mut raw, b) = duplex(1024);
        let mut conn = Connection::new(b, "peer");

        let frame = Command::Delete { path: "a.txt".into() }.encode().unwrap();
        raw.write_all(&frame[..frame.len() - 2]).await.unwrap();
        drop(raw);

        assert_matches!(
            conn.read_command().await,
            Err(SyncError::Protocol(ProtocolError::Truncated(_)))
        );
    }

    #[tokio::test]
    async fn test_eof_inside_header_is_truncated() {
        let (mut raw, b) = duplex(1024);
        let mut conn = Connection::new(b, "peer");
        raw.write_all(&[TAG_READY, 0, 0]).await.unwrap();
        drop(raw);

        assert_matches!(
            conn.read_command().await,
            Err(SyncError::Protocol(ProtocolError::Truncated("frame header")))
        );
    }

    #[tokio::test]
    async fn test_rejects_bad_frames() {
        let (mut raw, b) = duplex(1024);
        let mut conn = Connection::new(b, "peer");
        raw.write_all(&[0x7f, 0, 0, 0, 0]).await.unwrap();
        assert_matches!(
            conn.read_command().await,
            Err(SyncError::Protocol(ProtocolError::UnknownTag(0x7f)))
        );

        let (mut raw, b) = duplex(1024);
        let mut conn = Connection::new(b, "peer");
        raw.write_all(&[TAG_MANIFEST, 0xff, 0xff, 0xff, 0xff]).await.unwrap();
        assert_matches!(
            conn.read_command().await,
            Err(SyncError::Protocol(ProtocolError::FrameTooLarge { .. }))
        );
    }

    #[test]
    fn test_decode_validation() {
        // trailing byte after a unit command
        assert_matches!(Command::decode(TAG_READY, &[0]), Err(ProtocolError::Malformed { .. }));

        // string length overruns payload
        assert_matches!(
            Command::decode(TAG_DOWNLOAD, &[0, 0, 0, 9, b'a']),
            Err(ProtocolError::Malformed { command: "DOWNLOAD", .. })
        );

        // invalid UTF-8
        assert_matches!(
            Command::decode(TAG_ERROR, &[0, 0, 0, 2, 0xc3, 0x28]),
            Err(ProtocolError::Malformed { command: "ERROR", .. })
        );

        // path escaping the root
        let mut payload = BytesMut::new();
        put_string(&mut payload, "../etc/passwd");
        assert_matches!(
            Command::decode(TAG_DELETE, &payload),
            Err(ProtocolError::InvalidPath(_))
        );

        // upload missing its size
        let mut payload = BytesMut::new();
        put_string(&mut payload, "a.txt");
        assert_matches!(
            Command::decode(TAG_UPLOAD, &payload),
            Err(ProtocolError::Malformed { command: "UPLOAD", .. })
        );
    }

    #[tokio::test]
    async fn test_expect_reports_peer_error() {
        let (mut left, mut right) = pair();
        left.send(&Command::Error { message: "no space".into() }).await.unwrap();
        left.send(&Command::UploadAck).await.unwrap();
        left.send(&Command::DeleteAck).await.unwrap();

        assert_eq!(right.expect(Command::Ready).await.unwrap(), Err("no space".to_string()));
        assert_eq!(right.expect(Command::UploadAck).await.unwrap(), Ok(()));
        assert_matches!(
            right.expect(Command::Ready).await,
            Err(SyncError::Protocol(ProtocolError::Unexpected { expected: "READY", got: "DELETE_ACK" }))
        );
    }

    #[tokio::test]
    async fn test_blob_follows_command() {
        let (mut left, mut right) = pair();
        left.write_command(&Command::FileSize { size: 5 }).await.unwrap();
        left.write_blob(b"hello").await.unwrap();
        left.send(&Command::Ready).await.unwrap();

        assert_eq!(right.read_command().await.unwrap(), Command::FileSize { size: 5 });
        assert_eq!(right.read_blob(5).await.unwrap(), b"hello");
        assert_eq!(right.read_command().await.unwrap(), Command::Ready);
    }

    #[tokio::test]
    async fn test_short_blob_is_truncated() {
        let (mut left, mut right) = pair();
        left.write_blob(b"abc").await.unwrap();
        left.flush().await.unwrap();
        drop(left);

        assert_matches!(
            right.read_blob(10).await,
            Err(SyncError::Protocol(ProtocolError::Truncated("file body")))
        );
    }
}
