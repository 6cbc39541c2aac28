//! Wire protocol for file transfers between toolkit instances.
//!
//! Every frame on the stream is a 4-byte big-endian length followed by that
//! many bytes of UTF-8 JSON. A `file` frame is immediately followed by the
//! announced number of raw payload bytes. The functions here are generic
//! over the stream so sessions run identically over TCP and over in-memory
//! duplex pipes in tests.

use crate::error::{Result, ToolkitError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Upper bound on a frame header; anything larger is a protocol violation.
pub const MAX_HEADER_BYTES: u32 = 64 * 1024;

/// Payload streaming buffer size.
const CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Opens a transfer session and tells the receiver what to expect.
    Session {
        file_count: u64,
        total_size: u64,
        hostname: String,
    },
    /// Announces one file; `size` raw bytes follow this frame.
    File { name: String, size: u64 },
    /// No more files in this session.
    Done,
    /// Ask the receiver to apply the transferred tree to its own data
    /// directory.
    Restore {
        #[serde(default)]
        path_mappings: BTreeMap<String, String>,
        #[serde(default)]
        preserve_identity: bool,
    },
    /// Receiver's verdict on the work requested so far.
    Ack { ok: bool, message: String },
}

pub async fn write_frame<W>(stream: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(frame)?;
    if payload.len() > MAX_HEADER_BYTES as usize {
        return Err(ToolkitError::Transfer(format!(
            "refusing to send a {} byte frame header",
            payload.len()
        )));
    }
    stream.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;
    trace!(bytes = payload.len(), "frame sent");
    Ok(())
}

pub async fn read_frame<R>(stream: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut length = [0u8; 4];
    stream.read_exact(&mut length).await?;
    let length = u32::from_be_bytes(length);
    if length == 0 || length > MAX_HEADER_BYTES {
        return Err(ToolkitError::Transfer(format!(
            "refusing a {length} byte frame header"
        )));
    }
    let mut payload = vec![0u8; length as usize];
    stream.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Send one file: a `file` frame followed by the file's bytes.
///
/// `name` is the path the receiver should store the file under, relative
/// with forward slashes. Returns the number of payload bytes sent; a source
/// file that shrinks mid-send surfaces as `ShortTransfer`.
pub async fn send_file<W>(
    stream: &mut W,
    path: &Path,
    name: &str,
    cancel: &CancellationToken,
    on_chunk: &mut (dyn FnMut(u64) + Send),
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let size = tokio::fs::metadata(path).await?.len();
    write_frame(
        stream,
        &Frame::File {
            name: name.to_string(),
            size,
        },
    )
    .await?;

    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    while sent < size {
        if cancel.is_cancelled() {
            return Err(ToolkitError::Cancelled);
        }
        let want = ((size - sent).min(CHUNK_SIZE as u64)) as usize;
        let read = file.read(&mut buf[..want]).await?;
        if read == 0 {
            return Err(ToolkitError::ShortTransfer {
                name: name.to_string(),
                expected: size,
                received: sent,
            });
        }
        stream.write_all(&buf[..read]).await?;
        sent += read as u64;
        on_chunk(read as u64);
    }
    stream.flush().await?;
    debug!(name, bytes = sent, "file sent");
    Ok(sent)
}

/// Receive the payload announced by a `file` frame into `dest_dir`.
///
/// The announced name is sanitized before any byte lands on disk; a stream
/// that ends before `size` bytes arrive surfaces as `ShortTransfer`.
pub async fn receive_file<R>(
    stream: &mut R,
    dest_dir: &Path,
    name: &str,
    size: u64,
    cancel: &CancellationToken,
    on_chunk: &mut (dyn FnMut(u64) + Send),
) -> Result<PathBuf>
where
    R: AsyncRead + Unpin,
{
    let relative = sanitize_relative(name)?;
    let target = dest_dir.join(&relative);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(&target).await?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut received = 0u64;
    while received < size {
        if cancel.is_cancelled() {
            return Err(ToolkitError::Cancelled);
        }
        let want = ((size - received).min(CHUNK_SIZE as u64)) as usize;
        let read = stream.read(&mut buf[..want]).await?;
        if read == 0 {
            return Err(ToolkitError::ShortTransfer {
                name: name.to_string(),
                expected: size,
                received,
            });
        }
        file.write_all(&buf[..read]).await?;
        received += read as u64;
        on_chunk(read as u64);
    }
    file.flush().await?;
    debug!(name, bytes = received, "file received");
    Ok(target)
}

/// Reduce a transmitted path to a safe relative path.
///
/// Absolute paths, drive prefixes and parent traversals are refused rather
/// than normalized, so a malicious peer cannot steer writes outside the
/// destination directory.
pub fn sanitize_relative(name: &str) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ToolkitError::Transfer(format!(
                    "unsafe path in transfer: {name}"
                )));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(ToolkitError::Transfer("empty path in transfer".to_string()));
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let mut mappings = BTreeMap::new();
        mappings.insert("/old/media".to_string(), "/new/media".to_string());
        let frames = vec![
            Frame::Session {
                file_count: 3,
                total_size: 300,
                hostname: "host01".to_string(),
            },
            Frame::File {
                name: "Databases/library.db".to_string(),
                size: 42,
            },
            Frame::Restore {
                path_mappings: mappings,
                preserve_identity: false,
            },
            Frame::Done,
            Frame::Ack {
                ok: true,
                message: String::new(),
            },
        ];
        for frame in &frames {
            write_frame(&mut a, frame).await.unwrap();
        }
        for expected in &frames {
            let got = read_frame(&mut b).await.unwrap();
            assert_eq!(&got, expected);
        }
    }

    #[tokio::test]
    async fn test_frame_json_shape() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(
            &mut a,
            &Frame::File {
                name: "x.bin".to_string(),
                size: 7,
            },
        )
        .await
        .unwrap();

        let mut length = [0u8; 4];
        b.read_exact(&mut length).await.unwrap();
        let mut payload = vec![0u8; u32::from_be_bytes(length) as usize];
        b.read_exact(&mut payload).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["type"], "file");
        assert_eq!(value["name"], "x.bin");
        assert_eq!(value["size"], 7);
    }

    #[tokio::test]
    async fn test_oversized_header_refused() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_all(&(MAX_HEADER_BYTES + 1).to_be_bytes())
            .await
            .unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ToolkitError::Transfer(_)));
    }

    #[tokio::test]
    async fn test_zero_length_header_refused() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_all(&0u32.to_be_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ToolkitError::Transfer(_)));
    }

    #[tokio::test]
    async fn test_send_receive_large_file() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("movie.mkv");
        let payload: Vec<u8> = (0..2_621_440u32).map(|i| (i % 251) as u8).collect();
        fs::write(&source, &payload).unwrap();

        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let cancel = CancellationToken::new();
        let send_cancel = cancel.clone();
        let sender = tokio::spawn(async move {
            let mut chunks = 0u32;
            let sent = send_file(
                &mut a,
                &source,
                "library/movie.mkv",
                &send_cancel,
                &mut |_| chunks += 1,
            )
            .await
            .unwrap();
            (sent, chunks)
        });

        let dest = tmp.path().join("incoming");
        let frame = read_frame(&mut b).await.unwrap();
        let Frame::File { name, size } = frame else {
            panic!("expected a file frame");
        };
        assert_eq!(size, 2_621_440);
        let mut received = 0u64;
        let target = receive_file(&mut b, &dest, &name, size, &cancel, &mut |n| {
            received += n
        })
        .await
        .unwrap();

        let (sent, chunks) = sender.await.unwrap();
        assert_eq!(sent, 2_621_440);
        assert_eq!(chunks, 3);
        assert_eq!(received, 2_621_440);
        assert_eq!(target, dest.join("library/movie.mkv"));
        assert_eq!(fs::read(&target).unwrap(), payload);
    }

    #[tokio::test]
    async fn test_truncated_stream_is_a_short_transfer() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(
            &mut a,
            &Frame::File {
                name: "partial.bin".to_string(),
                size: 1000,
            },
        )
        .await
        .unwrap();
        a.write_all(&[5u8; 100]).await.unwrap();
        drop(a);

        let frame = read_frame(&mut b).await.unwrap();
        let Frame::File { name, size } = frame else {
            panic!("expected a file frame");
        };
        let cancel = CancellationToken::new();
        let err = receive_file(&mut b, tmp.path(), &name, size, &cancel, &mut |_| {})
            .await
            .unwrap_err();
        match err {
            ToolkitError::ShortTransfer {
                name,
                expected,
                received,
            } => {
                assert_eq!(name, "partial.bin");
                assert_eq!(expected, 1000);
                assert_eq!(received, 100);
            }
            other => panic!("expected a short transfer, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_empty_file_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("empty.bin");
        fs::write(&source, b"").unwrap();

        let (mut a, mut b) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        send_file(&mut a, &source, "empty.bin", &cancel, &mut |_| {})
            .await
            .unwrap();

        let Frame::File { name, size } = read_frame(&mut b).await.unwrap() else {
            panic!("expected a file frame");
        };
        assert_eq!(size, 0);
        let target = receive_file(&mut b, tmp.path().join("out").as_path(), &name, size, &cancel, &mut |_| {})
            .await
            .unwrap();
        assert_eq!(fs::metadata(target).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_receive_stops() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut a, mut b) = tokio::io::duplex(4096);
        a.write_all(&[1u8; 64]).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = receive_file(&mut b, tmp.path(), "x.bin", 1_000_000, &cancel, &mut |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ToolkitError::Cancelled));
    }

    #[test]
    fn test_sanitize_relative() {
        assert_eq!(
            sanitize_relative("sub/dir/file.bin").unwrap(),
            PathBuf::from("sub/dir/file.bin")
        );
        assert_eq!(sanitize_relative("./x.bin").unwrap(), PathBuf::from("x.bin"));
        assert!(sanitize_relative("../escape.bin").is_err());
        assert!(sanitize_relative("a/../../b").is_err());
        assert!(sanitize_relative("/etc/passwd").is_err());
        assert!(sanitize_relative("").is_err());
    }
}
