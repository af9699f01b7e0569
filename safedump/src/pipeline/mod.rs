//! Streaming byte pipeline.
//!
//! A pipeline is a chain of `AsyncRead` stages: dump producer, optional
//! gzip, the SHA-256 tee, optional encryption, then a sink copy. Each stage
//! holds at most a fixed buffer, so memory use is independent of payload
//! size. The sink copy is cancellable at every read, and errors tear the
//! chain down so upstream producers get reaped by their owners.

pub mod hashing;
pub mod progress;

pub use hashing::{DigestHandle, HashingReader};
pub use progress::{ProgressCallback, ProgressReader};

use crate::error::{Result, SafedumpError};
use async_compression::tokio::bufread::{GzipDecoder, GzipEncoder};
use async_compression::Level;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Per-stage buffer: bounds pipeline memory regardless of payload size.
pub const STAGE_BUFFER: usize = 8 * 1024 * 1024;

/// Chunk size for the sink copy loop.
const COPY_CHUNK: usize = 64 * 1024;

/// Boxed pipeline stage.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Wrap a reader in a streaming gzip encoder at the given level (0-9).
pub fn gzip_encode<R>(reader: R, level: u32) -> ByteStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let buffered = BufReader::with_capacity(STAGE_BUFFER, reader);
    Box::new(GzipEncoder::with_quality(
        buffered,
        Level::Precise(level.min(9) as i32),
    ))
}

/// Wrap a reader in a streaming gzip decoder.
pub fn gzip_decode<R>(reader: R) -> ByteStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let buffered = BufReader::with_capacity(STAGE_BUFFER, reader);
    Box::new(GzipDecoder::new(buffered))
}

/// Drain `reader` into `writer` in bounded chunks, honouring cancellation at
/// every read. Returns the number of bytes copied; the writer is flushed
/// but not closed.
pub async fn copy_cancellable<R, W>(
    reader: &mut R,
    writer: &mut W,
    cancel: &CancellationToken,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => read?,
            _ = cancel.cancelled() => return Err(SafedumpError::Cancelled),
        };
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    writer.flush().await?;
    Ok(total)
}

/// Run a pipeline to a file sink. The file is fsynced before returning so
/// sidecar writes ordered after it can rely on the payload being durable.
pub async fn run_to_file<R>(
    reader: &mut R,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut file = tokio::fs::File::create(path).await?;
    let total = copy_cancellable(reader, &mut file, cancel).await?;
    file.sync_all().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    #[tokio::test]
    async fn test_gzip_round_trip() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let encoded = gzip_encode(std::io::Cursor::new(data.clone()), 6);
        let mut decoded = gzip_decode(encoded);
        let mut out = Vec::new();
        decoded.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_copy_cancellable_completes() {
        let data = vec![7u8; 3 * COPY_CHUNK + 17];
        let mut reader = &data[..];
        let mut sink = Vec::new();
        let token = CancellationToken::new();
        let n = copy_cancellable(&mut reader, &mut sink, &token).await.unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(sink, data);
    }

    #[tokio::test]
    async fn test_copy_cancellable_aborts_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        // A pending reader would park forever without the cancel branch.
        let (_tx, rx) = tokio::io::duplex(64);
        let mut rx = rx;
        let mut sink = Vec::new();
        let err = copy_cancellable(&mut rx, &mut sink, &token).await.unwrap_err();
        assert!(matches!(err, SafedumpError::Cancelled));
    }

    #[tokio::test]
    async fn test_run_to_file_writes_hashed_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let data = b"some payload bytes".to_vec();

        let (mut reader, digest) = HashingReader::new(&data[..]);
        let token = CancellationToken::new();
        let n = run_to_file(&mut reader, &path, &token).await.unwrap();

        assert_eq!(n, data.len() as u64);
        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk, data);
        assert_eq!(digest.hex(), format!("{:x}", Sha256::digest(&data)));
    }
}
