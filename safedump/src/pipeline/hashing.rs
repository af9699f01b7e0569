//! SHA-256 tee over an async byte stream.

use sha2::{Digest, Sha256};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Handle onto the running digest of a [`HashingReader`]. The hex digest can
/// be taken at any point; callers take it after the stream is drained.
#[derive(Clone)]
pub struct DigestHandle {
    hasher: Arc<Mutex<Sha256>>,
    bytes: Arc<AtomicU64>,
}

impl DigestHandle {
    /// Hex-encoded SHA-256 of all bytes seen so far.
    pub fn hex(&self) -> String {
        let hasher = self.hasher.lock().expect("digest mutex poisoned").clone();
        format!("{:x}", hasher.finalize())
    }

    pub fn bytes_seen(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// AsyncRead wrapper that updates a SHA-256 digest with every byte passed
/// through. Used as the tee stage of backup and restore pipelines.
pub struct HashingReader<R> {
    inner: R,
    hasher: Arc<Mutex<Sha256>>,
    bytes: Arc<AtomicU64>,
}

impl<R: AsyncRead + Unpin> HashingReader<R> {
    pub fn new(inner: R) -> (Self, DigestHandle) {
        let hasher = Arc::new(Mutex::new(Sha256::new()));
        let bytes = Arc::new(AtomicU64::new(0));
        let handle = DigestHandle {
            hasher: Arc::clone(&hasher),
            bytes: Arc::clone(&bytes),
        };
        (
            Self {
                inner,
                hasher,
                bytes,
            },
            handle,
        )
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let new_bytes = &buf.filled()[before..];
                if !new_bytes.is_empty() {
                    let mut hasher = self.hasher.lock().expect("digest mutex poisoned");
                    hasher.update(new_bytes);
                    self.bytes.fetch_add(new_bytes.len() as u64, Ordering::Relaxed);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_digest_matches_direct_hash() {
        let data = vec![0xabu8; 100_000];
        let (mut reader, handle) = HashingReader::new(&data[..]);
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).await.unwrap();

        assert_eq!(sink, data);
        assert_eq!(handle.bytes_seen(), data.len() as u64);
        assert_eq!(handle.hex(), format!("{:x}", Sha256::digest(&data)));
    }

    #[tokio::test]
    async fn test_empty_stream() {
        let (mut reader, handle) = HashingReader::new(&[][..]);
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).await.unwrap();
        assert_eq!(handle.bytes_seen(), 0);
        assert_eq!(
            handle.hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
