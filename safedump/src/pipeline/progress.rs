//! Progress-tracking reader wrapper for long transfers.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{Duration, Instant};

/// Callback for progress updates
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// AsyncRead wrapper that tracks bytes passed through and calls a progress
/// callback at a bounded frequency.
pub struct ProgressReader<R> {
    inner: R,
    bytes_transferred: u64,
    last_update: Instant,
    update_interval: Duration,
    callback: ProgressCallback,
}

impl<R: AsyncRead + Unpin> ProgressReader<R> {
    pub fn new(inner: R, callback: ProgressCallback) -> Self {
        Self {
            inner,
            bytes_transferred: 0,
            last_update: Instant::now(),
            update_interval: Duration::from_millis(100),
            callback,
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = (buf.filled().len() - before) as u64;
                self.bytes_transferred += n;

                if n == 0 {
                    // Final update on EOF
                    (self.callback)(self.bytes_transferred);
                } else {
                    let now = Instant::now();
                    if now.duration_since(self.last_update) >= self.update_interval {
                        (self.callback)(self.bytes_transferred);
                        self.last_update = now;
                    }
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
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_final_callback_reports_total() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = Arc::clone(&seen);
        let data = vec![1u8; 4096];
        let mut reader = ProgressReader::new(
            &data[..],
            Arc::new(move |n| seen_cb.store(n, Ordering::SeqCst)),
        );
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).await.unwrap();

        assert_eq!(reader.bytes_transferred(), 4096);
        assert_eq!(seen.load(Ordering::SeqCst), 4096);
    }
}
