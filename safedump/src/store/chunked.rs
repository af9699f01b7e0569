//! Chunk-file backend.
//!
//! Objects are always split into fixed-size part files under a per-object
//! directory, with a small JSON manifest describing the whole. Useful for
//! stores with per-file size ceilings and as the reference "always chunked"
//! backend.

use super::{ObjectMeta, ObjectReader, ObjectStore};
use crate::error::{Result, SafedumpError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tracing::{debug, warn};

pub const DEFAULT_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

const MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Serialize, Deserialize)]
struct ChunkManifest {
    size: u64,
    chunk_count: u64,
    chunk_size: u64,
    created_at: DateTime<Utc>,
    #[serde(default)]
    user_metadata: HashMap<String, String>,
}

pub struct ChunkedStore {
    root: PathBuf,
    chunk_size: u64,
}

impl ChunkedStore {
    pub fn new(root: PathBuf, chunk_size: u64) -> Self {
        Self { root, chunk_size }
    }

    fn object_dir(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.chunks", name))
    }

    fn chunk_path(dir: &std::path::Path, index: u64) -> PathBuf {
        dir.join(format!("{:08}.part", index))
    }

    async fn read_manifest(&self, name: &str) -> Result<ChunkManifest> {
        let path = self.object_dir(name).join(MANIFEST_NAME);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                SafedumpError::NotFound(name.to_string())
            } else {
                SafedumpError::Io(e)
            }
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[async_trait]
impl ObjectStore for ChunkedStore {
    async fn put(
        &self,
        name: &str,
        mut reader: ObjectReader,
        _size_hint: Option<u64>,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let dir = self.object_dir(name);
        tokio::fs::create_dir_all(&dir).await?;

        let mut total = 0u64;
        let mut chunk_count = 0u64;
        let mut buf = vec![0u8; 64 * 1024];

        'outer: loop {
            let mut file = tokio::fs::File::create(Self::chunk_path(&dir, chunk_count)).await?;
            let mut written = 0u64;
            while written < self.chunk_size {
                let want = buf.len().min((self.chunk_size - written) as usize);
                let n = reader.read(&mut buf[..want]).await?;
                if n == 0 {
                    file.sync_all().await?;
                    if written > 0 || chunk_count == 0 {
                        chunk_count += 1;
                        debug!("wrote chunk {} of {} ({} bytes)", chunk_count, name, written);
                    } else {
                        // Empty trailing chunk; drop it.
                        drop(file);
                        tokio::fs::remove_file(Self::chunk_path(&dir, chunk_count)).await?;
                    }
                    break 'outer;
                }
                file.write_all(&buf[..n]).await?;
                written += n as u64;
                total += n as u64;
            }
            file.sync_all().await?;
            chunk_count += 1;
            debug!("wrote chunk {} of {} ({} bytes)", chunk_count, name, written);
        }

        let manifest = ChunkManifest {
            size: total,
            chunk_count,
            chunk_size: self.chunk_size,
            created_at: Utc::now(),
            user_metadata: metadata.clone(),
        };
        let manifest_json = serde_json::to_string_pretty(&manifest)?;
        tokio::fs::write(dir.join(MANIFEST_NAME), manifest_json).await?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<ObjectReader> {
        let manifest = self.read_manifest(name).await?;
        let dir = self.object_dir(name);

        // Stitch the parts back together through an in-process pipe; each
        // chunk is streamed, so memory stays bounded by the copy buffer.
        // The stitcher drops its writer on any chunk failure, which the
        // reader sees as EOF; SizedReader turns that short read into an
        // error instead of a truncated object.
        let (mut writer, reader) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            for index in 0..manifest.chunk_count {
                let path = Self::chunk_path(&dir, index);
                let mut file = match tokio::fs::File::open(&path).await {
                    Ok(f) => f,
                    Err(e) => {
                        warn!("chunk {} unreadable: {}", path.display(), e);
                        return;
                    }
                };
                if tokio::io::copy(&mut file, &mut writer).await.is_err() {
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });
        Ok(Box::new(SizedReader {
            inner: reader,
            expected: manifest.size,
            seen: 0,
            name: name.to_string(),
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(name) = file_name.strip_suffix(".chunks") else {
                continue;
            };
            if !name.starts_with(prefix) {
                continue;
            }
            let Ok(manifest) = self.read_manifest(name).await else {
                continue;
            };
            out.push(ObjectMeta {
                name: name.to_string(),
                size: manifest.size,
                mtime: Some(manifest.created_at),
                user_metadata: manifest.user_metadata,
            });
        }
        Ok(out)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let dir = self.object_dir(name);
        if !dir.exists() {
            return Err(SafedumpError::NotFound(name.to_string()));
        }
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        match tokio::fs::metadata(self.object_dir(name).join(MANIFEST_NAME)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                Err(SafedumpError::AccessDenied(name.to_string()))
            }
            Err(e) => Err(SafedumpError::Io(e)),
        }
    }

    async fn size(&self, name: &str) -> Result<u64> {
        Ok(self.read_manifest(name).await?.size)
    }

    fn name(&self) -> &str {
        "chunked"
    }
}

/// Enforces the manifest's byte count on the reassembled stream. EOF
/// before `expected` bytes means a chunk went missing or failed mid-copy.
struct SizedReader<R> {
    inner: R,
    expected: u64,
    seen: u64,
    name: String,
}

impl<R: AsyncRead + Unpin> AsyncRead for SizedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n == 0 && self.seen < self.expected {
                    return Poll::Ready(Err(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        format!(
                            "{}: chunk stream truncated after {} of {} bytes",
                            self.name, self.seen, self.expected
                        ),
                    )));
                }
                self.seen += n as u64;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(chunk_size: u64) -> (tempfile::TempDir, ChunkedStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ChunkedStore::new(dir.path().to_path_buf(), chunk_size);
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_splits_into_chunks() {
        let (_dir, store) = store(1024);
        let data = vec![0x61u8; 2500]; // 3 chunks: 1024 + 1024 + 452
        store
            .put("obj", Box::new(std::io::Cursor::new(data.clone())), None, &HashMap::new())
            .await
            .unwrap();

        let dir = store.object_dir("obj");
        assert!(dir.join("00000000.part").exists());
        assert!(dir.join("00000001.part").exists());
        assert!(dir.join("00000002.part").exists());
        assert!(!dir.join("00000003.part").exists());
        assert_eq!(store.size("obj").await.unwrap(), 2500);
    }

    #[tokio::test]
    async fn test_get_reassembles() {
        let (_dir, store) = store(777);
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        store
            .put("obj", Box::new(std::io::Cursor::new(data.clone())), None, &HashMap::new())
            .await
            .unwrap();

        let mut reader = store.get("obj").await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_get_errors_on_missing_chunk() {
        let (_dir, store) = store(1024);
        let data = vec![0x42u8; 3000];
        store
            .put("obj", Box::new(std::io::Cursor::new(data)), None, &HashMap::new())
            .await
            .unwrap();
        tokio::fs::remove_file(store.object_dir("obj").join("00000001.part"))
            .await
            .unwrap();

        let mut reader = store.get("obj").await.unwrap();
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let (_dir, store) = store(1024);
        let meta: HashMap<String, String> =
            [("sha256".to_string(), "abc".to_string())].into();
        store
            .put("db_app.dump", Box::new(&b"x"[..]), None, &meta)
            .await
            .unwrap();

        let listed = store.list("db_").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].user_metadata.get("sha256").map(String::as_str), Some("abc"));

        store.delete("db_app.dump").await.unwrap();
        assert!(!store.exists("db_app.dump").await.unwrap());
    }
}
