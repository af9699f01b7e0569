//! Local directory store.

use super::{ObjectMeta, ObjectReader, ObjectStore};
use crate::error::{Result, SafedumpError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Flat-file store rooted at a directory. Object names may contain `/`,
/// which maps to subdirectories. Writers are append-only; deletion happens
/// only through explicit [`ObjectStore::delete`] calls.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn map_not_found(name: &str, e: std::io::Error) -> SafedumpError {
        match e.kind() {
            ErrorKind::NotFound => SafedumpError::NotFound(name.to_string()),
            ErrorKind::PermissionDenied => SafedumpError::AccessDenied(name.to_string()),
            _ => SafedumpError::Io(e),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(
        &self,
        name: &str,
        mut reader: ObjectReader,
        _size_hint: Option<u64>,
        _metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let path = self.object_path(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&path).await?;
        let n = tokio::io::copy(&mut reader, &mut file).await?;
        // Sidecars ordered after this put rely on the payload being durable.
        file.sync_all().await?;
        debug!("local put {} ({} bytes)", path.display(), n);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<ObjectReader> {
        let path = self.object_path(name);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| Self::map_not_found(name, e))?;
        Ok(Box::new(file))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let entries = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(rel) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let name = rel.to_string_lossy().to_string();
                if !name.starts_with(&prefix) {
                    continue;
                }
                let Ok(meta) = entry.metadata() else { continue };
                let mtime = meta
                    .modified()
                    .ok()
                    .map(DateTime::<Utc>::from);
                out.push(ObjectMeta {
                    name,
                    size: meta.len(),
                    mtime,
                    user_metadata: HashMap::new(),
                });
            }
            out
        })
        .await
        .map_err(|e| SafedumpError::Storage(format!("list task failed: {}", e)))?;
        Ok(entries)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.object_path(name);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| Self::map_not_found(name, e))?;
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        match tokio::fs::metadata(self.object_path(name)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::map_not_found(name, e)),
        }
    }

    async fn size(&self, name: &str) -> Result<u64> {
        let meta = tokio::fs::metadata(self.object_path(name))
            .await
            .map_err(|e| Self::map_not_found(name, e))?;
        Ok(meta.len())
    }

    fn name(&self) -> &str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::new(dir.path().to_path_buf());
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (_dir, store) = store();
        let data = b"payload".to_vec();
        store
            .put("db_app.dump", Box::new(std::io::Cursor::new(data.clone())), Some(7), &HashMap::new())
            .await
            .unwrap();

        let mut reader = store.get("db_app.dump").await.unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
        assert_eq!(store.size("db_app.dump").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_exists_and_delete() {
        let (_dir, store) = store();
        assert!(!store.exists("missing").await.unwrap());

        store
            .put("a.dump", Box::new(&b"x"[..]), None, &HashMap::new())
            .await
            .unwrap();
        assert!(store.exists("a.dump").await.unwrap());

        store.delete("a.dump").await.unwrap();
        assert!(!store.exists("a.dump").await.unwrap());
        assert!(matches!(
            store.delete("a.dump").await.unwrap_err(),
            SafedumpError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_list_filters_by_prefix() {
        let (_dir, store) = store();
        for name in ["db_app_1.dump", "db_app_1.dump.sha256", "db_other.dump"] {
            store
                .put(name, Box::new(&b"x"[..]), None, &HashMap::new())
                .await
                .unwrap();
        }
        let listed = store.list("db_app").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|m| m.name.starts_with("db_app")));
        assert!(listed.iter().all(|m| m.mtime.is_some()));
    }
}
