//! Uniform object-storage abstraction.
//!
//! Orchestrators address every backend through [`ObjectStore`]; thresholds
//! and chunking knobs live inside each adapter. Backends: local directory,
//! S3-compatible buckets (including path-style endpoints for MinIO, B2 and
//! block-blob gateways), and a chunk-file backend that always splits
//! objects into fixed-size parts.

pub mod chunked;
pub mod local;
pub mod s3;

pub use chunked::ChunkedStore;
pub use local::LocalStore;
pub use s3::S3Store;

use crate::config::CloudConfig;
use crate::error::{Result, SafedumpError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Boxed object payload reader.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// One listed object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub name: String,
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    pub user_metadata: HashMap<String, String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store an object under `name`, reading the payload to completion.
    /// `size_hint` lets adapters choose between single-shot and
    /// multipart/chunked uploads up front.
    async fn put(
        &self,
        name: &str,
        reader: ObjectReader,
        size_hint: Option<u64>,
        metadata: &HashMap<String, String>,
    ) -> Result<()>;

    async fn get(&self, name: &str) -> Result<ObjectReader>;

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// `false` only for not-found; access problems surface as errors.
    async fn exists(&self, name: &str) -> Result<bool>;

    async fn size(&self, name: &str) -> Result<u64>;

    /// Backend identifier for logs and metrics.
    fn name(&self) -> &str;
}

/// Parsed store URI: `scheme://bucket/path[?param=value...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreUri {
    pub scheme: String,
    pub bucket: String,
    pub path: String,
    pub params: HashMap<String, String>,
}

impl StoreUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| SafedumpError::InvalidUri(format!("missing scheme: {}", uri)))?;
        if scheme.is_empty() {
            return Err(SafedumpError::InvalidUri(format!("empty scheme: {}", uri)));
        }

        let (body, query) = match rest.split_once('?') {
            Some((b, q)) => (b, Some(q)),
            None => (rest, None),
        };

        let (bucket, path) = match body.split_once('/') {
            Some((b, p)) => (b.to_string(), p.trim_end_matches('/').to_string()),
            None => (body.to_string(), String::new()),
        };
        if bucket.is_empty() {
            return Err(SafedumpError::InvalidUri(format!("missing bucket: {}", uri)));
        }

        let mut params = HashMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((k, v)) => params.insert(k.to_string(), v.to_string()),
                    None => params.insert(pair.to_string(), String::new()),
                };
            }
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            bucket,
            path,
            params,
        })
    }
}

/// Whether a string is a store URI rather than a local path.
pub fn is_store_uri(input: &str) -> bool {
    input.contains("://")
}

/// Open a store for a URI. Unknown schemes fail before any side effect.
pub async fn open_store(uri: &str, cloud: &CloudConfig) -> Result<Arc<dyn ObjectStore>> {
    let parsed = StoreUri::parse(uri)?;
    open_parsed(parsed, cloud).await
}

/// Open a URI naming a single object: the store is rooted at the parent
/// path and the final path component is returned as the object name.
pub async fn open_object(
    uri: &str,
    cloud: &CloudConfig,
) -> Result<(Arc<dyn ObjectStore>, String)> {
    let mut parsed = StoreUri::parse(uri)?;
    let (parent, name) = match parsed.path.rsplit_once('/') {
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => (String::new(), parsed.path.clone()),
    };
    if name.is_empty() {
        return Err(SafedumpError::InvalidUri(format!(
            "URI names no object: {}",
            uri
        )));
    }
    parsed.path = parent;
    let store = open_parsed(parsed, cloud).await?;
    Ok((store, name))
}

async fn open_parsed(parsed: StoreUri, cloud: &CloudConfig) -> Result<Arc<dyn ObjectStore>> {
    match parsed.scheme.as_str() {
        "local" | "file" => {
            let root = PathBuf::from(format!("/{}", parsed.bucket)).join(&parsed.path);
            Ok(Arc::new(LocalStore::new(root)))
        }
        "s3" => Ok(Arc::new(
            S3Store::open(&parsed, cloud, s3::S3_MULTIPART_THRESHOLD, false).await?,
        )),
        // Emulator-style and B2 endpoints need path-style addressing.
        "minio" | "b2" => Ok(Arc::new(
            S3Store::open(&parsed, cloud, s3::S3_MULTIPART_THRESHOLD, true).await?,
        )),
        // Block-blob gateways speak the S3 dialect with a larger threshold.
        "blob" | "block-blob" => Ok(Arc::new(
            S3Store::open(&parsed, cloud, s3::BLOB_MULTIPART_THRESHOLD, true).await?,
        )),
        "chunk" | "chunked-object" => {
            let root = PathBuf::from(format!("/{}", parsed.bucket)).join(&parsed.path);
            Ok(Arc::new(ChunkedStore::new(root, chunked::DEFAULT_CHUNK_SIZE)))
        }
        other => Err(SafedumpError::InvalidUri(format!(
            "unknown store scheme: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_uri() {
        let uri = StoreUri::parse("s3://my-bucket/backups/prod?region=eu-west-1").unwrap();
        assert_eq!(uri.scheme, "s3");
        assert_eq!(uri.bucket, "my-bucket");
        assert_eq!(uri.path, "backups/prod");
        assert_eq!(uri.params.get("region").map(String::as_str), Some("eu-west-1"));
    }

    #[test]
    fn test_parse_bucket_only() {
        let uri = StoreUri::parse("minio://bucket").unwrap();
        assert_eq!(uri.bucket, "bucket");
        assert_eq!(uri.path, "");
    }

    #[test]
    fn test_parse_rejects_missing_scheme() {
        assert!(StoreUri::parse("/var/backups").is_err());
        assert!(StoreUri::parse("://bucket/x").is_err());
    }

    #[tokio::test]
    async fn test_unknown_scheme_fails_before_side_effects() {
        match open_store("gopher://bucket/path", &CloudConfig::default()).await {
            Err(SafedumpError::InvalidUri(_)) => {}
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("unknown scheme was accepted"),
        }
    }

    #[tokio::test]
    async fn test_open_object_splits_final_component() {
        let (store, name) = open_object("local://var/backups/db_app.dump", &CloudConfig::default())
            .await
            .unwrap();
        assert_eq!(store.name(), "local");
        assert_eq!(name, "db_app.dump");
    }

    #[test]
    fn test_is_store_uri() {
        assert!(is_store_uri("s3://bucket/x"));
        assert!(!is_store_uri("/var/backups/db_app.dump"));
    }
}
