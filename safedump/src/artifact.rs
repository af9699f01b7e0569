//! Backup artifacts and their sidecar triple.
//!
//! Every backup produces three co-located items sharing a base name: the
//! payload, a checksum file (`<name>.sha256`) and a metadata document
//! (`<name>.info`). The triple is written payload-first (fsynced), then
//! checksum, then metadata, so any reader that sees the metadata file can
//! rely on the other two being present. Retention deletes the triple as a
//! unit.

use crate::engine::Engine;
use crate::error::{Result, SafedumpError};
use crate::pipeline::HashingReader;
use crate::store::ObjectStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

pub const CHECKSUM_SUFFIX: &str = ".sha256";
pub const METADATA_SUFFIX: &str = ".info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Single,
    Sample,
    Cluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactFormat {
    /// Engine-custom binary dump (pg_dump -Fc)
    EngineCustom,
    /// Plain SQL compressed by the pipeline
    PlainSqlGz,
    /// Cluster tarball
    TarGz,
}

impl ArtifactFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::EngineCustom => "dump",
            ArtifactFormat::PlainSqlGz => "sql.gz",
            ArtifactFormat::TarGz => "tar.gz",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackupKind {
    Full,
    IncrementalBase,
    IncrementalDelta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionMode {
    None,
    Aes256Gcm,
}

/// Metadata document stored next to each payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupArtifact {
    /// Random identifier assigned when the backup is taken. Documents written
    /// by older releases deserialize to the nil id.
    #[serde(default)]
    pub backup_id: uuid::Uuid,
    pub name: String,
    pub engine: Engine,
    pub scope: Scope,
    pub format: ArtifactFormat,
    pub created_at: DateTime<Utc>,
    /// Bytes of the payload file as stored (post compression/encryption).
    pub size_bytes_ciphertext: u64,
    /// Bytes produced by the dump tool before pipeline stages.
    pub size_bytes_plaintext_declared: u64,
    pub sha256: String,
    pub compression_algo: String,
    pub compression_level: u32,
    pub encryption: EncryptionMode,
    /// Offset of the ciphertext start when encrypted (header length).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_header_offset: Option<u64>,
    pub databases: Vec<String>,
    pub backup_type: BackupKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_ref: Option<String>,
    pub tool_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl BackupArtifact {
    pub fn tool_version() -> String {
        format!("safedump {}", env!("CARGO_PKG_VERSION"))
    }
}

/// Base name for a single-database artifact: `db_<name>_<timestamp>`.
pub fn base_name(db: &str, now: DateTime<Utc>) -> String {
    format!("db_{}_{}", db, now.format("%Y%m%d_%H%M%S"))
}

/// Base name for a cluster artifact.
pub fn cluster_base_name(now: DateTime<Utc>) -> String {
    format!("cluster_{}", now.format("%Y%m%d_%H%M%S"))
}

pub fn checksum_name(payload_name: &str) -> String {
    format!("{}{}", payload_name, CHECKSUM_SUFFIX)
}

pub fn metadata_name(payload_name: &str) -> String {
    format!("{}{}", payload_name, METADATA_SUFFIX)
}

/// `sha256sum`-compatible checksum file body.
pub fn checksum_file_body(hex: &str, payload_name: &str) -> String {
    format!("{}  {}\n", hex, payload_name)
}

/// Parse a checksum file back into (hex digest, payload name).
pub fn parse_checksum_body(body: &str) -> Result<(String, String)> {
    let line = body.lines().next().unwrap_or("");
    let mut parts = line.split_whitespace();
    let hex = parts
        .next()
        .filter(|h| h.len() == 64 && h.chars().all(|c| c.is_ascii_hexdigit()))
        .ok_or_else(|| SafedumpError::InvalidMetadata("malformed checksum file".to_string()))?;
    let name = parts
        .next()
        .ok_or_else(|| SafedumpError::InvalidMetadata("checksum file missing name".to_string()))?;
    Ok((hex.to_string(), name.to_string()))
}

/// Whether an object name is one of the two sidecars.
pub fn is_sidecar(name: &str) -> bool {
    name.ends_with(CHECKSUM_SUFFIX) || name.ends_with(METADATA_SUFFIX)
}

/// Publish a completed payload plus its sidecars to one store, in triple
/// order: payload (fsynced by the adapter), then checksum, then metadata.
/// All three land in the same container as the payload.
pub async fn publish_triple(
    store: &dyn ObjectStore,
    payload_name: &str,
    payload_path: &Path,
    artifact: &BackupArtifact,
) -> Result<()> {
    let user_metadata: HashMap<String, String> =
        [("sha256".to_string(), artifact.sha256.clone())].into();

    let payload = tokio::fs::File::open(payload_path).await?;
    store
        .put(
            payload_name,
            Box::new(payload),
            Some(artifact.size_bytes_ciphertext),
            &user_metadata,
        )
        .await?;

    let checksum_body = checksum_file_body(&artifact.sha256, payload_name);
    store
        .put(
            &checksum_name(payload_name),
            Box::new(std::io::Cursor::new(checksum_body.into_bytes())),
            None,
            &HashMap::new(),
        )
        .await?;

    let metadata_body = serde_json::to_vec_pretty(artifact)?;
    store
        .put(
            &metadata_name(payload_name),
            Box::new(std::io::Cursor::new(metadata_body)),
            None,
            &HashMap::new(),
        )
        .await?;

    info!(
        "published {} ({} bytes, sha256 {}) to {}",
        payload_name,
        artifact.size_bytes_ciphertext,
        &artifact.sha256[..12.min(artifact.sha256.len())],
        store.name()
    );
    Ok(())
}

/// Read and parse the metadata sidecar of a payload.
pub async fn read_metadata(
    store: &dyn ObjectStore,
    payload_name: &str,
) -> Result<BackupArtifact> {
    let mut reader = store.get(&metadata_name(payload_name)).await?;
    let mut body = Vec::new();
    reader.read_to_end(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Remove a payload and both sidecars. Partial triples (e.g. a missing
/// sidecar after an interrupted run) do not fail the deletion.
pub async fn delete_triple(store: &dyn ObjectStore, payload_name: &str) -> Result<()> {
    store.delete(payload_name).await?;
    for sidecar in [checksum_name(payload_name), metadata_name(payload_name)] {
        match store.delete(&sidecar).await {
            Ok(()) => {}
            Err(SafedumpError::NotFound(_)) => {
                debug!("sidecar {} already absent", sidecar);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Stream the payload through SHA-256 and compare with the checksum
/// sidecar. A mismatch is a data-integrity failure and therefore fatal.
pub async fn verify(store: &dyn ObjectStore, payload_name: &str) -> Result<String> {
    let mut checksum_reader = store.get(&checksum_name(payload_name)).await?;
    let mut body = String::new();
    checksum_reader.read_to_string(&mut body).await?;
    let (expected, recorded_name) = parse_checksum_body(&body)?;
    if recorded_name != payload_name {
        debug!(
            "checksum file names {} but was read for {}",
            recorded_name, payload_name
        );
    }

    let payload = store.get(payload_name).await?;
    let (mut hashing, digest) = HashingReader::new(payload);
    let mut sink = tokio::io::sink();
    tokio::io::copy(&mut hashing, &mut sink).await?;

    let actual = digest.hex();
    if actual != expected {
        return Err(SafedumpError::Integrity(format!(
            "{}: checksum mismatch (expected {}, got {})",
            payload_name, expected, actual
        )));
    }
    Ok(actual)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalStore;
    use sha2::{Digest, Sha256};
    use std::io::Write;

    fn sample_artifact(sha256: String, size: u64) -> BackupArtifact {
        BackupArtifact {
            backup_id: uuid::Uuid::new_v4(),
            name: "db_app_20260101_000000".to_string(),
            engine: Engine::Postgres,
            scope: Scope::Single,
            format: ArtifactFormat::EngineCustom,
            created_at: Utc::now(),
            size_bytes_ciphertext: size,
            size_bytes_plaintext_declared: size,
            sha256,
            compression_algo: "none".to_string(),
            compression_level: 0,
            encryption: EncryptionMode::None,
            encryption_header_offset: None,
            databases: vec!["app".to_string()],
            backup_type: BackupKind::Full,
            parent_ref: None,
            tool_version: BackupArtifact::tool_version(),
            hostname: None,
        }
    }

    #[test]
    fn test_checksum_body_round_trip() {
        let body = checksum_file_body("ab".repeat(32).as_str(), "db_app.dump");
        assert!(body.ends_with("db_app.dump\n"));
        let (hex, name) = parse_checksum_body(&body).unwrap();
        assert_eq!(hex, "ab".repeat(32));
        assert_eq!(name, "db_app.dump");
    }

    #[test]
    fn test_parse_checksum_rejects_garbage() {
        assert!(parse_checksum_body("").is_err());
        assert!(parse_checksum_body("nothex  file\n").is_err());
        assert!(parse_checksum_body(&"ab".repeat(32)).is_err()); // missing name
    }

    #[test]
    fn test_sidecar_names() {
        assert_eq!(checksum_name("a.dump"), "a.dump.sha256");
        assert_eq!(metadata_name("a.dump"), "a.dump.info");
        assert!(is_sidecar("a.dump.sha256"));
        assert!(is_sidecar("a.dump.info"));
        assert!(!is_sidecar("a.dump"));
    }

    #[tokio::test]
    async fn test_publish_verify_delete_triple() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("store"));

        let payload = b"dump payload bytes".to_vec();
        let sha = format!("{:x}", Sha256::digest(&payload));
        let payload_path = dir.path().join("staged.dump");
        let mut f = std::fs::File::create(&payload_path).unwrap();
        f.write_all(&payload).unwrap();

        let artifact = sample_artifact(sha.clone(), payload.len() as u64);
        publish_triple(&store, "db_app.dump", &payload_path, &artifact)
            .await
            .unwrap();

        // All three live in the same container.
        assert!(store.exists("db_app.dump").await.unwrap());
        assert!(store.exists("db_app.dump.sha256").await.unwrap());
        assert!(store.exists("db_app.dump.info").await.unwrap());

        assert_eq!(verify(&store, "db_app.dump").await.unwrap(), sha);

        let parsed = read_metadata(&store, "db_app.dump").await.unwrap();
        assert_eq!(parsed.sha256, sha);
        assert_eq!(parsed.databases, vec!["app".to_string()]);

        delete_triple(&store, "db_app.dump").await.unwrap();
        for name in ["db_app.dump", "db_app.dump.sha256", "db_app.dump.info"] {
            assert!(!store.exists(name).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_verify_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("store"));

        let payload = b"original".to_vec();
        let sha = format!("{:x}", Sha256::digest(&payload));
        let payload_path = dir.path().join("staged.dump");
        std::fs::write(&payload_path, &payload).unwrap();

        let artifact = sample_artifact(sha, payload.len() as u64);
        publish_triple(&store, "x.dump", &payload_path, &artifact)
            .await
            .unwrap();

        // Corrupt the stored payload behind the store's back.
        std::fs::write(dir.path().join("store").join("x.dump"), b"tampered").unwrap();

        let err = verify(&store, "x.dump").await.unwrap_err();
        assert!(matches!(err, SafedumpError::Integrity(_)));
        assert!(err.is_fatal());
    }
}
