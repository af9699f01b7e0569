//! S3-compatible object store.
//!
//! Covers native S3 plus path-style endpoints (MinIO, Backblaze B2,
//! block-blob gateways). Payloads above the multipart threshold are
//! uploaded in parts with per-part retries; a failed multipart upload is
//! aborted so no orphan parts accrue charges.

use super::{ObjectMeta, ObjectReader, ObjectStore, StoreUri};
use crate::config::CloudConfig;
use crate::error::{Result, SafedumpError};
use crate::retry::Backoff;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

/// Single-shot ceiling for S3-style backends.
pub const S3_MULTIPART_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Block-blob gateways prefer chunking later.
pub const BLOB_MULTIPART_THRESHOLD: u64 = 256 * 1024 * 1024;

/// Part size for multipart uploads (within the provider-allowed 10-100 MiB).
const PART_SIZE: u64 = 16 * 1024 * 1024;

const PART_ATTEMPTS: u32 = 3;

pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: String,
    multipart_threshold: u64,
    backend: &'static str,
}

impl S3Store {
    pub async fn open(
        uri: &StoreUri,
        cloud: &CloudConfig,
        multipart_threshold: u64,
        force_path_style: bool,
    ) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = uri.params.get("region").cloned().or_else(|| cloud.region.clone()) {
            loader = loader.region(aws_config::Region::new(region));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = uri.params.get("endpoint").cloned().or_else(|| cloud.endpoint.clone())
        {
            builder = builder.endpoint_url(endpoint);
        }
        if force_path_style {
            builder = builder.force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        let backend = if force_path_style { "s3-path-style" } else { "s3" };
        Ok(Self {
            client,
            bucket: uri.bucket.clone(),
            prefix: uri.path.clone(),
            multipart_threshold,
            backend,
        })
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    /// Spill an unbounded reader to a temp file so the upload has a known
    /// size and parts can be re-read on retry.
    async fn stage(&self, mut reader: ObjectReader) -> Result<(tempfile::TempPath, u64)> {
        let tmp = tempfile::NamedTempFile::new()
            .map_err(|e| SafedumpError::Storage(format!("staging file: {}", e)))?;
        let path = tmp.into_temp_path();
        let mut file = tokio::fs::File::create(&path).await?;
        let size = tokio::io::copy(&mut reader, &mut file).await?;
        file.sync_all().await?;
        Ok((path, size))
    }

    async fn put_single(
        &self,
        key: &str,
        staged: &std::path::Path,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let body = ByteStream::from_path(staged)
            .await
            .map_err(|e| SafedumpError::Storage(format!("read staged payload: {}", e)))?;
        let mut req = self.client.put_object().bucket(&self.bucket).key(key).body(body);
        for (k, v) in metadata {
            req = req.metadata(k, v);
        }
        req.send()
            .await
            .map_err(|e| SafedumpError::Storage(format!("upload failed: {}", e)))?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        key: &str,
        staged: &std::path::Path,
        size: u64,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let mut req = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key);
        for (k, v) in metadata {
            req = req.metadata(k, v);
        }
        let created = req
            .send()
            .await
            .map_err(|e| SafedumpError::Storage(format!("create multipart: {}", e)))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| SafedumpError::Storage("no upload id returned".to_string()))?
            .to_string();

        match self
            .upload_parts(key, &upload_id, staged, size)
            .await
        {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| SafedumpError::Storage(format!("complete multipart: {}", e)))?;
                Ok(())
            }
            Err(e) => {
                // Abort so the partial upload does not linger.
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!("failed to abort multipart upload {}: {}", upload_id, abort_err);
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        staged: &std::path::Path,
        size: u64,
    ) -> Result<Vec<CompletedPart>> {
        let mut file = tokio::fs::File::open(staged).await?;
        let mut parts = Vec::new();
        let mut offset = 0u64;
        let mut part_number = 1i32;
        let total_parts = size.div_ceil(PART_SIZE);

        while offset < size {
            let len = PART_SIZE.min(size - offset);
            let mut buf = vec![0u8; len as usize];
            file.seek(std::io::SeekFrom::Start(offset)).await?;
            file.read_exact(&mut buf).await?;

            let mut backoff = Backoff::for_uploads();
            let etag = loop {
                let result = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(buf.clone()))
                    .send()
                    .await;
                match result {
                    Ok(out) => {
                        break out
                            .e_tag()
                            .ok_or_else(|| {
                                SafedumpError::Storage("part upload returned no etag".to_string())
                            })?
                            .to_string()
                    }
                    Err(e) if backoff.attempts() + 1 < PART_ATTEMPTS => {
                        let delay = backoff.next_delay();
                        warn!(
                            "part {}/{} of {} failed: {}; retrying in {:?}",
                            part_number, total_parts, key, e, delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        return Err(SafedumpError::Storage(format!(
                            "part {} upload failed: {}",
                            part_number, e
                        )))
                    }
                }
            };

            parts.push(
                CompletedPart::builder()
                    .e_tag(etag)
                    .part_number(part_number)
                    .build(),
            );
            debug!("uploaded part {}/{} of {}", part_number, total_parts, key);
            offset += len;
            part_number += 1;
        }
        Ok(parts)
    }
}

fn to_chrono(ts: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(ts.secs(), ts.subsec_nanos())
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(
        &self,
        name: &str,
        reader: ObjectReader,
        size_hint: Option<u64>,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        let key = self.key(name);
        let (staged, size) = self.stage(reader).await?;
        if let Some(hint) = size_hint {
            if hint != size {
                debug!("size hint {} differs from staged size {} for {}", hint, size, key);
            }
        }

        if size >= self.multipart_threshold {
            self.put_multipart(&key, &staged, size, metadata).await?;
        } else {
            self.put_single(&key, &staged, metadata).await?;
        }
        debug!("uploaded s3://{}/{} ({} bytes)", self.bucket, key, size);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<ObjectReader> {
        let key = self.key(name);
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    SafedumpError::NotFound(name.to_string())
                } else {
                    SafedumpError::Storage(format!("download failed: {}", service))
                }
            })?;
        Ok(Box::new(resp.body.into_async_read()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let full_prefix = self.key(prefix);
        let mut out = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix);
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| SafedumpError::Storage(format!("list failed: {}", e)))?;

            for obj in resp.contents() {
                let Some(key) = obj.key() else { continue };
                let name = key
                    .strip_prefix(&self.prefix)
                    .map(|s| s.trim_start_matches('/'))
                    .unwrap_or(key)
                    .to_string();
                out.push(ObjectMeta {
                    name,
                    size: obj.size().unwrap_or(0) as u64,
                    mtime: obj.last_modified().and_then(to_chrono),
                    user_metadata: HashMap::new(),
                });
            }

            match resp.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(out)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let key = self.key(name);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| SafedumpError::Storage(format!("delete failed: {}", e)))?;
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let key = self.key(name);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service = e.into_service_error();
                // Only a definite not-found maps to false.
                if service.is_not_found() {
                    Ok(false)
                } else {
                    Err(SafedumpError::AccessDenied(format!("{}: {}", name, service)))
                }
            }
        }
    }

    async fn size(&self, name: &str) -> Result<u64> {
        let key = self.key(name);
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_not_found() {
                    SafedumpError::NotFound(name.to_string())
                } else {
                    SafedumpError::Storage(format!("head failed: {}", service))
                }
            })?;
        Ok(head.content_length().unwrap_or(0) as u64)
    }

    fn name(&self) -> &str {
        self.backend
    }
}
