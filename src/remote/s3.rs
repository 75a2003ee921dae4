//! S3-backed remote client
//!
//! Implements the RemoteClient contract against Amazon S3 or S3-compatible
//! storage (MinIO, LocalStack, etc.). Directories are virtual: a zero-byte
//! object with a trailing slash marks an empty directory.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, trace};

use crate::config::S3Config;
use crate::error::{CloudMountError, Result};
use crate::remote::{RemoteClient, RemoteEntry};

fn join_child(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Remote client for Amazon S3 and S3-compatible storage
pub struct S3RemoteClient {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3RemoteClient {
    /// Create a new S3 client from configuration
    pub async fn new(config: S3Config) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(CloudMountError::Config(
                "s3.bucket must be set".to_string(),
            ));
        }

        let mut sdk_config_builder = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            sdk_config_builder = sdk_config_builder.region(Region::new(region.clone()));
        }
        let sdk_config = sdk_config_builder.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_config_builder.build()),
            bucket: config.bucket,
            prefix: config.prefix.unwrap_or_default(),
        })
    }

    /// Convert a filesystem path to an S3 key
    fn path_to_key(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.prefix.clone()
        } else if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), path)
        }
    }

    /// Listing prefix for a directory path ("" for the bucket root)
    fn dir_prefix(&self, path: &str) -> String {
        let key = self.path_to_key(path);
        if key.is_empty() {
            String::new()
        } else {
            format!("{key}/")
        }
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(CloudMountError::Backend(format!(
                        "S3 HeadObject error: {service_error}"
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl RemoteClient for S3RemoteClient {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let prefix = self.dir_prefix(path);
        trace!("list: path={path} prefix={prefix}");

        let mut entries = Vec::new();
        let mut saw_any = false;
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .delimiter("/");
            if !prefix.is_empty() {
                request = request.prefix(&prefix);
            }
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let result = request.send().await.map_err(|e| {
                CloudMountError::Backend(format!(
                    "S3 ListObjectsV2 error: {:?}",
                    e.into_service_error()
                ))
            })?;

            saw_any |= result.key_count().unwrap_or(0) > 0
                || !result.common_prefixes().is_empty();

            for obj in result.contents() {
                let Some(key) = obj.key() else { continue };
                // Skip directory marker objects
                if key.ends_with('/') {
                    continue;
                }
                let rel = key.strip_prefix(prefix.as_str()).unwrap_or(key);
                if rel.is_empty() || rel.contains('/') {
                    continue;
                }
                entries.push(RemoteEntry::file(
                    rel,
                    join_child(path, rel),
                    obj.size().unwrap_or(0).max(0) as u64,
                    obj.last_modified().map(|t| t.secs()).unwrap_or(0),
                ));
            }

            for common_prefix in result.common_prefixes() {
                let Some(p) = common_prefix.prefix() else { continue };
                let rel = p.strip_prefix(prefix.as_str()).unwrap_or(p);
                let name = rel.trim_end_matches('/');
                if name.is_empty() {
                    continue;
                }
                entries.push(RemoteEntry::directory(name, join_child(path, name), 0));
            }

            if result.is_truncated().unwrap_or(false) {
                continuation_token = result.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        if path != "/" && !saw_any {
            return Err(CloudMountError::NotFound(path.to_string()));
        }
        Ok(entries)
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let key = self.path_to_key(remote);
        debug!("upload: {local:?} -> {key}");

        if self.object_exists(&key).await? {
            return Err(CloudMountError::Conflict(remote.to_string()));
        }

        let body = ByteStream::from_path(local)
            .await
            .map_err(|e| CloudMountError::Backend(format!("failed to read {local:?}: {e}")))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                CloudMountError::Backend(format!("S3 PutObject error: {}", e.into_service_error()))
            })?;
        Ok(())
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        let key = self.path_to_key(remote);
        debug!("download: {key} -> {local:?}");

        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    CloudMountError::NotFound(remote.to_string())
                } else {
                    CloudMountError::Backend(format!("S3 GetObject error: {service_error}"))
                }
            })?;

        let data = result
            .body
            .collect()
            .await
            .map_err(|e| CloudMountError::Backend(format!("S3 read body error: {e}")))?;
        tokio::fs::write(local, data.into_bytes()).await?;
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        // Zero-byte object with a trailing slash marks the directory
        let key = self.dir_prefix(path);
        debug!("create_dir: {key}");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(Vec::new()))
            .send()
            .await
            .map_err(|e| {
                CloudMountError::Backend(format!("S3 PutObject error: {}", e.into_service_error()))
            })?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let key = self.path_to_key(path);
        debug!("delete: {key}");

        if self.object_exists(&key).await? {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| {
                    CloudMountError::Backend(format!(
                        "S3 DeleteObject error: {}",
                        e.into_service_error()
                    ))
                })?;
            return Ok(());
        }

        // Not a plain object: delete everything under the directory prefix,
        // marker included
        let prefix = self.dir_prefix(path);
        let mut deleted_any = false;

        loop {
            let result = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .send()
                .await
                .map_err(|e| {
                    CloudMountError::Backend(format!(
                        "S3 ListObjectsV2 error: {:?}",
                        e.into_service_error()
                    ))
                })?;

            let objects: Vec<_> = result
                .contents()
                .iter()
                .filter_map(|obj| obj.key())
                .filter_map(|k| {
                    aws_sdk_s3::types::ObjectIdentifier::builder()
                        .key(k)
                        .build()
                        .ok()
                })
                .collect();

            if objects.is_empty() {
                break;
            }
            deleted_any = true;

            let delete = aws_sdk_s3::types::Delete::builder()
                .set_objects(Some(objects))
                .build()
                .map_err(|e| CloudMountError::Backend(format!("failed to build delete: {e}")))?;

            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| {
                    CloudMountError::Backend(format!(
                        "S3 DeleteObjects error: {}",
                        e.into_service_error()
                    ))
                })?;

            if !result.is_truncated().unwrap_or(false) {
                break;
            }
        }

        if !deleted_any {
            return Err(CloudMountError::NotFound(path.to_string()));
        }
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        // S3 has no native rename: copy, then delete the source
        let from_key = self.path_to_key(from);
        let to_key = self.path_to_key(to);
        debug!("rename: {from_key} -> {to_key}");

        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, from_key))
            .key(&to_key)
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.code() == Some("NoSuchKey") {
                    CloudMountError::NotFound(from.to_string())
                } else {
                    CloudMountError::Backend(format!("S3 CopyObject error: {service_error}"))
                }
            })?;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&from_key)
            .send()
            .await
            .map_err(|e| {
                CloudMountError::Backend(format!(
                    "S3 DeleteObject error: {}",
                    e.into_service_error()
                ))
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_with_prefix(prefix: &str) -> S3RemoteClient {
        // Build without touching the network: config resolution is lazy
        let conf = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .build();
        S3RemoteClient {
            client: Client::from_conf(conf),
            bucket: "bucket".to_string(),
            prefix: prefix.to_string(),
        }
    }

    #[test]
    fn test_path_to_key() {
        let client = client_with_prefix("");
        assert_eq!(client.path_to_key("/"), "");
        assert_eq!(client.path_to_key("/a/b.txt"), "a/b.txt");

        let client = client_with_prefix("data");
        assert_eq!(client.path_to_key("/"), "data");
        assert_eq!(client.path_to_key("/a/b.txt"), "data/a/b.txt");
    }

    #[test]
    fn test_dir_prefix() {
        let client = client_with_prefix("");
        assert_eq!(client.dir_prefix("/"), "");
        assert_eq!(client.dir_prefix("/docs"), "docs/");

        let client = client_with_prefix("data");
        assert_eq!(client.dir_prefix("/"), "data/");
        assert_eq!(client.dir_prefix("/docs"), "data/docs/");
    }

    #[test]
    fn test_join_child() {
        assert_eq!(join_child("/", "a.txt"), "/a.txt");
        assert_eq!(join_child("/docs", "a.txt"), "/docs/a.txt");
    }
}
