use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;

use super::{
    backup_filename, check_partition, decode_backup, encode_backup, partition_segments,
    sort_and_truncate, BackupStore, StorageError,
};
use crate::config::{S3Settings, MAX_RECENT_BACKUPS};
use crate::keys::{Backup, PublicKeyHash, UserId};

/// List paging stops after this many `ListObjectsV2` round trips even if the
/// partition somehow holds more keys; the overflow is logged, not surfaced.
const MAX_LIST_PAGES: usize = 3;

pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    root_path: String,
}

fn join_key(root_path: &str, tail: &[String]) -> String {
    let root = root_path.trim_matches('/');
    let mut parts: Vec<&str> = Vec::new();
    if !root.is_empty() {
        parts.push(root);
    }
    parts.push("backups");
    parts.extend(tail.iter().map(String::as_str));
    parts.join("/")
}

fn object_key(root_path: &str, pubkey_hash: &PublicKeyHash, user_id: &UserId) -> String {
    let mut tail = partition_segments(pubkey_hash).to_vec();
    tail.push(backup_filename(user_id));
    join_key(root_path, &tail)
}

fn partition_prefix(root_path: &str, pubkey_hash: &PublicKeyHash) -> String {
    let tail = partition_segments(pubkey_hash).to_vec();
    format!("{}/", join_key(root_path, &tail))
}

impl S3Store {
    pub async fn connect(settings: &S3Settings) -> anyhow::Result<Self> {
        let mut timeouts = aws_config::timeout::TimeoutConfig::builder();
        if let Some(timeout) = settings.request_timeout {
            timeouts = timeouts.operation_timeout(timeout);
        }
        if let Some(timeout) = settings.connection_timeout {
            timeouts = timeouts.connect_timeout(timeout);
        }

        // Socket-pool knobs the SDK does not expose per-field are accepted
        // for parity with the deployment environment and recorded here.
        tracing::debug!(
            keep_alive = settings.agent_keep_alive,
            keep_alive_interval = ?settings.agent_keep_alive_interval,
            max_sockets = ?settings.agent_max_sockets,
            tcp_nodelay = settings.agent_tcp_nodelay,
            "s3 agent settings"
        );

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()))
            .timeout_config(timeouts.build())
            .load()
            .await;

        Ok(Self {
            client: aws_sdk_s3::Client::new(&sdk_config),
            bucket: settings.bucket_name.clone(),
            root_path: settings.root_path.clone(),
        })
    }

    async fn fetch_object(
        &self,
        key: &str,
        pubkey_hash: &PublicKeyHash,
    ) -> Result<Option<Backup>, StorageError> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    return Ok(None);
                }
                return Err(StorageError::unavailable(service_err));
            }
        };
        let bytes = response
            .body
            .collect()
            .await
            .map_err(StorageError::unavailable)?
            .into_bytes();
        let backup = decode_backup(&bytes)?;
        check_partition(&backup, pubkey_hash)?;
        Ok(Some(backup))
    }
}

#[async_trait]
impl BackupStore for S3Store {
    async fn save_user_backup(
        &self,
        pubkey_hash: &PublicKeyHash,
        backup: &Backup,
    ) -> Result<(), StorageError> {
        let bytes = encode_backup(backup)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(object_key(&self.root_path, pubkey_hash, &backup.user_id))
            .content_type("application/json")
            .content_encoding("gzip")
            .metadata("pubkey-hash", pubkey_hash.to_hex())
            .metadata("user-id", backup.user_id.to_string())
            .metadata("updated-at", backup.updated_at.clone())
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(StorageError::unavailable)?;
        Ok(())
    }

    async fn get_user_backups(
        &self,
        pubkey_hash: &PublicKeyHash,
    ) -> Result<Vec<Backup>, StorageError> {
        let prefix = partition_prefix(&self.root_path, pubkey_hash);
        let mut keys: Vec<String> = Vec::new();
        let mut continuation: Option<String> = None;
        let mut truncated_overflow = false;

        for page in 0.. {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .max_keys(MAX_RECENT_BACKUPS as i32)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(StorageError::unavailable)?;

            for object in response.contents() {
                if keys.len() >= MAX_RECENT_BACKUPS {
                    truncated_overflow = true;
                    break;
                }
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }

            let more = response.is_truncated().unwrap_or(false);
            if !more || keys.len() >= MAX_RECENT_BACKUPS {
                truncated_overflow |= more;
                break;
            }
            if page + 1 >= MAX_LIST_PAGES {
                truncated_overflow = true;
                break;
            }
            continuation = response.next_continuation_token().map(str::to_string);
        }

        if truncated_overflow {
            tracing::warn!(
                pubkey_hash = %pubkey_hash.to_hex(),
                kept = keys.len(),
                "partition exceeds list caps; older keys skipped"
            );
        }

        let mut backups = Vec::new();
        for key in &keys {
            if let Some(backup) = self.fetch_object(key, pubkey_hash).await? {
                backups.push(backup);
            }
        }
        Ok(sort_and_truncate(backups))
    }

    async fn get_user_backup(
        &self,
        pubkey_hash: &PublicKeyHash,
        user_id: &UserId,
    ) -> Result<Option<Backup>, StorageError> {
        let key = object_key(&self.root_path, pubkey_hash, user_id);
        self.fetch_object(&key, pubkey_hash).await
    }

    async fn delete_user_backup(
        &self,
        pubkey_hash: &PublicKeyHash,
        user_id: &UserId,
    ) -> Result<(), StorageError> {
        // S3 deletes are idempotent; an absent key still returns success.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(object_key(&self.root_path, pubkey_hash, user_id))
            .send()
            .await
            .map_err(StorageError::unavailable)?;
        Ok(())
    }
}
