use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use uuid::Uuid;

use super::{
    backup_filename, check_partition, decode_backup, encode_backup, partition_segments,
    sort_and_truncate, BackupStore, StorageError,
};
use crate::config::FilesystemSettings;
use crate::keys::{Backup, PublicKeyHash, UserId};

/// Subdirectory of the configured tmp dir holding in-flight writes. Callers
/// pick a tmp dir on the same device as the root so the final rename is
/// atomic.
const TMP_SUBDIR: &str = "enkrypt-backend";

pub struct FilesystemStore {
    root_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl FilesystemStore {
    pub fn new(settings: FilesystemSettings) -> Self {
        Self {
            root_dir: settings.root_dir,
            tmp_dir: settings.tmp_dir,
        }
    }

    fn partition_dir(&self, pubkey_hash: &PublicKeyHash) -> PathBuf {
        partition_segments(pubkey_hash)
            .iter()
            .fold(self.root_dir.join("backups"), |dir, segment| {
                dir.join(segment)
            })
    }

    fn backup_path(&self, pubkey_hash: &PublicKeyHash, user_id: &UserId) -> PathBuf {
        self.partition_dir(pubkey_hash).join(backup_filename(user_id))
    }

    async fn write_atomic(&self, final_path: &PathBuf, bytes: &[u8]) -> std::io::Result<()> {
        let tmp_root = self.tmp_dir.join(TMP_SUBDIR);
        let mut dir_builder = tokio::fs::DirBuilder::new();
        dir_builder.recursive(true);
        #[cfg(unix)]
        dir_builder.mode(0o700);
        dir_builder.create(&tmp_root).await?;

        let filename = final_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let tmp_path = tmp_root.join(format!("{filename}-{}.tmp", Uuid::new_v4()));

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&tmp_path).await?;

        use tokio::io::AsyncWriteExt;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Err(err) = tokio::fs::rename(&tmp_path, final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl BackupStore for FilesystemStore {
    async fn save_user_backup(
        &self,
        pubkey_hash: &PublicKeyHash,
        backup: &Backup,
    ) -> Result<(), StorageError> {
        let bytes = encode_backup(backup)?;
        let path = self.backup_path(pubkey_hash, &backup.user_id);
        self.write_atomic(&path, &bytes)
            .await
            .map_err(StorageError::unavailable)
    }

    async fn get_user_backups(
        &self,
        pubkey_hash: &PublicKeyHash,
    ) -> Result<Vec<Backup>, StorageError> {
        let dir = self.partition_dir(pubkey_hash);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StorageError::unavailable(err)),
        };

        let mut backups = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(StorageError::unavailable)?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".json.gz") {
                continue;
            }
            let bytes = tokio::fs::read(entry.path())
                .await
                .map_err(StorageError::unavailable)?;
            let backup = decode_backup(&bytes)?;
            check_partition(&backup, pubkey_hash)?;
            backups.push(backup);
        }
        Ok(sort_and_truncate(backups))
    }

    async fn get_user_backup(
        &self,
        pubkey_hash: &PublicKeyHash,
        user_id: &UserId,
    ) -> Result<Option<Backup>, StorageError> {
        let path = self.backup_path(pubkey_hash, user_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageError::unavailable(err)),
        };
        let backup = decode_backup(&bytes)?;
        check_partition(&backup, pubkey_hash)?;
        Ok(Some(backup))
    }

    async fn delete_user_backup(
        &self,
        pubkey_hash: &PublicKeyHash,
        user_id: &UserId,
    ) -> Result<(), StorageError> {
        let path = self.backup_path(pubkey_hash, user_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::warn!(
                    pubkey_hash = %pubkey_hash.to_hex(),
                    user_id = %user_id,
                    "delete of absent backup"
                );
                Ok(())
            }
            Err(err) => Err(StorageError::unavailable(err)),
        }
    }
}
