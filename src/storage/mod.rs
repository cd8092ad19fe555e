pub mod fs;
pub mod s3;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fmt::Display;
use std::io::{Read, Write};
use std::sync::Arc;

use crate::config::{StorageSettings, MAX_RECENT_BACKUPS};
use crate::keys::{Backup, PublicKey, PublicKeyHash, UserId};

pub use fs::FilesystemStore;
pub use s3::S3Store;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Transport-level failure; the store is unreachable or refused us.
    #[error("storage unavailable: {detail}")]
    Unavailable { detail: String },
    /// A stored object failed to decompress, decode, or satisfy the
    /// partition invariant.
    #[error("storage corrupt: {detail}")]
    Corrupt { detail: String },
}

impl StorageError {
    pub fn unavailable(err: impl Display) -> Self {
        Self::Unavailable {
            detail: err.to_string(),
        }
    }

    pub fn corrupt(err: impl Display) -> Self {
        Self::Corrupt {
            detail: err.to_string(),
        }
    }
}

/// Content-addressed backup storage. Keys are always
/// `(sha256(pubkey), userId)`; the raw public key never reaches the store.
/// No variant retries internally; failures propagate to the caller.
#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Atomically creates or overwrites the backup for
    /// `(pubkey_hash, backup.user_id)`.
    async fn save_user_backup(
        &self,
        pubkey_hash: &PublicKeyHash,
        backup: &Backup,
    ) -> Result<(), StorageError>;

    /// Every backup under the partition, newest first, capped at
    /// [`MAX_RECENT_BACKUPS`]. A partition that never existed is an empty
    /// list, not an error.
    async fn get_user_backups(
        &self,
        pubkey_hash: &PublicKeyHash,
    ) -> Result<Vec<Backup>, StorageError>;

    async fn get_user_backup(
        &self,
        pubkey_hash: &PublicKeyHash,
        user_id: &UserId,
    ) -> Result<Option<Backup>, StorageError>;

    /// Removing an absent backup succeeds; the miss is logged at warn.
    async fn delete_user_backup(
        &self,
        pubkey_hash: &PublicKeyHash,
        user_id: &UserId,
    ) -> Result<(), StorageError>;
}

pub async fn build_store(settings: &StorageSettings) -> anyhow::Result<Arc<dyn BackupStore>> {
    match settings {
        StorageSettings::Filesystem(fs_settings) => {
            Ok(Arc::new(FilesystemStore::new(fs_settings.clone())))
        }
        StorageSettings::S3(s3_settings) => Ok(Arc::new(S3Store::connect(s3_settings).await?)),
    }
}

/// JSON → gzip, the stored object form.
pub(crate) fn encode_backup(backup: &Backup) -> Result<Vec<u8>, StorageError> {
    let json = serde_json::to_vec(backup).map_err(StorageError::unavailable)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .and_then(|_| encoder.finish())
        .map_err(StorageError::unavailable)
}

pub(crate) fn decode_backup(bytes: &[u8]) -> Result<Backup, StorageError> {
    let mut json = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut json)
        .map_err(StorageError::corrupt)?;
    serde_json::from_slice(&json).map_err(StorageError::corrupt)
}

/// Five one-byte directory levels followed by the remaining 54 hex chars of
/// the hash. The `0x` prefix never appears in the key path.
pub(crate) fn partition_segments(pubkey_hash: &PublicKeyHash) -> [String; 6] {
    let h = pubkey_hash.to_hex();
    [
        h[2..4].to_string(),
        h[4..6].to_string(),
        h[6..8].to_string(),
        h[8..10].to_string(),
        h[10..12].to_string(),
        h[12..66].to_string(),
    ]
}

pub(crate) fn backup_filename(user_id: &UserId) -> String {
    format!("{user_id}.json.gz")
}

pub(crate) fn sort_and_truncate(mut backups: Vec<Backup>) -> Vec<Backup> {
    backups.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    backups.truncate(MAX_RECENT_BACKUPS);
    backups
}

/// Invariant: hashing the stored pubkey must land back on the partition the
/// object was read from. Anything else is corruption, never a client error.
pub(crate) fn check_partition(
    backup: &Backup,
    expected: &PublicKeyHash,
) -> Result<(), StorageError> {
    let pubkey = PublicKey::parse(&backup.pubkey)
        .map_err(|err| StorageError::corrupt(format!("stored pubkey unparseable: {err}")))?;
    if &pubkey.hash() != expected {
        return Err(StorageError::corrupt(format!(
            "stored pubkey hashes outside its partition {}",
            expected.to_hex()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_backup;

    #[test]
    fn codec_round_trips_through_gzip() {
        let backup = test_backup("2024-01-02T03:04:05.006Z");
        let encoded = encode_backup(&backup).unwrap();
        // Gzip magic bytes; the object really is compressed on the wire.
        assert_eq!(&encoded[..2], &[0x1f, 0x8b]);
        assert_eq!(decode_backup(&encoded).unwrap(), backup);
    }

    #[test]
    fn decode_rejects_plain_json() {
        let backup = test_backup("2024-01-02T03:04:05.006Z");
        let json = serde_json::to_vec(&backup).unwrap();
        assert!(matches!(
            decode_backup(&json),
            Err(StorageError::Corrupt { .. })
        ));
    }

    #[test]
    fn partition_segments_cover_the_hash() {
        let backup = test_backup("2024-01-02T03:04:05.006Z");
        let hash = PublicKey::parse(&backup.pubkey).unwrap().hash();
        let segments = partition_segments(&hash);

        for segment in &segments[..5] {
            assert_eq!(segment.len(), 2);
        }
        assert_eq!(segments[5].len(), 54);
        assert_eq!(format!("0x{}", segments.join("")), hash.to_hex());
    }

    #[test]
    fn sorts_descending_and_caps_at_fifty() {
        let backups: Vec<Backup> = (0..60)
            .map(|i| test_backup(&format!("2024-01-01T00:00:{:02}.{:03}Z", i / 1000, i % 1000)))
            .collect();
        let sorted = sort_and_truncate(backups);
        assert_eq!(sorted.len(), MAX_RECENT_BACKUPS);
        assert!(sorted
            .windows(2)
            .all(|pair| pair[0].updated_at > pair[1].updated_at));
        // Only the newest 50 of the 60 survive.
        assert_eq!(sorted[0].updated_at, "2024-01-01T00:00:00.059Z");
        assert_eq!(sorted[49].updated_at, "2024-01-01T00:00:00.010Z");
    }

    #[test]
    fn partition_check_flags_foreign_pubkeys() {
        let backup = test_backup("2024-01-02T03:04:05.006Z");
        let own_hash = PublicKey::parse(&backup.pubkey).unwrap().hash();
        assert!(check_partition(&backup, &own_hash).is_ok());

        let foreign_hash = PublicKey::from_raw([0x42; 64]).hash();
        assert!(matches!(
            check_partition(&backup, &foreign_hash),
            Err(StorageError::Corrupt { .. })
        ));
    }
}
