use k256::ecdsa::SigningKey;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::auth::hash_personal_message;
use crate::config::{Config, FilesystemSettings, ShutdownSignal, StorageSettings};
use crate::keys::{Backup, PublicKey, RecoverableSignature, UserId};
use crate::metrics::Metrics;
use crate::state::AppState;
use crate::storage::FilesystemStore;

pub fn test_keypair() -> (SigningKey, PublicKey) {
    let signing_key = SigningKey::random(&mut rand::thread_rng());
    let point = signing_key.verifying_key().to_encoded_point(false);
    let mut bytes = [0u8; 64];
    bytes.copy_from_slice(&point.as_bytes()[1..65]);
    (signing_key, PublicKey::from_raw(bytes))
}

pub fn sign_personal(key: &SigningKey, message: &[u8]) -> RecoverableSignature {
    let digest = hash_personal_message(message);
    let (signature, recovery_id) = key
        .sign_prehash_recoverable(&digest)
        .expect("signing never fails for a valid key");
    let mut rs = [0u8; 64];
    rs.copy_from_slice(signature.to_bytes().as_slice());
    RecoverableSignature::from_parts(rs, recovery_id.to_byte())
}

/// Wire form of [`sign_personal`]: `0x` + r‖s‖v hex with `v ∈ {27, 28}`.
pub fn signature_hex(key: &SigningKey, message: &[u8]) -> String {
    let signature = sign_personal(key, message);
    let mut bytes = [0u8; 65];
    bytes[..64].copy_from_slice(signature.rs());
    bytes[64] = 27 + signature.recovery_id();
    format!("0x{}", hex::encode(bytes))
}

pub fn backup_for(pubkey: &PublicKey, user_id: UserId, updated_at: &str) -> Backup {
    Backup {
        user_id,
        pubkey: pubkey.to_hex(),
        updated_at: updated_at.to_string(),
        payload: "0xdeadbeef".to_string(),
    }
}

pub fn test_backup(updated_at: &str) -> Backup {
    backup_for(
        &PublicKey::from_raw([0x11; 64]),
        UserId::parse("f81d4fae-7dec-11d0-a765-00a0c91e6bf6").expect("valid uuid"),
        updated_at,
    )
}

pub fn test_config(tempdir: &TempDir) -> Config {
    Config {
        storage: StorageSettings::Filesystem(FilesystemSettings {
            root_dir: tempdir.path().join("storage"),
            tmp_dir: tempdir.path().join("tmp"),
        }),
        maintenance_mode: false,
        origin_whitelist: Vec::new(),
        http_host: "127.0.0.1".to_string(),
        http_port: 0,
        trust_proxy: false,
        server_keep_alive: true,
        server_keep_alive_timeout: Duration::from_secs(5),
        server_max_header_size: 16 * 1024,
        server_tcp_nodelay: false,
        req_soft_timeout: Duration::from_secs(30),
        req_soft_timeout_interval: Duration::from_millis(100),
        req_hard_timeout: Duration::from_secs(120),
        req_body_size_limit: 100 * 1024,
        debug_errors: false,
        compression: false,
        extra_latency_base: Duration::ZERO,
        extra_latency_jitter: Duration::ZERO,
        extra_random_error_rate: 0.0,
        extra_random_error_base: Duration::ZERO,
        extra_random_error_jitter: Duration::ZERO,
        cluster_standalone: true,
        cluster_min_workers: 1,
        cluster_max_workers: 2,
        cluster_estimated_memory_primary: 128 * 1024 * 1024,
        cluster_estimated_memory_worker: 256 * 1024 * 1024,
        cluster_estimated_memory_max: 1024 * 1024 * 1024,
        cluster_memory_reserved: 0,
        cluster_add_worker_debounce: Duration::from_millis(20),
        prometheus_enabled: false,
        prometheus_host: "127.0.0.1".to_string(),
        prometheus_port: 0,
        prometheus_compression: false,
        prometheus_log_level: "info".to_string(),
        shutdown_signals: vec![ShutdownSignal::Term, ShutdownSignal::Int],
        shutdown_signal_count_accelerated: 5,
        shutdown_signal_count_immediate: 10,
    }
}

pub fn test_state() -> (AppState, TempDir) {
    test_state_with(|_| {})
}

pub fn test_state_with(mutate: impl FnOnce(&mut Config)) -> (AppState, TempDir) {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(&tempdir);
    mutate(&mut config);

    let store = match &config.storage {
        StorageSettings::Filesystem(settings) => {
            Arc::new(FilesystemStore::new(settings.clone()))
        }
        StorageSettings::S3(_) => panic!("tests run against the filesystem store"),
    };
    let state = AppState::new(config, store, Arc::new(Metrics::new()));
    (state, tempdir)
}
