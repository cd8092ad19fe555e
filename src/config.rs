use anyhow::{Context, Result};
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound on list results; older entries are silently dropped.
pub const MAX_RECENT_BACKUPS: usize = 50;

#[derive(Debug, Clone)]
pub enum StorageSettings {
    Filesystem(FilesystemSettings),
    S3(S3Settings),
}

#[derive(Debug, Clone)]
pub struct FilesystemSettings {
    pub root_dir: PathBuf,
    pub tmp_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket_name: String,
    pub region: String,
    pub root_path: String,
    pub request_timeout: Option<Duration>,
    pub connection_timeout: Option<Duration>,
    pub agent_keep_alive: bool,
    pub agent_keep_alive_interval: Option<Duration>,
    pub agent_max_sockets: Option<u32>,
    pub agent_tcp_nodelay: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageSettings,

    pub maintenance_mode: bool,
    pub origin_whitelist: Vec<Regex>,

    pub http_host: String,
    pub http_port: u16,
    pub trust_proxy: bool,
    pub server_keep_alive: bool,
    pub server_keep_alive_timeout: Duration,
    pub server_max_header_size: u64,
    pub server_tcp_nodelay: bool,

    pub req_soft_timeout: Duration,
    pub req_soft_timeout_interval: Duration,
    pub req_hard_timeout: Duration,
    pub req_body_size_limit: u64,
    pub debug_errors: bool,
    pub compression: bool,

    pub extra_latency_base: Duration,
    pub extra_latency_jitter: Duration,
    pub extra_random_error_rate: f64,
    pub extra_random_error_base: Duration,
    pub extra_random_error_jitter: Duration,

    pub cluster_standalone: bool,
    pub cluster_min_workers: usize,
    pub cluster_max_workers: usize,
    pub cluster_estimated_memory_primary: u64,
    pub cluster_estimated_memory_worker: u64,
    pub cluster_estimated_memory_max: u64,
    pub cluster_memory_reserved: u64,
    pub cluster_add_worker_debounce: Duration,

    pub prometheus_enabled: bool,
    pub prometheus_host: String,
    pub prometheus_port: u16,
    pub prometheus_compression: bool,
    pub prometheus_log_level: String,

    pub shutdown_signals: Vec<ShutdownSignal>,
    pub shutdown_signal_count_accelerated: u32,
    pub shutdown_signal_count_immediate: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Term,
    Int,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let storage = match env_string("STORAGE_DRIVER", "FS").to_uppercase().as_str() {
            "FS" => StorageSettings::Filesystem(FilesystemSettings {
                root_dir: env_required_path("STORAGE_FILESYSTEM_ROOT_DIRPATH")?,
                tmp_dir: env_optional_string("STORAGE_FILESYSTEM_TMP_DIRPATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(std::env::temp_dir),
            }),
            "S3" => StorageSettings::S3(S3Settings {
                bucket_name: env_optional_string("STORAGE_S3_BUCKET_NAME")
                    .context("STORAGE_S3_BUCKET_NAME must be set when STORAGE_DRIVER=S3")?,
                region: env_optional_string("STORAGE_S3_REGION")
                    .context("STORAGE_S3_REGION must be set when STORAGE_DRIVER=S3")?,
                root_path: env_string("STORAGE_S3_ROOT_PATH", ""),
                request_timeout: env_optional_duration(
                    "STORAGE_S3_REQUEST_HANDLER_REQUEST_TIMEOUT",
                )?,
                connection_timeout: env_optional_duration(
                    "STORAGE_S3_REQUEST_HANDLER_CONNECTION_TIMEOUT",
                )?,
                agent_keep_alive: env_bool("STORAGE_S3_AGENT_KEEP_ALIVE", true)?,
                agent_keep_alive_interval: env_optional_duration(
                    "STORAGE_S3_AGENT_KEEP_ALIVE_INTERVAL",
                )?,
                agent_max_sockets: env_optional_u32("STORAGE_S3_AGENT_MAX_SOCKETS")?,
                agent_tcp_nodelay: env_bool("STORAGE_S3_AGENT_TCP_NODELAY", false)?,
            }),
            other => anyhow::bail!("STORAGE_DRIVER must be FS or S3, got {other:?}"),
        };

        let origin_whitelist = match env_optional_string("API_ORIGIN_WHITELIST") {
            Some(raw) => parse_origin_whitelist(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            storage,
            maintenance_mode: env_bool("API_MAINTENANCE_MODE", false)?,
            origin_whitelist,
            http_host: env_string("API_HTTP_HOST", "127.0.0.1"),
            http_port: env_u16("API_HTTP_PORT", 8080)?,
            trust_proxy: env_bool("API_HTTP_TRUST_PROXY", false)?,
            server_keep_alive: env_bool("API_HTTP_SERVER_KEEP_ALIVE", true)?,
            server_keep_alive_timeout: env_duration(
                "API_HTTP_SERVER_KEEP_ALIVE_TIMEOUT",
                Duration::from_secs(5),
            )?,
            server_max_header_size: env_bytes("API_HTTP_SERVER_MAX_HEADER_SIZE", 16 * 1024)?,
            server_tcp_nodelay: env_bool("API_HTTP_SERVER_TCP_NODELAY", false)?,
            req_soft_timeout: env_duration("API_HTTP_REQ_SOFT_TIMEOUT", Duration::from_secs(30))?,
            req_soft_timeout_interval: env_duration(
                "API_HTTP_REQ_SOFT_TIMEOUT_INTERVAL",
                Duration::from_secs(5),
            )?,
            req_hard_timeout: env_duration("API_HTTP_REQ_HARD_TIMEOUT", Duration::from_secs(120))?,
            req_body_size_limit: env_bytes("API_HTTP_REQ_BODY_SIZE_LIMIT", 100 * 1024)?,
            debug_errors: env_bool("API_HTTP_DEBUG_ERRORS", false)?,
            compression: env_bool("API_HTTP_COMPRESSION", false)?,
            extra_latency_base: env_duration("API_HTTP_EXTRA_LATENCY_BASE", Duration::ZERO)?,
            extra_latency_jitter: env_duration("API_HTTP_EXTRA_LATENCY_JITTER", Duration::ZERO)?,
            extra_random_error_rate: env_rate("API_HTTP_EXTRA_RANDOM_ERROR_RATE", 0.0)?,
            extra_random_error_base: env_duration(
                "API_HTTP_EXTRA_RANDOM_ERROR_BASE",
                Duration::ZERO,
            )?,
            extra_random_error_jitter: env_duration(
                "API_HTTP_EXTRA_RANDOM_ERROR_JITTER",
                Duration::ZERO,
            )?,
            cluster_standalone: env_bool("API_CLUSTER_STANDALONE", false)?,
            cluster_min_workers: env_usize("API_CLUSTER_MIN_WORKERS", 1)?,
            cluster_max_workers: env_usize("API_CLUSTER_MAX_WORKERS", 16)?,
            cluster_estimated_memory_primary: env_bytes(
                "API_CLUSTER_ESTIMATED_MEMORY_PRIMARY",
                128 * 1024 * 1024,
            )?,
            cluster_estimated_memory_worker: env_bytes(
                "API_CLUSTER_ESTIMATED_MEMORY_WORKER",
                256 * 1024 * 1024,
            )?,
            cluster_estimated_memory_max: env_bytes(
                "API_CLUSTER_ESTIMATED_MEMORY_MAX",
                1024 * 1024 * 1024,
            )?,
            cluster_memory_reserved: env_bytes("API_CLUSTER_MEMORY_RESERVED", 0)?,
            cluster_add_worker_debounce: env_duration(
                "API_CLUSTER_ADD_WORKER_DEBOUNCE",
                Duration::from_secs(1),
            )?,
            prometheus_enabled: env_bool("API_PROMETHEUS_ENABLED", false)?,
            prometheus_host: env_string("API_PROMETHEUS_HOST", "127.0.0.1"),
            prometheus_port: env_u16("API_PROMETHEUS_PORT", 9091)?,
            prometheus_compression: env_bool("API_PROMETHEUS_COMPRESSION", false)?,
            prometheus_log_level: env_string("API_PROMETHEUS_LOG_LEVEL", "info"),
            shutdown_signals: parse_shutdown_signals(&env_string(
                "SHUTDOWN_SIGNALS",
                "SIGTERM,SIGINT",
            ))?,
            shutdown_signal_count_accelerated: env_u32("SHUTDOWN_SIGNAL_COUNT_ACCELERATED", 5)?,
            shutdown_signal_count_immediate: env_u32("SHUTDOWN_SIGNAL_COUNT_IMMEDIATE", 10)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    pub fn prometheus_bind_addr(&self) -> String {
        format!("{}:{}", self.prometheus_host, self.prometheus_port)
    }
}

fn parse_origin_whitelist(raw: &str) -> Result<Vec<Regex>> {
    let patterns: Vec<String> = serde_json::from_str(raw)
        .context("API_ORIGIN_WHITELIST must be a JSON array of regex strings")?;
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern)
                .with_context(|| format!("API_ORIGIN_WHITELIST entry is not a valid regex: {pattern:?}"))
        })
        .collect()
}

fn parse_shutdown_signals(raw: &str) -> Result<Vec<ShutdownSignal>> {
    let mut signals = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let signal = match part.to_uppercase().as_str() {
            "SIGTERM" | "TERM" => ShutdownSignal::Term,
            "SIGINT" | "INT" => ShutdownSignal::Int,
            other => anyhow::bail!("SHUTDOWN_SIGNALS entry not supported: {other:?}"),
        };
        if !signals.contains(&signal) {
            signals.push(signal);
        }
    }
    if signals.is_empty() {
        anyhow::bail!("SHUTDOWN_SIGNALS resolved to an empty list");
    }
    Ok(signals)
}

fn env_string(key: &str, default: &str) -> String {
    env_optional_string(key).unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_required_path(key: &str) -> Result<PathBuf> {
    let value = env_optional_string(key).with_context(|| format!("{key} must be set"))?;
    Ok(PathBuf::from(value))
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env_optional_string(key).map(|value| value.to_lowercase()) {
        Some(value) if value == "1" || value == "true" || value == "yes" => Ok(true),
        Some(value) if value == "0" || value == "false" || value == "no" => Ok(false),
        Some(value) => anyhow::bail!("{key} must be a boolean, got {value:?}"),
        None => Ok(default),
    }
}

fn env_u16(key: &str, default: u16) -> Result<u16> {
    match env_optional_string(key) {
        Some(value) => value
            .parse::<u16>()
            .with_context(|| format!("{key} must be an integer, got {value:?}")),
        None => Ok(default),
    }
}

fn env_u32(key: &str, default: u32) -> Result<u32> {
    match env_optional_string(key) {
        Some(value) => value
            .parse::<u32>()
            .with_context(|| format!("{key} must be an integer, got {value:?}")),
        None => Ok(default),
    }
}

fn env_optional_u32(key: &str) -> Result<Option<u32>> {
    match env_optional_string(key) {
        Some(value) => value
            .parse::<u32>()
            .map(Some)
            .with_context(|| format!("{key} must be an integer, got {value:?}")),
        None => Ok(None),
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize> {
    match env_optional_string(key) {
        Some(value) => value
            .parse::<usize>()
            .with_context(|| format!("{key} must be an integer, got {value:?}")),
        None => Ok(default),
    }
}

fn env_bytes(key: &str, default: u64) -> Result<u64> {
    match env_optional_string(key) {
        Some(value) => parse_bytes(&value).with_context(|| format!("invalid byte size in {key}")),
        None => Ok(default),
    }
}

fn env_duration(key: &str, default: Duration) -> Result<Duration> {
    match env_optional_string(key) {
        Some(value) => parse_duration(&value).with_context(|| format!("invalid duration in {key}")),
        None => Ok(default),
    }
}

fn env_optional_duration(key: &str) -> Result<Option<Duration>> {
    match env_optional_string(key) {
        Some(value) => parse_duration(&value)
            .map(Some)
            .with_context(|| format!("invalid duration in {key}")),
        None => Ok(None),
    }
}

fn env_rate(key: &str, default: f64) -> Result<f64> {
    match env_optional_string(key) {
        Some(value) => parse_rate(&value).with_context(|| format!("invalid rate in {key}")),
        None => Ok(default),
    }
}

/// Parses a byte size with an optional SI (`kb`, `mb`, `gb`, `tb`) or IEC
/// (`kib`, `mib`, `gib`, `tib`) suffix. A bare number is bytes.
pub fn parse_bytes(raw: &str) -> Result<u64> {
    let raw = raw.trim().to_lowercase();
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let number: f64 = number
        .parse()
        .with_context(|| format!("not a number: {raw:?}"))?;
    let multiplier: u64 = match suffix.trim() {
        "" | "b" => 1,
        "kb" => 1000,
        "mb" => 1000 * 1000,
        "gb" => 1000 * 1000 * 1000,
        "tb" => 1000 * 1000 * 1000 * 1000,
        "kib" => 1024,
        "mib" => 1024 * 1024,
        "gib" => 1024 * 1024 * 1024,
        "tib" => 1024 * 1024 * 1024 * 1024,
        other => anyhow::bail!("unknown byte suffix {other:?}"),
    };
    Ok((number * multiplier as f64) as u64)
}

/// Parses a duration with an optional `ms`/`s`/`m`/`h`/`d` suffix. A bare
/// number is milliseconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim().to_lowercase();
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let number: f64 = number
        .parse()
        .with_context(|| format!("not a number: {raw:?}"))?;
    let millis = match suffix.trim() {
        "" | "ms" => number,
        "s" => number * 1000.0,
        "m" => number * 60.0 * 1000.0,
        "h" => number * 60.0 * 60.0 * 1000.0,
        "d" => number * 24.0 * 60.0 * 60.0 * 1000.0,
        other => anyhow::bail!("unknown duration suffix {other:?}"),
    };
    Ok(Duration::from_millis(millis as u64))
}

/// Parses a rate as a fraction in `0.0..=1.0` or a percentage (`12.5%`).
pub fn parse_rate(raw: &str) -> Result<f64> {
    let raw = raw.trim();
    let value = if let Some(percent) = raw.strip_suffix('%') {
        percent
            .trim()
            .parse::<f64>()
            .with_context(|| format!("not a number: {raw:?}"))?
            / 100.0
    } else {
        raw.parse::<f64>()
            .with_context(|| format!("not a number: {raw:?}"))?
    };
    if !(0.0..=1.0).contains(&value) {
        anyhow::bail!("rate out of range 0.0..=1.0: {raw:?}");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_byte_suffixes() {
        assert_eq!(parse_bytes("100").unwrap(), 100);
        assert_eq!(parse_bytes("100b").unwrap(), 100);
        assert_eq!(parse_bytes("2kb").unwrap(), 2000);
        assert_eq!(parse_bytes("2kib").unwrap(), 2048);
        assert_eq!(parse_bytes("1.5mib").unwrap(), 1024 * 1024 + 512 * 1024);
        assert_eq!(parse_bytes("1GB").unwrap(), 1_000_000_000);
        assert!(parse_bytes("10xb").is_err());
        assert!(parse_bytes("abc").is_err());
    }

    #[test]
    fn parses_duration_suffixes() {
        assert_eq!(parse_duration("250").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("15s").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("0.5s").unwrap(), Duration::from_millis(500));
        assert!(parse_duration("5y").is_err());
    }

    #[test]
    fn parses_rates() {
        assert_eq!(parse_rate("0.25").unwrap(), 0.25);
        assert_eq!(parse_rate("25%").unwrap(), 0.25);
        assert_eq!(parse_rate("0").unwrap(), 0.0);
        assert_eq!(parse_rate("100%").unwrap(), 1.0);
        assert!(parse_rate("1.5").is_err());
        assert!(parse_rate("150%").is_err());
        assert!(parse_rate("nope").is_err());
    }

    #[test]
    fn parses_shutdown_signal_list() {
        assert_eq!(
            parse_shutdown_signals("SIGTERM,SIGINT").unwrap(),
            vec![ShutdownSignal::Term, ShutdownSignal::Int]
        );
        assert_eq!(
            parse_shutdown_signals("int").unwrap(),
            vec![ShutdownSignal::Int]
        );
        assert!(parse_shutdown_signals("SIGQUIT").is_err());
        assert!(parse_shutdown_signals(" , ").is_err());
    }

    #[test]
    fn origin_whitelist_requires_valid_regexes() {
        let list = parse_origin_whitelist(r#"["^https://app\\.example\\.com$"]"#).unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].is_match("https://app.example.com"));

        assert!(parse_origin_whitelist("not json").is_err());
        assert!(parse_origin_whitelist(r#"["["]"#).is_err());
    }
}
