use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, loaded from the environment the way the
/// teacher's `config.rs`/`settings.rs` load `LOG_PATH`/`DB_PATH` -- no
/// config file, no flag parser (spec §1 treats the CLI front-end as an
/// external collaborator).
#[derive(Debug, Clone)]
pub struct Config {
    pub ingest_path: PathBuf,
    pub store_path: PathBuf,
    pub fast_addr: String,
    pub durable_addr: String,
    pub bulk_addr: String,
    pub http_addr: String,
    pub flush_size: usize,
    pub flush_age: Duration,
    pub pending_timeout: Duration,
    pub segment_target_size: u64,
    pub retention: Duration,
    pub purge_age: Duration,
    pub peers: Vec<String>,
    pub compacter_cycle: Duration,
    pub consumer_backoff: Duration,
    pub claim_timeout: Duration,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    PathBuf::from(env_string(key, default))
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_u64(key, default_secs))
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            ingest_path: env_path("INGEST_PATH", "./data/ingest"),
            store_path: env_path("STORE_PATH", "./data/store"),
            fast_addr: env_string("FAST_ADDR", "0.0.0.0:7000"),
            durable_addr: env_string("DURABLE_ADDR", "0.0.0.0:7001"),
            bulk_addr: env_string("BULK_ADDR", "0.0.0.0:7002"),
            http_addr: env_string("HTTP_ADDR", "0.0.0.0:8080"),
            flush_size: env_usize("FLUSH_SIZE", 16 * 1024 * 1024),
            flush_age: env_secs("FLUSH_AGE_SECS", 30),
            pending_timeout: env_secs("PENDING_TIMEOUT_SECS", 60),
            segment_target_size: env_u64("SEGMENT_TARGET_SIZE", 64 * 1024 * 1024),
            retention: env_secs("RETENTION_SECS", 7 * 24 * 3600),
            purge_age: env_secs("PURGE_AGE_SECS", 24 * 3600),
            peers: std::env::var("PEERS")
                .ok()
                .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect())
                .unwrap_or_default(),
            compacter_cycle: env_secs("COMPACTER_CYCLE_SECS", 5),
            consumer_backoff: env_secs("CONSUMER_BACKOFF_SECS", 2),
            claim_timeout: env_secs("CLAIM_TIMEOUT_SECS", 10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn defaults_when_unset() {
        for key in [
            "INGEST_PATH",
            "STORE_PATH",
            "FLUSH_SIZE",
            "PENDING_TIMEOUT_SECS",
            "PEERS",
        ] {
            std::env::remove_var(key);
        }
        let cfg = Config::from_env();
        assert_eq!(cfg.ingest_path, PathBuf::from("./data/ingest"));
        assert_eq!(cfg.flush_size, 16 * 1024 * 1024);
        assert!(cfg.peers.is_empty());
    }

    #[test]
    #[serial_test::serial]
    fn reads_overrides() {
        std::env::set_var("FLUSH_SIZE", "1234");
        std::env::set_var("PEERS", "a:1, b:2 ,");
        let cfg = Config::from_env();
        assert_eq!(cfg.flush_size, 1234);
        assert_eq!(cfg.peers, vec!["a:1".to_string(), "b:2".to_string()]);
        std::env::remove_var("FLUSH_SIZE");
        std::env::remove_var("PEERS");
    }
}
