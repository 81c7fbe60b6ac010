//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Durable record store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    /// Root directory holding one subdirectory per batch
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/batches")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkerConfig {
    /// Maximum concurrently executing tasks (0 = derive from CPU count)
    #[serde(default)]
    pub max_concurrent_tasks: u32,
}

/// Which backend the content cache uses to materialize a URL
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FetcherKind {
    /// Delegate to the `yt-dlp` executable
    #[default]
    YtDlp,
    /// Plain HTTP GET of the URL
    Http,
}

impl FromStr for FetcherKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "yt-dlp" | "ytdlp" => Ok(FetcherKind::YtDlp),
            "http" => Ok(FetcherKind::Http),
            other => Err(format!("unknown fetcher '{}'", other)),
        }
    }
}

/// Content cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Flat directory holding `<token>.<ext>` files
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    /// Largest single download accepted, in bytes
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Total footprint the janitor enforces, in bytes
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: u64,
    /// Lifetime of a successful entry
    #[serde(default = "default_success_ttl_secs")]
    pub success_ttl_secs: u64,
    /// Lifetime of a failure marker
    #[serde(default = "default_failure_ttl_secs")]
    pub failure_ttl_secs: u64,
    /// Janitor period
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Upper bound on a single fetch
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Extension given to cached files
    #[serde(default = "default_file_extension")]
    pub file_extension: String,
    /// Download backend
    #[serde(default)]
    pub fetcher: FetcherKind,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./data/cache")
}

fn default_max_file_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_max_total_bytes() -> u64 {
    20 * 1024 * 1024 * 1024
}

fn default_success_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_failure_ttl_secs() -> u64 {
    5 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60 * 60
}

fn default_fetch_timeout_secs() -> u64 {
    15 * 60
}

fn default_file_extension() -> String {
    "mp4".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            max_file_bytes: default_max_file_bytes(),
            max_total_bytes: default_max_total_bytes(),
            success_ttl_secs: default_success_ttl_secs(),
            failure_ttl_secs: default_failure_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            file_extension: default_file_extension(),
            fetcher: FetcherKind::default(),
        }
    }
}

/// Status server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Address the status endpoint listens on
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Overwrite `target` with the parsed value of `key` if it is set and valid.
///
/// Unparseable values are ignored and the existing value is kept.
fn override_from_env<T: FromStr>(key: &str, target: &mut T) {
    if let Ok(val) = env::var(key) {
        if let Ok(parsed) = val.trim().parse::<T>() {
            *target = parsed;
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Recognized variables:
    /// - REELQ_DATA_DIR -> store.data_dir
    /// - REELQ_MAX_CONCURRENT_TASKS -> worker.max_concurrent_tasks
    /// - REELQ_CACHE_DIR -> cache.dir
    /// - REELQ_CACHE_MAX_FILE_BYTES -> cache.max_file_bytes
    /// - REELQ_CACHE_MAX_TOTAL_BYTES -> cache.max_total_bytes
    /// - REELQ_CACHE_SUCCESS_TTL_SECS -> cache.success_ttl_secs
    /// - REELQ_CACHE_FAILURE_TTL_SECS -> cache.failure_ttl_secs
    /// - REELQ_CACHE_SWEEP_INTERVAL_SECS -> cache.sweep_interval_secs
    /// - REELQ_CACHE_FETCH_TIMEOUT_SECS -> cache.fetch_timeout_secs
    /// - REELQ_CACHE_FETCHER -> cache.fetcher
    /// - REELQ_BIND_ADDR -> server.bind_addr
    pub fn apply_env_overrides(&mut self) {
        override_from_env("REELQ_DATA_DIR", &mut self.store.data_dir);
        override_from_env(
            "REELQ_MAX_CONCURRENT_TASKS",
            &mut self.worker.max_concurrent_tasks,
        );
        override_from_env("REELQ_CACHE_DIR", &mut self.cache.dir);
        override_from_env("REELQ_CACHE_MAX_FILE_BYTES", &mut self.cache.max_file_bytes);
        override_from_env("REELQ_CACHE_MAX_TOTAL_BYTES", &mut self.cache.max_total_bytes);
        override_from_env(
            "REELQ_CACHE_SUCCESS_TTL_SECS",
            &mut self.cache.success_ttl_secs,
        );
        override_from_env(
            "REELQ_CACHE_FAILURE_TTL_SECS",
            &mut self.cache.failure_ttl_secs,
        );
        override_from_env(
            "REELQ_CACHE_SWEEP_INTERVAL_SECS",
            &mut self.cache.sweep_interval_secs,
        );
        override_from_env(
            "REELQ_CACHE_FETCH_TIMEOUT_SECS",
            &mut self.cache.fetch_timeout_secs,
        );
        override_from_env("REELQ_CACHE_FETCHER", &mut self.cache.fetcher);
        override_from_env("REELQ_BIND_ADDR", &mut self.server.bind_addr);
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file falls back to defaults.
    ///
    /// Environment overrides are applied in both cases.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            let mut config = Config::default();
            config.apply_env_overrides();
            return Ok(config);
        }
        Self::load(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "REELQ_DATA_DIR",
        "REELQ_MAX_CONCURRENT_TASKS",
        "REELQ_CACHE_DIR",
        "REELQ_CACHE_MAX_FILE_BYTES",
        "REELQ_CACHE_MAX_TOTAL_BYTES",
        "REELQ_CACHE_SUCCESS_TTL_SECS",
        "REELQ_CACHE_FAILURE_TTL_SECS",
        "REELQ_CACHE_SWEEP_INTERVAL_SECS",
        "REELQ_CACHE_FETCH_TIMEOUT_SECS",
        "REELQ_CACHE_FETCHER",
        "REELQ_BIND_ADDR",
    ];

    fn clear_env_vars() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            max_tasks in 0u32..64,
            max_file in 1u64..10_000_000_000,
            max_total in 1u64..100_000_000_000,
            success_ttl in 1u64..1_000_000,
            failure_ttl in 1u64..10_000,
            use_http in proptest::bool::ANY,
        ) {
            let toml_str = format!(
                r#"
[store]
data_dir = "/srv/reelq/batches"

[worker]
max_concurrent_tasks = {}

[cache]
dir = "/srv/reelq/cache"
max_file_bytes = {}
max_total_bytes = {}
success_ttl_secs = {}
failure_ttl_secs = {}
fetcher = "{}"

[server]
bind_addr = "0.0.0.0:9000"
"#,
                max_tasks,
                max_file,
                max_total,
                success_ttl,
                failure_ttl,
                if use_http { "http" } else { "yt-dlp" },
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(&config.store.data_dir, &PathBuf::from("/srv/reelq/batches"));
            prop_assert_eq!(config.worker.max_concurrent_tasks, max_tasks);
            prop_assert_eq!(&config.cache.dir, &PathBuf::from("/srv/reelq/cache"));
            prop_assert_eq!(config.cache.max_file_bytes, max_file);
            prop_assert_eq!(config.cache.max_total_bytes, max_total);
            prop_assert_eq!(config.cache.success_ttl_secs, success_ttl);
            prop_assert_eq!(config.cache.failure_ttl_secs, failure_ttl);
            let expected_fetcher = if use_http { FetcherKind::Http } else { FetcherKind::YtDlp };
            prop_assert_eq!(config.cache.fetcher, expected_fetcher);
            prop_assert_eq!(config.server.bind_addr.as_str(), "0.0.0.0:9000");
        }

        #[test]
        fn prop_env_overrides_max_concurrent_tasks(
            initial in 0u32..8,
            override_tasks in 0u32..64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[worker]\nmax_concurrent_tasks = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("REELQ_MAX_CONCURRENT_TASKS", override_tasks.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.worker.max_concurrent_tasks, override_tasks);
        }

        #[test]
        fn prop_env_overrides_cache_ttls(
            success_ttl in 1u64..1_000_000,
            failure_ttl in 1u64..10_000,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let mut config = Config::default();
            env::set_var("REELQ_CACHE_SUCCESS_TTL_SECS", success_ttl.to_string());
            env::set_var("REELQ_CACHE_FAILURE_TTL_SECS", failure_ttl.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.cache.success_ttl_secs, success_ttl);
            prop_assert_eq!(config.cache.failure_ttl_secs, failure_ttl);
        }
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.store.data_dir, PathBuf::from("./data/batches"));
        assert_eq!(config.worker.max_concurrent_tasks, 0);
        assert_eq!(config.cache.dir, PathBuf::from("./data/cache"));
        assert_eq!(config.cache.max_file_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(config.cache.success_ttl_secs, 86_400);
        assert_eq!(config.cache.failure_ttl_secs, 300);
        assert_eq!(config.cache.sweep_interval_secs, 3_600);
        assert_eq!(config.cache.file_extension, "mp4");
        assert_eq!(config.cache.fetcher, FetcherKind::YtDlp);
        assert_eq!(config.server.bind_addr, "127.0.0.1:7878");
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[cache]
max_total_bytes = 1024
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.cache.max_total_bytes, 1024);
        assert_eq!(config.cache.success_ttl_secs, 86_400); // default
        assert_eq!(config.worker.max_concurrent_tasks, 0); // default
    }

    #[test]
    fn test_invalid_env_value_keeps_existing() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("REELQ_MAX_CONCURRENT_TASKS", "lots");
        env::set_var("REELQ_CACHE_FETCHER", "carrier-pigeon");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.worker.max_concurrent_tasks, 0);
        assert_eq!(config.cache.fetcher, FetcherKind::YtDlp);
    }

    #[test]
    fn test_env_overrides_paths_and_fetcher() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("REELQ_DATA_DIR", "/var/lib/reelq");
        env::set_var("REELQ_CACHE_FETCHER", "http");
        env::set_var("REELQ_BIND_ADDR", "0.0.0.0:8080");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.store.data_dir, PathBuf::from("/var/lib/reelq"));
        assert_eq!(config.cache.fetcher, FetcherKind::Http);
        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let config = Config::load_or_default("/nonexistent/reelq/config.toml")
            .expect("Missing file should fall back to defaults");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let result = Config::parse_toml("[cache\nmax_total_bytes = ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
