//! TOML configuration.
//!
//! The whole engine is configured once from a static file; nothing is
//! reconfigured at runtime.
//!
//! ```toml
//! [db]
//! path = "./data/mirror.sqlite"
//!
//! [http]
//! timeout_secs = 30
//! call_delay_ms = 250
//! max_attempts = 5
//! retry_delay_ms = 2000
//! use_proxy = false
//!
//! [store]
//! bucket_fetched = "ris-fetched"
//! bucket_backup = "ris-backup"
//! min_age_before_download_secs = 86400
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    pub store: StoreConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Pacing delay before every attempt (plus up to a third as jitter).
    #[serde(default = "default_call_delay_ms")]
    pub call_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Initial backoff between failed attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Ceiling for the growing backoff.
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default)]
    pub use_proxy: bool,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Response header announcing a redirect to the portal's login page.
    #[serde(default = "default_auth_redirect_header")]
    pub auth_redirect_header: String,
    #[serde(default = "default_auth_redirect_value")]
    pub auth_redirect_value: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            call_delay_ms: default_call_delay_ms(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            use_proxy: false,
            user_agent: None,
            auth_redirect_header: default_auth_redirect_header(),
            auth_redirect_value: default_auth_redirect_value(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
    pub fn call_delay(&self) -> Duration {
        Duration::from_millis(self.call_delay_ms)
    }
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_call_delay_ms() -> u64 {
    250
}
fn default_max_attempts() -> u32 {
    5
}
fn default_retry_delay_ms() -> u64 {
    2_000
}
fn default_max_retry_delay_ms() -> u64 {
    120_000
}
fn default_auth_redirect_header() -> String {
    "X-Page".to_string()
}
fn default_auth_redirect_value() -> String {
    "noauth.asp".to_string()
}

/// Egress proxy allocation service.
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Allocation endpoint queried with GET.
    pub url: String,
    /// Scheme given to allocated addresses: `http`, `socks5` or `socks5h`.
    #[serde(default = "default_proxy_proto")]
    pub proto: String,
    /// Response parser: `json-list` (`[{"ip": .., "port": ..}]`) or `plain`.
    #[serde(default = "default_proxy_parser")]
    pub parser: String,
    #[serde(default)]
    pub secret_header: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub host_header: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
}

fn default_proxy_proto() -> String {
    "http".to_string()
}
fn default_proxy_parser() -> String {
    "json-list".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub bucket_fetched: String,
    pub bucket_backup: String,
    #[serde(default)]
    pub bucket_ocr: Option<String>,
    #[serde(default)]
    pub bucket_ocr_html: Option<String>,
    /// Stored artifacts younger than this are never re-downloaded.
    #[serde(default = "default_min_age_secs")]
    pub min_age_before_download_secs: u64,
    #[serde(default = "default_content_language")]
    pub content_language: String,
}

/// Upper bound for `store.min_age_before_download_secs` (100 years).
pub const MAX_MIN_AGE_SECS: u64 = 100 * 365 * 24 * 60 * 60;

impl StoreConfig {
    /// Clamped to [`MAX_MIN_AGE_SECS`].
    pub fn min_age_before_download(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.min_age_before_download_secs.min(MAX_MIN_AGE_SECS) as i64)
    }
}

fn default_min_age_secs() -> u64 {
    24 * 60 * 60
}
fn default_content_language() -> String {
    "de".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` for humans, `json` for log collectors.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate http
    if config.http.max_attempts == 0 {
        anyhow::bail!("http.max_attempts must be >= 1");
    }
    if config.http.timeout_secs == 0 {
        anyhow::bail!("http.timeout_secs must be > 0");
    }
    if config.http.max_retry_delay_ms < config.http.retry_delay_ms {
        anyhow::bail!("http.max_retry_delay_ms must be >= http.retry_delay_ms");
    }

    // Validate proxy
    if config.http.use_proxy && config.proxy.is_none() {
        anyhow::bail!("http.use_proxy = true requires a [proxy] section");
    }
    if let Some(proxy) = &config.proxy {
        match proxy.parser.as_str() {
            "json-list" | "plain" => {}
            other => anyhow::bail!(
                "Unknown proxy parser: '{}'. Must be json-list or plain.",
                other
            ),
        }
        match proxy.proto.as_str() {
            "http" | "https" | "socks5" | "socks5h" => {}
            other => anyhow::bail!(
                "Unknown proxy proto: '{}'. Must be http, https, socks5 or socks5h.",
                other
            ),
        }
    }

    // Validate store
    if config.store.bucket_fetched.is_empty() || config.store.bucket_backup.is_empty() {
        anyhow::bail!("store.bucket_fetched and store.bucket_backup must be set");
    }
    if config.store.bucket_fetched == config.store.bucket_backup {
        anyhow::bail!("store.bucket_backup must differ from store.bucket_fetched");
    }
    if config.store.min_age_before_download_secs > MAX_MIN_AGE_SECS {
        anyhow::bail!(
            "store.min_age_before_download_secs must be <= {} (100 years)",
            MAX_MIN_AGE_SECS
        );
    }

    // Validate log
    match config.log.format.as_str() {
        "text" | "json" => {}
        other => anyhow::bail!("Unknown log format: '{}'. Must be text or json.", other),
    }

    Ok(config)
}
