use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::{net::SocketAddr, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Cross-source invalidation fan-out: a change to the key also
    /// invalidates every listed source (`table` or `table.column`).
    #[serde(default)]
    pub relations: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Relations validation
        for (source, related) in &self.relations {
            if source.trim().is_empty() {
                return Err("relations keys must not be empty".into());
            }
            for target in related {
                let table = relation_table(target);
                if table.is_empty() {
                    return Err(format!("relations.{source} contains an empty source name"));
                }
                if table == source {
                    return Err(format!("relations.{source} must not reference itself"));
                }
            }
        }
        // Cache validation
        if self.cache.default_ttl_secs == 0 {
            return Err("cache.default_ttl_secs must be > 0".into());
        }
        if self.cache.namespace.is_empty() {
            return Err("cache.namespace must not be empty".into());
        }
        if self.cache.server.provider == ServerCacheProvider::Redis
            && self.cache.server.redis.url.trim().is_empty()
        {
            return Err("cache.server.provider=redis requires cache.server.redis.url".into());
        }
        if self.cache.server.redis.pool_size == 0 {
            return Err("cache.server.redis.pool_size must be > 0".into());
        }
        if self.cache.server.redis.timeout_ms == 0 {
            return Err("cache.server.redis.timeout_ms must be > 0".into());
        }
        // Realtime validation
        let realtime = &self.realtime;
        if realtime.reliability.acknowledgments && realtime.reliability.retry_delays.is_empty() {
            return Err(
                "realtime.reliability.retry_delays must not be empty when acknowledgments are on"
                    .into(),
            );
        }
        if realtime.reliability.max_pending == 0 {
            return Err("realtime.reliability.max_pending must be > 0".into());
        }
        if realtime.backlog.capacity == 0 {
            return Err("realtime.backlog.capacity must be > 0".into());
        }
        if realtime.channel_capacity == 0 {
            return Err("realtime.channel_capacity must be > 0".into());
        }
        if realtime.sweep_interval_ms == 0 {
            return Err("realtime.sweep_interval_ms must be > 0".into());
        }
        if realtime.relay.enabled && self.cache.server.redis.url.trim().is_empty() {
            return Err("realtime.relay.enabled=true requires cache.server.redis.url".into());
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }

    /// Sources a change to `source` fans out to, in configuration order,
    /// with `table.column` entries reduced to their table.
    pub fn related_sources(&self, source: &str) -> Vec<String> {
        self.relations
            .get(source)
            .map(|targets| {
                targets
                    .iter()
                    .map(|t| relation_table(t).to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub(crate) fn relation_table(target: &str) -> &str {
    target.split('.').next().unwrap_or(target).trim()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied to queries that do not set their own
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Prefix for dependency-index entries
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub server: ServerCacheConfig,
    #[serde(default)]
    pub client: ClientCacheConfig,
}

fn default_ttl_secs() -> u64 {
    300
}
fn default_namespace() -> String {
    ripple_cache::DEFAULT_NAMESPACE.to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            namespace: default_namespace(),
            server: ServerCacheConfig::default(),
            client: ClientCacheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerCacheProvider {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerCacheConfig {
    #[serde(default)]
    pub provider: ServerCacheProvider,
    #[serde(default)]
    pub redis: RedisSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,
    /// Bound for every Redis round trip, connect included
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_redis_pool_size() -> usize {
    10
}
fn default_redis_timeout_ms() -> u64 {
    5000
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

impl RedisSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Storage the browser client keeps acknowledgment state in. The server only
/// advertises it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ClientStoreKind {
    #[default]
    #[serde(rename = "localStorage", alias = "local_storage")]
    LocalStorage,
    #[serde(rename = "sessionStorage", alias = "session_storage")]
    SessionStorage,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientCacheConfig {
    #[serde(default)]
    pub provider: ClientStoreKind,
}

// ---------------------------------------------------------------------------
// Realtime
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Sse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Fallback {
    #[default]
    Polling,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub fallback: Fallback,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub backlog: BacklogConfig,
    /// Per-connection outbound queue size
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// How often pending events are checked for redelivery
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default)]
    pub relay: RelayConfig,
}

fn default_true() -> bool {
    true
}
fn default_channel_capacity() -> usize {
    256
}
fn default_sweep_interval_ms() -> u64 {
    500
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transport: Transport::default(),
            fallback: Fallback::default(),
            reliability: ReliabilityConfig::default(),
            backlog: BacklogConfig::default(),
            channel_capacity: default_channel_capacity(),
            sweep_interval_ms: default_sweep_interval_ms(),
            relay: RelayConfig::default(),
        }
    }
}

impl RealtimeConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    #[serde(default = "default_true")]
    pub acknowledgments: bool,
    #[serde(default = "default_max_retries", alias = "maxRetries")]
    pub max_retries: u32,
    /// Backoff schedule in milliseconds; the last delay repeats
    #[serde(default = "default_retry_delays", alias = "retryDelays")]
    pub retry_delays: Vec<u64>,
    /// Unacknowledged events kept per connection; the oldest go first
    #[serde(default = "default_max_pending", alias = "maxPending")]
    pub max_pending: usize,
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_delays() -> Vec<u64> {
    vec![2000, 5000, 10000]
}
fn default_max_pending() -> usize {
    1000
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            acknowledgments: true,
            max_retries: default_max_retries(),
            retry_delays: default_retry_delays(),
            max_pending: default_max_pending(),
        }
    }
}

impl ReliabilityConfig {
    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogConfig {
    /// Events retained per organization for reconnect backfill
    #[serde(default = "default_backlog_capacity")]
    pub capacity: usize,
    #[serde(default = "default_backlog_retention_secs")]
    pub retention_secs: u64,
}

fn default_backlog_capacity() -> usize {
    1000
}
fn default_backlog_retention_secs() -> u64 {
    300
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            capacity: default_backlog_capacity(),
            retention_secs: default_backlog_retention_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_relay_channel")]
    pub channel: String,
}

fn default_relay_channel() -> String {
    crate::relay::DEFAULT_RELAY_CHANNEL.to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel: default_relay_channel(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::{Path, PathBuf};

    /// Default configuration file looked up in the working directory.
    pub const DEFAULT_CONFIG_FILE: &str = "ripple.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g., RIPPLE__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("RIPPLE")
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("realtime.reliability.retry_delays"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }

    pub fn load_config_with_default_path<P: AsRef<Path>>(
        path: Option<P>,
    ) -> Result<AppConfig, String> {
        let p = path
            .as_ref()
            .map(|p| p.as_ref().to_string_lossy().to_string());
        load_config(p.as_deref())
    }
}
