//! # Storewatch Configuration
//!
//! Configuration for the sync job, the partner client, the collector and the
//! cache.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     STOREWATCH_PARTNER_SECRET=...                                      │
//! │     STOREWATCH_DATABASE_PATH=/var/lib/storewatch/storewatch.db         │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/storewatch/storewatch.toml (Linux)                       │
//! │     ~/Library/Application Support/com.storewatch.storewatch/...        │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # storewatch.toml
//! [database]
//! path = "storewatch.db"
//!
//! [partner]
//! base_url = "https://partner.example.com"
//! corporation_id = "C100"
//! app_key = "storewatch"
//!
//! [collector]
//! command = "node"
//! args = ["collector.js", "--platform", "{platform}"]
//! timeout_secs = 180
//! platforms = ["grab", "foodpanda", "deliveroo"]
//!
//! [cache]
//! backend = "sqlite"  # sqlite | redis
//!
//! [sync]
//! interval_secs = 300
//! max_concurrency = 4
//! ```
//!
//! The partner secret is never read from the file when the environment sets
//! it, and is skipped when the config is saved.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use storewatch_core::{CacheTier, Platform, DEFAULT_JOB_NAME};

/// Placeholder replaced with the platform name in collector arguments.
pub const PLATFORM_PLACEHOLDER: &str = "{platform}";

// =============================================================================
// Database Settings
// =============================================================================

/// Where the SQLite database lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Database file path.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("storewatch.db")
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_database_path(),
        }
    }
}

// =============================================================================
// Partner Settings
// =============================================================================

/// Header names sent on every partner call.
///
/// Partners differ in naming, so each header name is configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerHeaders {
    #[serde(default = "default_header_corporation")]
    pub corporation_id: String,
    #[serde(default = "default_header_app_key")]
    pub app_key: String,
    #[serde(default = "default_header_grant_type")]
    pub grant_type: String,
    #[serde(default = "default_header_token")]
    pub token: String,
    #[serde(default = "default_header_timestamp")]
    pub timestamp: String,
    #[serde(default = "default_header_trace_id")]
    pub trace_id: String,
}

fn default_header_corporation() -> String {
    "Corporation-Id".into()
}
fn default_header_app_key() -> String {
    "AppKey".into()
}
fn default_header_grant_type() -> String {
    "GrantType".into()
}
fn default_header_token() -> String {
    "Token".into()
}
fn default_header_timestamp() -> String {
    "Timestamp".into()
}
fn default_header_trace_id() -> String {
    "TraceId".into()
}

impl Default for PartnerHeaders {
    fn default() -> Self {
        PartnerHeaders {
            corporation_id: default_header_corporation(),
            app_key: default_header_app_key(),
            grant_type: default_header_grant_type(),
            token: default_header_token(),
            timestamp: default_header_timestamp(),
            trace_id: default_header_trace_id(),
        }
    }
}

/// Partner API endpoint and credential settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartnerSettings {
    /// Base URL all endpoint paths are joined onto.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_get_token_path")]
    pub get_token_path: String,

    #[serde(default = "default_refresh_token_path")]
    pub refresh_token_path: String,

    #[serde(default = "default_shop_list_path")]
    pub shop_list_path: String,

    #[serde(default = "default_item_list_path")]
    pub item_list_path: String,

    #[serde(default)]
    pub corporation_id: String,

    #[serde(default)]
    pub app_key: String,

    /// Signing secret. Prefer `STOREWATCH_PARTNER_SECRET`.
    #[serde(default, skip_serializing)]
    pub secret: String,

    #[serde(default = "default_grant_type")]
    pub grant_type: String,

    #[serde(default)]
    pub headers: PartnerHeaders,

    /// A token expiring within this many seconds is treated as expired.
    #[serde(default = "default_token_margin")]
    pub token_margin_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Upper bound on retrying an unreachable token endpoint.
    #[serde(default = "default_auth_retry_secs")]
    pub auth_retry_max_secs: u64,

    /// TTL of the cross-process refresh lease. The holder renews it every
    /// third of the TTL while the refresh is in progress.
    #[serde(default = "default_refresh_lease_ttl")]
    pub refresh_lease_ttl_secs: u64,

    /// How long a caller waits for another process's refresh. Must cover
    /// [`PartnerSettings::refresh_budget`].
    #[serde(default = "default_refresh_wait")]
    pub refresh_wait_secs: u64,

    /// Hard cap on pages fetched by `list_all_*`.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_base_url() -> String {
    "http://localhost:8080".into()
}
fn default_get_token_path() -> String {
    "/auth/get_token".into()
}
fn default_refresh_token_path() -> String {
    "/auth/refresh_token".into()
}
fn default_shop_list_path() -> String {
    "/shop/list".into()
}
fn default_item_list_path() -> String {
    "/item/list".into()
}
fn default_grant_type() -> String {
    "client_credentials".into()
}
fn default_token_margin() -> u64 {
    120
}
fn default_request_timeout() -> u64 {
    30
}
fn default_auth_retry_secs() -> u64 {
    30
}
fn default_refresh_lease_ttl() -> u64 {
    30
}
fn default_refresh_wait() -> u64 {
    120
}
fn default_max_pages() -> u32 {
    200
}

impl Default for PartnerSettings {
    fn default() -> Self {
        PartnerSettings {
            base_url: default_base_url(),
            get_token_path: default_get_token_path(),
            refresh_token_path: default_refresh_token_path(),
            shop_list_path: default_shop_list_path(),
            item_list_path: default_item_list_path(),
            corporation_id: String::new(),
            app_key: String::new(),
            secret: String::new(),
            grant_type: default_grant_type(),
            headers: PartnerHeaders::default(),
            token_margin_secs: default_token_margin(),
            request_timeout_secs: default_request_timeout(),
            auth_retry_max_secs: default_auth_retry_secs(),
            refresh_lease_ttl_secs: default_refresh_lease_ttl(),
            refresh_wait_secs: default_refresh_wait(),
            max_pages: default_max_pages(),
        }
    }
}

impl PartnerSettings {
    /// Credentials are present; the partner API takes part in runs.
    pub fn is_configured(&self) -> bool {
        !self.corporation_id.trim().is_empty() && !self.app_key.trim().is_empty()
    }

    pub fn token_margin(&self) -> Duration {
        Duration::from_secs(self.token_margin_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_lease_ttl_secs)
    }

    pub fn refresh_wait(&self) -> Duration {
        Duration::from_secs(self.refresh_wait_secs)
    }

    /// Longest a refresh can hold its lease: the refresh-token exchange and
    /// the fallback credential exchange, each retried for `auth_retry_max_secs`
    /// with one more request timeout on the last attempt.
    pub fn refresh_budget(&self) -> Duration {
        Duration::from_secs(2 * (self.auth_retry_max_secs + self.request_timeout_secs))
    }
}

// =============================================================================
// Collector Settings
// =============================================================================

/// External marketplace collector invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorSettings {
    /// Program to run. Empty disables the collector.
    #[serde(default)]
    pub command: String,

    /// Arguments; `{platform}` is substituted per run.
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_collector_timeout")]
    pub timeout_secs: u64,

    /// Directory for `collector-<platform>.json` side files.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_platforms")]
    pub platforms: Vec<Platform>,
}

fn default_collector_timeout() -> u64 {
    180
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("collector-cache")
}
fn default_platforms() -> Vec<Platform> {
    Platform::ALL.to_vec()
}

impl Default for CollectorSettings {
    fn default() -> Self {
        CollectorSettings {
            command: String::new(),
            args: Vec::new(),
            timeout_secs: default_collector_timeout(),
            cache_dir: default_cache_dir(),
            platforms: default_platforms(),
        }
    }
}

impl CollectorSettings {
    pub fn is_enabled(&self) -> bool {
        !self.command.trim().is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Arguments with the platform placeholder substituted.
    pub fn args_for(&self, platform: Platform) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(PLATFORM_PLACEHOLDER, platform.as_str()))
            .collect()
    }
}

// =============================================================================
// Cache Settings
// =============================================================================

/// Cache backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// Rows in the shared SQLite database.
    #[default]
    Sqlite,
    /// External Redis server.
    Redis,
}

impl std::fmt::Display for CacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheBackend::Sqlite => write!(f, "sqlite"),
            CacheBackend::Redis => write!(f, "redis"),
        }
    }
}

impl std::str::FromStr for CacheBackend {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sqlite" => Ok(CacheBackend::Sqlite),
            "redis" => Ok(CacheBackend::Redis),
            _ => Err(SyncError::InvalidConfig(format!(
                "Unknown cache backend: {}. Use sqlite or redis.",
                s
            ))),
        }
    }
}

/// Cache backend and per-tier TTL overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default)]
    pub backend: CacheBackend,

    #[serde(default)]
    pub redis_url: Option<String>,

    #[serde(default)]
    pub fast_ttl_secs: Option<u64>,
    #[serde(default)]
    pub moderate_ttl_secs: Option<u64>,
    #[serde(default)]
    pub slow_ttl_secs: Option<u64>,
    #[serde(default)]
    pub very_slow_ttl_secs: Option<u64>,
}

impl CacheSettings {
    /// TTL for a tier, honoring overrides.
    pub fn ttl(&self, tier: CacheTier) -> Duration {
        let override_secs = match tier {
            CacheTier::Fast => self.fast_ttl_secs,
            CacheTier::Moderate => self.moderate_ttl_secs,
            CacheTier::Slow => self.slow_ttl_secs,
            CacheTier::VerySlow => self.very_slow_ttl_secs,
        };
        override_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| tier.default_ttl())
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Scheduler and run behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Job name; the run lease is `run:<job_name>`.
    #[serde(default = "default_job_name")]
    pub job_name: String,

    /// First partner page to request.
    #[serde(default = "default_page")]
    pub page: u32,

    /// Partner page size.
    #[serde(default = "default_size")]
    pub size: u32,

    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Parallel shop fetches per run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Added to the collector budget when sizing the run lease.
    #[serde(default = "default_lease_slack")]
    pub lease_slack_secs: u64,

    /// No completed run within this window raises a stale-data alert.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
}

fn default_job_name() -> String {
    DEFAULT_JOB_NAME.into()
}
fn default_page() -> u32 {
    1
}
fn default_size() -> u32 {
    100
}
fn default_interval() -> u64 {
    300
}
fn default_max_concurrency() -> usize {
    4
}
fn default_lease_slack() -> u64 {
    120
}
fn default_stale_after() -> u64 {
    3600
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            job_name: default_job_name(),
            page: default_page(),
            size: default_size(),
            interval_secs: default_interval(),
            max_concurrency: default_max_concurrency(),
            lease_slack_secs: default_lease_slack(),
            stale_after_secs: default_stale_after(),
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

// =============================================================================
// Alert Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSettings {
    /// Shops whose available share falls below this ratio are flagged.
    #[serde(default = "default_availability_threshold")]
    pub availability_threshold: f64,
}

fn default_availability_threshold() -> f64 {
    0.5
}

impl Default for AlertSettings {
    fn default() -> Self {
        AlertSettings {
            availability_threshold: default_availability_threshold(),
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete storewatch configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorewatchConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub partner: PartnerSettings,

    #[serde(default)]
    pub collector: CollectorSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub alerts: AlertSettings,
}

impl StorewatchConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (storewatch.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Saves configuration to file. The partner secret is not written.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        let base = url::Url::parse(&self.partner.base_url)?;
        if base.scheme() != "http" && base.scheme() != "https" {
            return Err(SyncError::InvalidUrl(format!(
                "Partner base URL must be http:// or https://, got: {}",
                self.partner.base_url
            )));
        }

        if self.sync.size == 0 {
            return Err(SyncError::InvalidConfig("sync.size must be greater than 0".into()));
        }
        if self.sync.max_concurrency == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.max_concurrency must be greater than 0".into(),
            ));
        }
        if self.sync.interval_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.interval_secs must be greater than 0".into(),
            ));
        }
        if self.sync.job_name.trim().is_empty() {
            return Err(SyncError::InvalidConfig("sync.job_name must not be empty".into()));
        }
        if self.collector.timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "collector.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.partner.max_pages == 0 {
            return Err(SyncError::InvalidConfig(
                "partner.max_pages must be greater than 0".into(),
            ));
        }
        if self.partner.refresh_lease_ttl_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "partner.refresh_lease_ttl_secs must be greater than 0".into(),
            ));
        }
        if self.partner.refresh_wait() < self.partner.refresh_budget() {
            return Err(SyncError::InvalidConfig(format!(
                "partner.refresh_wait_secs must be at least {}s \
                 (2 x (auth_retry_max_secs + request_timeout_secs))",
                self.partner.refresh_budget().as_secs()
            )));
        }
        if !(0.0..=1.0).contains(&self.alerts.availability_threshold) {
            return Err(SyncError::InvalidConfig(
                "alerts.availability_threshold must be within 0.0..=1.0".into(),
            ));
        }
        if self.cache.backend == CacheBackend::Redis && self.cache.redis_url.is_none() {
            return Err(SyncError::InvalidConfig(
                "cache.redis_url is required for the redis backend".into(),
            ));
        }

        Ok(())
    }

    /// Applies environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("STOREWATCH_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Ok(url) = std::env::var("STOREWATCH_PARTNER_BASE_URL") {
            debug!(url = %url, "Overriding partner base URL from environment");
            self.partner.base_url = url;
        }

        if let Ok(id) = std::env::var("STOREWATCH_PARTNER_CORPORATION_ID") {
            self.partner.corporation_id = id;
        }

        if let Ok(key) = std::env::var("STOREWATCH_PARTNER_APP_KEY") {
            self.partner.app_key = key;
        }

        // Never logged
        if let Ok(secret) = std::env::var("STOREWATCH_PARTNER_SECRET") {
            self.partner.secret = secret;
        }

        if let Ok(command) = std::env::var("STOREWATCH_COLLECTOR_COMMAND") {
            self.collector.command = command;
        }

        if let Ok(secs) = std::env::var("STOREWATCH_COLLECTOR_TIMEOUT_SECS") {
            if let Ok(s) = secs.parse::<u64>() {
                self.collector.timeout_secs = s;
            }
        }

        if let Ok(backend) = std::env::var("STOREWATCH_CACHE_BACKEND") {
            match backend.parse() {
                Ok(parsed) => self.cache.backend = parsed,
                Err(_) => warn!(backend = %backend, "Unknown cache backend in environment"),
            }
        }

        if let Ok(url) = std::env::var("STOREWATCH_REDIS_URL") {
            self.cache.redis_url = Some(url);
        }

        if let Ok(secs) = std::env::var("STOREWATCH_SYNC_INTERVAL_SECS") {
            if let Ok(s) = secs.parse::<u64>() {
                debug!(interval_secs = s, "Overriding sync interval from environment");
                self.sync.interval_secs = s;
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "storewatch", "storewatch")
            .map(|dirs| dirs.config_dir().join("storewatch.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// Run lease TTL: the collector budget for every platform plus slack.
    pub fn run_lease_ttl(&self) -> Duration {
        let platforms = self.collector.platforms.len().max(1) as u64;
        Duration::from_secs(self.collector.timeout_secs * platforms + self.sync.lease_slack_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.sync.stale_after_secs)
    }
}
