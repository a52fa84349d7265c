//! Service configuration.
//!
//! All knobs live in one serde struct with defaults matching production
//! behaviour; the CLI overlays the handful of environment variables the
//! deployment contract requires (`POSTINO_DB`, `POSTINO_API_TOKEN`,
//! `POSTINO_BIND`).

use std::path::PathBuf;
use std::time::Duration;

use postino_retry::RetryStrategy;
use postino_types::ClientAuth;
use serde::{Deserialize, Serialize};

/// Attachment cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub memory_max_mb: f64,
    #[serde(with = "humantime_serde")]
    pub memory_ttl: Duration,
    /// Disk tier directory; unset disables the disk tier.
    pub disk_dir: Option<PathBuf>,
    pub disk_max_mb: f64,
    #[serde(with = "humantime_serde")]
    pub disk_ttl: Duration,
    pub disk_threshold_kb: f64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_max_mb: 50.0,
            memory_ttl: Duration::from_secs(300),
            disk_dir: None,
            disk_max_mb: 500.0,
            disk_ttl: Duration::from_secs(3600),
            disk_threshold_kb: 100.0,
        }
    }
}

impl CacheSettings {
    pub fn to_cache_config(&self) -> postino_cache::CacheConfig {
        postino_cache::CacheConfig {
            memory_max_bytes: (self.memory_max_mb * 1024.0 * 1024.0) as usize,
            memory_ttl: self.memory_ttl,
            disk_dir: self.disk_dir.clone(),
            disk_max_bytes: (self.disk_max_mb * 1024.0 * 1024.0) as u64,
            disk_ttl: self.disk_ttl,
            disk_threshold_bytes: (self.disk_threshold_kb * 1024.0) as usize,
        }
    }
}

/// Everything the orchestrator needs to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// SQLite database path; `":memory:"` for tests.
    pub db_path: String,
    /// Address the HTTP control surface binds to.
    pub bind: String,
    /// Global API token override; normally read from the instance row.
    pub api_token: Option<String>,

    /// Pause between dispatch cycles when nothing wakes the loop.
    #[serde(with = "humantime_serde")]
    pub send_loop_interval: Duration,
    /// Pause between reporter cycles.
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,
    /// Minimum spacing between syncs to the same tenant.
    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,
    /// Do-Not-Disturb cooloff applied to a tenant after a failed POST.
    #[serde(with = "humantime_serde")]
    pub report_backoff: Duration,
    /// Timeout for one webhook POST.
    #[serde(with = "humantime_serde")]
    pub report_timeout: Duration,
    /// IMAP polling interval for bounce/PEC mailboxes.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Maintenance cycle interval (pool eviction, log pruning, PEC sweep).
    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,
    /// PEC messages without an acceptance receipt for this long lose their
    /// `is_pec` flag and are treated as ordinary sent mail.
    #[serde(with = "humantime_serde")]
    pub pec_acceptance_timeout: Duration,

    /// Messages fetched per dispatch cycle.
    pub fetch_limit: i64,
    /// Per-account cap within one cycle (the account's own `batch_size`
    /// wins when smaller).
    pub batch_size_per_account: i64,
    /// Events fetched per reporter cycle.
    pub report_fetch_limit: i64,
    /// Maximum messages accepted in one `addMessages` call.
    pub max_enqueue_batch: usize,
    /// Reported messages older than this are eligible for cleanup.
    #[serde(with = "humantime_serde")]
    pub report_retention: Duration,

    pub max_concurrent_sends: usize,
    pub max_concurrent_per_account: usize,
    pub max_concurrent_attachments: usize,

    /// Bound of the in-memory delivery result channel.
    pub result_queue_size: usize,
    /// Backpressure timeout for the result channel; on expiry the event is
    /// dropped with a warning (the event log row is unaffected).
    #[serde(with = "humantime_serde")]
    pub queue_put_timeout: Duration,

    /// Per-attempt attachment fetch timeout.
    #[serde(with = "humantime_serde")]
    pub attachment_timeout: Duration,
    /// Base directory for `filesystem` attachment fetches.
    pub attachments_base_dir: Option<PathBuf>,

    /// Process-wide fallback sync URL for tenants without a base URL.
    pub client_sync_url: Option<String>,
    /// Auth used with the fallback sync URL.
    pub client_sync_auth: Option<ClientAuth>,

    /// Default priority for submissions that carry none.
    pub default_priority: i64,
    /// Log every delivery outcome at info level.
    pub log_delivery_activity: bool,

    pub retry: RetryStrategy,
    pub cache: CacheSettings,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            db_path: "/data/postino.db".into(),
            bind: "127.0.0.1:8025".into(),
            api_token: None,
            send_loop_interval: Duration::from_millis(500),
            report_interval: Duration::from_secs(30),
            sync_interval: Duration::from_secs(60),
            report_backoff: Duration::from_secs(300),
            report_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(300),
            pec_acceptance_timeout: Duration::from_secs(24 * 3600),
            fetch_limit: 10_000,
            batch_size_per_account: 50,
            report_fetch_limit: 200,
            max_enqueue_batch: 1_000,
            report_retention: Duration::from_secs(7 * 24 * 3600),
            max_concurrent_sends: 10,
            max_concurrent_per_account: 3,
            max_concurrent_attachments: 3,
            result_queue_size: 1_000,
            queue_put_timeout: Duration::from_secs(5),
            attachment_timeout: Duration::from_secs(30),
            attachments_base_dir: None,
            client_sync_url: None,
            client_sync_auth: None,
            default_priority: postino_types::DEFAULT_PRIORITY,
            log_delivery_activity: false,
            retry: RetryStrategy::default(),
            cache: CacheSettings::default(),
        }
    }
}

impl ProxyConfig {
    /// Overlay the deployment environment variables: `POSTINO_DB`,
    /// `POSTINO_API_TOKEN`, `POSTINO_BIND`.
    pub fn apply_env(mut self) -> Self {
        if let Ok(db) = std::env::var("POSTINO_DB") {
            if !db.is_empty() {
                self.db_path = db;
            }
        }
        if let Ok(token) = std::env::var("POSTINO_API_TOKEN") {
            if !token.is_empty() {
                self.api_token = Some(token);
            }
        }
        if let Ok(bind) = std::env::var("POSTINO_BIND") {
            if !bind.is_empty() {
                self.bind = bind;
            }
        }
        self
    }
}
