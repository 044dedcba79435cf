use crate::humanize::ByteSize;
use crate::retry::RetryPolicy;
use crate::task::LinkType;
use crate::worker::{HttpConfig as ClientConfig, RunnerConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Fjall keyspace holding the task store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Concurrent control API requests
    #[serde(default = "default_max_inflight_requests")]
    pub max_inflight_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            max_inflight_requests: default_max_inflight_requests(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/tasks")
}

fn default_max_inflight_requests() -> usize {
    64
}

/// Scheduler configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    /// Worker pool capacity N
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Link type assumed until the platform reports one
    #[serde(default = "default_initial_link")]
    pub initial_link: LinkType,
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            tick_interval_ms: default_tick_interval_ms(),
            initial_link: default_initial_link(),
        }
    }
}

fn default_workers() -> usize {
    3
}

fn default_tick_interval_ms() -> u64 {
    5_000
}

fn default_initial_link() -> LinkType {
    LinkType::Unmetered
}

/// Progress persistence cadence for workers
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    #[serde(default = "default_persist_every")]
    pub persist_every: ByteSize,
    #[serde(default = "default_persist_interval_ms")]
    pub persist_interval_ms: u64,
}

impl WorkerConfig {
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            persist_every: self.persist_every.as_u64(),
            persist_interval: Duration::from_millis(self.persist_interval_ms),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            persist_every: default_persist_every(),
            persist_interval_ms: default_persist_interval_ms(),
        }
    }
}

fn default_persist_every() -> ByteSize {
    ByteSize(1024 * 1024) // 1 MB
}

fn default_persist_interval_ms() -> u64 {
    2_000
}

/// Remote HTTP client settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    pub proxy: Option<String>,
}

impl HttpConfig {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            user_agent: self.user_agent.clone(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            user_agent: default_user_agent(),
            proxy: None,
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_user_agent() -> String {
    ClientConfig::default().user_agent
}

/// Retry policy settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

/// Retention configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    #[serde(default = "default_completed_ttl_days")]
    pub completed_ttl_days: u32,
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

impl RetentionConfig {
    pub fn completed_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.completed_ttl_days))
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_ttl_days: default_completed_ttl_days(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

fn default_completed_ttl_days() -> u32 {
    30
}

fn default_purge_interval_secs() -> u64 {
    6 * 60 * 60
}
