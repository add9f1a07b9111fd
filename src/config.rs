//! Daemon configuration, read from `NEONA_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Default listen address for the daemon API.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:7466";

/// Default claim TTL when a worker does not ask for one.
pub const DEFAULT_CLAIM_TTL_SECS: u64 = 300;

/// Runtime configuration for `neonad`.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub listen: SocketAddr,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    pub policy_path: Option<PathBuf>,
    pub leases: LeaseConfig,
    pub retry: RetryConfig,
    /// Interval between reaper sweeps.
    pub reaper_interval: Duration,
    /// Interval between running-task policy re-checks. `None` disables the loop.
    pub recheck_interval: Option<Duration>,
    pub global_max_workers: usize,
    /// A worker not seen for this long reads back as offline.
    pub worker_offline_after: Duration,
    pub connector: ConnectorConfig,
}

/// Claim lease bounds.
#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    pub default_ttl: Duration,
    pub max_ttl: Duration,
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Local execution connector settings.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub workdir: PathBuf,
    pub allowed_commands: Vec<String>,
    pub timeout: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(DEFAULT_CLAIM_TTL_SECS),
            max_ttl: Duration::from_secs(3600),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from("."),
            allowed_commands: ["git", "go", "cargo", "npm", "make", "ls", "cat", "echo", "pwd"]
                .into_iter()
                .map(String::from)
                .collect(),
            timeout: Duration::from_secs(120),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let home = neona_home();
        Self {
            listen: DEFAULT_LISTEN
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 7466))),
            db_path: home.join("neona.db"),
            log_dir: home,
            policy_path: None,
            leases: LeaseConfig::default(),
            retry: RetryConfig::default(),
            reaper_interval: Duration::from_secs(5),
            recheck_interval: None,
            global_max_workers: 10,
            worker_offline_after: Duration::from_secs(120),
            connector: ConnectorConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// Values that are present but unparsable are rejected rather than
    /// silently replaced.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(listen) = env_parse::<SocketAddr>("NEONA_LISTEN")? {
            config.listen = listen;
        }
        if let Some(path) = env_string("NEONA_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(dir) = env_string("NEONA_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        config.policy_path = env_string("NEONA_POLICY_PATH").map(PathBuf::from);

        if let Some(secs) = env_parse::<u64>("NEONA_DEFAULT_TTL_SECS")? {
            config.leases.default_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("NEONA_MAX_TTL_SECS")? {
            config.leases.max_ttl = Duration::from_secs(secs);
        }
        if config.leases.default_ttl.is_zero() || config.leases.default_ttl > config.leases.max_ttl {
            return Err(ConfigError::InvalidValue {
                key: "NEONA_DEFAULT_TTL_SECS".into(),
                message: "must be non-zero and not above NEONA_MAX_TTL_SECS".into(),
            });
        }

        if let Some(secs) = env_parse::<u64>("NEONA_REAPER_INTERVAL_SECS")? {
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "NEONA_REAPER_INTERVAL_SECS".into(),
                    message: "reaper interval must be at least one second".into(),
                });
            }
            config.reaper_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("NEONA_RECHECK_INTERVAL_SECS")? {
            config.recheck_interval = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(n) = env_parse::<u32>("NEONA_MAX_RETRIES")? {
            config.retry.max_retries = n;
        }
        if let Some(secs) = env_parse::<u64>("NEONA_RETRY_BASE_SECS")? {
            config.retry.base_delay = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<usize>("NEONA_GLOBAL_MAX_WORKERS")? {
            config.global_max_workers = n;
        }
        if let Some(secs) = env_parse::<u64>("NEONA_WORKER_OFFLINE_SECS")? {
            config.worker_offline_after = Duration::from_secs(secs);
        }

        if let Some(dir) = env_string("NEONA_WORKDIR") {
            config.connector.workdir = PathBuf::from(dir);
        } else if let Ok(cwd) = std::env::current_dir() {
            config.connector.workdir = cwd;
        }
        if let Some(list) = env_string("NEONA_ALLOWED_COMMANDS") {
            config.connector.allowed_commands = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(secs) = env_parse::<u64>("NEONA_RUN_TIMEOUT_SECS")? {
            config.connector.timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

/// `~/.neona`, or `./.neona` when no home directory is known.
fn neona_home() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".neona")
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}
