use clap::Parser;
use lib_realtime::core::{DispatcherConfig, MetricsConfig, PublisherConfig};
use lib_realtime::errors::ConfigError;
use lib_realtime::ingestors::BridgeConfig;
use lib_realtime::{DEFAULT_UPSTREAM_CHANNEL, LOG_STREAM_CHANNEL, METRICS_STREAM_CHANNEL};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "server_realtime.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Real-time log event distribution server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "REALTIME_PORT", help = "Port to listen on for subscriber connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "REALTIME_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "REALTIME_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "REALTIME_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "REDIS_HOST", help = "Redis host of the upstream bus.")]
    pub redis_host: Option<String>,

    #[clap(long, env = "REDIS_PORT", help = "Redis port of the upstream bus.")]
    pub redis_port: Option<u16>,

    #[clap(long, env = "REDIS_PASSWORD", help = "Redis password of the upstream bus.")]
    pub redis_password: Option<String>,

    #[clap(long, env = "REDIS_URL", help = "Full Redis URL. Overrides host, port and password.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "REALTIME_UPSTREAM_CHANNEL", help = "Upstream Pub/Sub channel carrying log events.")]
    pub upstream_channel: Option<String>,

    #[clap(long, env = "REALTIME_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for upstream reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "REALTIME_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds for upstream reconnect attempts.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[clap(long, env = "REALTIME_CONNECT_TIMEOUT_MS", help = "Timeout in milliseconds for one upstream connect attempt.")]
    pub connect_timeout_ms: Option<u64>,

    #[clap(long, env = "REALTIME_METRICS_INTERVAL_MS", help = "Interval in milliseconds between metrics broadcasts.")]
    pub metrics_interval_ms: Option<u64>,

    #[clap(
        long,
        env = "REALTIME_NO_METRICS",
        num_args = 0..=1,
        default_missing_value = "true",
        help = "Disable the periodic metrics broadcast."
    )]
    pub no_metrics: Option<bool>,

    #[clap(long, env = "REALTIME_HISTORY_CAPACITY", help = "Number of one-second samples kept for metrics history.")]
    pub history_capacity: Option<usize>,

    #[clap(long, env = "REALTIME_RATE_WINDOW_SECS", help = "Window in seconds for the logs-per-second rate.")]
    pub rate_window_secs: Option<u64>,

    #[clap(long, env = "REALTIME_METRICS_WINDOW_SECS", help = "Window in seconds for per-minute counters.")]
    pub metrics_window_secs: Option<u64>,

    #[clap(long, env = "REALTIME_MAX_TRACKED_KEYS", help = "Maximum number of per-source counters kept.")]
    pub max_tracked_keys: Option<usize>,

    #[clap(long, env = "REALTIME_OUTBOX_CAPACITY", help = "Queued messages per subscriber before drops.")]
    pub outbox_capacity: Option<usize>,

    #[clap(long, env = "REALTIME_MAX_BATCH_SIZE", help = "Maximum events per log_batch message.")]
    pub max_batch_size: Option<usize>,
}

/// Validated runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub bridge: BridgeConfig,
    pub metrics: MetricsConfig,
    pub dispatcher: DispatcherConfig,
    /// `None` when the metrics broadcast is disabled.
    pub publisher: Option<PublisherConfig>,
}

fn non_zero<T: Default + PartialEq>(value: T, field: &'static str) -> Result<T, ConfigError> {
    if value == T::default() {
        Err(ConfigError::Zero { field })
    } else {
        Ok(value)
    }
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            redis_host: other.redis_host.or(self.redis_host),
            redis_port: other.redis_port.or(self.redis_port),
            redis_password: other.redis_password.or(self.redis_password),
            redis_url: other.redis_url.or(self.redis_url),
            upstream_channel: other.upstream_channel.or(self.upstream_channel),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            connect_timeout_ms: other.connect_timeout_ms.or(self.connect_timeout_ms),
            metrics_interval_ms: other.metrics_interval_ms.or(self.metrics_interval_ms),
            no_metrics: other.no_metrics.or(self.no_metrics),
            history_capacity: other.history_capacity.or(self.history_capacity),
            rate_window_secs: other.rate_window_secs.or(self.rate_window_secs),
            metrics_window_secs: other.metrics_window_secs.or(self.metrics_window_secs),
            max_tracked_keys: other.max_tracked_keys.or(self.max_tracked_keys),
            outbox_capacity: other.outbox_capacity.or(self.outbox_capacity),
            max_batch_size: other.max_batch_size.or(self.max_batch_size),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(8765),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            redis_host: Some("redis".to_string()),
            redis_port: Some(6379),
            upstream_channel: Some(DEFAULT_UPSTREAM_CHANNEL.to_string()),
            reconnect_base_delay_ms: Some(1000),
            reconnect_max_delay_ms: Some(30000),
            connect_timeout_ms: Some(10000),
            metrics_interval_ms: Some(1000),
            no_metrics: Some(false),
            history_capacity: Some(300),
            rate_window_secs: Some(10),
            metrics_window_secs: Some(60),
            max_tracked_keys: Some(1000),
            outbox_capacity: Some(256),
            max_batch_size: Some(100),
            ..Default::default()
        }
    }

    /// The upstream URL: `redis_url` when given, else built from host, port and password.
    pub fn upstream_url(&self) -> String {
        if let Some(url) = self.redis_url.as_ref().filter(|u| !u.is_empty()) {
            return url.clone();
        }
        let host = self.redis_host.as_deref().unwrap_or("redis");
        let port = self.redis_port.unwrap_or(6379);
        match self.redis_password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => format!("redis://:{}@{}:{}/0", password, host, port),
            None => format!("redis://{}:{}/0", host, port),
        }
    }

    /// Validates the merged values and builds the library configurations.
    pub fn resolve(&self) -> Result<Settings, ConfigError> {
        let defaults = Config::defaults();
        let merged = defaults.merge(self.clone());

        let channel = merged.upstream_channel.clone().unwrap_or_default();
        if channel.trim().is_empty() {
            return Err(ConfigError::Empty { field: "upstream_channel" });
        }

        let base_ms = non_zero(merged.reconnect_base_delay_ms.unwrap_or_default(), "reconnect_base_delay_ms")?;
        let max_ms = non_zero(merged.reconnect_max_delay_ms.unwrap_or_default(), "reconnect_max_delay_ms")?;
        if max_ms < base_ms {
            return Err(ConfigError::BackoffBounds { base_ms, max_ms });
        }
        let connect_timeout_ms = non_zero(merged.connect_timeout_ms.unwrap_or_default(), "connect_timeout_ms")?;
        let interval_ms = non_zero(merged.metrics_interval_ms.unwrap_or_default(), "metrics_interval_ms")?;
        let history_capacity = non_zero(merged.history_capacity.unwrap_or_default(), "history_capacity")?;
        let rate_window_secs = non_zero(merged.rate_window_secs.unwrap_or_default(), "rate_window_secs")?;
        let metrics_window_secs = non_zero(merged.metrics_window_secs.unwrap_or_default(), "metrics_window_secs")?;
        let max_tracked_keys = non_zero(merged.max_tracked_keys.unwrap_or_default(), "max_tracked_keys")?;
        let outbox_capacity = non_zero(merged.outbox_capacity.unwrap_or_default(), "outbox_capacity")?;
        let max_batch_size = non_zero(merged.max_batch_size.unwrap_or_default(), "max_batch_size")?;

        let redis_url = merged.upstream_url();
        if !(redis_url.starts_with("redis://") || redis_url.starts_with("rediss://") || redis_url.starts_with("unix://")) {
            return Err(ConfigError::InvalidUrl {
                url: redis_url,
                reason: "expected a redis://, rediss:// or unix:// URL".to_string(),
            });
        }

        let publisher = if merged.no_metrics.unwrap_or(false) {
            None
        } else {
            Some(PublisherConfig {
                interval: Duration::from_millis(interval_ms),
                channel: METRICS_STREAM_CHANNEL.to_string(),
            })
        };

        Ok(Settings {
            port: merged.port.unwrap_or(8765),
            log_dir: merged.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: merged.log_level.clone().unwrap_or_else(|| "info".to_string()),
            bridge: BridgeConfig {
                redis_url,
                channel,
                reconnect_base: Duration::from_millis(base_ms),
                reconnect_max: Duration::from_millis(max_ms),
                connect_timeout: Duration::from_millis(connect_timeout_ms),
                max_burst: max_batch_size,
            },
            metrics: MetricsConfig {
                rate_window: Duration::from_secs(rate_window_secs),
                metrics_window: Duration::from_secs(metrics_window_secs),
                history_capacity,
                max_tracked_keys,
                subscriber_channel: LOG_STREAM_CHANNEL.to_string(),
                ..Default::default()
            },
            dispatcher: DispatcherConfig {
                outbox_capacity,
                max_batch_size,
            },
            publisher,
        })
    }
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Layers defaults, the JSON config file and the environment/CLI values parsed into `cli`.
pub fn load_config_from(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }

    // clap already folded environment variables into the parsed values.
    current_config.merge(cli)
}

pub fn load_config() -> Config {
    load_config_from(Config::parse())
}
