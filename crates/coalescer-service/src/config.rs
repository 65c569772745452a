use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "coalescer".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Tuning of the [`Coalescer`](crate::Coalescer).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CoalescerConfig {
    /// The maximum number of requests dispatched in one batch.
    pub max_batch_size: usize,
    /// How long the first request of a batch waits for others to join.
    ///
    /// A window of `0` dispatches every request on its own.
    #[serde(with = "humantime_serde")]
    pub batch_window: Duration,
    /// How long an in-flight request accepts identical requests as followers.
    #[serde(with = "humantime_serde")]
    pub deduplication_window: Duration,
    /// The timeout of a single attempt, unless the request overrides it.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// The number of retries after the first attempt, unless the request overrides it.
    pub default_retries: u32,
    /// The backoff before the first retry, doubling for each further retry.
    #[serde(with = "humantime_serde")]
    pub retry_base_delay: Duration,
    /// The upper bound of the backoff.
    #[serde(with = "humantime_serde")]
    pub retry_max_delay: Duration,
    pub enable_cache: bool,
    /// How long successful responses are served from the cache.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    pub max_cache_entries: usize,
    /// Whether requests are held back while offline. Otherwise, they are executed regardless.
    pub enable_offline_queue: bool,
    pub max_offline_queue_size: usize,
    /// The number of finished requests whose final status can still be queried.
    pub request_history_size: usize,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            batch_window: Duration::from_millis(50),
            deduplication_window: Duration::from_secs(1),
            default_timeout: Duration::from_secs(30),
            default_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            enable_cache: true,
            cache_ttl: Duration::from_secs(60),
            max_cache_entries: 100,
            enable_offline_queue: true,
            max_offline_queue_size: 50,
            request_history_size: 100,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tuning of the coalescer itself.
    pub coalescer: CoalescerConfig,

    /// Controls the logging system.
    pub logging: Logging,

    /// Controls the metrics system.
    pub metrics: Metrics,
}

impl Config {
    /// Loads the config from the given YAML file, or returns the default config without a path.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(E::invalid_value(de::Unexpected::Str(v), &self)),
        }
    }
}

fn deserialize_level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_str(LevelFilterVisitor)
}
