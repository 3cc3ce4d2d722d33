use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::transport::Destination;

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 50;
pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Compression {
    Gzip,
    None,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("EVENT_RELAY_ENDPOINT is not a valid URL: {0}")]
    EndpointInvalidUrl(String),

    #[error("{0} has invalid value: {1}")]
    InvalidNumeric(String, String),

    #[error("{0} must be greater than zero")]
    Zero(String),

    #[error("batch size {batch_size} exceeds max queue size {capacity}")]
    BatchExceedsCapacity { batch_size: usize, capacity: usize },

    #[error("EVENT_RELAY_COMPRESSION has invalid value: {0} (expected \"gzip\" or \"none\")")]
    InvalidCompression(String),
}

/// Queue sizing: capacity `C` and batch threshold `B`, with `0 < B <= C`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    capacity: usize,
    batch_size: usize,
}

impl BufferConfig {
    pub fn new(capacity: usize, batch_size: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::Zero("EVENT_RELAY_MAX_QUEUE_SIZE".into()));
        }
        if batch_size == 0 {
            return Err(ConfigError::Zero("EVENT_RELAY_BATCH_SIZE".into()));
        }
        if batch_size > capacity {
            return Err(ConfigError::BatchExceedsCapacity {
                batch_size,
                capacity,
            });
        }
        Ok(Self {
            capacity,
            batch_size,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_MAX_QUEUE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug)]
pub struct Config {
    /// `None` until an endpoint is set; flushes are skipped meanwhile.
    pub destination: Option<Destination>,
    pub buffer: BufferConfig,
    pub export_timeout: Duration,
    pub compression: Compression,
    pub flush_interval: Option<Duration>,
    pub user_id: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = env::vars()
            .filter(|(k, _)| k.starts_with("EVENT_RELAY_"))
            .collect();
        Self::parse(&vars)
    }

    fn parse(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let destination = parse_destination(vars)?;
        let capacity = parse_usize(vars, "EVENT_RELAY_MAX_QUEUE_SIZE", DEFAULT_MAX_QUEUE_SIZE)?;
        let batch_size = parse_usize(vars, "EVENT_RELAY_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        let buffer = BufferConfig::new(capacity, batch_size)?;
        let export_timeout = parse_duration_ms(vars, "EVENT_RELAY_EXPORT_TIMEOUT_MS", 5000)?;
        let compression = parse_compression(vars)?;
        let flush_interval = parse_duration_ms(vars, "EVENT_RELAY_FLUSH_INTERVAL_MS", 0)?;
        let user_id = non_empty(vars, "EVENT_RELAY_USER_ID").map(str::to_owned);

        Ok(Self {
            destination,
            buffer,
            export_timeout,
            compression,
            flush_interval: (!flush_interval.is_zero()).then_some(flush_interval),
            user_id,
        })
    }
}

fn non_empty<'a>(vars: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    vars.get(name).map(String::as_str).filter(|s| !s.is_empty())
}

fn parse_destination(vars: &HashMap<String, String>) -> Result<Option<Destination>, ConfigError> {
    let Some(raw) = non_empty(vars, "EVENT_RELAY_ENDPOINT") else {
        return Ok(None);
    };
    let endpoint = parse_endpoint(raw)?;
    let credential = non_empty(vars, "EVENT_RELAY_API_KEY").map(str::to_owned);
    Ok(Some(Destination::new(endpoint, credential)))
}

pub(crate) fn parse_endpoint(raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|_| ConfigError::EndpointInvalidUrl(raw.to_owned()))
}

fn parse_usize(
    vars: &HashMap<String, String>,
    name: &str,
    default: usize,
) -> Result<usize, ConfigError> {
    match vars.get(name) {
        Some(val) => val
            .parse()
            .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone())),
        None => Ok(default),
    }
}

fn parse_duration_ms(
    vars: &HashMap<String, String>,
    name: &str,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    match vars.get(name) {
        Some(val) => {
            let ms: u64 = val
                .parse()
                .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone()))?;
            Ok(Duration::from_millis(ms))
        }
        None => Ok(Duration::from_millis(default_ms)),
    }
}

fn parse_compression(vars: &HashMap<String, String>) -> Result<Compression, ConfigError> {
    match vars.get("EVENT_RELAY_COMPRESSION").map(|s| s.as_str()) {
        Some("none") | Some("") | None => Ok(Compression::None),
        Some("gzip") => Ok(Compression::Gzip),
        Some(other) => Err(ConfigError::InvalidCompression(other.to_owned())),
    }
}
