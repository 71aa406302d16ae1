//! Configuration module

use crate::error::{Result, StreamError};
use crate::pool::DEFAULT_MAX_WORKERS;
use crate::reader::{ReaderOptions, DEFAULT_READER_BLOCK_SIZE, DEFAULT_READER_MAX_BUFFER_SIZE};
use crate::retry::{RetryPolicy, DEFAULT_MAX_RETRY_TIMES};
use crate::seekable::SeekableWriterOptions;
use crate::writer::{
    BlockSizePolicy, WriterOptions, DEFAULT_WRITER_BLOCK_SIZE, DEFAULT_WRITER_MAX_BUFFER_SIZE,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Prefix of every environment variable read by [`StreamConfig::from_env`]
pub const ENV_PREFIX: &str = "FLUX_STREAM_";

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Worker threads shared by all streams
    pub max_workers: usize,
    /// Attempts per backend call, first one included
    pub max_retry_times: u32,
    /// Base of the retry backoff in milliseconds
    pub retry_base_delay_ms: u64,
    /// Cap of a single retry backoff in milliseconds
    pub retry_max_delay_ms: u64,
    /// Read path settings
    pub reader: ReaderConfig,
    /// Write path settings
    pub writer: WriterConfig,
}

/// Read path configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Size of each ranged fetch
    #[serde(deserialize_with = "deserialize_quantity")]
    pub block_size: u64,
    /// Cache budget in bytes (0 disables caching)
    #[serde(deserialize_with = "deserialize_quantity")]
    pub max_buffer_size: u64,
    /// Fixed number of blocks to prefetch (adaptive when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_forward: Option<usize>,
}

/// Write path configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Part size; autoscale starts from the default when unset
    #[serde(
        deserialize_with = "deserialize_optional_quantity",
        skip_serializing_if = "Option::is_none"
    )]
    pub block_size: Option<u64>,
    /// Bound on buffered plus in-flight bytes
    #[serde(deserialize_with = "deserialize_quantity")]
    pub max_buffer_size: u64,
    /// Grow the part size as the object grows (default: only when `block_size` is unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_autoscale: Option<bool>,
    /// Largest part size autoscale may reach (default: `max_buffer_size`)
    #[serde(
        deserialize_with = "deserialize_optional_quantity",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_block_size: Option<u64>,
    /// Rewritable head of a seekable writer (default: the first part size)
    #[serde(
        deserialize_with = "deserialize_optional_quantity",
        skip_serializing_if = "Option::is_none"
    )]
    pub head_block_size: Option<u64>,
    /// Rewritable tail of a seekable writer (default: the first part size)
    #[serde(
        deserialize_with = "deserialize_optional_quantity",
        skip_serializing_if = "Option::is_none"
    )]
    pub tail_block_size: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            max_retry_times: DEFAULT_MAX_RETRY_TIMES,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 30_000,
            reader: ReaderConfig::default(),
            writer: WriterConfig::default(),
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_READER_BLOCK_SIZE,
            max_buffer_size: DEFAULT_READER_MAX_BUFFER_SIZE,
            block_forward: None,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            block_size: None,
            max_buffer_size: DEFAULT_WRITER_MAX_BUFFER_SIZE,
            block_autoscale: None,
            max_block_size: None,
            head_block_size: None,
            tail_block_size: None,
        }
    }
}

/// A size given either as a byte count or as a quantity string
#[derive(Deserialize)]
#[serde(untagged)]
enum QuantityConfig {
    Bytes(u64),
    Text(String),
}

impl QuantityConfig {
    fn into_bytes(self) -> Result<u64> {
        match self {
            Self::Bytes(bytes) => Ok(bytes),
            Self::Text(text) => parse_quantity(&text),
        }
    }
}

fn deserialize_quantity<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    QuantityConfig::deserialize(deserializer)?
        .into_bytes()
        .map_err(|e| D::Error::custom(format!("Failed to parse size: {}", e)))
}

fn deserialize_optional_quantity<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    Option::<QuantityConfig>::deserialize(deserializer)?
        .map(QuantityConfig::into_bytes)
        .transpose()
        .map_err(|e| D::Error::custom(format!("Failed to parse size: {}", e)))
}

/// Parse a Kubernetes-style quantity like "8Mi" or "200M" to bytes
///
/// Binary suffixes are `Ki`, `Mi`, `Gi`, `Ti`, `Pi`, `Ei`; decimal ones are
/// `k`, `M`, `G`, `T`, `P`, `E`. Suffixes are case sensitive.
pub fn parse_quantity(quantity: &str) -> Result<u64> {
    let quantity = quantity.trim();

    if let Ok(bytes) = quantity.parse::<u64>() {
        return Ok(bytes);
    }

    let split_pos = quantity
        .chars()
        .position(|c| !c.is_ascii_digit() && c != '.')
        .unwrap_or(quantity.len());

    if split_pos == 0 {
        return Err(StreamError::InvalidConfig(format!(
            "Invalid quantity: {}",
            quantity
        )));
    }

    let (number_part, unit_part) = quantity.split_at(split_pos);
    let number: f64 = number_part.parse().map_err(|_| {
        StreamError::InvalidConfig(format!("Invalid number in quantity: {}", quantity))
    })?;

    let multiplier: u64 = match unit_part {
        "" => 1,
        "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        _ => {
            return Err(StreamError::InvalidConfig(format!(
                "Unknown quantity suffix: {}",
                unit_part
            )))
        }
    };

    Ok((number * multiplier as f64) as u64)
}

impl StreamConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config: StreamConfig = toml::from_str(&contents)
            .map_err(|e| StreamError::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| StreamError::InvalidConfig(format!("Failed to serialize config: {}", e)))?;
        fs::write(path.as_ref(), contents)?;
        Ok(())
    }

    /// Defaults overridden by `FLUX_STREAM_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable name
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let number = |name: &str| -> Result<Option<u64>> {
            var(name)
                .map(|value| {
                    value.parse::<u64>().map_err(|_| {
                        StreamError::InvalidConfig(format!(
                            "{}{} must be an integer, got {}",
                            ENV_PREFIX, name, value
                        ))
                    })
                })
                .transpose()
        };
        let quantity = |name: &str| -> Result<Option<u64>> {
            var(name).map(|value| parse_quantity(&value)).transpose()
        };

        let mut config = Self::default();
        if let Some(size) = quantity("READER_BLOCK_SIZE")? {
            config.reader.block_size = size;
        }
        if let Some(size) = quantity("READER_MAX_BUFFER_SIZE")? {
            config.reader.max_buffer_size = size;
        }
        if let Some(forward) = number("READER_BLOCK_FORWARD")? {
            config.reader.block_forward = Some(forward as usize);
        }
        if let Some(size) = quantity("WRITER_BLOCK_SIZE")? {
            config.writer.block_size = Some(size);
        }
        if let Some(size) = quantity("WRITER_MAX_BUFFER_SIZE")? {
            config.writer.max_buffer_size = size;
        }
        if let Some(size) = quantity("WRITER_MAX_BLOCK_SIZE")? {
            config.writer.max_block_size = Some(size);
        }
        if let Some(size) = quantity("WRITER_HEAD_BLOCK_SIZE")? {
            config.writer.head_block_size = Some(size);
        }
        if let Some(size) = quantity("WRITER_TAIL_BLOCK_SIZE")? {
            config.writer.tail_block_size = Some(size);
        }
        if let Some(flag) = var("WRITER_BLOCK_AUTOSCALE") {
            config.writer.block_autoscale = Some(parse_flag(&flag).ok_or_else(|| {
                StreamError::InvalidConfig(format!(
                    "{}WRITER_BLOCK_AUTOSCALE must be a boolean, got {}",
                    ENV_PREFIX, flag
                ))
            })?);
        }
        if let Some(workers) = number("MAX_WORKERS")? {
            config.max_workers = workers as usize;
        }
        if let Some(times) = number("MAX_RETRY_TIMES")? {
            config.max_retry_times = times as u32;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings no stream can run with
    pub fn validate(&self) -> Result<()> {
        if self.reader.block_size == 0 {
            return Err(StreamError::InvalidConfig(
                "reader.block_size must be greater than 0".to_string(),
            ));
        }
        if self.writer.block_size == Some(0) {
            return Err(StreamError::InvalidConfig(
                "writer.block_size must be greater than 0".to_string(),
            ));
        }
        if self.writer.head_block_size == Some(0) {
            return Err(StreamError::InvalidConfig(
                "writer.head_block_size must be greater than 0".to_string(),
            ));
        }
        if self.max_workers == 0 {
            return Err(StreamError::InvalidConfig(
                "max_workers must be greater than 0".to_string(),
            ));
        }
        if self.max_retry_times == 0 {
            return Err(StreamError::InvalidConfig(
                "max_retry_times must be at least 1".to_string(),
            ));
        }
        if let Some(forward) = self.reader.block_forward {
            let capacity = (self.reader.max_buffer_size / self.reader.block_size).max(1);
            if self.reader.max_buffer_size > 0 && forward as u64 >= capacity {
                return Err(StreamError::InvalidConfig(format!(
                    "reader.block_forward ({}) must be smaller than max_buffer_size / block_size ({})",
                    forward, capacity
                )));
            }
        }
        Ok(())
    }

    /// Retry policy for every backend call
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_times.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    /// Options for a new reader
    pub fn reader_options(&self) -> ReaderOptions {
        ReaderOptions {
            block_size: self.reader.block_size,
            max_buffer_size: self.reader.max_buffer_size,
            block_forward: self.reader.block_forward,
            retry: self.retry_policy(),
        }
    }

    /// Options for a new writer
    pub fn writer_options(&self) -> WriterOptions {
        let writer = &self.writer;
        let base = writer.block_size.unwrap_or(DEFAULT_WRITER_BLOCK_SIZE);
        let autoscale = writer.block_autoscale.unwrap_or(writer.block_size.is_none());

        let block_size = if autoscale {
            let max = writer.max_block_size.unwrap_or(writer.max_buffer_size);
            BlockSizePolicy::autoscale(base, max)
        } else {
            BlockSizePolicy::Fixed(base)
        };

        WriterOptions {
            block_size,
            max_buffer_size: writer.max_buffer_size,
            retry: self.retry_policy(),
        }
    }

    /// Options for a new seekable writer
    pub fn seekable_writer_options(&self) -> SeekableWriterOptions {
        SeekableWriterOptions {
            writer: self.writer_options(),
            head_block_size: self.writer.head_block_size,
            tail_block_size: self.writer.tail_block_size,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
