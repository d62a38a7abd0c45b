use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use thiserror::Error;
use tracing::Level;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(default = "9890")]
    pub port: u16,

    #[envconfig(default = "0.0.0.0")]
    pub bind: String,

    #[envconfig(default = "0")]
    pub min_threads: usize,

    #[envconfig(default = "4")]
    pub max_threads: usize,

    #[envconfig(default = "false")]
    pub use_ssl: bool,

    pub ssl_keys: Option<SslKeys>, // "<key path>,<cert path>"

    pub backlog: Option<u32>,

    #[envconfig(default = "33554432")] // 32MiB
    pub max_body_size: usize,

    #[envconfig(default = "default")]
    pub format: Format,

    #[envconfig(nested = true)]
    pub parser: ParserConfig,

    // Grace period for in-flight requests on shutdown
    #[envconfig(default = "30000")]
    pub shutdown_timeout: EnvMsDuration,

    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    // Used for integration tests
    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    #[envconfig(default = "info")]
    pub log_level: Level,

    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "http-input")]
    pub otel_service_name: String,
}

impl Config {
    /// Checks everything that must abort startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.use_ssl && self.ssl_keys.is_none() {
            return Err(ConfigError::MissingSslKeys);
        }
        if self.max_threads == 0 || self.min_threads > self.max_threads {
            return Err(ConfigError::InvalidThreads {
                min: self.min_threads,
                max: self.max_threads,
            });
        }
        self.address()?;
        Ok(())
    }

    pub fn address(&self) -> Result<SocketAddr, ConfigError> {
        let ip = IpAddr::from_str(self.bind.trim())
            .map_err(|_| ConfigError::InvalidBind(self.bind.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

#[derive(Envconfig, Clone, Debug, Default)]
pub struct ParserConfig {
    pub keys: Option<String>, // Comma-delimited, for csv and tsv

    pub types: Option<String>, // "<field>:<type>,..."

    #[envconfig(default = "time")]
    pub time_key: String,

    pub time_format: Option<String>,

    pub delimiter: Option<String>,

    #[envconfig(default = ":")]
    pub label_delimiter: String,

    #[envconfig(default = "message")]
    pub message_key: String,
}

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic
    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes
    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds
    #[envconfig(default = "1000000")]
    pub kafka_producer_message_max_bytes: u32,
    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
    #[envconfig(default = "events")]
    pub kafka_topic: String,
    #[envconfig(default = "false")]
    pub kafka_tls: bool,
}

/// How request bodies are decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Format {
    /// Driven by the request content type
    Default,
    /// `/pattern/`, named groups become fields
    Regexp(String),
    Json,
    Csv,
    Tsv,
    Ltsv,
    None,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() >= 2 && s.starts_with('/') && s.ends_with('/') {
            return Ok(Format::Regexp(s[1..s.len() - 1].to_string()));
        }
        match s.to_lowercase().as_ref() {
            "default" => Ok(Format::Default),
            "json" => Ok(Format::Json),
            "csv" => Ok(Format::Csv),
            "tsv" => Ok(Format::Tsv),
            "ltsv" => Ok(Format::Ltsv),
            "none" => Ok(Format::None),
            _ => Err(format!("Unknown format: {s}")),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Default => write!(f, "default"),
            Format::Regexp(pattern) => write!(f, "/{pattern}/"),
            Format::Json => write!(f, "json"),
            Format::Csv => write!(f, "csv"),
            Format::Tsv => write!(f, "tsv"),
            Format::Ltsv => write!(f, "ltsv"),
            Format::None => write!(f, "none"),
        }
    }
}

/// PEM private key and certificate, in that order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslKeys {
    pub key: PathBuf,
    pub cert: PathBuf,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseSslKeysError;

impl FromStr for SslKeys {
    type Err = ParseSslKeysError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        match parts.as_slice() {
            [key, cert] if !key.is_empty() && !cert.is_empty() => Ok(SslKeys {
                key: PathBuf::from(key),
                cert: PathBuf::from(cert),
            }),
            _ => Err(ParseSslKeysError),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("ssl_keys parameter is required when use_ssl is true")]
    MissingSslKeys,
    #[error("invalid thread counts: min_threads={min}, max_threads={max}")]
    InvalidThreads { min: usize, max: usize },
    #[error("bind is not an IP address: {0}")]
    InvalidBind(String),
    #[error("invalid regexp format: {0}")]
    InvalidRegexp(#[from] regex::Error),
    #[error("regexp format has no named capture group")]
    RegexpWithoutNames,
    #[error("keys parameter is required for the {0} format")]
    MissingKeys(String),
    #[error("invalid types parameter: {0}")]
    InvalidTypes(String),
}
