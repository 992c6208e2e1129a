//! Configuration module for rlproxy.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Command-line arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "rlproxy")]
#[command(author = "rlproxy authors")]
#[command(version = "0.1.0")]
#[command(about = "A rate-limited TCP relay", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Instance name, attached to every log line
    #[arg(long)]
    pub name: Option<String>,

    /// Comma separated bind addresses (e.g., 127.0.0.1:12000,[::1]:12000)
    #[arg(short, long, value_delimiter = ',')]
    pub addrs: Vec<String>,

    /// Upstream address every client is relayed to
    #[arg(short, long)]
    pub upstream: Option<String>,

    /// Incoming traffic rate limit in bytes per second (e.g., 10MiB, 500k)
    #[arg(short, long)]
    pub rate: Option<ByteSize>,

    /// Allowed traffic burst in bytes (defaults to the rate)
    #[arg(short, long)]
    pub burst: Option<ByteSize>,

    /// Apply the rate limit to each client instead of all clients together
    #[arg(long)]
    pub per_client: bool,

    /// Disable the splice(2) zero-copy path (Linux only)
    #[arg(long)]
    pub no_splice: bool,

    /// Buffer size used to move data between clients and upstream
    #[arg(long)]
    pub buf_size: Option<ByteSize>,

    /// Upstream connect timeout in seconds (0 = no timeout)
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Console log format
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Send console logs to stderr instead of stdout
    #[arg(long)]
    pub log_stderr: bool,

    /// Disable console logging
    #[arg(long)]
    pub no_log_console: bool,

    /// Turn on debugging output (per-session lifecycle logs)
    #[arg(short, long)]
    pub debug: bool,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    /// Per-session lifecycle logs
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub limit: LimitConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and upstream configuration
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// Instance name
    pub name: Option<String>,
    /// Addresses to bind to
    #[serde(default = "default_addrs")]
    pub addrs: Vec<String>,
    /// Upstream address
    pub upstream: Option<String>,
    /// Upstream connect timeout in seconds (0 = no timeout)
    #[serde(default)]
    pub connect_timeout: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            name: None,
            addrs: default_addrs(),
            upstream: None,
            connect_timeout: 0,
        }
    }
}

/// Rate limiting configuration
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LimitConfig {
    /// Rate in bytes per second (0 = unlimited)
    #[serde(default)]
    pub rate: ByteSize,
    /// Burst in bytes (defaults to the rate)
    pub burst: Option<ByteSize>,
    /// Apply the limit per client
    #[serde(default)]
    pub per_client: bool,
}

/// Data path configuration
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TransferConfig {
    /// Copy buffer size; setting it forces the buffered path
    pub buf_size: Option<ByteSize>,
    /// Disable splice(2)
    #[serde(default)]
    pub no_splice: bool,
}

/// Throughput reporting configuration
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    /// Reporting interval in seconds (0 = disabled)
    #[serde(default = "default_telemetry_interval")]
    pub interval: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval: default_telemetry_interval(),
        }
    }
}

/// Shutdown behaviour
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShutdownConfig {
    /// Wait for in-flight sessions before exiting
    #[serde(default = "default_wait_for_sessions")]
    pub wait_for_sessions: bool,
    /// Upper bound on the session drain in seconds (0 = unbounded)
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            wait_for_sessions: default_wait_for_sessions(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Write logs to the console at all
    #[serde(default = "default_console")]
    pub console: bool,
    /// Console output format
    #[serde(default)]
    pub format: LogFormat,
    /// Send logs to stderr instead of stdout
    #[serde(default)]
    pub stderr: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            console: default_console(),
            format: LogFormat::default(),
            stderr: false,
        }
    }
}

/// Console log line format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event
    #[default]
    Json,
    /// Human-readable single line
    Full,
    /// Human-readable, multi-line
    Pretty,
}

fn default_addrs() -> Vec<String> {
    vec!["127.0.0.1:12000".to_string()]
}

fn default_telemetry_interval() -> u64 {
    1
}

fn default_wait_for_sessions() -> bool {
    true
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_console() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub name: Option<String>,
    pub addrs: Vec<String>,
    pub upstream: String,
    pub connect_timeout: Option<Duration>,
    /// Bytes per second, 0 = unlimited
    pub rate: u64,
    pub burst: u64,
    pub per_client: bool,
    pub buf_size: Option<usize>,
    pub splice: bool,
    pub telemetry_interval: Option<Duration>,
    pub wait_for_sessions: bool,
    pub drain_timeout: Option<Duration>,
    pub log_level: String,
    pub log_console: bool,
    pub log_format: LogFormat,
    pub log_stderr: bool,
    pub debug: bool,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve parsed CLI arguments, reading the TOML file they point at.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let TomlConfig {
            debug,
            proxy,
            limit,
            transfer,
            telemetry,
            shutdown,
            logging,
        } = toml_config;

        let addrs = if cli.addrs.is_empty() {
            proxy.addrs
        } else {
            cli.addrs
        };
        let addrs: Vec<String> = addrs
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        if addrs.is_empty() {
            return Err(ConfigError::NoBindAddress);
        }

        let upstream = cli
            .upstream
            .or(proxy.upstream)
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::MissingUpstream)?;

        let rate = cli.rate.unwrap_or(limit.rate).as_u64();
        let burst = match cli.burst.or(limit.burst).map(ByteSize::as_u64) {
            Some(b) if b > 0 => b,
            _ => rate,
        };

        let buf_size = match cli.buf_size.or(transfer.buf_size) {
            Some(ByteSize(0)) => return Err(ConfigError::InvalidBufferSize),
            Some(size) => Some(
                usize::try_from(size.as_u64()).map_err(|_| ConfigError::InvalidBufferSize)?,
            ),
            None => None,
        };

        let connect_timeout = cli.connect_timeout.unwrap_or(proxy.connect_timeout);

        let debug = cli.debug || debug;
        let log_level = if debug {
            "debug".to_string()
        } else if cli.log_level != "info" {
            cli.log_level
        } else {
            logging.level
        };

        Ok(Config {
            name: cli.name.or(proxy.name),
            addrs,
            upstream,
            connect_timeout: (connect_timeout > 0).then(|| Duration::from_secs(connect_timeout)),
            rate,
            burst,
            per_client: cli.per_client || limit.per_client,
            buf_size,
            splice: !(cli.no_splice || transfer.no_splice),
            telemetry_interval: (telemetry.interval > 0)
                .then(|| Duration::from_secs(telemetry.interval)),
            wait_for_sessions: shutdown.wait_for_sessions,
            drain_timeout: (shutdown.drain_timeout > 0)
                .then(|| Duration::from_secs(shutdown.drain_timeout)),
            log_level,
            log_console: logging.console && !cli.no_log_console,
            log_format: cli.log_format.unwrap_or(logging.format),
            log_stderr: cli.log_stderr || logging.stderr,
            debug,
        })
    }
}

/// A byte count that can be written with a human-readable suffix.
///
/// Accepts plain integers and strings such as `"512"`, `"10k"`, `"1.5MB"`,
/// `"64 KiB"` or `"1Gi"`. SI suffixes are powers of 1000, IEC suffixes
/// (with an `i`) powers of 1024. Case is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = ByteSizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, unit) = s.split_at(split);
        if number.is_empty() {
            return Err(ByteSizeError::new(s));
        }

        let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
            "" | "b" => 1,
            "k" | "kb" => 1_000,
            "ki" | "kib" => 1 << 10,
            "m" | "mb" => 1_000_000,
            "mi" | "mib" => 1 << 20,
            "g" | "gb" => 1_000_000_000,
            "gi" | "gib" => 1 << 30,
            "t" | "tb" => 1_000_000_000_000,
            "ti" | "tib" => 1 << 40,
            _ => return Err(ByteSizeError::new(s)),
        };

        if let Ok(n) = number.parse::<u64>() {
            return n
                .checked_mul(multiplier)
                .map(ByteSize)
                .ok_or_else(|| ByteSizeError::new(s));
        }

        let n: f64 = number.parse().map_err(|_| ByteSizeError::new(s))?;
        let bytes = n * multiplier as f64;
        if !bytes.is_finite() || bytes >= u64::MAX as f64 {
            return Err(ByteSizeError::new(s));
        }
        Ok(ByteSize(bytes as u64))
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ByteSizeVisitor;

        impl<'de> Visitor<'de> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte count such as 1048576 or \"1MiB\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ByteSize, E> {
                Ok(ByteSize(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ByteSize, E> {
                u64::try_from(v)
                    .map(ByteSize)
                    .map_err(|_| E::custom(format!("negative byte count {v}")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ByteSize, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

/// Invalid human-readable byte count
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteSizeError {
    input: String,
}

impl ByteSizeError {
    fn new(input: &str) -> Self {
        Self {
            input: input.to_string(),
        }
    }
}

impl fmt::Display for ByteSizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid byte size '{}'", self.input)
    }
}

impl std::error::Error for ByteSizeError {}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    MissingUpstream,
    NoBindAddress,
    InvalidBufferSize,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::MissingUpstream => write!(f, "No upstream address configured"),
            ConfigError::NoBindAddress => write!(f, "No bind address configured"),
            ConfigError::InvalidBufferSize => write!(f, "Buffer size must be greater than zero"),
        }
    }
}

impl std::error::Error for ConfigError {}
