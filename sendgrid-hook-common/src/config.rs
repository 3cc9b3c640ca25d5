use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

/// Configuration consumed by the `Ingestor`.
#[derive(Envconfig, Clone, Debug)]
pub struct IngestConfig {
    #[envconfig(from = "LOG_MALFORMED_PAYLOAD", default = "true")]
    pub log_malformed_payload: bool,

    #[envconfig(from = "LOG_MALFORMED_PAYLOAD_LEVEL", default = "warning")]
    pub log_malformed_payload_level: LogLevel,

    #[envconfig(from = "LOG_DUPLICATE_EVENTS", default = "false")]
    pub log_duplicate_events: bool,

    #[envconfig(from = "LOG_DUPLICATE_EVENTS_LEVEL", default = "info")]
    pub log_duplicate_events_level: LogLevel,

    #[envconfig(from = "MAX_TRANSACTION_ATTEMPTS", default = "3")]
    pub max_transaction_attempts: u32,

    #[envconfig(from = "TRANSACTION_RETRY_INTERVAL", default = "0")]
    pub transaction_retry_interval: EnvMsDuration,

    #[envconfig(from = "TRANSACTION_RETRY_BACKOFF_COEFFICIENT", default = "1")]
    pub transaction_retry_backoff_coefficient: u32,

    #[envconfig(from = "TRANSACTION_RETRY_MAXIMUM_INTERVAL")]
    pub transaction_retry_maximum_interval: Option<EnvMsDuration>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            log_malformed_payload: true,
            log_malformed_payload_level: LogLevel::Warning,
            log_duplicate_events: false,
            log_duplicate_events_level: LogLevel::Info,
            max_transaction_attempts: 3,
            transaction_retry_interval: EnvMsDuration(time::Duration::ZERO),
            transaction_retry_backoff_coefficient: 1,
            transaction_retry_maximum_interval: None,
        }
    }
}

/// Severity for the configurable diagnostics.
/// Accepts the PSR-3 vocabulary most SendGrid integrations are configured with, collapsed onto
/// the levels `tracing` supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Emergency,
    Alert,
    Critical,
    Error,
    Warning,
    Notice,
    Info,
    Debug,
    Trace,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseLogLevelError(pub String);

impl FromStr for LogLevel {
    type Err = ParseLogLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "emergency" => Ok(LogLevel::Emergency),
            "alert" => Ok(LogLevel::Alert),
            "critical" => Ok(LogLevel::Critical),
            "error" => Ok(LogLevel::Error),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "notice" => Ok(LogLevel::Notice),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(ParseLogLevelError(s.to_owned())),
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
