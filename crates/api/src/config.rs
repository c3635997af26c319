//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use domain::{DomainError, ValidationLimits};
use rust_decimal::Decimal;
use saga::{RetryPolicy, SagaConfig};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Rejected configuration. The process refuses to start on any of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} has an unparsable value {value:?}")]
    Unparsable { var: &'static str, value: String },

    #[error("{var} is out of range: {reason}")]
    OutOfRange { var: &'static str, reason: String },

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("RUST_LOG is not a valid filter: {0}")]
    LogLevel(String),

    #[error("LOG_FORMAT must be json or pretty, got {0:?}")]
    LogFormat(String),

    #[error(transparent)]
    Limits(#[from] DomainError),
}

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            _ => Err(ConfigError::LogFormat(s.to_string())),
        }
    }
}

/// Server and saga configuration with defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `json` or `pretty` (default `pretty`)
/// - `DATABASE_URL`: PostgreSQL saga log; in-memory when unset
/// - `FUNDS_SERVICE_URL`, `MATCHING_SERVICE_URL`: downstream base URLs
/// - `MIN_STAKE`, `MAX_STAKE`, `MIN_ODDS`, `MAX_ODDS`: validation limits
/// - `CALL_TIMEOUT_MS`: bound on one downstream attempt (default 10000)
/// - `RETRY_INITIAL_INTERVAL_MS`, `RETRY_BACKOFF_COEFFICIENT`,
///   `RETRY_MAX_INTERVAL_MS`, `RETRY_MAX_ATTEMPTS`: forward retry policy
/// - `MAX_CONCURRENT_SAGAS`: worker pool size (default 10)
/// - `SHUTDOWN_TIMEOUT_SECS`: how long shutdown waits for sagas (default 30)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub funds_service_url: String,
    pub matching_service_url: String,
    pub min_stake: Decimal,
    pub max_stake: Decimal,
    pub min_odds: Decimal,
    pub max_odds: Decimal,
    pub call_timeout: Duration,
    pub forward_retry: RetryPolicy,
    pub max_concurrent_sagas: usize,
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let limits = ValidationLimits::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            funds_service_url: "http://localhost:8081".to_string(),
            matching_service_url: "http://localhost:8082".to_string(),
            min_stake: limits.min_stake(),
            max_stake: limits.max_stake(),
            min_odds: limits.min_odds(),
            max_odds: limits.max_odds(),
            call_timeout: Duration::from_secs(10),
            forward_retry: RetryPolicy::forward(),
            max_concurrent_sagas: 10,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Loads configuration from environment variables, falling back to
    /// defaults for anything unset. Values that do not parse are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`Config::from_env`], reading variables through `lookup`.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let vars = Vars(lookup);

        Ok(Self {
            host: vars.string("HOST").unwrap_or(defaults.host),
            port: vars.parse("PORT")?.unwrap_or(defaults.port),
            log_level: vars.string("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match vars.string("LOG_FORMAT") {
                Some(format) => format.parse()?,
                None => defaults.log_format,
            },
            database_url: vars.string("DATABASE_URL").filter(|url| !url.is_empty()),
            funds_service_url: vars
                .string("FUNDS_SERVICE_URL")
                .unwrap_or(defaults.funds_service_url),
            matching_service_url: vars
                .string("MATCHING_SERVICE_URL")
                .unwrap_or(defaults.matching_service_url),
            min_stake: vars.parse("MIN_STAKE")?.unwrap_or(defaults.min_stake),
            max_stake: vars.parse("MAX_STAKE")?.unwrap_or(defaults.max_stake),
            min_odds: vars.parse("MIN_ODDS")?.unwrap_or(defaults.min_odds),
            max_odds: vars.parse("MAX_ODDS")?.unwrap_or(defaults.max_odds),
            call_timeout: vars
                .millis("CALL_TIMEOUT_MS")?
                .unwrap_or(defaults.call_timeout),
            forward_retry: RetryPolicy {
                initial_interval: vars
                    .millis("RETRY_INITIAL_INTERVAL_MS")?
                    .unwrap_or(defaults.forward_retry.initial_interval),
                backoff_coefficient: vars
                    .parse("RETRY_BACKOFF_COEFFICIENT")?
                    .unwrap_or(defaults.forward_retry.backoff_coefficient),
                max_interval: vars
                    .millis("RETRY_MAX_INTERVAL_MS")?
                    .unwrap_or(defaults.forward_retry.max_interval),
                max_attempts: vars
                    .parse("RETRY_MAX_ATTEMPTS")?
                    .unwrap_or(defaults.forward_retry.max_attempts),
            },
            max_concurrent_sagas: vars
                .parse("MAX_CONCURRENT_SAGAS")?
                .unwrap_or(defaults.max_concurrent_sagas),
            shutdown_timeout: vars
                .parse("SHUTDOWN_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
        })
    }

    /// Checks ranges and required values. Run once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(out_of_range("PORT", "must be between 1 and 65535"));
        }
        if self.funds_service_url.trim().is_empty() {
            return Err(ConfigError::Empty("FUNDS_SERVICE_URL"));
        }
        if self.matching_service_url.trim().is_empty() {
            return Err(ConfigError::Empty("MATCHING_SERVICE_URL"));
        }
        self.limits()?;
        if self.call_timeout.is_zero() {
            return Err(out_of_range("CALL_TIMEOUT_MS", "must be positive"));
        }
        if self.forward_retry.max_attempts == 0 {
            return Err(out_of_range("RETRY_MAX_ATTEMPTS", "must be at least 1"));
        }
        let coefficient = self.forward_retry.backoff_coefficient;
        if coefficient.is_nan() || coefficient < 1.0 {
            return Err(out_of_range(
                "RETRY_BACKOFF_COEFFICIENT",
                "must be at least 1.0",
            ));
        }
        if self.forward_retry.max_interval < self.forward_retry.initial_interval {
            return Err(out_of_range(
                "RETRY_MAX_INTERVAL_MS",
                "must not be below RETRY_INITIAL_INTERVAL_MS",
            ));
        }
        if self.max_concurrent_sagas == 0 {
            return Err(out_of_range("MAX_CONCURRENT_SAGAS", "must be at least 1"));
        }
        EnvFilter::try_new(&self.log_level)
            .map_err(|e| ConfigError::LogLevel(format!("{}: {e}", self.log_level)))?;
        Ok(())
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn limits(&self) -> Result<ValidationLimits, ConfigError> {
        Ok(ValidationLimits::new(
            self.min_stake,
            self.max_stake,
            self.min_odds,
            self.max_odds,
        )?)
    }

    /// Settings handed to the saga engine.
    pub fn saga_config(&self) -> Result<SagaConfig, ConfigError> {
        Ok(SagaConfig {
            limits: self.limits()?,
            call_timeout: self.call_timeout,
            forward_retry: self.forward_retry.clone(),
            compensation_retry: RetryPolicy::compensation(),
            max_concurrent_sagas: self.max_concurrent_sagas,
        })
    }
}

fn out_of_range(var: &'static str, reason: &str) -> ConfigError {
    ConfigError::OutOfRange {
        var,
        reason: reason.to_string(),
    }
}

struct Vars<L>(L);

impl<L> Vars<L>
where
    L: Fn(&str) -> Option<String>,
{
    fn string(&self, var: &str) -> Option<String> {
        (self.0)(var)
    }

    fn parse<T: FromStr>(&self, var: &'static str) -> Result<Option<T>, ConfigError> {
        match self.string(var) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::Unparsable { var, value }),
        }
    }

    fn millis(&self, var: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(var)?.map(Duration::from_millis))
    }
}
