//! Service configuration, read from the environment.

use crate::coordinator::{ConfirmationMode, DEFAULT_TIMEOUT};
use crate::error::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const ENV_PORT: &str = "KONNECT_PORT";
pub const ENV_BIND: &str = "KONNECT_BIND";
pub const ENV_TIMEOUT: &str = "TIMEOUT";
pub const ENV_KUBE_CREDENTIALS: &str = "KUBE_CREDENTIALS";
pub const ENV_CONFIRMATION_MODE: &str = "CONFIRMATION_MODE";
pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";

pub const DEFAULT_PORT: u16 = 5050;

/// Upper bound for the request deadline
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Where Kubernetes credentials come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CredentialSource {
    /// Local kubeconfig if present, otherwise the in-cluster service account
    #[default]
    Auto,
    InCluster,
    Kubeconfig,
}

impl FromStr for CredentialSource {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(CredentialSource::Auto),
            "in-cluster" | "incluster" => Ok(CredentialSource::InCluster),
            "kubeconfig" => Ok(CredentialSource::Kubeconfig),
            other => Err(Error::Config(format!(
                "unknown credential source '{other}', expected auto, in-cluster or kubeconfig"
            ))),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" | "" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(Error::Config(format!("unknown log format '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: IpAddr,
    pub port: u16,
    /// Deadline for one annotate request
    pub timeout: Duration,
    pub credentials: CredentialSource,
    pub confirmation_mode: ConfirmationMode,
    pub log_format: LogFormat,
    /// Environment values that could not be parsed and were replaced
    pub fallbacks: Vec<ConfigFallback>,
}

/// An environment value replaced by its default
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFallback {
    pub key: &'static str,
    pub value: String,
    pub default: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            timeout: DEFAULT_TIMEOUT,
            credentials: CredentialSource::default(),
            confirmation_mode: ConfirmationMode::default(),
            log_format: LogFormat::default(),
            fallbacks: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unparseable values are replaced by their defaults so a typo never keeps
    /// the service from starting. Each replacement is recorded in
    /// [`Config::fallbacks`]; call [`Config::log_fallbacks`] once tracing is up.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut env = EnvReader::default();

        let bind = env.read(ENV_BIND, defaults.bind, |v| v.parse().ok());
        let port = env.read(ENV_PORT, defaults.port, |v| v.parse().ok());
        let timeout = env.read(ENV_TIMEOUT, defaults.timeout, parse_duration);
        let credentials = env.read(ENV_KUBE_CREDENTIALS, defaults.credentials, |v| {
            v.parse().ok()
        });
        let confirmation_mode =
            env.read(ENV_CONFIRMATION_MODE, defaults.confirmation_mode, |v| {
                v.parse().ok()
            });
        let log_format = env.read(ENV_LOG_FORMAT, defaults.log_format, |v| v.parse().ok());

        Self {
            bind,
            port,
            timeout,
            credentials,
            confirmation_mode,
            log_format,
            fallbacks: env.fallbacks,
        }
    }

    /// Warns about every value [`Config::from_env`] had to replace.
    pub fn log_fallbacks(&self) {
        for fallback in &self.fallbacks {
            warn!(
                key = fallback.key,
                value = %fallback.value,
                fallback = %fallback.default,
                "Invalid configuration value, using default"
            );
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::Config("request timeout must be greater than zero".into()));
        }
        if self.timeout > MAX_TIMEOUT {
            return Err(Error::Config(format!(
                "request timeout of {}s exceeds the maximum of {}s",
                self.timeout.as_secs(),
                MAX_TIMEOUT.as_secs()
            )));
        }
        Ok(())
    }

    pub fn listen_address(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

#[derive(Default)]
struct EnvReader {
    fallbacks: Vec<ConfigFallback>,
}

impl EnvReader {
    fn read<T: std::fmt::Debug>(
        &mut self,
        key: &'static str,
        default: T,
        parse: impl Fn(&str) -> Option<T>,
    ) -> T {
        let Ok(raw) = std::env::var(key) else {
            return default;
        };

        parse(&raw).unwrap_or_else(|| {
            self.fallbacks.push(ConfigFallback {
                key,
                value: raw,
                default: format!("{default:?}"),
            });
            default
        })
    }
}

/// Parses `500ms`, `15s`, `2m` or a bare number of seconds.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Some(millis) = value.strip_suffix("ms") {
        return millis.trim().parse().ok().map(Duration::from_millis);
    }
    if let Some(seconds) = value.strip_suffix('s') {
        return seconds.trim().parse().ok().map(Duration::from_secs);
    }
    if let Some(minutes) = value.strip_suffix('m') {
        return minutes
            .trim()
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs);
    }
    value.parse().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ALL_KEYS: [&str; 6] = [
        ENV_PORT,
        ENV_BIND,
        ENV_TIMEOUT,
        ENV_KUBE_CREDENTIALS,
        ENV_CONFIRMATION_MODE,
        ENV_LOG_FORMAT,
    ];

    fn clear_env() {
        for key in ALL_KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("15s"), Some(Duration::from_secs(15)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration(" 30 "), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("-1s"), None);
    }

    #[test]
    #[serial]
    fn test_defaults_without_env() {
        clear_env();
        let config = Config::from_env();
        assert_eq!(config, Config::default());
        assert_eq!(config.timeout, Duration::from_secs(15));
        assert_eq!(config.listen_address().to_string(), "0.0.0.0:5050");
    }

    #[test]
    #[serial]
    fn test_reads_env() {
        clear_env();
        std::env::set_var(ENV_PORT, "8081");
        std::env::set_var(ENV_BIND, "127.0.0.1");
        std::env::set_var(ENV_TIMEOUT, "500ms");
        std::env::set_var(ENV_KUBE_CREDENTIALS, "in-cluster");
        std::env::set_var(ENV_CONFIRMATION_MODE, "first-signal");
        std::env::set_var(ENV_LOG_FORMAT, "json");

        let config = Config::from_env();
        clear_env();

        assert_eq!(config.listen_address().to_string(), "127.0.0.1:8081");
        assert_eq!(config.timeout, Duration::from_millis(500));
        assert_eq!(config.credentials, CredentialSource::InCluster);
        assert_eq!(config.confirmation_mode, ConfirmationMode::FirstSignal);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    #[serial]
    fn test_invalid_values_fall_back() {
        clear_env();
        std::env::set_var(ENV_TIMEOUT, "eventually");
        std::env::set_var(ENV_PORT, "http");

        let config = Config::from_env();
        clear_env();

        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    #[serial]
    fn test_fallbacks_are_recorded() {
        clear_env();
        std::env::set_var(ENV_TIMEOUT, "30sec");
        std::env::set_var(ENV_LOG_FORMAT, "json");

        let config = Config::from_env();
        clear_env();

        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.fallbacks,
            vec![ConfigFallback {
                key: ENV_TIMEOUT,
                value: "30sec".to_string(),
                default: format!("{DEFAULT_TIMEOUT:?}"),
            }]
        );
        config.log_fallbacks();
    }

    #[test]
    #[serial]
    fn test_oversized_timeout_fails_validation() {
        clear_env();
        std::env::set_var(ENV_TIMEOUT, "18446744073709551615");

        let config = Config::from_env();
        clear_env();

        assert_eq!(config.timeout, Duration::from_secs(u64::MAX));
        assert!(config.fallbacks.is_empty());
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let at_limit = Config {
            timeout: MAX_TIMEOUT,
            ..Config::default()
        };
        assert!(at_limit.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = Config {
            timeout: Duration::ZERO,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_credential_source_parsing() {
        assert_eq!("AUTO".parse::<CredentialSource>().unwrap(), CredentialSource::Auto);
        assert_eq!(
            "kubeconfig".parse::<CredentialSource>().unwrap(),
            CredentialSource::Kubeconfig
        );
        assert!("vault".parse::<CredentialSource>().is_err());
    }
}
