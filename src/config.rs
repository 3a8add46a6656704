use std::env;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::middleware::MiddlewareConfig;
use crate::planner::PlannerConfig;

/// Complete application configuration, loaded from environment variables or default values.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api: ApiConfig,
    /// `None` when no middleware URL is configured; dispatch is then disabled
    pub middleware: Option<MiddlewareConfig>,
    pub planner: PlannerConfig,
    pub storage: StorageConfig,
}

impl AppConfig {
    /// Creates a configuration from the currently available environment variables.
    pub fn from_env() -> Self {
        Self {
            api: ApiConfig::from_env(),
            middleware: middleware_from_env(),
            planner: planner_from_env(),
            storage: StorageConfig::from_env(),
        }
    }
}

/// Configuration for the API server.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    bind_ip: IpAddr,
    display_host: String,
    port: u16,
}

impl ApiConfig {
    const DEFAULT_HOST: &'static str = "0.0.0.0";
    const DEFAULT_PORT: u16 = 8080;
    const HOST_VAR: &'static str = "RACKFLOW_API_HOST";
    const PORT_VAR: &'static str = "RACKFLOW_API_PORT";

    pub(crate) fn from_env() -> Self {
        let host_value = env_string(Self::HOST_VAR).unwrap_or_else(|| Self::DEFAULT_HOST.to_string());
        let (bind_ip, display_host) = match host_value.parse::<IpAddr>() {
            Ok(ip) => (ip, host_value),
            Err(err) => {
                warn!(
                    "Could not parse {} ('{}'): {}. Using {}.",
                    Self::HOST_VAR,
                    host_value,
                    err,
                    Self::DEFAULT_HOST
                );
                (
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    Self::DEFAULT_HOST.to_string(),
                )
            }
        };

        let port = load_with_warning(
            Self::PORT_VAR,
            Self::DEFAULT_PORT,
            |value| value != 0,
            "must not be 0",
        );

        Self {
            bind_ip,
            display_host,
            port,
        }
    }

    /// Socket address to bind the server to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    /// Visible hostname for logging and hints.
    pub fn display_host(&self) -> &str {
        &self.display_host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Indicates whether binding to all interfaces.
    pub fn binds_to_all_interfaces(&self) -> bool {
        match self.bind_ip {
            IpAddr::V4(addr) => addr == Ipv4Addr::UNSPECIFIED,
            IpAddr::V6(addr) => addr == Ipv6Addr::UNSPECIFIED,
        }
    }
}

/// Where the warehouse snapshot lives, if anywhere.
#[derive(Clone, Debug, Default)]
pub struct StorageConfig {
    state_path: Option<PathBuf>,
}

impl StorageConfig {
    const STATE_PATH_VAR: &'static str = "RACKFLOW_STATE_PATH";

    fn from_env() -> Self {
        Self {
            state_path: env_string(Self::STATE_PATH_VAR).map(PathBuf::from),
        }
    }

    pub fn state_path(&self) -> Option<&PathBuf> {
        self.state_path.as_ref()
    }
}

const MIDDLEWARE_URL_VAR: &str = "RACKFLOW_MIDDLEWARE_URL";
const MIDDLEWARE_API_KEY_VAR: &str = "RACKFLOW_MIDDLEWARE_API_KEY";
const MIDDLEWARE_TIMEOUT_VAR: &str = "RACKFLOW_MIDDLEWARE_TIMEOUT_SECS";
const MIDDLEWARE_RETRY_VAR: &str = "RACKFLOW_MIDDLEWARE_RETRY_COUNT";
const RECLAIM_BATCH_VAR: &str = "RACKFLOW_RECLAIM_BATCH_SIZE";
const INTAKE_NAME_VAR: &str = "RACKFLOW_INTAKE_SLOT_NAME";

fn middleware_from_env() -> Option<MiddlewareConfig> {
    let url = env_string(MIDDLEWARE_URL_VAR)?;
    let config = match MiddlewareConfig::new(url) {
        Ok(config) => config,
        Err(err) => {
            warn!("{} ignored: {}. Dispatch is disabled.", MIDDLEWARE_URL_VAR, err);
            return None;
        }
    };

    let timeout_secs = load_with_warning(
        MIDDLEWARE_TIMEOUT_VAR,
        MiddlewareConfig::DEFAULT_TIMEOUT_SECS,
        |value| value > 0,
        "must be greater than 0",
    );
    let retry_count = load_with_warning(
        MIDDLEWARE_RETRY_VAR,
        MiddlewareConfig::DEFAULT_RETRY_COUNT,
        |value| value <= MiddlewareConfig::MAX_RETRY_COUNT,
        "must be between 0 and 10",
    );

    Some(
        config
            .with_api_key(env_string(MIDDLEWARE_API_KEY_VAR))
            .with_timeout(Duration::from_secs(timeout_secs))
            .with_retry_count(retry_count),
    )
}

fn planner_from_env() -> PlannerConfig {
    let defaults = PlannerConfig::default();
    let batch = load_with_warning(
        RECLAIM_BATCH_VAR,
        defaults.reclaim_batch_size,
        |value| value > 0,
        "must be greater than 0",
    );
    let intake = env_string(INTAKE_NAME_VAR).unwrap_or(defaults.intake_name);

    PlannerConfig::builder()
        .reclaim_batch_size(batch)
        .intake_name(intake)
        .build()
}

fn env_string(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_owned())
            }
        }
        Err(env::VarError::NotPresent) => None,
        Err(err) => {
            warn!("Access to {} failed: {}. Using default value.", name, err);
            None
        }
    }
}

fn parse_with_warning<T>(
    var_name: &str,
    raw: Option<String>,
    default: T,
    validator: impl Fn(T) -> bool,
    invalid_hint: &str,
) -> T
where
    T: FromStr + Copy + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => match raw.parse::<T>() {
            Ok(value) if validator(value) => value,
            Ok(_) => {
                warn!(
                    "{} contains invalid value '{}': {}. Using {}.",
                    var_name, raw, invalid_hint, default
                );
                default
            }
            Err(err) => {
                warn!(
                    "Could not parse {} ('{}') as number: {}. Using {}.",
                    var_name, raw, err, default
                );
                default
            }
        },
        None => default,
    }
}

fn load_with_warning<T>(
    var_name: &str,
    default: T,
    validator: impl Fn(T) -> bool,
    invalid_hint: &str,
) -> T
where
    T: FromStr + Copy + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    parse_with_warning(var_name, env_string(var_name), default, validator, invalid_hint)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_port(raw: &str) -> u16 {
        parse_with_warning("TEST_VAR", Some(raw.to_string()), 8080, |v| v != 0, "must not be 0")
    }

    #[test]
    fn test_parse_valid_numbers() {
        assert_eq!(parse_port("9000"), 9000);
        assert_eq!(
            parse_with_warning("TEST_VAR", Some("0".to_string()), 3u32, |v| v <= 10, "range"),
            0
        );
    }

    #[test]
    fn test_parse_invalid_numbers_fall_back() {
        assert_eq!(parse_port("0"), 8080);
        assert_eq!(parse_port("http"), 8080);
        assert_eq!(parse_port("70000"), 8080);
        assert_eq!(
            parse_with_warning("TEST_VAR", Some("11".to_string()), 3u32, |v| v <= 10, "range"),
            3
        );
    }

    #[test]
    fn test_parse_missing_value_uses_default() {
        assert_eq!(
            parse_with_warning::<usize>("TEST_VAR", None, 20, |v| v > 0, "positive"),
            20
        );
    }

    #[test]
    fn test_unset_variables_use_defaults() {
        assert!(env_string("RACKFLOW_TEST_SURELY_UNSET_VARIABLE").is_none());
        let storage = StorageConfig::default();
        assert!(storage.state_path().is_none());
    }
}
