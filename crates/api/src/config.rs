//! Process configuration for the `taskbridge-api` binary.
//!
//! [`AppConfig`] adds the HTTP listener, the process role and the log format
//! on top of the broker, worker and bridge sections from `taskbridge-infra`.
//! It is built once in `main` and handed to whatever needs it.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use taskbridge_infra::config::{ConfigError, read};
use taskbridge_infra::{BridgeConfig, BrokerConfig, WorkerConfig};
use taskbridge_observability::LogFormat;

/// Which parts of the system this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// HTTP server and dispatch bridge only.
    Api,
    /// Worker pool only.
    Worker,
    /// Both, sharing one broker. Required for `memory://`.
    #[default]
    All,
}

impl Role {
    pub fn runs_api(self) -> bool {
        matches!(self, Role::Api | Role::All)
    }

    pub fn runs_workers(self) -> bool {
        matches!(self, Role::Worker | Role::All)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role {0:?}, expected \"api\", \"worker\" or \"all\"")]
pub struct ParseRoleError(String);

impl FromStr for Role {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "api" => Ok(Role::Api),
            "worker" => Ok(Role::Worker),
            "all" => Ok(Role::All),
            other => Err(ParseRoleError(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Api => "api",
            Role::Worker => "worker",
            Role::All => "all",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub role: Role,
    pub log_format: LogFormat,
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
    pub bridge: BridgeConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            role: Role::default(),
            log_format: LogFormat::default(),
            broker: BrokerConfig::default(),
            worker: WorkerConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            host: read(&lookup, "TASKBRIDGE_HOST", defaults.host)?,
            port: read(&lookup, "TASKBRIDGE_PORT", defaults.port)?,
            role: read(&lookup, "TASKBRIDGE_ROLE", defaults.role)?,
            log_format: read(&lookup, "TASKBRIDGE_LOG_FORMAT", defaults.log_format)?,
            broker: BrokerConfig::from_lookup(&lookup)?,
            worker: WorkerConfig::from_lookup(&lookup)?,
            bridge: BridgeConfig::from_lookup(&lookup)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// The in-memory broker lives inside one process, so a split
    /// api/worker deployment needs a shared broker.
    ///
    /// A running job keeps its claim alive on every revoke check, and is
    /// cancelled at the soft time limit even if those calls fail. Both must
    /// fit inside the visibility timeout or a second worker can pick the job
    /// up while it still runs.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.is_in_memory() && self.role != Role::All {
            return Err(ConfigError::invalid(
                "TASKBRIDGE_ROLE",
                self.role.to_string(),
                "the memory:// broker requires role \"all\"",
            ));
        }
        let visibility = self.broker.visibility_timeout;
        if self.worker.soft_time_limit >= visibility {
            return Err(ConfigError::invalid(
                "TASKBRIDGE_SOFT_TIME_LIMIT_SECS",
                self.worker.soft_time_limit.as_secs().to_string(),
                format!("must be below the visibility timeout ({}s)", visibility.as_secs()),
            ));
        }
        if self.worker.revoke_check_interval >= visibility {
            return Err(ConfigError::invalid(
                "TASKBRIDGE_REVOKE_CHECK_INTERVAL_MS",
                self.worker.revoke_check_interval.as_millis().to_string(),
                format!("must be below the visibility timeout ({}s)", visibility.as_secs()),
            ));
        }
        self.bind_addr().map(|_| ())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| {
                ConfigError::invalid("TASKBRIDGE_HOST", self.host.clone(), e.to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.bind_addr().unwrap().port(), 8000);
        assert_eq!(config.bridge.task_timeout, Duration::from_secs(30));
        assert_eq!(config.broker.max_retries, 0);
    }

    #[test]
    fn sections_are_read_from_the_same_source() {
        let config = AppConfig::from_lookup(lookup(&[
            ("TASKBRIDGE_PORT", "9100"),
            ("TASKBRIDGE_LOG_FORMAT", "pretty"),
            ("TASKBRIDGE_TASK_TIMEOUT_SECS", "5"),
            ("TASKBRIDGE_WORKER_CONCURRENCY", "8"),
        ]))
        .unwrap();

        assert_eq!(config.port, 9100);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert_eq!(config.bridge.task_timeout, Duration::from_secs(5));
        assert_eq!(config.worker.concurrency, 8);
    }

    #[test]
    fn roles_parse_case_insensitively() {
        assert_eq!("API".parse::<Role>().unwrap(), Role::Api);
        assert_eq!("worker".parse::<Role>().unwrap(), Role::Worker);
        assert!("scheduler".parse::<Role>().is_err());
        assert!(Role::All.runs_api() && Role::All.runs_workers());
        assert!(!Role::Api.runs_workers());
    }

    #[test]
    fn split_roles_need_a_shared_broker() {
        let err = AppConfig::from_lookup(lookup(&[("TASKBRIDGE_ROLE", "api")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "TASKBRIDGE_ROLE"));
    }

    #[test]
    fn soft_time_limit_must_fit_in_the_visibility_timeout() {
        let err = AppConfig::from_lookup(lookup(&[
            ("TASKBRIDGE_VISIBILITY_TIMEOUT_SECS", "30"),
            ("TASKBRIDGE_SOFT_TIME_LIMIT_SECS", "30"),
        ]))
        .unwrap_err();
        assert!(
            matches!(err, ConfigError::Invalid { ref key, .. } if key == "TASKBRIDGE_SOFT_TIME_LIMIT_SECS")
        );

        let config = AppConfig::from_lookup(lookup(&[
            ("TASKBRIDGE_VISIBILITY_TIMEOUT_SECS", "31"),
            ("TASKBRIDGE_SOFT_TIME_LIMIT_SECS", "30"),
        ]))
        .unwrap();
        assert_eq!(config.broker.visibility_timeout, Duration::from_secs(31));
    }

    #[test]
    fn revoke_check_interval_must_fit_in_the_visibility_timeout() {
        let err = AppConfig::from_lookup(lookup(&[
            ("TASKBRIDGE_VISIBILITY_TIMEOUT_SECS", "2"),
            ("TASKBRIDGE_SOFT_TIME_LIMIT_SECS", "1"),
            ("TASKBRIDGE_REVOKE_CHECK_INTERVAL_MS", "2000"),
        ]))
        .unwrap_err();
        assert!(
            matches!(err, ConfigError::Invalid { ref key, .. } if key == "TASKBRIDGE_REVOKE_CHECK_INTERVAL_MS")
        );
    }

    #[test]
    fn bad_port_is_reported_with_its_key() {
        let err = AppConfig::from_lookup(lookup(&[("TASKBRIDGE_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "TASKBRIDGE_PORT"));
    }
}
