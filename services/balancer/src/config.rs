//! Balancer configuration.
//!
//! Defaults are overridden by an optional JSON file (`BALANCER_CONFIG_FILE`),
//! which is in turn overridden by individual environment variables.

use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

use crate::proxy::BackendTarget;

/// Configuration validation failure. Carries every problem found, not just the first.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Balancer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interface address to listen on (example: 0.0.0.0).
    pub listen_interface: String,

    /// Port to accept client connections on.
    pub listen_port: u16,

    /// Accept backlog for the listening socket.
    pub connection_backlog: u32,

    /// Receive timeout applied to every socket, in milliseconds.
    pub receive_timeout_ms: u64,

    /// Send timeout applied to every socket, in milliseconds.
    pub send_timeout_ms: u64,

    /// Wait between backend dial attempts, in milliseconds.
    pub backend_reconnect_wait_ms: u64,

    /// SO_RCVBUF for every socket.
    pub receive_buffer_size: usize,

    /// SO_SNDBUF for every socket.
    pub send_buffer_size: usize,

    /// Ordered list of backend servers.
    pub backends: Vec<BackendTarget>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_interface: "0.0.0.0".to_string(),
            listen_port: 3401,
            connection_backlog: 128,
            receive_timeout_ms: 5000,
            send_timeout_ms: 5000,
            backend_reconnect_wait_ms: 5000,
            receive_buffer_size: 16384,
            send_buffer_size: 16384,
            backends: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration using `lookup` to resolve variable names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup("BALANCER_CONFIG_FILE") {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        if let Some(v) = lookup("BALANCER_LISTEN_INTERFACE") {
            config.listen_interface = v;
        }
        if let Some(v) = parse_var(&lookup, "BALANCER_LISTEN_PORT")? {
            config.listen_port = v;
        }
        if let Some(v) = parse_var(&lookup, "BALANCER_CONNECTION_BACKLOG")? {
            config.connection_backlog = v;
        }
        if let Some(v) = parse_var(&lookup, "BALANCER_RECEIVE_TIMEOUT_MS")? {
            config.receive_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "BALANCER_SEND_TIMEOUT_MS")? {
            config.send_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "BALANCER_BACKEND_RECONNECT_WAIT_MS")? {
            config.backend_reconnect_wait_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "BALANCER_RECEIVE_BUFFER_SIZE")? {
            config.receive_buffer_size = v;
        }
        if let Some(v) = parse_var(&lookup, "BALANCER_SEND_BUFFER_SIZE")? {
            config.send_buffer_size = v;
        }
        if let Some(v) = lookup("BALANCER_BACKENDS") {
            config.backends = parse_backends(&v)?;
        }
        if let Some(v) = lookup("BALANCER_LOG_LEVEL") {
            config.log_level = v;
        }

        Ok(config)
    }

    /// Load configuration from a JSON file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Check ranges, addresses and the backend list.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut failures = Vec::new();

        if self.listen_port == 0 {
            failures.push("listen_port must be between 1 and 65535".to_string());
        }
        if !(1..=1000).contains(&self.connection_backlog) {
            failures.push("connection_backlog must be between 1 and 1000".to_string());
        }
        if self.listen_interface.parse::<IpAddr>().is_err() {
            failures.push(format!(
                "listen_interface must be a valid IP address: {}",
                self.listen_interface
            ));
        }
        if self.receive_timeout_ms == 0 || self.send_timeout_ms == 0 {
            failures.push("receive/send timeouts must be non-zero".to_string());
        }
        if self.receive_buffer_size == 0 || self.send_buffer_size == 0 {
            failures.push("receive/send buffer sizes must be non-zero".to_string());
        }

        if self.backends.is_empty() {
            failures.push("no backends configured".to_string());
        }
        for (position, backend) in self.backends.iter().enumerate() {
            if backend.address.parse::<IpAddr>().is_err() {
                failures.push(format!("[{position}] address must be a valid IP address"));
            }
            if backend.port == 0 {
                failures.push(format!("[{position}] port must be set"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(failures))
        }
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn backend_reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.backend_reconnect_wait_ms)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be a number."))
}

/// Parse a comma-separated backend list (`10.0.0.1:80,[fd00::1]:80`).
fn parse_backends(value: &str) -> Result<Vec<BackendTarget>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (address, port) = entry
                .rsplit_once(':')
                .with_context(|| format!("Backend '{entry}' must be address:port."))?;
            let port = port
                .parse()
                .with_context(|| format!("Backend '{entry}' has an invalid port."))?;
            let address = address.trim_start_matches('[').trim_end_matches(']');
            Ok(BackendTarget::new(address, port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use rstest::rstest;

    use super::*;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    fn valid_config() -> Config {
        Config {
            backends: vec![BackendTarget::new("127.0.0.1", 3402)],
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen_port, 3401);
        assert_eq!(config.backend_reconnect_wait(), Duration::from_secs(5));
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("BALANCER_LISTEN_INTERFACE", "127.0.0.1"),
            ("BALANCER_LISTEN_PORT", "3400"),
            ("BALANCER_BACKEND_RECONNECT_WAIT_MS", "250"),
            ("BALANCER_BACKENDS", "127.0.0.1:3401, 127.0.0.1:3402,[::1]:3403"),
        ]))
        .unwrap();

        assert_eq!(config.listen_interface, "127.0.0.1");
        assert_eq!(config.listen_port, 3400);
        assert_eq!(config.backend_reconnect_wait(), Duration::from_millis(250));
        assert_eq!(
            config.backends,
            vec![
                BackendTarget::new("127.0.0.1", 3401),
                BackendTarget::new("127.0.0.1", 3402),
                BackendTarget::new("::1", 3403),
            ]
        );
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let err = Config::from_lookup(lookup_from(&[("BALANCER_LISTEN_PORT", "http")]))
            .unwrap_err();
        assert!(err.to_string().contains("BALANCER_LISTEN_PORT"));
    }

    #[test]
    fn test_invalid_backend_entry() {
        assert!(Config::from_lookup(lookup_from(&[("BALANCER_BACKENDS", "10.0.0.1")])).is_err());
        assert!(
            Config::from_lookup(lookup_from(&[("BALANCER_BACKENDS", "10.0.0.1:port")])).is_err()
        );
    }

    #[test]
    fn test_file_then_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "listen_port": 4000,
                "send_timeout_ms": 750,
                "backends": [{{ "address": "10.0.0.1", "port": 9000 }}]
            }}"#
        )
        .unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = Config::from_lookup(lookup_from(&[
            ("BALANCER_CONFIG_FILE", path.as_str()),
            ("BALANCER_LISTEN_PORT", "4001"),
        ]))
        .unwrap();

        assert_eq!(config.listen_port, 4001);
        assert_eq!(config.send_timeout_ms, 750);
        assert_eq!(config.receive_timeout_ms, 5000);
        assert_eq!(config.backends, vec![BackendTarget::new("10.0.0.1", 9000)]);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file("/nonexistent/balancer.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[rstest]
    #[case::port_zero(Config { listen_port: 0, ..valid_config() }, "listen_port")]
    #[case::backlog_zero(Config { connection_backlog: 0, ..valid_config() }, "connection_backlog")]
    #[case::backlog_too_large(Config { connection_backlog: 1001, ..valid_config() }, "connection_backlog")]
    #[case::bad_interface(Config { listen_interface: "localhost".into(), ..valid_config() }, "listen_interface")]
    #[case::no_backends(Config { backends: vec![], ..valid_config() }, "no backends")]
    #[case::bad_backend_address(
        Config { backends: vec![BackendTarget::new("backend-1", 80)], ..valid_config() },
        "[0] address"
    )]
    #[case::bad_backend_port(
        Config { backends: vec![BackendTarget::new("10.0.0.1", 0)], ..valid_config() },
        "[0] port"
    )]
    #[case::zero_timeout(Config { send_timeout_ms: 0, ..valid_config() }, "timeouts")]
    fn test_validation_failures(#[case] config: Config, #[case] expected: &str) {
        let err = config.validate().unwrap_err();
        assert!(
            err.to_string().contains(expected),
            "expected '{expected}' in '{err}'"
        );
    }

    #[test]
    fn test_validation_collects_all_failures() {
        let config = Config {
            listen_port: 0,
            backends: vec![
                BackendTarget::new("10.0.0.1", 80),
                BackendTarget::new("nope", 0),
            ],
            ..Config::default()
        };

        let ConfigError::Invalid(failures) = config.validate().unwrap_err();
        assert_eq!(failures.len(), 3);
        assert!(failures.iter().any(|f| f.starts_with("[1] address")));
        assert!(failures.iter().any(|f| f.starts_with("[1] port")));
    }
}
