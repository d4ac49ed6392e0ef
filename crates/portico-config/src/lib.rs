//! # Portico Configuration
//!
//! Environment-driven configuration for the Portico DNS front-end.
//!
//! Portico is deployed as a container behind orchestration that injects all
//! settings through the environment, so there is no config-file layer: every
//! knob is a `PORTICO_*` variable with a typed default. [`Config::from_env`]
//! reads the process environment; the lookup function is injectable so tests
//! never mutate global state.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Environment variable prefix shared by every setting.
const ENV_PREFIX: &str = "PORTICO_";

/// Configuration error.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("missing required variable: {0}")]
    Missing(String),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Listener port assignments.
///
/// A listener is disabled by setting its port variable to `0`.
#[derive(Debug, Clone, Serialize)]
pub struct Ports {
    /// DNS over TLS (terminated locally).
    pub dot: u16,
    /// DoT behind a PROXY-protocol v2 hop.
    pub dot_proxy: u16,
    /// DNS over HTTPS (terminated locally, ALPN h2).
    pub doh: u16,
    /// Cleartext DoT, used when TLS is offloaded upstream.
    pub dot_cleartext: u16,
    /// Cleartext DoH (h2c), used when TLS is offloaded upstream.
    pub doh_cleartext: u16,
    /// HTTP health-check listener.
    pub check: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Self {
            dot: 10_000,
            dot_proxy: 10_001,
            doh: 8443,
            dot_cleartext: 10_555,
            doh_cleartext: 8055,
            check: 8888,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize)]
pub struct LogConfig {
    /// Level directive: `trace`, `debug`, `info`, `warn`, `error`.
    pub level: String,
    /// Output format: `text` or `json`.
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Complete front-end configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Listener ports.
    pub ports: Ports,

    /// TCP accept backlog for every listener.
    pub tcp_backlog: u32,

    /// Per-socket idle timeout in milliseconds.
    pub io_timeout_ms: u64,

    /// Hard deadline for graceful drain in milliseconds.
    pub shutdown_timeout_ms: u64,

    /// Floor for the per-listener connection cap.
    pub min_conns: usize,

    /// Ceiling for the per-listener connection cap.
    pub max_conns: usize,

    /// TLS-offload mode: only the cleartext and health listeners run.
    pub cleartext: bool,

    /// Whether the PROXY-protocol DoT listener runs.
    pub dot_over_proxy_proto: bool,

    /// PEM private key path (TLS modes only).
    pub tls_key: Option<PathBuf>,

    /// PEM certificate chain path (TLS modes only).
    pub tls_crt: Option<PathBuf>,

    /// DNS SAN hostnames of the serving certificate, comma separated in the
    /// environment. Wildcard entries start with `*.`.
    pub tls_hosts: Vec<String>,

    /// Base64 secret seeding session-ticket key derivation. Falls back to
    /// the TLS private key bytes when unset.
    pub secret_b64: Option<String>,

    /// Deployment image reference, mixed into the ticket-key context.
    pub image_ref: Option<String>,

    /// Enable periodic heap usage reports.
    pub measure_heap: bool,

    /// Running on a developer machine rather than in a cloud environment.
    pub on_local: bool,

    /// Logging.
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ports: Ports::default(),
            tcp_backlog: 1024,
            io_timeout_ms: 10_000,
            shutdown_timeout_ms: 5_000,
            min_conns: 32,
            max_conns: 512,
            cleartext: false,
            dot_over_proxy_proto: false,
            tls_key: None,
            tls_crt: None,
            tls_hosts: Vec::new(),
            secret_b64: None,
            image_ref: None,
            measure_heap: false,
            on_local: false,
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration through an injectable lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| lookup(&format!("{ENV_PREFIX}{suffix}"));

        let mut cfg = Config::default();

        cfg.ports.dot = parse_or("DOT_PORT", &get, cfg.ports.dot)?;
        cfg.ports.dot_proxy = parse_or("DOT_PROXY_PORT", &get, cfg.ports.dot_proxy)?;
        cfg.ports.doh = parse_or("DOH_PORT", &get, cfg.ports.doh)?;
        cfg.ports.dot_cleartext = parse_or("DOT_CLEAR_PORT", &get, cfg.ports.dot_cleartext)?;
        cfg.ports.doh_cleartext = parse_or("DOH_CLEAR_PORT", &get, cfg.ports.doh_cleartext)?;
        cfg.ports.check = parse_or("CHECK_PORT", &get, cfg.ports.check)?;

        cfg.tcp_backlog = parse_or("TCP_BACKLOG", &get, cfg.tcp_backlog)?;
        cfg.io_timeout_ms = parse_or("IO_TIMEOUT_MS", &get, cfg.io_timeout_ms)?;
        cfg.shutdown_timeout_ms =
            parse_or("SHUTDOWN_TIMEOUT_MS", &get, cfg.shutdown_timeout_ms)?;
        cfg.min_conns = parse_or("MIN_CONNS", &get, cfg.min_conns)?;
        cfg.max_conns = parse_or("MAX_CONNS", &get, cfg.max_conns)?;

        cfg.cleartext = parse_bool("CLEARTEXT", &get, cfg.cleartext)?;
        cfg.dot_over_proxy_proto =
            parse_bool("DOT_PROXY_PROTO", &get, cfg.dot_over_proxy_proto)?;
        cfg.measure_heap = parse_bool("MEASURE_HEAP", &get, cfg.measure_heap)?;
        cfg.on_local = parse_bool("ON_LOCAL", &get, cfg.on_local)?;

        cfg.tls_key = get("TLS_KEY").map(PathBuf::from);
        cfg.tls_crt = get("TLS_CRT").map(PathBuf::from);
        cfg.tls_hosts = get("TLS_HOSTS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        cfg.secret_b64 = get("SECRET_B64").filter(|s| !s.is_empty());
        cfg.image_ref = get("IMAGE_REF").filter(|s| !s.is_empty());

        if let Some(level) = get("LOG_LEVEL") {
            cfg.log.level = level;
        }
        if let Some(format) = get("LOG_FORMAT") {
            cfg.log.format = format;
        }

        Ok(cfg)
    }

    /// Checks cross-field consistency.
    pub fn validate(&self) -> Result<()> {
        if self.min_conns == 0 {
            return Err(ConfigError::Validation("min_conns must be at least 1".into()));
        }

        if self.min_conns > self.max_conns {
            return Err(ConfigError::Validation(format!(
                "min_conns ({}) exceeds max_conns ({})",
                self.min_conns, self.max_conns
            )));
        }

        if self.io_timeout_ms == 0 {
            return Err(ConfigError::Validation("io_timeout_ms must be non-zero".into()));
        }

        if !self.cleartext {
            if self.tls_key.is_none() {
                return Err(ConfigError::Missing(format!("{ENV_PREFIX}TLS_KEY")));
            }
            if self.tls_crt.is_none() {
                return Err(ConfigError::Missing(format!("{ENV_PREFIX}TLS_CRT")));
            }
            if self.tls_hosts.is_empty() {
                return Err(ConfigError::Missing(format!("{ENV_PREFIX}TLS_HOSTS")));
            }
        }

        Ok(())
    }

    /// True when running in a managed cloud environment.
    pub fn in_cloud(&self) -> bool {
        !self.on_local
    }
}

fn parse_or<T, F>(suffix: &str, get: &F, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match get(suffix) {
        Some(raw) => raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
            var: format!("{ENV_PREFIX}{suffix}"),
            message: format!("{e}"),
        }),
        None => Ok(default),
    }
}

fn parse_bool<F>(suffix: &str, get: &F, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match get(suffix) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                var: format!("{ENV_PREFIX}{suffix}"),
                message: format!("expected a boolean, got {other:?}"),
            }),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(map: &'a HashMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| map.get(name).map(|v| v.to_string())
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.ports.dot, 10_000);
        assert_eq!(cfg.io_timeout_ms, 10_000);
        assert!(!cfg.cleartext);
        assert!(cfg.tls_hosts.is_empty());
    }

    #[test]
    fn test_env_overrides() {
        let map = HashMap::from([
            ("PORTICO_DOT_PORT", "853"),
            ("PORTICO_MAX_CONNS", "64"),
            ("PORTICO_CLEARTEXT", "true"),
            ("PORTICO_TLS_HOSTS", "a.example, *.b.example"),
            ("PORTICO_LOG_LEVEL", "debug"),
        ]);

        let cfg = Config::from_lookup(lookup_from(&map)).unwrap();
        assert_eq!(cfg.ports.dot, 853);
        assert_eq!(cfg.max_conns, 64);
        assert!(cfg.cleartext);
        assert_eq!(cfg.tls_hosts, vec!["a.example", "*.b.example"]);
        assert_eq!(cfg.log.level, "debug");
    }

    #[test]
    fn test_invalid_number_rejected() {
        let map = HashMap::from([("PORTICO_DOT_PORT", "eight-five-three")]);
        let err = Config::from_lookup(lookup_from(&map)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_invalid_bool_rejected() {
        let map = HashMap::from([("PORTICO_CLEARTEXT", "maybe")]);
        let err = Config::from_lookup(lookup_from(&map)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_tls_mode_requires_key_material() {
        let cfg = Config::from_lookup(|_| None).unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn test_cleartext_mode_validates_without_tls() {
        let map = HashMap::from([("PORTICO_CLEARTEXT", "1")]);
        let cfg = Config::from_lookup(lookup_from(&map)).unwrap();
        cfg.validate().unwrap();
    }

    #[test]
    fn test_min_conns_bounds() {
        let map = HashMap::from([
            ("PORTICO_CLEARTEXT", "1"),
            ("PORTICO_MIN_CONNS", "100"),
            ("PORTICO_MAX_CONNS", "10"),
        ]);
        let cfg = Config::from_lookup(lookup_from(&map)).unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_in_cloud() {
        let cfg = Config::default();
        assert!(cfg.in_cloud());

        let map = HashMap::from([("PORTICO_ON_LOCAL", "1")]);
        let cfg = Config::from_lookup(lookup_from(&map)).unwrap();
        assert!(!cfg.in_cloud());
    }
}
