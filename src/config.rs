use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

/// Server configuration, read once from `MEDSCHED_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "medsched".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{key}={raw:?} is not valid, using default");
            default
        }),
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup, so tests don't have to touch the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let config = Self {
            port: parsed(&lookup, "MEDSCHED_PORT", defaults.port),
            bind: lookup("MEDSCHED_BIND").unwrap_or(defaults.bind),
            data_dir: lookup("MEDSCHED_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("MEDSCHED_PASSWORD").unwrap_or_else(|| {
                warn!("MEDSCHED_PASSWORD not set, using the default password");
                defaults.password
            }),
            max_connections: parsed(&lookup, "MEDSCHED_MAX_CONNECTIONS", defaults.max_connections),
            compact_threshold: parsed(
                &lookup,
                "MEDSCHED_COMPACT_THRESHOLD",
                defaults.compact_threshold,
            ),
            metrics_port: lookup("MEDSCHED_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            tls_cert: lookup("MEDSCHED_TLS_CERT"),
            tls_key: lookup("MEDSCHED_TLS_KEY"),
        };
        if config.max_connections == 0 {
            warn!("MEDSCHED_MAX_CONNECTIONS=0 would refuse every client");
        }
        config
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
