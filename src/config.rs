use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::limits::MAX_HOLD_TTL;

/// Server settings, read from `INNLEDGER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    /// How long an unconfirmed hold keeps its units.
    pub hold_ttl: Duration,
    pub sweep_interval: Duration,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "innledger".into(),
            max_connections: 256,
            compact_threshold: 1000,
            hold_ttl: Duration::from_millis(900_000),
            sweep_interval: Duration::from_millis(5_000),
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            port: parse_or(&lookup, "INNLEDGER_PORT", d.port),
            bind: lookup("INNLEDGER_BIND").unwrap_or(d.bind),
            data_dir: lookup("INNLEDGER_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("INNLEDGER_PASSWORD").unwrap_or(d.password),
            max_connections: parse_or(&lookup, "INNLEDGER_MAX_CONNECTIONS", d.max_connections).max(1),
            compact_threshold: parse_or(&lookup, "INNLEDGER_COMPACT_THRESHOLD", d.compact_threshold),
            hold_ttl: parse_hold_ttl(&lookup, d.hold_ttl),
            sweep_interval: Duration::from_millis(
                parse_or(
                    &lookup,
                    "INNLEDGER_SWEEP_INTERVAL_MS",
                    d.sweep_interval.as_millis() as u64,
                )
                .max(1),
            ),
            tls_cert: lookup("INNLEDGER_TLS_CERT"),
            tls_key: lookup("INNLEDGER_TLS_KEY"),
            metrics_port: lookup("INNLEDGER_METRICS_PORT").and_then(|raw| match raw.parse() {
                Ok(port) => Some(port),
                Err(_) => {
                    warn!("ignoring INNLEDGER_METRICS_PORT={raw:?}: not a port number");
                    None
                }
            }),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("innledger.wal")
    }
}

fn parse_hold_ttl(lookup: &impl Fn(&str) -> Option<String>, default: Duration) -> Duration {
    let ms = parse_or(lookup, "INNLEDGER_HOLD_TTL_MS", default.as_millis() as u64);
    let ttl = Duration::from_millis(ms);
    if ttl > MAX_HOLD_TTL {
        warn!("ignoring INNLEDGER_HOLD_TTL_MS={ms}: above {MAX_HOLD_TTL:?}, using default {default:?}");
        return default;
    }
    ttl
}

fn parse_or<T: FromStr + Copy + std::fmt::Debug>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("ignoring {key}={raw:?}: using default {default:?}");
            default
        }),
    }
}
