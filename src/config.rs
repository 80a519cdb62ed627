use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::{Role, StaffAccount};

/// Server configuration, read from `PARKADE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub admin_password: String,
    pub staff: Vec<StaffAccount>,
    pub max_connections: usize,
    /// WAL appends after which the background task compacts.
    pub compact_threshold: u64,
    /// Bound on each store call made by the engine.
    pub store_timeout: Duration,
    pub metrics_port: Option<u16>,
    /// Seed the default vehicle types into an empty catalog at startup.
    pub seed_catalog: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { key: &'static str, value: String },
    BadStaffEntry(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { key, value } => write!(f, "invalid value for {key}: {value:?}"),
            ConfigError::BadStaffEntry(entry) => {
                write!(f, "bad PARKADE_STAFF entry {entry:?}, expected username:password[:admin]")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let store_timeout_ms: u64 = parse_or(&lookup, "PARKADE_STORE_TIMEOUT_MS", 5000)?;
        if store_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                key: "PARKADE_STORE_TIMEOUT_MS",
                value: "0".into(),
            });
        }
        let max_connections: usize = parse_or(&lookup, "PARKADE_MAX_CONNECTIONS", 256)?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "PARKADE_MAX_CONNECTIONS",
                value: "0".into(),
            });
        }

        Ok(Self {
            bind: lookup("PARKADE_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "PARKADE_PORT", 7878)?,
            data_dir: PathBuf::from(lookup("PARKADE_DATA_DIR").unwrap_or_else(|| "./data".into())),
            admin_password: lookup("PARKADE_ADMIN_PASSWORD").unwrap_or_else(|| "parkade".into()),
            staff: parse_staff(lookup("PARKADE_STAFF").as_deref().unwrap_or(""))?,
            max_connections,
            compact_threshold: parse_or(&lookup, "PARKADE_COMPACT_THRESHOLD", 1000)?,
            store_timeout: Duration::from_millis(store_timeout_ms),
            metrics_port: lookup("PARKADE_METRICS_PORT")
                .map(|v| parse_value("PARKADE_METRICS_PORT", &v))
                .transpose()?,
            seed_catalog: parse_or(&lookup, "PARKADE_SEED_CATALOG", true)?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("parkade.wal")
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(v) => parse_value(key, &v),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

/// `user:pass[:admin]` entries separated by commas.
fn parse_staff(raw: &str) -> Result<Vec<StaffAccount>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.split(':').collect();
            let role = match parts.as_slice() {
                [_, _] => Role::Common,
                [_, _, "admin"] => Role::Admin,
                _ => return Err(ConfigError::BadStaffEntry(entry.to_string())),
            };
            if parts[0].is_empty() || parts[1].is_empty() {
                return Err(ConfigError::BadStaffEntry(entry.to_string()));
            }
            Ok(StaffAccount {
                username: parts[0].to_string(),
                password: parts[1].to_string(),
                role,
            })
        })
        .collect()
}
