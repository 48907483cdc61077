use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::ConflictScope;

/// Server settings, read once from `CLINIC_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub conflict_scope: ConflictScope,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "clinic".into(),
            max_connections: 256,
            compact_threshold: 1000,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
            conflict_scope: ConflictScope::Global,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep their
    /// defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let config = Config {
            bind: lookup("CLINIC_BIND").unwrap_or(defaults.bind),
            port: parsed(&lookup, "CLINIC_PORT")?.unwrap_or(defaults.port),
            data_dir: lookup("CLINIC_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            password: lookup("CLINIC_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "CLINIC_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "CLINIC_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            tls_cert: lookup("CLINIC_TLS_CERT"),
            tls_key: lookup("CLINIC_TLS_KEY"),
            metrics_port: parsed(&lookup, "CLINIC_METRICS_PORT")?,
            conflict_scope: parsed(&lookup, "CLINIC_CONFLICT_SCOPE")?
                .unwrap_or(defaults.conflict_scope),
        };
        if config.max_connections == 0 {
            return Err(ConfigError::Zero("CLINIC_MAX_CONNECTIONS"));
        }
        if config.compact_threshold == 0 {
            return Err(ConfigError::Zero("CLINIC_COMPACT_THRESHOLD"));
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("clinic.wal")
    }
}

fn parsed<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(var) else { return Ok(None) };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        })
}
