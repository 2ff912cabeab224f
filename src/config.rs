use std::path::PathBuf;
use std::str::FromStr;

/// Server settings, read from `COUNSEL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
    /// JSON array of `{id, name, email}` identities. Empty directory when unset.
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("both COUNSEL_TLS_CERT and COUNSEL_TLS_KEY must be set, or neither")]
    TlsPair,
    #[error("COUNSEL_MAX_CONNECTIONS must be at least 1")]
    NoConnections,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "counsel".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls: None,
            directory: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let tls = match (lookup("COUNSEL_TLS_CERT"), lookup("COUNSEL_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::TlsPair),
        };

        let config = Self {
            bind: lookup("COUNSEL_BIND").unwrap_or(defaults.bind),
            port: parsed(&lookup, "COUNSEL_PORT")?.unwrap_or(defaults.port),
            data_dir: lookup("COUNSEL_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: lookup("COUNSEL_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "COUNSEL_MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "COUNSEL_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&lookup, "COUNSEL_METRICS_PORT")?,
            tls,
            directory: lookup("COUNSEL_DIRECTORY").map(PathBuf::from),
        };
        if config.max_connections == 0 {
            return Err(ConfigError::NoConnections);
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    let Some(value) = lookup(var) else { return Ok(None) };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Invalid { var, value })
}
