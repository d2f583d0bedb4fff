use std::env;
use std::fmt::{self, Formatter};
use std::path::PathBuf;

#[derive(Debug, PartialEq, Clone)]
pub enum ConfigError {
    MissingVar(String),
    InvalidValue { var: String, value: String },
}

impl std::error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingVar(var) => write!(f, "missing required environment variable: {var}"),
            ConfigError::InvalidValue { var, value } => {
                write!(f, "invalid value for {var}: {value}")
            }
        }
    }
}

/// Configuration surface consumed from the environment (spec §6).
#[derive(Debug, Clone)]
pub struct Config {
    pub s3_endpoint: String,
    pub s3_access_key: String,
    pub s3_secret_key: String,

    pub rsync_host: String,
    pub rsync_port: u16,
    pub rsync_user: String,
    pub ssh_key_path: PathBuf,
    pub ssh_strict_host_key_checking: bool,
    pub ssh_known_hosts_path: Option<PathBuf>,

    pub snapshot_dir: String,
    pub s3_root_prefix: String,
}

impl Config {
    /// Load configuration from the process environment, failing on missing
    /// required variables or malformed values. Defaults mirror spec §6.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config {
            s3_endpoint: require_var("S3_ENDPOINT")?,
            s3_access_key: require_var("S3_ACCESS_KEY")?,
            s3_secret_key: require_var("S3_SECRET_KEY")?,

            rsync_host: require_var("RSYNC_HOST")?,
            rsync_port: optional_var("RSYNC_PORT", "22")?,
            rsync_user: require_var("RSYNC_USER")?,
            ssh_key_path: PathBuf::from(optional_var_raw(
                "SSH_KEY_PATH",
                "/secrets/rsync_id_ed25519",
            )),
            ssh_strict_host_key_checking: optional_var("SSH_STRICT_HOST_KEY_CHECKING", "true")?,
            ssh_known_hosts_path: env::var("SSH_KNOWN_HOSTS_PATH").ok().map(PathBuf::from),

            snapshot_dir: optional_var_raw("SNAPSHOT_DIR", ".zfs"),
            s3_root_prefix: optional_var_raw("S3_ROOT_PREFIX", "s3root"),
        };
        config.validate()?;
        Ok(config)
    }

    /// "Snapshot root IS the data root" treatment (spec §6).
    pub fn s3_root_is_data_root(&self) -> bool {
        self.s3_root_prefix.is_empty() || self.s3_root_prefix == "."
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.rsync_port == 0 {
            return Err(ConfigError::InvalidValue {
                var: "RSYNC_PORT".to_string(),
                value: self.rsync_port.to_string(),
            });
        }
        Ok(())
    }
}

fn require_var(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()))
}

fn optional_var_raw(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn optional_var<T>(name: &str, default: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    let raw = optional_var_raw(name, default);
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        var: name.to_string(),
        value: raw,
    })
}
