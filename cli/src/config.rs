//! Configuration management for the simulation.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Simulation configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Number of client replicas
    pub clients: usize,
    /// Edit/sync rounds each client runs before settling
    pub rounds: usize,
    /// Tasks each client creates before the first sync
    pub records: usize,
    /// Delay added to every pull and push
    pub remote_latency: Duration,
    /// Server reports new records as updates
    pub send_created_as_updated: bool,
    /// Where final client snapshots are written, if anywhere
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clients: 2,
            rounds: 4,
            records: 6,
            remote_latency: Duration::from_millis(5),
            send_created_as_updated: false,
            snapshot_dir: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let clients = parse_number(&lookup, "TANDEM_CLIENTS", defaults.clients)?;
        if clients == 0 {
            return Err(ConfigError::NoClients);
        }

        let latency_ms = parse_number(
            &lookup,
            "TANDEM_REMOTE_LATENCY_MS",
            defaults.remote_latency.as_millis() as u64,
        )?;

        Ok(Self {
            clients,
            rounds: parse_number(&lookup, "TANDEM_ROUNDS", defaults.rounds)?,
            records: parse_number(&lookup, "TANDEM_RECORDS", defaults.records)?,
            remote_latency: Duration::from_millis(latency_ms),
            send_created_as_updated: parse_bool(
                &lookup,
                "TANDEM_SEND_CREATED_AS_UPDATED",
                defaults.send_created_as_updated,
            )?,
            snapshot_dir: lookup("TANDEM_SNAPSHOT_DIR")
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
        })
    }
}

fn parse_number<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        None => Ok(default),
    }
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(var) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidBool { var, value }),
        },
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{var} must be true or false, got {value:?}")]
    InvalidBool { var: &'static str, value: String },

    #[error("TANDEM_CLIENTS must be at least 1")]
    NoClients,
}
