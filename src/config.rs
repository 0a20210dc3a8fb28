// Configuration module - reads exporter settings from the environment
//
// This module is responsible for:
// 1. Reading the MongoDB connection string, database and collection list
// 2. Applying defaults to the optional polling/export settings
// 3. Rejecting malformed values before anything connects or listens

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Seconds between two polling passes when `INTERVAL` is not set.
pub const DEFAULT_INTERVAL_SECS: u64 = 1800;

/// Port of the scrape endpoint when `METRICS_PORT` is not set.
pub const DEFAULT_METRICS_PORT: u16 = 8890;

/// Errors that can occur while loading the settings
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVariable(&'static str),

    #[error("Invalid value for {name}: '{value}' ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("COLLECTIONS does not name any collection")]
    NoCollections,
}

/// How far a failure inside a polling pass reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureScope {
    /// A failing collection is logged and the pass moves on to the next one.
    Collection,

    /// The first failure aborts the remainder of the pass.
    Pass,
}

impl FromStr for FailureScope {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "collection" => Ok(FailureScope::Collection),
            "pass" => Ok(FailureScope::Pass),
            other => Err(format!("expected 'collection' or 'pass', got '{}'", other)),
        }
    }
}

impl fmt::Display for FailureScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureScope::Collection => write!(f, "collection"),
            FailureScope::Pass => write!(f, "pass"),
        }
    }
}

/// Exporter settings, read once at startup.
///
/// # Environment Variables
/// ```text
/// MONGODB_URI         (required) connection string of a mongos router
/// DATABASE_NAME       (required) database holding the collections
/// COLLECTIONS         (required) comma-separated collection names
/// INTERVAL            seconds between passes, default 1800
/// METRICS_PORT        scrape endpoint port, default 8890
/// QUERY_TIMEOUT       seconds, driver connect/server-selection timeout
/// FAILURE_SCOPE       "collection" (default) or "pass"
/// PRUNE_STALE_SERIES  drop series no longer reported, default false
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub mongodb_uri: String,
    pub database_name: String,

    /// Collections to scan, in the order they are processed
    pub collections: Vec<String>,

    /// Sleep between the end of a pass and the start of the next one
    pub interval: Duration,

    pub metrics_port: u16,
    pub query_timeout: Option<Duration>,
    pub failure_scope: FailureScope,
    pub prune_stale_series: bool,
}

impl Settings {
    /// Loads the settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Loads the settings through an arbitrary variable lookup.
    ///
    /// Blank values are treated as absent. A present but malformed optional
    /// value is an error rather than a silent fallback to the default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mongodb_uri = get("MONGODB_URI").ok_or(ConfigError::MissingVariable("MONGODB_URI"))?;
        let database_name =
            get("DATABASE_NAME").ok_or(ConfigError::MissingVariable("DATABASE_NAME"))?;
        let collections = parse_collections(
            &get("COLLECTIONS").ok_or(ConfigError::MissingVariable("COLLECTIONS"))?,
        )?;

        let interval = match get("INTERVAL") {
            Some(value) => {
                let secs = parse_seconds("INTERVAL", &value)?;
                info!("Environment variable INTERVAL={}", secs);
                Duration::from_secs(secs)
            }
            None => {
                debug!(
                    "Environment variable INTERVAL is not set. Using default INTERVAL={}",
                    DEFAULT_INTERVAL_SECS
                );
                Duration::from_secs(DEFAULT_INTERVAL_SECS)
            }
        };

        let metrics_port = match get("METRICS_PORT") {
            Some(value) => value.parse::<u16>().map_err(|e| ConfigError::InvalidValue {
                name: "METRICS_PORT",
                value: value.clone(),
                reason: e.to_string(),
            })?,
            None => DEFAULT_METRICS_PORT,
        };

        let query_timeout = get("QUERY_TIMEOUT")
            .map(|value| parse_seconds("QUERY_TIMEOUT", &value).map(Duration::from_secs))
            .transpose()?;

        let failure_scope = match get("FAILURE_SCOPE") {
            Some(value) => {
                value
                    .parse::<FailureScope>()
                    .map_err(|reason| ConfigError::InvalidValue {
                        name: "FAILURE_SCOPE",
                        value: value.clone(),
                        reason,
                    })?
            }
            None => FailureScope::Collection,
        };

        let prune_stale_series = match get("PRUNE_STALE_SERIES") {
            Some(value) => parse_bool("PRUNE_STALE_SERIES", &value)?,
            None => false,
        };

        Ok(Settings {
            mongodb_uri,
            database_name,
            collections,
            interval,
            metrics_port,
            query_timeout,
            failure_scope,
            prune_stale_series,
        })
    }
}

/// Splits the comma-separated collection list, stripping all whitespace.
fn parse_collections(raw: &str) -> Result<Vec<String>, ConfigError> {
    let collections: Vec<String> = raw
        .split(',')
        .map(|name| name.chars().filter(|c| !c.is_whitespace()).collect::<String>())
        .filter(|name| !name.is_empty())
        .collect();

    if collections.is_empty() {
        return Err(ConfigError::NoCollections);
    }
    Ok(collections)
}

/// Parses a strictly positive number of seconds.
fn parse_seconds(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    match value.parse::<u64>() {
        Ok(0) => Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        Ok(secs) => Ok(secs),
        Err(e) => Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
