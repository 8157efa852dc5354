use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, VilainError};

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vilain.toml";

/// Seconds between two expiry sweeps when `sweep_interval` is not set
pub const DEFAULT_SWEEP_INTERVAL: u64 = 1;

/// Upper bound for every duration in the configuration (ten years)
pub const MAX_DURATION: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

/// Raw configuration file as written by the administrator.
///
/// Every top-level table other than `defaults` and `ignoreip` that carries a
/// `logfile` key describes one watched log.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub defaults: Defaults,

    #[serde(default)]
    pub ignoreip: Option<IgnoreList>,

    #[serde(flatten)]
    pub sections: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Defaults {
    /// Seconds an address stays tracked (and banned) after its last offense
    pub watch_while: u64,

    /// Offenses before a ban, unless a rule overrides it
    pub maxtries: u32,

    /// Name of the pf table receiving banned addresses
    pub vilain_table: String,

    /// Seconds between two polls of a watched log
    pub sleeptime: f64,

    /// Seconds between two expiry sweeps (defaults to one second)
    #[serde(default)]
    pub sweep_interval: Option<u64>,

    /// Daemon log file, read back by vilainreport
    #[serde(default = "default_log_file")]
    pub vilain_log: PathBuf,

    /// Program used to manipulate the block table
    #[serde(default = "default_pfctl")]
    pub pfctl: String,
}

/// Addresses exempt from banning.
///
/// Accepts both `ignoreip = ["a", "b"]` and an `[ignoreip]` table whose
/// values are the addresses.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IgnoreList {
    List(Vec<String>),
    Named(BTreeMap<String, String>),
}

impl IgnoreList {
    fn into_set(self) -> BTreeSet<String> {
        match self {
            IgnoreList::List(ips) => ips.into_iter().collect(),
            IgnoreList::Named(ips) => ips.into_values().collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    pub logfile: PathBuf,
    pub regex: String,
    #[serde(default)]
    pub maxtries: Option<u32>,
}

fn default_log_file() -> PathBuf {
    PathBuf::from("/var/log/daemon")
}

fn default_pfctl() -> String {
    "pfctl".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| VilainError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    /// Parse configuration text; `path` is only used in error messages
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        toml::from_str(content).map_err(|source| VilainError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// One watched log: the rule name doubles as the ban reason.
#[derive(Debug, Clone)]
pub struct WatcherSpec {
    pub name: String,
    pub log_path: PathBuf,
    pub pattern: Regex,
    pub max_tries: u32,
}

impl WatcherSpec {
    pub fn new(
        name: impl Into<String>,
        log_path: impl Into<PathBuf>,
        regex: &str,
        max_tries: u32,
    ) -> Result<Self> {
        let name = name.into();
        let pattern = Regex::new(regex).map_err(|source| VilainError::Pattern {
            rule: name.clone(),
            source,
        })?;

        // group 0 is the whole match
        if pattern.captures_len() < 2 {
            return Err(VilainError::Config(format!(
                "regex for rule '{}' needs a capture group for the address",
                name
            )));
        }
        if max_tries == 0 {
            return Err(VilainError::Config(format!(
                "maxtries for rule '{}' must be positive",
                name
            )));
        }

        Ok(Self {
            name,
            log_path: log_path.into(),
            pattern,
            max_tries,
        })
    }
}

/// Process-wide settings, built once at startup and handed to each component.
#[derive(Debug, Clone)]
pub struct Settings {
    pub watch_while: Duration,
    pub sweep_interval: Duration,
    pub sleep_time: Duration,
    pub default_max_tries: u32,
    pub table: String,
    pub ignore: BTreeSet<String>,
    pub log_file: PathBuf,
    pub pfctl: String,
    pub watchers: Vec<WatcherSpec>,
}

impl Settings {
    /// Read and validate the configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_config(Config::load(path)?)
    }

    pub fn from_config(config: Config) -> Result<Self> {
        let d = config.defaults;

        let watch_while = bounded_secs("watch_while", d.watch_while)?;
        if d.maxtries == 0 {
            return Err(VilainError::Config("maxtries must be positive".into()));
        }
        let sleep_time = match Duration::try_from_secs_f64(d.sleeptime) {
            Ok(t) if !t.is_zero() && t <= MAX_DURATION => t,
            _ => {
                return Err(VilainError::Config(format!(
                    "sleeptime must be a positive number of seconds up to {}",
                    MAX_DURATION.as_secs()
                )));
            }
        };
        if d.vilain_table.trim().is_empty() {
            return Err(VilainError::Config("vilain_table can't be empty".into()));
        }
        let sweep_interval = bounded_secs(
            "sweep_interval",
            d.sweep_interval.unwrap_or(DEFAULT_SWEEP_INTERVAL),
        )?;

        let mut watchers = Vec::new();
        for (name, section) in config.sections {
            let is_watcher = section
                .as_table()
                .map(|t| t.contains_key("logfile"))
                .unwrap_or(false);
            if !is_watcher {
                debug!("Section {} has no logfile, skipping", name);
                continue;
            }

            let watcher: WatcherConfig = section.try_into().map_err(|e: toml::de::Error| {
                VilainError::Config(format!("section '{}': {}", name, e))
            })?;
            let max_tries = watcher.maxtries.unwrap_or(d.maxtries);
            watchers.push(WatcherSpec::new(
                name,
                watcher.logfile,
                &watcher.regex,
                max_tries,
            )?);
        }

        Ok(Self {
            watch_while,
            sweep_interval,
            sleep_time,
            default_max_tries: d.maxtries,
            table: d.vilain_table,
            ignore: config.ignoreip.map(IgnoreList::into_set).unwrap_or_default(),
            log_file: d.vilain_log,
            pfctl: d.pfctl,
            watchers,
        })
    }
}

fn bounded_secs(key: &str, secs: u64) -> Result<Duration> {
    let duration = Duration::from_secs(secs);
    if duration.is_zero() || duration > MAX_DURATION {
        return Err(VilainError::Config(format!(
            "{} must be between 1 and {} seconds",
            key,
            MAX_DURATION.as_secs()
        )));
    }
    Ok(duration)
}
