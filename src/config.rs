//! Process configuration, read from `SALON_*` environment variables.

use std::path::PathBuf;

use chrono::{FixedOffset, Offset, Utc};
use thiserror::Error;

const DEFAULT_DATA_DIR: &str = "./data";
const DEFAULT_JOURNAL: &str = "salon.wal";
const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Journal file name inside `data_dir`.
    pub journal: String,
    /// Salon-local zone used to draw closeout day boundaries.
    pub utc_offset: FixedOffset,
    pub metrics_port: Option<u16>,
    /// Journal appends after which the CLI compacts on exit.
    pub compact_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            journal: DEFAULT_JOURNAL.to_string(),
            utc_offset: utc(),
            metrics_port: None,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Unset variables take their defaults;
    /// set but malformed ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Some(dir) = lookup("SALON_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(journal) = lookup("SALON_JOURNAL") {
            config.journal = journal;
        }
        if let Some(offset) = lookup("SALON_UTC_OFFSET") {
            config.utc_offset = parse_utc_offset(&offset).ok_or_else(|| ConfigError::Invalid {
                var: "SALON_UTC_OFFSET",
                value: offset.clone(),
                reason: "expected Z or ±HH:MM".into(),
            })?;
        }
        if let Some(port) = lookup("SALON_METRICS_PORT") {
            config.metrics_port = Some(parse_number("SALON_METRICS_PORT", &port)?);
        }
        if let Some(threshold) = lookup("SALON_COMPACT_THRESHOLD") {
            config.compact_threshold = parse_number("SALON_COMPACT_THRESHOLD", &threshold)?;
        }
        Ok(config)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join(&self.journal)
    }
}

fn utc() -> FixedOffset {
    Utc.fix()
}

fn parse_number<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// `Z`, `+09:00`, `-05:00`, `+0530`.
pub fn parse_utc_offset(value: &str) -> Option<FixedOffset> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("z") {
        return Some(utc());
    }
    let (sign, rest) = match value.as_bytes().first()? {
        b'+' => (1, &value[1..]),
        b'-' => (-1, &value[1..]),
        _ => return None,
    };
    if !rest.is_ascii() {
        return None;
    }
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h, m),
        None if rest.len() == 4 => rest.split_at(2),
        None => (rest, "0"),
    };
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if !(0..=23).contains(&hours) || !(0..60).contains(&minutes) {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
