use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::constants::{
    DEFAULT_CONVERTER_PATH, DEFAULT_CURRENT_TRIES, DEFAULT_DATA_DIR, DEFAULT_FORECAST_BASE_TRIES,
    DEFAULT_FORECAST_HOUR_TRIES, DEFAULT_LISTEN_ADDR, DEFAULT_MAX_AGE_HOURS,
    DEFAULT_REQUEST_TIMEOUT_SECONDS, DEFAULT_STATIC_DIR, NOMADS_FILTER_URL, WEATHER_DIR,
};

#[derive(Clone, Debug)]
pub struct Config {
    pub listen_addr: String,
    pub static_dir: PathBuf,
    pub data_dir: PathBuf,
    pub archive_url: String,
    pub converter_path: PathBuf,
    pub request_timeout: Duration,
    pub current_tries: u32,
    pub forecast_base_tries: u32,
    pub forecast_hour_tries: u32,
    pub max_age: Duration,
    pub clean_on_exit: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = match env_optional("EARTH_LISTEN_ADDR") {
            Some(addr) => addr,
            None => match env_optional("PORT") {
                Some(port) => format!("127.0.0.1:{port}"),
                None => DEFAULT_LISTEN_ADDR.to_string(),
            },
        };
        let static_dir = PathBuf::from(env_string("EARTH_STATIC_DIR", DEFAULT_STATIC_DIR));
        let data_dir = PathBuf::from(env_string("EARTH_DATA_DIR", DEFAULT_DATA_DIR));
        let archive_url = env_string("EARTH_ARCHIVE_URL", NOMADS_FILTER_URL)
            .trim()
            .trim_end_matches('/')
            .to_string();
        let converter_path =
            PathBuf::from(env_string("EARTH_CONVERTER_PATH", DEFAULT_CONVERTER_PATH));
        let request_timeout = Duration::from_secs(env_u64(
            "EARTH_REQUEST_TIMEOUT_SECONDS",
            DEFAULT_REQUEST_TIMEOUT_SECONDS,
        )?);
        let current_tries = env_u32("EARTH_CURRENT_TRIES", DEFAULT_CURRENT_TRIES)?;
        let forecast_base_tries = env_u32("EARTH_FORECAST_BASE_TRIES", DEFAULT_FORECAST_BASE_TRIES)?;
        let forecast_hour_tries = env_u32("EARTH_FORECAST_HOUR_TRIES", DEFAULT_FORECAST_HOUR_TRIES)?;
        let max_age =
            Duration::from_secs(env_u64("EARTH_MAX_AGE_HOURS", DEFAULT_MAX_AGE_HOURS)? * 3600);
        let clean_on_exit = env_bool("EARTH_CLEAN_ON_EXIT", true)?;

        Ok(Self {
            listen_addr,
            static_dir,
            data_dir,
            archive_url,
            converter_path,
            request_timeout,
            current_tries,
            forecast_base_tries,
            forecast_hour_tries,
            max_age,
            clean_on_exit,
        })
    }

    /// Root of the `weather/{YYYY}/{MM}/{DD}` cache tree.
    pub fn weather_dir(&self) -> PathBuf {
        self.data_dir.join(WEATHER_DIR)
    }
}

fn env_optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_string(name: &str, default: &str) -> String {
    env_optional(name).unwrap_or_else(|| default.to_string())
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match env_optional(name) {
        Some(value) => value
            .parse::<u64>()
            .with_context(|| format!("Failed to parse {}={} as u64", name, value)),
        None => Ok(default),
    }
}

fn env_u32(name: &str, default: u32) -> Result<u32> {
    match env_optional(name) {
        Some(value) => value
            .parse::<u32>()
            .with_context(|| format!("Failed to parse {}={} as u32", name, value)),
        None => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match env_optional(name) {
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("Failed to parse {}={} as bool", name, value),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests(data_dir: PathBuf) -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            static_dir: PathBuf::from(DEFAULT_STATIC_DIR),
            data_dir,
            archive_url: NOMADS_FILTER_URL.to_string(),
            converter_path: PathBuf::from(DEFAULT_CONVERTER_PATH),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
            current_tries: DEFAULT_CURRENT_TRIES,
            forecast_base_tries: DEFAULT_FORECAST_BASE_TRIES,
            forecast_hour_tries: DEFAULT_FORECAST_HOUR_TRIES,
            max_age: Duration::from_secs(DEFAULT_MAX_AGE_HOURS * 3600),
            clean_on_exit: false,
        }
    }
}
