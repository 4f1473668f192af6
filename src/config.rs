//! Runtime configuration.
//!
//! Values come from `CATALYST_*` environment variables first, then from the
//! OS credential store for the terminal identity. The API key may be a
//! terminal connection string (base64 JSON with `url`, `key` and `tid`), in
//! which case the admin URL and terminal id are taken from it when not set
//! explicitly.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::api;
use crate::credentials::{self, KEY_ADMIN_URL, KEY_API_KEY, KEY_TERMINAL_ID};
use crate::error::ConfigError;
use crate::service::ServiceOptions;

pub const ENV_DATA_DIR: &str = "CATALYST_DATA_DIR";
pub const ENV_ADMIN_URL: &str = "CATALYST_ADMIN_URL";
pub const ENV_API_KEY: &str = "CATALYST_API_KEY";
pub const ENV_TERMINAL_ID: &str = "CATALYST_TERMINAL_ID";
pub const ENV_CASHIER_ID: &str = "CATALYST_CASHIER_ID";
pub const ENV_SYNC_INTERVAL: &str = "CATALYST_SYNC_INTERVAL_SECS";
pub const ENV_SUBMIT_TIMEOUT: &str = "CATALYST_SUBMIT_TIMEOUT_SECS";
pub const ENV_HEALTH_INTERVAL: &str = "CATALYST_HEALTH_INTERVAL_SECS";
pub const ENV_MAX_BACKOFF: &str = "CATALYST_MAX_BACKOFF_SECS";
pub const ENV_LOG_JSON: &str = "CATALYST_LOG_JSON";

const APP_DIR_NAME: &str = "catalyst-sync";
const DEFAULT_CASHIER_ID: &str = "terminal";

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 10;
const DEFAULT_SUBMIT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 15;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 300;

#[derive(Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub admin_url: Option<String>,
    pub api_key: Option<Zeroizing<String>>,
    pub terminal_id: Option<String>,
    /// Cashier the headless binary drains under.
    pub cashier_id: String,
    pub sync_interval: Duration,
    pub submit_timeout: Duration,
    pub health_interval: Duration,
    pub max_backoff: Duration,
    pub log_json: bool,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("data_dir", &self.data_dir)
            .field("admin_url", &self.admin_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("terminal_id", &self.terminal_id)
            .field("cashier_id", &self.cashier_id)
            .field("sync_interval", &self.sync_interval)
            .field("submit_timeout", &self.submit_timeout)
            .field("health_interval", &self.health_interval)
            .field("max_backoff", &self.max_backoff)
            .field("log_json", &self.log_json)
            .finish()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_secs<E>(env: &E, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    match non_empty(env(key)) {
        None => Ok(Duration::from_secs(default)),
        Some(raw) => match raw.parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
            _ => Err(ConfigError::InvalidNumber { key, value: raw }),
        },
    }
}

fn parse_flag<E>(env: &E, key: &str) -> bool
where
    E: Fn(&str) -> Option<String>,
{
    non_empty(env(key))
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

/// `$CATALYST_DATA_DIR`, else the platform data directory.
fn resolve_data_dir<E>(env: &E) -> Result<PathBuf, ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    if let Some(dir) = non_empty(env(ENV_DATA_DIR)) {
        return Ok(PathBuf::from(dir));
    }
    let base = non_empty(env("LOCALAPPDATA"))
        .or_else(|| non_empty(env("XDG_DATA_HOME")))
        .map(PathBuf::from)
        .or_else(|| {
            non_empty(env("HOME")).map(|home| PathBuf::from(home).join(".local").join("share"))
        })
        .ok_or(ConfigError::NoDataDir)?;
    Ok(base.join(APP_DIR_NAME))
}

impl SyncConfig {
    /// Process environment with the OS credential store as fallback.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_sources(|key| std::env::var(key).ok(), credentials::get_credential)
    }

    /// Resolve from explicit lookups. `env` maps variable names, `stored`
    /// maps credential-store keys.
    pub fn from_sources<E, C>(env: E, stored: C) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
        C: Fn(&str) -> Option<String>,
    {
        let raw_api_key = non_empty(env(ENV_API_KEY)).or_else(|| non_empty(stored(KEY_API_KEY)));

        let admin_url = non_empty(env(ENV_ADMIN_URL))
            .or_else(|| non_empty(stored(KEY_ADMIN_URL)))
            .map(|url| api::normalize_admin_url(&url))
            .or_else(|| {
                raw_api_key
                    .as_deref()
                    .and_then(api::extract_admin_url_from_connection_string)
            });
        let terminal_id = non_empty(env(ENV_TERMINAL_ID))
            .or_else(|| non_empty(stored(KEY_TERMINAL_ID)))
            .or_else(|| {
                raw_api_key
                    .as_deref()
                    .and_then(api::extract_terminal_id_from_connection_string)
            });
        let api_key = raw_api_key.map(|raw| {
            let key =
                api::extract_api_key_from_connection_string(&raw).unwrap_or_else(|| raw.clone());
            Zeroizing::new(key)
        });

        Ok(Self {
            data_dir: resolve_data_dir(&env)?,
            admin_url,
            api_key,
            terminal_id,
            cashier_id: non_empty(env(ENV_CASHIER_ID))
                .unwrap_or_else(|| DEFAULT_CASHIER_ID.to_string()),
            sync_interval: parse_secs(&env, ENV_SYNC_INTERVAL, DEFAULT_SYNC_INTERVAL_SECS)?,
            submit_timeout: parse_secs(&env, ENV_SUBMIT_TIMEOUT, DEFAULT_SUBMIT_TIMEOUT_SECS)?,
            health_interval: parse_secs(&env, ENV_HEALTH_INTERVAL, DEFAULT_HEALTH_INTERVAL_SECS)?,
            max_backoff: parse_secs(&env, ENV_MAX_BACKOFF, DEFAULT_MAX_BACKOFF_SECS)?,
            log_json: parse_flag(&env, ENV_LOG_JSON),
        })
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            sync_interval: self.sync_interval,
            max_backoff: self.max_backoff,
        }
    }

    /// Admin URL and API key, both required to talk to the backend.
    pub fn remote(&self) -> Result<(&str, Zeroizing<String>), ConfigError> {
        let url = self.admin_url.as_deref().ok_or(ConfigError::Missing(ENV_ADMIN_URL))?;
        let key = self.api_key.clone().ok_or(ConfigError::Missing(ENV_API_KEY))?;
        Ok((url, key))
    }
}
