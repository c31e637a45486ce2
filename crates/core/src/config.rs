use std::str::FromStr;
use std::time::Duration;

use crate::error::CoreError;

/// Fixed delay between a terminal disconnect and the next connection attempt.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;

/// Continuous dirty time before a silent autosave fires.
pub const DEFAULT_AUTOSAVE_MS: u64 = 30_000;

/// Path of the server-push endpoint, relative to the API base URL.
pub const DEFAULT_EVENTS_PATH: &str = "/api/events/stream";

/// Client configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base HTTP URL of the backend (default: `http://localhost:8000`).
    pub api_url: String,
    /// Push channel path (default: `/api/events/stream`).
    pub events_path: String,
    /// Delay before reconnecting a dropped push connection.
    pub reconnect_delay: Duration,
    /// Debounce interval of the autosave timer.
    pub autosave_interval: Duration,
    /// Compiler engine identifier sent with compile requests.
    pub compile_engine: String,
    /// Timeout applied to request/response HTTP calls (not the push stream).
    pub http_timeout: Duration,
}

impl ClientConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default                  |
    /// |----------------------------|--------------------------|
    /// | `QUIRE_API_URL`            | `http://localhost:8000`  |
    /// | `QUIRE_EVENTS_PATH`        | `/api/events/stream`     |
    /// | `QUIRE_RECONNECT_DELAY_MS` | `3000`                   |
    /// | `QUIRE_AUTOSAVE_MS`        | `30000`                  |
    /// | `QUIRE_COMPILE_ENGINE`     | `pdflatex`               |
    /// | `QUIRE_HTTP_TIMEOUT_SECS`  | `30`                     |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_url = lookup("QUIRE_API_URL")
            .unwrap_or_else(|| "http://localhost:8000".into())
            .trim_end_matches('/')
            .to_string();
        if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
            return Err(CoreError::Config {
                name: "QUIRE_API_URL",
                value: api_url,
                reason: "must start with http:// or https://".into(),
            });
        }

        let events_path =
            lookup("QUIRE_EVENTS_PATH").unwrap_or_else(|| DEFAULT_EVENTS_PATH.into());

        let reconnect_delay_ms: u64 = parse_var(
            &lookup,
            "QUIRE_RECONNECT_DELAY_MS",
            DEFAULT_RECONNECT_DELAY_MS,
        )?;
        let autosave_ms: u64 = parse_var(&lookup, "QUIRE_AUTOSAVE_MS", DEFAULT_AUTOSAVE_MS)?;
        let http_timeout_secs: u64 = parse_var(&lookup, "QUIRE_HTTP_TIMEOUT_SECS", 30)?;

        let compile_engine = lookup("QUIRE_COMPILE_ENGINE")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "pdflatex".into());

        Ok(Self {
            api_url,
            events_path,
            reconnect_delay: Duration::from_millis(reconnect_delay_ms),
            autosave_interval: Duration::from_millis(autosave_ms),
            compile_engine,
            http_timeout: Duration::from_secs(http_timeout_secs),
        })
    }

    /// Full URL of the push channel.
    pub fn events_url(&self) -> String {
        format!("{}{}", self.api_url, self.events_path)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".into(),
            events_path: DEFAULT_EVENTS_PATH.into(),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            autosave_interval: Duration::from_millis(DEFAULT_AUTOSAVE_MS),
            compile_engine: "pdflatex".into(),
            http_timeout: Duration::from_secs(30),
        }
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, CoreError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| CoreError::Config {
            name,
            value: raw,
            reason: e.to_string(),
        }),
    }
}
