use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::rate_limit::RateLimitConfig;

/// Hard ceiling on `limit` for message pages, whatever the caller or env asks for.
pub const MAX_PAGE_LIMIT: u32 = 200;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("JWT_SECRET must be at least 32 characters long")]
    WeakSecret,
}

/// Tunables of the conversation service itself, independent of the HTTP layer.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub store_timeout: Duration,
    pub default_page_limit: u32,
    pub subscriber_queue: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self { store_timeout: Duration::from_millis(5000), default_page_limit: 50, subscriber_queue: 64 }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind: String,
    pub database_url: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub directory_file: Option<PathBuf>,
    pub notify_webhook: Option<String>,
    pub frontend_url: String,
    pub service: ServiceSettings,
    pub rate_limits: RateLimitConfig,
}

fn opt_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    opt_env(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        // only validated here; the auth extractor reads the secret itself
        let jwt_secret = opt_env("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;
        if jwt_secret.len() < 32 {
            return Err(ConfigError::WeakSecret);
        }
        let defaults = RateLimitConfig::default();
        Ok(Self {
            bind: opt_env("CONVO_BIND").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            database_url: opt_env("DATABASE_URL"),
            data_dir: opt_env("CONVO_DATA_DIR").map(PathBuf::from),
            directory_file: opt_env("CONVO_DIRECTORY_FILE").map(PathBuf::from),
            notify_webhook: opt_env("CONVO_NOTIFY_WEBHOOK"),
            frontend_url: opt_env("FRONTEND_URL").unwrap_or_else(|| "http://localhost:5173".to_string()),
            service: ServiceSettings {
                store_timeout: Duration::from_millis(parsed_env("CONVO_STORE_TIMEOUT_MS", 5000)),
                default_page_limit: parsed_env("CONVO_PAGE_LIMIT", 50u32).clamp(1, MAX_PAGE_LIMIT),
                subscriber_queue: parsed_env("CONVO_SUBSCRIBER_QUEUE", 64usize).max(1),
            },
            rate_limits: RateLimitConfig {
                message_limit: parsed_env("RL_MESSAGE_LIMIT", defaults.message_limit),
                message_window: Duration::from_secs(parsed_env("RL_MESSAGE_WINDOW", defaults.message_window.as_secs())),
                thread_limit: parsed_env("RL_THREAD_LIMIT", defaults.thread_limit),
                thread_window: Duration::from_secs(parsed_env("RL_THREAD_WINDOW", defaults.thread_window.as_secs())),
            },
        })
    }
}
