// File: ./src/config.rs
// Handles configuration loading, saving, validation and defaults.
use crate::context::AppContext;
use crate::subscription::SubscriptionPolicy;
use anyhow::{Error, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_graph_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_scopes() -> Vec<String> {
    vec!["Calendars.Read".to_string()]
}

fn default_lifetime() -> u64 {
    60
}
fn default_handicap() -> u64 {
    3
}

fn default_token_refresh_interval() -> u32 {
    10
}

fn default_refresh_interval() -> u32 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_initial_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    30_000
}

/// Backoff used by the real-time channel between connection attempts.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms))
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Config {
    #[serde(default = "default_graph_url")]
    pub graph_url: String,
    /// WebSocket endpoint of the notification server.
    #[serde(default)]
    pub channel_url: String,
    /// Public URL the backend posts change notifications to.
    #[serde(default)]
    pub notification_url: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    /// Shell command printing a fresh access token on stdout.
    #[serde(default)]
    pub token_command: Option<String>,
    #[serde(default = "default_lifetime")]
    pub subscription_lifetime_secs: u64,
    #[serde(default = "default_handicap")]
    pub renewal_handicap_secs: u64,
    #[serde(default = "default_token_refresh_interval")]
    pub token_refresh_interval_mins: u32,
    /// 0 disables the periodic full refresh.
    #[serde(default = "default_refresh_interval")]
    pub auto_refresh_interval_mins: u32,
    #[serde(default)]
    pub default_calendars: Vec<String>,
    #[serde(default)]
    pub select_all_on_start: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            graph_url: default_graph_url(),
            channel_url: String::new(),
            notification_url: String::new(),
            user_id: String::new(),
            scopes: default_scopes(),
            access_token: None,
            token_command: None,
            subscription_lifetime_secs: 60,
            renewal_handicap_secs: 3,
            token_refresh_interval_mins: 10,
            auto_refresh_interval_mins: 30,
            default_calendars: Vec::new(),
            select_all_on_start: false,
            log_level: default_log_level(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Config {
    /// Load the configuration from disk using an explicit context.
    /// Returns a contextualized error if reading, parsing or validation fails.
    pub fn load(ctx: &dyn AppContext) -> Result<Self> {
        let path = ctx.config_file()?;

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found"));
        }

        let contents = fs::read_to_string(&path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;

        let config: Config = toml::from_str(&contents).map_err(|e| {
            anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e)
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Helper to detect whether an anyhow::Error indicates that the config file was missing.
    pub fn is_missing_config_error(err: &Error) -> bool {
        if err.to_string().contains("Config file not found") {
            return true;
        }

        for cause in err.chain() {
            if let Some(io_err) = cause.downcast_ref::<std::io::Error>()
                && io_err.kind() == std::io::ErrorKind::NotFound
            {
                return true;
            }
        }

        false
    }

    pub fn validate(&self) -> Result<()> {
        if self.subscription_lifetime_secs == 0 {
            anyhow::bail!("subscription_lifetime_secs must be positive");
        }
        if self.renewal_handicap_secs >= self.subscription_lifetime_secs {
            anyhow::bail!(
                "renewal_handicap_secs ({}) must be smaller than subscription_lifetime_secs ({})",
                self.renewal_handicap_secs,
                self.subscription_lifetime_secs
            );
        }
        if self.token_refresh_interval_mins == 0 {
            anyhow::bail!("token_refresh_interval_mins must be positive");
        }
        Ok(())
    }

    /// Save configuration using an explicit context.
    pub fn save(&self, ctx: &dyn AppContext) -> Result<()> {
        let path = ctx.config_file()?;
        with_lock(&path, || {
            let toml_str = toml::to_string_pretty(self)?;
            atomic_write(&path, toml_str)?;
            Ok(())
        })?;
        Ok(())
    }

    /// Get the path string using an explicit context.
    pub fn get_path_string(ctx: &dyn AppContext) -> Result<String> {
        let path = ctx.config_file()?;
        Ok(path.to_string_lossy().to_string())
    }

    pub fn subscription_policy(&self) -> SubscriptionPolicy {
        SubscriptionPolicy::new(
            chrono::Duration::seconds(self.subscription_lifetime_secs as i64),
            chrono::Duration::seconds(self.renewal_handicap_secs as i64),
            self.notification_url.clone(),
        )
    }

    pub fn token_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.token_refresh_interval_mins as u64 * 60)
    }

    pub fn auto_refresh_interval(&self) -> Option<Duration> {
        (self.auto_refresh_interval_mins > 0)
            .then(|| Duration::from_secs(self.auto_refresh_interval_mins as u64 * 60))
    }

    pub fn log_level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

fn lock_path(file_path: &Path) -> PathBuf {
    let mut p = file_path.to_path_buf();
    p.set_extension("lock");
    p
}

fn with_lock<F, T>(file_path: &Path, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path(file_path))?;

    file.lock_exclusive()?;
    let result = f();
    file.unlock()?;
    result
}

/// Atomic write: Write to .tmp file then rename
fn atomic_write<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, contents: C) -> Result<()> {
    let path = path.as_ref();
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)?;
    fs::rename(tmp_path, path)?;
    Ok(())
}
