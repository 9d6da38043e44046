// File: src/token.rs
// Access token sources for the calendar backend and the real-time channel.
use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

pub const TOKEN_ENV_VAR: &str = "ROOMCAL_ACCESS_TOKEN";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub access_token: String,
    pub acquired_at: DateTime<Utc>,
}

impl Token {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            acquired_at: Utc::now(),
        }
    }
}

/// Supplies bearer tokens for the given scopes.
///
/// `force_refresh` bypasses any cached value. Returns `AuthExpired` when no
/// token can be obtained without an interactive login.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self, scopes: &[String], force_refresh: bool) -> SyncResult<Token>;
}

/// Token taken from the config file or the `ROOMCAL_ACCESS_TOKEN` variable.
///
/// A forced refresh re-reads the environment, so an external helper can
/// rotate the token without restarting the process.
#[derive(Debug)]
pub struct StaticTokenProvider {
    configured: Option<String>,
    current: Mutex<Option<String>>,
}

impl StaticTokenProvider {
    pub fn new(configured: Option<String>) -> Self {
        let configured = configured.filter(|t| !t.trim().is_empty());
        Self {
            current: Mutex::new(configured.clone()),
            configured,
        }
    }

    fn from_env() -> Option<String> {
        std::env::var(TOKEN_ENV_VAR)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self, _scopes: &[String], force_refresh: bool) -> SyncResult<Token> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| SyncError::AuthExpired("token cache poisoned".to_string()))?;

        if force_refresh || current.is_none() {
            if let Some(fresh) = Self::from_env() {
                *current = Some(fresh);
            } else if current.is_none() {
                *current = self.configured.clone();
            }
        }

        current
            .clone()
            .map(Token::new)
            .ok_or_else(|| SyncError::AuthExpired(format!("no access token; set {}", TOKEN_ENV_VAR)))
    }
}

/// Runs a shell command and uses its trimmed stdout as the token.
#[derive(Debug)]
pub struct CommandTokenProvider {
    command: String,
    cached: tokio::sync::Mutex<Option<Token>>,
}

impl CommandTokenProvider {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cached: tokio::sync::Mutex::new(None),
        }
    }

    async fn run(&self, scopes: &[String]) -> SyncResult<Token> {
        log::debug!("Running token command");
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("ROOMCAL_SCOPES", scopes.join(" "))
            .output()
            .await
            .map_err(|e| SyncError::AuthExpired(format!("token command failed to start: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::AuthExpired(format!(
                "token command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(SyncError::AuthExpired(
                "token command printed nothing".to_string(),
            ));
        }
        Ok(Token::new(token))
    }
}

#[async_trait]
impl TokenProvider for CommandTokenProvider {
    async fn get_token(&self, scopes: &[String], force_refresh: bool) -> SyncResult<Token> {
        let mut cached = self.cached.lock().await;
        if !force_refresh && let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }
        let token = self.run(scopes).await?;
        *cached = Some(token.clone());
        Ok(token)
    }
}

/// Picks the provider the config asks for: a command wins over a static token.
pub fn provider_from_config(config: &Config) -> Arc<dyn TokenProvider> {
    match config.token_command.as_deref().map(str::trim) {
        Some(cmd) if !cmd.is_empty() => Arc::new(CommandTokenProvider::new(cmd)),
        _ => Arc::new(StaticTokenProvider::new(config.access_token.clone())),
    }
}
