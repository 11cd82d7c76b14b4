//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use chrono::Duration;
use deal_desk_core::settings::{
    KeywordSet, PipelineSettings, DEFAULT_ANALYSIS_COOLDOWN_MINUTES, DEFAULT_BODY_PREVIEW_LIMIT,
    DEFAULT_SLA_THRESHOLD_MINUTES,
};
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

/// `DATABASE_URL` value that selects the in-memory storage adapter.
pub const MEMORY_DATABASE_URL: &str = "memory:";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub log_filter: String,
    pub cors_origin: Option<String>,
    /// Take the client address from `x-forwarded-for`. Only safe behind a proxy that sets it.
    pub trust_forwarded_for: bool,
    pub openai_api_key: Option<String>,
    pub analysis_model: String,
    pub analysis_history_limit: usize,
    pub analysis_concurrency: usize,
    pub analysis_queue_capacity: usize,
    pub analysis_retry_interval_seconds: u64,
    pub webhook_verify_token: Option<String>,
    pub webhook_app_secret: Option<String>,
    /// Empty means the built-in keyword list.
    pub priority_keywords: Vec<String>,
    pub sla_threshold_minutes: i64,
    pub analysis_cooldown_minutes: i64,
    /// Lowercased. Seeded as supervisor accounts at startup.
    pub supervisor_emails: Vec<String>,
    /// Argon2 PHC string shared by the seeded supervisor accounts.
    pub supervisor_password_hash: Option<String>,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Re-reads the environment for a running process.
    ///
    /// Unlike `from_env`, values in `.env` replace variables already present, so an
    /// edited file takes effect. A missing `.env` is not an error.
    pub fn reload_from_env() -> Result<Self, ConfigError> {
        Self::reload(dotenvy::dotenv_override().map(|_| ()))
    }

    /// Like `reload_from_env`, reading the given env file.
    pub fn reload_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::reload(dotenvy::from_path_override(path))
    }

    fn reload(loaded: Result<(), dotenvy::Error>) -> Result<Self, ConfigError> {
        match loaded {
            Err(e) if !e.not_found() => {
                return Err(ConfigError::InvalidValue(".env".to_string(), e.to_string()))
            }
            _ => {}
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        // --- Server and Database ---
        let bind_address = parse_or(&var, "BIND_ADDRESS", "0.0.0.0:3000".parse::<SocketAddr>())?;
        let database_url =
            var("DATABASE_URL").ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;
        let log_filter = var("RUST_LOG").unwrap_or_else(|| "info".to_string());
        let cors_origin = var("CORS_ORIGIN");
        let trust_forwarded_for = parse_or(&var, "TRUST_FORWARDED_FOR", Ok(false))?;

        // --- AI Analysis ---
        let openai_api_key = var("OPENAI_API_KEY");
        let analysis_model = var("ANALYSIS_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());
        let analysis_history_limit = parse_or(&var, "ANALYSIS_HISTORY_LIMIT", Ok(20usize))?;
        let analysis_concurrency = parse_or(&var, "ANALYSIS_CONCURRENCY", Ok(4usize))?.max(1);
        let analysis_queue_capacity = parse_or(&var, "ANALYSIS_QUEUE_CAPACITY", Ok(256usize))?.max(1);
        let analysis_retry_interval_seconds =
            parse_or(&var, "ANALYSIS_RETRY_INTERVAL_SECONDS", Ok(300u64))?.max(1);

        // --- Webhook Pipeline ---
        let webhook_verify_token = var("WEBHOOK_VERIFY_TOKEN");
        let webhook_app_secret = var("WEBHOOK_APP_SECRET");
        let priority_keywords = var("PRIORITY_KEYWORDS")
            .map(|raw| split_list(&raw))
            .unwrap_or_default();
        let sla_threshold_minutes =
            parse_or(&var, "SLA_THRESHOLD_MINUTES", Ok(DEFAULT_SLA_THRESHOLD_MINUTES))?;
        let analysis_cooldown_minutes =
            parse_or(&var, "ANALYSIS_COOLDOWN_MINUTES", Ok(DEFAULT_ANALYSIS_COOLDOWN_MINUTES))?;
        if sla_threshold_minutes < 0 || analysis_cooldown_minutes < 0 {
            return Err(ConfigError::InvalidValue(
                "SLA_THRESHOLD_MINUTES/ANALYSIS_COOLDOWN_MINUTES".to_string(),
                "durations must not be negative".to_string(),
            ));
        }

        let supervisor_emails = var("SUPERVISOR_EMAILS")
            .map(|raw| split_list(&raw).into_iter().map(|e| e.to_lowercase()).collect())
            .unwrap_or_default();
        let supervisor_password_hash = var("SUPERVISOR_PASSWORD_HASH");

        Ok(Self {
            bind_address,
            database_url,
            log_filter,
            cors_origin,
            trust_forwarded_for,
            openai_api_key,
            analysis_model,
            analysis_history_limit,
            analysis_concurrency,
            analysis_queue_capacity,
            analysis_retry_interval_seconds,
            webhook_verify_token,
            webhook_app_secret,
            priority_keywords,
            sla_threshold_minutes,
            analysis_cooldown_minutes,
            supervisor_emails,
            supervisor_password_hash,
        })
    }

    pub fn uses_memory_storage(&self) -> bool {
        self.database_url == MEMORY_DATABASE_URL
    }

    /// Compiles the immutable settings snapshot the pipeline and engine read.
    pub fn pipeline_settings(&self) -> Result<PipelineSettings, ConfigError> {
        let invalid = |e: regex::Error| ConfigError::InvalidValue("PRIORITY_KEYWORDS".to_string(), e.to_string());
        let priority_keywords = if self.priority_keywords.is_empty() {
            KeywordSet::with_defaults().map_err(invalid)?
        } else {
            KeywordSet::new(&self.priority_keywords).map_err(invalid)?
        };
        Ok(PipelineSettings {
            verify_token: self.webhook_verify_token.clone(),
            app_secret: self.webhook_app_secret.clone(),
            priority_keywords,
            sla_threshold: Duration::minutes(self.sla_threshold_minutes),
            analysis_cooldown: Duration::minutes(self.analysis_cooldown_minutes),
            body_preview_limit: DEFAULT_BODY_PREVIEW_LIMIT,
        })
    }
}

fn parse_or<T, V>(var: &V, key: &str, default: Result<T, <T as FromStr>::Err>) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    let parsed = match var(key) {
        Some(raw) => raw.parse::<T>(),
        None => default,
    };
    parsed.map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string()))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_the_database_is_set() {
        let config = config_from(&[("DATABASE_URL", "memory:")]).expect("config");
        assert!(config.uses_memory_storage());
        assert_eq!(config.sla_threshold_minutes, 30);
        assert_eq!(config.analysis_cooldown_minutes, 15);
        assert_eq!(config.analysis_concurrency, 4);
        assert!(config.webhook_app_secret.is_none());
        assert!(!config.trust_forwarded_for);
        let settings = config.pipeline_settings().expect("settings");
        assert!(settings.priority_keywords.is_match("сколько стоит?"));
    }

    #[test]
    fn missing_database_url_is_reported() {
        assert!(matches!(
            config_from(&[]),
            Err(ConfigError::MissingVar(var)) if var == "DATABASE_URL"
        ));
    }

    #[test]
    fn lists_are_split_and_trimmed() {
        let config = config_from(&[
            ("DATABASE_URL", "memory:"),
            ("PRIORITY_KEYWORDS", " urgent , asap ,,"),
            ("SUPERVISOR_EMAILS", "Lead@Example.com"),
        ])
        .expect("config");
        assert_eq!(config.priority_keywords, vec!["urgent", "asap"]);
        assert_eq!(config.supervisor_emails, vec!["lead@example.com"]);
        let settings = config.pipeline_settings().expect("settings");
        assert!(settings.priority_keywords.is_match("ASAP please"));
        assert!(!settings.priority_keywords.is_match("сколько стоит"));
    }

    #[test]
    fn malformed_numbers_name_the_variable() {
        let err = config_from(&[("DATABASE_URL", "memory:"), ("SLA_THRESHOLD_MINUTES", "soon")])
            .expect_err("should fail");
        assert!(err.to_string().contains("SLA_THRESHOLD_MINUTES"));
    }

    #[test]
    fn reload_picks_up_an_edited_env_file() {
        let path = std::env::temp_dir().join(format!("deal-desk-{}.env", uuid::Uuid::new_v4()));
        let write = |secret: &str| {
            std::fs::write(
                &path,
                format!("DATABASE_URL=memory:\nWEBHOOK_APP_SECRET={}\n", secret),
            )
            .expect("write env file")
        };

        write("first");
        let boot = Config::reload_from_path(&path).expect("boot config");
        assert_eq!(boot.webhook_app_secret.as_deref(), Some("first"));

        write("rotated");
        let reloaded = Config::reload_from_path(&path).expect("reloaded config");
        assert_eq!(reloaded.webhook_app_secret.as_deref(), Some("rotated"));
        let settings = reloaded.pipeline_settings().expect("settings");
        assert_eq!(settings.app_secret.as_deref(), Some("rotated"));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn reload_reports_a_malformed_env_file() {
        let path = std::env::temp_dir().join(format!("deal-desk-{}.env", uuid::Uuid::new_v4()));
        std::fs::write(&path, "NOT A VALID LINE\n").expect("write env file");
        let err = Config::reload_from_path(&path).expect_err("should fail");
        assert!(err.to_string().contains(".env"));
        std::fs::remove_file(&path).ok();
    }
}
