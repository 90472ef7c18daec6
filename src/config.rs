//! Configuration management.
//!
//! All settings come from environment variables, read once at startup.
//! Nothing else in the crate touches `std::env`; tasks receive what they
//! need through `Dependencies` and the typed config structs.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::application::EngineSettings;
use crate::domain::services::decider::OrderPricing;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable '{0}' is not set")]
    MissingVariable(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Broker API key id (`APCA_API_KEY_ID`).
    pub api_key: String,
    /// Broker API secret (`APCA_API_SECRET_KEY`).
    pub api_secret: String,
    /// Broker REST base URL; a `paper-api` host selects paper trading.
    pub api_base_url: String,
    pub database_url: String,
    pub database_max_connections: u32,
    pub order_cooldown_seconds: u64,
    pub stale_order_threshold_minutes: i64,
    pub stuck_sell_timeout_seconds: i64,
    /// Log intents and cancel nothing instead of acting.
    pub dry_run: bool,
    /// Price limit buys 5% above the ask so test fixtures fill immediately.
    pub testing_mode: bool,
    pub log_level: String,
    pub health_port: u16,
    pub pid_file: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            api_key: required("APCA_API_KEY_ID")?,
            api_secret: required("APCA_API_SECRET_KEY")?,
            api_base_url: env_or("APCA_API_BASE_URL", "https://paper-api.alpaca.markets"),
            database_url: env_or("DATABASE_URL", "sqlite://data/ladder.db"),
            database_max_connections: parsed_env("DATABASE_MAX_CONNECTIONS", 8),
            order_cooldown_seconds: parsed_env("ORDER_COOLDOWN_SECONDS", 5),
            stale_order_threshold_minutes: parsed_env("STALE_ORDER_THRESHOLD_MINUTES", 5),
            stuck_sell_timeout_seconds: parsed_env("STUCK_SELL_TIMEOUT_SECONDS", 75),
            dry_run: bool_env("DRY_RUN", false),
            testing_mode: bool_env("TESTING_MODE", false),
            log_level: env_or("LOG_LEVEL", "info").to_lowercase(),
            health_port: parsed_env("HEALTH_PORT", 3000),
            pid_file: PathBuf::from(env_or("PID_FILE", "ladder.pid")),
        };
        Ok(config)
    }

    pub fn is_paper_trading(&self) -> bool {
        self.api_base_url.to_lowercase().contains("paper-api")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            order_cooldown: Duration::from_secs(self.order_cooldown_seconds),
            stale_order_threshold: chrono::Duration::minutes(self.stale_order_threshold_minutes),
            stuck_sell_timeout: chrono::Duration::seconds(self.stuck_sell_timeout_seconds),
            dry_run: self.dry_run,
            pricing: if self.testing_mode {
                OrderPricing::Aggressive
            } else {
                OrderPricing::Standard
            },
        }
    }

    /// Log the resolved configuration without credentials.
    pub fn log_summary(&self) {
        info!("=== DCA engine configuration ===");
        info!(
            "Trading mode: {}",
            if self.is_paper_trading() { "paper" } else { "LIVE" }
        );
        info!("Database: {}", self.database_url);
        info!("Order cooldown: {}s", self.order_cooldown_seconds);
        info!("Stale order threshold: {}m", self.stale_order_threshold_minutes);
        info!("Stuck sell timeout: {}s", self.stuck_sell_timeout_seconds);
        info!("Dry run: {}", self.dry_run);
        info!("Testing mode: {}", self.testing_mode);
        info!("Health port: {}", self.health_port);
        info!("================================");
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingVariable(key))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parsed_env<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn bool_env(key: &str, default: bool) -> bool {
    match std::env::var(key).map(|v| v.to_lowercase()) {
        Ok(v) if ["true", "1", "yes", "on"].contains(&v.as_str()) => true,
        Ok(v) if ["false", "0", "no", "off"].contains(&v.as_str()) => false,
        _ => default,
    }
}
