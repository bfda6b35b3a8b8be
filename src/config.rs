use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default config file path.
pub const CONFIG_PATH: &str = "config.toml";

/// Top-level application config deserialized from `config.toml`.
///
/// `DATABASE_URL` and `DISCORD_TOKEN` environment variables, when set,
/// override the corresponding file values so secrets can stay in `.env`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub discord: DiscordConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
}

/// Storage backend connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres connection URL.
    pub url: String,
}

/// Discord delivery credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    /// Bot token used for REST message creation.
    pub bot_token: String,
}

/// Runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Polling interval in seconds between marketplace sweeps.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// When the watermark is persisted relative to notification dispatch.
    #[serde(default)]
    pub watermark_advance: WatermarkAdvance,
}

/// Watermark persistence strategy, which determines the delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatermarkAdvance {
    /// Persist once after the whole batch is dispatched. A failure partway
    /// through re-notifies the already-sent listings next cycle
    /// (at-least-once).
    #[default]
    AfterBatch,
    /// Persist after every successful dispatch. Duplicates become
    /// impossible, but listings older than a later one that was already
    /// dispatched can be lost if a send fails (at-most-once).
    PerListing,
}

fn default_poll_interval() -> u64 {
    30
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            watermark_advance: WatermarkAdvance::default(),
        }
    }
}

impl AppConfig {
    /// Load config from the given TOML file path, then apply environment
    /// overrides for secrets.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(token) = std::env::var("DISCORD_TOKEN") {
            config.discord.bot_token = token;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let raw = r#"
            [database]
            url = "postgres://bot:pw@localhost/mercari"

            [discord]
            bot_token = "abc123"
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.database.url, "postgres://bot:pw@localhost/mercari");
        assert_eq!(config.discord.bot_token, "abc123");
        assert_eq!(config.settings.poll_interval_secs, 30);
        assert_eq!(
            config.settings.watermark_advance,
            WatermarkAdvance::AfterBatch
        );
    }

    #[test]
    fn parse_settings_overrides() {
        let raw = r#"
            [database]
            url = "postgres://localhost/db"

            [discord]
            bot_token = "t"

            [settings]
            poll_interval_secs = 10
            watermark_advance = "per-listing"
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.settings.poll_interval_secs, 10);
        assert_eq!(
            config.settings.watermark_advance,
            WatermarkAdvance::PerListing
        );
    }
}
