//! Engine settings.
//!
//! Defaults suit a local paper session. Every field can be overridden through
//! `REPLICATOR_*` environment variables (a `.env` file is honoured).

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::broker::FillReporting;

const ENV_PREFIX: &str = "REPLICATOR_";

/// Runtime settings for one slave terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Slave account this process trades for
    pub account_id: String,

    /// Timer tick period (milliseconds)
    pub tick_interval_ms: u64,

    /// Heartbeat period (seconds)
    pub heartbeat_interval_secs: u64,

    /// Fixed delay between broker retry attempts (milliseconds)
    pub retry_delay_ms: u64,

    /// Upper bound on frames drained in one tick
    pub max_messages_per_tick: usize,

    /// How the terminal reports pending-order fills
    pub fill_reporting: FillReporting,

    /// Reported in heartbeats
    pub version: String,

    /// Reported in heartbeats
    pub platform: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            account_id: "SLAVE1".to_string(),
            tick_interval_ms: 100,         // 10 ticks per second
            heartbeat_interval_secs: 1,
            retry_delay_ms: 500,
            max_messages_per_tick: 100,
            fill_reporting: FillReporting::Polling,
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: "paper".to_string(),
        }
    }
}

impl EngineSettings {
    /// Defaults overridden by the environment.
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        if let Some(account) = read("ACCOUNT_ID") {
            settings.account_id = account;
        }
        if let Some(v) = parse("TICK_INTERVAL_MS")? {
            settings.tick_interval_ms = v;
        }
        if let Some(v) = parse("HEARTBEAT_INTERVAL_SECS")? {
            settings.heartbeat_interval_secs = v;
        }
        if let Some(v) = parse("RETRY_DELAY_MS")? {
            settings.retry_delay_ms = v;
        }
        if let Some(v) = parse("MAX_MESSAGES_PER_TICK")? {
            settings.max_messages_per_tick = v;
        }
        if let Some(v) = read("FILL_REPORTING") {
            settings.fill_reporting = parse_fill_reporting(&v)?;
        }
        if let Some(platform) = read("PLATFORM") {
            settings.platform = platform;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.account_id.trim().is_empty() || self.account_id.contains(' ') {
            return Err(anyhow!("account id must be non-empty and contain no spaces"));
        }
        if self.tick_interval_ms == 0 {
            return Err(anyhow!("tick interval must be positive"));
        }
        if self.max_messages_per_tick == 0 {
            return Err(anyhow!("max messages per tick must be positive"));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

pub fn parse_fill_reporting(value: &str) -> Result<FillReporting> {
    match value.trim().to_lowercase().as_str() {
        "events" | "event" => Ok(FillReporting::Events),
        "polling" | "poll" => Ok(FillReporting::Polling),
        other => Err(anyhow!("unknown fill reporting mode: {}", other)),
    }
}

fn read(key: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, key))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    read(key)
        .map(|v| {
            v.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid {}{}", ENV_PREFIX, key))
        })
        .transpose()
}
