use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::{
    broker::{BrokerResult, Error},
    queue::QUEUE_MAX_LEN,
};

/// Broker tunables. Every field has a default; `from_env` overrides them
/// from `BURROW_*` variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub queue_max_len: usize,
    pub vhost: String,
    pub redial_base_delay_ms: u64,
    pub redial_max_delay_ms: u64,
    pub redial_jitter_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_max_len: QUEUE_MAX_LEN,
            vhost: "/".to_owned(),
            redial_base_delay_ms: 1_000,
            redial_max_delay_ms: 60_000,
            redial_jitter_ms: 250,
        }
    }
}

impl BrokerConfig {
    /// Loads `.env` when present, then reads the process environment.
    pub fn from_env() -> BrokerResult<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                warn!("Ignoring unreadable .env file: {e}");
            }
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> BrokerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parsed(&lookup, "BURROW_QUEUE_MAX_LEN")? {
            config.queue_max_len = v;
        }
        if let Some(v) = lookup("BURROW_VHOST") {
            config.vhost = v;
        }
        if let Some(v) = parsed(&lookup, "BURROW_REDIAL_BASE_DELAY_MS")? {
            config.redial_base_delay_ms = v;
        }
        if let Some(v) = parsed(&lookup, "BURROW_REDIAL_MAX_DELAY_MS")? {
            config.redial_max_delay_ms = v;
        }
        if let Some(v) = parsed(&lookup, "BURROW_REDIAL_JITTER_MS")? {
            config.redial_jitter_ms = v;
        }

        Ok(config)
    }

    pub fn redial_base_delay(&self) -> Duration {
        Duration::from_millis(self.redial_base_delay_ms)
    }

    pub fn redial_max_delay(&self) -> Duration {
        Duration::from_millis(self.redial_max_delay_ms)
    }

    pub fn redial_jitter(&self) -> Duration {
        Duration::from_millis(self.redial_jitter_ms)
    }
}

fn parsed<F, T>(lookup: &F, key: &str) -> BrokerResult<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.trim().parse() {
            Ok(value) => Ok(Some(value)),
            Err(_) => Err(Error::InvalidConfig {
                key: key.to_owned(),
                value: raw,
            }),
        },
    }
}
