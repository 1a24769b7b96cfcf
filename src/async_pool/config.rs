use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use super::error::{PoolError, Result};

pub const DEFAULT_PING_QUERY: &str = "NO PING QUERY SET";

/// Pool limits and timeouts.
///
/// Deserializes from the flat option set used by data source descriptions
/// (`maxActive`, `maxIdle`, `maxCheckoutTime`, `timeToWait`, `pingEnabled`,
/// `pingQuery`, `pingNotUsedFor`, ...). Durations are written in milliseconds
/// and any missing option falls back to its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[non_exhaustive]
pub struct PoolConfig {
    pub max_active: usize,
    pub max_idle: usize,
    /// Consecutive bad connections tolerated beyond `max_idle` before
    /// `acquire` gives up.
    pub bad_connection_tolerance: u32,
    #[serde(flatten)]
    pub timeouts: Timeouts,
    #[serde(flatten)]
    pub ping: PingConfig,
}

impl PoolConfig {
    pub fn new(max_active: usize, max_idle: usize) -> Self {
        Self {
            max_active,
            max_idle,
            ..Self::default()
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_ping(mut self, ping: PingConfig) -> Self {
        self.ping = ping;
        self
    }

    pub fn with_bad_connection_tolerance(mut self, tolerance: u32) -> Self {
        self.bad_connection_tolerance = tolerance;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_active == 0 {
            return Err(PoolError::InvalidConfig(
                "maxActive must be greater than 0".into(),
            ));
        }
        if self.ping.enabled && self.ping.query.trim().is_empty() {
            return Err(PoolError::InvalidConfig(
                "pingEnabled requires a pingQuery".into(),
            ));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: 10,
            max_idle: 5,
            bad_connection_tolerance: 3,
            timeouts: Timeouts::default(),
            ping: PingConfig::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timeouts {
    /// Checkout age after which an active connection may be reclaimed.
    #[serde(rename = "maxCheckoutTime", with = "millis")]
    pub checkout: Duration,
    /// Longest time `acquire` blocks waiting for a free connection.
    #[serde(rename = "timeToWait", with = "millis")]
    pub wait: Duration,
    #[serde(rename = "connectTimeout", with = "millis")]
    pub connect: Duration,
}

impl Timeouts {
    pub fn with_checkout(mut self, checkout: Option<Duration>) -> Self {
        self.checkout = checkout.unwrap_or(Duration::from_secs(20));
        self
    }

    pub fn with_wait(mut self, wait: Option<Duration>) -> Self {
        self.wait = wait.unwrap_or(Duration::from_secs(20));
        self
    }

    pub fn with_connect(mut self, connect: Option<Duration>) -> Self {
        self.connect = connect.unwrap_or(Duration::from_secs(10));
        self
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            checkout: Duration::from_secs(20),
            wait: Duration::from_secs(20),
            connect: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    #[serde(rename = "pingEnabled")]
    pub enabled: bool,
    #[serde(rename = "pingQuery")]
    pub query: String,
    /// Idle time after which a reused connection is pinged first.
    #[serde(rename = "pingNotUsedFor", with = "millis")]
    pub not_used_for: Duration,
}

impl PingConfig {
    pub fn enabled(query: impl Into<String>, not_used_for: Duration) -> Self {
        Self {
            enabled: true,
            query: query.into(),
            not_used_for,
        }
    }

    pub(crate) fn is_due(&self, idle_for: Duration) -> bool {
        self.enabled && idle_for > self.not_used_for
    }
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            query: DEFAULT_PING_QUERY.to_string(),
            not_used_for: Duration::ZERO,
        }
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
