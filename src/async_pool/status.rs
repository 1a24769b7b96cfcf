use std::fmt;

use chrono::{DateTime, Utc};
use serde_derive::Serialize;

use super::{config::PoolConfig, metrics::PoolMetrics, state::PoolState};

/// Point-in-time view of a pool, taken under the pool lock.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub taken_at: DateTime<Utc>,
    pub config: PoolConfig,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub generation: u64,
    pub shut_down: bool,
    pub metrics: PoolMetrics,
}

impl PoolStatus {
    pub(crate) fn capture<C>(config: &PoolConfig, state: &PoolState<C>) -> Self {
        Self {
            taken_at: Utc::now(),
            config: config.clone(),
            active_connections: state.active_count(),
            idle_connections: state.idle_count(),
            generation: state.generation(),
            shut_down: state.shutdown,
            metrics: state.metrics().clone(),
        }
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = &self.config;
        let metrics = &self.metrics;
        writeln!(f, "===CONFIGURATION================================================")?;
        row(f, "maxActive", config.max_active)?;
        row(f, "maxIdle", config.max_idle)?;
        row(f, "maxCheckoutTime", config.timeouts.checkout.as_millis())?;
        row(f, "timeToWait", config.timeouts.wait.as_millis())?;
        row(f, "pingEnabled", config.ping.enabled)?;
        row(f, "pingQuery", &config.ping.query)?;
        row(f, "pingNotUsedFor", config.ping.not_used_for.as_millis())?;
        writeln!(f, " ---STATUS-------------------------------------------------------")?;
        row(f, "takenAt", self.taken_at.to_rfc3339())?;
        row(f, "shutDown", self.shut_down)?;
        row(f, "generation", self.generation)?;
        row(f, "activeConnections", self.active_connections)?;
        row(f, "idleConnections", self.idle_connections)?;
        row(f, "requestCount", metrics.request_count)?;
        row(f, "averageRequestTime", metrics.average_request_time().as_millis())?;
        row(f, "averageCheckoutTime", metrics.average_checkout_time().as_millis())?;
        row(f, "claimedOverdue", metrics.claimed_overdue_count)?;
        row(
            f,
            "averageOverdueCheckoutTime",
            metrics.average_overdue_checkout_time().as_millis(),
        )?;
        row(f, "hadToWait", metrics.had_to_wait_count)?;
        row(f, "averageWaitTime", metrics.average_wait_time().as_millis())?;
        row(f, "badConnectionCount", metrics.bad_connection_count)?;
        write!(f, "================================================================")
    }
}

fn row(f: &mut fmt::Formatter<'_>, name: &str, value: impl fmt::Display) -> fmt::Result {
    writeln!(f, " {name:<31}{value}")
}
