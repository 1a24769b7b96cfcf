use std::time::Duration;

use serde_derive::Serialize;

use super::config::millis;

/// Counters describing how the pool has been used.
///
/// Only mutated under the pool lock; the pool hands out clones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    pub request_count: u64,
    #[serde(with = "millis")]
    pub accumulated_request_time: Duration,
    #[serde(with = "millis")]
    pub accumulated_checkout_time: Duration,
    pub claimed_overdue_count: u64,
    #[serde(with = "millis")]
    pub accumulated_overdue_checkout_time: Duration,
    pub had_to_wait_count: u64,
    #[serde(with = "millis")]
    pub accumulated_wait_time: Duration,
    pub bad_connection_count: u64,
}

impl PoolMetrics {
    pub fn average_request_time(&self) -> Duration {
        average(self.accumulated_request_time, self.request_count)
    }

    pub fn average_checkout_time(&self) -> Duration {
        average(self.accumulated_checkout_time, self.request_count)
    }

    pub fn average_overdue_checkout_time(&self) -> Duration {
        average(
            self.accumulated_overdue_checkout_time,
            self.claimed_overdue_count,
        )
    }

    pub fn average_wait_time(&self) -> Duration {
        average(self.accumulated_wait_time, self.had_to_wait_count)
    }

    pub(crate) fn record_request(&mut self, latency: Duration) {
        self.request_count += 1;
        self.accumulated_request_time += latency;
    }

    pub(crate) fn record_checkout(&mut self, held_for: Duration) {
        self.accumulated_checkout_time += held_for;
    }

    pub(crate) fn record_overdue_claim(&mut self, held_for: Duration) {
        self.claimed_overdue_count += 1;
        self.accumulated_overdue_checkout_time += held_for;
        self.accumulated_checkout_time += held_for;
    }

    pub(crate) fn record_had_to_wait(&mut self) {
        self.had_to_wait_count += 1;
    }

    pub(crate) fn record_wait(&mut self, waited: Duration) {
        self.accumulated_wait_time += waited;
    }

    pub(crate) fn record_bad_connection(&mut self) {
        self.bad_connection_count += 1;
    }
}

fn average(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / u128::from(count);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}
