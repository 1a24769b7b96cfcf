use std::{sync::Arc, time::Duration};

use tokio::time::Instant;

use super::{
    connection::{ActiveConnection, IdleConnection, Lease},
    metrics::PoolMetrics,
};

/// Who holds what. Guarded by the pool lock as a whole.
///
/// Connections being created, pinged or rolled back outside the lock are not
/// stored here but are counted in `in_flight`, which reserves their slot
/// against `max_active`.
#[non_exhaustive]
pub struct PoolState<C> {
    pub(crate) idle: Vec<IdleConnection<C>>,
    pub(crate) active: Vec<ActiveConnection<C>>,
    pub(crate) in_flight: usize,
    pub(crate) generation: u64,
    pub(crate) type_code: u64,
    pub(crate) shutdown: bool,
    pub(crate) metrics: PoolMetrics,
    next_id: u64,
}

impl<C> PoolState<C> {
    pub fn new(type_code: u64) -> Self {
        Self {
            idle: Vec::new(),
            active: Vec::new(),
            in_flight: 0,
            generation: 0,
            type_code,
            shutdown: false,
            metrics: PoolMetrics::default(),
            next_id: 0,
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a brand new connection may be opened without exceeding
    /// `max_active`.
    pub(crate) fn has_capacity(&self, max_active: usize) -> bool {
        self.active.len() + self.in_flight < max_active
    }

    /// State for a connection that is about to be opened.
    pub(crate) fn next_connection_state(&mut self) -> ConnectionState {
        self.next_id += 1;
        ConnectionState::new(self.next_id, self.type_code, self.generation)
    }

    /// Whether `state` was issued under the current generation and options.
    pub(crate) fn is_current(&self, state: &ConnectionState) -> bool {
        !self.shutdown && state.generation == self.generation && state.type_code == self.type_code
    }

    /// Most recently returned idle connection first.
    pub(crate) fn pop_idle(&mut self) -> Option<IdleConnection<C>> {
        self.idle.pop()
    }

    pub(crate) fn push_idle(&mut self, idle: IdleConnection<C>) {
        self.idle.push(idle);
    }

    pub(crate) fn push_active(&mut self, active: ActiveConnection<C>) {
        self.active.push(active);
    }

    /// Matches on the lease rather than the id: a reclaimed connection keeps
    /// its id but is handed out under a new lease.
    pub(crate) fn take_active(&mut self, lease: &Arc<Lease>) -> Option<ActiveConnection<C>> {
        let index = self
            .active
            .iter()
            .position(|conn| Arc::ptr_eq(&conn.lease, lease))?;
        Some(self.active.swap_remove(index))
    }

    /// Removes the longest held active connection if it has been checked out
    /// for more than `checkout_timeout`.
    pub(crate) fn take_overdue(
        &mut self,
        checkout_timeout: Duration,
    ) -> Option<ActiveConnection<C>> {
        let (index, oldest) = self
            .active
            .iter()
            .enumerate()
            .max_by_key(|(_, conn)| conn.state.checkout_time())?;
        if !oldest.state.is_beyond_checkout_timeout(checkout_timeout) {
            return None;
        }
        Some(self.active.swap_remove(index))
    }

    /// Earliest instant at which some active connection becomes overdue.
    pub(crate) fn next_overdue_at(&self, checkout_timeout: Duration) -> Option<Instant> {
        self.active
            .iter()
            .filter_map(|conn| conn.state.overdue_at(checkout_timeout))
            .min()
    }

    pub(crate) fn drain_idle(&mut self) -> Vec<IdleConnection<C>> {
        std::mem::take(&mut self.idle)
    }

    pub(crate) fn drain_active(&mut self) -> Vec<ActiveConnection<C>> {
        std::mem::take(&mut self.active)
    }
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ConnectionState {
    /// Unique within the pool that opened the connection.
    pub id: u64,
    /// Hash of the connect options the connection was opened with.
    pub type_code: u64,
    pub generation: u64,
    pub created: Instant,
    pub last_used: Instant,
    pub checked_out: Option<Instant>,
}

impl ConnectionState {
    pub fn new(id: u64, type_code: u64, generation: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            type_code,
            generation,
            created: now,
            last_used: now,
            checked_out: None,
        }
    }

    pub fn is_checked_out(&self) -> bool {
        self.checked_out.is_some()
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn time_since_last_use(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn checkout_time(&self) -> Duration {
        self.checked_out
            .map_or(Duration::ZERO, |checked_out| checked_out.elapsed())
    }

    pub fn is_beyond_checkout_timeout(&self, checkout_timeout: Duration) -> bool {
        self.checked_out
            .map_or(false, |checked_out| checked_out.elapsed() > checkout_timeout)
    }

    /// First instant at which `is_beyond_checkout_timeout` holds.
    pub fn overdue_at(&self, checkout_timeout: Duration) -> Option<Instant> {
        self.checked_out
            .map(|checked_out| checked_out + checkout_timeout + Duration::from_millis(1))
    }

    pub fn set_checked_out(&mut self) {
        self.checked_out = Some(Instant::now());
    }

    pub fn set_idle(&mut self) {
        self.last_used = Instant::now();
        self.checked_out = None;
    }
}
