pub mod config;
pub mod connection;
pub mod error;
pub mod guard;
pub mod manager;
pub mod metrics;
pub mod state;
pub mod status;


use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    marker::PhantomData,
    sync::Arc,
};

use config::PoolConfig;
use connection::{ActiveConnection, IdleConnection, Lease};
use error::{PoolError, Result};
use futures::future::join_all;
use guard::{PooledConnection, SlotGuard};
use manager::{Connection, Manager};
use metrics::PoolMetrics;
use parking_lot::Mutex;
use state::{ConnectionState, PoolState};
use status::PoolStatus;
use tokio::{sync::Notify, time::Instant};
use tracing::{debug, info, warn};

const CONNECT_RETRIES: u32 = 3;

/// Handle to a pool of connections opened by a [`Manager`].
///
/// Cheap to clone; every clone drives the same pool.
pub struct ConnectionPool<M: Manager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: Manager> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Manager> ConnectionPool<M> {
    pub fn new(manager: M, pool_config: PoolConfig) -> Result<Self> {
        pool_config.validate()?;
        Ok(Self {
            inner: PoolInner::new_arc(manager, pool_config),
        })
    }

    pub fn builder() -> PoolBuilder<M> {
        PoolBuilder::new()
    }

    /// Checks a connection out of the pool.
    ///
    /// Reuses the most recently returned idle connection, opens a new one
    /// while under `max_active`, reclaims an overdue one, or waits up to
    /// `time_to_wait` for one to be released.
    pub async fn acquire(&self) -> Result<PooledConnection<M>> {
        self.inner.acquire().await
    }

    /// Closes every idle connection and marks every checked out one stale,
    /// so it is closed instead of reused when it comes back.
    pub async fn invalidate(&self) {
        self.inner.invalidate().await
    }

    /// Replaces the manager's connect options and invalidates every
    /// connection opened with the previous ones.
    pub async fn set_connect_option(&self, connect_option: M::ConnectOption) {
        let type_code = type_code(&connect_option);
        self.inner.manager.set_connect_option(connect_option);
        self.inner.state.lock().type_code = type_code;
        self.inner.invalidate().await
    }

    pub fn get_connect_option(&self) -> M::ConnectOption {
        self.inner.manager.get_connect_option()
    }

    /// Closes every connection, including checked out ones, and refuses
    /// further `acquire` calls.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle_count()
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active_count()
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.inner.state.lock().metrics().clone()
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus::capture(&self.inner.config, &*state)
    }
}

pub struct PoolBuilder<M: Manager> {
    pool_config: PoolConfig,
    _manager: PhantomData<M>,
}

impl<M: Manager> PoolBuilder<M> {
    pub fn new() -> Self {
        Self {
            pool_config: PoolConfig::default(),
            _manager: PhantomData,
        }
    }

    pub fn pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.pool_config = pool_config;
        self
    }

    pub fn build(self, manager: M) -> Result<ConnectionPool<M>> {
        ConnectionPool::new(manager, self.pool_config)
    }
}

impl<M: Manager> Default for PoolBuilder<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Next step of an `acquire` attempt, decided under the pool lock.
enum Checkout<M: Manager> {
    Idle(SlotGuard<M>),
    Overdue(SlotGuard<M>),
    Connect(SlotGuard<M>, ConnectionState),
    /// Nothing to hand out; retry once released or once the oldest checkout
    /// becomes overdue.
    Wait(Option<Instant>),
}

enum Validation {
    Good,
    Stale,
    Bad,
}

pub struct PoolInner<M: Manager> {
    manager: M,
    config: PoolConfig,
    state: Mutex<PoolState<M::Connection>>,
    released: Notify,
}

impl<M: Manager> PoolInner<M> {
    pub fn new_arc(manager: M, pool_config: PoolConfig) -> Arc<Self> {
        let type_code = type_code(&manager.get_connect_option());
        Arc::new(Self {
            manager,
            config: pool_config,
            state: Mutex::new(PoolState::new(type_code)),
            released: Notify::new(),
        })
    }

    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection<M>> {
        let requested = Instant::now();
        let deadline = requested + self.config.timeouts.wait;
        let bad_connection_limit =
            self.config.max_idle as u64 + u64::from(self.config.bad_connection_tolerance);
        let mut bad_connections = 0u64;

        loop {
            // Registered before the state is inspected so a release in
            // between is not missed.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let slot = match self.next_checkout()? {
                Checkout::Idle(slot) => slot,
                Checkout::Overdue(slot) => match self.recover_overdue(slot).await {
                    Some(slot) => slot,
                    None => continue,
                },
                Checkout::Connect(mut slot, state) => {
                    let connection = self.connect().await?;
                    debug!(connection_id = state.id, "created connection");
                    slot.hold(IdleConnection::new(connection, state));
                    match self.check_out(slot, requested) {
                        Ok(conn) => return Ok(conn),
                        Err(stale) => {
                            stale.discard().await;
                            continue;
                        }
                    }
                }
                Checkout::Wait(overdue_at) => {
                    debug!(
                        time_to_wait = ?self.config.timeouts.wait,
                        "no connection available, waiting for one to be released"
                    );
                    let waiting_since = Instant::now();
                    let wake_at = overdue_at.map_or(deadline, |at| at.min(deadline));
                    let woken = tokio::time::timeout_at(wake_at, released).await;
                    self.state
                        .lock()
                        .metrics
                        .record_wait(waiting_since.elapsed());
                    if woken.is_err() && Instant::now() >= deadline {
                        warn!(
                            time_to_wait = ?self.config.timeouts.wait,
                            "timed out waiting for a connection"
                        );
                        return Err(PoolError::Exhausted(self.config.timeouts.wait));
                    }
                    continue;
                }
            };

            match self.validate(&slot).await {
                Validation::Good => match self.check_out(slot, requested) {
                    Ok(conn) => return Ok(conn),
                    Err(stale) => stale.discard().await,
                },
                Validation::Stale => slot.discard().await,
                Validation::Bad => {
                    warn!("bad connection in the pool, getting another one");
                    self.state.lock().metrics.record_bad_connection();
                    slot.discard().await;
                    bad_connections += 1;
                    if bad_connections > bad_connection_limit {
                        return Err(PoolError::Connection(format!(
                            "{bad_connections} consecutive bad connections"
                        )));
                    }
                }
            }
        }
    }

    /// Picks what to do next and reserves a slot for it.
    fn next_checkout(self: &Arc<Self>) -> Result<Checkout<M>> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(PoolError::Shutdown);
        }

        if let Some(idle) = state.pop_idle() {
            let slot = SlotGuard::reserve(self, &mut state, Some(idle));
            return Ok(Checkout::Idle(slot));
        }

        if state.has_capacity(self.config.max_active) {
            let connection_state = state.next_connection_state();
            let slot = SlotGuard::reserve(self, &mut state, None);
            return Ok(Checkout::Connect(slot, connection_state));
        }

        if let Some(overdue) = state.take_overdue(self.config.timeouts.checkout) {
            let held_for = overdue.state.checkout_time();
            warn!(
                connection_id = overdue.state.id,
                held_for = ?held_for,
                "claimed overdue connection"
            );
            state.metrics.record_overdue_claim(held_for);
            let slot = SlotGuard::reserve(self, &mut state, Some(overdue.reclaim()));
            return Ok(Checkout::Overdue(slot));
        }

        state.metrics.record_had_to_wait();
        Ok(Checkout::Wait(
            state.next_overdue_at(self.config.timeouts.checkout),
        ))
    }

    /// Moves a validated connection into the active list. Gives the slot
    /// back if the pool was invalidated or shut down meanwhile.
    fn check_out(
        self: &Arc<Self>,
        slot: SlotGuard<M>,
        requested: Instant,
    ) -> std::result::Result<PooledConnection<M>, SlotGuard<M>> {
        let mut state = self.state.lock();
        let active = slot.settle(&mut state)?.into_active();
        let conn = PooledConnection::new(self.clone(), &active);
        state.push_active(active);
        state.metrics.record_request(requested.elapsed());
        Ok(conn)
    }

    async fn recover_overdue(&self, slot: SlotGuard<M>) -> Option<SlotGuard<M>> {
        let idle = slot.connection()?;
        if idle.connection.is_closed() {
            slot.discard().await;
            return None;
        }
        if !idle.connection.is_auto_commit() {
            if let Err(e) = idle.connection.rollback().await {
                warn!(
                    connection_id = idle.state.id,
                    error = %e,
                    "could not roll back overdue connection"
                );
                slot.discard().await;
                return None;
            }
        }
        Some(slot)
    }

    async fn validate(&self, slot: &SlotGuard<M>) -> Validation {
        let Some(idle) = slot.connection() else {
            return Validation::Stale;
        };
        if !self.state.lock().is_current(&idle.state) {
            return Validation::Stale;
        }
        if idle.connection.is_closed() {
            debug!(connection_id = idle.state.id, "connection was closed while idle");
            return Validation::Bad;
        }
        if !self.config.ping.is_due(idle.state.time_since_last_use()) {
            return Validation::Good;
        }

        debug!(connection_id = idle.state.id, "testing connection");
        match idle.connection.ping(&self.config.ping.query).await {
            Ok(()) => Validation::Good,
            Err(e) => {
                warn!(
                    connection_id = idle.state.id,
                    error = %e,
                    "ping query failed"
                );
                Validation::Bad
            }
        }
    }

    async fn connect(&self) -> Result<M::Connection> {
        let mut retry = 0;
        loop {
            let duration = self.config.timeouts.connect;
            let connection = tokio::time::timeout(duration, self.manager.connect()).await?;

            match connection {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    if retry >= CONNECT_RETRIES {
                        return Err(PoolError::connection(e));
                    }
                    retry += 1;
                    debug!(retry, error = %e, "failed to connect, retrying");
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Called when a wrapper is closed or dropped.
    pub(crate) async fn release(self: &Arc<Self>, lease: &Arc<Lease>) {
        let (slot, reusable) = {
            let mut state = self.state.lock();
            let Some(returned) = state.take_active(lease) else {
                debug!("connection was reclaimed before it was returned");
                return;
            };
            state
                .metrics
                .record_checkout(returned.state.checkout_time());
            if returned.state.type_code != state.type_code {
                warn!(
                    connection_id = returned.state.id,
                    "connection opened with other options returned to the pool, discarding"
                );
                state.metrics.record_bad_connection();
            }
            let reusable = state.is_current(&returned.state)
                && state.idle_count() < self.config.max_idle
                && !returned.connection.is_closed();
            let slot = SlotGuard::reserve(self, &mut state, Some(returned.into_idle()));
            (slot, reusable)
        };

        if !reusable {
            slot.discard().await;
            return;
        }

        if let Some(idle) = slot.connection() {
            if !idle.connection.is_auto_commit() {
                if let Err(e) = idle.connection.rollback().await {
                    warn!(
                        connection_id = idle.state.id,
                        error = %e,
                        "could not roll back returned connection"
                    );
                    slot.discard().await;
                    return;
                }
            }
        }

        let rejected = {
            let mut state = self.state.lock();
            if state.idle_count() < self.config.max_idle {
                match slot.settle(&mut state) {
                    Ok(idle) => {
                        debug!(connection_id = idle.state.id, "returned connection to pool");
                        state.push_idle(idle);
                        None
                    }
                    Err(slot) => Some(slot),
                }
            } else {
                Some(slot)
            }
        };

        match rejected {
            Some(slot) => slot.discard().await,
            None => self.released.notify_one(),
        }
    }

    pub async fn invalidate(&self) {
        let idle = {
            let mut state = self.state.lock();
            state.generation += 1;
            info!(
                generation = state.generation,
                idle = state.idle_count(),
                active = state.active_count(),
                "invalidating pooled connections"
            );
            state.drain_idle()
        };
        join_all(idle.iter().map(close_connection)).await;
    }

    pub async fn shutdown(&self) {
        let (idle, active) = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.generation += 1;
            info!(
                idle = state.idle_count(),
                active = state.active_count(),
                "shutting down connection pool"
            );
            (state.drain_idle(), state.drain_active())
        };
        self.released.notify_waiters();

        let reclaimed: Vec<_> = active.into_iter().map(ActiveConnection::reclaim).collect();
        join_all(idle.iter().chain(reclaimed.iter()).map(close_connection)).await;
    }
}

pub(crate) async fn close_connection<C: Connection>(idle: &IdleConnection<C>) {
    match idle.connection.close().await {
        Ok(()) => debug!(connection_id = idle.state.id, "closed connection"),
        Err(e) => warn!(
            connection_id = idle.state.id,
            error = %e,
            "failed to close connection"
        ),
    }
}

fn type_code<T: Hash>(connect_option: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    connect_option.hash(&mut hasher);
    hasher.finish()
}
