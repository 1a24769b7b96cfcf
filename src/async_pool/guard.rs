use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tracing::{debug, warn};

use super::{
    close_connection,
    connection::{ActiveConnection, IdleConnection, Lease},
    error::{PoolError, Result},
    manager::{Connection, Manager},
    state::{ConnectionState, PoolState},
    PoolInner,
};

/// A slot counted in `in_flight` while its connection is opened, validated or
/// rolled back outside the pool lock.
///
/// Dropping the guard frees the slot and closes the connection it holds, so a
/// cancelled `acquire` or `close` gives its capacity back.
pub(crate) struct SlotGuard<M: Manager> {
    pool: Arc<PoolInner<M>>,
    connection: Option<IdleConnection<M::Connection>>,
    cancelled: bool,
}

impl<M: Manager> SlotGuard<M> {
    /// Must be called with the pool lock held.
    pub(crate) fn reserve(
        pool: &Arc<PoolInner<M>>,
        state: &mut PoolState<M::Connection>,
        connection: Option<IdleConnection<M::Connection>>,
    ) -> Self {
        state.in_flight += 1;
        Self {
            pool: pool.clone(),
            connection,
            cancelled: false,
        }
    }

    pub(crate) fn hold(&mut self, connection: IdleConnection<M::Connection>) {
        self.connection = Some(connection);
    }

    pub(crate) fn connection(&self) -> Option<&IdleConnection<M::Connection>> {
        self.connection.as_ref()
    }

    /// Hands the connection over to the pool state if it is still current.
    /// Must be called with the pool lock held.
    pub(crate) fn settle(
        mut self,
        state: &mut PoolState<M::Connection>,
    ) -> std::result::Result<IdleConnection<M::Connection>, Self> {
        match self.connection.take() {
            Some(idle) if state.is_current(&idle.state) => {
                state.in_flight -= 1;
                self.cancelled = true;
                Ok(idle)
            }
            other => {
                self.connection = other;
                Err(self)
            }
        }
    }

    /// Closes the held connection, then frees the slot.
    pub(crate) async fn discard(mut self) {
        if let Some(idle) = self.connection.take() {
            close_connection(&idle).await;
        }
    }
}

impl<M: Manager> Drop for SlotGuard<M> {
    fn drop(&mut self) {
        if let Some(idle) = self.connection.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { close_connection(&idle).await });
                }
                Err(_) => warn!(
                    connection_id = idle.state.id,
                    "in-flight connection dropped outside a runtime without closing it"
                ),
            }
        }
        if !self.cancelled {
            self.pool.state.lock().in_flight -= 1;
            self.pool.released.notify_one();
        }
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Behaves like the physical connection it wraps, except that
/// [`close`](Connection::close) hands it back to the pool. Once closed, or once
/// the pool has taken it back (overdue reclaim, shutdown), every capability
/// fails with [`PoolError::ConnectionClosed`]. Closing a connection the pool
/// already took back succeeds; closing it twice does not.
///
/// Dropping a connection that was never closed releases it on the current
/// tokio runtime.
///
/// [`ConnectionPool`]: super::ConnectionPool
pub struct PooledConnection<M: Manager> {
    pool: Arc<PoolInner<M>>,
    connection: Arc<M::Connection>,
    state: ConnectionState,
    lease: Arc<Lease>,
    closed: AtomicBool,
}

impl<M: Manager> PooledConnection<M> {
    pub(crate) fn new(pool: Arc<PoolInner<M>>, active: &ActiveConnection<M::Connection>) -> Self {
        Self {
            pool,
            connection: active.connection.clone(),
            state: active.state.clone(),
            lease: active.lease.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// The physical connection, for capabilities beyond [`Connection`].
    pub fn get(&self) -> Result<&M::Connection> {
        if self.lease.is_valid() {
            Ok(&self.connection)
        } else {
            Err(PoolError::ConnectionClosed)
        }
    }

    pub fn is_valid(&self) -> bool {
        self.lease.is_valid()
    }

    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn type_code(&self) -> u64 {
        self.state.type_code
    }

    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    pub fn age(&self) -> Duration {
        self.state.age()
    }

    /// Time since the connection was last returned to the pool, or since it
    /// was opened if it never was.
    pub fn time_since_last_use(&self) -> Duration {
        self.state.time_since_last_use()
    }

    pub fn checkout_time(&self) -> Duration {
        self.state.checkout_time()
    }
}

impl<M: Manager> Connection for PooledConnection<M> {
    type Error = PoolError;

    fn is_closed(&self) -> bool {
        !self.lease.is_valid() || self.connection.is_closed()
    }

    async fn ping(&self, query: &str) -> Result<()> {
        self.get()?
            .ping(query)
            .await
            .map_err(PoolError::connection)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(PoolError::ConnectionClosed);
        }
        if self.lease.revoke() {
            self.pool.release(&self.lease).await;
        } else {
            debug!(
                connection_id = self.state.id,
                "connection was already taken back by the pool"
            );
        }
        Ok(())
    }

    fn is_auto_commit(&self) -> bool {
        self.get().map_or(true, |connection| connection.is_auto_commit())
    }

    async fn rollback(&self) -> Result<()> {
        self.get()?
            .rollback()
            .await
            .map_err(PoolError::connection)
    }
}

impl<M: Manager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if !self.lease.revoke() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.pool.clone();
                let lease = self.lease.clone();
                handle.spawn(async move { pool.release(&lease).await });
            }
            Err(_) => warn!(
                connection_id = self.state.id,
                "pooled connection dropped outside a runtime, leaving it for overdue reclaim"
            ),
        }
    }
}

impl<M: Manager> fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.state.id)
            .field("generation", &self.state.generation)
            .field("valid", &self.lease.is_valid())
            .finish()
    }
}
