//! A pool of database connections for async drivers.
//!
//! The pool hands out [`PooledConnection`]s opened by a [`Manager`], caps how
//! many are checked out at once, pings connections that sat idle for too long,
//! reclaims connections held past `max_checkout_time` and keeps at most
//! `max_idle` connections around between checkouts. Closing a
//! [`PooledConnection`] returns it to the pool instead of closing the physical
//! connection.
//!
//! ```ignore
//! use pooled_datasource::{ConnectionPool, PoolConfig, PingConfig};
//!
//! let config = PoolConfig::new(10, 5)
//!     .with_ping(PingConfig::enabled("SELECT 1", Duration::from_secs(60)));
//! let pool = ConnectionPool::new(manager, config)?;
//!
//! let conn = pool.acquire().await?;
//! conn.get()?.execute("...").await?;
//! conn.close().await?;
//! ```

pub mod async_pool;

pub use async_pool::{
    config::{PingConfig, PoolConfig, Timeouts},
    error::{PoolError, Result},
    guard::PooledConnection,
    manager::{Connection, Manager},
    metrics::PoolMetrics,
    state::ConnectionState,
    status::PoolStatus,
    ConnectionPool, PoolBuilder,
};
