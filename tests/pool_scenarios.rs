use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use pooled_datasource::{
    Connection, ConnectionPool, Manager, PingConfig, PoolConfig, PoolError, Timeouts,
};

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct DbError(&'static str);

#[derive(Default)]
struct Server {
    opened: AtomicUsize,
    closed: AtomicUsize,
    pings: AtomicUsize,
    down: AtomicBool,
    connect_delay_ms: AtomicU64,
}

struct DbConnection {
    server: Arc<Server>,
    closed: AtomicBool,
}

impl Connection for DbConnection {
    type Error = DbError;

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn ping(&self, _query: &str) -> Result<(), DbError> {
        self.server.pings.fetch_add(1, Ordering::SeqCst);
        if self.server.down.load(Ordering::SeqCst) {
            return Err(DbError("broken pipe"));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DbError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.server.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct DbManager {
    server: Arc<Server>,
}

impl Manager for DbManager {
    type Connection = DbConnection;
    type ConnectOption = String;
    type Error = DbError;

    async fn connect(&self) -> Result<DbConnection, DbError> {
        let delay = self.server.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.server.opened.fetch_add(1, Ordering::SeqCst);
        Ok(DbConnection {
            server: self.server.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn set_connect_option(&self, _options: String) {}

    fn get_connect_option(&self) -> String {
        "db://scenario".into()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn pool(config: PoolConfig) -> (ConnectionPool<DbManager>, Arc<Server>) {
    init_tracing();
    let server = Arc::new(Server::default());
    let manager = DbManager {
        server: server.clone(),
    };
    let pool = ConnectionPool::builder()
        .pool_config(config)
        .build(manager)
        .expect("valid config");
    (pool, server)
}

fn millis(checkout: u64, wait: u64) -> Timeouts {
    Timeouts::default()
        .with_checkout(Some(Duration::from_millis(checkout)))
        .with_wait(Some(Duration::from_millis(wait)))
}

#[tokio::test(start_paused = true)]
async fn released_connection_unblocks_waiter() {
    let (pool, server) = pool(PoolConfig::new(2, 1).with_timeouts(millis(60_000, 100)));

    let c1 = pool.acquire().await.expect("c1");
    let _c2 = pool.acquire().await.expect("c2");
    assert_eq!(pool.active_count(), 2);

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    let c1_id = c1.id();
    c1.close().await.expect("release c1");
    let c3 = waiter.await.expect("join").expect("c3");

    assert_eq!(c3.id(), c1_id);
    assert_eq!(pool.active_count(), 2);
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(server.opened.load(Ordering::SeqCst), 2);
    assert!(pool.metrics().had_to_wait_count >= 1);
}

#[tokio::test(start_paused = true)]
async fn overdue_connection_is_reclaimed() {
    let (pool, server) = pool(PoolConfig::new(1, 1).with_timeouts(millis(50, 20_000)));

    let c1 = pool.acquire().await.expect("c1");
    tokio::time::sleep(Duration::from_millis(60)).await;

    let c2 = pool.acquire().await.expect("c2 via reclaim");
    let metrics = pool.metrics();
    assert_eq!(metrics.claimed_overdue_count, 1);
    assert!(metrics.average_overdue_checkout_time() >= Duration::from_millis(60));

    // the physical connection moved to c2; c1 is dead for its holder
    assert_eq!(c2.id(), c1.id());
    assert_eq!(server.opened.load(Ordering::SeqCst), 1);
    assert!(c2.get().is_ok());
    assert!(matches!(c1.get(), Err(PoolError::ConnectionClosed)));
    c1.close().await.expect("late close is absorbed");
    assert!(matches!(c1.close().await, Err(PoolError::ConnectionClosed)));
    assert_eq!(pool.active_count(), 1);
    assert!(c2.is_valid());
}

#[tokio::test(start_paused = true)]
async fn blocked_acquire_wakes_when_holder_becomes_overdue() {
    let (pool, _) = pool(PoolConfig::new(1, 1).with_timeouts(millis(50, 1_000)));

    let _c1 = pool.acquire().await.expect("c1");
    let started = tokio::time::Instant::now();
    let c2 = pool.acquire().await.expect("c2");

    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(started.elapsed() < Duration::from_millis(1_000));
    assert!(c2.is_valid());
    assert_eq!(pool.metrics().claimed_overdue_count, 1);
}

#[tokio::test(start_paused = true)]
async fn quick_reuse_is_not_pinged() {
    let ping = PingConfig::enabled("SELECT 1", Duration::from_millis(100));
    let (pool, server) = pool(PoolConfig::new(2, 2).with_ping(ping));

    let conn = pool.acquire().await.expect("acquire");
    conn.close().await.expect("close");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let conn = pool.acquire().await.expect("reacquire");

    assert_eq!(server.pings.load(Ordering::SeqCst), 0);
    conn.close().await.expect("close");
}

#[tokio::test(start_paused = true)]
async fn failed_ping_discards_stale_connection() {
    let ping = PingConfig::enabled("SELECT 1", Duration::from_millis(100));
    let (pool, server) = pool(PoolConfig::new(2, 2).with_ping(ping));

    let conn = pool.acquire().await.expect("acquire");
    let stale_id = conn.id();
    conn.close().await.expect("close");

    tokio::time::sleep(Duration::from_millis(150)).await;
    server.down.store(true, Ordering::SeqCst);
    let conn = pool.acquire().await.expect("replacement");

    assert_ne!(conn.id(), stale_id);
    assert_eq!(server.pings.load(Ordering::SeqCst), 1);
    assert_eq!(server.closed.load(Ordering::SeqCst), 1);
    assert_eq!(server.opened.load(Ordering::SeqCst), 2);
    assert_eq!(pool.metrics().bad_connection_count, 1);
}

#[tokio::test(start_paused = true)]
async fn invalidated_active_connection_is_not_reused() {
    let (pool, server) = pool(PoolConfig::new(2, 2));

    let conn = pool.acquire().await.expect("acquire");
    pool.invalidate().await;
    conn.close().await.expect("close");

    assert_eq!(pool.idle_count(), 0);
    assert_eq!(server.closed.load(Ordering::SeqCst), 1);

    let conn = pool.acquire().await.expect("acquire");
    assert_eq!(conn.generation(), 1);
    assert_eq!(server.opened.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn capacity_limits_hold_under_contention() {
    let max_active = 3;
    let max_idle = 2;
    let config = PoolConfig::new(max_active, max_idle).with_timeouts(millis(60_000, 5_000));
    let (pool, server) = pool(config);

    let mut workers = Vec::new();
    for worker in 0..12u64 {
        let pool = pool.clone();
        workers.push(tokio::spawn(async move {
            for round in 0..5u64 {
                let conn = pool.acquire().await.expect("acquire");
                assert!(pool.active_count() <= max_active);
                assert!(pool.idle_count() <= max_idle);
                let hold = 1 + (worker * 7 + round * 3) % 11;
                tokio::time::sleep(Duration::from_millis(hold)).await;
                conn.close().await.expect("close");
                assert!(pool.idle_count() <= max_idle);
            }
        }));
    }
    for worker in workers {
        worker.await.expect("worker");
    }

    let status = pool.status();
    assert_eq!(status.active_connections, 0);
    assert!(status.idle_connections <= max_idle);
    assert_eq!(status.metrics.request_count, 60);
    assert!(status.metrics.average_checkout_time() > Duration::ZERO);
    let opened = server.opened.load(Ordering::SeqCst);
    let closed = server.closed.load(Ordering::SeqCst);
    assert_eq!(opened - closed, status.idle_connections);
}

#[tokio::test(start_paused = true)]
async fn acquire_abandoned_while_connecting_keeps_capacity() {
    let (pool, server) = pool(PoolConfig::new(1, 1).with_timeouts(millis(60_000, 100)));
    server.connect_delay_ms.store(500, Ordering::SeqCst);

    let abandoned = tokio::time::timeout(Duration::from_millis(10), pool.acquire()).await;
    assert!(abandoned.is_err());
    tokio::time::sleep(Duration::from_secs(1)).await;

    server.connect_delay_ms.store(0, Ordering::SeqCst);
    let conn = pool.acquire().await.expect("capacity is intact");
    assert_eq!(pool.active_count(), 1);
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(server.opened.load(Ordering::SeqCst), 1);
    conn.close().await.expect("close");
}

#[tokio::test(start_paused = true)]
async fn averages_are_zero_on_a_fresh_pool() {
    let (pool, _) = pool(PoolConfig::default());
    let metrics = pool.metrics();
    assert_eq!(metrics.request_count, 0);
    assert_eq!(metrics.average_checkout_time(), Duration::ZERO);
    assert_eq!(metrics.average_wait_time(), Duration::ZERO);
    assert_eq!(metrics.average_request_time(), Duration::ZERO);
}
