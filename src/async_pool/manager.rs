use std::{future::Future, hash::Hash};

/// Capabilities the pool needs from a physical connection.
///
/// Every method takes `&self`: the pool shares the physical connection between
/// its own bookkeeping and the caller holding the [`PooledConnection`] so it can
/// reclaim overdue connections without the caller's cooperation.
///
/// [`PooledConnection`]: super::guard::PooledConnection
pub trait Connection: 'static + Send + Sync {
    type Error: Send + Sync + std::error::Error + 'static;

    fn is_closed(&self) -> bool;

    /// Run a cheap validation query; an error marks the connection as broken.
    fn ping(&self, query: &str) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn is_auto_commit(&self) -> bool {
        true
    }

    /// Discard uncommitted work. Called before a non auto-commit connection
    /// is handed to another caller.
    fn rollback(&self) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }
}

pub trait Manager: 'static + Send + Sync {
    type Connection: Connection;
    type ConnectOption: Clone + Hash + Send;
    type Error: Send + std::error::Error;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection, Self::Error>> + Send;

    fn set_connect_option(&self, options: Self::ConnectOption);

    fn get_connect_option(&self) -> Self::ConnectOption;
}
