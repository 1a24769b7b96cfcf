use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use super::state::ConnectionState;

/// Validity flag shared between an active entry and the caller's wrapper.
///
/// The pool clears it when it takes the connection back behind the caller's
/// back (overdue reclaim, shutdown); the wrapper clears it on close.
#[derive(Debug)]
pub(crate) struct Lease {
    valid: AtomicBool,
}

impl Lease {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            valid: AtomicBool::new(true),
        })
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Returns whether the lease was still valid.
    pub(crate) fn revoke(&self) -> bool {
        self.valid.swap(false, Ordering::AcqRel)
    }
}

#[non_exhaustive]
pub struct IdleConnection<C> {
    pub connection: Arc<C>,
    pub state: ConnectionState,
}

#[non_exhaustive]
pub struct ActiveConnection<C> {
    pub connection: Arc<C>,
    pub state: ConnectionState,
    pub(crate) lease: Arc<Lease>,
}

impl<C> IdleConnection<C> {
    pub fn new(connection: C, state: ConnectionState) -> Self {
        Self {
            connection: Arc::new(connection),
            state,
        }
    }

    /// Stamps the checkout time and issues a fresh lease for the caller.
    pub(crate) fn into_active(self) -> ActiveConnection<C> {
        let mut state = self.state;
        state.set_checked_out();
        ActiveConnection {
            connection: self.connection,
            state,
            lease: Lease::new(),
        }
    }
}

impl<C> ActiveConnection<C> {
    /// Returns the connection to idle bookkeeping, keeping its original
    /// timestamps. Used when reclaiming so the next holder gets a new lease.
    pub(crate) fn reclaim(self) -> IdleConnection<C> {
        self.lease.revoke();
        let mut state = self.state;
        state.checked_out = None;
        IdleConnection {
            connection: self.connection,
            state,
        }
    }

    pub(crate) fn into_idle(self) -> IdleConnection<C> {
        self.lease.revoke();
        let mut state = self.state;
        state.set_idle();
        IdleConnection {
            connection: self.connection,
            state,
        }
    }
}
