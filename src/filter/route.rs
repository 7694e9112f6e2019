//! Route side effects issued by the filter engine.

use std::sync::{Arc, Mutex};

use ipnetwork::Ipv4Network;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
#[error("route {op:?} failed: {reason}")]
pub struct RouteError {
    pub op: RouteOp,
    pub reason: String,
}

/// One route change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteOp {
    AddDirect(Ipv4Network),
    RemoveDirect(Ipv4Network),
    AddTunneled(Ipv4Network),
    RemoveTunneled(Ipv4Network),
}

/// Operating-system routing, owned outside this crate.
///
/// Idempotency and ordering of the underlying system calls are the
/// implementation's responsibility.
pub trait RouteControl: Send {
    fn add_direct(&self, cidr: Ipv4Network) -> Result<(), RouteError>;
    fn remove_direct(&self, cidr: Ipv4Network) -> Result<(), RouteError>;
    fn add_tunneled(&self, cidr: Ipv4Network) -> Result<(), RouteError>;
    fn remove_tunneled(&self, cidr: Ipv4Network) -> Result<(), RouteError>;

    fn apply(&self, op: RouteOp) -> Result<(), RouteError> {
        match op {
            RouteOp::AddDirect(cidr) => self.add_direct(cidr),
            RouteOp::RemoveDirect(cidr) => self.remove_direct(cidr),
            RouteOp::AddTunneled(cidr) => self.add_tunneled(cidr),
            RouteOp::RemoveTunneled(cidr) => self.remove_tunneled(cidr),
        }
    }
}

impl<T: RouteControl + Sync + ?Sized> RouteControl for Arc<T> {
    fn add_direct(&self, cidr: Ipv4Network) -> Result<(), RouteError> {
        (**self).add_direct(cidr)
    }

    fn remove_direct(&self, cidr: Ipv4Network) -> Result<(), RouteError> {
        (**self).remove_direct(cidr)
    }

    fn add_tunneled(&self, cidr: Ipv4Network) -> Result<(), RouteError> {
        (**self).add_tunneled(cidr)
    }

    fn remove_tunneled(&self, cidr: Ipv4Network) -> Result<(), RouteError> {
        (**self).remove_tunneled(cidr)
    }
}

/// Records and logs route changes without touching the system.
///
/// Used by the binary's dry-run mode and by tests.
#[derive(Debug, Default)]
pub struct RouteLog {
    ops: Mutex<Vec<RouteOp>>,
}

impl RouteLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every change recorded so far, in order.
    pub fn ops(&self) -> Vec<RouteOp> {
        self.ops.lock().map(|ops| ops.clone()).unwrap_or_default()
    }

    fn record(&self, op: RouteOp) -> Result<(), RouteError> {
        info!(?op, "route");
        let mut ops = self.ops.lock().map_err(|_| RouteError {
            op,
            reason: "route log poisoned".into(),
        })?;
        ops.push(op);
        Ok(())
    }
}

impl RouteControl for RouteLog {
    fn add_direct(&self, cidr: Ipv4Network) -> Result<(), RouteError> {
        self.record(RouteOp::AddDirect(cidr))
    }

    fn remove_direct(&self, cidr: Ipv4Network) -> Result<(), RouteError> {
        self.record(RouteOp::RemoveDirect(cidr))
    }

    fn add_tunneled(&self, cidr: Ipv4Network) -> Result<(), RouteError> {
        self.record(RouteOp::AddTunneled(cidr))
    }

    fn remove_tunneled(&self, cidr: Ipv4Network) -> Result<(), RouteError> {
        self.record(RouteOp::RemoveTunneled(cidr))
    }
}
