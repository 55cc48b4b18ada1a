//! Per-identity bookkeeping inside a scope

use crate::error::BerthError;
use crate::service::ServiceInstance;
use std::collections::HashSet;
use tokio::sync::watch;

/// Outcome of a startup as seen by acquirers
#[derive(Debug, Clone)]
pub(crate) enum SlotStatus {
    /// Create, start or probe still in flight
    Pending,
    /// Instance is running
    Ready(ServiceInstance),
    /// Startup failed; every acquirer gets this error
    Failed(BerthError),
}

impl SlotStatus {
    pub(crate) fn is_pending(&self) -> bool {
        matches!(self, SlotStatus::Pending)
    }
}

/// One identity registered in a scope
#[derive(Debug)]
pub(crate) struct Slot {
    /// Distinguishes successive slots registered under the same name
    pub(crate) generation: u64,
    /// Authoritative instance state, once created
    pub(crate) instance: Option<ServiceInstance>,
    /// Callers waiting on the startup
    pub(crate) waiters: usize,
    /// Leases of handles handed out and not yet released
    pub(crate) leases: HashSet<u64>,
    pub(crate) status: watch::Sender<SlotStatus>,
}

impl Slot {
    pub(crate) fn new(generation: u64) -> Self {
        let (status, _) = watch::channel(SlotStatus::Pending);
        Self {
            generation,
            instance: None,
            waiters: 0,
            leases: HashSet::new(),
            status,
        }
    }

    /// Waiters plus outstanding leases
    pub(crate) fn held(&self) -> usize {
        self.waiters + self.leases.len()
    }

    pub(crate) fn is_unused(&self) -> bool {
        self.waiters == 0 && self.leases.is_empty()
    }

    pub(crate) fn is_ready(&self) -> bool {
        matches!(*self.status.borrow(), SlotStatus::Ready(_))
    }

    pub(crate) fn failure(&self) -> Option<BerthError> {
        match &*self.status.borrow() {
            SlotStatus::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    pub(crate) fn instance_id(&self) -> Option<&str> {
        self.instance.as_ref().map(|i| i.id())
    }
}
