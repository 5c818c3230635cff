//! Interfaces the balancer expects from its environment.
//!
//! The hypervisor and the per-domain configuration store are the only shared
//! mutable resources. Writes to them are best-effort: a domain may disappear
//! between enumeration and the write, and no transaction spans both.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::{BackendError, DomainId, Result, WarningKind};

/// A domain as enumerated by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainInfo {
    pub id: DomainId,
    /// Resident memory in bytes.
    pub memory_actual: u64,
}

/// Hypervisor control interface.
///
/// Reads are in bytes, writes take the hypervisor's native KiB unit.
pub trait Hypervisor: Send + Sync {
    fn list_domains(&self) -> Result<Vec<DomainInfo>, BackendError>;

    /// Memory not assigned to any domain, in bytes.
    fn free_memory(&self) -> Result<u64, BackendError>;

    fn total_physical_memory(&self) -> Result<u64, BackendError>;

    fn set_max(&self, domain: DomainId, max_kib: u64) -> Result<(), BackendError>;

    fn set_target(&self, domain: DomainId, target_kib: u64) -> Result<(), BackendError>;
}

/// Durable per-domain configuration store, readable by in-guest agents.
pub trait DomainStore: Send + Sync {
    /// Configured static memory bound in bytes, if any.
    fn static_max(&self, domain: DomainId) -> Result<Option<u64>, BackendError>;

    /// Publishes the memory target assigned to the domain.
    fn write_target(&self, domain: DomainId, target_kib: u64) -> Result<(), BackendError>;

    /// Display name used in operator notifications.
    fn domain_name(&self, domain: DomainId) -> Result<Option<String>, BackendError>;

    /// Raw memory-pressure report last published by the in-guest agent.
    fn read_meminfo(&self, domain: DomainId) -> Result<Option<String>, BackendError>;
}

/// Fire-and-forget sink for operator-visible warnings.
pub trait Notifier: Send + Sync {
    fn raise_warning(&self, domain_name: &str, kind: WarningKind);
    fn clear_warning(&self, domain_name: &str, kind: WarningKind);
}

/// Operator switch that turns steady-state rebalancing off.
pub trait Suppression: Send + Sync {
    fn is_suppressed(&self) -> bool;
}

/// Notifier that only records warnings in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn raise_warning(&self, domain_name: &str, kind: WarningKind) {
        tracing::warn!(target: "membal::notify", domain = domain_name, "{kind}");
    }

    fn clear_warning(&self, domain_name: &str, kind: WarningKind) {
        tracing::info!(target: "membal::notify", domain = domain_name, "cleared: {kind}");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NeverSuppressed;

impl Suppression for NeverSuppressed {
    fn is_suppressed(&self) -> bool {
        false
    }
}

impl Suppression for AtomicBool {
    fn is_suppressed(&self) -> bool {
        self.load(Ordering::Relaxed)
    }
}

impl<T: Hypervisor + ?Sized> Hypervisor for Arc<T> {
    fn list_domains(&self) -> Result<Vec<DomainInfo>, BackendError> {
        (**self).list_domains()
    }

    fn free_memory(&self) -> Result<u64, BackendError> {
        (**self).free_memory()
    }

    fn total_physical_memory(&self) -> Result<u64, BackendError> {
        (**self).total_physical_memory()
    }

    fn set_max(&self, domain: DomainId, max_kib: u64) -> Result<(), BackendError> {
        (**self).set_max(domain, max_kib)
    }

    fn set_target(&self, domain: DomainId, target_kib: u64) -> Result<(), BackendError> {
        (**self).set_target(domain, target_kib)
    }
}

impl<T: DomainStore + ?Sized> DomainStore for Arc<T> {
    fn static_max(&self, domain: DomainId) -> Result<Option<u64>, BackendError> {
        (**self).static_max(domain)
    }

    fn write_target(&self, domain: DomainId, target_kib: u64) -> Result<(), BackendError> {
        (**self).write_target(domain, target_kib)
    }

    fn domain_name(&self, domain: DomainId) -> Result<Option<String>, BackendError> {
        (**self).domain_name(domain)
    }

    fn read_meminfo(&self, domain: DomainId) -> Result<Option<String>, BackendError> {
        (**self).read_meminfo(domain)
    }
}

impl<T: Notifier + ?Sized> Notifier for Arc<T> {
    fn raise_warning(&self, domain_name: &str, kind: WarningKind) {
        (**self).raise_warning(domain_name, kind);
    }

    fn clear_warning(&self, domain_name: &str, kind: WarningKind) {
        (**self).clear_warning(domain_name, kind);
    }
}

impl<T: Suppression + ?Sized> Suppression for Arc<T> {
    fn is_suppressed(&self) -> bool {
        (**self).is_suppressed()
    }
}

/// Result of applying a memory target to a domain.
///
/// The hypervisor call and the store write are independent; either may fail
/// while the other succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemSetOutcome {
    /// Both the hypervisor and the store accepted the target.
    Applied,
    /// The hypervisor rejected the target (domain gone or shutting down).
    Rejected,
    /// The hypervisor accepted the target but the store write failed.
    StoreFailed,
    /// Neither part succeeded.
    RejectedAndStoreFailed,
    /// The domain is no longer registered; nothing was attempted.
    Unregistered,
}

impl MemSetOutcome {
    pub(crate) fn from_parts(hypervisor_ok: bool, store_ok: bool) -> Self {
        match (hypervisor_ok, store_ok) {
            (true, true) => MemSetOutcome::Applied,
            (false, true) => MemSetOutcome::Rejected,
            (true, false) => MemSetOutcome::StoreFailed,
            (false, false) => MemSetOutcome::RejectedAndStoreFailed,
        }
    }

    pub fn is_applied(self) -> bool {
        self == MemSetOutcome::Applied
    }
}
