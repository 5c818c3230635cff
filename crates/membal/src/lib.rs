//! Memory balancing engine for a ballooning hypervisor.
//!
//! The engine keeps a registry of running domains, periodically redistributes
//! physical memory among them and frees memory on request for new domains:
//! - [`SystemState`]: the balancing state machine (`do_balance`, `do_balloon`)
//! - [`MemoryBalancer`]: a thread-safe facade serializing all cycles
//! - [`ProportionalPolicy`]: the default [`AllocationPolicy`]
//!
//! Hypervisor access, the per-domain configuration store and operator
//! notification are injected through the traits in [`backend`].

use error_stack::Report;

pub mod backend;
mod balancer;
mod config;
mod domain;
mod error;
pub mod policy;
mod registry;
mod significance;

/// Result type using error-stack for context-rich error reporting
pub type Result<T, C> = core::result::Result<T, Report<C>>;

pub use backend::{
    DomainInfo, DomainStore, Hypervisor, LogNotifier, MemSetOutcome, NeverSuppressed, Notifier,
    Suppression,
};
pub use balancer::{BalanceOutcome, BalloonOutcome, MemoryBalancer, SystemState};
pub use config::BalancerConfig;
pub use domain::{DomainHealth, DomainId, DomainState, WarningKind, WarningUpdate};
pub use error::{BackendError, BalanceError};
pub use policy::{AllocationPolicy, MemInfo, MemsetRequest, ProportionalPolicy};
pub use registry::DomainRegistry;
pub use significance::is_balance_req_significant;

/// One mebibyte in bytes.
pub const MIB: u64 = 1024 * 1024;

/// Converts a byte count for signed arithmetic, saturating on overflow.
pub(crate) fn signed(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}
