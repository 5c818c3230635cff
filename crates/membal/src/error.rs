use derive_more::Display;

use crate::DomainId;

/// Failure reported by an injected backend.
#[derive(Debug, Display)]
pub enum BackendError {
    /// The hypervisor control interface rejected or failed a call.
    #[display("hypervisor call failed: {reason}")]
    Hypervisor { reason: String },
    /// The per-domain configuration store could not be read or written.
    #[display("domain store access failed: {reason}")]
    Store { reason: String },
    /// The hypervisor does not know the domain (usually mid-shutdown).
    #[display("domain {domain} not found")]
    DomainNotFound { domain: DomainId },
}

impl core::error::Error for BackendError {}

impl BackendError {
    pub fn hypervisor(reason: impl Into<String>) -> Self {
        Self::Hypervisor {
            reason: reason.into(),
        }
    }

    pub fn store(reason: impl Into<String>) -> Self {
        Self::Store {
            reason: reason.into(),
        }
    }
}

/// Error type of a balancing cycle.
///
/// None of these are fatal: the cycle is abandoned and the next trigger
/// starts again from fresh hypervisor state.
#[derive(Debug, Display)]
pub enum BalanceError {
    /// Reading domain or free memory from the hypervisor failed.
    #[display("reading hypervisor memory state failed")]
    Hypervisor,
    /// Configuration is invalid or inconsistent.
    #[display("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },
}

impl core::error::Error for BalanceError {}

impl BalanceError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }
}
