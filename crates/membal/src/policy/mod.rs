//! Allocation policies turn memory-pressure reports into memory targets.

use std::sync::Arc;

use derive_more::Display;

use crate::{DomainId, DomainRegistry, DomainState};

mod meminfo;
mod proportional;

pub use meminfo::MemInfo;
pub use proportional::{PolicyConfig, ProportionalPolicy};

/// A single planned target assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[display("({domain}, {target})")]
pub struct MemsetRequest {
    pub domain: DomainId,
    /// New target in bytes.
    pub target: u64,
}

impl MemsetRequest {
    pub fn new(domain: DomainId, target: u64) -> Self {
        Self { domain, target }
    }
}

/// Computes preferred sizes and memory plans for the balancer.
///
/// Plans are applied in the order they are returned, so implementations
/// should list donors before acceptors.
pub trait AllocationPolicy: Send + Sync {
    /// Interprets a raw report from the in-guest agent and updates
    /// `meminfo` / `mem_used` of the domain.
    fn ingest_pressure_report(&self, domain: &mut DomainState, raw_report: &str);

    /// Memory the domain currently needs, if enough is known to tell.
    fn preferred_size(&self, domain: &DomainState) -> Option<u64>;

    /// Plans a general rebalance given the free memory surplus (positive) or
    /// deficit (negative) relative to the safety margin.
    fn plan_rebalance(&self, free_delta: i64, domains: &DomainRegistry) -> Vec<MemsetRequest>;

    /// Plans donations adding up to `needed` bytes. Stuck domains must not be
    /// selected. An empty plan means the request cannot be satisfied.
    fn plan_donors(&self, needed: i64, domains: &DomainRegistry) -> Vec<MemsetRequest>;
}

impl<T: AllocationPolicy + ?Sized> AllocationPolicy for Arc<T> {
    fn ingest_pressure_report(&self, domain: &mut DomainState, raw_report: &str) {
        (**self).ingest_pressure_report(domain, raw_report);
    }

    fn preferred_size(&self, domain: &DomainState) -> Option<u64> {
        (**self).preferred_size(domain)
    }

    fn plan_rebalance(&self, free_delta: i64, domains: &DomainRegistry) -> Vec<MemsetRequest> {
        (**self).plan_rebalance(free_delta, domains)
    }

    fn plan_donors(&self, needed: i64, domains: &DomainRegistry) -> Vec<MemsetRequest> {
        (**self).plan_donors(needed, domains)
    }
}

/// Formats a plan for log output.
pub(crate) fn display_plan(plan: &[MemsetRequest]) -> String {
    let items: Vec<String> = plan.iter().map(ToString::to_string).collect();
    format!("[{}]", items.join(", "))
}
