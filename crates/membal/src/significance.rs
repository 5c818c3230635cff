use crate::policy::{display_plan, AllocationPolicy, MemsetRequest};
use crate::{signed, BalancerConfig, DomainRegistry};

/// Decides whether a rebalance plan is worth applying.
///
/// Small adjustments are skipped so domains are not churned by noise. A plan
/// is always applied when free memory is critically low, or when it grows a
/// domain that currently sits below its preferred size by a noticeable amount.
pub fn is_balance_req_significant<P: AllocationPolicy + ?Sized>(
    plan: &[MemsetRequest],
    free_memory: u64,
    domains: &DomainRegistry,
    policy: &P,
    cfg: &BalancerConfig,
) -> bool {
    tracing::debug!(
        plan = %display_plan(plan),
        free_memory,
        "is_balance_req_significant"
    );

    let free_deficit = signed(cfg.free_mem_left) - signed(free_memory);
    if free_deficit > signed(cfg.min_change_when_under_pref) {
        tracing::debug!("free memory too low, balance is significant");
        return true;
    }

    let mut total_transfer: u64 = 0;
    for rq in plan {
        let Some(dom) = domains.get(rq.domain) else {
            continue;
        };
        let last_target = dom.last_target;
        let change = signed(rq.target) - signed(last_target);
        total_transfer = total_transfer.saturating_add(change.unsigned_abs());

        let below_preferred = policy
            .preferred_size(dom)
            .is_some_and(|pref| last_target > 0 && last_target < pref);
        if below_preferred && change > signed(cfg.min_change_when_under_pref) {
            tracing::info!(domain = %rq.domain, "domain is below preferred size, allowing balance");
            return true;
        }
    }

    let significant =
        total_transfer.saturating_add(free_deficit.unsigned_abs()) > cfg.min_total_transfer;
    tracing::debug!(significant, total_transfer, "is_balance_req_significant result");
    significant
}
