//! Balancing state machine.
//!
//! A cycle goes through refresh, planning and applying phases and ends
//! converged, partially applied or failed. Every public entry point runs a
//! whole cycle, including the delays given to in-guest balloon drivers,
//! before returning.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;

use derive_more::Display;
use error_stack::ResultExt;

use crate::backend::{
    DomainStore, Hypervisor, LogNotifier, MemSetOutcome, NeverSuppressed, Notifier, Suppression,
};
use crate::policy::{display_plan, AllocationPolicy, MemsetRequest};
use crate::{
    is_balance_req_significant, signed, BalanceError, BalancerConfig, DomainId, DomainRegistry,
    Result, WarningUpdate,
};

/// Slack added on top of the target when setting the hypervisor maximum, in KiB.
const MAXMEM_SLACK_KIB: u64 = 1024;

/// Terminal state of a steady-state rebalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BalanceOutcome {
    /// Balancing is switched off by the operator.
    Suppressed,
    /// The plan was too small to be worth applying.
    Insignificant,
    /// Every planned target was applied.
    Converged,
    /// Donors did not release memory in time; the rest of the plan was dropped.
    PartiallyApplied,
}

/// Terminal state of a balloon-up request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BalloonOutcome {
    #[display("satisfied after {iterations} iterations")]
    Satisfied { iterations: u32 },
    #[display("no donors left after {iterations} iterations")]
    NoDonors { iterations: u32 },
    #[display("iteration budget exhausted")]
    Exhausted,
}

impl BalloonOutcome {
    pub fn is_satisfied(self) -> bool {
        matches!(self, BalloonOutcome::Satisfied { .. })
    }
}

/// Domain registry together with the collaborators a cycle needs.
pub struct SystemState<H, S, P> {
    hypervisor: H,
    store: S,
    policy: P,
    notifier: Box<dyn Notifier>,
    suppression: Box<dyn Suppression>,
    cfg: BalancerConfig,
    domains: DomainRegistry,
    all_phys_mem: u64,
}

impl<H, S, P> fmt::Debug for SystemState<H, S, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemState")
            .field("cfg", &self.cfg)
            .field("domains", &self.domains)
            .field("all_phys_mem", &self.all_phys_mem)
            .finish_non_exhaustive()
    }
}

impl<H, S, P> SystemState<H, S, P>
where
    H: Hypervisor,
    S: DomainStore,
    P: AllocationPolicy,
{
    pub fn new(hypervisor: H, store: S, policy: P, cfg: BalancerConfig) -> Result<Self, BalanceError> {
        cfg.validate()?;
        let all_phys_mem = hypervisor
            .total_physical_memory()
            .change_context(BalanceError::Hypervisor)?;

        tracing::debug!(
            all_phys_mem,
            free_mem_left = cfg.free_mem_left,
            free_mem_min = cfg.free_mem_min,
            "Initialized memory balancer"
        );

        Ok(Self {
            hypervisor,
            store,
            policy,
            notifier: Box::new(LogNotifier),
            suppression: Box::new(NeverSuppressed),
            cfg,
            domains: DomainRegistry::new(),
            all_phys_mem,
        })
    }

    pub fn with_notifier(mut self, notifier: impl Notifier + 'static) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    pub fn with_suppression(mut self, suppression: impl Suppression + 'static) -> Self {
        self.suppression = Box::new(suppression);
        self
    }

    pub fn domains(&self) -> &DomainRegistry {
        &self.domains
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.cfg
    }

    pub fn hypervisor(&self) -> &H {
        &self.hypervisor
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn add_domain(&mut self, id: DomainId) {
        tracing::debug!(domain = %id, "add_domain");
        self.domains.add(id);
    }

    pub fn del_domain(&mut self, id: DomainId) {
        tracing::debug!(domain = %id, "del_domain");
        self.domains.remove(id);
    }

    pub fn free_memory(&self) -> Result<u64, BalanceError> {
        self.hypervisor
            .free_memory()
            .change_context(BalanceError::Hypervisor)
    }

    /// Refreshes actual and maximum memory of every registered domain the
    /// hypervisor currently lists. Unregistered domains are ignored.
    pub fn refresh_memactual(&mut self) -> Result<(), BalanceError> {
        let listed = self
            .hypervisor
            .list_domains()
            .change_context(BalanceError::Hypervisor)?;

        for info in listed {
            let Some(dom) = self.domains.get_mut(info.id) else {
                continue;
            };
            dom.memory_actual = Some(info.memory_actual);
            // Only the privileged domain is expected to have no static bound
            dom.memory_maximum = Some(match self.store.static_max(info.id) {
                Ok(Some(maximum)) => maximum,
                Ok(None) => self.all_phys_mem,
                Err(e) => {
                    tracing::debug!(domain = %info.id, error = %e, "reading static max failed");
                    dom.memory_maximum.unwrap_or(self.all_phys_mem)
                }
            });
        }
        Ok(())
    }

    /// Retracts health markers of domains that are back near their target.
    pub fn clear_outdated_error_markers(&mut self) {
        let tolerance = self.cfg.target_tolerance();
        for dom in self.domains.iter_mut() {
            if let Some(kind) = dom.recover_if_within(tolerance) {
                forward_warning(
                    &self.store,
                    self.notifier.as_ref(),
                    dom.id,
                    WarningUpdate::Clear(kind),
                );
            }
        }
    }

    /// Applies a memory target to a domain.
    ///
    /// `last_target` is updated first. The hypervisor call and the store write
    /// are both attempted regardless of each other's result.
    pub fn mem_set(&mut self, id: DomainId, value: u64) -> MemSetOutcome {
        tracing::info!(domain = %id, target = value, "mem-set");
        let Some(dom) = self.domains.get_mut(id) else {
            tracing::debug!(domain = %id, "mem-set skipped, domain no longer registered");
            return MemSetOutcome::Unregistered;
        };
        dom.last_target = value;

        let target_kib = value / 1024;
        let applied = self
            .hypervisor
            .set_max(id, target_kib + MAXMEM_SLACK_KIB)
            .and_then(|()| self.hypervisor.set_target(id, target_kib));
        if let Err(e) = &applied {
            // Routinely happens in the middle of a domain shutdown
            tracing::warn!(domain = %id, error = %e, "hypervisor rejected memory target");
        }

        let stored = self.store.write_target(id, target_kib);
        if let Err(e) = &stored {
            tracing::warn!(domain = %id, error = %e, "failed to publish memory target");
        }

        MemSetOutcome::from_parts(applied.is_ok(), stored.is_ok())
    }

    /// Called at the end of a balloon-up, once enough memory is free: domains
    /// still well below an older, larger target get that target lowered to
    /// their current size so they do not grow back into the freed memory.
    pub fn inhibit_balloon_up(&mut self) {
        tracing::debug!("inhibit_balloon_up");
        let tolerance = self.cfg.inhibit_tolerance;
        let pending: Vec<(DomainId, u64, u64)> = self
            .domains
            .iter()
            .filter_map(|dom| {
                let actual = dom.memory_actual?;
                (actual.saturating_add(tolerance) < dom.last_target).then_some((
                    dom.id,
                    actual,
                    dom.last_target,
                ))
            })
            .collect();

        for (id, actual, last_target) in pending {
            tracing::info!(domain = %id, last_target, "preventing balloon up");
            self.mem_set(id, actual);
        }
    }

    /// Asks donor domains to shrink until at least `memsize` bytes are free.
    pub fn do_balloon(&mut self, memsize: u64) -> Result<BalloonOutcome, BalanceError> {
        tracing::info!(memsize, "do_balloon");
        let max_tries = self.cfg.balloon_max_tries;
        let mut niter: u32 = 0;
        let mut prev_memory_actual: Option<BTreeMap<DomainId, u64>> = None;

        for dom in self.domains.iter_mut() {
            dom.reset_for_balloon();
        }

        loop {
            tracing::debug!("niter={niter:2}/{max_tries:2}");
            self.refresh_memactual()?;
            let free = self.free_memory()?;
            tracing::info!(xenfree = free, "balloon iteration");

            if free >= memsize.saturating_add(self.cfg.free_mem_min) {
                self.inhibit_balloon_up();
                self.clear_outdated_error_markers();
                return Ok(BalloonOutcome::Satisfied { iterations: niter });
            }

            if let Some(prev) = prev_memory_actual.take() {
                for (id, before) in prev {
                    let Some(dom) = self.domains.get_mut(id) else {
                        continue;
                    };
                    if dom.memory_actual == Some(before) {
                        // Not responding to memset requests, no longer a donor
                        dom.mark_stuck();
                        tracing::info!(domain = %id, actual = before, "domain stuck");
                    }
                }
            }

            let needed = signed(memsize) + signed(self.cfg.free_mem_left) - signed(free);
            let plan = self.policy.plan_donors(needed, &self.domains);
            tracing::info!(memset_reqs = %display_plan(&plan), "balloon plan");

            if niter > max_tries {
                self.clear_outdated_error_markers();
                return Ok(BalloonOutcome::Exhausted);
            }
            if plan.is_empty() {
                self.clear_outdated_error_markers();
                return Ok(BalloonOutcome::NoDonors { iterations: niter });
            }

            let mut snapshot = BTreeMap::new();
            for rq in &plan {
                self.mem_set(rq.domain, rq.target);
                if let Some(actual) = self.domains.get(rq.domain).and_then(|d| d.memory_actual) {
                    snapshot.insert(rq.domain, actual);
                }
            }
            prev_memory_actual = Some(snapshot);

            tracing::debug!(delay = ?self.cfg.balloon_delay, "sleeping");
            thread::sleep(self.cfg.balloon_delay);
            niter += 1;
        }
    }

    /// Ingests a memory-pressure report and rebalances.
    pub fn refresh_meminfo(
        &mut self,
        id: DomainId,
        untrusted_report: &str,
    ) -> Result<BalanceOutcome, BalanceError> {
        tracing::debug!(domain = %id, "refresh_meminfo");
        match self.domains.get_mut(id) {
            Some(dom) => self.policy.ingest_pressure_report(dom, untrusted_report),
            None => tracing::debug!(domain = %id, "report from unregistered domain ignored"),
        }
        self.do_balance()
    }

    pub fn is_balance_req_significant(&self, plan: &[MemsetRequest], free_memory: u64) -> bool {
        is_balance_req_significant(plan, free_memory, &self.domains, &self.policy, &self.cfg)
    }

    fn print_stats(&self, free: u64, plan: &[MemsetRequest]) {
        for dom in self.domains.iter().filter(|dom| dom.meminfo.is_some()) {
            tracing::info!(
                "stat: dom {} act={:?} pref={:?}",
                dom.id,
                dom.memory_actual,
                self.policy.preferred_size(dom)
            );
        }
        tracing::info!("stat: xenfree={free} memset_reqs={}", display_plan(plan));
    }

    /// Redistributes memory according to the policy's rebalance plan.
    pub fn do_balance(&mut self) -> Result<BalanceOutcome, BalanceError> {
        tracing::debug!("do_balance");
        if self.suppression.is_suppressed() {
            tracing::debug!("balancing suppressed, returning");
            return Ok(BalanceOutcome::Suppressed);
        }

        self.refresh_memactual()?;
        self.clear_outdated_error_markers();
        let free = self.free_memory()?;
        let plan = self
            .policy
            .plan_rebalance(signed(free) - signed(self.cfg.free_mem_left), &self.domains);
        if !self.is_balance_req_significant(&plan, free) {
            return Ok(BalanceOutcome::Insignificant);
        }

        self.print_stats(free, &plan);

        let snapshot: BTreeMap<DomainId, Option<u64>> = self
            .domains
            .iter()
            .map(|dom| (dom.id, dom.memory_actual))
            .collect();

        'requests: for (index, rq) in plan.iter().enumerate() {
            // Keep some margin for rounding errors: before giving memory to a
            // domain, make sure the donors have released theirs.
            let mut tries_left = self.cfg.balance_retries;
            loop {
                let Some(actual) = self.domains.get(rq.domain).and_then(|d| d.memory_actual)
                else {
                    tracing::debug!(domain = %rq.domain, "no data for domain, skipping request");
                    continue 'requests;
                };
                if !self.would_starve(self.free_memory()?, rq.target, actual) {
                    break;
                }

                tracing::debug!(domain = %rq.domain, tries_left, "do_balance sleeping");
                thread::sleep(self.cfg.balloon_delay);
                tries_left -= 1;
                if tries_left == 0 {
                    self.abort_stalled_plan(&plan[..index], rq.domain, &snapshot)?;
                    self.clear_outdated_error_markers();
                    return Ok(BalanceOutcome::PartiallyApplied);
                }
            }
            self.mem_set(rq.domain, rq.target);
        }

        self.refresh_memactual()?;
        self.clear_outdated_error_markers();
        Ok(BalanceOutcome::Converged)
    }

    /// Whether moving a domain from `actual` to `target` would leave less
    /// than 90% of the free memory margin.
    fn would_starve(&self, free: u64, target: u64, actual: u64) -> bool {
        let projected = signed(free) - (signed(target) - signed(actual));
        projected < signed(self.cfg.free_mem_left) * 9 / 10
    }

    /// Waiting did not help: find the donors that did not give memory back,
    /// hand the stalled domain whatever is free right now and stop.
    fn abort_stalled_plan(
        &mut self,
        donors: &[MemsetRequest],
        stalled: DomainId,
        snapshot: &BTreeMap<DomainId, Option<u64>>,
    ) -> Result<(), BalanceError> {
        self.refresh_memactual()?;
        let tolerance = self.cfg.target_tolerance();

        for rq in donors {
            let Some(dom) = self.domains.get_mut(rq.domain) else {
                continue;
            };
            let Some(actual) = dom.memory_actual else {
                continue;
            };
            if dom.within_target(tolerance) {
                continue;
            }

            let moved = snapshot.get(&rq.domain).copied().flatten() != Some(actual);
            if moved {
                tracing::warn!(
                    domain = %rq.domain,
                    "domain still holds more memory than assigned ({actual} > {})",
                    rq.target
                );
            } else {
                tracing::warn!(
                    domain = %rq.domain,
                    "domain didn't react to memory request (holds {actual}, requested balloon down to {})",
                    rq.target
                );
            }
            for update in dom.flag_unresponsive(moved) {
                forward_warning(&self.store, self.notifier.as_ref(), rq.domain, update);
            }
        }

        let free = self.free_memory()?;
        match self.domains.get(stalled).and_then(|d| d.memory_actual) {
            Some(actual) => {
                let target = free
                    .saturating_add(actual)
                    .saturating_sub(self.cfg.free_mem_left);
                self.mem_set(stalled, target);
            }
            None => tracing::debug!(domain = %stalled, "stalled domain vanished"),
        }
        Ok(())
    }
}

/// Resolves the display name of a domain and forwards a warning change.
fn forward_warning<S: DomainStore>(
    store: &S,
    notifier: &dyn Notifier,
    domain: DomainId,
    update: WarningUpdate,
) {
    let name = match store.domain_name(domain) {
        Ok(Some(name)) => name,
        Ok(None) => {
            tracing::debug!(domain = %domain, "no display name, notification dropped");
            return;
        }
        Err(e) => {
            tracing::warn!(domain = %domain, error = %e, "reading domain name failed");
            return;
        }
    };
    match update {
        WarningUpdate::Raise(kind) => notifier.raise_warning(&name, kind),
        WarningUpdate::Clear(kind) => notifier.clear_warning(&name, kind),
    }
}

/// Thread-safe entry point serializing all balancing cycles.
///
/// Events arrive from independent sources (domain lifecycle, pressure
/// reports, admission requests); each one runs to completion under a single
/// lock so no cycle observes the registry changing underneath it.
#[derive(Debug)]
pub struct MemoryBalancer<H, S, P> {
    state: Mutex<SystemState<H, S, P>>,
}

impl<H, S, P> MemoryBalancer<H, S, P>
where
    H: Hypervisor,
    S: DomainStore,
    P: AllocationPolicy,
{
    pub fn new(state: SystemState<H, S, P>) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SystemState<H, S, P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_domain(&self, id: DomainId) {
        self.lock().add_domain(id);
    }

    pub fn unregister_domain(&self, id: DomainId) {
        self.lock().del_domain(id);
    }

    pub fn registered_domains(&self) -> Vec<DomainId> {
        self.lock().domains().ids()
    }

    pub fn on_pressure_report(
        &self,
        id: DomainId,
        untrusted_report: &str,
    ) -> Result<BalanceOutcome, BalanceError> {
        self.lock().refresh_meminfo(id, untrusted_report)
    }

    /// Frees `amount` bytes for a domain about to start. Returns whether the
    /// memory is available.
    pub fn request_free_memory(&self, amount: u64) -> bool {
        match self.lock().do_balloon(amount) {
            Ok(outcome) => {
                tracing::info!(amount, %outcome, "balloon request finished");
                outcome.is_satisfied()
            }
            Err(e) => {
                tracing::error!("balloon request failed: {e:?}");
                false
            }
        }
    }

    /// Runs `f` with exclusive access to the balancer state.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut SystemState<H, S, P>) -> R) -> R {
        f(&mut self.lock())
    }
}
