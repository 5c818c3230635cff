//! Simulated hypervisor, store and notifier shared by the engine tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use membal::{
    AllocationPolicy, BackendError, BalancerConfig, DomainId, DomainInfo, DomainRegistry,
    DomainState, DomainStore, Hypervisor, MemoryBalancer, MemsetRequest, Notifier, ProportionalPolicy,
    Result, SystemState, WarningKind, MIB,
};

/// How a simulated domain reacts to a new memory target.
#[derive(Debug, Clone, Copy)]
pub enum Reaction {
    /// Balloons to the target instantly.
    Immediate,
    /// Ignores targets entirely.
    Ignore,
    /// Moves towards the target by at most this many bytes per request.
    Step(u64),
}

#[derive(Debug)]
struct SimDomain {
    actual: u64,
    reaction: Reaction,
}

#[derive(Debug, Default)]
struct SimState {
    total: u64,
    domains: BTreeMap<DomainId, SimDomain>,
    rejecting: BTreeSet<DomainId>,
    target_calls: Vec<(DomainId, u64)>,
}

/// Hypervisor whose free memory is whatever the domains leave unused.
#[derive(Debug, Default)]
pub struct SimHypervisor {
    state: Mutex<SimState>,
}

impl SimHypervisor {
    pub fn new(total: u64) -> Arc<Self> {
        let sim = Self::default();
        sim.state.lock().unwrap().total = total;
        Arc::new(sim)
    }

    pub fn add(&self, id: u32, actual: u64, reaction: Reaction) {
        self.state
            .lock()
            .unwrap()
            .domains
            .insert(DomainId::new(id), SimDomain { actual, reaction });
    }

    pub fn set_actual(&self, id: u32, actual: u64) {
        if let Some(dom) = self.state.lock().unwrap().domains.get_mut(&DomainId::new(id)) {
            dom.actual = actual;
        }
    }

    pub fn set_reaction(&self, id: u32, reaction: Reaction) {
        if let Some(dom) = self.state.lock().unwrap().domains.get_mut(&DomainId::new(id)) {
            dom.reaction = reaction;
        }
    }

    pub fn reject(&self, id: u32) {
        self.state.lock().unwrap().rejecting.insert(DomainId::new(id));
    }

    pub fn actual(&self, id: u32) -> u64 {
        self.state.lock().unwrap().domains[&DomainId::new(id)].actual
    }

    pub fn free(&self) -> u64 {
        let state = self.state.lock().unwrap();
        state.total - state.domains.values().map(|d| d.actual).sum::<u64>()
    }

    /// Targets (in KiB) accepted so far, in call order.
    pub fn target_calls(&self) -> Vec<(DomainId, u64)> {
        self.state.lock().unwrap().target_calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().target_calls.clear();
    }
}

impl Hypervisor for SimHypervisor {
    fn list_domains(&self) -> Result<Vec<DomainInfo>, BackendError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .domains
            .iter()
            .map(|(id, dom)| DomainInfo {
                id: *id,
                memory_actual: dom.actual,
            })
            .collect())
    }

    fn free_memory(&self) -> Result<u64, BackendError> {
        Ok(self.free())
    }

    fn total_physical_memory(&self) -> Result<u64, BackendError> {
        Ok(self.state.lock().unwrap().total)
    }

    fn set_max(&self, domain: DomainId, _max_kib: u64) -> Result<(), BackendError> {
        if self.state.lock().unwrap().rejecting.contains(&domain) {
            return Err(error_stack::report!(BackendError::DomainNotFound { domain }));
        }
        Ok(())
    }

    fn set_target(&self, domain: DomainId, target_kib: u64) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if state.rejecting.contains(&domain) {
            return Err(error_stack::report!(BackendError::DomainNotFound { domain }));
        }
        state.target_calls.push((domain, target_kib));
        let target = target_kib * 1024;
        if let Some(dom) = state.domains.get_mut(&domain) {
            dom.actual = match dom.reaction {
                Reaction::Immediate => target,
                Reaction::Ignore => dom.actual,
                Reaction::Step(step) if target < dom.actual => target.max(dom.actual.saturating_sub(step)),
                Reaction::Step(step) => target.min(dom.actual + step),
            };
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StoreState {
    static_max: BTreeMap<DomainId, u64>,
    names: BTreeMap<DomainId, String>,
    targets: Vec<(DomainId, u64)>,
    failing: bool,
}

#[derive(Debug, Default)]
pub struct SimStore {
    state: Mutex<StoreState>,
}

impl SimStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_static_max(&self, id: u32, bytes: u64) {
        self.state
            .lock()
            .unwrap()
            .static_max
            .insert(DomainId::new(id), bytes);
    }

    pub fn set_name(&self, id: u32, name: &str) {
        self.state
            .lock()
            .unwrap()
            .names
            .insert(DomainId::new(id), name.to_string());
    }

    pub fn fail_writes(&self) {
        self.state.lock().unwrap().failing = true;
    }

    /// Targets (in KiB) written so far, in call order.
    pub fn targets(&self) -> Vec<(DomainId, u64)> {
        self.state.lock().unwrap().targets.clone()
    }
}

impl DomainStore for SimStore {
    fn static_max(&self, domain: DomainId) -> Result<Option<u64>, BackendError> {
        Ok(self.state.lock().unwrap().static_max.get(&domain).copied())
    }

    fn write_target(&self, domain: DomainId, target_kib: u64) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if state.failing {
            return Err(error_stack::report!(BackendError::store("read-only store")));
        }
        state.targets.push((domain, target_kib));
        Ok(())
    }

    fn domain_name(&self, domain: DomainId) -> Result<Option<String>, BackendError> {
        Ok(self.state.lock().unwrap().names.get(&domain).cloned())
    }

    fn read_meminfo(&self, _domain: DomainId) -> Result<Option<String>, BackendError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Raised(String, WarningKind),
    Cleared(String, WarningKind),
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Event>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn raise_warning(&self, domain_name: &str, kind: WarningKind) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Raised(domain_name.to_string(), kind));
    }

    fn clear_warning(&self, domain_name: &str, kind: WarningKind) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Cleared(domain_name.to_string(), kind));
    }
}

/// Policy returning queued rebalance plans and fixed preferred sizes.
/// Donor plans come from the proportional policy.
#[derive(Debug, Default)]
pub struct ScriptedPolicy {
    preferred: Mutex<BTreeMap<DomainId, u64>>,
    plans: Mutex<VecDeque<Vec<MemsetRequest>>>,
    donors: ProportionalPolicy,
}

impl ScriptedPolicy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn prefer(&self, id: u32, bytes: u64) {
        self.preferred
            .lock()
            .unwrap()
            .insert(DomainId::new(id), bytes);
    }

    pub fn push_plan(&self, plan: &[(u32, u64)]) {
        self.plans.lock().unwrap().push_back(
            plan.iter()
                .map(|&(id, target)| MemsetRequest::new(DomainId::new(id), target))
                .collect(),
        );
    }
}

impl AllocationPolicy for ScriptedPolicy {
    fn ingest_pressure_report(&self, domain: &mut DomainState, raw_report: &str) {
        self.donors.ingest_pressure_report(domain, raw_report);
    }

    fn preferred_size(&self, domain: &DomainState) -> Option<u64> {
        self.preferred.lock().unwrap().get(&domain.id).copied()
    }

    fn plan_rebalance(&self, _free_delta: i64, _domains: &DomainRegistry) -> Vec<MemsetRequest> {
        self.plans.lock().unwrap().pop_front().unwrap_or_default()
    }

    fn plan_donors(&self, needed: i64, domains: &DomainRegistry) -> Vec<MemsetRequest> {
        self.donors.plan_donors(needed, domains)
    }
}

/// Default configuration without delays.
pub fn fast_config() -> BalancerConfig {
    BalancerConfig {
        balloon_delay: Duration::ZERO,
        ..BalancerConfig::default()
    }
}

/// A `/proc/meminfo` report claiming `used` bytes in use.
pub fn meminfo_report(used: u64) -> String {
    format!(
        "MemTotal: {} kB\nMemFree: 0 kB\nBuffers: 0 kB\nCached: 0 kB\nSwapTotal: 0 kB\nSwapFree: 0 kB\n",
        used / 1024
    )
}

pub type TestState = SystemState<Arc<SimHypervisor>, Arc<SimStore>, Arc<ScriptedPolicy>>;
pub type TestBalancer = MemoryBalancer<Arc<SimHypervisor>, Arc<SimStore>, Arc<ScriptedPolicy>>;

pub struct Harness {
    pub hypervisor: Arc<SimHypervisor>,
    pub store: Arc<SimStore>,
    pub policy: Arc<ScriptedPolicy>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new(total: u64) -> Self {
        Self {
            hypervisor: SimHypervisor::new(total),
            store: SimStore::new(),
            policy: ScriptedPolicy::new(),
            notifier: RecordingNotifier::new(),
        }
    }

    pub fn state(&self, cfg: BalancerConfig) -> TestState {
        SystemState::new(
            self.hypervisor.clone(),
            self.store.clone(),
            self.policy.clone(),
            cfg,
        )
        .unwrap()
        .with_notifier(self.notifier.clone())
    }
}

pub fn mib(n: u64) -> u64 {
    n * MIB
}
