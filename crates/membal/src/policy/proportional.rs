use crate::policy::{AllocationPolicy, MemInfo, MemsetRequest};
use crate::{signed, DomainId, DomainRegistry, DomainState, MIB};

/// Parameters of [`ProportionalPolicy`].
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Headroom multiplier applied to the used memory (page cache allowance).
    pub cache_factor: f64,
    /// Lower bound of the preferred size of an unprivileged domain.
    pub min_preferred: u64,
    /// Extra memory granted to the privileged domain on top of its need.
    pub privileged_boost: u64,
    /// Donors with less spare memory than this are left alone when squeezing.
    pub min_squeeze: u64,
    /// Over-asks donors slightly so rounding does not leave the request short.
    pub donor_safety_factor: f64,
    /// Scales surplus targets down slightly to absorb rounding.
    pub rounding_factor: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            cache_factor: 1.3,
            min_preferred: 200 * MIB,
            privileged_boost: 350 * MIB,
            min_squeeze: 10 * MIB,
            donor_safety_factor: 1.05,
            rounding_factor: 0.999,
        }
    }
}

/// Distributes memory proportionally to each domain's preferred size.
///
/// Only domains that have published a valid memory report take part; the
/// others keep whatever they currently have.
#[derive(Debug, Clone, Default)]
pub struct ProportionalPolicy {
    cfg: PolicyConfig,
}

/// Values of a domain that can take part in planning.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: DomainId,
    actual: u64,
    maximum: u64,
    preferred: u64,
    donor_candidate: bool,
}

impl Candidate {
    /// Positive when the domain wants more memory, negative when it has spare.
    fn need(&self) -> i64 {
        signed(self.preferred) - signed(self.actual)
    }
}

impl ProportionalPolicy {
    pub fn new(cfg: PolicyConfig) -> Self {
        Self { cfg }
    }

    fn candidates(&self, domains: &DomainRegistry) -> Vec<Candidate> {
        domains
            .iter()
            .filter(|dom| dom.meminfo.is_some())
            .filter_map(|dom| {
                Some(Candidate {
                    id: dom.id,
                    actual: dom.memory_actual?,
                    maximum: dom.memory_maximum?,
                    preferred: self.preferred_size(dom)?,
                    donor_candidate: dom.is_donor_candidate(),
                })
            })
            .collect()
    }

    fn balance_when_enough_memory(
        &self,
        candidates: &[Candidate],
        total_preferred: f64,
        available: f64,
    ) -> Vec<MemsetRequest> {
        let mut donors = Vec::new();
        let mut acceptors = Vec::new();
        for c in candidates {
            let scale = c.preferred as f64 / total_preferred;
            let target_nonint = c.preferred as f64 + scale * available;
            let target = ((self.cfg.rounding_factor * target_nonint) as u64).min(c.maximum);
            if target < c.actual {
                donors.push(MemsetRequest::new(c.id, target));
            } else {
                acceptors.push(MemsetRequest::new(c.id, target));
            }
        }
        donors.extend(acceptors);
        donors
    }

    fn balance_when_low_on_memory(
        &self,
        free_delta: i64,
        donors: &[Candidate],
        acceptors: &[Candidate],
    ) -> Vec<MemsetRequest> {
        let mut requests = Vec::new();
        let mut squeezed = free_delta;
        for c in donors {
            let spare = -c.need();
            if spare < signed(self.cfg.min_squeeze) {
                // Already at (or close to) its preferred size
                continue;
            }
            squeezed += spare;
            requests.push(MemsetRequest::new(c.id, c.preferred));
        }
        if squeezed < 0 {
            return requests;
        }

        let total_preferred: f64 = acceptors.iter().map(|c| c.preferred as f64).sum();
        if total_preferred <= 0.0 {
            return requests;
        }
        for c in acceptors {
            let scale = c.preferred as f64 / total_preferred;
            let target = (c.actual as f64 + scale * squeezed as f64).min(c.maximum as f64);
            requests.push(MemsetRequest::new(c.id, target as u64));
        }
        requests
    }
}

impl AllocationPolicy for ProportionalPolicy {
    fn ingest_pressure_report(&self, domain: &mut DomainState, raw_report: &str) {
        match MemInfo::parse(raw_report) {
            Some(info) => {
                domain.mem_used = Some(info.mem_used());
                domain.meminfo = Some(info);
            }
            None => {
                tracing::warn!(domain = %domain.id, "rejected invalid memory report");
                domain.meminfo = None;
                domain.mem_used = None;
            }
        }
    }

    fn preferred_size(&self, domain: &DomainState) -> Option<u64> {
        let used = domain.mem_used? as f64 * self.cfg.cache_factor;
        let maximum = domain.memory_maximum?;
        let preferred = if domain.id.is_privileged() {
            ((used + self.cfg.privileged_boost as f64) as u64).min(maximum)
        } else {
            (used as u64).min(maximum).max(self.cfg.min_preferred)
        };
        Some(preferred)
    }

    fn plan_rebalance(&self, free_delta: i64, domains: &DomainRegistry) -> Vec<MemsetRequest> {
        let candidates = self.candidates(domains);
        let mut total_need: i64 = 0;
        let mut total_preferred = 0.0;
        let mut donors = Vec::new();
        let mut acceptors = Vec::new();
        for c in &candidates {
            let need = c.need();
            if need < 0 || c.actual >= c.maximum {
                donors.push(*c);
            } else {
                acceptors.push(*c);
            }
            total_need += need;
            total_preferred += c.preferred as f64;
        }

        let available = free_delta - total_need;
        if available > 0 && total_preferred > 0.0 {
            self.balance_when_enough_memory(&candidates, total_preferred, available as f64)
        } else {
            self.balance_when_low_on_memory(free_delta, &donors, &acceptors)
        }
    }

    fn plan_donors(&self, needed: i64, domains: &DomainRegistry) -> Vec<MemsetRequest> {
        let donors: Vec<(Candidate, i64)> = self
            .candidates(domains)
            .into_iter()
            .filter(|c| c.donor_candidate)
            .filter_map(|c| {
                let spare = -c.need();
                (spare > 0).then_some((c, spare))
            })
            .collect();
        let available: i64 = donors.iter().map(|(_, spare)| spare).sum();
        if available <= 0 || available < needed {
            return Vec::new();
        }

        let scale = needed.max(0) as f64 / available as f64;
        donors
            .into_iter()
            .map(|(c, spare)| {
                let borrowed =
                    (spare as f64 * scale * self.cfg.donor_safety_factor).min(spare as f64);
                MemsetRequest::new(c.id, (c.actual as f64 - borrowed) as u64)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn report(used_kib: u64) -> String {
        format!(
            "MemTotal: {used_kib} kB\nMemFree: 0 kB\nBuffers: 0 kB\nCached: 0 kB\n\
             SwapTotal: 0 kB\nSwapFree: 0 kB\n"
        )
    }

    fn registry(domains: &[(u32, u64, u64, u64)]) -> DomainRegistry {
        let policy = ProportionalPolicy::default();
        let mut registry = DomainRegistry::new();
        for &(id, used, actual, maximum) in domains {
            let id = DomainId::new(id);
            registry.add(id);
            let dom = registry.get_mut(id).unwrap();
            policy.ingest_pressure_report(dom, &report(used / 1024));
            dom.memory_actual = Some(actual);
            dom.memory_maximum = Some(maximum);
        }
        registry
    }

    #[test]
    fn preferred_size_has_floor_and_ceiling() {
        let policy = ProportionalPolicy::default();
        let reg = registry(&[(1, 10 * MIB, 300 * MIB, 4000 * MIB), (2, 1000 * MIB, 0, 1000 * MIB)]);
        assert_eq!(
            policy.preferred_size(reg.get(DomainId::new(1)).unwrap()),
            Some(200 * MIB)
        );
        assert_eq!(
            policy.preferred_size(reg.get(DomainId::new(2)).unwrap()),
            Some(1000 * MIB)
        );
    }

    #[test]
    fn privileged_domain_gets_boost() {
        let policy = ProportionalPolicy::default();
        let reg = registry(&[(0, 100 * MIB, 500 * MIB, 8000 * MIB)]);
        let pref = policy.preferred_size(reg.get(DomainId::PRIVILEGED).unwrap()).unwrap();
        assert_eq!(pref, 130 * MIB + 350 * MIB);
    }

    #[test]
    fn domain_without_report_is_ignored() {
        let policy = ProportionalPolicy::default();
        let mut reg = registry(&[(1, 500 * MIB, 1000 * MIB, 4000 * MIB)]);
        reg.add(DomainId::new(2));
        let plan = policy.plan_rebalance(1000 * MIB as i64, &reg);
        assert!(plan.iter().all(|rq| rq.domain == DomainId::new(1)));
    }

    #[test]
    fn surplus_is_split_proportionally_with_donors_first() {
        let policy = ProportionalPolicy::default();
        // dom1: pref 1300M, actual 2000M (donor); dom2: pref 650M, actual 400M (acceptor)
        let reg = registry(&[
            (1, 1000 * MIB, 2000 * MIB, 4000 * MIB),
            (2, 500 * MIB, 400 * MIB, 4000 * MIB),
        ]);
        let plan = policy.plan_rebalance(300 * MIB as i64, &reg);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].domain, DomainId::new(1));
        assert_eq!(plan[1].domain, DomainId::new(2));
        assert!(plan[0].target < 2000 * MIB);
        assert!(plan[1].target > 650 * MIB);
        // Everything stays within total memory (actuals plus free surplus)
        let total: u64 = plan.iter().map(|rq| rq.target).sum();
        assert!(total <= 2700 * MIB);
    }

    #[test]
    fn surplus_targets_are_capped_at_maximum() {
        let policy = ProportionalPolicy::default();
        let reg = registry(&[(1, 500 * MIB, 600 * MIB, 700 * MIB)]);
        let plan = policy.plan_rebalance(4000 * MIB as i64, &reg);
        assert_eq!(plan, vec![MemsetRequest::new(DomainId::new(1), 700 * MIB)]);
    }

    #[test]
    fn low_memory_squeezes_donors_to_preferred() {
        let policy = ProportionalPolicy::default();
        // dom1 pref 650M holds 1000M; dom2 pref 1300M holds 900M
        let reg = registry(&[
            (1, 500 * MIB, 1000 * MIB, 4000 * MIB),
            (2, 1000 * MIB, 900 * MIB, 4000 * MIB),
        ]);
        let plan = policy.plan_rebalance(-10 * MIB as i64, &reg);
        assert_eq!(plan[0], MemsetRequest::new(DomainId::new(1), 650 * MIB));
        // 350M squeezed minus the 10M deficit goes to the only acceptor
        assert_eq!(plan[1], MemsetRequest::new(DomainId::new(2), 1240 * MIB));
    }

    #[test]
    fn donor_plan_skips_stuck_domains() {
        let policy = ProportionalPolicy::default();
        let mut reg = registry(&[
            (1, 500 * MIB, 1000 * MIB, 4000 * MIB),
            (2, 500 * MIB, 1000 * MIB, 4000 * MIB),
        ]);
        reg.get_mut(DomainId::new(2)).unwrap().mark_stuck();
        let plan = policy.plan_donors(100 * MIB as i64, &reg);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].domain, DomainId::new(1));
        let expected = 1000 * MIB - 105 * MIB;
        assert!(plan[0].target.abs_diff(expected) < 1024, "target {}", plan[0].target);
    }

    #[test]
    fn donor_plan_is_empty_when_spare_is_insufficient() {
        let policy = ProportionalPolicy::default();
        let reg = registry(&[(1, 500 * MIB, 700 * MIB, 4000 * MIB)]);
        assert!(policy.plan_donors(100 * MIB as i64, &reg).is_empty());
    }

    #[test]
    fn donor_never_gives_more_than_its_spare() {
        let policy = ProportionalPolicy::default();
        let reg = registry(&[(1, 500 * MIB, 1000 * MIB, 4000 * MIB)]);
        let plan = policy.plan_donors(350 * MIB as i64, &reg);
        assert_eq!(plan, vec![MemsetRequest::new(DomainId::new(1), 650 * MIB)]);
    }

    #[test]
    fn invalid_report_clears_previous_data() {
        let policy = ProportionalPolicy::default();
        let mut reg = registry(&[(1, 500 * MIB, 1000 * MIB, 4000 * MIB)]);
        let dom = reg.get_mut(DomainId::new(1)).unwrap();
        assert!(dom.meminfo.is_some());
        policy.ingest_pressure_report(dom, "garbage");
        assert!(dom.meminfo.is_none());
        assert!(dom.mem_used.is_none());
    }
}
