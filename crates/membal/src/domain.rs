//! Per-domain state tracked by the balancer.

use std::str::FromStr;

use derive_more::{Display, From};

use crate::policy::MemInfo;

/// Hypervisor-assigned domain handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, From)]
#[display("{_0}")]
pub struct DomainId(u32);

impl DomainId {
    /// The most privileged domain, which usually has no static memory bound.
    pub const PRIVILEGED: DomainId = DomainId(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub fn is_privileged(self) -> bool {
        self == Self::PRIVILEGED
    }
}

impl FromStr for DomainId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Operator-visible warning attached to a misbehaving domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum WarningKind {
    #[display("VM refused to give back requested memory")]
    NoProgress,
    #[display("VM didn't give back all requested memory")]
    SlowReact,
}

/// Change to the operator warnings of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningUpdate {
    Raise(WarningKind),
    Clear(WarningKind),
}

/// How a domain reacted to the memory targets it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum DomainHealth {
    #[default]
    Healthy,
    /// Did not move at all after being asked to shrink. Excluded as a donor.
    Stuck,
    /// Moved, but is still well above its last target.
    SlowReacting,
}

impl DomainHealth {
    /// Transition taken when a domain that was asked to shrink is still above
    /// its target. `moved` tells whether its actual memory changed at all.
    pub fn on_unresponsive(self, moved: bool) -> Self {
        if moved {
            DomainHealth::SlowReacting
        } else {
            DomainHealth::Stuck
        }
    }

    /// Transition taken at the start of a balloon request. Only the donor
    /// exclusion is reset, slow reaction stays until the domain recovers.
    pub fn on_balloon_start(self) -> Self {
        match self {
            DomainHealth::Stuck => DomainHealth::Healthy,
            other => other,
        }
    }

    /// Transition taken once the domain is back within tolerance of its target.
    pub fn on_recovered(self) -> Self {
        DomainHealth::Healthy
    }

    /// Warning shown to the operator while in this state.
    pub fn warning(self) -> Option<WarningKind> {
        match self {
            DomainHealth::Healthy => None,
            DomainHealth::Stuck => Some(WarningKind::NoProgress),
            DomainHealth::SlowReacting => Some(WarningKind::SlowReact),
        }
    }
}

/// State of a single registered domain.
#[derive(Debug, Clone)]
pub struct DomainState {
    pub id: DomainId,
    /// Last accepted memory-pressure report from the in-guest agent.
    pub meminfo: Option<MemInfo>,
    /// Working-set estimate derived from `meminfo` by the allocation policy.
    pub mem_used: Option<u64>,
    /// Current resident size in bytes, as last seen by the refresh step.
    pub memory_actual: Option<u64>,
    /// Static upper bound in bytes, as last seen by the refresh step.
    pub memory_maximum: Option<u64>,
    /// Last target handed to the hypervisor, in bytes.
    pub last_target: u64,
    health: DomainHealth,
    raised: Option<WarningKind>,
}

impl DomainState {
    pub fn new(id: DomainId) -> Self {
        Self {
            id,
            meminfo: None,
            mem_used: None,
            memory_actual: None,
            memory_maximum: None,
            last_target: 0,
            health: DomainHealth::Healthy,
            raised: None,
        }
    }

    pub fn health(&self) -> DomainHealth {
        self.health
    }

    /// Warning currently shown to the operator for this domain.
    pub fn raised_warning(&self) -> Option<WarningKind> {
        self.raised
    }

    /// Whether the domain may be asked to give memory away.
    pub fn is_donor_candidate(&self) -> bool {
        self.health != DomainHealth::Stuck
    }

    /// Whether `memory_actual` is no more than `tolerance` above `last_target`.
    pub fn within_target(&self, tolerance: u64) -> bool {
        self.memory_actual
            .is_some_and(|actual| actual <= self.last_target.saturating_add(tolerance))
    }

    /// Marks the domain as not reacting to a memory request and returns the
    /// warning changes the operator should see.
    pub fn flag_unresponsive(&mut self, moved: bool) -> Vec<WarningUpdate> {
        self.health = self.health.on_unresponsive(moved);
        self.sync_warning()
    }

    /// Marks the domain as stuck without raising an operator warning.
    pub fn mark_stuck(&mut self) {
        self.health = DomainHealth::Stuck;
    }

    pub fn reset_for_balloon(&mut self) {
        self.health = self.health.on_balloon_start();
    }

    /// Clears the health marker if the domain is back within `tolerance` of
    /// its last target. Returns the warning to retract, if one was raised.
    pub fn recover_if_within(&mut self, tolerance: u64) -> Option<WarningKind> {
        if self.health == DomainHealth::Healthy && self.raised.is_none() {
            return None;
        }
        if !self.within_target(tolerance) {
            return None;
        }
        self.health = self.health.on_recovered();
        self.raised.take()
    }

    fn sync_warning(&mut self) -> Vec<WarningUpdate> {
        let wanted = self.health.warning();
        if wanted == self.raised {
            return Vec::new();
        }
        let mut updates = Vec::with_capacity(2);
        if let Some(old) = self.raised.take() {
            updates.push(WarningUpdate::Clear(old));
        }
        if let Some(new) = wanted {
            updates.push(WarningUpdate::Raise(new));
        }
        self.raised = wanted;
        updates
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn domain_at(actual: u64, last_target: u64) -> DomainState {
        let mut dom = DomainState::new(DomainId::new(3));
        dom.memory_actual = Some(actual);
        dom.last_target = last_target;
        dom
    }

    #[test]
    fn new_domain_is_healthy_with_zero_target() {
        let dom = DomainState::new(DomainId::new(7));
        assert_eq!(dom.health(), DomainHealth::Healthy);
        assert_eq!(dom.last_target, 0);
        assert!(dom.memory_actual.is_none());
        assert!(dom.is_donor_candidate());
    }

    #[test]
    fn unresponsive_without_movement_raises_no_progress() {
        let mut dom = domain_at(500, 100);
        let updates = dom.flag_unresponsive(false);
        assert_eq!(updates, vec![WarningUpdate::Raise(WarningKind::NoProgress)]);
        assert_eq!(dom.health(), DomainHealth::Stuck);
        assert!(!dom.is_donor_candidate());

        // Raising the same state twice does not notify again
        assert!(dom.flag_unresponsive(false).is_empty());
    }

    #[test]
    fn switching_warning_clears_the_old_one() {
        let mut dom = domain_at(500, 100);
        dom.flag_unresponsive(false);
        let updates = dom.flag_unresponsive(true);
        assert_eq!(
            updates,
            vec![
                WarningUpdate::Clear(WarningKind::NoProgress),
                WarningUpdate::Raise(WarningKind::SlowReact),
            ]
        );
        assert_eq!(dom.health(), DomainHealth::SlowReacting);
    }

    #[test]
    fn recovery_requires_being_within_tolerance() {
        let mut dom = domain_at(500, 100);
        dom.flag_unresponsive(true);

        assert_eq!(dom.recover_if_within(50), None);
        assert_eq!(dom.health(), DomainHealth::SlowReacting);

        dom.memory_actual = Some(140);
        assert_eq!(dom.recover_if_within(50), Some(WarningKind::SlowReact));
        assert_eq!(dom.health(), DomainHealth::Healthy);
        assert_eq!(dom.raised_warning(), None);
    }

    #[test]
    fn silent_stuck_marker_recovers_without_warning() {
        let mut dom = domain_at(100, 100);
        dom.mark_stuck();
        assert_eq!(dom.recover_if_within(0), None);
        assert_eq!(dom.health(), DomainHealth::Healthy);
    }

    #[test]
    fn balloon_start_only_resets_stuck() {
        assert_eq!(
            DomainHealth::Stuck.on_balloon_start(),
            DomainHealth::Healthy
        );
        assert_eq!(
            DomainHealth::SlowReacting.on_balloon_start(),
            DomainHealth::SlowReacting
        );
    }

    #[test]
    fn domain_id_parses_trimmed_numbers() {
        assert_eq!("12\n".parse::<DomainId>().unwrap(), DomainId::new(12));
        assert!("dom0".parse::<DomainId>().is_err());
        assert!(DomainId::new(0).is_privileged());
    }
}
