//! Registry of the domains taking part in memory balancing.

use std::collections::BTreeMap;

use crate::{DomainId, DomainState};

/// Owns one [`DomainState`] per registered domain.
///
/// Records are created and destroyed only through [`add`](Self::add) and
/// [`remove`](Self::remove); hypervisor enumeration never registers domains.
#[derive(Debug, Default)]
pub struct DomainRegistry {
    domains: BTreeMap<DomainId, DomainState>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id`. Returns `false` and keeps the existing record if the
    /// domain is already known, so its target bookkeeping survives.
    pub fn add(&mut self, id: DomainId) -> bool {
        if self.domains.contains_key(&id) {
            tracing::debug!(domain = %id, "domain already registered, keeping state");
            return false;
        }
        self.domains.insert(id, DomainState::new(id));
        true
    }

    pub fn remove(&mut self, id: DomainId) -> Option<DomainState> {
        self.domains.remove(&id)
    }

    pub fn get(&self, id: DomainId) -> Option<&DomainState> {
        self.domains.get(&id)
    }

    pub fn get_mut(&mut self, id: DomainId) -> Option<&mut DomainState> {
        self.domains.get_mut(&id)
    }

    pub fn contains(&self, id: DomainId) -> bool {
        self.domains.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<DomainId> {
        self.domains.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DomainState> {
        self.domains.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DomainState> {
        self.domains.values_mut()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}
