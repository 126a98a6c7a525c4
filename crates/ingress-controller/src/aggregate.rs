use crate::model::{ResourceId, TunnelRule};
use std::collections::{BTreeMap, BTreeSet};

/// Harvested rules of every live, class-matching ingress, keyed by ingress identity.
#[derive(Debug, Default)]
pub struct DesiredState {
    entries: BTreeMap<ResourceId, Vec<TunnelRule>>,
}

impl DesiredState {
    /// Overwrites the rules of `id`, returning the previous ones.
    pub fn insert(&mut self, id: ResourceId, rules: Vec<TunnelRule>) -> Option<Vec<TunnelRule>> {
        self.entries.insert(id, rules)
    }

    pub fn remove(&mut self, id: &ResourceId) -> Option<Vec<TunnelRule>> {
        self.entries.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rule lists in identity order.
    pub fn entries(&self) -> impl Iterator<Item = &[TunnelRule]> {
        self.entries.values().map(Vec::as_slice)
    }

    /// Every rule, flattened in identity order and then declaration order.
    pub fn rules(&self) -> impl Iterator<Item = &TunnelRule> {
        self.entries.values().flatten()
    }

    pub fn hostnames(&self) -> BTreeSet<String> {
        self.rules()
            .filter(|rule| !rule.hostname.is_empty())
            .map(|rule| rule.hostname.clone())
            .collect()
    }

    pub fn routes(&self, rule: &TunnelRule) -> bool {
        self.rules().any(|desired| desired.same_route(rule))
    }
}
