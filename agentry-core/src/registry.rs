// ABOUTME: Thread-safe catalog of backend descriptors keyed by identifier.
// ABOUTME: Registration never overwrites; listings are sorted by id for deterministic routing.

use crate::descriptor::AgentDescriptor;
use crate::error::{RuntimeError, RuntimeResult};
use agentry_agent::Capability;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Registry of available backends.
///
/// Entries are stored behind `Arc` so readers clone a handle out of the map
/// and never hold a shard lock while they use it.
#[derive(Default)]
pub struct AgentRegistry {
    descriptors: DashMap<String, Arc<AgentDescriptor>>,
}

/// Snapshot counts over the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub enabled: usize,
    /// Enabled backends declaring each capability
    pub by_capability: BTreeMap<Capability, usize>,
    pub by_kind: BTreeMap<String, usize>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor under its id. Fails if the id is taken, leaving the
    /// existing entry untouched.
    pub fn register(&self, descriptor: AgentDescriptor) -> RuntimeResult<Arc<AgentDescriptor>> {
        match self.descriptors.entry(descriptor.id.clone()) {
            Entry::Occupied(_) => {
                tracing::warn!(backend = %descriptor.id, "Rejected duplicate backend registration");
                Err(RuntimeError::DuplicateIdentifier(descriptor.id))
            }
            Entry::Vacant(slot) => {
                let descriptor = Arc::new(descriptor);
                tracing::info!(
                    backend = %descriptor.id,
                    kind = %descriptor.kind,
                    version = %descriptor.version,
                    enabled = descriptor.enabled,
                    "Registered backend"
                );
                slot.insert(descriptor.clone());
                Ok(descriptor)
            }
        }
    }

    pub fn unregister(&self, id: &str) -> RuntimeResult<Arc<AgentDescriptor>> {
        let (_, descriptor) = self
            .descriptors
            .remove(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        tracing::info!(backend = %id, "Unregistered backend");
        Ok(descriptor)
    }

    pub fn get(&self, id: &str) -> RuntimeResult<Arc<AgentDescriptor>> {
        self.descriptors
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.descriptors.contains_key(id)
    }

    /// Every descriptor, sorted by id
    pub fn list_all(&self) -> Vec<Arc<AgentDescriptor>> {
        self.list_by_capability(|_| true)
    }

    /// Descriptors accepted by `predicate`, sorted by id
    pub fn list_by_capability<F>(&self, predicate: F) -> Vec<Arc<AgentDescriptor>>
    where
        F: Fn(&AgentDescriptor) -> bool,
    {
        let mut matched: Vec<_> = self
            .descriptors
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.descriptors.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn statistics(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.descriptors.iter() {
            let descriptor = entry.value();
            stats.total += 1;
            *stats.by_kind.entry(descriptor.kind.clone()).or_default() += 1;
            if !descriptor.enabled {
                continue;
            }
            stats.enabled += 1;
            for cap in descriptor.capabilities.capability_set() {
                *stats.by_capability.entry(cap).or_default() += 1;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentry_agent::backends::mock::MockBackend;
    use agentry_agent::AgentCapabilities;

    fn descriptor(id: &str) -> AgentDescriptor {
        AgentDescriptor::builder(id, "mock").build(|_| Ok(Box::new(MockBackend::new())))
    }

    #[test]
    fn test_register_and_get() {
        let registry = AgentRegistry::new();
        registry.register(descriptor("alpha")).unwrap();
        assert_eq!(registry.get("alpha").unwrap().id, "alpha");
        assert!(registry.contains("alpha"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_keeps_original() {
        let registry = AgentRegistry::new();
        registry.register(descriptor("alpha")).unwrap();
        let replacement = AgentDescriptor::builder("alpha", "command")
            .build(|_| Ok(Box::new(MockBackend::new())));

        let err = registry.register(replacement).unwrap_err();
        assert!(matches!(err, RuntimeError::DuplicateIdentifier(ref id) if id == "alpha"));
        assert_eq!(registry.get("alpha").unwrap().kind, "mock");
    }

    #[test]
    fn test_unknown_ids_are_not_found() {
        let registry = AgentRegistry::new();
        assert!(matches!(registry.get("ghost"), Err(RuntimeError::NotFound(_))));
        assert!(matches!(registry.unregister("ghost"), Err(RuntimeError::NotFound(_))));
    }

    #[test]
    fn test_statistics_count_enabled_capabilities() {
        let registry = AgentRegistry::new();
        registry
            .register(
                AgentDescriptor::builder("rag", "mock")
                    .capabilities(AgentCapabilities::from_set([Capability::Rag]))
                    .build(|_| Ok(Box::new(MockBackend::new()))),
            )
            .unwrap();
        registry
            .register(
                AgentDescriptor::builder("off", "mock")
                    .capabilities(AgentCapabilities::from_set([Capability::Rag]))
                    .enabled(false)
                    .build(|_| Ok(Box::new(MockBackend::new()))),
            )
            .unwrap();

        let stats = registry.statistics();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.enabled, 1);
        assert_eq!(stats.by_capability.get(&Capability::Rag), Some(&1));
        assert_eq!(stats.by_kind.get("mock"), Some(&2));
    }
}
