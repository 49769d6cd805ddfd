//! Entity registry: agents, services and resources with a capability index.
//!
//! Writers replace the published snapshot copy-on-write; readers take an
//! `Arc` to the current snapshot and never observe a half-applied change.
//! Execution counters are the exception: they change on every task, so they
//! live in one map shared by all snapshots and are read live.

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

use crate::domain::{Entity, EntityId, EntityKind, ServiceStats};
use crate::error::{AgoraError, Result};

// =============================================================================
// RegistrySnapshot: immutable view
// =============================================================================

/// Point-in-time view of the registry
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    version: u64,
    entities: HashMap<EntityId, Entity>,
    /// capability -> entity ids, maintained on register/deregister
    capability_index: HashMap<String, BTreeSet<EntityId>>,
    /// service id -> live execution counters, shared across snapshots
    stats: Arc<DashMap<EntityId, ServiceStats>>,
}

impl RegistrySnapshot {
    /// Monotonic counter bumped on every mutation
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    /// Ids of entities declaring `capability`, optionally restricted to one kind
    pub fn find_by_capability(
        &self,
        capability: &str,
        kind_filter: Option<EntityKind>,
    ) -> BTreeSet<EntityId> {
        let Some(ids) = self.capability_index.get(capability) else {
            return BTreeSet::new();
        };
        match kind_filter {
            None => ids.clone(),
            Some(kind) => ids
                .iter()
                .filter(|id| self.entities.get(*id).map(|e| e.kind()) == Some(kind))
                .cloned()
                .collect(),
        }
    }

    /// Entities declaring `capability`, in id order
    pub fn with_capability<'a>(&'a self, capability: &str) -> impl Iterator<Item = &'a Entity> + 'a {
        self.capability_index
            .get(capability)
            .into_iter()
            .flatten()
            .filter_map(|id| self.entities.get(id))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Current execution counters of a service (zero when it has no history)
    pub fn service_stats(&self, service_id: &str) -> ServiceStats {
        self.stats
            .get(service_id)
            .map(|s| *s.value())
            .unwrap_or_default()
    }

    fn insert(&mut self, entity: Entity) {
        for capability in &entity.capabilities {
            self.capability_index
                .entry(capability.clone())
                .or_default()
                .insert(entity.id.clone());
        }
        self.entities.insert(entity.id.clone(), entity);
        self.version += 1;
    }

    fn remove(&mut self, id: &str) -> Option<Entity> {
        let entity = self.entities.remove(id)?;
        for capability in &entity.capabilities {
            if let Some(ids) = self.capability_index.get_mut(capability) {
                ids.remove(id);
                if ids.is_empty() {
                    self.capability_index.remove(capability);
                }
            }
        }
        self.stats.remove(id);
        self.version += 1;
        Some(entity)
    }
}

// =============================================================================
// Registry: owner of all entities
// =============================================================================

#[derive(Default)]
pub struct Registry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every entity in order, stopping at the first duplicate
    pub fn bootstrap(&self, entities: impl IntoIterator<Item = Entity>) -> Result<usize> {
        let mut count = 0;
        for entity in entities {
            self.register(entity)?;
            count += 1;
        }
        info!("Registry bootstrapped with {} entities", count);
        Ok(count)
    }

    /// Current snapshot; cheap to take and safe to hold
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut RegistrySnapshot) -> Result<T>) -> Result<T> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        f(Arc::make_mut(&mut guard))
    }

    pub fn register(&self, entity: Entity) -> Result<()> {
        self.mutate(|state| {
            if state.entities.contains_key(&entity.id) {
                return Err(AgoraError::DuplicateId(entity.id.clone()));
            }
            debug!(
                "Registered {} {} ({} capabilities)",
                entity.kind(),
                entity.id,
                entity.capabilities.len()
            );
            state.insert(entity);
            Ok(())
        })
    }

    /// Remove an entity; removing an absent id is an error every time
    pub fn deregister(&self, id: &str) -> Result<Entity> {
        self.mutate(|state| {
            let entity = state
                .remove(id)
                .ok_or_else(|| AgoraError::NotFound(format!("entity {}", id)))?;
            debug!("Deregistered {} {}", entity.kind(), id);
            Ok(entity)
        })
    }

    pub fn get(&self, id: &str) -> Result<Entity> {
        self.snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| AgoraError::NotFound(format!("entity {}", id)))
    }

    pub fn find_by_capability(
        &self,
        capability: &str,
        kind_filter: Option<EntityKind>,
    ) -> BTreeSet<EntityId> {
        self.snapshot().find_by_capability(capability, kind_filter)
    }

    /// Record one execution outcome against a service
    ///
    /// Touches only the shared counters; the snapshot is not copied.
    pub fn record_outcome(&self, service_id: &str, success: bool) -> Result<()> {
        let snapshot = self.snapshot();
        snapshot
            .get(service_id)
            .ok_or_else(|| AgoraError::NotFound(format!("entity {}", service_id)))?
            .service_profile()
            .ok_or_else(|| AgoraError::Validation(format!("{} is not a service", service_id)))?;
        snapshot
            .stats
            .entry(service_id.to_string())
            .or_default()
            .record(success);
        Ok(())
    }

    pub fn service_stats(&self, service_id: &str) -> ServiceStats {
        self.snapshot().service_stats(service_id)
    }

    /// Replace a service's base price (refreshed from its cost estimate)
    pub fn update_service_price(&self, service_id: &str, price: Decimal) -> Result<()> {
        if price <= Decimal::ZERO {
            return Err(AgoraError::Validation(format!(
                "non-positive base price {} for {}",
                price, service_id
            )));
        }
        self.mutate(|state| {
            let profile = state
                .entities
                .get_mut(service_id)
                .ok_or_else(|| AgoraError::NotFound(format!("entity {}", service_id)))?
                .service_profile_mut()
                .ok_or_else(|| {
                    AgoraError::Validation(format!("{} is not a service", service_id))
                })?;
            if profile.base_price == Some(price) {
                return Ok(());
            }
            profile.base_price = Some(price);
            state.version += 1;
            Ok(())
        })
    }
}
