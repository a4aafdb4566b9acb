pub mod condition;
pub mod engine;
pub mod entities;
pub mod errors;
pub mod hierarchy;
pub mod loader;
pub mod policy;
pub mod policy_store;
pub mod types;
pub mod web;

use std::sync::Arc;

use entities::EntityStore;
use hierarchy::HierarchyResolver;
use policy_store::PolicyStore;

/// One consistent snapshot of everything a decision reads. Cloning is cheap;
/// a request holds its clone for its whole evaluation, so reloads never
/// change the data underneath it.
#[derive(Debug, Clone)]
pub struct AuthzState {
    pub entities: Arc<EntityStore>,
    /// Built over `entities`; its cache is valid for exactly that snapshot.
    pub hierarchy: Arc<HierarchyResolver>,
    pub policies: Arc<PolicyStore>,
}

impl AuthzState {
    pub fn new(entities: EntityStore, policies: PolicyStore) -> Self {
        let entities = Arc::new(entities);
        Self {
            hierarchy: Arc::new(HierarchyResolver::new(entities.clone())),
            entities,
            policies: Arc::new(policies),
        }
    }

    /// Same entities and resolver cache, new policy set.
    pub fn with_policies(&self, policies: PolicyStore) -> Self {
        Self {
            entities: self.entities.clone(),
            hierarchy: self.hierarchy.clone(),
            policies: Arc::new(policies),
        }
    }

    /// New entity snapshot with a fresh resolver; policies are kept.
    pub fn with_entities(&self, entities: EntityStore) -> Self {
        let entities = Arc::new(entities);
        Self {
            hierarchy: Arc::new(HierarchyResolver::new(entities.clone())),
            entities,
            policies: self.policies.clone(),
        }
    }
}
