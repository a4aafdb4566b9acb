use std::collections::HashMap;

use crate::authz::errors::LoadError;
use crate::authz::types::{EntityUid, Policy, ScopeConstraint};

/// Compiled policies, indexed by the action they name.
///
/// A policy whose action scope is `== A` is only a candidate for requests on
/// `A`. Policies scoped to any action or to an action group are candidates
/// for every request.
#[derive(Debug, Default)]
pub struct PolicyStore {
    policies: Vec<Policy>,
    ids: HashMap<String, usize>,
    by_action: HashMap<EntityUid, Vec<usize>>,
    unindexed: Vec<usize>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(policies: impl IntoIterator<Item = Policy>) -> Result<Self, LoadError> {
        let mut store = Self::new();
        for policy in policies {
            if store.ids.contains_key(&policy.id) {
                return Err(LoadError::DuplicatePolicyId(policy.id));
            }
            let idx = store.policies.len();
            store.ids.insert(policy.id.clone(), idx);
            match &policy.scope.action {
                ScopeConstraint::Eq { entity } => {
                    store.by_action.entry(entity.clone()).or_default().push(idx)
                }
                ScopeConstraint::Any | ScopeConstraint::In { .. } => store.unindexed.push(idx),
            }
            store.policies.push(policy);
        }
        tracing::debug!(
            policies = store.policies.len(),
            indexed_actions = store.by_action.len(),
            unindexed = store.unindexed.len(),
            "Indexed policies"
        );
        Ok(store)
    }

    /// Candidate policies for an action, in load order.
    pub fn policies_for(&self, action: &EntityUid) -> Vec<&Policy> {
        let bucket = self.by_action.get(action).map(Vec::as_slice).unwrap_or(&[]);
        let mut indices: Vec<usize> = bucket.iter().chain(&self.unindexed).copied().collect();
        indices.sort_unstable();
        indices.into_iter().map(|idx| &self.policies[idx]).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Policy> {
        self.ids.get(id).map(|&idx| &self.policies[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Policy> {
        self.policies.iter()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
