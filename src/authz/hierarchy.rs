//! Ancestor-closure queries over the entity parent graph.
//!
//! Closures are memoized per entity in a concurrent map. Population is
//! insert-if-absent: two requests racing on the same entity may both compute
//! the closure, but only the first result is stored and both are identical.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;

use crate::authz::entities::EntityStore;
use crate::authz::types::EntityUid;

#[derive(Debug)]
struct Closure {
    ancestors: Arc<HashSet<EntityUid>>,
    /// The traversal came back to its starting entity.
    cyclic: bool,
}

#[derive(Debug)]
pub struct HierarchyResolver {
    entities: Arc<EntityStore>,
    cache: DashMap<EntityUid, Arc<Closure>>,
}

impl HierarchyResolver {
    pub fn new(entities: Arc<EntityStore>) -> Self {
        Self {
            entities,
            cache: DashMap::new(),
        }
    }

    pub fn entities(&self) -> &Arc<EntityStore> {
        &self.entities
    }

    /// True if `candidate` is `of` itself or reachable from `of` through
    /// parent edges.
    pub fn is_ancestor(&self, candidate: &EntityUid, of: &EntityUid) -> bool {
        if candidate == of {
            return true;
        }
        let closure = self.closure(of);
        if closure.cyclic {
            tracing::warn!(
                entity = %of,
                "cycle in entity hierarchy at query time; treating membership as no match"
            );
            return false;
        }
        closure.ancestors.contains(candidate)
    }

    /// The ancestor closure of `of`, including `of` itself. Entities that are
    /// not in the store have only themselves as ancestors.
    pub fn ancestors(&self, of: &EntityUid) -> Arc<HashSet<EntityUid>> {
        self.closure(of).ancestors.clone()
    }

    fn closure(&self, of: &EntityUid) -> Arc<Closure> {
        if let Some(hit) = self.cache.get(of) {
            return hit.value().clone();
        }
        let computed = Arc::new(self.compute(of));
        self.cache
            .entry(of.clone())
            .or_insert(computed)
            .value()
            .clone()
    }

    /// Breadth-first walk up the parent edges. Nodes whose closure is already
    /// cached contribute it wholesale instead of being walked through.
    fn compute(&self, of: &EntityUid) -> Closure {
        let mut ancestors = HashSet::new();
        let mut cyclic = false;
        let mut queue = VecDeque::new();
        ancestors.insert(of.clone());
        queue.push_back(of);

        while let Some(current) = queue.pop_front() {
            let Some(entity) = self.entities.get(current) else {
                continue;
            };
            for parent in &entity.parents {
                if parent == of {
                    cyclic = true;
                    continue;
                }
                if ancestors.contains(parent) {
                    continue;
                }
                if let Some(cached) = self.cache.get(parent) {
                    if cached.cyclic || cached.ancestors.contains(of) {
                        cyclic = true;
                    }
                    ancestors.extend(cached.ancestors.iter().cloned());
                    continue;
                }
                ancestors.insert(parent.clone());
                queue.push_back(parent);
            }
        }

        Closure {
            ancestors: Arc::new(ancestors),
            cyclic,
        }
    }

    /// Precompute every closure in the store.
    pub fn warm(&self) {
        for entity in self.entities.iter() {
            self.closure(&entity.uid);
        }
        tracing::debug!(cached = self.cache.len(), "Warmed hierarchy cache");
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }
}
