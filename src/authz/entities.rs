use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::authz::errors::LoadError;
use crate::authz::types::{AttrValue, EntityUid};

/// An entity exactly as it appears in the load format:
/// `{"uid": .., "attrs": {..}, "parents": [..]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub uid: EntityUid,
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
    #[serde(default)]
    pub parents: Vec<EntityUid>,
}

impl Entity {
    pub fn new(uid: EntityUid) -> Self {
        Self {
            uid,
            attrs: BTreeMap::new(),
            parents: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: EntityUid) -> Self {
        self.parents.push(parent);
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    fn dedup_parents(&mut self) {
        let mut seen = HashSet::new();
        self.parents.retain(|p| seen.insert(p.clone()));
    }
}

/// Entities indexed by uid and by type. Parent references always resolve
/// inside the store and never form a cycle.
#[derive(Debug, Clone, Default)]
pub struct EntityStore {
    entities: Vec<Entity>,
    index: HashMap<EntityUid, usize>,
    by_type: HashMap<String, Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from a complete snapshot, validating uniqueness,
    /// parent closure and acyclicity.
    pub fn load(entities: impl IntoIterator<Item = Entity>) -> Result<Self, LoadError> {
        let mut store = Self::new();
        for mut entity in entities {
            if store.index.contains_key(&entity.uid) {
                return Err(LoadError::DuplicateId(entity.uid));
            }
            entity.dedup_parents();
            store.push(entity);
        }

        for entity in &store.entities {
            if let Some(parent) = entity.parents.iter().find(|p| !store.index.contains_key(*p)) {
                return Err(LoadError::DanglingParent {
                    entity: entity.uid.clone(),
                    parent: parent.clone(),
                });
            }
        }

        store.check_cycles()?;

        tracing::debug!(
            entities = store.entities.len(),
            types = store.by_type.len(),
            "Loaded entity snapshot"
        );
        Ok(store)
    }

    fn push(&mut self, entity: Entity) {
        let idx = self.entities.len();
        self.index.insert(entity.uid.clone(), idx);
        self.by_type
            .entry(entity.uid.entity_type.clone())
            .or_default()
            .push(idx);
        self.entities.push(entity);
    }

    fn reindex(&mut self) {
        self.index.clear();
        self.by_type.clear();
        for (idx, entity) in self.entities.iter().enumerate() {
            self.index.insert(entity.uid.clone(), idx);
            self.by_type
                .entry(entity.uid.entity_type.clone())
                .or_default()
                .push(idx);
        }
    }

    /// Iterative three-colour DFS over parent edges.
    fn check_cycles(&self) -> Result<(), LoadError> {
        let mut marks = vec![Mark::Unvisited; self.entities.len()];

        for root in 0..self.entities.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }
            marks[root] = Mark::InProgress;
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];

            while let Some(&(node, next)) = stack.last() {
                let Some(parent) = self.entities[node].parents.get(next) else {
                    marks[node] = Mark::Done;
                    stack.pop();
                    continue;
                };
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let Some(&p) = self.index.get(parent) else {
                    continue;
                };
                match marks[p] {
                    Mark::InProgress => {
                        let mut path: Vec<String> = stack
                            .iter()
                            .skip_while(|(n, _)| *n != p)
                            .map(|(n, _)| self.entities[*n].uid.to_string())
                            .collect();
                        path.push(self.entities[p].uid.to_string());
                        return Err(LoadError::CycleDetected(path.join(" -> ")));
                    }
                    Mark::Unvisited => {
                        marks[p] = Mark::InProgress;
                        stack.push((p, 0));
                    }
                    Mark::Done => {}
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, uid: &EntityUid) -> Option<&Entity> {
        self.index.get(uid).map(|&idx| &self.entities[idx])
    }

    pub fn contains(&self, uid: &EntityUid) -> bool {
        self.index.contains_key(uid)
    }

    /// All entities of a type, in insertion order.
    pub fn all_of_type<'a>(&'a self, entity_type: &str) -> impl Iterator<Item = &'a Entity> + 'a {
        self.by_type
            .get(entity_type)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(move |&idx| &self.entities[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// The store contents in the load format, insertion order preserved.
    pub fn to_records(&self) -> Vec<Entity> {
        self.entities.clone()
    }

    /// Add a single new entity. Its parents must already be present.
    pub fn insert(&mut self, mut entity: Entity) -> Result<(), LoadError> {
        if self.contains(&entity.uid) {
            return Err(LoadError::DuplicateId(entity.uid));
        }
        entity.dedup_parents();
        if entity.parents.contains(&entity.uid) {
            return Err(LoadError::CycleDetected(format!(
                "{} -> {}",
                entity.uid, entity.uid
            )));
        }
        if let Some(parent) = entity.parents.iter().find(|p| !self.contains(p)) {
            return Err(LoadError::DanglingParent {
                entity: entity.uid.clone(),
                parent: parent.clone(),
            });
        }
        self.push(entity);
        Ok(())
    }

    /// Remove an entity that no other entity names as a parent.
    pub fn remove(&mut self, uid: &EntityUid) -> Result<Option<Entity>, LoadError> {
        let Some(&idx) = self.index.get(uid) else {
            return Ok(None);
        };
        if let Some(child) = self.entities.iter().find(|e| e.parents.contains(uid)) {
            return Err(LoadError::StillReferenced {
                entity: uid.clone(),
                child: child.uid.clone(),
            });
        }
        let removed = self.entities.remove(idx);
        self.reindex();
        Ok(Some(removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(t: &str, id: &str) -> EntityUid {
        EntityUid::new(t, id)
    }

    fn team_snapshot() -> Vec<Entity> {
        vec![
            Entity::new(uid("Application", "TinyTodo")),
            Entity::new(uid("Team", "team1")).with_parent(uid("Application", "TinyTodo")),
            Entity::new(uid("User", "alice"))
                .with_parent(uid("Team", "team1"))
                .with_attr("joblevel", AttrValue::Long(5)),
            Entity::new(uid("User", "bob")).with_parent(uid("Application", "TinyTodo")),
        ]
    }

    #[test]
    fn test_load_and_get_round_trip() {
        let snapshot = team_snapshot();
        let store = EntityStore::load(snapshot.clone()).unwrap();
        assert_eq!(store.len(), 4);
        for entity in &snapshot {
            assert_eq!(store.get(&entity.uid), Some(entity));
        }
        assert!(store.get(&uid("User", "carol")).is_none());
        assert_eq!(store.to_records(), snapshot);
    }

    #[test]
    fn test_all_of_type_keeps_insertion_order() {
        let mut snapshot = team_snapshot();
        snapshot.push(Entity::new(uid("User", "aaron")));
        let store = EntityStore::load(snapshot).unwrap();
        let users: Vec<&str> = store
            .all_of_type("User")
            .map(|e| e.uid.entity_id.as_str())
            .collect();
        assert_eq!(users, vec!["alice", "bob", "aaron"]);
        assert_eq!(store.all_of_type("Nothing").count(), 0);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut snapshot = team_snapshot();
        snapshot.push(Entity::new(uid("User", "alice")));
        let err = EntityStore::load(snapshot).unwrap_err();
        assert!(matches!(err, LoadError::DuplicateId(u) if u == uid("User", "alice")));
    }

    #[test]
    fn test_dangling_parent_rejected() {
        let snapshot = vec![Entity::new(uid("User", "alice")).with_parent(uid("Team", "ghost"))];
        let err = EntityStore::load(snapshot).unwrap_err();
        match err {
            LoadError::DanglingParent { entity, parent } => {
                assert_eq!(entity, uid("User", "alice"));
                assert_eq!(parent, uid("Team", "ghost"));
            }
            other => panic!("expected DanglingParent, got {other:?}"),
        }
    }

    #[test]
    fn test_two_node_cycle_rejected() {
        let snapshot = vec![
            Entity::new(uid("Team", "a")).with_parent(uid("Team", "b")),
            Entity::new(uid("Team", "b")).with_parent(uid("Team", "a")),
        ];
        let err = EntityStore::load(snapshot).unwrap_err();
        match err {
            LoadError::CycleDetected(path) => {
                assert_eq!(path, r#"Team::"a" -> Team::"b" -> Team::"a""#);
            }
            other => panic!("expected CycleDetected, got {other:?}"),
        }
    }

    #[test]
    fn test_self_parent_rejected() {
        let snapshot = vec![Entity::new(uid("Team", "a")).with_parent(uid("Team", "a"))];
        assert!(matches!(
            EntityStore::load(snapshot).unwrap_err(),
            LoadError::CycleDetected(_)
        ));
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let snapshot = vec![
            Entity::new(uid("Org", "root")),
            Entity::new(uid("Team", "left")).with_parent(uid("Org", "root")),
            Entity::new(uid("Team", "right")).with_parent(uid("Org", "root")),
            Entity::new(uid("User", "u"))
                .with_parent(uid("Team", "left"))
                .with_parent(uid("Team", "right")),
        ];
        assert!(EntityStore::load(snapshot).is_ok());
    }

    #[test]
    fn test_deep_chain_does_not_overflow() {
        let depth = 50_000;
        let snapshot: Vec<Entity> = (0..depth)
            .map(|i| {
                let e = Entity::new(uid("Team", &i.to_string()));
                if i + 1 < depth {
                    e.with_parent(uid("Team", &(i + 1).to_string()))
                } else {
                    e
                }
            })
            .collect();
        let store = EntityStore::load(snapshot).unwrap();
        assert_eq!(store.len(), depth);
    }

    #[test]
    fn test_duplicate_parents_collapsed() {
        let snapshot = vec![
            Entity::new(uid("Team", "t")),
            Entity::new(uid("User", "u"))
                .with_parent(uid("Team", "t"))
                .with_parent(uid("Team", "t")),
        ];
        let store = EntityStore::load(snapshot).unwrap();
        assert_eq!(store.get(&uid("User", "u")).unwrap().parents.len(), 1);
    }

    #[test]
    fn test_insert_validates() {
        let mut store = EntityStore::load(team_snapshot()).unwrap();
        store
            .insert(Entity::new(uid("User", "carol")).with_parent(uid("Team", "team1")))
            .unwrap();
        assert!(store.contains(&uid("User", "carol")));
        assert_eq!(store.all_of_type("User").count(), 3);

        assert!(matches!(
            store.insert(Entity::new(uid("User", "carol"))),
            Err(LoadError::DuplicateId(_))
        ));
        assert!(matches!(
            store.insert(Entity::new(uid("User", "dan")).with_parent(uid("Team", "nope"))),
            Err(LoadError::DanglingParent { .. })
        ));
        assert!(matches!(
            store.insert(Entity::new(uid("Team", "loop")).with_parent(uid("Team", "loop"))),
            Err(LoadError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_remove_rejects_referenced_parent() {
        let mut store = EntityStore::load(team_snapshot()).unwrap();
        let err = store.remove(&uid("Team", "team1")).unwrap_err();
        assert!(matches!(err, LoadError::StillReferenced { .. }));

        let removed = store.remove(&uid("User", "alice")).unwrap().unwrap();
        assert_eq!(removed.uid, uid("User", "alice"));
        assert!(store.remove(&uid("Team", "team1")).unwrap().is_some());
        assert!(store.remove(&uid("Team", "team1")).unwrap().is_none());

        // index still consistent after removals
        assert_eq!(store.get(&uid("User", "bob")).unwrap().uid, uid("User", "bob"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_generator_json_format() {
        let json = serde_json::json!([
            {"uid": {"__entity": {"type": "Application", "id": "TinyTodo"}}, "attrs": {}, "parents": []},
            {
                "uid": {"type": "User", "id": "user_0"},
                "attrs": {},
                "parents": [{"__entity": {"type": "Application", "id": "TinyTodo"}}]
            }
        ]);
        let entities: Vec<Entity> = serde_json::from_value(json).unwrap();
        let store = EntityStore::load(entities).unwrap();
        assert_eq!(
            store.get(&uid("User", "user_0")).unwrap().parents,
            vec![uid("Application", "TinyTodo")]
        );
    }
}
