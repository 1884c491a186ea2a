use im::HashMap;

use super::{EntityId, EntityKey};

/// Identifies a navigation property by owning type and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NavigationRef {
    pub owner_type: String,
    pub name: String,
}

impl NavigationRef {
    pub fn new(owner_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner_type: owner_type.into(),
            name: name.into(),
        }
    }
}

/// Children waiting on one parent through one navigation property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnattachedTuple {
    /// The child-side navigation property that should point at the parent.
    pub navigation: NavigationRef,
    pub children: Vec<EntityId>,
}

/// Holding area for loaded children whose parent is not cached yet.
///
/// Keyed by the parent's key, which may be a temporary key.
#[derive(Debug, Clone, Default)]
pub struct UnattachedChildrenMap {
    map: HashMap<EntityKey, Vec<UnattachedTuple>>,
}

impl UnattachedChildrenMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `child` under `parent_key`. Adding the same child twice is a no-op.
    pub fn add_child(&mut self, parent_key: &EntityKey, navigation: NavigationRef, child: EntityId) {
        let tuples = self.map.entry(parent_key.clone()).or_insert_with(Vec::new);
        match tuples.iter_mut().find(|t| t.navigation == navigation) {
            Some(tuple) => {
                if !tuple.children.contains(&child) {
                    tuple.children.push(child);
                }
            }
            None => tuples.push(UnattachedTuple {
                navigation,
                children: vec![child],
            }),
        }
    }

    pub fn get(&self, parent_key: &EntityKey) -> Option<&[UnattachedTuple]> {
        self.map.get(parent_key).map(Vec::as_slice)
    }

    /// Remove and return everything waiting on `parent_key`.
    pub fn take_children(&mut self, parent_key: &EntityKey) -> Vec<UnattachedTuple> {
        self.map.remove(parent_key).unwrap_or_default()
    }

    /// Forget a child everywhere, dropping entries that become empty.
    pub fn remove_child(&mut self, child: EntityId) {
        let parents: Vec<EntityKey> = self
            .map
            .iter()
            .filter(|(_, tuples)| tuples.iter().any(|t| t.children.contains(&child)))
            .map(|(key, _)| key.clone())
            .collect();
        for parent in parents {
            let Some(tuples) = self.map.get_mut(&parent) else {
                continue;
            };
            for tuple in tuples.iter_mut() {
                tuple.children.retain(|id| *id != child);
            }
            tuples.retain(|t| !t.children.is_empty());
            if tuples.is_empty() {
                self.map.remove(&parent);
            }
        }
    }

    /// Re-file entries after a parent's temporary key became real.
    pub fn rekey(&mut self, old_key: &EntityKey, new_key: &EntityKey) {
        if let Some(tuples) = self.map.remove(old_key) {
            let target = self.map.entry(new_key.clone()).or_insert_with(Vec::new);
            for tuple in tuples {
                for child in tuple.children {
                    match target.iter_mut().find(|t| t.navigation == tuple.navigation) {
                        Some(existing) if existing.children.contains(&child) => {}
                        Some(existing) => existing.children.push(child),
                        None => target.push(UnattachedTuple {
                            navigation: tuple.navigation.clone(),
                            children: vec![child],
                        }),
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}
