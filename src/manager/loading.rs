// ============================================================================
// Loading scope
// ============================================================================
//
// While a merge or import runs, change notifications are buffered instead of
// published one by one. `begin_loading` hands out a token; ending the scope
// restores the previous flag and, once no scope is open, flushes the buffer.
// Cache-mutating merge steps take the token as a parameter so they can only
// run inside a scope.
//
// An atomic scope also snapshots the cache containers first. They are
// persistent maps, so the snapshot is a cheap clone; a failed load puts them
// back and drops the notifications it buffered.
//
// ============================================================================

use std::collections::HashMap;

use tracing::warn;

use super::EntityManager;
use crate::core::Result;
use crate::entity::{Entity, EntityChanged, EntityGroup, EntityId, EntityKey, UnattachedChildrenMap};

/// Proof that a loading scope is open on a manager.
#[must_use = "end the scope with EntityManager::end_loading"]
#[derive(Debug)]
pub struct LoadingScope {
    was_loading: bool,
}

/// Cache contents captured before an all-or-nothing load.
struct CacheSnapshot {
    entities: im::HashMap<EntityId, Entity>,
    groups: HashMap<String, EntityGroup>,
    unattached: UnattachedChildrenMap,
    temp_keys: Vec<EntityKey>,
    pending_events: usize,
}

impl EntityManager {
    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn begin_loading(&mut self) -> LoadingScope {
        let scope = LoadingScope {
            was_loading: self.loading,
        };
        self.loading = true;
        scope
    }

    pub fn end_loading(&mut self, scope: LoadingScope) {
        self.loading = scope.was_loading;
        if !self.loading {
            self.flush_events();
        }
    }

    /// Run `f` inside a loading scope. The flag is restored whether `f`
    /// succeeds or fails, then buffered notifications are published.
    pub fn with_loading<T>(&mut self, f: impl FnOnce(&mut Self, &LoadingScope) -> Result<T>) -> Result<T> {
        let scope = self.begin_loading();
        let result = f(self, &scope);
        self.end_loading(scope);
        result
    }

    /// Run `f` inside a loading scope and keep its changes only if it
    /// succeeds. On error the cache is exactly as it was before the call
    /// and no notification from `f` is published.
    pub fn with_atomic_loading<T>(&mut self, f: impl FnOnce(&mut Self, &LoadingScope) -> Result<T>) -> Result<T> {
        let snapshot = self.snapshot();
        let scope = self.begin_loading();
        let result = f(self, &scope);
        if let Err(err) = &result {
            warn!(manager = %self.id(), error = %err, "Load failed, restoring cache");
            self.restore(snapshot);
        }
        self.end_loading(scope);
        result
    }

    fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            entities: self.entities.clone(),
            groups: self.groups.clone(),
            unattached: self.unattached.clone(),
            temp_keys: self.key_generator.temp_keys(),
            pending_events: self.pending_events.len(),
        }
    }

    fn restore(&mut self, snapshot: CacheSnapshot) {
        self.entities = snapshot.entities;
        self.groups = snapshot.groups;
        self.unattached = snapshot.unattached;
        for key in self.key_generator.temp_keys() {
            if !snapshot.temp_keys.contains(&key) {
                self.key_generator.remove_temp_key(&key);
            }
        }
        for key in snapshot.temp_keys {
            if !self.key_generator.is_temp_key(&key) {
                self.key_generator.add_temp_key(key);
            }
        }
        self.pending_events.truncate(snapshot.pending_events);
    }

    pub(crate) fn notify(&mut self, event: EntityChanged) {
        if self.loading {
            self.pending_events.push(event);
        } else {
            // No subscribers is not an error.
            let _ = self.events.send(event);
        }
    }

    fn flush_events(&mut self) {
        for event in std::mem::take(&mut self.pending_events) {
            let _ = self.events.send(event);
        }
    }
}
