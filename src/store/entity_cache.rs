use crate::model::{EntityHandle, EntityId};
use lru::LruCache;
use std::num::NonZeroUsize;

/// Why an entry left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// Invalidated by the model
    Explicit,
    /// Evicted to respect the capacity bound
    Capacity,
}

/// Hook run for every entry leaving the cache, used to repair secondary indexes
pub trait EvictionListener {
    fn on_removal(&mut self, id: EntityId, entity: &EntityHandle, cause: RemovalCause);
}

/// Bounded LRU cache of canonical entity instances
#[derive(Debug)]
pub struct EntityCache {
    entries: LruCache<EntityId, EntityHandle>,
}

impl EntityCache {
    /// Create a cache holding at most `capacity` entities
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
        }
    }

    /// Get an entity and mark it as recently used
    pub fn get(&mut self, id: EntityId) -> Option<EntityHandle> {
        self.entries.get(&id).cloned()
    }

    /// Get an entity without touching its recency
    pub fn peek(&self, id: EntityId) -> Option<EntityHandle> {
        self.entries.peek(&id).cloned()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entries.contains(&id)
    }

    /// Insert a canonical instance. If the bound is exceeded the least recently
    /// used entry is evicted and reported to the listener.
    pub fn put<L: EvictionListener>(&mut self, entity: EntityHandle, listener: &mut L) {
        let id = entity.id();
        if let Some((evicted_id, evicted)) = self.entries.push(id, entity) {
            // push also hands back the previous value of a replaced key
            if evicted_id != id {
                listener.on_removal(evicted_id, &evicted, RemovalCause::Capacity);
            }
        }
    }

    /// Remove an entity, reporting it to the listener
    pub fn invalidate<L: EvictionListener>(
        &mut self,
        id: EntityId,
        listener: &mut L,
    ) -> Option<EntityHandle> {
        let removed = self.entries.pop(&id)?;
        listener.on_removal(id, &removed, RemovalCause::Explicit);
        Some(removed)
    }

    /// Drop everything without running the listener
    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    /// All cached instances, most recently used first
    pub fn values(&self) -> Vec<EntityHandle> {
        self.entries.iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}
