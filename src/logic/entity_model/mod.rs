//! Canonical client-side cache of entities fetched through the facade.
//!
//! Every entity id maps to at most one [`EntityHandle`]. Fetched values are
//! merged into the cached instance in place, and every cached edge pointing at
//! an id is rewritten to the canonical handle, so holders of a handle always
//! see the latest state.
//!
//! Locking: mutations are serialized by `write_lock`, an async mutex held for
//! the whole operation including the remote calls. Helpers that need it take
//! the held [`WriteGuard`] as a parameter instead of locking again. The short
//! `state` lock protects the cache and its indexes and is never held while an
//! entity lock is taken.

mod invalidation;
mod mutations;
mod roots;

use log::{debug, trace, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{ModelError, ModelResult};
use crate::logic::event_bus::EventBus;
use crate::logic::notification::UiDispatcher;
use crate::model::{ChildRef, Entity, EntityData, EntityHandle, EntityId, Invalidation, ModelEvent};
use crate::store::{EntityCache, EvictionListener, Facade, RemovalCause};

/// Proof that the model's write lock is held
pub(crate) struct WriteGuard<'a> {
    _guard: tokio::sync::MutexGuard<'a, ()>,
}

/// Secondary indexes repaired whenever an entity leaves the cache
#[derive(Default)]
struct ModelIndex {
    /// child id -> ids of cached parents holding an edge to it
    parents: HashMap<EntityId, HashSet<EntityId>>,
    workspaces: Vec<EntityHandle>,
    ontology_roots: Vec<EntityHandle>,
}

impl ModelIndex {
    fn parents_of(&self, id: EntityId) -> Vec<EntityId> {
        self.parents
            .get(&id)
            .map(|parents| parents.iter().copied().collect())
            .unwrap_or_default()
    }

    fn add_parent(&mut self, child_id: EntityId, parent_id: EntityId) {
        self.parents.entry(child_id).or_default().insert(parent_id);
    }

    fn clear(&mut self) {
        self.parents.clear();
        self.workspaces.clear();
        self.ontology_roots.clear();
    }
}

impl EvictionListener for ModelIndex {
    fn on_removal(&mut self, id: EntityId, entity: &EntityHandle, cause: RemovalCause) {
        trace!("Removing {:?} from the model ({:?})", entity, cause);
        self.parents.remove(&id);
        if self.workspaces.iter().any(|ws| ws.id() == id) {
            debug!("Workspace {} left the cache, clearing workspace cache", id);
            self.workspaces.clear();
        }
        if self.ontology_roots.iter().any(|root| root.id() == id) {
            debug!("Ontology root {} left the cache, clearing ontology root cache", id);
            self.ontology_roots.clear();
        }
    }
}

struct CacheState {
    cache: EntityCache,
    index: ModelIndex,
}

impl CacheState {
    fn insert(&mut self, entity: EntityHandle) {
        self.cache.put(entity, &mut self.index);
    }

    fn remove(&mut self, id: EntityId) -> Option<EntityHandle> {
        self.cache.invalidate(id, &mut self.index)
    }
}

pub struct EntityModel {
    facade: Arc<dyn Facade>,
    event_bus: Arc<EventBus>,
    ui: Arc<UiDispatcher>,
    write_lock: tokio::sync::Mutex<()>,
    state: Mutex<CacheState>,
}

impl EntityModel {
    pub fn new(
        facade: Arc<dyn Facade>,
        event_bus: Arc<EventBus>,
        ui: Arc<UiDispatcher>,
        cache_capacity: usize,
    ) -> Self {
        Self {
            facade,
            event_bus,
            ui,
            write_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(CacheState {
                cache: EntityCache::new(cache_capacity),
                index: ModelIndex::default(),
            }),
        }
    }

    pub(crate) async fn lock(&self) -> WriteGuard<'_> {
        WriteGuard {
            _guard: self.write_lock.lock().await,
        }
    }

    pub fn facade(&self) -> &Arc<dyn Facade> {
        &self.facade
    }

    pub fn subject_key(&self) -> &str {
        self.facade.subject_key()
    }

    /// Cached instance for the id, without fetching
    pub fn get_if_cached(&self, id: EntityId) -> Option<EntityHandle> {
        self.state.lock().cache.peek(id)
    }

    pub fn is_cached(&self, id: EntityId) -> bool {
        self.state.lock().cache.contains(id)
    }

    pub fn cached_count(&self) -> usize {
        self.state.lock().cache.len()
    }

    pub fn cache_capacity(&self) -> usize {
        self.state.lock().cache.capacity()
    }

    /// Ids of cached entities known to hold an edge to `child_id`
    pub fn cached_parent_ids(&self, child_id: EntityId) -> Vec<EntityId> {
        let mut ids = self.state.lock().index.parents_of(child_id);
        ids.sort_unstable();
        ids
    }

    /// Cached workspaces, without fetching
    pub fn cached_workspaces(&self) -> Vec<EntityHandle> {
        self.state.lock().index.workspaces.clone()
    }

    pub fn cached_ontology_roots(&self) -> Vec<EntityHandle> {
        self.state.lock().index.ontology_roots.clone()
    }

    fn ensure_not_on_ui_thread(&self, operation: &'static str) -> ModelResult<()> {
        if self.ui.is_dispatch_thread() {
            return Err(ModelError::OnUiThread { operation });
        }
        Ok(())
    }

    /// Return the canonical instance for the handle's id. A handle that is not
    /// the cached instance is a caller bug; it is logged and replaced.
    fn canonicalize(&self, entity: &EntityHandle) -> EntityHandle {
        match self.get_if_cached(entity.id()) {
            Some(canonical) if canonical.ptr_eq(entity) => canonical,
            Some(canonical) => {
                warn!(
                    "Instance mismatch for {} (cached instance differs), using the cached instance",
                    entity.identify()
                );
                canonical
            }
            None => {
                warn!("{} is not in the model", entity.identify());
                entity.clone()
            }
        }
    }

    // ----- merge -----

    /// Merge a fetched entity into the cache and return the canonical instance.
    /// Uninitialized payloads are never admitted.
    fn put_or_update(&self, _guard: &WriteGuard<'_>, entity: Entity) -> Option<EntityHandle> {
        if !entity.is_initialized() {
            debug!("Not caching uninitialized entity {}", entity.id);
            return None;
        }

        let cached = self.state.lock().cache.get(entity.id);
        let canonical = match cached {
            Some(canonical) => {
                let changed = !canonical.read().is_equivalent(&entity);
                if changed {
                    trace!("Updating cached instance {}", entity.identify());
                    canonical.write().update_from(entity);
                    self.notify_entity_changed(&canonical);
                } else {
                    trace!("Cached instance {} is unchanged", entity.identify());
                }
                canonical
            }
            None => {
                trace!("Caching {}", entity.identify());
                let handle = EntityHandle::new(entity);
                self.state.lock().insert(handle.clone());
                handle
            }
        };

        self.relink(&canonical);
        Some(canonical)
    }

    /// Rewrite every cached reference around `canonical`: its own edges, the
    /// edges of cached parents pointing at it, and its children.
    fn relink(&self, canonical: &EntityHandle) {
        let id = canonical.id();

        for ed in canonical.write().entity_data.iter_mut() {
            ed.parent_id = Some(id);
        }

        let parents: Vec<EntityHandle> = {
            let state = self.state.lock();
            state
                .index
                .parents_of(id)
                .into_iter()
                .filter_map(|parent_id| state.cache.peek(parent_id))
                .collect()
        };
        for parent in parents {
            let mut parent = parent.write();
            for ed in parent.entity_data.iter_mut().filter(|ed| ed.points_at(id)) {
                ed.child = Some(ChildRef::Loaded(canonical.clone()));
            }
        }

        let child_ids: Vec<(usize, EntityId)> = canonical
            .read()
            .entity_data
            .iter()
            .enumerate()
            .filter_map(|(i, ed)| ed.child_id().map(|child_id| (i, child_id)))
            .collect();
        let cached_children: Vec<(usize, EntityHandle)> = {
            let state = self.state.lock();
            child_ids
                .into_iter()
                .filter_map(|(i, child_id)| state.cache.peek(child_id).map(|child| (i, child)))
                .collect()
        };
        {
            let mut entity = canonical.write();
            for (i, child) in &cached_children {
                if let Some(ed) = entity.entity_data.get_mut(*i) {
                    ed.child = Some(ChildRef::Loaded(child.clone()));
                }
            }
        }
        {
            let mut state = self.state.lock();
            for (_, child) in &cached_children {
                state.index.add_parent(child.id(), id);
            }
        }

        let entity = canonical.read();
        if entity.children_loaded() {
            if let Some(expected) = entity.num_children {
                let actual = entity.child_count() as i32;
                if expected != actual {
                    warn!(
                        "{} claims {} children but has {} child edges",
                        entity.identify(),
                        expected,
                        actual
                    );
                }
            }
        }
    }

    /// Point still-unloaded edges of `parent` at the given canonical children
    fn install_children(&self, parent: &EntityHandle, children: &[EntityHandle]) {
        let by_id: HashMap<EntityId, &EntityHandle> = children.iter().map(|c| (c.id(), c)).collect();
        let mut installed = Vec::new();
        {
            let mut entity = parent.write();
            for ed in entity.entity_data.iter_mut() {
                if let Some(ChildRef::Unloaded(child_id)) = ed.child {
                    if let Some(child) = by_id.get(&child_id) {
                        ed.child = Some(ChildRef::Loaded((*child).clone()));
                        installed.push(child_id);
                    }
                }
            }
        }
        let parent_id = parent.id();
        let mut state = self.state.lock();
        for child_id in installed {
            if state.cache.contains(child_id) {
                state.index.add_parent(child_id, parent_id);
            }
        }
    }

    /// Merge a fetched tree, children first. Forbidden children are left alone.
    fn put_or_update_tree(&self, guard: &WriteGuard<'_>, entity: Entity) -> Option<EntityHandle> {
        let mut entity = entity;
        for ed in entity.entity_data.iter_mut() {
            if let Some(ChildRef::Loaded(child)) = &ed.child {
                let child_entity = child.snapshot();
                if let Some(canonical) = self.put_or_update_tree(guard, child_entity) {
                    ed.child = Some(ChildRef::Loaded(canonical));
                }
            }
        }
        self.put_or_update(guard, entity)
    }

    fn put_or_update_all(&self, guard: &WriteGuard<'_>, entities: Vec<Entity>) -> Vec<EntityHandle> {
        entities
            .into_iter()
            .filter_map(|entity| self.put_or_update(guard, entity))
            .collect()
    }

    /// Merge an entity the caller expects to be admitted
    fn admit(&self, guard: &WriteGuard<'_>, entity: Entity) -> ModelResult<EntityHandle> {
        let id = entity.id;
        self.put_or_update(guard, entity).ok_or_else(|| {
            ModelError::Remote(anyhow::anyhow!("server returned uninitialized entity {}", id))
        })
    }

    /// The cached instance for the child of an edge, if there is one
    fn canonical_child(&self, child: Option<ChildRef>) -> Option<ChildRef> {
        match child {
            Some(ChildRef::Forbidden(id)) => Some(ChildRef::Forbidden(id)),
            Some(child) => match self.get_if_cached(child.id()) {
                Some(canonical) => Some(ChildRef::Loaded(canonical)),
                None => Some(child),
            },
            None => None,
        }
    }

    // ----- reads -----

    pub async fn get_entity_by_id(&self, id: EntityId) -> ModelResult<Option<EntityHandle>> {
        let cached = self.state.lock().cache.get(id);
        if let Some(entity) = cached {
            trace!("Cache hit for entity {}", id);
            return Ok(Some(entity));
        }
        let guard = self.lock().await;
        self.get_entity_by_id_locked(&guard, id).await
    }

    async fn get_entity_by_id_locked(
        &self,
        guard: &WriteGuard<'_>,
        id: EntityId,
    ) -> ModelResult<Option<EntityHandle>> {
        let cached = self.state.lock().cache.get(id);
        if let Some(entity) = cached {
            return Ok(Some(entity));
        }
        debug!("Fetching entity {}", id);
        let fetched = self.facade.get_entity_by_id(id).await?;
        Ok(fetched.and_then(|entity| self.put_or_update(guard, entity)))
    }

    /// Cached entities first, then one remote call for the misses. Results
    /// follow the order of `ids`; ids that do not exist or are not readable
    /// are left out.
    pub async fn get_entities_by_id(&self, ids: &[EntityId]) -> ModelResult<Vec<EntityHandle>> {
        let guard = self.lock().await;
        let mut found: HashMap<EntityId, EntityHandle> = HashMap::new();
        let mut missing = Vec::new();
        {
            let mut state = self.state.lock();
            for &id in ids {
                match state.cache.get(id) {
                    Some(entity) => {
                        found.insert(id, entity);
                    }
                    None => missing.push(id),
                }
            }
        }
        if !missing.is_empty() {
            debug!("Fetching {} of {} entities", missing.len(), ids.len());
            let fetched = self.facade.get_entities_by_id(&missing).await?;
            for entity in self.put_or_update_all(&guard, fetched) {
                found.insert(entity.id(), entity);
            }
        }
        Ok(ids.iter().filter_map(|id| found.get(id).cloned()).collect())
    }

    /// Fetch the entity again and merge it
    pub async fn reload(&self, entity: &EntityHandle) -> ModelResult<Option<EntityHandle>> {
        self.reload_by_id(entity.id()).await
    }

    pub async fn reload_by_id(&self, id: EntityId) -> ModelResult<Option<EntityHandle>> {
        let guard = self.lock().await;
        self.reload_by_id_locked(&guard, id).await
    }

    async fn reload_by_id_locked(
        &self,
        guard: &WriteGuard<'_>,
        id: EntityId,
    ) -> ModelResult<Option<EntityHandle>> {
        debug!("Reloading entity {}", id);
        let fetched = self.facade.get_entity_by_id(id).await?;
        Ok(fetched.and_then(|entity| self.put_or_update(guard, entity)))
    }

    pub async fn reload_by_ids(&self, ids: &[EntityId]) -> ModelResult<Vec<EntityHandle>> {
        let guard = self.lock().await;
        debug!("Reloading {} entities", ids.len());
        let fetched = self.facade.get_entities_by_id(ids).await?;
        Ok(self.put_or_update_all(&guard, fetched))
    }

    /// Fetch the entity with its whole readable subtree. Children the subject
    /// may not read become forbidden references.
    pub async fn get_entity_tree(&self, id: EntityId) -> ModelResult<Option<EntityHandle>> {
        let guard = self.lock().await;
        debug!("Fetching entity tree {}", id);
        let Some(mut tree) = self.facade.get_entity_tree(id).await? else {
            return Ok(None);
        };
        mark_unloaded_as_forbidden(&mut tree, true, None, &mut HashSet::new());
        Ok(self.put_or_update_tree(&guard, tree))
    }

    pub async fn get_entity_and_children(&self, id: EntityId) -> ModelResult<Option<EntityHandle>> {
        let guard = self.lock().await;
        let Some(entity) = self.get_entity_by_id_locked(&guard, id).await? else {
            return Ok(None);
        };
        let loaded = entity.read().children_loaded();
        if !loaded {
            self.refresh_children_locked(&guard, &entity).await?;
        }
        Ok(Some(entity))
    }

    /// Make sure the children of the entity, and with `recurse` of its whole
    /// subtree, are loaded.
    pub async fn load_lazy_entity(&self, entity: &EntityHandle, recurse: bool) -> ModelResult<EntityHandle> {
        let guard = self.lock().await;
        self.load_lazy_entity_locked(&guard, entity, recurse).await
    }

    async fn load_lazy_entity_locked(
        &self,
        guard: &WriteGuard<'_>,
        entity: &EntityHandle,
        recurse: bool,
    ) -> ModelResult<EntityHandle> {
        let canonical = self
            .put_or_update(guard, entity.snapshot())
            .unwrap_or_else(|| entity.clone());

        if !recurse {
            if canonical.read().children_loaded() {
                self.notify_children_loaded(&canonical);
            } else {
                self.refresh_children_locked(guard, &canonical).await?;
            }
            return Ok(canonical);
        }

        let mut visited = HashSet::new();
        let mut pending = vec![canonical.clone()];
        while let Some(current) = pending.pop() {
            if !visited.insert(current.id()) {
                continue;
            }
            let loaded = current.read().children_loaded();
            if loaded {
                self.notify_children_loaded(&current);
            } else {
                self.refresh_children_locked(guard, &current).await?;
            }
            pending.extend(current.read().children());
        }
        Ok(canonical)
    }

    /// Fetch and cache the children of the entity, then relink it
    pub async fn refresh_children(&self, entity: &EntityHandle) -> ModelResult<()> {
        let guard = self.lock().await;
        self.refresh_children_locked(&guard, entity).await
    }

    async fn refresh_children_locked(&self, guard: &WriteGuard<'_>, entity: &EntityHandle) -> ModelResult<()> {
        let entity = self.canonicalize(entity);
        debug!("Refreshing children of {}", entity.identify());
        let children = self.facade.get_child_entities(entity.id()).await?;
        let fetched = self.put_or_update_all(guard, children);
        self.relink(&entity);
        // small caches may already have evicted earlier children, so the
        // returned handles are installed directly
        self.install_children(&entity, &fetched);
        mark_unloaded_as_forbidden(&mut entity.write(), false, None, &mut HashSet::new());
        self.notify_children_loaded(&entity);
        Ok(())
    }

    // ----- queries -----

    pub async fn get_entities_by_name(&self, name: &str) -> ModelResult<Vec<EntityHandle>> {
        let guard = self.lock().await;
        let fetched = self.facade.get_entities_by_name(name).await?;
        Ok(self.put_or_update_all(&guard, fetched))
    }

    pub async fn get_entities_by_type_name(&self, type_name: &str) -> ModelResult<Vec<EntityHandle>> {
        let guard = self.lock().await;
        let fetched = self.facade.get_entities_by_type_name(type_name).await?;
        Ok(self.put_or_update_all(&guard, fetched))
    }

    pub async fn get_parent_entities(&self, child_id: EntityId) -> ModelResult<Vec<EntityHandle>> {
        let guard = self.lock().await;
        let fetched = self.facade.get_parent_entities(child_id).await?;
        Ok(self.put_or_update_all(&guard, fetched))
    }

    pub async fn get_owned_entities_by_name(&self, name: &str) -> ModelResult<Vec<EntityHandle>> {
        let guard = self.lock().await;
        let fetched = self.facade.get_owned_entities_by_name(name).await?;
        Ok(self.put_or_update_all(&guard, fetched))
    }

    pub async fn get_owned_entities_by_type_name(&self, type_name: &str) -> ModelResult<Vec<EntityHandle>> {
        let guard = self.lock().await;
        let fetched = self.facade.get_owned_entities_by_type_name(type_name).await?;
        Ok(self.put_or_update_all(&guard, fetched))
    }

    /// Data sets readable by the current subject
    pub async fn get_data_sets(&self) -> ModelResult<Vec<EntityHandle>> {
        let guard = self.lock().await;
        let fetched = self.facade.get_data_sets().await?;
        Ok(self.put_or_update_all(&guard, fetched))
    }

    /// Edges pointing at the child, each carrying the canonical child instance
    pub async fn get_parent_entity_datas(&self, child_id: EntityId) -> ModelResult<Vec<EntityData>> {
        let guard = self.lock().await;
        let edges = self.facade.get_parent_entity_datas(child_id).await?;
        self.with_canonical_child(&guard, child_id, edges).await
    }

    /// Like [`Self::get_parent_entity_datas`], including edges from parents
    /// the subject cannot read
    pub async fn get_all_parent_entity_datas(&self, child_id: EntityId) -> ModelResult<Vec<EntityData>> {
        let guard = self.lock().await;
        let edges = self.facade.get_all_parent_entity_datas(child_id).await?;
        self.with_canonical_child(&guard, child_id, edges).await
    }

    async fn with_canonical_child(
        &self,
        guard: &WriteGuard<'_>,
        child_id: EntityId,
        edges: Vec<EntityData>,
    ) -> ModelResult<Vec<EntityData>> {
        let child = self.get_entity_by_id_locked(guard, child_id).await?;
        Ok(edges
            .into_iter()
            .map(|mut ed| {
                if let Some(child) = &child {
                    ed.child = Some(ChildRef::Loaded(child.clone()));
                }
                ed
            })
            .collect())
    }

    pub async fn get_ancestor_with_type(
        &self,
        entity: &EntityHandle,
        type_name: &str,
    ) -> ModelResult<Option<EntityHandle>> {
        let guard = self.lock().await;
        let fetched = self.facade.get_ancestor_with_type(entity.id(), type_name).await?;
        Ok(fetched.and_then(|ancestor| self.put_or_update(&guard, ancestor)))
    }

    // ----- events -----

    fn notify_entity_changed(&self, entity: &EntityHandle) {
        trace!("Entity changed: {:?}", entity);
        self.event_bus.post(ModelEvent::EntityChanged(entity.clone()));
    }

    fn notify_entity_created(&self, entity: &EntityHandle) {
        trace!("Entity created: {:?}", entity);
        self.event_bus.post(ModelEvent::EntityCreated(entity.clone()));
    }

    fn notify_entity_removed(&self, entity: &EntityHandle, parent_edges: Vec<EntityData>) {
        trace!("Entity removed: {:?}", entity);
        self.event_bus.post(ModelEvent::EntityRemoved {
            entity: entity.clone(),
            parent_edges,
        });
    }

    fn notify_entities_invalidated(&self, entities: Vec<EntityHandle>) {
        trace!("Entities invalidated: {:?}", entities);
        self.event_bus
            .post(ModelEvent::EntityInvalidated(Invalidation::Entities(entities)));
    }

    fn notify_children_loaded(&self, entity: &EntityHandle) {
        trace!("Children loaded: {:?}", entity);
        self.event_bus.post(ModelEvent::EntityChildrenLoaded(entity.clone()));
    }
}

/// Turn still-unloaded children into forbidden references. With `only`, only
/// the listed ids are converted.
fn mark_unloaded_as_forbidden(
    entity: &mut Entity,
    recurse: bool,
    only: Option<&HashSet<EntityId>>,
    visited: &mut HashSet<EntityId>,
) {
    if !visited.insert(entity.id) {
        return;
    }
    for ed in entity.entity_data.iter_mut() {
        match ed.child {
            Some(ChildRef::Unloaded(child_id)) => {
                if only.map_or(true, |ids| ids.contains(&child_id)) {
                    ed.child = Some(ChildRef::Forbidden(child_id));
                }
            }
            Some(ChildRef::Loaded(ref child)) if recurse => {
                let child = child.clone();
                mark_unloaded_as_forbidden(&mut child.write(), recurse, only, visited);
            }
            _ => {}
        }
    }
}

/// Swap forbidden references back to unloaded ones, collecting their ids
fn mark_forbidden_as_unloaded(entity: &mut Entity, forbidden: &mut HashSet<EntityId>) {
    for ed in entity.entity_data.iter_mut() {
        if let Some(ChildRef::Forbidden(child_id)) = ed.child {
            forbidden.insert(child_id);
            ed.child = Some(ChildRef::Unloaded(child_id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_round_trip_only_touches_listed_ids() {
        let mut entity = Entity::new(1, "Folder", "Folder");
        entity.entity_data.push(EntityData::to_child("Entity", ChildRef::Forbidden(2), Some(0)));
        entity.entity_data.push(EntityData::to_child("Entity", ChildRef::Unloaded(3), Some(1)));

        let mut forbidden = HashSet::new();
        mark_forbidden_as_unloaded(&mut entity, &mut forbidden);
        assert_eq!(forbidden, HashSet::from([2]));
        assert!(entity.entity_data.iter().all(|ed| matches!(ed.child, Some(ChildRef::Unloaded(_)))));

        mark_unloaded_as_forbidden(&mut entity, false, Some(&forbidden), &mut HashSet::new());
        assert!(matches!(entity.entity_data[0].child, Some(ChildRef::Forbidden(2))));
        assert!(matches!(entity.entity_data[1].child, Some(ChildRef::Unloaded(3))));
    }

    #[test]
    fn test_index_listener_clears_roots() {
        let mut index = ModelIndex::default();
        let workspace = EntityHandle::new(Entity::new(1, "Workspace", "Workspace"));
        index.workspaces.push(workspace.clone());
        index.add_parent(1, 50);
        index.add_parent(2, 1);

        index.on_removal(1, &workspace, RemovalCause::Capacity);

        assert!(index.workspaces.is_empty());
        assert!(index.parents_of(1).is_empty());
        assert_eq!(index.parents_of(2), vec![1]);
    }
}
