use log::{debug, error, warn};
use std::collections::HashSet;

use super::{EntityModel, WriteGuard};
use crate::error::ModelResult;
use crate::model::{ChildRef, EntityHandle, EntityId, Invalidation, ModelEvent};

impl EntityModel {
    /// Drop the entities from the cache and reload them right away. With
    /// `recurse` the whole cached subtree is invalidated. Parents that held an
    /// edge to an invalidated entity are repointed at the reloaded instance.
    ///
    /// Holders of the old handles must drop them; the event lists every
    /// visited entity. Fails with `OnUiThread` when called from the UI thread.
    pub async fn invalidate(&self, entities: &[EntityHandle], recurse: bool) -> ModelResult<()> {
        self.ensure_not_on_ui_thread("invalidate")?;
        let guard = self.lock().await;
        self.invalidate_and_notify(&guard, entities.to_vec(), recurse).await
    }

    pub async fn invalidate_entity(&self, entity: &EntityHandle, recurse: bool) -> ModelResult<()> {
        self.invalidate(std::slice::from_ref(entity), recurse).await
    }

    /// Invalidate the cached entities among `ids`; the others are ignored
    pub async fn invalidate_ids(&self, ids: &[EntityId]) -> ModelResult<()> {
        self.ensure_not_on_ui_thread("invalidate")?;
        let guard = self.lock().await;
        self.invalidate_ids_locked(&guard, ids).await
    }

    pub(super) async fn invalidate_ids_locked(&self, guard: &WriteGuard<'_>, ids: &[EntityId]) -> ModelResult<()> {
        let cached: Vec<EntityHandle> = ids.iter().filter_map(|id| self.get_if_cached(*id)).collect();
        self.invalidate_and_notify(guard, cached, false).await
    }

    /// Clear the whole model without reloading anything
    pub async fn invalidate_all(&self) {
        let _guard = self.lock().await;
        debug!("Invalidating the whole model");
        {
            let mut state = self.state.lock();
            state.cache.invalidate_all();
            state.index.clear();
        }
        self.event_bus
            .post(ModelEvent::EntityInvalidated(Invalidation::All));
    }

    pub(super) async fn invalidate_and_notify(
        &self,
        guard: &WriteGuard<'_>,
        entities: Vec<EntityHandle>,
        recurse: bool,
    ) -> ModelResult<()> {
        let visited = self.invalidate_locked(guard, entities, recurse).await?;
        if !visited.is_empty() {
            self.notify_entities_invalidated(visited);
        }
        Ok(())
    }

    /// Walk the entities (and their subtrees with `recurse`) depth first,
    /// reloading each one. A failed reload is logged and its subtree skipped.
    async fn invalidate_locked(
        &self,
        guard: &WriteGuard<'_>,
        entities: Vec<EntityHandle>,
        recurse: bool,
    ) -> ModelResult<Vec<EntityHandle>> {
        self.ensure_not_on_ui_thread("invalidate")?;

        let mut visited_ids = HashSet::new();
        let mut visited = Vec::new();
        let mut pending: Vec<EntityHandle> = entities.into_iter().rev().collect();

        while let Some(entity) = pending.pop() {
            let id = entity.id();
            if visited_ids.contains(&id) {
                continue;
            }
            let initialized = entity.read().is_initialized();
            if !initialized {
                continue;
            }
            if !self.is_cached(id) {
                warn!("Invalidating {} which is not in the model", entity.identify());
            }
            debug!("Invalidating {}", entity.identify());
            visited_ids.insert(id);
            visited.push(entity.clone());

            // the listener forgets the parents of a removed entity, keep a copy
            let parent_ids = {
                let mut state = self.state.lock();
                let parent_ids = state.index.parents_of(id);
                state.remove(id);
                parent_ids
            };

            let reloaded = match self.facade.get_entity_by_id(id).await {
                Ok(Some(fresh)) => self.put_or_update(guard, fresh),
                Ok(None) => {
                    debug!("Entity {} no longer exists or is no longer readable", id);
                    None
                }
                Err(e) => {
                    error!("Problem reloading invalidated entity {}: {:#}", id, e);
                    None
                }
            };
            let Some(canonical) = reloaded else {
                continue;
            };

            self.repoint_parents(&canonical, &parent_ids);

            if recurse {
                let children = entity.read().children();
                pending.extend(children.into_iter().rev());
            }
        }

        Ok(visited)
    }

    /// Point the edges of the given cached parents at the canonical instance
    fn repoint_parents(&self, canonical: &EntityHandle, parent_ids: &[EntityId]) {
        let id = canonical.id();
        for &parent_id in parent_ids {
            let Some(parent) = self.get_if_cached(parent_id) else {
                debug!("Parent {} of {} is no longer cached", parent_id, id);
                continue;
            };
            let mut repointed = false;
            {
                let mut parent = parent.write();
                for ed in parent.entity_data.iter_mut().filter(|ed| ed.points_at(id)) {
                    ed.child = Some(ChildRef::Loaded(canonical.clone()));
                    repointed = true;
                }
            }
            if repointed {
                self.state.lock().index.add_parent(id, parent_id);
            } else {
                debug!("Entity {} was not found among the edges of parent {}", id, parent_id);
            }
        }
    }
}
