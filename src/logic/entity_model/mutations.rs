use log::debug;
use std::collections::HashSet;

use super::{mark_forbidden_as_unloaded, mark_unloaded_as_forbidden, EntityModel, WriteGuard};
use crate::error::{ModelError, ModelResult};
use crate::model::{attributes, ChildRef, Entity, EntityData, EntityDataId, EntityHandle, EntityId};

fn saved_id(entity_data: &EntityData) -> ModelResult<EntityDataId> {
    entity_data
        .id
        .ok_or_else(|| ModelError::InvalidArgument("entity data has not been saved".to_string()))
}

impl EntityModel {
    pub async fn create_entity(&self, type_name: &str, name: &str) -> ModelResult<EntityHandle> {
        let entity = {
            let guard = self.lock().await;
            let created = self.facade.create_entity(type_name, name).await?;
            self.admit(&guard, created)?
        };
        debug!("Created new entity {}", entity.identify());
        self.notify_entity_created(&entity);
        Ok(entity)
    }

    /// Create a data set for the current subject
    pub async fn create_data_set(&self, name: &str) -> ModelResult<EntityHandle> {
        let data_set = {
            let guard = self.lock().await;
            let created = self.facade.create_data_set(name).await?;
            self.admit(&guard, created)?
        };
        debug!("Created data set {}", data_set.identify());
        self.notify_entity_created(&data_set);
        Ok(data_set)
    }

    pub async fn rename_entity(&self, entity: &EntityHandle, new_name: &str) -> ModelResult<EntityHandle> {
        let entity = self.canonicalize(entity);
        let guard = self.lock().await;
        let mut snapshot = entity.snapshot();
        snapshot.name = new_name.to_string();
        let renamed = self.save_snapshot(&guard, snapshot).await?;
        debug!("Renamed entity {} to '{}'", renamed.id(), new_name);
        Ok(renamed)
    }

    /// Persist the current state of the cached entity
    pub async fn save_entity(&self, entity: &EntityHandle) -> ModelResult<EntityHandle> {
        let entity = self.canonicalize(entity);
        let guard = self.lock().await;
        self.save_snapshot(&guard, entity.snapshot()).await
    }

    /// Persist a modified copy of an entity and merge the stored version
    pub async fn save_entity_copy(&self, modified: Entity) -> ModelResult<EntityHandle> {
        let guard = self.lock().await;
        self.save_snapshot(&guard, modified).await
    }

    /// Forbidden references go to the server as plain child ids and are
    /// restored on the saved copy before it is merged.
    async fn save_snapshot(&self, guard: &WriteGuard<'_>, mut snapshot: Entity) -> ModelResult<EntityHandle> {
        let mut forbidden = HashSet::new();
        mark_forbidden_as_unloaded(&mut snapshot, &mut forbidden);
        let mut saved = self.facade.save_entity(&snapshot).await?;
        if !forbidden.is_empty() {
            mark_unloaded_as_forbidden(&mut saved, false, Some(&forbidden), &mut HashSet::new());
        }
        self.admit(guard, saved)
    }

    /// Give the entity a tag attribute whose value is its own name
    pub async fn set_attribute_as_tag(&self, entity: &EntityHandle, attribute_name: &str) -> ModelResult<EntityHandle> {
        let guard = self.lock().await;
        let id = entity.id();
        let mut fresh = self
            .facade
            .get_entity_by_id(id)
            .await?
            .ok_or(ModelError::NotFound(id))?;
        if fresh.value_by_attribute_name(attribute_name) == Some(attribute_name) {
            return self.admit(&guard, fresh);
        }
        fresh
            .entity_data
            .push(EntityData::with_value(attribute_name, attribute_name));
        self.save_snapshot(&guard, fresh).await
    }

    /// Save an edge. The cached parent is updated to hold the saved edge.
    pub async fn save_entity_data(&self, entity_data: &EntityData) -> ModelResult<EntityData> {
        let _guard = self.lock().await;
        let mut saved = self.facade.save_entity_data(entity_data).await?;
        saved.child = self.canonical_child(saved.child.take().or_else(|| entity_data.child.clone()));

        if let Some(parent) = saved.parent_id.and_then(|id| self.get_if_cached(id)) {
            {
                let mut parent = parent.write();
                let existing = parent
                    .entity_data
                    .iter_mut()
                    .find(|ed| ed.id.is_some() && ed.id == saved.id);
                match existing {
                    Some(existing) => *existing = saved.clone(),
                    None => parent.entity_data.push(saved.clone()),
                }
            }
            if let (Some(ChildRef::Loaded(child)), Some(parent_id)) = (&saved.child, saved.parent_id) {
                self.state.lock().index.add_parent(child.id(), parent_id);
            }
            self.notify_entity_changed(&parent);
        }
        Ok(saved)
    }

    pub async fn update_child_index(&self, entity_data: &EntityData, order_index: i32) -> ModelResult<EntityData> {
        let edge_id = saved_id(entity_data)?;
        let _guard = self.lock().await;
        self.facade.update_child_index(edge_id, order_index).await?;

        if let Some(parent) = entity_data.parent_id.and_then(|id| self.get_if_cached(id)) {
            let found = {
                let mut parent = parent.write();
                match parent.entity_data.iter_mut().find(|ed| ed.id == Some(edge_id)) {
                    Some(ed) => {
                        ed.order_index = Some(order_index);
                        true
                    }
                    None => false,
                }
            };
            if found {
                self.notify_entity_changed(&parent);
            }
        }

        let mut updated = entity_data.clone();
        updated.order_index = Some(order_index);
        Ok(updated)
    }

    /// Persist the order indexes of every edge of the cached entity
    pub async fn update_child_indexes(&self, entity: &EntityHandle) -> ModelResult<EntityHandle> {
        let entity = self.canonicalize(entity);
        let _guard = self.lock().await;
        let snapshot = entity.snapshot();
        self.facade.update_child_indexes(&snapshot).await?;
        self.notify_entity_changed(&entity);
        Ok(entity)
    }

    /// Set a literal attribute, creating the edge when the entity has none
    pub async fn set_or_update_value(
        &self,
        entity: &EntityHandle,
        attribute_name: &str,
        value: &str,
    ) -> ModelResult<EntityData> {
        let entity = self.canonicalize(entity);
        let guard = self.lock().await;
        self.set_or_update_value_locked(&guard, &entity, attribute_name, value)
            .await
    }

    pub async fn set_or_update_values(
        &self,
        entities: &[EntityHandle],
        attribute_name: &str,
        value: &str,
    ) -> ModelResult<Vec<EntityData>> {
        let guard = self.lock().await;
        let mut saved = Vec::with_capacity(entities.len());
        for entity in entities {
            let entity = self.canonicalize(entity);
            saved.push(
                self.set_or_update_value_locked(&guard, &entity, attribute_name, value)
                    .await?,
            );
        }
        Ok(saved)
    }

    async fn set_or_update_value_locked(
        &self,
        guard: &WriteGuard<'_>,
        entity: &EntityHandle,
        attribute_name: &str,
        value: &str,
    ) -> ModelResult<EntityData> {
        let saved = self
            .facade
            .set_or_update_value(entity.id(), attribute_name, value)
            .await?;

        let updated_in_place = {
            let mut cached = entity.write();
            match cached.entity_data_by_attribute_name_mut(attribute_name) {
                Some(existing) => {
                    existing.value = Some(value.to_string());
                    true
                }
                None => false,
            }
        };
        if updated_in_place {
            self.notify_entity_changed(entity);
        } else {
            // a new edge was created on the server, pick it up with its id
            self.invalidate_and_notify(guard, vec![entity.clone()], false)
                .await?;
        }
        Ok(saved)
    }

    /// Remove one edge, then invalidate its parent and child
    pub async fn delete_entity_data(&self, entity_data: &EntityData) -> ModelResult<()> {
        let edge_id = saved_id(entity_data)?;
        let guard = self.lock().await;
        self.facade.remove_entity_data(edge_id).await?;
        debug!("Removed entity data {}", edge_id);

        let mut affected = Vec::new();
        if let Some(child) = entity_data.child_id().and_then(|id| self.get_if_cached(id)) {
            affected.push(child);
        }
        if let Some(parent) = entity_data.parent_id.and_then(|id| self.get_if_cached(id)) {
            affected.push(parent);
        }
        self.invalidate_and_notify(&guard, affected, false).await
    }

    /// Remove several edges of the same parent
    pub async fn delete_bulk_entity_data(&self, parent: &EntityHandle, entity_datas: &[EntityData]) -> ModelResult<()> {
        let parent = self.canonicalize(parent);
        let guard = self.lock().await;
        for entity_data in entity_datas {
            let edge_id = saved_id(entity_data)?;
            self.facade.remove_entity_data(edge_id).await?;
            parent.write().entity_data.retain(|ed| ed.id != Some(edge_id));
        }
        debug!("Removed {} edges from {}", entity_datas.len(), parent.identify());
        self.invalidate_and_notify(&guard, vec![parent], false).await
    }

    /// Delete the entity and its subtree on the server. Every cached entity
    /// still holding an edge to it loses that edge and is invalidated.
    pub async fn delete_entity_tree(&self, entity: &EntityHandle) -> ModelResult<()> {
        let entity = self.canonicalize(entity);
        let id = entity.id();
        let guard = self.lock().await;
        self.facade.delete_entity_tree(id).await?;
        debug!("Deleted entity tree {}", entity.identify());

        let cached = {
            let mut state = self.state.lock();
            state.remove(id);
            state.cache.values()
        };

        let mut parent_edges = Vec::new();
        let mut parents = Vec::new();
        for candidate in cached {
            let stripped = {
                let mut parent = candidate.write();
                let before = parent.entity_data.len();
                parent.entity_data.retain(|ed| {
                    if ed.points_at(id) {
                        parent_edges.push(ed.clone());
                        false
                    } else {
                        true
                    }
                });
                parent.entity_data.len() != before
            };
            if stripped {
                parents.push(candidate);
            }
        }

        self.invalidate_and_notify(&guard, parents, false).await?;
        self.notify_entity_removed(&entity, parent_edges);
        Ok(())
    }

    /// Attach `entity` under `parent` at the given index, or after the last
    /// child when `index` is `None`.
    pub async fn add_entity_to_parent(
        &self,
        parent: &EntityHandle,
        entity: &EntityHandle,
        index: Option<i32>,
        attribute_name: &str,
    ) -> ModelResult<EntityData> {
        let parent = self.canonicalize(parent);
        let entity = self.canonicalize(entity);
        let _guard = self.lock().await;

        let index = match index {
            Some(index) => index,
            None => parent.read().max_order_index().map_or(0, |max| max + 1),
        };
        let mut saved = self
            .facade
            .add_entity_to_parent(parent.id(), entity.id(), index, attribute_name)
            .await?;
        saved.parent_id = Some(parent.id());
        saved.child = Some(ChildRef::Loaded(entity.clone()));

        {
            let mut cached = parent.write();
            cached.entity_data.push(saved.clone());
            cached.num_children = Some(cached.child_count() as i32);
        }
        self.state.lock().index.add_parent(entity.id(), parent.id());
        debug!("Added {} to {} at index {}", entity.identify(), parent.identify(), index);
        self.notify_entity_changed(&parent);
        Ok(saved)
    }

    /// Append `entity` as the last child of `parent`
    pub async fn add_entity_to_parent_next(&self, parent: &EntityHandle, entity: &EntityHandle) -> ModelResult<EntityData> {
        self.add_entity_to_parent(parent, entity, None, attributes::ENTITY)
            .await
    }

    pub async fn add_children(
        &self,
        parent_id: EntityId,
        child_ids: &[EntityId],
        attribute_name: &str,
    ) -> ModelResult<Option<EntityHandle>> {
        let guard = self.lock().await;
        self.facade
            .add_children(parent_id, child_ids, attribute_name)
            .await?;
        let parent = self.reload_by_id_locked(&guard, parent_id).await?;
        if let Some(parent) = &parent {
            self.notify_entity_changed(parent);
        }
        Ok(parent)
    }
}
