use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::model::{
    attributes, entity_types, ChildRef, Entity, EntityData, EntityDataId, EntityHandle, EntityId,
    OntologyTermType, Permission, Rights, SubjectKey,
};
use crate::store::traits::{AnnotationFacade, EntityFacade, Facade, OntologyFacade};

/// Stored form of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub id: EntityId,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type_name: String,
    pub owner_key: SubjectKey,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// Stored form of an edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDataRow {
    pub id: EntityDataId,
    pub parent_id: EntityId,
    pub attribute_name: String,
    #[serde(default)]
    pub order_index: Option<i32>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub child_id: Option<EntityId>,
}

#[derive(Debug, Default)]
struct FacadeState {
    entities: BTreeMap<EntityId, EntityRow>,
    edges: BTreeMap<EntityDataId, EntityDataRow>,
    next_entity_id: EntityId,
    next_edge_id: EntityDataId,
}

/// Facade backed by in-memory rows.
///
/// Every call materializes fresh detached instances, the way a remote server
/// would, and only returns what the configured subject may read. Calls are
/// counted, and the facade can be taken offline or told to fail for chosen
/// ids to exercise error paths.
#[derive(Debug)]
pub struct InMemoryFacade {
    subject: SubjectKey,
    state: Mutex<FacadeState>,
    calls: AtomicUsize,
    offline: AtomicBool,
    failing_ids: Mutex<HashSet<EntityId>>,
}

impl InMemoryFacade {
    pub fn new(subject: impl Into<SubjectKey>) -> Self {
        Self {
            subject: subject.into(),
            state: Mutex::new(FacadeState {
                next_entity_id: 1000,
                next_edge_id: 1000,
                ..Default::default()
            }),
            calls: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
            failing_ids: Mutex::new(HashSet::new()),
        }
    }

    /// Build a facade from stored rows
    pub fn from_rows(
        subject: impl Into<SubjectKey>,
        entities: Vec<EntityRow>,
        edges: Vec<EntityDataRow>,
    ) -> Self {
        let facade = Self::new(subject);
        {
            let mut state = facade.state.lock();
            for row in entities {
                state.next_entity_id = state.next_entity_id.max(row.id + 1);
                state.entities.insert(row.id, row);
            }
            for row in edges {
                state.next_edge_id = state.next_edge_id.max(row.id + 1);
                state.edges.insert(row.id, row);
            }
        }
        facade
    }

    /// Number of remote calls served so far
    pub fn remote_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make every fetch of the given ids fail
    pub fn fail_fetches_of(&self, ids: &[EntityId]) {
        self.failing_ids.lock().extend(ids.iter().copied());
    }

    pub fn clear_failures(&self) {
        self.failing_ids.lock().clear();
    }

    /// Insert an entity owned by the facade's subject
    pub fn add_entity(&self, id: EntityId, name: &str, type_name: &str) -> EntityId {
        let owner = self.subject.clone();
        self.add_entity_owned_by(id, name, type_name, &owner)
    }

    pub fn add_entity_owned_by(&self, id: EntityId, name: &str, type_name: &str, owner: &str) -> EntityId {
        let mut state = self.state.lock();
        let now = Utc::now();
        state.next_entity_id = state.next_entity_id.max(id + 1);
        state.entities.insert(
            id,
            EntityRow {
                id,
                name: name.to_string(),
                entity_type_name: type_name.to_string(),
                owner_key: owner.to_string(),
                permissions: vec![Permission::new(owner, Rights::ReadWrite)],
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    /// Attach `child_id` under `parent_id` with the next free order index
    pub fn link(&self, parent_id: EntityId, child_id: EntityId) -> EntityDataId {
        let mut state = self.state.lock();
        let order_index = state.next_order_index(parent_id);
        state.insert_edge(parent_id, attributes::ENTITY, Some(order_index), None, Some(child_id))
    }

    pub fn grant(&self, entity_id: EntityId, subject: &str, rights: Rights) {
        let mut state = self.state.lock();
        if let Some(row) = state.entities.get_mut(&entity_id) {
            row.permissions.retain(|p| p.subject_key != subject);
            row.permissions.push(Permission::new(subject, rights));
            touch(row);
        }
    }

    /// Change an entity behind the model's back, as another client would
    pub fn rename_remote(&self, entity_id: EntityId, name: &str) {
        let mut state = self.state.lock();
        if let Some(row) = state.entities.get_mut(&entity_id) {
            row.name = name.to_string();
            touch(row);
        }
    }

    pub fn entity_row(&self, entity_id: EntityId) -> Option<EntityRow> {
        self.state.lock().entities.get(&entity_id).cloned()
    }

    pub fn edge_rows_of(&self, parent_id: EntityId) -> Vec<EntityDataRow> {
        self.state.lock().edges_of(parent_id)
    }

    fn enter(&self, operation: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            bail!("remote facade unavailable during {}", operation);
        }
        Ok(())
    }

    fn check_fetchable(&self, id: EntityId) -> Result<()> {
        if self.failing_ids.lock().contains(&id) {
            bail!("simulated failure fetching entity {}", id);
        }
        Ok(())
    }

    fn readable(&self, row: &EntityRow) -> bool {
        row.owner_key == self.subject
            || row
                .permissions
                .iter()
                .any(|p| p.subject_key == self.subject && p.rights.can_read())
    }

    fn writable(&self, row: &EntityRow) -> bool {
        row.owner_key == self.subject
            || row
                .permissions
                .iter()
                .any(|p| p.subject_key == self.subject && p.rights.can_write())
    }

    fn require_writable<'a>(&self, state: &'a mut FacadeState, id: EntityId) -> Result<&'a mut EntityRow> {
        let row = state
            .entities
            .get_mut(&id)
            .ok_or_else(|| anyhow!("entity {} does not exist", id))?;
        if !self.writable(row) {
            bail!("{} may not modify entity {}", self.subject, id);
        }
        Ok(row)
    }

    /// Entity with lazy child references
    fn materialize(&self, state: &FacadeState, row: &EntityRow) -> Entity {
        let edges = state.edges_of(row.id);
        let num_children = edges.iter().filter(|e| e.child_id.is_some()).count() as i32;
        Entity {
            id: row.id,
            name: row.name.clone(),
            entity_type_name: Some(row.entity_type_name.clone()),
            owner_key: Some(row.owner_key.clone()),
            permissions: Some(row.permissions.clone()),
            num_children: Some(num_children),
            created_at: row.created_at,
            updated_at: row.updated_at,
            entity_data: edges.iter().map(edge_to_entity_data).collect(),
        }
    }

    /// Entity with every readable descendant loaded
    fn materialize_tree(&self, state: &FacadeState, row: &EntityRow, path: &mut Vec<EntityId>) -> Entity {
        let mut entity = self.materialize(state, row);
        path.push(row.id);
        for ed in entity.entity_data.iter_mut() {
            let Some(child_id) = ed.child_id() else { continue };
            if path.contains(&child_id) {
                continue;
            }
            if let Some(child_row) = state.entities.get(&child_id) {
                if self.readable(child_row) {
                    let child = self.materialize_tree(state, child_row, path);
                    ed.child = Some(ChildRef::Loaded(EntityHandle::new(child)));
                }
            }
        }
        path.pop();
        entity
    }

    fn readable_rows<F>(&self, state: &FacadeState, filter: F) -> Vec<Entity>
    where
        F: Fn(&EntityRow) -> bool,
    {
        state
            .entities
            .values()
            .filter(|row| self.readable(row) && filter(row))
            .map(|row| self.materialize(state, row))
            .collect()
    }

    fn create_row(&self, state: &mut FacadeState, type_name: &str, name: &str) -> EntityId {
        let id = state.next_entity_id;
        state.next_entity_id += 1;
        let now = Utc::now();
        state.entities.insert(
            id,
            EntityRow {
                id,
                name: name.to_string(),
                entity_type_name: type_name.to_string(),
                owner_key: self.subject.clone(),
                permissions: vec![Permission::new(self.subject.clone(), Rights::ReadWrite)],
                created_at: now,
                updated_at: now,
            },
        );
        id
    }
}

impl FacadeState {
    fn edges_of(&self, parent_id: EntityId) -> Vec<EntityDataRow> {
        let mut edges: Vec<EntityDataRow> = self
            .edges
            .values()
            .filter(|e| e.parent_id == parent_id)
            .cloned()
            .collect();
        edges.sort_by_key(|e| (e.order_index.unwrap_or(i32::MAX), e.id));
        edges
    }

    fn next_order_index(&self, parent_id: EntityId) -> i32 {
        self.edges
            .values()
            .filter(|e| e.parent_id == parent_id)
            .filter_map(|e| e.order_index)
            .max()
            .map_or(0, |max| max + 1)
    }

    fn insert_edge(
        &mut self,
        parent_id: EntityId,
        attribute_name: &str,
        order_index: Option<i32>,
        value: Option<String>,
        child_id: Option<EntityId>,
    ) -> EntityDataId {
        let id = self.next_edge_id;
        self.next_edge_id += 1;
        self.edges.insert(
            id,
            EntityDataRow {
                id,
                parent_id,
                attribute_name: attribute_name.to_string(),
                order_index,
                value,
                child_id,
            },
        );
        self.touch_entity(parent_id);
        id
    }

    fn touch_entity(&mut self, id: EntityId) {
        if let Some(row) = self.entities.get_mut(&id) {
            touch(row);
        }
    }

    /// Delete an entity and every descendant left without another parent
    fn delete_tree(&mut self, id: EntityId) {
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            if self.entities.remove(&current).is_none() {
                continue;
            }
            let incoming: Vec<(EntityDataId, EntityId)> = self
                .edges
                .values()
                .filter(|e| e.child_id == Some(current))
                .map(|e| (e.id, e.parent_id))
                .collect();
            for (edge_id, parent_id) in incoming {
                self.edges.remove(&edge_id);
                self.touch_entity(parent_id);
            }
            let outgoing: Vec<EntityDataRow> = self.edges_of(current);
            for edge in outgoing {
                self.edges.remove(&edge.id);
                if let Some(child_id) = edge.child_id {
                    let still_referenced = self.edges.values().any(|e| e.child_id == Some(child_id));
                    if !still_referenced {
                        pending.push(child_id);
                    }
                }
            }
        }
    }
}

fn touch(row: &mut EntityRow) {
    let bumped = row.updated_at + chrono::Duration::milliseconds(1);
    row.updated_at = Utc::now().max(bumped);
}

/// `user:alice` + "Brain Scans" -> `alice_brain_scans`
fn data_set_identifier(subject: &str, name: &str) -> String {
    let user = subject.rsplit(':').next().unwrap_or(subject);
    let slug = name
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_");
    format!("{}_{}", user, slug)
}

fn edge_to_entity_data(row: &EntityDataRow) -> EntityData {
    EntityData {
        id: Some(row.id),
        attribute_name: row.attribute_name.clone(),
        order_index: row.order_index,
        value: row.value.clone(),
        parent_id: Some(row.parent_id),
        child: row.child_id.map(ChildRef::Unloaded),
    }
}

#[async_trait::async_trait]
impl EntityFacade for InMemoryFacade {
    async fn get_entity_by_id(&self, id: EntityId) -> Result<Option<Entity>> {
        self.enter("get_entity_by_id")?;
        self.check_fetchable(id)?;
        let state = self.state.lock();
        Ok(state
            .entities
            .get(&id)
            .filter(|row| self.readable(row))
            .map(|row| self.materialize(&state, row)))
    }

    async fn get_entities_by_id(&self, ids: &[EntityId]) -> Result<Vec<Entity>> {
        self.enter("get_entities_by_id")?;
        for id in ids {
            self.check_fetchable(*id)?;
        }
        let state = self.state.lock();
        Ok(ids
            .iter()
            .filter_map(|id| state.entities.get(id))
            .filter(|row| self.readable(row))
            .map(|row| self.materialize(&state, row))
            .collect())
    }

    async fn get_entity_tree(&self, id: EntityId) -> Result<Option<Entity>> {
        self.enter("get_entity_tree")?;
        self.check_fetchable(id)?;
        let state = self.state.lock();
        Ok(state
            .entities
            .get(&id)
            .filter(|row| self.readable(row))
            .map(|row| self.materialize_tree(&state, row, &mut Vec::new())))
    }

    async fn get_child_entities(&self, parent_id: EntityId) -> Result<Vec<Entity>> {
        self.enter("get_child_entities")?;
        let state = self.state.lock();
        Ok(state
            .edges_of(parent_id)
            .iter()
            .filter_map(|e| e.child_id)
            .filter_map(|child_id| state.entities.get(&child_id))
            .filter(|row| self.readable(row))
            .map(|row| self.materialize(&state, row))
            .collect())
    }

    async fn get_entities_by_name(&self, name: &str) -> Result<Vec<Entity>> {
        self.enter("get_entities_by_name")?;
        let state = self.state.lock();
        Ok(self.readable_rows(&state, |row| row.name == name))
    }

    async fn get_entities_by_type_name(&self, type_name: &str) -> Result<Vec<Entity>> {
        self.enter("get_entities_by_type_name")?;
        let state = self.state.lock();
        Ok(self.readable_rows(&state, |row| row.entity_type_name == type_name))
    }

    async fn get_owned_entities_by_name(&self, name: &str) -> Result<Vec<Entity>> {
        self.enter("get_owned_entities_by_name")?;
        let state = self.state.lock();
        Ok(self.readable_rows(&state, |row| row.name == name && row.owner_key == self.subject))
    }

    async fn get_owned_entities_by_type_name(&self, type_name: &str) -> Result<Vec<Entity>> {
        self.enter("get_owned_entities_by_type_name")?;
        let state = self.state.lock();
        Ok(self.readable_rows(&state, |row| {
            row.entity_type_name == type_name && row.owner_key == self.subject
        }))
    }

    async fn get_parent_entities(&self, child_id: EntityId) -> Result<Vec<Entity>> {
        self.enter("get_parent_entities")?;
        let state = self.state.lock();
        let parent_ids: HashSet<EntityId> = state
            .edges
            .values()
            .filter(|e| e.child_id == Some(child_id))
            .map(|e| e.parent_id)
            .collect();
        Ok(self.readable_rows(&state, |row| parent_ids.contains(&row.id)))
    }

    async fn get_parent_entity_datas(&self, child_id: EntityId) -> Result<Vec<EntityData>> {
        self.enter("get_parent_entity_datas")?;
        let state = self.state.lock();
        Ok(state
            .edges
            .values()
            .filter(|e| e.child_id == Some(child_id))
            .filter(|e| {
                state
                    .entities
                    .get(&e.parent_id)
                    .is_some_and(|row| self.readable(row))
            })
            .map(edge_to_entity_data)
            .collect())
    }

    async fn get_all_parent_entity_datas(&self, child_id: EntityId) -> Result<Vec<EntityData>> {
        self.enter("get_all_parent_entity_datas")?;
        let state = self.state.lock();
        Ok(state
            .edges
            .values()
            .filter(|e| e.child_id == Some(child_id))
            .map(edge_to_entity_data)
            .collect())
    }

    async fn get_ancestor_with_type(&self, id: EntityId, type_name: &str) -> Result<Option<Entity>> {
        self.enter("get_ancestor_with_type")?;
        let state = self.state.lock();
        let mut visited = HashSet::new();
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            if !visited.insert(current) {
                continue;
            }
            if let Some(row) = state.entities.get(&current) {
                if row.entity_type_name == type_name && self.readable(row) {
                    return Ok(Some(self.materialize(&state, row)));
                }
            }
            frontier.extend(
                state
                    .edges
                    .values()
                    .filter(|e| e.child_id == Some(current))
                    .map(|e| e.parent_id),
            );
        }
        Ok(None)
    }

    async fn create_entity(&self, type_name: &str, name: &str) -> Result<Entity> {
        self.enter("create_entity")?;
        let mut state = self.state.lock();
        let id = self.create_row(&mut state, type_name, name);
        let row = state.entities[&id].clone();
        Ok(self.materialize(&state, &row))
    }

    async fn save_entity(&self, entity: &Entity) -> Result<Entity> {
        self.enter("save_entity")?;
        let mut state = self.state.lock();
        {
            let row = self.require_writable(&mut state, entity.id)?;
            row.name = entity.name.clone();
            if let Some(type_name) = &entity.entity_type_name {
                row.entity_type_name = type_name.clone();
            }
            if let Some(owner) = &entity.owner_key {
                row.owner_key = owner.clone();
            }
            touch(row);
        }

        let kept: HashSet<EntityDataId> = entity.entity_data.iter().filter_map(|ed| ed.id).collect();
        let stale: Vec<EntityDataId> = state
            .edges_of(entity.id)
            .iter()
            .map(|e| e.id)
            .filter(|id| !kept.contains(id))
            .collect();
        for edge_id in stale {
            state.edges.remove(&edge_id);
        }
        for ed in &entity.entity_data {
            match ed.id {
                Some(edge_id) => {
                    let edge = state
                        .edges
                        .get_mut(&edge_id)
                        .with_context(|| format!("edge {} does not exist", edge_id))?;
                    edge.attribute_name = ed.attribute_name.clone();
                    edge.order_index = ed.order_index;
                    edge.value = ed.value.clone();
                    edge.child_id = ed.child_id();
                }
                None => {
                    state.insert_edge(
                        entity.id,
                        &ed.attribute_name,
                        ed.order_index,
                        ed.value.clone(),
                        ed.child_id(),
                    );
                }
            }
        }

        let row = state.entities[&entity.id].clone();
        Ok(self.materialize(&state, &row))
    }

    async fn save_entity_data(&self, entity_data: &EntityData) -> Result<EntityData> {
        self.enter("save_entity_data")?;
        let parent_id = entity_data
            .parent_id
            .ok_or_else(|| anyhow!("entity data has no parent"))?;
        let mut state = self.state.lock();
        self.require_writable(&mut state, parent_id)?;
        let edge_id = match entity_data.id {
            Some(edge_id) => {
                let edge = state
                    .edges
                    .get_mut(&edge_id)
                    .with_context(|| format!("edge {} does not exist", edge_id))?;
                edge.attribute_name = entity_data.attribute_name.clone();
                edge.order_index = entity_data.order_index;
                edge.value = entity_data.value.clone();
                edge.child_id = entity_data.child_id();
                state.touch_entity(parent_id);
                edge_id
            }
            None => state.insert_edge(
                parent_id,
                &entity_data.attribute_name,
                entity_data.order_index,
                entity_data.value.clone(),
                entity_data.child_id(),
            ),
        };
        Ok(edge_to_entity_data(&state.edges[&edge_id]))
    }

    async fn set_or_update_value(
        &self,
        entity_id: EntityId,
        attribute_name: &str,
        value: &str,
    ) -> Result<EntityData> {
        self.enter("set_or_update_value")?;
        let mut state = self.state.lock();
        self.require_writable(&mut state, entity_id)?;
        let existing = state
            .edges_of(entity_id)
            .into_iter()
            .find(|e| e.attribute_name == attribute_name)
            .map(|e| e.id);
        let edge_id = match existing {
            Some(edge_id) => {
                if let Some(edge) = state.edges.get_mut(&edge_id) {
                    edge.value = Some(value.to_string());
                }
                state.touch_entity(entity_id);
                edge_id
            }
            None => state.insert_edge(entity_id, attribute_name, None, Some(value.to_string()), None),
        };
        Ok(edge_to_entity_data(&state.edges[&edge_id]))
    }

    async fn update_child_index(&self, entity_data_id: EntityDataId, order_index: i32) -> Result<()> {
        self.enter("update_child_index")?;
        let mut state = self.state.lock();
        let edge = state
            .edges
            .get_mut(&entity_data_id)
            .ok_or_else(|| anyhow!("edge {} does not exist", entity_data_id))?;
        edge.order_index = Some(order_index);
        let parent_id = edge.parent_id;
        state.touch_entity(parent_id);
        Ok(())
    }

    async fn update_child_indexes(&self, entity: &Entity) -> Result<()> {
        self.enter("update_child_indexes")?;
        let mut state = self.state.lock();
        self.require_writable(&mut state, entity.id)?;
        for ed in &entity.entity_data {
            if let Some(edge) = ed.id.and_then(|id| state.edges.get_mut(&id)) {
                edge.order_index = ed.order_index;
            }
        }
        state.touch_entity(entity.id);
        Ok(())
    }

    async fn remove_entity_data(&self, entity_data_id: EntityDataId) -> Result<()> {
        self.enter("remove_entity_data")?;
        let mut state = self.state.lock();
        let edge = state
            .edges
            .remove(&entity_data_id)
            .ok_or_else(|| anyhow!("edge {} does not exist", entity_data_id))?;
        state.touch_entity(edge.parent_id);
        Ok(())
    }

    async fn delete_entity_tree(&self, id: EntityId) -> Result<()> {
        self.enter("delete_entity_tree")?;
        let mut state = self.state.lock();
        self.require_writable(&mut state, id)?;
        state.delete_tree(id);
        Ok(())
    }

    async fn add_entity_to_parent(
        &self,
        parent_id: EntityId,
        child_id: EntityId,
        order_index: i32,
        attribute_name: &str,
    ) -> Result<EntityData> {
        self.enter("add_entity_to_parent")?;
        let mut state = self.state.lock();
        self.require_writable(&mut state, parent_id)?;
        if !state.entities.contains_key(&child_id) {
            bail!("entity {} does not exist", child_id);
        }
        let edge_id = state.insert_edge(parent_id, attribute_name, Some(order_index), None, Some(child_id));
        Ok(edge_to_entity_data(&state.edges[&edge_id]))
    }

    async fn add_children(
        &self,
        parent_id: EntityId,
        child_ids: &[EntityId],
        attribute_name: &str,
    ) -> Result<()> {
        self.enter("add_children")?;
        let mut state = self.state.lock();
        self.require_writable(&mut state, parent_id)?;
        for child_id in child_ids {
            if !state.entities.contains_key(child_id) {
                bail!("entity {} does not exist", child_id);
            }
            let order_index = state.next_order_index(parent_id);
            state.insert_edge(parent_id, attribute_name, Some(order_index), None, Some(*child_id));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl AnnotationFacade for InMemoryFacade {
    async fn get_workspaces(&self) -> Result<Vec<Entity>> {
        self.enter("get_workspaces")?;
        let state = self.state.lock();
        Ok(self.readable_rows(&state, |row| row.entity_type_name == entity_types::WORKSPACE))
    }

    async fn create_folder_in_workspace(&self, workspace_id: EntityId, name: &str) -> Result<Entity> {
        self.enter("create_folder_in_workspace")?;
        let mut state = self.state.lock();
        self.require_writable(&mut state, workspace_id)?;
        let folder_id = self.create_row(&mut state, entity_types::FOLDER, name);
        state.insert_edge(
            folder_id,
            attributes::COMMON_ROOT,
            None,
            Some(attributes::COMMON_ROOT.to_string()),
            None,
        );
        let order_index = state.next_order_index(workspace_id);
        state.insert_edge(workspace_id, attributes::ENTITY, Some(order_index), None, Some(folder_id));
        let row = state.entities[&folder_id].clone();
        Ok(self.materialize(&state, &row))
    }

    async fn get_data_sets(&self) -> Result<Vec<Entity>> {
        self.enter("get_data_sets")?;
        let state = self.state.lock();
        Ok(self.readable_rows(&state, |row| row.entity_type_name == entity_types::DATA_SET))
    }

    async fn create_data_set(&self, name: &str) -> Result<Entity> {
        self.enter("create_data_set")?;
        let identifier = data_set_identifier(&self.subject, name);
        let mut state = self.state.lock();
        let taken = state.edges.values().any(|e| {
            e.attribute_name == attributes::DATA_SET_IDENTIFIER && e.value.as_deref() == Some(identifier.as_str())
        });
        if taken {
            bail!("data set with identifier '{}' already exists", identifier);
        }
        let id = self.create_row(&mut state, entity_types::DATA_SET, name);
        state.insert_edge(id, attributes::DATA_SET_IDENTIFIER, None, Some(identifier), None);
        let row = state.entities[&id].clone();
        Ok(self.materialize(&state, &row))
    }
}

#[async_trait::async_trait]
impl OntologyFacade for InMemoryFacade {
    async fn get_ontology_roots(&self) -> Result<Vec<Entity>> {
        self.enter("get_ontology_roots")?;
        let state = self.state.lock();
        Ok(state
            .entities
            .values()
            .filter(|row| row.entity_type_name == entity_types::ONTOLOGY_ROOT && self.readable(row))
            .map(|row| self.materialize_tree(&state, row, &mut Vec::new()))
            .collect())
    }

    async fn create_ontology_root(&self, name: &str) -> Result<Entity> {
        self.enter("create_ontology_root")?;
        let mut state = self.state.lock();
        let id = self.create_row(&mut state, entity_types::ONTOLOGY_ROOT, name);
        let row = state.entities[&id].clone();
        Ok(self.materialize(&state, &row))
    }

    async fn create_ontology_term(
        &self,
        parent_id: EntityId,
        label: &str,
        term_type: OntologyTermType,
        order_index: Option<i32>,
    ) -> Result<EntityData> {
        self.enter("create_ontology_term")?;
        let mut state = self.state.lock();
        self.require_writable(&mut state, parent_id)?;
        let term_id = self.create_row(&mut state, entity_types::ONTOLOGY_ELEMENT, label);
        state.insert_edge(
            term_id,
            attributes::ONTOLOGY_TERM_TYPE,
            None,
            Some(term_type.as_str().to_string()),
            None,
        );
        let order_index = order_index.unwrap_or_else(|| state.next_order_index(parent_id));
        let edge_id = state.insert_edge(
            parent_id,
            attributes::ONTOLOGY_ELEMENT,
            Some(order_index),
            None,
            Some(term_id),
        );
        let term_row = state.entities[&term_id].clone();
        let term = self.materialize(&state, &term_row);
        let mut edge = edge_to_entity_data(&state.edges[&edge_id]);
        edge.child = Some(ChildRef::Loaded(EntityHandle::new(term)));
        Ok(edge)
    }
}

impl Facade for InMemoryFacade {
    fn subject_key(&self) -> &str {
        &self.subject
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facade() -> InMemoryFacade {
        let facade = InMemoryFacade::new("user:alice");
        facade.add_entity(1, "Folder", "Folder");
        facade.add_entity(2, "Image", "Image");
        facade.add_entity_owned_by(3, "Secret", "Image", "user:bob");
        facade.link(1, 2);
        facade.link(1, 3);
        facade
    }

    #[tokio::test]
    async fn test_fresh_instances_on_every_call() {
        let facade = facade();
        let a = facade.get_entity_by_id(1).await.unwrap().unwrap();
        let b = facade.get_entity_by_id(1).await.unwrap().unwrap();
        assert!(a.is_equivalent(&b));
        assert_eq!(a.num_children, Some(2));
        assert!(!a.children_loaded());
        assert_eq!(facade.remote_calls(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_children_stay_unloaded_in_tree() {
        let facade = facade();
        let tree = facade.get_entity_tree(1).await.unwrap().unwrap();
        let children: Vec<_> = tree.entity_data.iter().map(|ed| ed.child.clone().unwrap()).collect();
        assert!(matches!(children[0], ChildRef::Loaded(ref h) if h.id() == 2));
        assert!(matches!(children[1], ChildRef::Unloaded(3)));

        let visible = facade.get_child_entities(1).await.unwrap();
        assert_eq!(visible.len(), 1);
    }

    #[tokio::test]
    async fn test_offline_and_targeted_failures() {
        let facade = facade();
        facade.set_offline(true);
        assert!(facade.get_entity_by_id(1).await.is_err());
        facade.set_offline(false);

        facade.fail_fetches_of(&[2]);
        assert!(facade.get_entity_by_id(2).await.is_err());
        assert!(facade.get_entity_by_id(1).await.is_ok());
        facade.clear_failures();
        assert!(facade.get_entity_by_id(2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_tree_keeps_shared_descendants() {
        let facade = facade();
        facade.add_entity(4, "Other", "Folder");
        facade.link(4, 2);

        facade.delete_entity_tree(1).await.unwrap();
        assert!(facade.entity_row(1).is_none());
        assert!(facade.entity_row(2).is_some());
        assert!(facade.entity_row(3).is_none());
    }

    #[tokio::test]
    async fn test_all_parent_edges_ignore_permissions() {
        let facade = facade();
        facade.add_entity_owned_by(4, "Bob's folder", "Folder", "user:bob");
        facade.link(4, 2);

        assert_eq!(facade.get_parent_entity_datas(2).await.unwrap().len(), 1);
        let all = facade.get_all_parent_entity_datas(2).await.unwrap();
        let mut parents: Vec<_> = all.iter().filter_map(|ed| ed.parent_id).collect();
        parents.sort_unstable();
        assert_eq!(parents, vec![1, 4]);
    }

    #[tokio::test]
    async fn test_data_set_identifier_is_unique() {
        let facade = facade();
        let data_set = facade.create_data_set("Brain Scans").await.unwrap();
        assert_eq!(
            data_set.value_by_attribute_name(attributes::DATA_SET_IDENTIFIER),
            Some("alice_brain_scans")
        );
        assert!(facade.create_data_set("brain  scans").await.is_err());
        assert_eq!(facade.get_data_sets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_write_requires_permission() {
        let facade = facade();
        let mut secret = Entity::new(3, "Secret", "Image");
        secret.name = "Renamed".to_string();
        assert!(facade.save_entity(&secret).await.is_err());
    }
}
