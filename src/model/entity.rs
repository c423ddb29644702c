use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::Arc;

use crate::model::{EntityDataId, EntityId, Permission, SubjectKey};

/// A node of the entity graph: sample, image, folder, ontology term...
///
/// Instances coming back from the facade are detached values. Once merged into
/// the `EntityModel` they live behind an `EntityHandle` and are mutated in place.
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    /// `None` on payloads the server did not fully initialize
    pub entity_type_name: Option<String>,
    pub owner_key: Option<SubjectKey>,
    /// `None` when the permission set was not loaded
    pub permissions: Option<Vec<Permission>>,
    /// Denormalized child count maintained by the server
    pub num_children: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub entity_data: Vec<EntityData>,
}

/// A typed edge from a parent entity to a child entity or a literal value
#[derive(Debug, Clone)]
pub struct EntityData {
    pub id: Option<EntityDataId>,
    pub attribute_name: String,
    pub order_index: Option<i32>,
    pub value: Option<String>,
    pub parent_id: Option<EntityId>,
    pub child: Option<ChildRef>,
}

/// Reference from an edge to its child entity
#[derive(Clone)]
pub enum ChildRef {
    /// Lazy reference, the child has not been fetched yet
    Unloaded(EntityId),
    Loaded(EntityHandle),
    /// The child was fetched but the current subject may not read it
    Forbidden(EntityId),
}

/// Shared, lock-protected entity instance. Identity is pointer identity.
#[derive(Clone)]
pub struct EntityHandle {
    id: EntityId,
    inner: Arc<RwLock<Entity>>,
}

impl Entity {
    pub fn new(id: EntityId, name: impl Into<String>, entity_type_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            entity_type_name: Some(entity_type_name.into()),
            owner_key: None,
            permissions: Some(Vec::new()),
            num_children: None,
            created_at: now,
            updated_at: now,
            entity_data: Vec::new(),
        }
    }

    pub fn with_owner(mut self, owner_key: impl Into<SubjectKey>) -> Self {
        self.owner_key = Some(owner_key.into());
        self
    }

    /// An entity is initialized when both its type and its permissions were loaded
    pub fn is_initialized(&self) -> bool {
        self.entity_type_name.is_some() && self.permissions.is_some()
    }

    /// True when no edge still holds a lazy child reference
    pub fn children_loaded(&self) -> bool {
        self.entity_data
            .iter()
            .all(|ed| !matches!(ed.child, Some(ChildRef::Unloaded(_))))
    }

    pub fn child_count(&self) -> usize {
        self.entity_data.iter().filter(|ed| ed.child.is_some()).count()
    }

    /// Loaded children, in edge order
    pub fn children(&self) -> Vec<EntityHandle> {
        self.entity_data
            .iter()
            .filter_map(|ed| ed.child_entity())
            .collect()
    }

    /// Loaded children sorted by the edges' order index
    pub fn ordered_children(&self) -> Vec<EntityHandle> {
        let mut edges: Vec<&EntityData> = self.entity_data.iter().collect();
        edges.sort_by_key(|ed| ed.order_index.unwrap_or(i32::MAX));
        edges.into_iter().filter_map(|ed| ed.child_entity()).collect()
    }

    pub fn child_ids(&self) -> Vec<EntityId> {
        self.entity_data.iter().filter_map(|ed| ed.child_id()).collect()
    }

    pub fn entity_data_by_attribute_name(&self, attribute_name: &str) -> Option<&EntityData> {
        self.entity_data
            .iter()
            .find(|ed| ed.attribute_name == attribute_name)
    }

    pub fn entity_data_by_attribute_name_mut(
        &mut self,
        attribute_name: &str,
    ) -> Option<&mut EntityData> {
        self.entity_data
            .iter_mut()
            .find(|ed| ed.attribute_name == attribute_name)
    }

    pub fn value_by_attribute_name(&self, attribute_name: &str) -> Option<&str> {
        self.entity_data_by_attribute_name(attribute_name)
            .and_then(|ed| ed.value.as_deref())
    }

    pub fn max_order_index(&self) -> Option<i32> {
        self.entity_data.iter().filter_map(|ed| ed.order_index).max()
    }

    pub fn is_owned_by(&self, subject_key: &str) -> bool {
        self.owner_key.as_deref() == Some(subject_key)
    }

    /// Compare everything the server may change between two fetches
    pub fn is_equivalent(&self, other: &Entity) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.entity_type_name == other.entity_type_name
            && self.owner_key == other.owner_key
            && self.permissions == other.permissions
            && self.num_children == other.num_children
            && self.updated_at == other.updated_at
            && self.entity_data.len() == other.entity_data.len()
            && self
                .entity_data
                .iter()
                .zip(other.entity_data.iter())
                .all(|(a, b)| a.is_equivalent(b))
    }

    /// Overwrite this instance with a freshly fetched version of the same entity
    pub fn update_from(&mut self, other: Entity) {
        debug_assert_eq!(self.id, other.id);
        self.name = other.name;
        self.entity_type_name = other.entity_type_name;
        self.owner_key = other.owner_key;
        self.permissions = other.permissions;
        self.num_children = other.num_children;
        self.created_at = other.created_at;
        self.updated_at = other.updated_at;
        self.entity_data = other.entity_data;
    }

    pub fn identify(&self) -> String {
        format!(
            "{}#{} '{}'",
            self.entity_type_name.as_deref().unwrap_or("?"),
            self.id,
            self.name
        )
    }
}

impl EntityData {
    /// Edge pointing at a child entity
    pub fn to_child(attribute_name: impl Into<String>, child: ChildRef, order_index: Option<i32>) -> Self {
        Self {
            id: None,
            attribute_name: attribute_name.into(),
            order_index,
            value: None,
            parent_id: None,
            child: Some(child),
        }
    }

    /// Edge holding a literal value
    pub fn with_value(attribute_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: None,
            attribute_name: attribute_name.into(),
            order_index: None,
            value: Some(value.into()),
            parent_id: None,
            child: None,
        }
    }

    pub fn child_id(&self) -> Option<EntityId> {
        self.child.as_ref().map(ChildRef::id)
    }

    pub fn child_entity(&self) -> Option<EntityHandle> {
        match &self.child {
            Some(ChildRef::Loaded(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn points_at(&self, entity_id: EntityId) -> bool {
        self.child_id() == Some(entity_id)
    }

    pub fn is_equivalent(&self, other: &EntityData) -> bool {
        self.id == other.id
            && self.attribute_name == other.attribute_name
            && self.order_index == other.order_index
            && self.value == other.value
            && self.child_id() == other.child_id()
    }
}

impl ChildRef {
    pub fn id(&self) -> EntityId {
        match self {
            ChildRef::Unloaded(id) | ChildRef::Forbidden(id) => *id,
            ChildRef::Loaded(handle) => handle.id(),
        }
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, ChildRef::Forbidden(_))
    }
}

impl fmt::Debug for ChildRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildRef::Unloaded(id) => write!(f, "Unloaded({})", id),
            ChildRef::Loaded(handle) => write!(f, "Loaded({})", handle.id()),
            ChildRef::Forbidden(id) => write!(f, "Forbidden({})", id),
        }
    }
}

impl EntityHandle {
    pub fn new(entity: Entity) -> Self {
        Self {
            id: entity.id,
            inner: Arc::new(RwLock::new(entity)),
        }
    }

    /// Ids never change, so reading one does not take the lock
    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Entity> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Entity> {
        self.inner.write()
    }

    pub fn ptr_eq(&self, other: &EntityHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Detached copy of the current state
    pub fn snapshot(&self) -> Entity {
        self.inner.read().clone()
    }

    pub fn name(&self) -> String {
        self.inner.read().name.clone()
    }

    pub fn identify(&self) -> String {
        self.inner.read().identify()
    }
}

impl fmt::Debug for EntityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityHandle({})", self.id)
    }
}

impl From<Entity> for EntityHandle {
    fn from(entity: Entity) -> Self {
        EntityHandle::new(entity)
    }
}
