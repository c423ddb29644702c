use crate::model::{Entity, EntityData, EntityDataId, EntityId, OntologyTermType};
use anyhow::Result;

/// Remote entity operations. Every call may block on the network.
/// Returned entities are detached values, never cached instances.
#[async_trait::async_trait]
pub trait EntityFacade: Send + Sync {
    async fn get_entity_by_id(&self, id: EntityId) -> Result<Option<Entity>>;
    /// Entities that exist and are readable, in no particular order
    async fn get_entities_by_id(&self, ids: &[EntityId]) -> Result<Vec<Entity>>;
    /// The entity with every readable descendant loaded
    async fn get_entity_tree(&self, id: EntityId) -> Result<Option<Entity>>;
    /// Readable children of the given entity
    async fn get_child_entities(&self, parent_id: EntityId) -> Result<Vec<Entity>>;
    async fn get_entities_by_name(&self, name: &str) -> Result<Vec<Entity>>;
    async fn get_entities_by_type_name(&self, type_name: &str) -> Result<Vec<Entity>>;
    /// Like `get_entities_by_name`, restricted to entities the subject owns
    async fn get_owned_entities_by_name(&self, name: &str) -> Result<Vec<Entity>>;
    async fn get_owned_entities_by_type_name(&self, type_name: &str) -> Result<Vec<Entity>>;
    async fn get_parent_entities(&self, child_id: EntityId) -> Result<Vec<Entity>>;
    /// Edges pointing at the child whose parent the subject may read
    async fn get_parent_entity_datas(&self, child_id: EntityId) -> Result<Vec<EntityData>>;
    /// Every edge pointing at the child, whoever owns the parent
    async fn get_all_parent_entity_datas(&self, child_id: EntityId) -> Result<Vec<EntityData>>;
    async fn get_ancestor_with_type(&self, id: EntityId, type_name: &str) -> Result<Option<Entity>>;

    async fn create_entity(&self, type_name: &str, name: &str) -> Result<Entity>;
    /// Persist the entity's fields and edges, returning the stored version
    async fn save_entity(&self, entity: &Entity) -> Result<Entity>;
    async fn save_entity_data(&self, entity_data: &EntityData) -> Result<EntityData>;
    async fn set_or_update_value(
        &self,
        entity_id: EntityId,
        attribute_name: &str,
        value: &str,
    ) -> Result<EntityData>;
    async fn update_child_index(&self, entity_data_id: EntityDataId, order_index: i32) -> Result<()>;
    /// Persist the order indexes of every edge of the entity
    async fn update_child_indexes(&self, entity: &Entity) -> Result<()>;
    async fn remove_entity_data(&self, entity_data_id: EntityDataId) -> Result<()>;
    async fn delete_entity_tree(&self, id: EntityId) -> Result<()>;
    async fn add_entity_to_parent(
        &self,
        parent_id: EntityId,
        child_id: EntityId,
        order_index: i32,
        attribute_name: &str,
    ) -> Result<EntityData>;
    async fn add_children(
        &self,
        parent_id: EntityId,
        child_ids: &[EntityId],
        attribute_name: &str,
    ) -> Result<()>;
}

/// Workspace and folder operations
#[async_trait::async_trait]
pub trait AnnotationFacade: Send + Sync {
    async fn get_workspaces(&self) -> Result<Vec<Entity>>;
    /// Create a folder and attach it to the workspace as a common root
    async fn create_folder_in_workspace(&self, workspace_id: EntityId, name: &str) -> Result<Entity>;
    /// Data sets readable by the subject
    async fn get_data_sets(&self) -> Result<Vec<Entity>>;
    /// Create a data set owned by the subject. Fails if the subject already
    /// has one with the same identifier.
    async fn create_data_set(&self, name: &str) -> Result<Entity>;
}

/// Ontology operations
#[async_trait::async_trait]
pub trait OntologyFacade: Send + Sync {
    async fn get_ontology_roots(&self) -> Result<Vec<Entity>>;
    async fn create_ontology_root(&self, name: &str) -> Result<Entity>;
    /// Create a term under `parent_id`; the returned edge carries the loaded term
    async fn create_ontology_term(
        &self,
        parent_id: EntityId,
        label: &str,
        term_type: OntologyTermType,
        order_index: Option<i32>,
    ) -> Result<EntityData>;
}

pub trait Facade: EntityFacade + AnnotationFacade + OntologyFacade + Send + Sync {
    /// Key of the subject the facade acts for
    fn subject_key(&self) -> &str;
}
