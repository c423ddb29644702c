//! Concrete model commands. Commands refer to entities by id and resolve the
//! canonical instance when they run, so they survive invalidation of the
//! handles that existed when they were created.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{CommandError, ModelError};
use crate::logic::command::{Command, CommandId};
use crate::logic::entity_model::EntityModel;
use crate::model::{entity_field, generate_command_id, EntityData, EntityHandle, EntityId};

async fn resolve(model: &EntityModel, command: &str, id: EntityId) -> Result<EntityHandle, CommandError> {
    model
        .get_entity_by_id(id)
        .await
        .map_err(|e| CommandError::execution(command, e))?
        .ok_or_else(|| CommandError::execution(command, ModelError::NotFound(id)))
}

pub struct RenameEntityCommand {
    id: CommandId,
    model: Arc<EntityModel>,
    entity_id: EntityId,
    new_name: String,
}

impl RenameEntityCommand {
    pub fn new(model: Arc<EntityModel>, entity_id: EntityId, new_name: impl Into<String>) -> Self {
        Self {
            id: generate_command_id(),
            model,
            entity_id,
            new_name: new_name.into(),
        }
    }
}

#[async_trait]
impl Command for RenameEntityCommand {
    fn id(&self) -> CommandId {
        self.id
    }

    fn name(&self) -> String {
        "Rename".to_string()
    }

    fn log_message(&self) -> String {
        format!("Rename entity {} to '{}'", self.entity_id, self.new_name)
    }

    async fn validate_preconditions(&self) -> Result<(), CommandError> {
        if self.new_name.trim().is_empty() {
            return Err(CommandError::precondition(self.name(), "the new name is empty"));
        }
        Ok(())
    }

    async fn execute(&self) -> Result<Option<Box<dyn Command>>, CommandError> {
        let entity = resolve(&self.model, &self.name(), self.entity_id).await?;
        let old_name = entity.name();
        self.model
            .rename_entity(&entity, &self.new_name)
            .await
            .map_err(|e| CommandError::execution(self.name(), e))?;
        Ok(Some(Box::new(RenameEntityCommand::new(
            Arc::clone(&self.model),
            self.entity_id,
            old_name,
        ))))
    }

    async fn validate_postconditions(&self) -> Result<(), CommandError> {
        match self.model.get_if_cached(self.entity_id) {
            Some(entity) if entity.name() != self.new_name => Err(CommandError::postcondition(
                self.name(),
                format!("entity {} is still named '{}'", self.entity_id, entity.name()),
            )),
            _ => Ok(()),
        }
    }
}

/// Set a literal attribute. The inverse restores the previous value, or
/// removes the edge when the attribute did not exist before.
pub struct SetAttributeValueCommand {
    id: CommandId,
    model: Arc<EntityModel>,
    entity_id: EntityId,
    attribute_name: String,
    value: String,
}

impl SetAttributeValueCommand {
    pub fn new(
        model: Arc<EntityModel>,
        entity_id: EntityId,
        attribute_name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_command_id(),
            model,
            entity_id,
            attribute_name: attribute_name.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
impl Command for SetAttributeValueCommand {
    fn id(&self) -> CommandId {
        self.id
    }

    fn name(&self) -> String {
        format!("Set {}", self.attribute_name)
    }

    fn log_message(&self) -> String {
        format!(
            "Set {} of entity {} to '{}'",
            self.attribute_name, self.entity_id, self.value
        )
    }

    async fn execute(&self) -> Result<Option<Box<dyn Command>>, CommandError> {
        let entity = resolve(&self.model, &self.name(), self.entity_id).await?;
        let previous = entity
            .read()
            .value_by_attribute_name(&self.attribute_name)
            .map(str::to_string);
        let saved = self
            .model
            .set_or_update_value(&entity, &self.attribute_name, &self.value)
            .await
            .map_err(|e| CommandError::execution(self.name(), e))?;

        let inverse: Box<dyn Command> = match previous {
            Some(previous) => Box::new(SetAttributeValueCommand::new(
                Arc::clone(&self.model),
                self.entity_id,
                self.attribute_name.clone(),
                previous,
            )),
            None => Box::new(RemoveEntityDataCommand::new(Arc::clone(&self.model), saved)),
        };
        Ok(Some(inverse))
    }
}

/// Link an existing entity under a parent. The inverse removes the new edge.
pub struct AddEntityToParentCommand {
    id: CommandId,
    model: Arc<EntityModel>,
    parent_id: EntityId,
    child_id: EntityId,
    index: Option<i32>,
    attribute_name: String,
}

impl AddEntityToParentCommand {
    pub fn new(
        model: Arc<EntityModel>,
        parent_id: EntityId,
        child_id: EntityId,
        index: Option<i32>,
        attribute_name: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_command_id(),
            model,
            parent_id,
            child_id,
            index,
            attribute_name: attribute_name.into(),
        }
    }
}

#[async_trait]
impl Command for AddEntityToParentCommand {
    fn id(&self) -> CommandId {
        self.id
    }

    fn name(&self) -> String {
        "Add to folder".to_string()
    }

    fn log_message(&self) -> String {
        format!("Add entity {} to {}", self.child_id, self.parent_id)
    }

    async fn validate_preconditions(&self) -> Result<(), CommandError> {
        if self.parent_id == self.child_id {
            return Err(CommandError::precondition(
                self.name(),
                "an entity cannot be its own child",
            ));
        }
        Ok(())
    }

    async fn execute(&self) -> Result<Option<Box<dyn Command>>, CommandError> {
        let parent = resolve(&self.model, &self.name(), self.parent_id).await?;
        let child = resolve(&self.model, &self.name(), self.child_id).await?;
        let edge = self
            .model
            .add_entity_to_parent(&parent, &child, self.index, &self.attribute_name)
            .await
            .map_err(|e| CommandError::execution(self.name(), e))?;
        Ok(Some(Box::new(RemoveEntityDataCommand::new(
            Arc::clone(&self.model),
            edge,
        ))))
    }
}

/// Remove an edge. The inverse puts an equivalent edge back at the same index.
pub struct RemoveEntityDataCommand {
    id: CommandId,
    model: Arc<EntityModel>,
    entity_data: EntityData,
}

impl RemoveEntityDataCommand {
    pub fn new(model: Arc<EntityModel>, entity_data: EntityData) -> Self {
        Self {
            id: generate_command_id(),
            model,
            entity_data,
        }
    }
}

#[async_trait]
impl Command for RemoveEntityDataCommand {
    fn id(&self) -> CommandId {
        self.id
    }

    fn name(&self) -> String {
        format!("Remove {}", self.entity_data.attribute_name)
    }

    async fn validate_preconditions(&self) -> Result<(), CommandError> {
        if self.entity_data.id.is_none() || self.entity_data.parent_id.is_none() {
            return Err(CommandError::precondition(
                self.name(),
                "the edge has not been saved",
            ));
        }
        Ok(())
    }

    async fn execute(&self) -> Result<Option<Box<dyn Command>>, CommandError> {
        let parent_id = self
            .entity_data
            .parent_id
            .ok_or_else(|| CommandError::precondition(self.name(), "the edge has no parent"))?;
        self.model
            .delete_entity_data(&self.entity_data)
            .await
            .map_err(|e| CommandError::execution(self.name(), e))?;

        let ed = &self.entity_data;
        let inverse: Option<Box<dyn Command>> = match (ed.child_id(), &ed.value) {
            (Some(child_id), _) => Some(Box::new(AddEntityToParentCommand::new(
                Arc::clone(&self.model),
                parent_id,
                child_id,
                ed.order_index,
                ed.attribute_name.clone(),
            ))),
            (None, Some(value)) => Some(Box::new(SetAttributeValueCommand::new(
                Arc::clone(&self.model),
                parent_id,
                ed.attribute_name.clone(),
                value.clone(),
            ))),
            (None, None) => None,
        };
        Ok(inverse)
    }
}

/// Create an entity. The inverse deletes it again.
pub struct CreateEntityCommand {
    id: CommandId,
    model: Arc<EntityModel>,
    type_name: String,
    entity_name: String,
}

impl CreateEntityCommand {
    pub fn new(model: Arc<EntityModel>, type_name: impl Into<String>, entity_name: impl Into<String>) -> Self {
        Self {
            id: generate_command_id(),
            model,
            type_name: type_name.into(),
            entity_name: entity_name.into(),
        }
    }
}

#[async_trait]
impl Command for CreateEntityCommand {
    fn id(&self) -> CommandId {
        self.id
    }

    fn name(&self) -> String {
        format!("Create {}", self.type_name)
    }

    fn log_message(&self) -> String {
        format!("Create {} '{}'", self.type_name, self.entity_name)
    }

    async fn execute(&self) -> Result<Option<Box<dyn Command>>, CommandError> {
        let created = self
            .model
            .create_entity(&self.type_name, &self.entity_name)
            .await
            .map_err(|e| CommandError::execution(self.name(), e))?;
        Ok(Some(Box::new(DeleteEntityTreeCommand::new(
            Arc::clone(&self.model),
            created.id(),
        ))))
    }
}

/// Delete an entity and its subtree. Not invertible.
pub struct DeleteEntityTreeCommand {
    id: CommandId,
    model: Arc<EntityModel>,
    entity_id: EntityId,
}

impl DeleteEntityTreeCommand {
    pub fn new(model: Arc<EntityModel>, entity_id: EntityId) -> Self {
        Self {
            id: generate_command_id(),
            model,
            entity_id,
        }
    }
}

#[async_trait]
impl Command for DeleteEntityTreeCommand {
    fn id(&self) -> CommandId {
        self.id
    }

    fn name(&self) -> String {
        "Delete".to_string()
    }

    fn log_message(&self) -> String {
        format!("Delete entity tree {}", self.entity_id)
    }

    async fn execute(&self) -> Result<Option<Box<dyn Command>>, CommandError> {
        let entity = resolve(&self.model, &self.name(), self.entity_id).await?;
        self.model
            .delete_entity_tree(&entity)
            .await
            .map_err(|e| CommandError::execution(self.name(), e))?;
        Ok(None)
    }
}

/// Edit one field through the entity field table
pub struct SetFieldCommand {
    id: CommandId,
    model: Arc<EntityModel>,
    entity_id: EntityId,
    field: String,
    value: Option<String>,
}

impl SetFieldCommand {
    pub fn new(
        model: Arc<EntityModel>,
        entity_id: EntityId,
        field: impl Into<String>,
        value: Option<String>,
    ) -> Self {
        Self {
            id: generate_command_id(),
            model,
            entity_id,
            field: field.into(),
            value,
        }
    }
}

#[async_trait]
impl Command for SetFieldCommand {
    fn id(&self) -> CommandId {
        self.id
    }

    fn name(&self) -> String {
        format!("Edit {}", self.field)
    }

    fn log_message(&self) -> String {
        format!(
            "Set {} of entity {} to {:?}",
            self.field, self.entity_id, self.value
        )
    }

    async fn validate_preconditions(&self) -> Result<(), CommandError> {
        entity_field(&self.field)
            .map(|_| ())
            .map_err(|e| CommandError::precondition(self.name(), e.to_string()))
    }

    async fn execute(&self) -> Result<Option<Box<dyn Command>>, CommandError> {
        let accessor = entity_field(&self.field).map_err(|e| CommandError::execution(self.name(), e))?;
        let entity = resolve(&self.model, &self.name(), self.entity_id).await?;

        let mut modified = entity.snapshot();
        let previous = (accessor.get)(&modified);
        (accessor.set)(&mut modified, self.value.clone())
            .map_err(|e| CommandError::execution(self.name(), e))?;
        self.model
            .save_entity_copy(modified)
            .await
            .map_err(|e| CommandError::execution(self.name(), e))?;

        Ok(Some(Box::new(SetFieldCommand::new(
            Arc::clone(&self.model),
            self.entity_id,
            self.field.clone(),
            previous,
        ))))
    }

    async fn validate_postconditions(&self) -> Result<(), CommandError> {
        let accessor = entity_field(&self.field)
            .map_err(|e| CommandError::postcondition(self.name(), e.to_string()))?;
        if let Some(entity) = self.model.get_if_cached(self.entity_id) {
            let current = (accessor.get)(&entity.read());
            if current != self.value {
                return Err(CommandError::postcondition(
                    self.name(),
                    format!("{} is {:?}", self.field, current),
                ));
            }
        }
        Ok(())
    }
}
