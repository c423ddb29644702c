use crate::model::{EntityData, EntityHandle, EntityId};

/// High level model events broadcast on the event bus
#[derive(Debug, Clone)]
pub enum ModelEvent {
    EntityChanged(EntityHandle),
    EntityCreated(EntityHandle),
    /// The root of a deleted tree, plus the edges that used to point at it
    EntityRemoved {
        entity: EntityHandle,
        parent_edges: Vec<EntityData>,
    },
    EntityInvalidated(Invalidation),
    EntityChildrenLoaded(EntityHandle),
}

#[derive(Debug, Clone)]
pub enum Invalidation {
    /// The whole model was cleared
    All,
    Entities(Vec<EntityHandle>),
}

impl ModelEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ModelEvent::EntityChanged(_) => "EntityChanged",
            ModelEvent::EntityCreated(_) => "EntityCreated",
            ModelEvent::EntityRemoved { .. } => "EntityRemoved",
            ModelEvent::EntityInvalidated(_) => "EntityInvalidated",
            ModelEvent::EntityChildrenLoaded(_) => "EntityChildrenLoaded",
        }
    }

    /// Ids the event is about; empty for a total invalidation
    pub fn entity_ids(&self) -> Vec<EntityId> {
        match self {
            ModelEvent::EntityChanged(e)
            | ModelEvent::EntityCreated(e)
            | ModelEvent::EntityChildrenLoaded(e)
            | ModelEvent::EntityRemoved { entity: e, .. } => vec![e.id()],
            ModelEvent::EntityInvalidated(Invalidation::Entities(entities)) => {
                entities.iter().map(EntityHandle::id).collect()
            }
            ModelEvent::EntityInvalidated(Invalidation::All) => Vec::new(),
        }
    }

    pub fn is_total_invalidation(&self) -> bool {
        matches!(self, ModelEvent::EntityInvalidated(Invalidation::All))
    }
}
