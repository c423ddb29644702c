use crate::model::{EntityData, EntityHandle, EntityId};

/// An entity together with the edge chain through which it was reached.
/// The same entity may appear under several parents; each path is distinct.
#[derive(Debug, Clone)]
pub struct RootedEntity {
    unique_id: String,
    entity: EntityHandle,
    edge: Option<EntityData>,
}

impl RootedEntity {
    pub fn new(entity: EntityHandle) -> Self {
        Self {
            unique_id: format!("/e_{}", entity.id()),
            entity,
            edge: None,
        }
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn entity(&self) -> &EntityHandle {
        &self.entity
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity.id()
    }

    /// The edge that led here, `None` for the root
    pub fn edge(&self) -> Option<&EntityData> {
        self.edge.as_ref()
    }

    /// Follow a loaded edge of this entity
    pub fn child(&self, edge: &EntityData) -> Option<RootedEntity> {
        let child = edge.child_entity()?;
        let edge_key = match edge.id {
            Some(id) => format!("ed_{}", id),
            None => format!("ed_{}", edge.attribute_name.replace(' ', "_")),
        };
        Some(RootedEntity {
            unique_id: format!("{}/{}/e_{}", self.unique_id, edge_key, child.id()),
            entity: child,
            edge: Some(edge.clone()),
        })
    }

    /// Follow the first loaded edge pointing at `child_id`
    pub fn child_by_id(&self, child_id: EntityId) -> Option<RootedEntity> {
        let edge = {
            let entity = self.entity.read();
            entity
                .entity_data
                .iter()
                .find(|ed| ed.points_at(child_id) && ed.child_entity().is_some())
                .cloned()
        }?;
        self.child(&edge)
    }

    pub fn children(&self) -> Vec<RootedEntity> {
        let edges = self.entity.read().entity_data.clone();
        edges.iter().filter_map(|ed| self.child(ed)).collect()
    }
}
