use crate::model::{attributes, entity_types, EntityDataId, EntityId, OntologyTermType, Permission, Rights};
use crate::store::{EntityDataRow, EntityRow, InMemoryFacade};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Rows loaded into an in-memory facade
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub entities: Vec<EntityRow>,
    #[serde(default)]
    pub edges: Vec<EntityDataRow>,
}

impl SeedData {
    pub fn into_facade(self, subject: &str) -> InMemoryFacade {
        InMemoryFacade::from_rows(subject, self.entities, self.edges)
    }
}

/// Helper function to create an entity row readable and writable by its owner
fn create_owned_entity(id: EntityId, name: &str, type_name: &str, owner: &str) -> EntityRow {
    let now = Utc::now();

    EntityRow {
        id,
        name: name.to_string(),
        entity_type_name: type_name.to_string(),
        owner_key: owner.to_string(),
        permissions: vec![Permission::new(owner, Rights::ReadWrite)],
        created_at: now,
        updated_at: now,
    }
}

/// Helper function to create a child edge
fn create_child_edge(id: EntityDataId, parent_id: EntityId, child_id: EntityId, order_index: i32) -> EntityDataRow {
    EntityDataRow {
        id,
        parent_id,
        attribute_name: attributes::ENTITY.to_string(),
        order_index: Some(order_index),
        value: None,
        child_id: Some(child_id),
    }
}

/// Helper function to create a literal value edge
fn create_value_edge(id: EntityDataId, parent_id: EntityId, attribute_name: &str, value: &str) -> EntityDataRow {
    EntityDataRow {
        id,
        parent_id,
        attribute_name: attribute_name.to_string(),
        order_index: None,
        value: Some(value.to_string()),
        child_id: None,
    }
}

/// Read a JSON seed file
pub fn load_seed_data(path: impl AsRef<Path>) -> Result<SeedData> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading seed file {}", path.display()))?;
    let seed: SeedData = serde_json::from_str(&raw)
        .with_context(|| format!("parsing seed file {}", path.display()))?;
    Ok(seed)
}

/// Small sample graph: a workspace with a common root folder of images, a
/// folder shared by another user, one private folder of that user and an
/// ontology.
pub fn sample_seed(subject: &str) -> SeedData {
    let other = "user:colleague";

    let mut shared = create_owned_entity(4, "Shared Results", entity_types::FOLDER, other);
    shared.permissions.push(Permission::new(subject, Rights::Read));

    let entities = vec![
        create_owned_entity(1, "Default Workspace", entity_types::WORKSPACE, subject),
        create_owned_entity(2, "My Data", entity_types::FOLDER, subject),
        create_owned_entity(3, "brain_scan_001.tif", "Image", subject),
        shared,
        create_owned_entity(5, "Private Notes", entity_types::FOLDER, other),
        create_owned_entity(6, "brain_scan_002.tif", "Image", subject),
        create_owned_entity(10, "Annotation Terms", entity_types::ONTOLOGY_ROOT, subject),
        create_owned_entity(11, "Quality", entity_types::ONTOLOGY_ELEMENT, subject),
        create_owned_entity(12, "Good", entity_types::ONTOLOGY_ELEMENT, subject),
        create_owned_entity(13, "Bad", entity_types::ONTOLOGY_ELEMENT, subject),
    ];

    let edges = vec![
        create_child_edge(100, 1, 2, 0),
        create_child_edge(101, 1, 4, 1),
        create_value_edge(102, 2, attributes::COMMON_ROOT, attributes::COMMON_ROOT),
        create_child_edge(103, 2, 3, 0),
        create_child_edge(104, 2, 6, 1),
        create_child_edge(105, 4, 3, 0),
        create_child_edge(106, 4, 5, 1),
        create_value_edge(107, 10, attributes::ONTOLOGY_TERM_TYPE, OntologyTermType::Category.as_str()),
        create_child_edge(108, 10, 11, 0),
        create_value_edge(109, 11, attributes::ONTOLOGY_TERM_TYPE, OntologyTermType::Enum.as_str()),
        create_child_edge(110, 11, 12, 0),
        create_child_edge(111, 11, 13, 1),
        create_value_edge(112, 12, attributes::ONTOLOGY_TERM_TYPE, OntologyTermType::EnumItem.as_str()),
        create_value_edge(113, 13, attributes::ONTOLOGY_TERM_TYPE, OntologyTermType::EnumItem.as_str()),
    ];

    SeedData { entities, edges }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityFacade;

    #[tokio::test]
    async fn test_sample_seed_respects_permissions() {
        let facade = sample_seed("user:demo").into_facade("user:demo");

        let shared = facade.get_entity_by_id(4).await.unwrap();
        assert!(shared.is_some(), "shared folder is readable");

        let private = facade.get_entity_by_id(5).await.unwrap();
        assert!(private.is_none(), "private folder is not readable");

        let tree = facade.get_entity_tree(1).await.unwrap().unwrap();
        assert_eq!(tree.child_count(), 2);
    }

    #[test]
    fn test_load_seed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.json");
        let json = r#"{
            "entities": [
                {"id": 1, "name": "Root", "type": "Folder", "owner_key": "user:a"},
                {"id": 2, "name": "Leaf", "type": "Image", "owner_key": "user:a"}
            ],
            "edges": [
                {"id": 10, "parent_id": 1, "attribute_name": "Entity", "order_index": 0, "child_id": 2}
            ]
        }"#;
        std::fs::write(&path, json).unwrap();

        let seed = load_seed_data(&path).unwrap();
        assert_eq!(seed.entities.len(), 2);
        assert_eq!(seed.edges[0].child_id, Some(2));
        assert!(seed.entities[0].permissions.is_empty());
    }

    #[test]
    fn test_load_missing_seed_file() {
        let err = load_seed_data("/nonexistent/seed.json").unwrap_err();
        assert!(format!("{:#}", err).contains("reading seed file"));
    }
}
