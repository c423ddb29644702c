use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server-assigned entity identifier
pub type EntityId = i64;

/// Server-assigned identifier of an `EntityData` edge
pub type EntityDataId = i64;

/// Subject key such as `user:alice` or `group:flylight`
pub type SubjectKey = String;

/// Attribute names used by the model itself
pub mod attributes {
    pub const ENTITY: &str = "Entity";
    pub const COMMON_ROOT: &str = "Common Root";
    pub const ONTOLOGY_ELEMENT: &str = "Ontology Element";
    pub const ONTOLOGY_TERM_TYPE: &str = "Ontology Term Type";
    pub const DATA_SET_IDENTIFIER: &str = "Data Set Identifier";
}

/// Entity type names used by the model itself
pub mod entity_types {
    pub const FOLDER: &str = "Folder";
    pub const WORKSPACE: &str = "Workspace";
    pub const ONTOLOGY_ROOT: &str = "Ontology Root";
    pub const ONTOLOGY_ELEMENT: &str = "Ontology Element";
    pub const DATA_SET: &str = "Data Set";
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rights {
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "w")]
    Write,
    #[serde(rename = "rw")]
    ReadWrite,
}

impl Rights {
    pub fn can_read(&self) -> bool {
        matches!(self, Rights::Read | Rights::ReadWrite)
    }

    pub fn can_write(&self) -> bool {
        matches!(self, Rights::Write | Rights::ReadWrite)
    }
}

/// An access grant on an entity for one subject
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub subject_key: SubjectKey,
    pub rights: Rights,
}

impl Permission {
    pub fn new(subject_key: impl Into<SubjectKey>, rights: Rights) -> Self {
        Self {
            subject_key: subject_key.into(),
            rights,
        }
    }
}

/// Kinds of ontology terms accepted by `create_ontology_term`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum OntologyTermType {
    Category,
    Tag,
    Enum,
    EnumItem,
    Interval,
    Text,
    Accumulation,
}

impl OntologyTermType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OntologyTermType::Category => "Category",
            OntologyTermType::Tag => "Tag",
            OntologyTermType::Enum => "Enum",
            OntologyTermType::EnumItem => "EnumItem",
            OntologyTermType::Interval => "Interval",
            OntologyTermType::Text => "Text",
            OntologyTermType::Accumulation => "Accumulation",
        }
    }
}

pub fn generate_command_id() -> Uuid {
    Uuid::new_v4()
}
