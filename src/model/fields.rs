use crate::error::{ModelError, ModelResult};
use crate::model::Entity;

type Getter = fn(&Entity) -> Option<String>;
type Setter = fn(&mut Entity, Option<String>) -> ModelResult<()>;

/// Typed accessor for one editable entity field
pub struct FieldAccessor {
    pub name: &'static str,
    pub get: Getter,
    pub set: Setter,
}

/// Editable entity fields, looked up by their display name
pub static ENTITY_FIELDS: &[FieldAccessor] = &[
    FieldAccessor {
        name: "name",
        get: |e| Some(e.name.clone()),
        set: |e, v| match v {
            Some(name) if !name.trim().is_empty() => {
                e.name = name;
                Ok(())
            }
            _ => Err(ModelError::InvalidArgument("name cannot be empty".to_string())),
        },
    },
    FieldAccessor {
        name: "ownerKey",
        get: |e| e.owner_key.clone(),
        set: |e, v| {
            e.owner_key = v;
            Ok(())
        },
    },
    FieldAccessor {
        name: "entityTypeName",
        get: |e| e.entity_type_name.clone(),
        set: |e, v| match v {
            Some(type_name) => {
                e.entity_type_name = Some(type_name);
                Ok(())
            }
            None => Err(ModelError::InvalidArgument(
                "entityTypeName cannot be cleared".to_string(),
            )),
        },
    },
];

pub fn entity_field(name: &str) -> ModelResult<&'static FieldAccessor> {
    ENTITY_FIELDS
        .iter()
        .find(|f| f.name == name)
        .ok_or_else(|| ModelError::InvalidArgument(format!("unknown entity field '{}'", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_set_through_table() {
        let mut entity = Entity::new(1, "before", "Folder");
        let field = entity_field("name").unwrap();
        assert_eq!((field.get)(&entity).as_deref(), Some("before"));
        (field.set)(&mut entity, Some("after".to_string())).unwrap();
        assert_eq!(entity.name, "after");
    }

    #[test]
    fn test_rejects_invalid_values() {
        let mut entity = Entity::new(1, "n", "Folder");
        assert!((entity_field("name").unwrap().set)(&mut entity, None).is_err());
        assert!((entity_field("entityTypeName").unwrap().set)(&mut entity, None).is_err());
        assert!(entity_field("nope").is_err());
    }
}
