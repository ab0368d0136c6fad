//! Declarative schema description: the entity, field, and relationship
//! metadata the daemon's model registry is built from.
//!
//! The schema is plain data. It is parsed from TOML either inline in the main
//! config (`[[schema.entity]]`) or from a standalone schema file
//! (`[[entity]]`), and is read exactly once at daemon startup. Semantic checks
//! (supported kinds, relationship targets, inverses) happen when the registry
//! is built from it; this module only checks shape.
//!
//! ## TOML Example
//!
//! ```toml
//! [[entity]]
//! name = "Interface"
//! daemon_managed = true
//!
//! [[entity.field]]
//! name = "enabled"
//! kind = "boolean"
//! default = false
//! negative_cmd = "disabled"
//!
//! [[entity.field]]
//! name = "packets_in"
//! kind = "biginteger"
//! default = 0
//! display_only = true
//!
//! [[entity]]
//! name = "Server"
//!
//! [[entity.relationship]]
//! name = "virtual_servers"
//! target = "VirtualServer"
//! cardinality = "many-to-many"
//! inverse = "servers"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// The full set of entity types known to a daemon run.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Entity type descriptions, in declaration order.
    #[serde(default, rename = "entity")]
    pub entities: Vec<EntityConfig>,
}

/// One entity type as expressed in TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityConfig {
    /// Entity type name (e.g. "VirtualServer").
    pub name: String,

    /// Instances may only be created/deleted by trusted peer channels.
    #[serde(default)]
    pub daemon_managed: bool,

    /// Scalar fields, in declaration order.
    #[serde(default, rename = "field")]
    pub fields: Vec<FieldConfig>,

    /// Relationships to other entity types.
    #[serde(default, rename = "relationship")]
    pub relationships: Vec<RelationshipConfig>,
}

/// One scalar field as expressed in TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    /// Field name; becomes the column name.
    pub name: String,

    /// Scalar kind: "boolean", "integer", "biginteger", "string" or "float".
    pub kind: String,

    /// Value stored when an instance is created. Absent means null.
    #[serde(default)]
    pub default: Option<serde_json::Value>,

    /// Derived/reported field that external commands may not set.
    #[serde(default)]
    pub display_only: bool,

    /// Alternate command name that sets a boolean field to false.
    #[serde(default)]
    pub negative_cmd: Option<String>,
}

/// One relationship as expressed in TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipConfig {
    /// Relationship name, unique among the entity's members.
    pub name: String,

    /// Target entity type name.
    pub target: String,

    /// "many-to-many" or "one-to-many".
    #[serde(default = "default_cardinality")]
    pub cardinality: String,

    /// Name of the relationship on the target that mirrors this one.
    #[serde(default)]
    pub inverse: Option<String>,

    /// Observable but never add/remove-mutated via command.
    #[serde(default)]
    pub read_only: bool,
}

fn default_cardinality() -> String {
    "many-to-many".to_string()
}

impl SchemaConfig {
    /// Load a standalone schema file using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse a standalone schema from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let schema: SchemaConfig = toml::from_str(s)?;
        schema.validate()?;
        Ok(schema)
    }

    /// Look up an entity description by name.
    pub fn entity(&self, name: &str) -> Option<&EntityConfig> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Shape checks: every name present and non-empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, entity) in self.entities.iter().enumerate() {
            if entity.name.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "entity[{i}].name must not be empty"
                )));
            }
            for (j, field) in entity.fields.iter().enumerate() {
                if field.name.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "entity[{i}].field[{j}].name must not be empty"
                    )));
                }
                if field.kind.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "entity[{i}].field[{j}].kind must not be empty"
                    )));
                }
            }
            for (j, rel) in entity.relationships.iter().enumerate() {
                if rel.name.is_empty() || rel.target.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "entity[{i}].relationship[{j}] needs both name and target"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BASIC: &str = r#"
        [[entity]]
        name = "Interface"
        daemon_managed = true

        [[entity.field]]
        name = "enabled"
        kind = "boolean"
        default = false
        negative_cmd = "disabled"

        [[entity.field]]
        name = "packets_out"
        kind = "biginteger"
        default = 0
        display_only = true

        [[entity]]
        name = "VirtualServer"

        [[entity.field]]
        name = "port"
        kind = "integer"

        [[entity.relationship]]
        name = "servers"
        target = "Server"
        inverse = "virtual_servers"
    "#;

    #[test]
    fn test_parse_entities_in_order() {
        let schema = SchemaConfig::parse(BASIC).unwrap();
        let names: Vec<_> = schema.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Interface", "VirtualServer"]);
    }

    #[test]
    fn test_field_metadata() {
        let schema = SchemaConfig::parse(BASIC).unwrap();
        let iface = schema.entity("Interface").unwrap();
        assert!(iface.daemon_managed);
        assert_eq!(iface.fields[0].negative_cmd.as_deref(), Some("disabled"));
        assert_eq!(iface.fields[0].default, Some(serde_json::json!(false)));
        assert!(iface.fields[1].display_only);
    }

    #[test]
    fn test_relationship_defaults() {
        let schema = SchemaConfig::parse(BASIC).unwrap();
        let vs = schema.entity("VirtualServer").unwrap();
        assert!(!vs.daemon_managed);
        let rel = &vs.relationships[0];
        assert_eq!(rel.cardinality, "many-to-many");
        assert_eq!(rel.inverse.as_deref(), Some("virtual_servers"));
        assert!(!rel.read_only);
    }

    #[test]
    fn test_empty_schema() {
        let schema = SchemaConfig::parse("").unwrap();
        assert!(schema.entities.is_empty());
    }

    #[test]
    fn test_rejects_empty_entity_name() {
        let result = SchemaConfig::parse(
            r#"
            [[entity]]
            name = ""
        "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_relationship_without_target() {
        let result = SchemaConfig::parse(
            r#"
            [[entity]]
            name = "Server"

            [[entity.relationship]]
            name = "peers"
            target = ""
        "#,
        );
        assert!(result.is_err());
    }
}
