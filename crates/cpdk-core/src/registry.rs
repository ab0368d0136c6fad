//! Model registry: entity types, fields, and relationships.
//!
//! Built once from a [`SchemaConfig`] at startup and immutable afterwards.
//! Construction performs every semantic check on the schema so that the rest
//! of the daemon can treat lookups as infallible apart from unknown names.

use std::collections::{HashMap, HashSet};

use cpdk_config::{EntityConfig, SchemaConfig};

use crate::value::{FieldKind, FieldValue};

/// Column names every entity table carries; fields may not reuse them.
const RESERVED_NAMES: [&str; 2] = ["id", "name"];

/// Errors raised while building or querying the registry.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("duplicate entity type: {0}")]
    DuplicateEntity(String),

    #[error("{entity}: duplicate member '{member}'")]
    DuplicateMember { entity: String, member: String },

    #[error("{entity}: '{member}' is reserved for instance identity")]
    ReservedName { entity: String, member: String },

    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),

    #[error("{entity}.{field}: unsupported field kind '{kind}'")]
    UnsupportedFieldKind {
        entity: String,
        field: String,
        kind: String,
    },

    #[error("{entity}.{field}: default does not fit kind {kind}")]
    InvalidDefault {
        entity: String,
        field: String,
        kind: FieldKind,
    },

    #[error("{entity}.{field}: negative_cmd requires a boolean field")]
    InvalidNegativeCmd { entity: String, field: String },

    #[error("{entity}.{relationship}: unknown cardinality '{cardinality}'")]
    UnknownCardinality {
        entity: String,
        relationship: String,
        cardinality: String,
    },

    #[error("{entity}.{relationship}: target '{target}' is not registered")]
    UnknownTarget {
        entity: String,
        relationship: String,
        target: String,
    },

    #[error("{entity}.{relationship}: {reason}")]
    InvalidInverse {
        entity: String,
        relationship: String,
        reason: String,
    },

    #[error("{entity}.{relationship}: table '{table}' is already used by {other}")]
    TableCollision {
        entity: String,
        relationship: String,
        table: String,
        other: String,
    },
}

/// A scalar field descriptor.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
    pub default: FieldValue,
    pub display_only: bool,
    pub negative_cmd: Option<String>,
}

/// Relationship cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    ManyToMany,
    /// Each target belongs to at most one owner.
    OneToMany,
}

impl Cardinality {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "many-to-many" | "many_to_many" => Some(Self::ManyToMany),
            "one-to-many" | "one_to_many" => Some(Self::OneToMany),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ManyToMany => "many-to-many",
            Self::OneToMany => "one-to-many",
        }
    }
}

/// Where a relationship's edges live.
///
/// A relationship and its declared inverse share one association table; the
/// side whose `(entity, relationship)` pair sorts first owns the `left_id`
/// column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub table: String,
    pub owner_is_left: bool,
}

impl Link {
    /// Column holding this side's instance identity.
    pub fn owner_column(&self) -> &'static str {
        if self.owner_is_left { "left_id" } else { "right_id" }
    }

    /// Column holding the related instance identity.
    pub fn target_column(&self) -> &'static str {
        if self.owner_is_left { "right_id" } else { "left_id" }
    }
}

/// A relationship descriptor.
#[derive(Debug, Clone)]
pub struct Relationship {
    pub name: String,
    pub target: String,
    pub cardinality: Cardinality,
    pub read_only: bool,
    pub inverse: Option<String>,
    pub link: Link,
}

/// An entity type descriptor.
#[derive(Debug, Clone)]
pub struct EntityType {
    pub name: String,
    /// Backing table name.
    pub table: String,
    pub daemon_managed: bool,
    pub fields: Vec<Field>,
    pub relationships: Vec<Relationship>,
}

/// A field resolved from a command name, which may be a `negative_cmd` alias.
#[derive(Debug, Clone, Copy)]
pub struct FieldTarget<'a> {
    pub field: &'a Field,
    /// Set when the name was a negative alias; the value it implies.
    pub implied: Option<bool>,
}

impl EntityType {
    /// Look up a field by its own name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Resolve a command-facing field name, including negative aliases.
    pub fn resolve_field(&self, name: &str) -> Option<FieldTarget<'_>> {
        if let Some(field) = self.field(name) {
            return Some(FieldTarget {
                field,
                implied: None,
            });
        }
        self.fields
            .iter()
            .find(|f| f.negative_cmd.as_deref() == Some(name))
            .map(|field| FieldTarget {
                field,
                implied: Some(false),
            })
    }

    /// Look up a relationship by name.
    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name == name)
    }
}

/// Immutable registry of entity types.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entities: Vec<EntityType>,
    index: HashMap<String, usize>,
}

impl Registry {
    /// Build a registry, rejecting any schema that is not self-consistent.
    pub fn from_schema(schema: &SchemaConfig) -> Result<Self, RegistryError> {
        let mut index = HashMap::new();
        let mut tables = HashSet::new();
        for (i, entity) in schema.entities.iter().enumerate() {
            check_identifier(&entity.name)?;
            // Table names are case-folded, so "Server" and "server" collide.
            if index.insert(entity.name.clone(), i).is_some()
                || !tables.insert(entity.name.to_ascii_lowercase())
            {
                return Err(RegistryError::DuplicateEntity(entity.name.clone()));
            }
        }

        let mut entities = Vec::with_capacity(schema.entities.len());
        for entity in &schema.entities {
            entities.push(build_entity(entity, schema, &index)?);
        }
        check_link_tables(&entities, &tables)?;

        Ok(Self { entities, index })
    }

    /// Look up an entity type by name.
    pub fn entity(&self, name: &str) -> Result<&EntityType, RegistryError> {
        self.index
            .get(name)
            .map(|&i| &self.entities[i])
            .ok_or_else(|| RegistryError::UnknownEntityType(name.to_string()))
    }

    /// All entity types in declaration order.
    pub fn entities(&self) -> impl Iterator<Item = &EntityType> {
        self.entities.iter()
    }

    /// Distinct association tables, each with its one-to-many flag.
    pub fn links(&self) -> Vec<(&Link, Cardinality)> {
        let mut seen = HashSet::new();
        self.entities
            .iter()
            .flat_map(|e| e.relationships.iter())
            .filter(|r| seen.insert(r.link.table.as_str()))
            .map(|r| (&r.link, r.cardinality))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

fn build_entity(
    entity: &EntityConfig,
    schema: &SchemaConfig,
    index: &HashMap<String, usize>,
) -> Result<EntityType, RegistryError> {
    let mut members: HashSet<&str> = HashSet::new();
    let claim = |member: &str| -> Result<(), RegistryError> {
        check_identifier(member)?;
        if RESERVED_NAMES.contains(&member) {
            return Err(RegistryError::ReservedName {
                entity: entity.name.clone(),
                member: member.to_string(),
            });
        }
        Ok(())
    };

    let mut fields = Vec::with_capacity(entity.fields.len());
    for fc in &entity.fields {
        claim(&fc.name)?;
        let kind =
            FieldKind::parse(&fc.kind).ok_or_else(|| RegistryError::UnsupportedFieldKind {
                entity: entity.name.clone(),
                field: fc.name.clone(),
                kind: fc.kind.clone(),
            })?;
        let default = match &fc.default {
            None => FieldValue::Null,
            Some(v) => kind.coerce(v).ok_or_else(|| RegistryError::InvalidDefault {
                entity: entity.name.clone(),
                field: fc.name.clone(),
                kind,
            })?,
        };
        if fc.negative_cmd.is_some() && kind != FieldKind::Boolean {
            return Err(RegistryError::InvalidNegativeCmd {
                entity: entity.name.clone(),
                field: fc.name.clone(),
            });
        }
        fields.push(Field {
            name: fc.name.clone(),
            kind,
            default,
            display_only: fc.display_only,
            negative_cmd: fc.negative_cmd.clone(),
        });
    }

    let mut relationships = Vec::with_capacity(entity.relationships.len());
    for rc in &entity.relationships {
        claim(&rc.name)?;
        let cardinality =
            Cardinality::parse(&rc.cardinality).ok_or_else(|| RegistryError::UnknownCardinality {
                entity: entity.name.clone(),
                relationship: rc.name.clone(),
                cardinality: rc.cardinality.clone(),
            })?;
        if !index.contains_key(&rc.target) {
            return Err(RegistryError::UnknownTarget {
                entity: entity.name.clone(),
                relationship: rc.name.clone(),
                target: rc.target.clone(),
            });
        }
        let link = match &rc.inverse {
            None => Link {
                table: link_table(&entity.name, &rc.name),
                owner_is_left: true,
            },
            Some(inverse) => {
                check_inverse(entity, rc, inverse, cardinality, schema)?;
                let this = (entity.name.as_str(), rc.name.as_str());
                let other = (rc.target.as_str(), inverse.as_str());
                let left = this.min(other);
                Link {
                    table: link_table(left.0, left.1),
                    owner_is_left: left == this,
                }
            }
        };
        relationships.push(Relationship {
            name: rc.name.clone(),
            target: rc.target.clone(),
            cardinality,
            read_only: rc.read_only,
            inverse: rc.inverse.clone(),
            link,
        });
    }

    // Every member name (fields, negative aliases, relationships) is unique.
    let aliases = fields.iter().filter_map(|f| f.negative_cmd.as_deref());
    let names = fields
        .iter()
        .map(|f| f.name.as_str())
        .chain(aliases)
        .chain(relationships.iter().map(|r| r.name.as_str()));
    for name in names {
        if !members.insert(name) {
            return Err(RegistryError::DuplicateMember {
                entity: entity.name.clone(),
                member: name.to_string(),
            });
        }
    }

    Ok(EntityType {
        name: entity.name.clone(),
        table: entity.name.to_ascii_lowercase(),
        daemon_managed: entity.daemon_managed,
        fields,
        relationships,
    })
}

fn check_inverse(
    entity: &EntityConfig,
    rc: &cpdk_config::RelationshipConfig,
    inverse: &str,
    cardinality: Cardinality,
    schema: &SchemaConfig,
) -> Result<(), RegistryError> {
    let fail = |reason: String| RegistryError::InvalidInverse {
        entity: entity.name.clone(),
        relationship: rc.name.clone(),
        reason,
    };

    if rc.target == entity.name && inverse == rc.name {
        return Err(fail("a relationship cannot be its own inverse".to_string()));
    }
    if cardinality != Cardinality::ManyToMany {
        return Err(fail(
            "only many-to-many relationships may declare an inverse".to_string(),
        ));
    }
    let target = schema
        .entity(&rc.target)
        .ok_or_else(|| fail(format!("target '{}' is not registered", rc.target)))?;
    let other = target
        .relationships
        .iter()
        .find(|r| r.name == inverse)
        .ok_or_else(|| fail(format!("'{}' has no relationship '{inverse}'", rc.target)))?;
    if other.target != entity.name || other.inverse.as_deref() != Some(rc.name.as_str()) {
        return Err(fail(format!(
            "'{}.{inverse}' must target '{}' with inverse '{}'",
            rc.target, entity.name, rc.name
        )));
    }
    if Cardinality::parse(&other.cardinality) != Some(Cardinality::ManyToMany) {
        return Err(fail(format!(
            "'{}.{inverse}' must also be many-to-many",
            rc.target
        )));
    }
    Ok(())
}

/// Only an inverse pair may share an association table, and no association
/// table may take an entity table's name.
fn check_link_tables(
    entities: &[EntityType],
    entity_tables: &HashSet<String>,
) -> Result<(), RegistryError> {
    let mut owners: HashMap<&str, (&EntityType, &Relationship)> = HashMap::new();
    for entity in entities {
        for rel in &entity.relationships {
            let table = rel.link.table.as_str();
            let collision = |other: String| RegistryError::TableCollision {
                entity: entity.name.clone(),
                relationship: rel.name.clone(),
                table: table.to_string(),
                other,
            };
            if entity_tables.contains(table) {
                return Err(collision("an entity type".to_string()));
            }
            match owners.get(table) {
                None => {
                    owners.insert(table, (entity, rel));
                }
                Some((owner, owner_rel)) => {
                    let is_inverse = rel.target == owner.name
                        && rel.inverse.as_deref() == Some(owner_rel.name.as_str())
                        && owner_rel.target == entity.name
                        && owner_rel.inverse.as_deref() == Some(rel.name.as_str());
                    if !is_inverse {
                        return Err(collision(format!("{}.{}", owner.name, owner_rel.name)));
                    }
                }
            }
        }
    }
    Ok(())
}

fn link_table(entity: &str, relationship: &str) -> String {
    format!(
        "{}_{}_link",
        entity.to_ascii_lowercase(),
        relationship.to_ascii_lowercase()
    )
}

/// Whether `name` has the `[A-Za-z_][A-Za-z0-9_]*` shape every entity,
/// field and relationship name must have.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// Names become SQL identifiers.
fn check_identifier(name: &str) -> Result<(), RegistryError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(RegistryError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(toml: &str) -> Result<Registry, RegistryError> {
        let schema = SchemaConfig::parse(toml).unwrap();
        Registry::from_schema(&schema)
    }

    const APPLIANCE: &str = r#"
        [[entity]]
        name = "Interface"
        daemon_managed = true

        [[entity.field]]
        name = "enabled"
        kind = "boolean"
        default = false
        negative_cmd = "disabled"

        [[entity.field]]
        name = "packets_in"
        kind = "biginteger"
        default = 0
        display_only = true

        [[entity]]
        name = "Server"

        [[entity.field]]
        name = "address"
        kind = "string"

        [[entity.relationship]]
        name = "virtual_servers"
        target = "VirtualServer"
        inverse = "servers"

        [[entity]]
        name = "VirtualServer"

        [[entity.field]]
        name = "port"
        kind = "integer"

        [[entity.relationship]]
        name = "servers"
        target = "Server"
        inverse = "virtual_servers"

        [[entity.relationship]]
        name = "interfaces"
        target = "Interface"
        cardinality = "one-to-many"
        read_only = true
    "#;

    #[test]
    fn test_lookup_entity() {
        let registry = parse(APPLIANCE).unwrap();
        assert_eq!(registry.len(), 3);
        let iface = registry.entity("Interface").unwrap();
        assert!(iface.daemon_managed);
        assert_eq!(iface.table, "interface");
        assert_eq!(iface.fields[0].default, FieldValue::Bool(false));
        assert_eq!(iface.fields[1].kind, FieldKind::BigInteger);
    }

    #[test]
    fn test_unknown_entity_type() {
        let registry = parse(APPLIANCE).unwrap();
        assert_eq!(
            registry.entity("Router").unwrap_err(),
            RegistryError::UnknownEntityType("Router".to_string())
        );
    }

    #[test]
    fn test_resolve_negative_alias() {
        let registry = parse(APPLIANCE).unwrap();
        let iface = registry.entity("Interface").unwrap();

        let direct = iface.resolve_field("enabled").unwrap();
        assert_eq!(direct.field.name, "enabled");
        assert_eq!(direct.implied, None);

        let negative = iface.resolve_field("disabled").unwrap();
        assert_eq!(negative.field.name, "enabled");
        assert_eq!(negative.implied, Some(false));

        assert!(iface.resolve_field("mtu").is_none());
    }

    #[test]
    fn test_inverse_pair_shares_link() {
        let registry = parse(APPLIANCE).unwrap();
        let server = registry.entity("Server").unwrap();
        let vs = registry.entity("VirtualServer").unwrap();
        let forward = server.relationship("virtual_servers").unwrap();
        let backward = vs.relationship("servers").unwrap();

        assert_eq!(forward.link.table, backward.link.table);
        assert_ne!(forward.link.owner_is_left, backward.link.owner_is_left);
        assert_eq!(forward.link.owner_column(), backward.link.target_column());
    }

    #[test]
    fn test_links_are_distinct() {
        let registry = parse(APPLIANCE).unwrap();
        let links = registry.links();
        assert_eq!(links.len(), 2);
        assert!(
            links
                .iter()
                .any(|(link, card)| link.table == "virtualserver_interfaces_link"
                    && *card == Cardinality::OneToMany)
        );
    }

    #[test]
    fn test_rejects_unsupported_kind() {
        let err = parse(
            r#"
            [[entity]]
            name = "Server"

            [[entity.field]]
            name = "weight"
            kind = "decimal"
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedFieldKind { .. }));
    }

    #[test]
    fn test_rejects_unknown_target() {
        let err = parse(
            r#"
            [[entity]]
            name = "Server"

            [[entity.relationship]]
            name = "pools"
            target = "Pool"
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownTarget { .. }));
    }

    #[test]
    fn test_rejects_reserved_field() {
        let err = parse(
            r#"
            [[entity]]
            name = "Server"

            [[entity.field]]
            name = "name"
            kind = "string"
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::ReservedName { .. }));
    }

    #[test]
    fn test_rejects_duplicate_entity() {
        let err = parse(
            r#"
            [[entity]]
            name = "Server"

            [[entity]]
            name = "Server"
        "#,
        )
        .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateEntity("Server".to_string()));
    }

    #[test]
    fn test_rejects_alias_collision() {
        let err = parse(
            r#"
            [[entity]]
            name = "Interface"

            [[entity.field]]
            name = "enabled"
            kind = "boolean"
            negative_cmd = "shutdown"

            [[entity.field]]
            name = "shutdown"
            kind = "boolean"
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateMember { .. }));
    }

    #[test]
    fn test_rejects_bad_default() {
        let err = parse(
            r#"
            [[entity]]
            name = "VirtualServer"

            [[entity.field]]
            name = "port"
            kind = "integer"
            default = "eighty"
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidDefault { .. }));
    }

    #[test]
    fn test_rejects_negative_cmd_on_string() {
        let err = parse(
            r#"
            [[entity]]
            name = "Server"

            [[entity.field]]
            name = "address"
            kind = "string"
            negative_cmd = "no_address"
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidNegativeCmd { .. }));
    }

    #[test]
    fn test_rejects_one_sided_inverse() {
        let err = parse(
            r#"
            [[entity]]
            name = "Server"

            [[entity.relationship]]
            name = "virtual_servers"
            target = "VirtualServer"
            inverse = "servers"

            [[entity]]
            name = "VirtualServer"

            [[entity.relationship]]
            name = "servers"
            target = "Server"
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidInverse { .. }));
    }

    #[test]
    fn test_rejects_bad_identifier() {
        let err = parse(
            r#"
            [[entity]]
            name = "Virtual Server"
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidIdentifier(_)));
    }

    #[test]
    fn test_self_relationship_inverse() {
        let registry = parse(
            r#"
            [[entity]]
            name = "Server"

            [[entity.relationship]]
            name = "backups"
            target = "Server"
            inverse = "primaries"

            [[entity.relationship]]
            name = "primaries"
            target = "Server"
            inverse = "backups"
        "#,
        )
        .unwrap();
        let server = registry.entity("Server").unwrap();
        let backups = server.relationship("backups").unwrap();
        let primaries = server.relationship("primaries").unwrap();
        assert_eq!(backups.link.table, "server_backups_link");
        assert!(backups.link.owner_is_left);
        assert!(!primaries.link.owner_is_left);
    }

    #[test]
    fn test_rejects_unknown_cardinality() {
        let err = parse(
            r#"
            [[entity]]
            name = "Server"

            [[entity.relationship]]
            name = "peers"
            target = "Server"
            cardinality = "one-to-one"
        "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RegistryError::UnknownCardinality { ref cardinality, .. } if cardinality == "one-to-one"
        ));
    }

    #[test]
    fn test_rejects_inverse_with_mismatched_cardinality() {
        let err = parse(
            r#"
            [[entity]]
            name = "Server"

            [[entity.relationship]]
            name = "virtual_servers"
            target = "VirtualServer"
            inverse = "servers"

            [[entity]]
            name = "VirtualServer"

            [[entity.relationship]]
            name = "servers"
            target = "Server"
            cardinality = "one-to-many"
            inverse = "virtual_servers"
        "#,
        )
        .unwrap_err();
        match err {
            RegistryError::InvalidInverse {
                entity,
                relationship,
                reason,
            } => {
                assert_eq!(entity, "Server");
                assert_eq!(relationship, "virtual_servers");
                assert!(reason.contains("must also be many-to-many"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_link_table_collision() {
        // A_b.c and A.b_c would both be stored in a_b_c_link.
        let err = parse(
            r#"
            [[entity]]
            name = "T"

            [[entity]]
            name = "A_b"

            [[entity.relationship]]
            name = "c"
            target = "T"

            [[entity]]
            name = "A"

            [[entity.relationship]]
            name = "b_c"
            target = "T"
        "#,
        )
        .unwrap_err();
        assert_eq!(
            err,
            RegistryError::TableCollision {
                entity: "A".to_string(),
                relationship: "b_c".to_string(),
                table: "a_b_c_link".to_string(),
                other: "A_b.c".to_string(),
            }
        );
    }

    #[test]
    fn test_rejects_link_table_named_like_entity() {
        let err = parse(
            r#"
            [[entity]]
            name = "Server"

            [[entity.relationship]]
            name = "pools"
            target = "Server"

            [[entity]]
            name = "Server_pools_link"
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::TableCollision { .. }));
    }

    #[test]
    fn test_case_variant_relationships_collide() {
        let err = parse(
            r#"
            [[entity]]
            name = "Server"

            [[entity.relationship]]
            name = "peers"
            target = "Server"

            [[entity.relationship]]
            name = "Peers"
            target = "Server"
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, RegistryError::TableCollision { .. }));
    }
}
