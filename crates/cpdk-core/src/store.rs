//! Store adapter: maps registry entity types onto SQLite tables.
//!
//! One table per entity type (`id`, `name`, then one column per field) and one
//! association table per relationship pair. The store is the sole writer of
//! persisted state; every mutating call commits before it returns.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use rusqlite::types::ToSql;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction};
use serde_json::{Map, Value};
use tracing::debug;

use crate::registry::{Cardinality, EntityType, Registry, RegistryError, Relationship};
use crate::value::{FieldKind, FieldValue};

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("{entity} '{name}' not found")]
    NotFound { entity: String, name: String },

    #[error("{entity} '{name}' already exists")]
    DuplicateName { entity: String, name: String },

    #[error("{entity} has no field '{field}'")]
    UnknownField { entity: String, field: String },

    #[error("{entity} has no relationship '{relationship}'")]
    UnknownRelationship {
        entity: String,
        relationship: String,
    },

    #[error("{entity}.{field} expects a {kind} value")]
    TypeMismatch {
        entity: String,
        field: String,
        kind: FieldKind,
    },

    #[error("{entity} '{name}' has no '{target}' in {relationship}")]
    RelationNotPresent {
        entity: String,
        name: String,
        relationship: String,
        target: String,
    },
}

/// A persisted instance with its current field values.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub id: i64,
    pub name: String,
    /// Field values in declaration order.
    pub fields: Vec<(String, FieldValue)>,
}

impl Instance {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// An instance together with the names of everything it is related to.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub instance: Instance,
    /// Related instance names per relationship, in declaration order.
    pub relations: Vec<(String, Vec<String>)>,
}

impl Listing {
    /// Serialize field-by-field plus relationship member names.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".to_string(), Value::from(self.instance.id));
        obj.insert("name".to_string(), Value::from(self.instance.name.clone()));
        for (field, value) in &self.instance.fields {
            obj.insert(field.clone(), value.to_json());
        }
        for (rel, names) in &self.relations {
            obj.insert(rel.clone(), Value::from(names.clone()));
        }
        Value::Object(obj)
    }
}

/// SQLite-backed store for every registered entity type.
pub struct Store {
    conn: Connection,
    registry: Arc<Registry>,
}

impl Store {
    /// Open (or create) the database at `path`. `:memory:` opens a private
    /// in-memory database.
    pub fn open(path: impl AsRef<Path>, registry: Arc<Registry>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = if path == Path::new(":memory:") {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        debug!(path = %path.display(), "store opened");
        Ok(Self { conn, registry })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Create missing entity and association tables, and add columns for
    /// fields that were declared after a table was first created.
    pub fn sync_schema(&mut self) -> Result<(), StoreError> {
        let registry = Arc::clone(&self.registry);
        let tx = self.conn.transaction()?;

        for entity in registry.entities() {
            let mut columns = vec![
                "\"id\" INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
                "\"name\" TEXT NOT NULL UNIQUE".to_string(),
            ];
            columns.extend(
                entity
                    .fields
                    .iter()
                    .map(|f| format!("{} {}", quote(&f.name), f.kind.sql_type())),
            );
            tx.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} ({});",
                quote(&entity.table),
                columns.join(", ")
            ))?;

            let existing = table_columns(&tx, &entity.table)?;
            for field in entity.fields.iter().filter(|f| !existing.contains(&f.name)) {
                debug!(entity = %entity.name, field = %field.name, "adding column");
                tx.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {} {};",
                    quote(&entity.table),
                    quote(&field.name),
                    field.kind.sql_type()
                ))?;
            }
            debug!(entity = %entity.name, table = %entity.table, "table synced");
        }

        for (link, cardinality) in registry.links() {
            let unique = match cardinality {
                Cardinality::OneToMany => " UNIQUE",
                Cardinality::ManyToMany => "",
            };
            tx.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                 \"left_id\" INTEGER NOT NULL, \
                 \"right_id\" INTEGER NOT NULL{unique}, \
                 PRIMARY KEY (\"left_id\", \"right_id\"));",
                quote(&link.table)
            ))?;
            debug!(table = %link.table, "association table synced");
        }

        tx.commit()?;
        Ok(())
    }

    /// Exact match on the unique name.
    pub fn find_by_name(
        &self,
        entity: &EntityType,
        name: &str,
    ) -> Result<Option<Instance>, StoreError> {
        select_instance(&self.conn, entity, name)
    }

    /// Insert a new instance with every field at its declared default.
    pub fn create(&mut self, entity: &EntityType, name: &str) -> Result<Instance, StoreError> {
        let tx = self.conn.transaction()?;
        match insert_instance(&tx, entity, name, false) {
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(StoreError::DuplicateName {
                    entity: entity.name.clone(),
                    name: name.to_string(),
                });
            }
            other => other?,
        };
        let instance = require_instance(&tx, entity, name)?;
        tx.commit()?;
        Ok(instance)
    }

    /// Return the named instance, creating it first if absent. The boolean is
    /// `true` when this call created it.
    pub fn get_or_create(
        &mut self,
        entity: &EntityType,
        name: &str,
    ) -> Result<(Instance, bool), StoreError> {
        let tx = self.conn.transaction()?;
        let created = insert_instance(&tx, entity, name, true)? == 1;
        let instance = require_instance(&tx, entity, name)?;
        tx.commit()?;
        Ok((instance, created))
    }

    /// Overwrite one field. The value must already be of the field's kind.
    pub fn set_field(
        &mut self,
        entity: &EntityType,
        name: &str,
        field: &str,
        value: &FieldValue,
    ) -> Result<Instance, StoreError> {
        let descriptor = entity
            .field(field)
            .ok_or_else(|| StoreError::UnknownField {
                entity: entity.name.clone(),
                field: field.to_string(),
            })?;
        if !fits(descriptor.kind, value) {
            return Err(StoreError::TypeMismatch {
                entity: entity.name.clone(),
                field: field.to_string(),
                kind: descriptor.kind,
            });
        }

        let tx = self.conn.transaction()?;
        let changed = tx.execute(
            &format!(
                "UPDATE {} SET {} = ?1 WHERE \"name\" = ?2",
                quote(&entity.table),
                quote(field)
            ),
            rusqlite::params![value, name],
        )?;
        if changed == 0 {
            return Err(not_found(entity, name));
        }
        let instance = require_instance(&tx, entity, name)?;
        tx.commit()?;
        Ok(instance)
    }

    /// Remove the named instance and its association rows. Returns `false`
    /// when nothing matched.
    pub fn delete(&mut self, entity: &EntityType, name: &str) -> Result<bool, StoreError> {
        let edges = self.edge_columns(entity);
        let tx = self.conn.transaction()?;
        let Some(id) = select_id(&tx, entity, name)? else {
            return Ok(false);
        };
        for (table, column) in &edges {
            tx.execute(
                &format!("DELETE FROM {} WHERE {} = ?1", quote(table), quote(column)),
                [id],
            )?;
        }
        tx.execute(
            &format!("DELETE FROM {} WHERE \"id\" = ?1", quote(&entity.table)),
            [id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Remove every instance of the type. Returns the number removed.
    pub fn delete_all(&mut self, entity: &EntityType) -> Result<usize, StoreError> {
        let edges = self.edge_columns(entity);
        let tx = self.conn.transaction()?;
        for (table, column) in &edges {
            tx.execute(
                &format!(
                    "DELETE FROM {} WHERE {} IN (SELECT \"id\" FROM {})",
                    quote(table),
                    quote(column),
                    quote(&entity.table)
                ),
                [],
            )?;
        }
        let removed = tx.execute(&format!("DELETE FROM {}", quote(&entity.table)), [])?;
        tx.commit()?;
        Ok(removed)
    }

    /// Every instance of the type, ordered by identity.
    pub fn list_all(&self, entity: &EntityType) -> Result<Vec<Listing>, StoreError> {
        let sql = format!(
            "SELECT {} FROM {} ORDER BY \"id\"",
            select_columns(entity),
            quote(&entity.table)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let instances = stmt
            .query_map([], |row| read_instance(entity, row))?
            .collect::<Result<Vec<_>, _>>()?;
        instances
            .into_iter()
            .map(|instance| self.listing(entity, instance))
            .collect()
    }

    /// The named instance with its relations, if it exists.
    pub fn list_one(
        &self,
        entity: &EntityType,
        name: &str,
    ) -> Result<Option<Listing>, StoreError> {
        select_instance(&self.conn, entity, name)?
            .map(|instance| self.listing(entity, instance))
            .transpose()
    }

    /// Relate `name` to `target_name` through `relationship`. Adding an edge
    /// that already exists is a no-op; on a one-to-many relationship the
    /// target is moved away from any previous owner.
    pub fn add_relation(
        &mut self,
        entity: &EntityType,
        name: &str,
        relationship: &str,
        target_name: &str,
    ) -> Result<(), StoreError> {
        let registry = Arc::clone(&self.registry);
        let rel = lookup_relationship(entity, relationship)?;
        let target = registry.entity(&rel.target)?;

        let tx = self.conn.transaction()?;
        let owner_id = select_id(&tx, entity, name)?.ok_or_else(|| not_found(entity, name))?;
        let target_id =
            select_id(&tx, target, target_name)?.ok_or_else(|| not_found(target, target_name))?;

        let link = &rel.link;
        if rel.cardinality == Cardinality::OneToMany {
            tx.execute(
                &format!(
                    "DELETE FROM {} WHERE {} = ?1 AND {} <> ?2",
                    quote(&link.table),
                    quote(link.target_column()),
                    quote(link.owner_column())
                ),
                [target_id, owner_id],
            )?;
        }
        tx.execute(
            &format!(
                "INSERT OR IGNORE INTO {} ({}, {}) VALUES (?1, ?2)",
                quote(&link.table),
                quote(link.owner_column()),
                quote(link.target_column())
            ),
            [owner_id, target_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Remove an existing edge.
    pub fn remove_relation(
        &mut self,
        entity: &EntityType,
        name: &str,
        relationship: &str,
        target_name: &str,
    ) -> Result<(), StoreError> {
        let registry = Arc::clone(&self.registry);
        let rel = lookup_relationship(entity, relationship)?;
        let target = registry.entity(&rel.target)?;

        let tx = self.conn.transaction()?;
        let absent = || StoreError::RelationNotPresent {
            entity: entity.name.clone(),
            name: name.to_string(),
            relationship: relationship.to_string(),
            target: target_name.to_string(),
        };
        let owner_id = select_id(&tx, entity, name)?.ok_or_else(|| not_found(entity, name))?;
        let target_id = select_id(&tx, target, target_name)?.ok_or_else(absent)?;

        let link = &rel.link;
        let removed = tx.execute(
            &format!(
                "DELETE FROM {} WHERE {} = ?1 AND {} = ?2",
                quote(&link.table),
                quote(link.owner_column()),
                quote(link.target_column())
            ),
            [owner_id, target_id],
        )?;
        if removed == 0 {
            return Err(absent());
        }
        tx.commit()?;
        Ok(())
    }

    /// Names of the instances related to instance `id`, ordered by identity.
    pub fn related_names(
        &self,
        entity: &EntityType,
        id: i64,
        relationship: &str,
    ) -> Result<Vec<String>, StoreError> {
        let rel = lookup_relationship(entity, relationship)?;
        self.names_via(rel, id)
    }

    /// Number of live instances of the type.
    pub fn count(&self, entity: &EntityType) -> Result<usize, StoreError> {
        let n: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote(&entity.table)),
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(n).unwrap_or_default())
    }

    fn listing(&self, entity: &EntityType, instance: Instance) -> Result<Listing, StoreError> {
        let relations = entity
            .relationships
            .iter()
            .map(|rel| Ok((rel.name.clone(), self.names_via(rel, instance.id)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        Ok(Listing {
            instance,
            relations,
        })
    }

    fn names_via(&self, rel: &Relationship, id: i64) -> Result<Vec<String>, StoreError> {
        let target = self.registry.entity(&rel.target)?;
        let link = &rel.link;
        let sql = format!(
            "SELECT t.\"name\" FROM {} l JOIN {} t ON t.\"id\" = l.{} \
             WHERE l.{} = ?1 ORDER BY t.\"id\"",
            quote(&link.table),
            quote(&target.table),
            quote(link.target_column()),
            quote(link.owner_column())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let names = stmt
            .query_map([id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Every `(association table, column)` that can hold an identity of
    /// `entity`: its own relationships plus any relationship targeting it.
    fn edge_columns(&self, entity: &EntityType) -> Vec<(String, &'static str)> {
        let mut seen = HashSet::new();
        let own = entity
            .relationships
            .iter()
            .map(|r| (r.link.table.clone(), r.link.owner_column()));
        let incoming = self
            .registry
            .entities()
            .flat_map(|e| e.relationships.iter())
            .filter(|r| r.target == entity.name)
            .map(|r| (r.link.table.clone(), r.link.target_column()));
        own.chain(incoming)
            .filter(|edge| seen.insert(edge.clone()))
            .collect()
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn not_found(entity: &EntityType, name: &str) -> StoreError {
    StoreError::NotFound {
        entity: entity.name.clone(),
        name: name.to_string(),
    }
}

fn lookup_relationship<'a>(
    entity: &'a EntityType,
    relationship: &str,
) -> Result<&'a Relationship, StoreError> {
    entity
        .relationship(relationship)
        .ok_or_else(|| StoreError::UnknownRelationship {
            entity: entity.name.clone(),
            relationship: relationship.to_string(),
        })
}

/// Whether an already-coerced value may be stored in a column of `kind`.
fn fits(kind: FieldKind, value: &FieldValue) -> bool {
    match (kind, value) {
        (_, FieldValue::Null) => true,
        (FieldKind::Boolean, FieldValue::Bool(_)) => true,
        (FieldKind::Integer, FieldValue::Int(i)) => i32::try_from(*i).is_ok(),
        (FieldKind::BigInteger, FieldValue::Int(_)) => true,
        (FieldKind::Float, FieldValue::Float(f)) => f.is_finite(),
        (FieldKind::String, FieldValue::Text(_)) => true,
        _ => false,
    }
}

fn table_columns(tx: &Transaction<'_>, table: &str) -> Result<HashSet<String>, StoreError> {
    let mut stmt = tx.prepare(&format!("PRAGMA table_info({})", quote(table)))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(names)
}

fn select_columns(entity: &EntityType) -> String {
    let mut columns = vec!["\"id\"".to_string(), "\"name\"".to_string()];
    columns.extend(entity.fields.iter().map(|f| quote(&f.name)));
    columns.join(", ")
}

fn read_instance(entity: &EntityType, row: &rusqlite::Row<'_>) -> rusqlite::Result<Instance> {
    let fields = entity
        .fields
        .iter()
        .enumerate()
        .map(|(i, f)| Ok((f.name.clone(), FieldValue::read(f.kind, row, i + 2)?)))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(Instance {
        id: row.get(0)?,
        name: row.get(1)?,
        fields,
    })
}

fn select_instance(
    conn: &Connection,
    entity: &EntityType,
    name: &str,
) -> Result<Option<Instance>, StoreError> {
    let sql = format!(
        "SELECT {} FROM {} WHERE \"name\" = ?1",
        select_columns(entity),
        quote(&entity.table)
    );
    let instance = conn
        .query_row(&sql, [name], |row| read_instance(entity, row))
        .optional()?;
    Ok(instance)
}

fn require_instance(
    conn: &Connection,
    entity: &EntityType,
    name: &str,
) -> Result<Instance, StoreError> {
    select_instance(conn, entity, name)?.ok_or_else(|| not_found(entity, name))
}

fn select_id(conn: &Connection, entity: &EntityType, name: &str) -> Result<Option<i64>, StoreError> {
    let id = conn
        .query_row(
            &format!("SELECT \"id\" FROM {} WHERE \"name\" = ?1", quote(&entity.table)),
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Returns the number of rows inserted (0 when `or_ignore` skipped a
/// duplicate).
fn insert_instance(
    conn: &Connection,
    entity: &EntityType,
    name: &str,
    or_ignore: bool,
) -> rusqlite::Result<usize> {
    let mut columns = vec!["\"name\"".to_string()];
    columns.extend(entity.fields.iter().map(|f| quote(&f.name)));
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let verb = if or_ignore { "INSERT OR IGNORE" } else { "INSERT" };
    let sql = format!(
        "{verb} INTO {} ({}) VALUES ({})",
        quote(&entity.table),
        columns.join(", "),
        placeholders.join(", ")
    );

    let mut params: Vec<&dyn ToSql> = vec![&name];
    params.extend(entity.fields.iter().map(|f| &f.default as &dyn ToSql));
    conn.execute(&sql, params.as_slice())
}
