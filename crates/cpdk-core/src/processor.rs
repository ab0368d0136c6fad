//! Command processor: interprets requests against the registry and store.
//!
//! Each request is self-contained: decode, resolve the entity type, run the
//! verb's handler (which commits through the store), publish the resulting
//! change event, then build the response. Every failure becomes an `error`
//! response; nothing here panics or stops the caller's loop.

use std::sync::Arc;

use cpdk_config::ChannelConfig;
use serde_json::Value;
use tracing::{debug, warn};

use crate::protocol::{ChangeEvent, OpCode, Request, Response, Verb};
use crate::publisher::Publisher;
use crate::registry::{EntityType, Registry, RegistryError};
use crate::store::{Store, StoreError};
use crate::value::{FieldKind, FieldValue};

/// Per-channel permissions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// May create/delete daemon-managed instances and write display-only
    /// fields.
    pub allow_daemon_managed: bool,
}

impl Capabilities {
    pub const TRUSTED: Self = Self {
        allow_daemon_managed: true,
    };
}

impl From<ChannelConfig> for Capabilities {
    fn from(channel: ChannelConfig) -> Self {
        Self {
            allow_daemon_managed: channel.allow_daemon_managed,
        }
    }
}

/// A request failure, surfaced to the caller as an `error` response.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("{entity} '{name}' not found")]
    NotFound { entity: String, name: String },

    #[error("{entity} '{name}' already exists")]
    DuplicateName { entity: String, name: String },

    #[error("{entity} has no field '{field}'")]
    UnknownField { entity: String, field: String },

    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("{entity} '{name}' has no '{target}' in {relationship}")]
    RelationNotPresent {
        entity: String,
        name: String,
        relationship: String,
        target: String,
    },

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CommandError {
    /// Stable machine-readable code carried in the response.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::DuplicateName { .. } => "DUPLICATE_NAME",
            Self::UnknownField { .. } => "UNKNOWN_FIELD",
            Self::UnknownEntityType(_) => "UNKNOWN_ENTITY_TYPE",
            Self::UnknownCommand(_) => "UNKNOWN_COMMAND",
            Self::RelationNotPresent { .. } => "RELATION_NOT_PRESENT",
            Self::TypeMismatch(_) => "TYPE_MISMATCH",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::MalformedRequest(_) => "MALFORMED_REQUEST",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<RegistryError> for CommandError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownEntityType(name) => Self::UnknownEntityType(name),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, name } => Self::NotFound { entity, name },
            StoreError::DuplicateName { entity, name } => Self::DuplicateName { entity, name },
            StoreError::UnknownField { entity, field } => Self::UnknownField { entity, field },
            StoreError::UnknownRelationship {
                entity,
                relationship,
            } => Self::UnknownField {
                entity,
                field: relationship,
            },
            StoreError::RelationNotPresent {
                entity,
                name,
                relationship,
                target,
            } => Self::RelationNotPresent {
                entity,
                name,
                relationship,
                target,
            },
            err @ StoreError::TypeMismatch { .. } => Self::TypeMismatch(err.to_string()),
            StoreError::Registry(err) => err.into(),
            err @ StoreError::Sqlite(_) => Self::Internal(err.to_string()),
        }
    }
}

/// What a successful handler produced.
#[derive(Debug, Default)]
pub struct Outcome {
    pub result: Option<Value>,
    pub id: Option<i64>,
    /// Published after the handler returns, i.e. after commit.
    pub event: Option<ChangeEvent>,
}

/// A decoded request bound to its resolved entity type.
pub struct Command<'a> {
    pub entity: &'a EntityType,
    pub request: &'a Request,
    pub caps: Capabilities,
}

impl Command<'_> {
    fn name(&self) -> Result<&str, CommandError> {
        self.request
            .on
            .as_deref()
            .ok_or_else(|| CommandError::MalformedRequest(format!("{} requires 'on'", self.request.t)))
    }

    fn require<'r>(&self, member: &'r Option<String>, key: &str) -> Result<&'r str, CommandError> {
        member
            .as_deref()
            .ok_or_else(|| CommandError::MalformedRequest(format!("{} requires '{key}'", self.request.t)))
    }

    fn guard_managed(&self, action: &str) -> Result<(), CommandError> {
        if self.entity.daemon_managed && !self.caps.allow_daemon_managed {
            return Err(CommandError::PermissionDenied(format!(
                "{} instances are daemon-managed and cannot be {action} from this channel",
                self.entity.name
            )));
        }
        Ok(())
    }

    fn event(&self, op: OpCode, obj: &str) -> ChangeEvent {
        ChangeEvent::new(self.entity.name.clone(), op, Some(obj.to_string()))
    }
}

/// A verb implementation.
pub type Handler = fn(&mut Store, &Command<'_>) -> Result<Outcome, CommandError>;

impl Verb {
    /// Dispatch table.
    pub fn handler(self) -> Handler {
        match self {
            Verb::Get => get,
            Verb::GetOrCreate => get_or_create,
            Verb::Create => create,
            Verb::Modify => modify,
            Verb::Delete => delete,
            Verb::DeleteAll => delete_all,
            Verb::List => list,
            Verb::AddRef => add_ref,
            Verb::DelRef => del_ref,
        }
    }
}

/// Owns the store and publishes on its behalf.
pub struct CommandProcessor {
    registry: Arc<Registry>,
    store: Store,
    publisher: Publisher,
}

impl CommandProcessor {
    pub fn new(store: Store, publisher: Publisher) -> Self {
        let registry = Arc::clone(store.registry());
        Self {
            registry,
            store,
            publisher,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Decode and handle one raw request.
    pub fn handle_raw(&mut self, bytes: &[u8], caps: Capabilities) -> Response {
        match Request::from_slice(bytes) {
            Ok(request) => self.handle(&request, caps),
            Err(e) => {
                let err = CommandError::MalformedRequest(e.to_string());
                warn!(code = err.code(), error = %err, "undecodable request");
                Response::error(err.code(), err.to_string())
            }
        }
    }

    /// Handle one decoded request to completion.
    pub fn handle(&mut self, request: &Request, caps: Capabilities) -> Response {
        debug!(
            verb = %request.t,
            entity = %request.o,
            name = ?request.on,
            "processing request"
        );
        match self.execute(request, caps) {
            Ok(outcome) => {
                if let Some(event) = &outcome.event {
                    if let Err(e) = self.publisher.publish(event) {
                        warn!(entity = %event.entity, error = %e, "failed to publish change event");
                    }
                }
                let mut response = Response::ok();
                if let Some(result) = outcome.result {
                    response = response.with_result(result);
                }
                if let Some(id) = outcome.id {
                    response = response.with_id(id);
                }
                response
            }
            Err(err) => {
                warn!(
                    verb = %request.t,
                    entity = %request.o,
                    code = err.code(),
                    error = %err,
                    "command failed"
                );
                Response::error(err.code(), err.to_string())
            }
        }
    }

    fn execute(&mut self, request: &Request, caps: Capabilities) -> Result<Outcome, CommandError> {
        let verb: Verb = request
            .t
            .parse()
            .map_err(|_| CommandError::UnknownCommand(request.t.clone()))?;
        let registry = Arc::clone(&self.registry);
        let entity = registry.entity(&request.o)?;
        let command = Command {
            entity,
            request,
            caps,
        };
        let outcome = verb.handler()(&mut self.store, &command)?;
        debug_assert!(
            verb.is_mutating() || outcome.event.is_none(),
            "{verb} must not publish"
        );
        Ok(outcome)
    }
}

fn not_found(entity: &EntityType, name: &str) -> CommandError {
    CommandError::NotFound {
        entity: entity.name.clone(),
        name: name.to_string(),
    }
}

fn get(store: &mut Store, cmd: &Command<'_>) -> Result<Outcome, CommandError> {
    let name = cmd.name()?;
    let instance = store
        .find_by_name(cmd.entity, name)?
        .ok_or_else(|| not_found(cmd.entity, name))?;
    Ok(Outcome {
        result: Some(Value::from(instance.name)),
        id: Some(instance.id),
        event: None,
    })
}

fn get_or_create(store: &mut Store, cmd: &Command<'_>) -> Result<Outcome, CommandError> {
    let name = cmd.name()?;
    if store.find_by_name(cmd.entity, name)?.is_none() {
        cmd.guard_managed("created")?;
    }
    let (instance, created) = store.get_or_create(cmd.entity, name)?;
    Ok(Outcome {
        result: Some(Value::from(if created { "created" } else { "exists" })),
        id: Some(instance.id),
        event: created.then(|| cmd.event(OpCode::Create, name)),
    })
}

fn create(store: &mut Store, cmd: &Command<'_>) -> Result<Outcome, CommandError> {
    let name = cmd.name()?;
    cmd.guard_managed("created")?;
    let instance = store.create(cmd.entity, name)?;
    Ok(Outcome {
        result: Some(Value::from("created")),
        id: Some(instance.id),
        event: Some(cmd.event(OpCode::Create, name)),
    })
}

fn modify(store: &mut Store, cmd: &Command<'_>) -> Result<Outcome, CommandError> {
    let name = cmd.name()?;
    let field_name = cmd.require(&cmd.request.f, "f")?;
    let unknown = || CommandError::UnknownField {
        entity: cmd.entity.name.clone(),
        field: field_name.to_string(),
    };
    let target = cmd.entity.resolve_field(field_name).ok_or_else(unknown)?;
    let field = target.field;

    if field.display_only && !cmd.caps.allow_daemon_managed {
        return Err(CommandError::PermissionDenied(format!(
            "{}.{} is display-only",
            cmd.entity.name, field.name
        )));
    }

    let mismatch = || {
        CommandError::TypeMismatch(format!(
            "{}.{} expects a {} value",
            cmd.entity.name, field.name, field.kind
        ))
    };
    let value = match (target.implied, &cmd.request.fv) {
        (Some(implied), None) => FieldValue::Bool(implied),
        // `disabled false` reads as "not disabled".
        (Some(_), Some(v)) => match FieldKind::Boolean.coerce(v).ok_or_else(mismatch)? {
            FieldValue::Bool(b) => FieldValue::Bool(!b),
            other => other,
        },
        (None, None) if field.kind == FieldKind::Boolean => FieldValue::Bool(true),
        (None, None) => return Err(mismatch()),
        (None, Some(v)) => field.kind.coerce(v).ok_or_else(mismatch)?,
    };

    let instance = store.set_field(cmd.entity, name, &field.name, &value)?;
    let stored = instance
        .field(&field.name)
        .map(FieldValue::to_json)
        .unwrap_or(Value::Null);
    Ok(Outcome {
        result: Some(stored.clone()),
        id: Some(instance.id),
        event: Some(cmd.event(OpCode::Modify, name).with_field(field.name.clone(), stored)),
    })
}

fn delete(store: &mut Store, cmd: &Command<'_>) -> Result<Outcome, CommandError> {
    let name = cmd.name()?;
    cmd.guard_managed("deleted")?;
    let instance = store
        .find_by_name(cmd.entity, name)?
        .ok_or_else(|| not_found(cmd.entity, name))?;
    if !store.delete(cmd.entity, name)? {
        return Err(not_found(cmd.entity, name));
    }
    Ok(Outcome {
        result: Some(Value::from("deleted")),
        id: Some(instance.id),
        event: Some(cmd.event(OpCode::Delete, name)),
    })
}

fn delete_all(store: &mut Store, cmd: &Command<'_>) -> Result<Outcome, CommandError> {
    cmd.guard_managed("deleted")?;
    let removed = store.delete_all(cmd.entity)?;
    Ok(Outcome {
        result: Some(Value::from(removed)),
        id: None,
        event: Some(ChangeEvent::new(
            cmd.entity.name.clone(),
            OpCode::DeleteAll,
            None,
        )),
    })
}

fn list(store: &mut Store, cmd: &Command<'_>) -> Result<Outcome, CommandError> {
    let listings = match cmd.request.on.as_deref() {
        Some(name) => vec![
            store
                .list_one(cmd.entity, name)?
                .ok_or_else(|| not_found(cmd.entity, name))?,
        ],
        None => store.list_all(cmd.entity)?,
    };
    Ok(Outcome {
        result: Some(Value::Array(listings.iter().map(|l| l.to_json()).collect())),
        id: None,
        event: None,
    })
}

/// Shared argument handling for `add_ref` and `del_ref`. Returns the
/// relationship name and the target instance name.
fn ref_args<'a>(cmd: &Command<'a>) -> Result<(&'a str, &'a str), CommandError> {
    let request: &'a Request = cmd.request;
    let rel_name = cmd.require(&request.rv, "rv")?;
    let target_name = match &request.fv {
        Some(Value::String(s)) => s.as_str(),
        Some(_) => {
            return Err(CommandError::MalformedRequest(
                "'fv' must name the target instance".to_string(),
            ));
        }
        None => return Err(CommandError::MalformedRequest(format!("{} requires 'fv'", request.t))),
    };

    let rel = cmd
        .entity
        .relationship(rel_name)
        .ok_or_else(|| CommandError::UnknownField {
            entity: cmd.entity.name.clone(),
            field: rel_name.to_string(),
        })?;
    if let Some(target_type) = request.f.as_deref() {
        if target_type != rel.target {
            return Err(CommandError::TypeMismatch(format!(
                "{}.{} relates to {}, not {target_type}",
                cmd.entity.name, rel.name, rel.target
            )));
        }
    }
    if rel.read_only {
        return Err(CommandError::PermissionDenied(format!(
            "{}.{} is read-only",
            cmd.entity.name, rel.name
        )));
    }
    Ok((rel_name, target_name))
}

fn add_ref(store: &mut Store, cmd: &Command<'_>) -> Result<Outcome, CommandError> {
    let name = cmd.name()?;
    let (rel, target) = ref_args(cmd)?;
    store.add_relation(cmd.entity, name, rel, target)?;
    let owner = store
        .find_by_name(cmd.entity, name)?
        .ok_or_else(|| not_found(cmd.entity, name))?;
    Ok(Outcome {
        result: Some(Value::from("added")),
        id: Some(owner.id),
        event: Some(cmd.event(OpCode::AddRef, name).with_field(rel, Value::from(target))),
    })
}

fn del_ref(store: &mut Store, cmd: &Command<'_>) -> Result<Outcome, CommandError> {
    let name = cmd.name()?;
    let (rel, target) = ref_args(cmd)?;
    store.remove_relation(cmd.entity, name, rel, target)?;
    let owner = store
        .find_by_name(cmd.entity, name)?
        .ok_or_else(|| not_found(cmd.entity, name))?;
    Ok(Outcome {
        result: Some(Value::from("removed")),
        id: Some(owner.id),
        event: Some(cmd.event(OpCode::DelRef, name).with_field(rel, Value::from(target))),
    })
}
