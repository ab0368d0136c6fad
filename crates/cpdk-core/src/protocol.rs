//! Wire types shared by the daemon, its clients, and subscribers.
//!
//! Requests and responses are single JSON objects; change notifications are
//! two-element JSON arrays `[entity, payload]`, one per line on the publish
//! stream.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Command verbs understood by the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    GetOrCreate,
    Create,
    Modify,
    Delete,
    DeleteAll,
    List,
    AddRef,
    DelRef,
}

impl Verb {
    pub const ALL: [Verb; 9] = [
        Verb::Get,
        Verb::GetOrCreate,
        Verb::Create,
        Verb::Modify,
        Verb::Delete,
        Verb::DeleteAll,
        Verb::List,
        Verb::AddRef,
        Verb::DelRef,
    ];

    /// The `t` spelling of this verb.
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::GetOrCreate => "get_or_create",
            Verb::Create => "create",
            Verb::Modify => "modify",
            Verb::Delete => "delete",
            Verb::DeleteAll => "delete_all",
            Verb::List => "list",
            Verb::AddRef => "add_ref",
            Verb::DelRef => "del_ref",
        }
    }

    /// Whether a successful run of this verb can change stored state.
    pub fn is_mutating(self) -> bool {
        !matches!(self, Verb::Get | Verb::List)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned for a `t` that names no verb.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown command: {0}")]
pub struct UnknownVerb(pub String);

impl FromStr for Verb {
    type Err = UnknownVerb;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verb::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| UnknownVerb(s.to_string()))
    }
}

/// A command from a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Verb.
    pub t: String,
    /// Entity type name.
    pub o: String,
    /// Instance name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on: Option<String>,
    /// Field name, or target entity type for `add_ref`/`del_ref`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub f: Option<String>,
    /// Field value, or target instance name for `add_ref`/`del_ref`. An
    /// explicit `null` is kept as `Some(Value::Null)`.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub fv: Option<Value>,
    /// Relationship name for `add_ref`/`del_ref`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rv: Option<String>,
}

impl Request {
    pub fn new(verb: Verb, entity: impl Into<String>) -> Self {
        Self {
            t: verb.as_str().to_string(),
            o: entity.into(),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.on = Some(name.into());
        self
    }

    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.f = Some(field.into());
        self
    }

    pub fn value(mut self, value: impl Into<Value>) -> Self {
        self.fv = Some(value.into());
        self
    }

    pub fn relationship(mut self, rel: impl Into<String>) -> Self {
        self.rv = Some(rel.into());
        self
    }

    /// Decode a request from raw message bytes.
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Deserialize a member that is present, treating `null` as a value.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// The daemon's reply to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Stable machine-readable error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            message: None,
            code: None,
            result: None,
            id: None,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: Some(message.into()),
            code: Some(code.into()),
            result: None,
            id: None,
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Kind of committed mutation a change event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpCode {
    Create,
    Delete,
    Modify,
    AddRef,
    DelRef,
    DeleteAll,
}

/// Object half of a change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(rename = "type")]
    pub op: OpCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obj: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,
}

/// A committed mutation, published on the topic named by `entity`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub entity: String,
    pub payload: EventPayload,
}

impl ChangeEvent {
    pub fn new(entity: impl Into<String>, op: OpCode, obj: Option<String>) -> Self {
        Self {
            entity: entity.into(),
            payload: EventPayload {
                op,
                obj,
                field: None,
                value: None,
            },
        }
    }

    pub fn with_field(mut self, field: impl Into<String>, value: Value) -> Self {
        self.payload.field = Some(field.into());
        self.payload.value = Some(value);
        self
    }

    /// `["Entity", {...}]`, without a trailing newline.
    pub fn to_wire(&self) -> serde_json::Result<String> {
        serde_json::to_string(&(&self.entity, &self.payload))
    }

    pub fn from_wire(line: &str) -> serde_json::Result<Self> {
        let (entity, payload): (String, EventPayload) = serde_json::from_str(line)?;
        Ok(Self { entity, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_verb_spellings() {
        for verb in Verb::ALL {
            assert_eq!(verb.as_str().parse::<Verb>().unwrap(), verb);
        }
        assert_eq!(
            "frobnicate".parse::<Verb>().unwrap_err(),
            UnknownVerb("frobnicate".to_string())
        );
        assert!(!Verb::List.is_mutating());
        assert!(Verb::DeleteAll.is_mutating());
    }

    #[test]
    fn test_request_null_value_is_present() {
        let req = Request::from_slice(br#"{"t":"modify","o":"VirtualServer","on":"v1","f":"port","fv":null}"#)
            .unwrap();
        assert_eq!(req.fv, Some(Value::Null));

        let req = Request::from_slice(br#"{"t":"modify","o":"VirtualServer","on":"v1","f":"enabled"}"#)
            .unwrap();
        assert_eq!(req.fv, None);
    }

    #[test]
    fn test_request_builder_serializes_compactly() {
        let req = Request::new(Verb::AddRef, "Server")
            .name("s1")
            .relationship("virtual_servers")
            .value("v1");
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"t": "add_ref", "o": "Server", "on": "s1", "fv": "v1", "rv": "virtual_servers"})
        );
    }

    #[test]
    fn test_request_requires_entity() {
        assert!(Request::from_slice(br#"{"t":"list"}"#).is_err());
        assert!(Request::from_slice(b"not json").is_err());
    }

    #[test]
    fn test_response_shape() {
        let ok = Response::ok().with_result(json!("created")).with_id(1);
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"status": "ok", "result": "created", "id": 1})
        );

        let err = Response::error("NOT_FOUND", "VirtualServer 'v9' not found");
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"status": "error", "message": "VirtualServer 'v9' not found", "code": "NOT_FOUND"})
        );
        assert!(!err.is_ok());
    }

    #[test]
    fn test_event_wire_form() {
        let event = ChangeEvent::new("VirtualServer", OpCode::Modify, Some("v1".into()))
            .with_field("enabled", json!(true));
        let line = event.to_wire().unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(&line).unwrap(),
            json!(["VirtualServer", {"type": "MODIFY", "obj": "v1", "field": "enabled", "value": true}])
        );
        assert_eq!(ChangeEvent::from_wire(&line).unwrap(), event);
    }

    #[test]
    fn test_delete_all_event_has_no_obj() {
        let event = ChangeEvent::new("VirtualServer", OpCode::DeleteAll, None);
        assert_eq!(
            event.to_wire().unwrap(),
            r#"["VirtualServer",{"type":"DELETE_ALL"}]"#
        );
    }

    #[test]
    fn test_cleared_value_survives_round_trip() {
        let event = ChangeEvent::new("VirtualServer", OpCode::Modify, Some("v1".into()))
            .with_field("port", Value::Null);
        let line = event.to_wire().unwrap();
        assert!(line.contains(r#""value":null"#));
        assert_eq!(ChangeEvent::from_wire(&line).unwrap().payload.value, Some(Value::Null));
    }
}
