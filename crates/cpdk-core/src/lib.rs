#![deny(unsafe_code)]

//! cpdk core daemon runtime.
//!
//! A schema-driven configuration database: entity types are declared once
//! at startup, clients create, modify, relate and delete named instances of
//! them over request/reply sockets, and every committed mutation is
//! broadcast to passive subscribers on a publish socket.

/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Daemon runtime: startup, the single worker loop, and shutdown.
pub mod daemon;
/// Command processor: verb dispatch against the registry and store.
pub mod processor;
/// Wire types for requests, responses, and change events.
pub mod protocol;
/// Change-event fan-out.
pub mod publisher;
/// Model registry built from the declarative schema.
pub mod registry;
/// SQLite-backed store adapter.
pub mod store;
/// Unix-socket HTTP server and client.
pub mod transport;
/// Scalar field kinds and values.
pub mod value;

pub use daemon::{Daemon, DaemonError, ShutdownSignal};
pub use processor::{Capabilities, CommandError, CommandProcessor};
pub use protocol::{ChangeEvent, OpCode, Request, Response, Status, Verb};
pub use publisher::Publisher;
pub use registry::{Registry, RegistryError};
pub use store::{Store, StoreError};
pub use transport::{ClientError, DaemonClient, Subscription};
pub use value::{FieldKind, FieldValue};
