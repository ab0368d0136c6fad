//! Transport front: Unix domain sockets carrying HTTP/1.1.
//!
//! ```text
//! ┌──────────┐  POST /command   ┌─────────────┐  Job   ┌────────┐
//! │ cpdk CLI │─────────────────▶│ cli socket  │───────▶│        │
//! └──────────┘                  └─────────────┘        │ Worker │
//! ┌──────────┐  POST /command   ┌─────────────┐  Job   │ (one   │
//! │ peer     │─────────────────▶│ peer socket │───────▶│  at a  │
//! │ daemons  │                  └─────────────┘        │  time) │
//! └──────────┘                                         └───┬────┘
//! ┌──────────┐  GET /events     ┌────────────────┐         │ publish
//! │ watchers │◀─────────────────│ publish socket │◀────────┘
//! └──────────┘  NDJSON stream   └────────────────┘
//! ```
//!
//! Route handlers never touch the store. They enqueue the raw request on
//! their channel's bounded queue and wait for the worker's reply.

pub mod client;
pub mod server;
pub mod types;

pub use client::{ClientError, DaemonClient, Subscription};
pub use server::{Job, Lane};
pub use types::*;
