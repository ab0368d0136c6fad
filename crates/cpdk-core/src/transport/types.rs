//! JSON bodies for the non-protocol endpoints.

use serde::{Deserialize, Serialize};

/// `GET /health` on any socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// Which socket answered: `cli`, `peer` or `publish`.
    pub channel: String,
    pub version: String,
    pub git_hash: String,
    pub build_profile: String,
    pub build_timestamp: String,
}

impl HealthResponse {
    pub fn current(channel: &str) -> Self {
        Self {
            status: "ok".to_string(),
            channel: channel.to_string(),
            version: crate::build_info::VERSION.to_string(),
            git_hash: crate::build_info::GIT_HASH.to_string(),
            build_profile: crate::build_info::BUILD_PROFILE.to_string(),
            build_timestamp: crate::build_info::BUILD_TIMESTAMP.to_string(),
        }
    }
}

/// Transport-level failure (the worker is gone). Protocol errors are
/// ordinary `Response`s with HTTP 200.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Query string of `GET /events`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsQuery {
    /// Entity type name; absent means every topic.
    #[serde(default)]
    pub topic: Option<String>,
}
