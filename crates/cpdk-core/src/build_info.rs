//! Build metadata embedded by `build.rs`, reported by `cpdk --version` and
//! the `/health` endpoints.

/// Short git commit hash, or `unknown` outside a checkout.
pub const GIT_HASH: &str = env!("CPDK_GIT_HASH");

/// Unix epoch seconds at build time.
pub const BUILD_TIMESTAMP: &str = env!("CPDK_BUILD_TIMESTAMP");

/// Cargo profile (`debug` or `release`).
pub const BUILD_PROFILE: &str = env!("CPDK_BUILD_PROFILE");

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// `"0.1.0 (abc1234, debug)"`
pub fn version_string() -> String {
    format!("{VERSION} ({GIT_HASH}, {BUILD_PROFILE})")
}
