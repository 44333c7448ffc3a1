//! Aegis Proxy
//!
//! The enforcement entry point and its wiring: configuration loading, the
//! [`PolicyEnforcer`] serving path, and the [`Upstream`] seam to tool
//! servers. The binary adds a thin JSON-line stdio transport on top.

pub mod config;
pub mod enforcer;
pub mod upstream;

pub use config::AegisConfig;
pub use enforcer::PolicyEnforcer;
pub use upstream::{EchoUpstream, HttpUpstream, Upstream};
