//! Aegis Core
//!
//! Core types shared across Aegis components.
//!
//! This crate provides:
//! - The normalized inbound request and the [`DecisionContext`] it becomes
//! - The [`ContextCollector`] that validates and enriches raw requests
//! - [`Decision`] and [`Verdict`] types produced by the decision engines
//! - Error types with stable machine-readable codes for the wire

pub mod context;
pub mod decision;
pub mod directive;
pub mod error;
pub mod request;

pub use context::{ContextCollector, ContextConfig, DecisionContext, Environment};
pub use directive::{Directive, DirectiveFamily};
pub use decision::{Decision, DecisionMetadata, EngineKind, Verdict};
pub use error::{Error, ErrorCode, ErrorResponse, Result};
pub use request::{InboundRequest, McpMethod};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::context::{ContextCollector, DecisionContext};
    pub use crate::decision::{Decision, Verdict};
    pub use crate::error::{Error, ErrorCode, ErrorResponse, Result};
    pub use crate::request::{InboundRequest, McpMethod};
}
