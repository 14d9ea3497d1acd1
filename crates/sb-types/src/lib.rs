//! Shared types for the Switchboard broker
//!
//! Contains the error taxonomy used across all crates and the tool
//! descriptor types exchanged between the transports, the filter service,
//! and the router gate.

pub mod errors;
pub mod mcp_types;

pub use errors::{BrokerError, BrokerResult, OAuthFlowErrorKind, OAuthTokenErrorKind};
pub use mcp_types::{FilteredTool, McpTool};
