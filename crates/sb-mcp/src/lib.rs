//! Upstream MCP plumbing: protocol, transports, server manager, router gate

pub mod client;
pub mod gateway;
pub mod manager;
pub mod protocol;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::McpClient;
pub use gateway::RouterGate;
pub use manager::ServerManager;
pub use transport::TransportHandle;
