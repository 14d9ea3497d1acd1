//! Transports to upstream MCP servers
//!
//! Three flavors share one capability set (send a request, send a
//! notification, health, close), modeled as a tagged variant rather than
//! trait objects so the connection pool stays a plain map of one type.

pub mod sse;
pub mod stdio;
pub mod streamable;

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use sb_types::BrokerResult;
use std::sync::Arc;

pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable::StreamableTransport;

/// A live connection to one upstream server
#[derive(Clone)]
pub enum TransportHandle {
    Stdio(Arc<StdioTransport>),
    Sse(Arc<SseTransport>),
    Streamable(Arc<StreamableTransport>),
    #[cfg(any(test, feature = "test-util"))]
    Mock(Arc<crate::testing::MockTransport>),
}

impl TransportHandle {
    pub async fn send_request(&self, request: JsonRpcRequest) -> BrokerResult<JsonRpcResponse> {
        match self {
            TransportHandle::Stdio(t) => t.send_request(request).await,
            TransportHandle::Sse(t) => t.send_request(request).await,
            TransportHandle::Streamable(t) => t.send_request(request).await,
            #[cfg(any(test, feature = "test-util"))]
            TransportHandle::Mock(t) => t.send_request(request).await,
        }
    }

    pub async fn send_notification(
        &self,
        notification: JsonRpcNotification,
    ) -> BrokerResult<()> {
        match self {
            TransportHandle::Stdio(t) => t.send_notification(notification).await,
            TransportHandle::Sse(t) => t.send_notification(notification).await,
            TransportHandle::Streamable(t) => t.send_notification(notification).await,
            #[cfg(any(test, feature = "test-util"))]
            TransportHandle::Mock(_) => Ok(()),
        }
    }

    pub async fn is_healthy(&self) -> bool {
        match self {
            TransportHandle::Stdio(t) => t.is_alive(),
            TransportHandle::Sse(t) => t.is_healthy(),
            TransportHandle::Streamable(t) => t.is_healthy(),
            #[cfg(any(test, feature = "test-util"))]
            TransportHandle::Mock(_) => true,
        }
    }

    pub async fn close(&self) -> BrokerResult<()> {
        match self {
            TransportHandle::Stdio(t) => t.close().await,
            TransportHandle::Sse(t) => t.close().await,
            TransportHandle::Streamable(t) => t.close().await,
            #[cfg(any(test, feature = "test-util"))]
            TransportHandle::Mock(_) => Ok(()),
        }
    }

    /// Transport kind as a short string for logs
    pub fn kind(&self) -> &'static str {
        match self {
            TransportHandle::Stdio(_) => "stdio",
            TransportHandle::Sse(_) => "sse",
            TransportHandle::Streamable(_) => "streamable-http",
            #[cfg(any(test, feature = "test-util"))]
            TransportHandle::Mock(_) => "mock",
        }
    }
}
