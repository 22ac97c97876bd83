//! Agent provider capability: anything that can stream one turn of output.

use std::sync::Arc;

use agent_hub_error::HubError;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

pub mod acp_stdio;
pub mod embedded;
pub mod fake;

/// Terminal classification of one streamed turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    Cancelled,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Client decision for one provider-originated permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    Approved,
    Declined,
    Cancelled,
}

impl PermissionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Declined => "declined",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "approved" => Some(Self::Approved),
            "declined" => Some(Self::Declined),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// One provider-originated permission request, surfaced to the owning client.
#[derive(Debug, Clone, Default)]
pub struct PermissionRequest {
    pub request_id: String,
    pub approval: String,
    pub command: String,
    pub raw_params: Map<String, Value>,
}

#[derive(Debug, Clone, Copy)]
pub struct PermissionResponse {
    pub outcome: PermissionOutcome,
}

/// Suspends a provider's permission request until the client decides.
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn request_permission(&self, request: PermissionRequest) -> PermissionResponse;
}

/// Per-turn context handed to providers: the cancellation token for this turn
/// plus the optional permission bridge installed by the pipeline.
#[derive(Clone, Default)]
pub struct TurnContext {
    cancel: CancellationToken,
    permission_handler: Option<Arc<dyn PermissionHandler>>,
}

impl TurnContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            permission_handler: None,
        }
    }

    pub fn with_permission_handler(mut self, handler: Arc<dyn PermissionHandler>) -> Self {
        self.permission_handler = Some(handler);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail-closed: with no bridge installed the request is declined.
    pub async fn request_permission(&self, request: PermissionRequest) -> PermissionResponse {
        match &self.permission_handler {
            Some(handler) => handler.request_permission(request).await,
            None => PermissionResponse {
                outcome: PermissionOutcome::Declined,
            },
        }
    }
}

/// Receives response deltas in causal order. A sink error must terminate the
/// stream promptly and be propagated by the provider.
#[async_trait]
pub trait DeltaSink: Send + Sync {
    async fn delta(&self, chunk: &str) -> Result<(), HubError>;
}

/// An agent provider able to stream one turn of output.
#[async_trait]
pub trait Streamer: Send + Sync {
    fn name(&self) -> &str;

    /// Streams one turn. Observed cancellation yields `Ok(Cancelled)`, never
    /// an error, even when the provider reports its own stop reason.
    async fn stream(
        &self,
        turn: &TurnContext,
        input: &str,
        sink: &dyn DeltaSink,
    ) -> Result<StopReason, HubError>;

    /// Optional teardown, invoked by the thread agent cache on reclaim and
    /// shutdown.
    async fn close(&self) {}
}
