//! SSE framing helpers for the streaming turn endpoint.

use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::response::sse::Event;
use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Builds one canonical `event:`/`data:` frame with a JSON payload.
pub fn frame(event_type: &str, payload: &Value) -> Event {
    let data = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event_type).data(data)
}

/// Bridges the turn task's event channel into the HTTP response. Dropping the
/// stream — the client disconnected — cancels the turn token, so streaming
/// stops promptly while finalization still completes on the storage side.
pub struct TurnEventStream {
    inner: ReceiverStream<Event>,
    cancel: CancellationToken,
}

impl TurnEventStream {
    pub fn new(receiver: mpsc::Receiver<Event>, cancel: CancellationToken) -> Self {
        Self {
            inner: ReceiverStream::new(receiver),
            cancel,
        }
    }
}

impl Stream for TurnEventStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_next(cx)
            .map(|item| item.map(Ok))
    }
}

impl Drop for TurnEventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
