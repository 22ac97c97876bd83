use std::time::Duration;

use agent_hub_error::HubError;
use async_trait::async_trait;

use super::{DeltaSink, StopReason, Streamer, TurnContext};

const DEFAULT_CHUNK_SIZE: usize = 3;
const DEFAULT_DELAY: Duration = Duration::from_millis(20);
const MIN_DELAY: Duration = Duration::from_millis(10);
const MAX_DELAY: Duration = Duration::from_millis(50);

/// Deterministic streaming agent used as the universal test harness: echoes
/// the input back in fixed-size rune chunks with a bounded delay.
#[derive(Debug, Clone)]
pub struct FakeAgent {
    chunk_size: usize,
    delay: Duration,
}

impl FakeAgent {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            delay: DEFAULT_DELAY,
        }
    }

    pub fn with_config(chunk_size: usize, delay: Duration) -> Self {
        let chunk_size = if chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Self {
            chunk_size,
            delay: delay.clamp(MIN_DELAY, MAX_DELAY),
        }
    }
}

impl Default for FakeAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Streamer for FakeAgent {
    fn name(&self) -> &str {
        "fake"
    }

    async fn stream(
        &self,
        turn: &TurnContext,
        input: &str,
        sink: &dyn DeltaSink,
    ) -> Result<StopReason, HubError> {
        let runes: Vec<char> = input.chars().collect();
        if runes.is_empty() {
            if turn.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }
            sink.delta("").await?;
            return Ok(StopReason::EndTurn);
        }

        for chunk in runes.chunks(self.chunk_size) {
            tokio::select! {
                _ = turn.cancelled() => return Ok(StopReason::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
            if turn.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }
            sink.delta(&chunk.iter().collect::<String>()).await?;
        }

        Ok(StopReason::EndTurn)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio_util::sync::CancellationToken;

    use super::*;

    #[derive(Default)]
    struct CollectSink {
        chunks: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeltaSink for CollectSink {
        async fn delta(&self, chunk: &str) -> Result<(), HubError> {
            self.chunks.lock().expect("sink lock").push(chunk.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn streams_input_in_rune_chunks() {
        let agent = FakeAgent::with_config(3, Duration::from_millis(10));
        let sink = CollectSink::default();
        let turn = TurnContext::default();

        let stop = agent
            .stream(&turn, "hello streaming world", &sink)
            .await
            .expect("stream");

        assert_eq!(stop, StopReason::EndTurn);
        let chunks = sink.chunks.lock().expect("sink lock");
        assert!(chunks.len() >= 3);
        assert_eq!(chunks.join(""), "hello streaming world");
    }

    #[tokio::test]
    async fn cancellation_stops_the_stream() {
        let agent = FakeAgent::with_config(1, Duration::from_millis(20));
        let sink = CollectSink::default();
        let cancel = CancellationToken::new();
        let turn = TurnContext::new(cancel.clone());
        cancel.cancel();

        let stop = agent
            .stream(&turn, "never emitted", &sink)
            .await
            .expect("stream");

        assert_eq!(stop, StopReason::Cancelled);
        assert!(sink.chunks.lock().expect("sink lock").is_empty());
    }

    #[tokio::test]
    async fn empty_input_emits_single_empty_delta() {
        let agent = FakeAgent::new();
        let sink = CollectSink::default();

        let stop = agent
            .stream(&TurnContext::default(), "", &sink)
            .await
            .expect("stream");

        assert_eq!(stop, StopReason::EndTurn);
        assert_eq!(*sink.chunks.lock().expect("sink lock"), vec![String::new()]);
    }
}
