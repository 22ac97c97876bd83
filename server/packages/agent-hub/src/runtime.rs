//! Active-turn bookkeeping: the single-active-turn-per-thread invariant and
//! the cancellation token registry.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TurnControllerError {
    #[error("active turn already exists for thread")]
    ActiveTurnExists,
    #[error("turn is not active")]
    TurnNotActive,
}

#[derive(Debug, Clone)]
struct ActiveTurn {
    thread_id: String,
    turn_id: String,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct ControllerState {
    by_thread: HashMap<String, ActiveTurn>,
    by_turn: HashMap<String, ActiveTurn>,
}

/// Tracks the one allowed running turn per thread and its cancel token.
#[derive(Debug, Default)]
pub struct TurnController {
    state: Mutex<ControllerState>,
}

impl TurnController {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a running turn; at most one per thread.
    pub fn activate(
        &self,
        thread_id: &str,
        turn_id: &str,
        cancel: CancellationToken,
    ) -> Result<(), TurnControllerError> {
        let mut state = self.lock();
        if state.by_thread.contains_key(thread_id) {
            return Err(TurnControllerError::ActiveTurnExists);
        }

        let entry = ActiveTurn {
            thread_id: thread_id.to_string(),
            turn_id: turn_id.to_string(),
            cancel,
        };
        state.by_thread.insert(thread_id.to_string(), entry.clone());
        state.by_turn.insert(turn_id.to_string(), entry);
        Ok(())
    }

    /// Removes the turn from both maps. A release whose thread does not match
    /// the registered entry is ignored (stale release guard).
    pub fn release(&self, thread_id: &str, turn_id: &str) {
        let mut state = self.lock();
        let Some(entry) = state.by_turn.get(turn_id) else {
            return;
        };
        if entry.thread_id != thread_id {
            return;
        }
        state.by_turn.remove(turn_id);
        state.by_thread.remove(thread_id);
    }

    /// Invokes the registered cancel token, outside the lock.
    pub fn cancel(&self, turn_id: &str) -> Result<(), TurnControllerError> {
        let entry = self
            .lock()
            .by_turn
            .get(turn_id)
            .cloned()
            .ok_or(TurnControllerError::TurnNotActive)?;
        entry.cancel.cancel();
        Ok(())
    }

    /// Cancels every active turn and returns how many tokens were invoked.
    /// Drainage is observed by callers via [`TurnController::wait_for_idle`].
    pub fn cancel_all(&self) -> usize {
        let entries: Vec<ActiveTurn> = self.lock().by_turn.values().cloned().collect();
        for entry in &entries {
            entry.cancel.cancel();
        }
        entries.len()
    }

    pub fn is_thread_active(&self, thread_id: &str) -> bool {
        self.lock().by_thread.contains_key(thread_id)
    }

    pub fn active_count(&self) -> usize {
        self.lock().by_turn.len()
    }

    /// Polls until no active turns remain; returns false on timeout.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval(IDLE_POLL_INTERVAL);
        loop {
            if self.active_count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            ticker.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_activation_on_same_thread_conflicts() {
        let controller = TurnController::new();
        controller
            .activate("th_1", "tu_1", CancellationToken::new())
            .expect("first activation");

        assert_eq!(
            controller.activate("th_1", "tu_2", CancellationToken::new()),
            Err(TurnControllerError::ActiveTurnExists)
        );
        assert!(controller.is_thread_active("th_1"));

        controller.release("th_1", "tu_1");
        assert!(!controller.is_thread_active("th_1"));
        controller
            .activate("th_1", "tu_2", CancellationToken::new())
            .expect("re-activation after release");
    }

    #[tokio::test]
    async fn stale_release_is_ignored() {
        let controller = TurnController::new();
        controller
            .activate("th_1", "tu_1", CancellationToken::new())
            .expect("activate");

        controller.release("th_other", "tu_1");
        assert_eq!(controller.active_count(), 1);

        controller.release("th_1", "tu_1");
        assert_eq!(controller.active_count(), 0);
    }

    #[tokio::test]
    async fn cancel_invokes_registered_token() {
        let controller = TurnController::new();
        let token = CancellationToken::new();
        controller
            .activate("th_1", "tu_1", token.clone())
            .expect("activate");

        controller.cancel("tu_1").expect("cancel");
        assert!(token.is_cancelled());

        assert_eq!(
            controller.cancel("tu_missing"),
            Err(TurnControllerError::TurnNotActive)
        );
    }

    #[tokio::test]
    async fn cancel_all_counts_and_wait_for_idle_observes_drain() {
        let controller = std::sync::Arc::new(TurnController::new());
        let first = CancellationToken::new();
        let second = CancellationToken::new();
        controller
            .activate("th_1", "tu_1", first.clone())
            .expect("activate first");
        controller
            .activate("th_2", "tu_2", second.clone())
            .expect("activate second");

        assert_eq!(controller.cancel_all(), 2);
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());

        assert!(!controller.wait_for_idle(Duration::from_millis(60)).await);

        let background = controller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            background.release("th_1", "tu_1");
            background.release("th_2", "tu_2");
        });
        assert!(controller.wait_for_idle(Duration::from_secs(1)).await);
    }
}
