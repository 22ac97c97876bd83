//! Permission bridge: suspends a provider's request-permission call until the
//! owning client resolves it, with a fail-closed timeout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::agents::PermissionOutcome;

pub const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PermissionError {
    #[error("permission not found")]
    NotFound,
    #[error("permission already resolved")]
    AlreadyResolved,
}

#[derive(Debug)]
struct PendingPermission {
    client_id: String,
    outcome: watch::Sender<Option<PermissionOutcome>>,
}

impl PendingPermission {
    /// Commits the outcome exactly once.
    fn try_resolve(&self, outcome: PermissionOutcome) -> bool {
        self.outcome.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(outcome);
                true
            } else {
                false
            }
        })
    }
}

/// Handle held by the turn that raised the request.
pub struct PermissionTicket {
    pub permission_id: String,
    pending: Arc<PendingPermission>,
}

impl PermissionTicket {
    /// Immediate fail-closed resolution, used when the `permission_required`
    /// event cannot be delivered.
    pub fn resolve_declined(&self) {
        self.pending.try_resolve(PermissionOutcome::Declined);
    }
}

/// In-memory registry of pending permissions, keyed by the human-addressable
/// `permissionId`. The monotonic counter is process-wide and resets on
/// restart; ids never outlive their turn.
pub struct PermissionBroker {
    pending: Mutex<HashMap<String, Arc<PendingPermission>>>,
    seq: AtomicU64,
    timeout: Duration,
}

impl PermissionBroker {
    pub fn new(timeout: Duration) -> Self {
        let timeout = if timeout.is_zero() {
            DEFAULT_PERMISSION_TIMEOUT
        } else {
            timeout
        };
        Self {
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            timeout,
        }
    }

    /// Allocates a permission id and registers the pending entry under the
    /// owning client.
    pub async fn register(&self, request_id: &str, client_id: &str) -> PermissionTicket {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let sanitized = sanitize_id_component(request_id);
        let permission_id = if sanitized.is_empty() {
            format!("perm_{seq}")
        } else {
            format!("perm_{sanitized}_{seq}")
        };

        let (outcome, _) = watch::channel(None);
        let pending = Arc::new(PendingPermission {
            client_id: client_id.to_string(),
            outcome,
        });
        self.pending
            .lock()
            .await
            .insert(permission_id.clone(), pending.clone());

        PermissionTicket {
            permission_id,
            pending,
        }
    }

    /// Resolves from the HTTP decision endpoint. An unknown id and a foreign
    /// client are indistinguishable, so existence never leaks across tenants.
    pub async fn resolve(
        &self,
        permission_id: &str,
        client_id: &str,
        outcome: PermissionOutcome,
    ) -> Result<(), PermissionError> {
        let pending = self
            .pending
            .lock()
            .await
            .get(permission_id)
            .cloned()
            .ok_or(PermissionError::NotFound)?;
        if pending.client_id != client_id {
            return Err(PermissionError::NotFound);
        }
        if !pending.try_resolve(outcome) {
            return Err(PermissionError::AlreadyResolved);
        }
        Ok(())
    }

    pub async fn remove(&self, ticket: &PermissionTicket) {
        let mut pending = self.pending.lock().await;
        if let Some(current) = pending.get(&ticket.permission_id) {
            if Arc::ptr_eq(current, &ticket.pending) {
                pending.remove(&ticket.permission_id);
            }
        }
    }

    /// Blocks until the pending resolves. When the timer fires or the turn is
    /// cancelled first, declines if still unresolved and returns whatever was
    /// committed — a racing client decision wins.
    pub async fn wait(
        &self,
        ticket: &PermissionTicket,
        cancel: &CancellationToken,
    ) -> PermissionOutcome {
        let mut receiver = ticket.pending.outcome.subscribe();

        let committed = *receiver.borrow();
        if let Some(outcome) = committed {
            return outcome;
        }

        tokio::select! {
            _ = receiver.changed() => {}
            _ = tokio::time::sleep(self.timeout) => {
                ticket.pending.try_resolve(PermissionOutcome::Declined);
            }
            _ = cancel.cancelled() => {
                ticket.pending.try_resolve(PermissionOutcome::Declined);
            }
        }

        let outcome = *receiver.borrow();
        outcome.unwrap_or(PermissionOutcome::Declined)
    }
}

/// Alphanumerics survive, everything else collapses to `_`, trimmed at both
/// ends.
fn sanitize_id_component(raw: &str) -> String {
    let mapped: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    mapped.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_request_id_components() {
        assert_eq!(sanitize_id_component("req-42"), "req_42");
        assert_eq!(sanitize_id_component("  !!abc!!  "), "abc");
        assert_eq!(sanitize_id_component("***"), "");
    }

    #[tokio::test]
    async fn permission_ids_combine_request_id_and_sequence() {
        let broker = PermissionBroker::new(Duration::from_secs(1));
        let first = broker.register("req-1", "client-a").await;
        let second = broker.register("", "client-a").await;
        assert_eq!(first.permission_id, "perm_req_1_1");
        assert_eq!(second.permission_id, "perm_2");
    }

    #[tokio::test]
    async fn resolution_is_exactly_once_and_tenant_scoped() {
        let broker = PermissionBroker::new(Duration::from_secs(1));
        let ticket = broker.register("req", "client-a").await;

        assert_eq!(
            broker
                .resolve(&ticket.permission_id, "client-b", PermissionOutcome::Approved)
                .await,
            Err(PermissionError::NotFound)
        );
        broker
            .resolve(&ticket.permission_id, "client-a", PermissionOutcome::Approved)
            .await
            .expect("first resolution");
        assert_eq!(
            broker
                .resolve(&ticket.permission_id, "client-a", PermissionOutcome::Declined)
                .await,
            Err(PermissionError::AlreadyResolved)
        );

        let outcome = broker.wait(&ticket, &CancellationToken::new()).await;
        assert_eq!(outcome, PermissionOutcome::Approved);

        broker.remove(&ticket).await;
        assert_eq!(
            broker
                .resolve(&ticket.permission_id, "client-a", PermissionOutcome::Approved)
                .await,
            Err(PermissionError::NotFound)
        );
    }

    #[tokio::test]
    async fn timeout_fails_closed() {
        let broker = PermissionBroker::new(Duration::from_millis(50));
        let ticket = broker.register("req", "client-a").await;

        let outcome = broker.wait(&ticket, &CancellationToken::new()).await;
        assert_eq!(outcome, PermissionOutcome::Declined);
    }

    #[tokio::test]
    async fn turn_cancellation_fails_closed() {
        let broker = PermissionBroker::new(Duration::from_secs(30));
        let ticket = broker.register("req", "client-a").await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = broker.wait(&ticket, &cancel).await;
        assert_eq!(outcome, PermissionOutcome::Declined);
    }

    #[tokio::test]
    async fn client_decision_races_ahead_of_timeout() {
        let broker = Arc::new(PermissionBroker::new(Duration::from_millis(200)));
        let ticket = broker.register("req", "client-a").await;

        let resolver = broker.clone();
        let permission_id = ticket.permission_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = resolver
                .resolve(&permission_id, "client-a", PermissionOutcome::Approved)
                .await;
        });

        let outcome = broker.wait(&ticket, &CancellationToken::new()).await;
        assert_eq!(outcome, PermissionOutcome::Approved);
    }
}
