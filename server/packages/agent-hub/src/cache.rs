//! Per-thread agent provider cache: lazy instantiation through the configured
//! factory, idle-TTL reclamation by a background janitor, close-all on
//! shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agent_hub_error::HubError;
use agent_hub_storage::Thread;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agents::Streamer;
use crate::runtime::TurnController;

pub const DEFAULT_AGENT_IDLE_TTL: Duration = Duration::from_secs(300);

const MIN_JANITOR_INTERVAL: Duration = Duration::from_millis(500);

/// Builds a provider for one thread from its persisted metadata.
pub type AgentFactory =
    Arc<dyn Fn(Thread) -> BoxFuture<'static, Result<Arc<dyn Streamer>, HubError>> + Send + Sync>;

struct CachedAgent {
    provider: Arc<dyn Streamer>,
    last_used: Instant,
}

struct CacheInner {
    entries: Mutex<HashMap<String, CachedAgent>>,
    factory: AgentFactory,
    idle_ttl: Duration,
    controller: Arc<TurnController>,
    stop: CancellationToken,
}

pub struct ThreadAgentCache {
    inner: Arc<CacheInner>,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadAgentCache {
    pub fn new(
        factory: AgentFactory,
        idle_ttl: Duration,
        controller: Arc<TurnController>,
    ) -> Arc<Self> {
        let idle_ttl = if idle_ttl.is_zero() {
            DEFAULT_AGENT_IDLE_TTL
        } else {
            idle_ttl
        };
        let inner = Arc::new(CacheInner {
            entries: Mutex::new(HashMap::new()),
            factory,
            idle_ttl,
            controller,
            stop: CancellationToken::new(),
        });
        let janitor = tokio::spawn(janitor_loop(inner.clone()));
        Arc::new(Self {
            inner,
            janitor: Mutex::new(Some(janitor)),
        })
    }

    /// Returns the cached provider for the thread, building one through the
    /// factory on miss. A duplicate built by a concurrent caller is discarded
    /// and closed.
    pub async fn resolve(&self, thread: &Thread) -> Result<Arc<dyn Streamer>, HubError> {
        {
            let mut entries = self.inner.entries.lock().await;
            if let Some(entry) = entries.get_mut(&thread.thread_id) {
                entry.last_used = Instant::now();
                return Ok(entry.provider.clone());
            }
        }

        let provider = (self.inner.factory)(thread.clone()).await?;

        let mut entries = self.inner.entries.lock().await;
        if let Some(existing) = entries.get_mut(&thread.thread_id) {
            existing.last_used = Instant::now();
            let winner = existing.provider.clone();
            drop(entries);
            provider.close().await;
            return Ok(winner);
        }
        entries.insert(
            thread.thread_id.clone(),
            CachedAgent {
                provider: provider.clone(),
                last_used: Instant::now(),
            },
        );
        Ok(provider)
    }

    /// Stops the janitor and closes every cached provider.
    pub async fn shutdown(&self) {
        self.inner.stop.cancel();
        if let Some(handle) = self.janitor.lock().await.take() {
            let _ = handle.await;
        }

        let drained: Vec<(String, Arc<dyn Streamer>)> = {
            let mut entries = self.inner.entries.lock().await;
            entries
                .drain()
                .map(|(thread_id, entry)| (thread_id, entry.provider))
                .collect()
        };

        for (thread_id, provider) in drained {
            provider.close().await;
            tracing::info!(
                thread_id = %thread_id,
                agent = provider.name(),
                reason = "shutdown",
                "closed cached thread agent"
            );
        }
    }
}

async fn janitor_loop(inner: Arc<CacheInner>) {
    let interval = std::cmp::max(MIN_JANITOR_INTERVAL, inner.idle_ttl / 2);
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = inner.stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        reap_idle(&inner).await;
    }
}

async fn reap_idle(inner: &CacheInner) {
    let now = Instant::now();
    let mut reclaimed = Vec::new();
    {
        let mut entries = inner.entries.lock().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_used) >= inner.idle_ttl)
            .map(|(thread_id, _)| thread_id.clone())
            .collect();

        for thread_id in expired {
            if inner.controller.is_thread_active(&thread_id) {
                continue;
            }
            if let Some(entry) = entries.remove(&thread_id) {
                let idle_for = now.duration_since(entry.last_used);
                reclaimed.push((thread_id, entry.provider, idle_for));
            }
        }
    }

    for (thread_id, provider, idle_for) in reclaimed {
        provider.close().await;
        tracing::info!(
            thread_id = %thread_id,
            agent = provider.name(),
            idle_ms = idle_for.as_millis() as u64,
            "reclaimed idle thread agent"
        );
    }
}
