use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

struct PendingKill {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Forceful kills waiting out their grace period, keyed by backend id.
///
/// A kill can be cancelled until it fires. Scheduling a second kill for the
/// same id replaces (and aborts) the first one. Each timer carries a
/// generation so a finished timer never unregisters a newer one.
#[derive(Default)]
pub struct DeferredKills {
    pending: Arc<Mutex<HashMap<String, PendingKill>>>,
    next_generation: AtomicU64,
}

impl DeferredKills {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn schedule<F>(&self, backend_id: &str, delay: Duration, kill: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::clone(&self.pending);
        let id = backend_id.to_string();

        // Keep the map locked until the handle is stored so the timer can't
        // try to unregister itself before it is registered.
        let mut pending = self.pending.lock().await;
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            kill.await;
            let mut pending = registry.lock().await;
            if pending.get(&id).map(|p| p.generation) == Some(generation) {
                pending.remove(&id);
            }
        });

        if let Some(previous) = pending.insert(
            backend_id.to_string(),
            PendingKill { generation, handle },
        ) {
            debug!(backend_id, "Replacing an earlier deferred kill");
            previous.handle.abort();
        }
    }

    /// Returns true if a kill was still waiting and has been called off.
    pub async fn cancel(&self, backend_id: &str) -> bool {
        match self.pending.lock().await.remove(backend_id) {
            Some(kill) => {
                kill.handle.abort();
                debug!(backend_id, "Deferred kill cancelled");
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let count = pending.len();
        for (_, kill) in pending.drain() {
            kill.handle.abort();
        }
        count
    }

    pub async fn is_pending(&self, backend_id: &str) -> bool {
        self.pending.lock().await.contains_key(backend_id)
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }
}
