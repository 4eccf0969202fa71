//! In-flight computation registry
//!
//! At most one computation runs per key. A request for a key that is
//! already being computed attaches to the running computation and receives
//! its result. A superseding request cancels the running computation's
//! token and registers a new one in its place; the superseded computation
//! keeps whatever side effects it already applied.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

struct Entry<V> {
    id: u64,
    token: CancellationToken,
    future: Shared<BoxFuture<'static, V>>,
}

/// Per-key registry of running computations
pub struct InFlight<K, V>
where
    V: Clone,
{
    next_id: AtomicU64,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> Default for InFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> InFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Join the running computation for `key`, or start one
    ///
    /// # Arguments
    /// * `key` - Computation key
    /// * `supersede` - Cancel a running computation and start a new one
    /// * `make` - Builds the computation from its cancellation token
    ///
    /// # Returns
    /// The result of whichever computation this call attached to
    pub async fn run<F, Fut>(&self, key: K, supersede: bool, make: F) -> V
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (id, future) = self.attach(key.clone(), supersede, make);
        let result = future.await;
        self.finish(&key, id);
        result
    }

    /// Whether a computation for `key` is registered and unfinished
    pub fn is_running(&self, key: &K) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .is_some_and(|entry| entry.future.peek().is_none())
    }

    /// Number of registered computations
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn attach<F, Fut>(&self, key: K, supersede: bool, make: F) -> (u64, Shared<BoxFuture<'static, V>>)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(entry) = entries.get(&key) {
            let finished = entry.future.peek().is_some();
            if !supersede && !finished {
                return (entry.id, entry.future.clone());
            }
            if supersede && !finished {
                entry.token.cancel();
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let future = make(token.clone()).boxed().shared();
        entries.insert(
            key,
            Entry {
                id,
                token,
                future: future.clone(),
            },
        );
        (id, future)
    }

    /// Drop the entry if it still belongs to computation `id`
    fn finish(&self, key: &K, id: u64) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.get(key).is_some_and(|entry| entry.id == id) {
            entries.remove(key);
        }
    }
}
