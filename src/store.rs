//! Single-writer state container with atomic batch application.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::model::Model;

/// Holds the current snapshot of a [`Model`] and applies mutations to it.
///
/// Readers get a consistent `Arc<M>` snapshot. Writers fold a batch of
/// mutations over a private copy and swap the result in only when every
/// mutation succeeds, so a partially applied batch is never observable.
/// Watchers (see [`watch`](StateStore::watch)) are notified after the swap.
///
/// Cloning a `StateStore` is cheap and yields a handle to the same state.
pub struct StateStore<M: Model> {
    inner: Arc<StoreInner<M>>,
}

struct StoreInner<M> {
    current: RwLock<Arc<M>>,
    // Serializes writers so two batches cannot fold over the same base.
    writer: Mutex<()>,
    version: AtomicU64,
    watch_tx: watch::Sender<Arc<M>>,
}

impl<M: Model> Clone for StateStore<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Model + fmt::Debug> fmt::Debug for StateStore<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore")
            .field("version", &self.version())
            .field("state", &self.snapshot())
            .finish()
    }
}

impl<M: Model> StateStore<M> {
    /// Create a store holding `initial` at version 0.
    pub fn new(initial: M) -> Self {
        let initial = Arc::new(initial);
        let (watch_tx, _) = watch::channel(Arc::clone(&initial));
        Self {
            inner: Arc::new(StoreInner {
                current: RwLock::new(initial),
                writer: Mutex::new(()),
                version: AtomicU64::new(0),
                watch_tx,
            }),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<M> {
        Arc::clone(&self.inner.current.read())
    }

    /// Evaluate a selector against the current snapshot.
    ///
    /// The selector runs on a snapshot taken before it is called, with no
    /// lock held, so it may itself read the store.
    pub fn read<T>(&self, selector: impl FnOnce(&M) -> T) -> T {
        let snapshot = self.snapshot();
        selector(&snapshot)
    }

    /// Number of successful, non-empty batches applied so far.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Apply a single mutation. See [`apply_all`](StateStore::apply_all).
    pub fn apply(&self, mutation: &M::Mutation) -> Result<u64, M::Error> {
        self.apply_all(std::slice::from_ref(mutation))
    }

    /// Apply a batch of mutations atomically.
    ///
    /// # Returns
    ///
    /// The new version. An empty batch changes nothing, notifies nobody
    /// and returns the current version.
    ///
    /// # Errors
    ///
    /// Returns the model's error for the first mutation that fails; the
    /// state is left exactly as it was before the call.
    pub fn apply_all(&self, mutations: &[M::Mutation]) -> Result<u64, M::Error> {
        if mutations.is_empty() {
            return Ok(self.version());
        }

        let _writer = self.inner.writer.lock();
        let base = self.snapshot();
        let mut next = M::clone(&base);
        for mutation in mutations {
            next = next.apply(mutation)?;
        }

        let next = Arc::new(next);
        *self.inner.current.write() = Arc::clone(&next);
        let version = self.inner.version.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.watch_tx.send_replace(next);

        tracing::trace!(version, mutations = mutations.len(), "state store advanced");
        Ok(version)
    }

    /// Subscribe to snapshot changes.
    ///
    /// The receiver starts at the current snapshot and is marked changed
    /// after every successful batch.
    pub fn watch(&self) -> watch::Receiver<Arc<M>> {
        self.inner.watch_tx.subscribe()
    }
}
