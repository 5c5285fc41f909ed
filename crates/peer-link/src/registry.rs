//! Keyed registry of live resources and the background tasks that drive them.
//!
//! Every operation takes the registry lock for its whole duration, so an
//! insert can never observe a half torn down entry and an entry is never
//! disposed twice.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// How long disposal waits for cancelled tasks before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// A resource that can be torn down.
#[async_trait]
pub trait Disconnecting: Send + Sync + 'static {
    async fn disconnect(&self);
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0} not found")]
    NotFound(String),
}

/// Background tasks sharing one cancellation token.
///
/// Each task is raced against the token, so cancelling unblocks it at
/// whatever it is awaiting. Dropping the group cancels it.
pub struct TaskGroup {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => trace!(target = "peer_link::registry", task = name, "cancelled"),
                _ = task => trace!(target = "peer_link::registry", task = name, "finished"),
            }
        }));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancels every task and waits for them to wind down.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        for mut handle in std::mem::take(&mut self.handles) {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!(target = "peer_link::registry", "task ignored cancellation; aborting");
                handle.abort();
            }
        }
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Disposable<E> {
    element: Arc<E>,
    tasks: TaskGroup,
}

impl<E: Disconnecting> Disposable<E> {
    async fn dispose(self) {
        self.tasks.shutdown().await;
        self.element.disconnect().await;
    }
}

pub struct Disposables<K, E> {
    entries: Mutex<HashMap<K, Disposable<E>>>,
}

impl<K, E> Default for Disposables<K, E> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, E> Disposables<K, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync,
    E: Disconnecting,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn assert_unique(&self, id: &K) -> Result<(), RegistryError> {
        if self.entries.lock().await.contains_key(id) {
            return Err(RegistryError::AlreadyExists(format!("{id:?}")));
        }
        Ok(())
    }

    /// Stores `element` with its tasks. If `id` is taken the tasks are cancelled.
    pub async fn insert(&self, id: K, element: Arc<E>, tasks: TaskGroup) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&id) {
            drop(entries);
            tasks.shutdown().await;
            return Err(RegistryError::AlreadyExists(format!("{id:?}")));
        }
        debug!(target = "peer_link::registry", id = ?id, tasks = tasks.len(), "registered");
        entries.insert(id, Disposable { element, tasks });
        Ok(())
    }

    pub async fn get(&self, id: &K) -> Result<Arc<E>, RegistryError> {
        self.entries
            .lock()
            .await
            .get(id)
            .map(|entry| Arc::clone(&entry.element))
            .ok_or_else(|| RegistryError::NotFound(format!("{id:?}")))
    }

    pub async fn contains(&self, id: &K) -> bool {
        self.entries.lock().await.contains_key(id)
    }

    pub async fn ids(&self) -> Vec<K> {
        self.entries.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Cancels the entry's tasks, disconnects it and removes it. No-op if absent.
    pub async fn dispose_one(&self, id: &K) {
        self.dispose_if(id, |_| true).await;
    }

    /// Like [`Disposables::dispose_one`], but only when `predicate` accepts the
    /// current element. Returns whether something was disposed.
    pub async fn dispose_if<P>(&self, id: &K, predicate: P) -> bool
    where
        P: FnOnce(&E) -> bool,
    {
        let mut entries = self.entries.lock().await;
        let matches = entries
            .get(id)
            .map(|entry| predicate(&entry.element))
            .unwrap_or(false);
        if !matches {
            return false;
        }
        if let Some(entry) = entries.remove(id) {
            debug!(target = "peer_link::registry", id = ?id, "disposing");
            entry.dispose().await;
        }
        true
    }

    pub async fn dispose_all(&self) {
        let mut entries = self.entries.lock().await;
        for (id, entry) in entries.drain() {
            debug!(target = "peer_link::registry", id = ?id, "disposing");
            entry.dispose().await;
        }
    }
}
