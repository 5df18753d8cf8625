//! List-then-watch subscriptions that keep a [`Store`] current.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Store;
use crate::backend::{ObjectList, WatchEvent, WatchReceiver};
use crate::error::Result;
use crate::model::Resource;

/// Delay before relisting after a failed list or a closed watch.
const RELIST_DELAY: Duration = Duration::from_secs(1);

/// The list/watch contract an informer consumes.
#[async_trait]
pub trait ListWatch<T>: Send + Sync {
    /// Lists every object of the namespace with the version it reflects.
    async fn list(&self, namespace: &str) -> Result<ObjectList<T>>;

    /// Subscribes to changes in the namespace.
    fn watch(&self, namespace: &str) -> WatchReceiver<T>;
}

/// Callback invoked for every change applied to the store.
pub type EventHandler<T> = Arc<dyn Fn(&WatchEvent<T>) + Send + Sync>;

/// Observes whether an informer completed its initial list.
pub type SyncHandle = watch::Receiver<bool>;

/// Keeps one namespace of a [`Store`] in sync with the backend.
///
/// The informer subscribes before it lists, so no change between the list
/// and the first watch event is lost. Buffered events no newer than the
/// listing are discarded by the store's version check. A lagged or closed
/// watch falls back to a relist.
pub struct Informer<T: Resource> {
    namespace: String,
    source: Arc<dyn ListWatch<T>>,
    store: Store<T>,
    handlers: Vec<EventHandler<T>>,
    synced: watch::Sender<bool>,
}

impl<T: Resource> std::fmt::Debug for Informer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Informer")
            .field("kind", &T::KIND)
            .field("namespace", &self.namespace)
            .field("handlers", &self.handlers.len())
            .field("synced", &*self.synced.borrow())
            .finish_non_exhaustive()
    }
}

impl<T: Resource> Informer<T> {
    /// Creates an informer feeding `store` from `source` for one namespace.
    #[must_use]
    pub fn new(namespace: impl Into<String>, source: Arc<dyn ListWatch<T>>, store: Store<T>) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            namespace: namespace.into(),
            source,
            store,
            handlers: Vec::new(),
            synced,
        }
    }

    /// Registers a handler called for every applied change.
    pub fn add_handler(&mut self, handler: EventHandler<T>) {
        self.handlers.push(handler);
    }

    /// Returns the store this informer writes.
    #[must_use]
    pub fn store(&self) -> &Store<T> {
        &self.store
    }

    /// Returns a handle that turns true once the initial list is applied.
    #[must_use]
    pub fn sync_handle(&self) -> SyncHandle {
        self.synced.subscribe()
    }

    /// Runs the subscription until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(kind = T::KIND, namespace = %self.namespace, "starting informer");

        loop {
            let mut events = self.source.watch(&self.namespace);

            let listed = tokio::select! {
                () = shutdown.cancelled() => break,
                listed = self.source.list(&self.namespace) => listed,
            };
            match listed {
                Ok(listing) => {
                    let count = listing.items.len();
                    for change in self.store.replace(&self.namespace, listing) {
                        self.notify(&change);
                    }
                    self.synced.send_replace(true);
                    debug!(kind = T::KIND, namespace = %self.namespace, count, "listed objects");
                }
                Err(error) => {
                    warn!(kind = T::KIND, namespace = %self.namespace, %error, "list failed, retrying");
                    if !Self::pause(&shutdown).await {
                        break;
                    }
                    continue;
                }
            }

            loop {
                let received = tokio::select! {
                    () = shutdown.cancelled() => {
                        info!(kind = T::KIND, namespace = %self.namespace, "stopping informer");
                        return;
                    }
                    received = events.recv() => received,
                };
                match received {
                    Ok(event) => {
                        if self.store.apply(&event) {
                            self.notify(&event);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(kind = T::KIND, namespace = %self.namespace, skipped, "watch lagged, relisting");
                        break;
                    }
                    Err(RecvError::Closed) => {
                        warn!(kind = T::KIND, namespace = %self.namespace, "watch closed, relisting");
                        if !Self::pause(&shutdown).await {
                            return;
                        }
                        break;
                    }
                }
            }
        }

        info!(kind = T::KIND, namespace = %self.namespace, "stopping informer");
    }

    fn notify(&self, event: &WatchEvent<T>) {
        for handler in &self.handlers {
            handler(event);
        }
    }

    /// Sleeps for [`RELIST_DELAY`]. Returns false if shutdown fired first.
    async fn pause(shutdown: &CancellationToken) -> bool {
        tokio::select! {
            () = shutdown.cancelled() => false,
            () = tokio::time::sleep(RELIST_DELAY) => true,
        }
    }
}

/// Barrier that opens once every registered informer has synced.
#[derive(Debug, Clone, Default)]
pub struct ReadinessGate {
    handles: Vec<SyncHandle>,
}

impl ReadinessGate {
    /// Creates a gate with no informers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an informer's sync handle to the gate.
    pub fn register(&mut self, handle: SyncHandle) {
        self.handles.push(handle);
    }

    /// Returns true if every registered informer has synced.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.handles.iter().all(|handle| *handle.borrow())
    }

    /// Waits until every informer has synced.
    ///
    /// Returns false if `shutdown` fired first or an informer stopped before
    /// syncing.
    pub async fn wait_for_sync(&self, shutdown: &CancellationToken) -> bool {
        for handle in &self.handles {
            let mut handle = handle.clone();
            let synced = tokio::select! {
                () = shutdown.cancelled() => return false,
                synced = handle.wait_for(|synced| *synced) => synced.is_ok(),
            };
            if !synced {
                return false;
            }
        }
        true
    }
}
