//! Typed observer used by the breaker and the retry manager.
//!
//! Listeners are invoked synchronously, in registration order, from a snapshot
//! taken outside the lock, so a listener may subscribe or unsubscribe without
//! deadlocking. Async consumers can use [`Subject::stream`] instead.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_core::Stream;
use parking_lot::RwLock;
use tokio::sync::broadcast;

/// Type alias for boxed streams (stable Rust compatible)
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// Listener signature
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static LISTENER_ID: AtomicU64 = AtomicU64::new(1);

fn next_listener_id() -> ListenerId {
    ListenerId(LISTENER_ID.fetch_add(1, Ordering::Relaxed))
}

struct SubjectInner<E> {
    listeners: RwLock<Vec<(ListenerId, Listener<E>)>>,
    broadcaster: broadcast::Sender<E>,
}

/// Event subject with closure listeners and broadcast streams
pub struct Subject<E> {
    inner: Arc<SubjectInner<E>>,
}

impl<E> Clone for Subject<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Clone + Send + 'static> Default for Subject<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> Subject<E> {
    pub fn new() -> Self {
        let (broadcaster, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(SubjectInner {
                listeners: RwLock::new(Vec::new()),
                broadcaster,
            }),
        }
    }

    /// Register a listener. It stays registered until the returned handle is
    /// used to unsubscribe; dropping the handle does not remove it.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = next_listener_id();
        self.inner.listeners.write().push((id, Arc::new(listener)));

        let weak: Weak<SubjectInner<E>> = Arc::downgrade(&self.inner);
        Subscription {
            id,
            remove: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.listeners.write().retain(|(existing, _)| *existing != id);
                }
            })),
        }
    }

    /// Deliver an event to every listener and stream
    pub fn emit(&self, event: E) {
        let snapshot: Vec<Listener<E>> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in snapshot {
            listener(&event);
        }

        let _ = self.inner.broadcaster.send(event);
    }

    /// Events emitted after this call; lagged events are skipped
    pub fn stream(&self) -> BoxStream<E> {
        let receiver = self.inner.broadcaster.subscribe();
        use tokio_stream::{wrappers::BroadcastStream, StreamExt};
        let stream = BroadcastStream::new(receiver).filter_map(|result| result.ok());

        Box::pin(stream)
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }
}

/// Handle returned by [`Subject::subscribe`]
pub struct Subscription {
    id: ListenerId,
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener from its subject
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
