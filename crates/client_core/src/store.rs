//! Observable state containers.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
};

use shared::protocol::Event;
use tokio::sync::watch;

type Listener<S> = Arc<dyn Fn(&Arc<S>) + Send + Sync>;

struct StoreInner<S> {
    current: watch::Sender<Arc<S>>,
    listeners: Mutex<BTreeMap<u64, Listener<S>>>,
    next_listener_id: AtomicU64,
    revision: AtomicU64,
}

/// Immutable-snapshot store. Every write publishes a fresh `Arc<S>`; readers
/// never observe a partially applied update.
///
/// Listeners run synchronously after each publish, in subscription order.
/// They must not write back into the same store.
pub struct Store<S> {
    inner: Arc<StoreInner<S>>,
}

impl<S> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: fmt::Debug + Send + Sync + 'static> fmt::Debug for Store<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("revision", &self.revision())
            .field("current", &*self.get())
            .finish()
    }
}

impl<S: Default + Send + Sync + 'static> Default for Store<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S: Send + Sync + 'static> Store<S> {
    pub fn new(initial: S) -> Self {
        let (current, _) = watch::channel(Arc::new(initial));
        Self {
            inner: Arc::new(StoreInner {
                current,
                listeners: Mutex::new(BTreeMap::new()),
                next_listener_id: AtomicU64::new(0),
                revision: AtomicU64::new(0),
            }),
        }
    }

    pub fn get(&self) -> Arc<S> {
        Arc::clone(&self.inner.current.borrow())
    }

    /// Number of publishes since construction.
    pub fn revision(&self) -> u64 {
        self.inner.revision.load(Ordering::Acquire)
    }

    /// Async view of the store for consumers that prefer awaiting changes
    /// over registering a listener.
    pub fn watch(&self) -> watch::Receiver<Arc<S>> {
        self.inner.current.subscribe()
    }

    pub fn replace(&self, next: S) {
        self.replace_shared(Arc::new(next));
    }

    pub fn replace_shared(&self, next: Arc<S>) {
        self.swap_shared(next);
        self.after_publish();
    }

    /// Replaces the value without running listeners. Callers follow up with
    /// [`Self::after_publish`] once their own locks are released.
    pub(crate) fn swap_shared(&self, next: Arc<S>) {
        self.inner.current.send_replace(next);
    }

    /// Applies a pure `S -> S` updater against the latest value. On error the
    /// store is left untouched and nothing is published.
    pub fn update_with<E>(&self, updater: impl FnOnce(&S) -> Result<S, E>) -> Result<(), E> {
        let mut outcome = Ok(());
        let published = self.inner.current.send_if_modified(|current| match updater(&**current) {
            Ok(next) => {
                *current = Arc::new(next);
                true
            }
            Err(err) => {
                outcome = Err(err);
                false
            }
        });
        if published {
            self.after_publish();
        }
        outcome
    }

    pub(crate) fn after_publish(&self) {
        self.inner.revision.fetch_add(1, Ordering::AcqRel);
        let snapshot = self.get();
        let listeners: Vec<Listener<S>> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(&snapshot);
        }
    }

    /// Registers `listener` for every future publish. Dropping the returned
    /// [`Subscription`] unsubscribes.
    pub fn subscribe(&self, listener: impl Fn(&Arc<S>) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(listener));

        let inner: Weak<StoreInner<S>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner
                    .listeners
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
            }
        })
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<S: Clone + Send + Sync + 'static> Store<S> {
    /// Copy-on-write mutation; always publishes.
    pub fn modify<R>(&self, mutate: impl FnOnce(&mut S) -> R) -> R {
        let mut result = None;
        self.inner.current.send_modify(|current| {
            result = Some(mutate(Arc::make_mut(current)));
        });
        self.after_publish();
        match result {
            Some(result) => result,
            None => unreachable!("send_modify always runs its closure"),
        }
    }
}

/// Guard returned by `subscribe` calls. Unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(on_drop: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            on_drop: Some(Box::new(on_drop)),
        }
    }

    pub fn unsubscribe(self) {}
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.on_drop.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

/// Per-machine-instance state. `state` and `live_values` stay `None` until
/// their first event; `None` is not the same as a zeroed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct NamespaceStore<S, L> {
    pub state: Option<Event<S>>,
    /// First `state` ever received. Never overwritten.
    pub default_state: Option<Event<S>>,
    pub live_values: Option<Event<L>>,
    /// Incremented for every accepted state event, identical payloads included.
    pub state_revision: u64,
}

impl<S, L> Default for NamespaceStore<S, L> {
    fn default() -> Self {
        Self {
            state: None,
            default_state: None,
            live_values: None,
            state_revision: 0,
        }
    }
}

impl<S: Clone, L: Clone> NamespaceStore<S, L> {
    pub fn with_state(&self, event: Event<S>) -> Self {
        Self {
            default_state: self
                .default_state
                .clone()
                .or_else(|| Some(event.clone())),
            state: Some(event),
            live_values: self.live_values.clone(),
            state_revision: self.state_revision + 1,
        }
    }

    pub fn with_live_values(&self, event: Event<L>) -> Self {
        Self {
            live_values: Some(event),
            ..self.clone()
        }
    }

    pub fn state_data(&self) -> Option<&S> {
        self.state.as_ref().map(|event| &event.data)
    }

    pub fn default_state_data(&self) -> Option<&S> {
        self.default_state.as_ref().map(|event| &event.data)
    }

    pub fn live_values_data(&self) -> Option<&L> {
        self.live_values.as_ref().map(|event| &event.data)
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
