//! Process-wide set of namespace stores, owned by the composition root.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use shared::{domain::NamespaceId, protocol::GenericEvent};
use tracing::info;

use crate::{
    error::RegistryError,
    ingestion::{ingest, Ingested, MachineNamespace, MachineStore},
    store::{Store, Subscription},
    throttle::{ThrottleOptions, ThrottledStoreUpdater},
    transport::{EventHandler, EventTransport},
};

/// Store and updater of one machine instance.
pub struct NamespaceSlot<N: MachineNamespace> {
    id: NamespaceId,
    store: Store<MachineStore<N>>,
    updater: ThrottledStoreUpdater<MachineStore<N>>,
}

impl<N: MachineNamespace> NamespaceSlot<N> {
    fn new(id: NamespaceId, options: ThrottleOptions) -> Self {
        let store = Store::default();
        let updater = ThrottledStoreUpdater::new(store.clone(), options);
        Self { id, store, updater }
    }

    fn handle_event(&self, event: GenericEvent) -> Ingested {
        ingest::<N>(&self.id, &self.updater, event)
    }
}

struct RegistryEntry {
    kind: &'static str,
    refs: usize,
    slot: Arc<dyn Any + Send + Sync>,
    _subscription: Subscription,
}

pub struct NamespaceRegistry {
    transport: Arc<dyn EventTransport>,
    throttle: ThrottleOptions,
    entries: Mutex<HashMap<NamespaceId, RegistryEntry>>,
}

impl NamespaceRegistry {
    pub fn new(transport: Arc<dyn EventTransport>, throttle: ThrottleOptions) -> Arc<Self> {
        Arc::new(Self {
            transport,
            throttle,
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<NamespaceId, RegistryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the store for `id`, creating it and its transport subscription
    /// on first use. Every caller asking for the same id shares one store.
    pub fn get_or_create<N: MachineNamespace>(
        self: &Arc<Self>,
        id: NamespaceId,
    ) -> Result<NamespaceHandle<N>, RegistryError> {
        let mut entries = self.entries();

        if let Some(entry) = entries.get_mut(&id) {
            let slot = Arc::clone(&entry.slot)
                .downcast::<NamespaceSlot<N>>()
                .map_err(|_| RegistryError::KindMismatch {
                    namespace: id,
                    registered: entry.kind,
                    requested: N::KIND,
                })?;
            entry.refs += 1;
            return Ok(NamespaceHandle {
                slot,
                registry: Arc::downgrade(self),
            });
        }

        let slot = Arc::new(NamespaceSlot::<N>::new(id, self.throttle));
        let handler_slot = Arc::clone(&slot);
        let handler: EventHandler = Arc::new(move |event| {
            handler_slot.handle_event(event);
        });
        let subscription = self.transport.subscribe(&id, handler);
        info!(kind = N::KIND, namespace = %id, "namespace store created");

        entries.insert(
            id,
            RegistryEntry {
                kind: N::KIND,
                refs: 1,
                slot: slot.clone(),
                _subscription: subscription,
            },
        );
        Ok(NamespaceHandle {
            slot,
            registry: Arc::downgrade(self),
        })
    }

    fn retain(&self, id: &NamespaceId) {
        if let Some(entry) = self.entries().get_mut(id) {
            entry.refs += 1;
        }
    }

    fn release(&self, id: &NamespaceId) {
        let removed = {
            let mut entries = self.entries();
            match entries.get_mut(id) {
                Some(entry) if entry.refs > 1 => {
                    entry.refs -= 1;
                    None
                }
                Some(_) => entries.remove(id),
                None => None,
            }
        };
        if let Some(entry) = removed {
            info!(kind = entry.kind, namespace = %id, "namespace store released");
            drop(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn contains(&self, id: &NamespaceId) -> bool {
        self.entries().contains_key(id)
    }

    /// Registered namespaces with their machine kind and consumer count.
    pub fn active_namespaces(&self) -> Vec<(NamespaceId, &'static str, usize)> {
        let mut active: Vec<_> = self
            .entries()
            .iter()
            .map(|(id, entry)| (*id, entry.kind, entry.refs))
            .collect();
        active.sort_by_key(|(id, _, _)| id.path());
        active
    }
}

/// A consumer's reference to one namespace store. Clones share the store;
/// when the last handle is dropped the store and its transport subscription
/// are released.
pub struct NamespaceHandle<N: MachineNamespace> {
    slot: Arc<NamespaceSlot<N>>,
    registry: Weak<NamespaceRegistry>,
}

impl<N: MachineNamespace> NamespaceHandle<N> {
    pub fn id(&self) -> NamespaceId {
        self.slot.id
    }

    pub fn store(&self) -> &Store<MachineStore<N>> {
        &self.slot.store
    }

    pub fn snapshot(&self) -> Arc<MachineStore<N>> {
        self.slot.store.get()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&Arc<MachineStore<N>>) + Send + Sync + 'static,
    ) -> Subscription {
        self.slot.store.subscribe(listener)
    }

    /// Feeds an event through the same path the transport uses.
    pub fn ingest(&self, event: GenericEvent) -> Ingested {
        self.slot.handle_event(event)
    }

    /// Publishes any update still held back by the throttle window.
    pub fn flush(&self) {
        self.slot.updater.flush();
    }

    pub fn same_store(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl<N: MachineNamespace> Clone for NamespaceHandle<N> {
    fn clone(&self) -> Self {
        if let Some(registry) = self.registry.upgrade() {
            registry.retain(&self.slot.id);
        }
        Self {
            slot: Arc::clone(&self.slot),
            registry: Weak::clone(&self.registry),
        }
    }
}

impl<N: MachineNamespace> Drop for NamespaceHandle<N> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.release(&self.slot.id);
        }
    }
}

impl<N: MachineNamespace> fmt::Debug for NamespaceHandle<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceHandle")
            .field("kind", &N::KIND)
            .field("namespace", &self.slot.id)
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
