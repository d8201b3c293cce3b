use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, Weak},
};

use crate::lock;

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: u64,
    handlers: BTreeMap<u64, Handler<E>>,
}

/// Fan-out point for one event type.
///
/// Handlers are keyed by a monotonically increasing subscription id, so
/// delivery order is subscription order. Emission snapshots the handler list
/// and runs handlers without holding the registry lock; a handler may
/// subscribe, dispose or emit again.
pub struct EventHub<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E: 'static> EventHub<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: BTreeMap::new(),
            })),
        }
    }

    pub fn subscribe(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.handlers.insert(id, Arc::new(handler));
            id
        };
        let registry: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription {
            id,
            remove: Some(Box::new(move |id| {
                if let Some(registry) = registry.upgrade() {
                    lock(&registry).handlers.remove(&id);
                }
            })),
        }
    }

    pub fn emit(&self, event: &E) {
        self.emit_while(event, || true);
    }

    /// Like [`EventHub::emit`], but checks `deliverable` before each handler
    /// and stops at the first `false`. Returns whether every handler ran.
    pub fn emit_while(&self, event: &E, deliverable: impl Fn() -> bool) -> bool {
        let handlers: Vec<Handler<E>> = lock(&self.registry).handlers.values().cloned().collect();
        for handler in handlers {
            if !deliverable() {
                return false;
            }
            handler(event);
        }
        true
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).handlers.len()
    }
}

impl<E: 'static> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`EventHub::subscribe`]. Delivery stops on
/// [`Subscription::dispose`] or when the handle is dropped.
#[must_use = "dropping a subscription disposes it immediately"]
pub struct Subscription {
    id: u64,
    remove: Option<Box<dyn FnOnce(u64) + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
#[path = "tests/subscription_tests.rs"]
mod tests;
