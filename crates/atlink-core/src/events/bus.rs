//! Event bus implementation

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use super::Arg;
use crate::protocol::AtError;

/// Listener callback. Runs on the publishing task, so it must not block.
pub type Callback = Arc<dyn Fn(&[Arg]) + Send + Sync>;

/// Handle identifying one registration on an [`EventBus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Listener {
    id: SubscriptionId,
    name: String,
    once: bool,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<Listener>,
}

/// Publish/subscribe registry keyed by event name.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // Callbacks never run under the lock, so a poisoned registry is still consistent
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, name: &str, once: bool, callback: Callback) -> SubscriptionId {
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry.listeners.push(Listener {
            id,
            name: name.to_string(),
            once,
            callback,
        });
        id
    }

    /// Register a listener invoked on every publication of `name`
    pub fn subscribe<F>(&self, name: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&[Arg]) + Send + Sync + 'static,
    {
        self.register(name, false, Arc::new(callback))
    }

    /// Register a listener removed after its first invocation
    pub fn once<F>(&self, name: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&[Arg]) + Send + Sync + 'static,
    {
        self.register(name, true, Arc::new(callback))
    }

    /// Remove a registration. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.lock();
        let before = registry.listeners.len();
        registry.listeners.retain(|l| l.id != id);
        registry.listeners.len() != before
    }

    fn unsubscribe_all(&self, ids: &[SubscriptionId]) {
        if ids.is_empty() {
            return;
        }
        self.lock().listeners.retain(|l| !ids.contains(&l.id));
    }

    /// Invoke every listener registered under `name`, in registration order.
    ///
    /// One-shot listeners are removed before any callback runs. Callbacks are invoked after the
    /// registry lock is released, so they may subscribe or unsubscribe. A panic in one callback
    /// is logged and the remaining callbacks still run. Returns the number of listeners invoked.
    pub fn publish(&self, name: &str, args: &[Arg]) -> usize {
        let fired: Vec<Callback> = {
            let mut registry = self.lock();
            let mut fired = Vec::new();
            registry.listeners.retain(|l| {
                if l.name != name {
                    return true;
                }
                fired.push(l.callback.clone());
                !l.once
            });
            fired
        };

        tracing::trace!(event = name, ?args, listeners = fired.len(), "publish");
        for callback in &fired {
            // A panicking listener must not take the publisher down with it
            if panic::catch_unwind(AssertUnwindSafe(|| callback(args))).is_err() {
                tracing::warn!(event = name, "listener panicked");
            }
        }
        fired.len()
    }

    /// Register a one-shot waiter for `name` now, to be awaited later.
    ///
    /// Create the waiter before sending the command that triggers the event; an event published
    /// between registration and [`Waiter::wait`] is kept.
    pub fn waiter(&self, name: &str) -> Waiter {
        self.race(&[name])
    }

    /// Register a waiter that resolves with whichever of `names` is published first
    pub fn race(&self, names: &[&str]) -> Waiter {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let ids = names
            .iter()
            .map(|name| {
                let slot = slot.clone();
                let owned = name.to_string();
                self.once(name, move |args: &[Arg]| {
                    let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                    if let Some(tx) = sender {
                        let _ = tx.send((owned.clone(), args.to_vec()));
                    }
                })
            })
            .collect();

        Waiter {
            bus: self.clone(),
            ids,
            rx,
        }
    }

    /// Wait for one publication of `name`.
    ///
    /// Registers at call time, so only publications after this call are seen. Use
    /// [`EventBus::waiter`] when the event is triggered by a command sent beforehand.
    pub async fn wait_for(&self, name: &str, timeout: Duration) -> Result<Vec<Arg>, AtError> {
        self.waiter(name).wait(timeout).await
    }

    /// Open a subscription group torn down as a whole when dropped
    pub fn scope(&self) -> Scope {
        Scope {
            bus: self.clone(),
            ids: Vec::new(),
        }
    }

    /// Number of live registrations
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Number of live registrations under `name`
    pub fn listener_count_for(&self, name: &str) -> usize {
        self.lock()
            .listeners
            .iter()
            .filter(|l| l.name == name)
            .count()
    }
}

/// A pending one-shot wait registered on an [`EventBus`].
///
/// Dropping the waiter removes its registrations.
pub struct Waiter {
    bus: EventBus,
    ids: Vec<SubscriptionId>,
    rx: oneshot::Receiver<(String, Vec<Arg>)>,
}

impl Waiter {
    /// Wait for the event's arguments
    pub async fn wait(self, timeout: Duration) -> Result<Vec<Arg>, AtError> {
        self.wait_named(timeout).await.map(|(_, args)| args)
    }

    /// Wait for the event, returning which name fired along with its arguments
    pub async fn wait_named(mut self, timeout: Duration) -> Result<(String, Vec<Arg>), AtError> {
        let result = tokio::time::timeout(timeout, &mut self.rx).await;
        self.cancel();

        match result {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(AtError::Timeout("subscription removed before the event fired")),
            Err(_) => Err(AtError::Timeout("no matching event")),
        }
    }

    fn cancel(&mut self) {
        let ids = std::mem::take(&mut self.ids);
        self.bus.unsubscribe_all(&ids);
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A group of subscriptions removed together when the scope is dropped
pub struct Scope {
    bus: EventBus,
    ids: Vec<SubscriptionId>,
}

impl Scope {
    /// [`EventBus::subscribe`] tied to this scope
    pub fn subscribe<F>(&mut self, name: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&[Arg]) + Send + Sync + 'static,
    {
        let id = self.bus.subscribe(name, callback);
        self.ids.push(id);
        id
    }

    /// [`EventBus::once`] tied to this scope
    pub fn once<F>(&mut self, name: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&[Arg]) + Send + Sync + 'static,
    {
        let id = self.bus.once(name, callback);
        self.ids.push(id);
        id
    }

    /// A waiter that is also torn down with this scope
    pub fn waiter(&mut self, name: &str) -> Waiter {
        self.race(&[name])
    }

    /// [`EventBus::race`] tied to this scope
    pub fn race(&mut self, names: &[&str]) -> Waiter {
        let waiter = self.bus.race(names);
        self.ids.extend_from_slice(&waiter.ids);
        waiter
    }

    /// Number of registrations created through this scope
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True if nothing was registered through this scope
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Tear the scope down now
    pub fn close(self) {}
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.bus.unsubscribe_all(&self.ids);
    }
}
