//! Fan-out of status transitions to observers.
//!
//! Events are queued on an unbounded channel so that publishing never blocks
//! the supervisor, and a single dispatcher thread drains the queue in FIFO
//! order. Observers therefore see the transitions of one service in the order
//! they were published, and callbacks never run under a supervisor lock.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error, warn};

use crate::error::SupervisorError;
use crate::lock;
use crate::status::StatusEvent;

/// Receives status transitions. Must not block for long: it runs on the
/// shared dispatcher thread.
pub trait StatusObserver: Send + Sync {
    fn on_status_changed(&self, event: &StatusEvent);
}

impl<F> StatusObserver for F
where
    F: Fn(&StatusEvent) + Send + Sync,
{
    fn on_status_changed(&self, event: &StatusEvent) {
        self(event)
    }
}

/// Token returned on registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Channel-backed registration, for pollers that prefer a receiver.
pub struct Subscription {
    pub id: ObserverId,
    pub events: Receiver<StatusEvent>,
}

enum Scope {
    Service(String),
    All,
}

struct Entry {
    id: ObserverId,
    scope: Scope,
    observer: Arc<dyn StatusObserver>,
}

#[derive(Default)]
struct Registry {
    entries: Vec<Entry>,
}

impl Registry {
    fn matching(&self, service: &str) -> Vec<Arc<dyn StatusObserver>> {
        self.entries
            .iter()
            .filter(|e| match &e.scope {
                Scope::Service(name) => name == service,
                Scope::All => true,
            })
            .map(|e| Arc::clone(&e.observer))
            .collect()
    }
}

pub struct StatusBus {
    tx: Sender<StatusEvent>,
    registry: Arc<Mutex<Registry>>,
    next_id: AtomicU64,
}

impl StatusBus {
    /// Create the bus and start its dispatcher thread. The dispatcher exits
    /// once the bus is dropped and the queue is drained.
    pub fn new() -> Result<Self, SupervisorError> {
        let (tx, rx) = unbounded::<StatusEvent>();
        let registry = Arc::new(Mutex::new(Registry::default()));
        let dispatch_registry = Arc::clone(&registry);

        thread::Builder::new()
            .name("status-bus".into())
            .spawn(move || dispatch(rx, dispatch_registry))
            .map_err(SupervisorError::Bus)?;

        Ok(Self {
            tx,
            registry,
            next_id: AtomicU64::new(1),
        })
    }

    /// Register an observer for one service.
    pub fn register<O>(&self, service: &str, observer: O) -> ObserverId
    where
        O: StatusObserver + 'static,
    {
        self.insert(Scope::Service(service.to_string()), Arc::new(observer))
    }

    /// Register an observer for every service.
    pub fn register_all<O>(&self, observer: O) -> ObserverId
    where
        O: StatusObserver + 'static,
    {
        self.insert(Scope::All, Arc::new(observer))
    }

    /// Returns false if the id was not registered.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut registry = lock(&self.registry);
        let before = registry.entries.len();
        registry.entries.retain(|e| e.id != id);
        registry.entries.len() != before
    }

    pub fn subscribe(&self, service: &str) -> Subscription {
        let (tx, events) = unbounded();
        let id = self.register(service, move |event: &StatusEvent| {
            tx.send(event.clone()).ok();
        });
        Subscription { id, events }
    }

    pub fn subscribe_all(&self) -> Subscription {
        let (tx, events) = unbounded();
        let id = self.register_all(move |event: &StatusEvent| {
            tx.send(event.clone()).ok();
        });
        Subscription { id, events }
    }

    /// Number of observers that would receive an event for `service`.
    pub fn observer_count(&self, service: &str) -> usize {
        lock(&self.registry).matching(service).len()
    }

    /// Queue an event for delivery. Never blocks.
    pub fn publish(&self, event: StatusEvent) {
        if let Err(e) = self.tx.send(event) {
            warn!("status bus dispatcher gone, dropping {}", e.0);
        }
    }

    fn insert(&self, scope: Scope, observer: Arc<dyn StatusObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.registry).entries.push(Entry { id, scope, observer });
        id
    }
}

fn dispatch(rx: Receiver<StatusEvent>, registry: Arc<Mutex<Registry>>) {
    for event in rx.iter() {
        // snapshot so observers may (un)register from inside a callback
        let observers = lock(&registry).matching(&event.service);
        for observer in observers {
            let delivered =
                panic::catch_unwind(AssertUnwindSafe(|| observer.on_status_changed(&event)));
            if delivered.is_err() {
                error!("status observer panicked while handling '{event}'");
            }
        }
    }
    debug!("status bus dispatcher exiting");
}
