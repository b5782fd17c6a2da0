//! Change notification on top of [`Actor`].
//!
//! Observers live in a table keyed by a monotonically increasing id, owned
//! by the actor. [`ObservableActor::observe`] returns a [`Subscription`]
//! token that removes the entry again. Iterating the table in key order
//! gives registration order.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use padlink_exec::QueueExt;

use crate::actor::{Actor, ActorBuilder, ChangeHook};
use crate::middleware::lock;

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

struct ObserverTable<T> {
    next_id: AtomicU64,
    observers: Mutex<BTreeMap<u64, Observer<T>>>,
}

impl<T> ObserverTable<T> {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            observers: Mutex::new(BTreeMap::new()),
        }
    }

    fn insert(&self, observer: Observer<T>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.observers).insert(id, observer);
        id
    }

    /// Calls every observer registered at the time of the call. The table
    /// lock is not held while observers run, so an observer may subscribe
    /// or unsubscribe.
    fn notify(&self, state: &T) {
        let observers: Vec<Observer<T>> = lock(&self.observers).values().cloned().collect();
        for observer in observers {
            observer(state);
        }
    }

    fn len(&self) -> usize {
        lock(&self.observers).len()
    }
}

/// Type-erased removal so [`Subscription`] does not carry the state type.
trait Unsubscribe: Send + Sync {
    fn remove(&self, id: u64);
}

impl<T: 'static> Unsubscribe for ObserverTable<T> {
    fn remove(&self, id: u64) {
        lock(&self.observers).remove(&id);
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Token returned by [`ObservableActor::observe`].
///
/// Dropping it does not unsubscribe; call [`unsubscribe`](Self::unsubscribe).
#[derive(Clone)]
pub struct Subscription {
    id: u64,
    table: Weak<dyn Unsubscribe>,
}

impl Subscription {
    /// Removes the observer. Notifications already handed to the delivery
    /// queue but not yet run will skip it.
    ///
    /// Idempotent, and a no-op once the actor is gone.
    pub fn unsubscribe(&self) {
        if let Some(table) = self.table.upgrade() {
            table.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

// ---------------------------------------------------------------------------
// ObservableActor
// ---------------------------------------------------------------------------

/// An [`Actor`] that notifies observers when its state changes.
///
/// After each reducer run, if the new state differs from the old one, every
/// observer runs once on the delivery queue with the new state. A reducer
/// that returns an equal value triggers nothing.
pub struct ObservableActor<T, M> {
    actor: Actor<T, M>,
    observers: Arc<ObserverTable<T>>,
}

impl<T, M> Clone for ObservableActor<T, M> {
    fn clone(&self) -> Self {
        Self {
            actor: self.actor.clone(),
            observers: Arc::clone(&self.observers),
        }
    }
}

impl<T, M> std::fmt::Debug for ObservableActor<T, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservableActor")
            .field("actor", &self.actor)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl<T, M> ObservableActor<T, M>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    M: Send + 'static,
{
    /// Spawns an observable actor with no middleware.
    pub fn new<R>(initial: T, reducer: R) -> Self
    where
        R: Fn(&T, &M) -> T + Send + 'static,
    {
        Actor::builder(initial, reducer).spawn_observable()
    }

    /// Registers `observer`. It runs for every later state change, on the
    /// actor's delivery queue, after observers registered before it.
    pub fn observe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.observers.insert(Arc::new(observer));
        let table: Arc<dyn Unsubscribe> = self.observers.clone();
        Subscription {
            id,
            table: Arc::downgrade(&table),
        }
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// The plain actor handle.
    pub fn actor(&self) -> &Actor<T, M> {
        &self.actor
    }
}

impl<T, M> Deref for ObservableActor<T, M> {
    type Target = Actor<T, M>;

    fn deref(&self) -> &Actor<T, M> {
        &self.actor
    }
}

impl<T, M> ActorBuilder<T, M>
where
    T: Clone + PartialEq + Send + Sync + 'static,
    M: Send + 'static,
{
    /// Spawns the actor with change notification enabled.
    pub fn spawn_observable(mut self) -> ObservableActor<T, M> {
        let observers = Arc::new(ObserverTable::new());
        let delivery = self.delivery_queue();

        let table = Arc::clone(&observers);
        let on_change: ChangeHook<T> = Box::new(move |old: &T, new: &T| {
            if old == new {
                return;
            }
            let table = Arc::clone(&table);
            let state = new.clone();
            delivery.dispatch(move || table.notify(&state));
        });

        ObservableActor {
            actor: self.spawn_with_hook(Some(on_change)),
            observers,
        }
    }
}
