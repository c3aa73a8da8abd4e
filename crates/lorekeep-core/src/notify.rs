//! Change notification
//!
//! Two fan-out points:
//!
//! - [`ChangeNotifier`]: invoked by every mutating operation after its
//!   transaction commits. Listeners are fire-and-forget; an error or panic in
//!   one listener is logged and never reaches the mutation that triggered it.
//! - [`EventBus`]: outward notifications from the view engine
//!   (`generation-complete`, `contexts-updated`) for UI collaborators.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::models::{Collection, Entity, OpKind};

/// Event name emitted after a regeneration pass finishes
pub const GENERATION_COMPLETE: &str = "generation-complete";
/// Event name emitted when the set or content of artifacts changed
pub const CONTEXTS_UPDATED: &str = "contexts-updated";

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<E> = Box<dyn Fn(&E) -> anyhow::Result<()> + Send>;

/// Ordered listener set with isolated dispatch
struct Listeners<E> {
    next_id: u64,
    entries: Vec<(SubscriptionId, Callback<E>)>,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

impl<E> Listeners<E> {
    fn add(&mut self, callback: Callback<E>) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.entries.push((id, callback));
        id
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(existing, _)| *existing != id);
        self.entries.len() != before
    }

    /// Deliver to every listener, returning how many succeeded
    fn dispatch(&self, event: &E, label: &str) -> usize {
        let mut delivered = 0;
        for (id, callback) in &self.entries {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(subscription = id.0, event = label, error = %e, "Listener failed");
                }
                Err(_) => {
                    warn!(subscription = id.0, event = label, "Listener panicked");
                }
            }
        }
        delivered
    }
}

/// A committed entity mutation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub collection: Collection,
    pub op: OpKind,
    /// The entity after the mutation, or the removed entity for deletes
    pub entity: Entity,
    /// The entity before the mutation (updates and deletes)
    pub previous: Option<Entity>,
}

impl ChangeEvent {
    pub fn added(entity: Entity) -> Self {
        Self {
            collection: entity.collection(),
            op: OpKind::Add,
            entity,
            previous: None,
        }
    }

    pub fn updated(previous: Entity, entity: Entity) -> Self {
        Self {
            collection: entity.collection(),
            op: OpKind::Update,
            entity,
            previous: Some(previous),
        }
    }

    pub fn deleted(entity: Entity) -> Self {
        Self {
            collection: entity.collection(),
            op: OpKind::Delete,
            previous: Some(entity.clone()),
            entity,
        }
    }
}

/// Dispatches committed mutations to listeners
#[derive(Default)]
pub struct ChangeNotifier {
    listeners: Listeners<ChangeEvent>,
    channels: Vec<mpsc::Sender<ChangeEvent>>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for every committed mutation
    pub fn subscribe(
        &mut self,
        callback: impl Fn(&ChangeEvent) -> anyhow::Result<()> + Send + 'static,
    ) -> SubscriptionId {
        self.listeners.add(Box::new(callback))
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.listeners.remove(id)
    }

    /// Receive events through a channel instead of a callback
    ///
    /// The channel is dropped from the notifier once its receiver is gone.
    pub fn subscribe_channel(&mut self) -> mpsc::Receiver<ChangeEvent> {
        let (tx, rx) = mpsc::channel();
        self.channels.push(tx);
        rx
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.entries.len() + self.channels.len()
    }

    /// Deliver one event; never fails
    pub fn notify(&mut self, event: &ChangeEvent) {
        debug!(
            collection = %event.collection,
            id = %event.entity.id,
            op = %event.op,
            "Change notification"
        );
        self.channels.retain(|tx| tx.send(event.clone()).is_ok());
        self.listeners.dispatch(event, event.op.as_str());
    }
}

/// Outward notification from the view engine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewEvent {
    pub name: String,
    pub payload: Value,
}

/// Subscriber set for view notifications
#[derive(Default)]
pub struct EventBus {
    listeners: Listeners<ViewEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &mut self,
        callback: impl Fn(&ViewEvent) -> anyhow::Result<()> + Send + 'static,
    ) -> SubscriptionId {
        self.listeners.add(Box::new(callback))
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.listeners.remove(id)
    }

    pub fn emit(&self, name: &str, payload: Value) -> usize {
        let event = ViewEvent {
            name: name.to_string(),
            payload,
        };
        self.listeners.dispatch(&event, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_failing_listener_is_isolated() {
        let mut notifier = ChangeNotifier::new();
        let seen = Arc::new(AtomicUsize::new(0));

        notifier.subscribe(|_| anyhow::bail!("listener broke"));
        notifier.subscribe(|_| panic!("listener panicked"));
        let counter = Arc::clone(&seen);
        notifier.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        notifier.notify(&ChangeEvent::added(Entity::group(1, "Alder")));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let mut notifier = ChangeNotifier::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let id = notifier.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));
        notifier.notify(&ChangeEvent::added(Entity::group(1, "Alder")));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_channel_subscription_and_pruning() {
        let mut notifier = ChangeNotifier::new();
        let rx = notifier.subscribe_channel();
        let dropped = notifier.subscribe_channel();
        drop(dropped);

        let before = Entity::person(1, "Aldric", None);
        let after = Entity::person(1, "Aldric Storm", None);
        notifier.notify(&ChangeEvent::updated(before.clone(), after.clone()));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.op, OpKind::Update);
        assert_eq!(event.previous, Some(before));
        assert_eq!(event.entity, after);
        assert_eq!(notifier.listener_count(), 1);
    }

    #[test]
    fn test_event_bus_delivers_name_and_payload() {
        let mut bus = EventBus::new();
        let names = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&names);
        bus.subscribe(move |event| {
            sink.lock().unwrap().push((event.name.clone(), event.payload.clone()));
            Ok(())
        });

        assert_eq!(bus.emit(CONTEXTS_UPDATED, json!({ "scopes": ["global"] })), 1);
        let names = names.lock().unwrap();
        assert_eq!(names[0].0, "contexts-updated");
        assert_eq!(names[0].1["scopes"][0], "global");
    }
}
