//! Routing table from event type to subscriber callbacks.
//!
//! The dispatcher knows nothing about the connection. It is owned by the
//! engine task and only ever touched from there, so it needs no locking.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::envelope::Envelope;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one subscription. Unique for the life of the process.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct HandlerId(pub u64);

impl HandlerId {
    pub fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// A subscriber callback. Returning an error reports a failure without
/// affecting any other subscriber.
pub type Handler = Box<dyn FnMut(&Envelope) -> anyhow::Result<()> + Send>;

/// Receives every subscriber failure.
pub type ErrorObserver = Box<dyn FnMut(HandlerFailure) + Send>;

/// A subscriber that returned an error or panicked while handling an envelope.
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub handler: HandlerId,
    pub event_type: String,
    pub message: String,
    pub panicked: bool,
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verb = if self.panicked { "panicked" } else { "failed" };
        write!(
            f,
            "{} {} on {}: {}",
            self.handler, verb, self.event_type, self.message
        )
    }
}

struct Subscription {
    id: HandlerId,
    handler: Handler,
}

/// Subscriptions keyed by event type, delivered in registration order.
#[derive(Default)]
pub struct Dispatcher {
    routes: HashMap<String, Vec<Subscription>>,
    owners: HashMap<HandlerId, String>,
    observer: Option<ErrorObserver>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(observer: ErrorObserver) -> Self {
        Self {
            observer: Some(observer),
            ..Self::default()
        }
    }

    /// Register `handler` for `event_type` and return its id.
    pub fn subscribe(&mut self, event_type: impl Into<String>, handler: Handler) -> HandlerId {
        let id = HandlerId::next();
        self.insert(id, event_type.into(), handler);
        id
    }

    /// Register under an id allocated by the caller. A duplicate id replaces
    /// the earlier registration.
    pub fn insert(&mut self, id: HandlerId, event_type: String, handler: Handler) {
        self.unsubscribe(id);
        self.owners.insert(id, event_type.clone());
        self.routes
            .entry(event_type)
            .or_default()
            .push(Subscription { id, handler });
    }

    /// Remove exactly one registration. Returns false if it was already gone.
    pub fn unsubscribe(&mut self, id: HandlerId) -> bool {
        let Some(event_type) = self.owners.remove(&id) else {
            return false;
        };
        if let Some(subs) = self.routes.get_mut(&event_type) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                self.routes.remove(&event_type);
            }
        }
        true
    }

    /// Deliver to every subscriber of `envelope`'s type. Returns how many
    /// handlers completed without error.
    pub fn dispatch(&mut self, envelope: &Envelope) -> usize {
        let Some(subs) = self.routes.get_mut(envelope.event_type()) else {
            return 0;
        };

        let mut delivered = 0;
        for sub in subs.iter_mut() {
            let outcome = catch_unwind(AssertUnwindSafe(|| (sub.handler)(envelope)));
            let failure = match outcome {
                Ok(Ok(())) => {
                    delivered += 1;
                    continue;
                }
                Ok(Err(err)) => HandlerFailure {
                    handler: sub.id,
                    event_type: envelope.event_type().to_string(),
                    message: format!("{err:#}"),
                    panicked: false,
                },
                Err(payload) => HandlerFailure {
                    handler: sub.id,
                    event_type: envelope.event_type().to_string(),
                    message: panic_message(payload.as_ref()),
                    panicked: true,
                },
            };

            warn!(
                handler = %failure.handler,
                event_type = %failure.event_type,
                panicked = failure.panicked,
                "subscriber failed: {}", failure.message
            );
            if let Some(observer) = self.observer.as_mut() {
                observer(failure);
            }
        }
        delivered
    }

    /// Drop every subscription.
    pub fn clear(&mut self) {
        self.routes.clear();
        self.owners.clear();
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.routes.get(event_type).map_or(0, Vec::len)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log, tag: &'static str) -> Handler {
        let log = log.clone();
        Box::new(move |env: &Envelope| {
            log.lock().unwrap().push(format!("{tag}:{}", env.event_type()));
            Ok(())
        })
    }

    fn agent_update() -> Envelope {
        Envelope::new("agent_update", json!({"id": "a1", "status": "warning"}))
    }

    #[test]
    fn routes_by_type_only() {
        let log: Log = Arc::default();
        let mut dispatcher = Dispatcher::new();
        dispatcher.subscribe("agent_update", recorder(&log, "a"));
        dispatcher.subscribe("agent_update", recorder(&log, "b"));
        dispatcher.subscribe("world_state_update", recorder(&log, "w"));

        let delivered = dispatcher.dispatch(&agent_update());

        assert_eq!(delivered, 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:agent_update", "b:agent_update"]
        );
    }

    #[test]
    fn delivers_in_registration_order() {
        let log: Log = Arc::default();
        let mut dispatcher = Dispatcher::new();
        for tag in ["first", "second", "third"] {
            dispatcher.subscribe("tick", recorder(&log, tag));
        }

        dispatcher.dispatch(&Envelope::new("tick", json!(null)));

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:tick", "second:tick", "third:tick"]
        );
    }

    #[test]
    fn unsubscribed_handler_sees_nothing() {
        let log: Log = Arc::default();
        let mut dispatcher = Dispatcher::new();
        let id = dispatcher.subscribe("agent_update", recorder(&log, "a"));

        assert!(dispatcher.unsubscribe(id));
        assert_eq!(dispatcher.dispatch(&agent_update()), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn unsubscribe_twice_is_noop() {
        let log: Log = Arc::default();
        let mut dispatcher = Dispatcher::new();
        let gone = dispatcher.subscribe("agent_update", recorder(&log, "gone"));
        dispatcher.subscribe("agent_update", recorder(&log, "kept"));

        assert!(dispatcher.unsubscribe(gone));
        assert!(!dispatcher.unsubscribe(gone));
        assert_eq!(dispatcher.subscriber_count("agent_update"), 1);

        dispatcher.dispatch(&agent_update());
        assert_eq!(*log.lock().unwrap(), vec!["kept:agent_update"]);
    }

    #[test]
    fn erroring_handler_is_isolated() {
        let log: Log = Arc::default();
        let failures: Arc<Mutex<Vec<HandlerFailure>>> = Arc::default();
        let sink = failures.clone();
        let mut dispatcher =
            Dispatcher::with_observer(Box::new(move |f| sink.lock().unwrap().push(f)));

        dispatcher.subscribe("agent_update", recorder(&log, "before"));
        let bad = dispatcher.subscribe(
            "agent_update",
            Box::new(|_| Err(anyhow::anyhow!("view unmounted"))),
        );
        dispatcher.subscribe("agent_update", recorder(&log, "after"));

        let delivered = dispatcher.dispatch(&agent_update());

        assert_eq!(delivered, 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["before:agent_update", "after:agent_update"]
        );
        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].handler, bad);
        assert_eq!(failures[0].message, "view unmounted");
        assert!(!failures[0].panicked);
    }

    #[test]
    fn panicking_handler_is_isolated() {
        let log: Log = Arc::default();
        let failures: Arc<Mutex<Vec<HandlerFailure>>> = Arc::default();
        let sink = failures.clone();
        let mut dispatcher =
            Dispatcher::with_observer(Box::new(move |f| sink.lock().unwrap().push(f)));

        dispatcher.subscribe("agent_update", Box::new(|_| panic!("index out of range")));
        dispatcher.subscribe("agent_update", recorder(&log, "survivor"));

        assert_eq!(dispatcher.dispatch(&agent_update()), 1);
        assert_eq!(*log.lock().unwrap(), vec!["survivor:agent_update"]);

        let failures = failures.lock().unwrap();
        assert!(failures[0].panicked);
        assert_eq!(failures[0].message, "index out of range");

        // Still routable after a panic
        drop(failures);
        assert_eq!(dispatcher.dispatch(&agent_update()), 1);
    }

    #[test]
    fn clear_removes_everything() {
        let log: Log = Arc::default();
        let mut dispatcher = Dispatcher::new();
        dispatcher.subscribe("a", recorder(&log, "a"));
        dispatcher.subscribe("b", recorder(&log, "b"));
        assert_eq!(dispatcher.len(), 2);

        dispatcher.clear();

        assert!(dispatcher.is_empty());
        assert_eq!(dispatcher.dispatch(&Envelope::new("a", json!(null))), 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn handler_ids_are_unique() {
        let a = HandlerId::next();
        let b = HandlerId::next();
        assert_ne!(a, b);
    }
}
