//! Event subscriptions.
//!
//! Handlers run on the session task in registration order. A panicking
//! handler is logged and skipped; the remaining handlers still run.

use hearth_core::Event;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub type Handler = Box<dyn Fn(&Event) + Send + 'static>;

/// Handle returned by `on` / `on_any`.
///
/// Dropping it does not unsubscribe; call [`unsubscribe`](Self::unsubscribe).
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop delivery. Idempotent, and safe to call from inside a handler:
    /// it takes effect before the next handler invocation.
    pub fn unsubscribe(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

pub(crate) struct Registration {
    id: u64,
    /// `None` matches every event.
    filter: Option<String>,
    handler: Handler,
    active: Arc<AtomicBool>,
}

impl Registration {
    pub(crate) fn new(id: u64, filter: Option<String>, handler: Handler) -> (Self, Subscription) {
        let active = Arc::new(AtomicBool::new(true));
        let subscription = Subscription {
            id,
            active: active.clone(),
        };
        (
            Self {
                id,
                filter,
                handler,
                active,
            },
            subscription,
        )
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn matches(&self, name: &str) -> bool {
        self.filter.as_deref().is_none_or(|f| f == name)
    }
}

#[derive(Default)]
pub(crate) struct Dispatcher {
    registrations: Vec<Registration>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, registration: Registration) {
        self.registrations.push(registration);
    }

    /// Number of live subscriptions.
    pub(crate) fn len(&self) -> usize {
        self.registrations.iter().filter(|r| r.is_active()).count()
    }

    /// Deliver an event. Returns how many handlers ran to completion.
    pub(crate) fn dispatch(&mut self, event: &Event) -> usize {
        self.registrations.retain(Registration::is_active);

        let mut delivered = 0;
        for registration in &self.registrations {
            if !registration.is_active() || !registration.matches(&event.name) {
                continue;
            }
            let handler = &registration.handler;
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::warn!(
                    "handler #{} panicked while handling `{}`",
                    registration.id,
                    event.name
                ),
            }
        }
        delivered
    }

    /// Deactivate and drop every subscription.
    pub(crate) fn clear(&mut self) {
        for registration in self.registrations.drain(..) {
            registration.active.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn push(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Handler {
        let log = log.clone();
        Box::new(move |event: &Event| log.lock().unwrap().push(format!("{tag}:{}", event.name)))
    }

    #[test]
    fn registration_order_and_any() {
        let log = recorder();
        let mut dispatcher = Dispatcher::new();
        dispatcher.add(Registration::new(1, Some("chat".into()), push(&log, "first")).0);
        dispatcher.add(Registration::new(2, None, push(&log, "any")).0);
        dispatcher.add(Registration::new(3, Some("chat".into()), push(&log, "second")).0);
        dispatcher.add(Registration::new(4, Some("cron".into()), push(&log, "cron")).0);

        assert_eq!(dispatcher.dispatch(&Event::new("chat", json!({}))), 3);
        assert_eq!(*log.lock().unwrap(), ["first:chat", "any:chat", "second:chat"]);
    }

    #[test]
    fn panicking_handler_does_not_stop_others() {
        let log = recorder();
        let mut dispatcher = Dispatcher::new();
        dispatcher.add(Registration::new(1, None, Box::new(|_: &Event| panic!("boom"))).0);
        dispatcher.add(Registration::new(2, None, push(&log, "after")).0);

        assert_eq!(dispatcher.dispatch(&Event::new("x", json!(null))), 1);
        assert_eq!(*log.lock().unwrap(), ["after:x"]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let log = recorder();
        let mut dispatcher = Dispatcher::new();
        let (registration, sub) = Registration::new(1, None, push(&log, "a"));
        dispatcher.add(registration);
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(dispatcher.dispatch(&Event::new("x", json!(null))), 0);
        assert_eq!(dispatcher.len(), 0);
    }

    #[test]
    fn unsubscribe_from_inside_handler() {
        let log = recorder();
        let mut dispatcher = Dispatcher::new();
        let later: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let slot = later.clone();
        let (first, _) = Registration::new(
            1,
            None,
            Box::new(move |_: &Event| {
                if let Some(sub) = slot.lock().unwrap().as_ref() {
                    sub.unsubscribe();
                }
            }),
        );
        let (second, second_sub) = Registration::new(2, None, push(&log, "second"));
        *later.lock().unwrap() = Some(second_sub);
        dispatcher.add(first);
        dispatcher.add(second);

        dispatcher.dispatch(&Event::new("x", json!(null)));
        dispatcher.dispatch(&Event::new("y", json!(null)));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn self_unsubscribe_delivers_once() {
        let log = recorder();
        let mut dispatcher = Dispatcher::new();
        let me: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot = me.clone();
        let inner_log = log.clone();
        let (registration, sub) = Registration::new(
            1,
            None,
            Box::new(move |event: &Event| {
                inner_log.lock().unwrap().push(event.name.clone());
                if let Some(sub) = slot.lock().unwrap().as_ref() {
                    sub.unsubscribe();
                }
            }),
        );
        *me.lock().unwrap() = Some(sub);
        dispatcher.add(registration);

        dispatcher.dispatch(&Event::new("once", json!(null)));
        dispatcher.dispatch(&Event::new("twice", json!(null)));
        assert_eq!(*log.lock().unwrap(), ["once"]);
    }

    #[test]
    fn clear_deactivates_handles() {
        let mut dispatcher = Dispatcher::new();
        let (registration, sub) = Registration::new(1, None, Box::new(|_: &Event| {}));
        dispatcher.add(registration);
        dispatcher.clear();
        assert!(!sub.is_active());
        assert_eq!(dispatcher.len(), 0);
    }
}
