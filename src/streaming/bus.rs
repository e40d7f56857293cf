// Typed publish/subscribe registry keyed by notification kind

use dashmap::DashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::events::Notification;

/// Subscriber callback
pub type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Handle returned by [`EventBus::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Per-kind subscribers in registration order
#[derive(Default)]
pub struct EventBus {
    subscribers: DashMap<String, Vec<(SubscriptionId, Callback)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for notifications of `kind`
    pub fn on<F>(&self, kind: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .entry(kind.into())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn off(&self, kind: &str, id: SubscriptionId) -> bool {
        let removed = match self.subscribers.get_mut(kind) {
            Some(mut callbacks) => match callbacks.iter().position(|(sub, _)| *sub == id) {
                Some(index) => {
                    callbacks.remove(index);
                    true
                }
                None => false,
            },
            None => false,
        };
        self.subscribers.remove_if(kind, |_, callbacks| callbacks.is_empty());
        removed
    }

    /// Deliver to every subscriber of the notification's kind, in
    /// registration order. Returns how many callbacks ran.
    ///
    /// Iterates a snapshot, so callbacks may subscribe or unsubscribe
    /// while being dispatched.
    pub fn emit(&self, notification: &Notification) -> usize {
        let snapshot: Vec<Callback> = match self.subscribers.get(&notification.kind) {
            Some(callbacks) => callbacks.iter().map(|(_, cb)| cb.clone()).collect(),
            None => return 0,
        };

        for callback in &snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(notification))).is_err() {
                tracing::error!(kind = %notification.kind, "Notification subscriber panicked");
            }
        }
        snapshot.len()
    }

    pub fn subscriber_count(&self, kind: &str) -> usize {
        self.subscribers.get(kind).map_or(0, |callbacks| callbacks.len())
    }

    /// Drop every subscription
    pub fn clear(&self) {
        self.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn notification(kind: &str) -> Notification {
        Notification::from_json(&format!(r#"{{"type":"{}"}}"#, kind)).unwrap()
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Callback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for = log.clone();
        let make = move |label: &str| -> Callback {
            let log = log_for.clone();
            let label = label.to_string();
            Arc::new(move |n: &Notification| {
                log.lock().unwrap().push(format!("{}:{}", label, n.kind));
            })
        };
        (log, make)
    }

    #[test]
    fn test_emit_in_registration_order_by_kind() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let first = make("first");
        let second = make("second");
        let other = make("other");
        bus.on("stamp-added", move |n| first(n));
        bus.on("payment-success", move |n| other(n));
        bus.on("stamp-added", move |n| second(n));

        assert_eq!(bus.emit(&notification("stamp-added")), 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:stamp-added", "second:stamp-added"]
        );
        assert_eq!(bus.emit(&notification("coupon-issued")), 0);
    }

    #[test]
    fn test_off_removes_only_that_subscription() {
        let bus = EventBus::new();
        let a = bus.on("stamp-added", |_| {});
        let b = bus.on("stamp-added", |_| {});

        assert!(bus.off("stamp-added", a));
        assert!(!bus.off("stamp-added", a));
        assert!(!bus.off("payment-success", b));
        assert_eq!(bus.subscriber_count("stamp-added"), 1);

        assert!(bus.off("stamp-added", b));
        assert_eq!(bus.subscriber_count("stamp-added"), 0);
    }

    #[test]
    fn test_unsubscribe_during_dispatch() {
        let bus = Arc::new(EventBus::new());
        let calls = Arc::new(Mutex::new(Vec::new()));

        let id_slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let (bus_ref, slot, log) = (bus.clone(), id_slot.clone(), calls.clone());
        let id = bus.on("stamp-added", move |_| {
            log.lock().unwrap().push("self-removing");
            if let Some(id) = *slot.lock().unwrap() {
                bus_ref.off("stamp-added", id);
            }
        });
        *id_slot.lock().unwrap() = Some(id);

        let log = calls.clone();
        bus.on("stamp-added", move |_| log.lock().unwrap().push("second"));

        // Both run on the first emit even though the first one unsubscribed
        assert_eq!(bus.emit(&notification("stamp-added")), 2);
        assert_eq!(bus.emit(&notification("stamp-added")), 1);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["self-removing", "second", "second"]
        );
    }

    #[test]
    fn test_panicking_subscriber_does_not_stop_dispatch() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let after = make("after");
        bus.on("stamp-completed", |_| panic!("subscriber bug"));
        bus.on("stamp-completed", move |n| after(n));

        assert_eq!(bus.emit(&notification("stamp-completed")), 2);
        assert_eq!(*log.lock().unwrap(), vec!["after:stamp-completed"]);
    }

    #[test]
    fn test_order_kept_across_off_and_on() {
        let bus = EventBus::new();
        let (log, make) = recorder();
        let (a, b, c, d) = (make("a"), make("b"), make("c"), make("d"));
        bus.on("coupon-issued", move |n| a(n));
        let removed = bus.on("coupon-issued", move |n| b(n));
        bus.on("coupon-issued", move |n| c(n));
        assert!(bus.off("coupon-issued", removed));
        bus.on("coupon-issued", move |n| d(n));

        assert_eq!(bus.emit(&notification("coupon-issued")), 3);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:coupon-issued", "c:coupon-issued", "d:coupon-issued"]
        );
    }

    #[test]
    fn test_clear() {
        let bus = EventBus::new();
        bus.on("a", |_| {});
        bus.on("b", |_| {});
        bus.clear();
        assert_eq!(bus.subscriber_count("a"), 0);
        assert_eq!(bus.emit(&notification("b")), 0);
    }
}
