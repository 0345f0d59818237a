// ── Multi-subscriber event sink registry ──
//
// Subscribers are kept in registration order. Dispatchers iterate a
// snapshot taken outside the registry lock and pin each entry while they
// call into it; `unsubscribe` waits for the pin count to drain and then
// clears the handler under the entry's write lock, so no call can start
// or still be running once it returns.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::{error, trace};

/// Opaque subscriber identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(String);

impl SinkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SinkId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for SinkId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One registered subscriber.
pub struct HandlerEntry<H: ?Sized> {
    id: SinkId,
    handler: RwLock<Option<Arc<H>>>,
    uses: AtomicUsize,
}

/// Shared handle to a registry entry, returned by `subscribe`.
pub type HandlerRef<H> = Arc<HandlerEntry<H>>;

impl<H: ?Sized> HandlerEntry<H> {
    fn new(id: SinkId, handler: Arc<H>) -> Self {
        Self {
            id,
            handler: RwLock::new(Some(handler)),
            uses: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &SinkId {
        &self.id
    }

    /// Number of dispatches currently holding this entry pinned.
    pub fn use_count(&self) -> usize {
        self.uses.load(Ordering::Acquire)
    }

    /// `false` once the entry has been unsubscribed.
    pub fn is_valid(&self) -> bool {
        self.handler.read().is_some()
    }

    /// Pin the entry for the lifetime of the returned guard.
    pub fn pin(&self) -> PinGuard<'_, H> {
        self.uses.fetch_add(1, Ordering::AcqRel);
        PinGuard { entry: self }
    }

    /// Pin the entry and run `f` against the live handler.
    ///
    /// Returns `None` when the entry was invalidated before the call could
    /// start. Calling `unsubscribe` for this same entry from inside `f`
    /// never returns.
    pub fn with_handler<R>(&self, f: impl FnOnce(&H) -> R) -> Option<R> {
        let _pin = self.pin();
        let guard = self.handler.read();
        guard.as_deref().map(f)
    }

    fn invalidate(&self) {
        *self.handler.write() = None;
    }
}

impl<H: ?Sized> fmt::Debug for HandlerEntry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("id", &self.id)
            .field("uses", &self.use_count())
            .finish_non_exhaustive()
    }
}

/// RAII pin on a [`HandlerEntry`].
pub struct PinGuard<'a, H: ?Sized> {
    entry: &'a HandlerEntry<H>,
}

impl<H: ?Sized> Drop for PinGuard<'_, H> {
    fn drop(&mut self) {
        self.entry.uses.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Thread-safe one-to-many subscription list.
pub struct EventSinkRegistry<H: ?Sized> {
    entries: Mutex<IndexMap<SinkId, HandlerRef<H>>>,
    poll_interval: Duration,
}

impl<H: ?Sized> EventSinkRegistry<H> {
    pub fn new() -> Self {
        Self::with_poll_interval(Duration::from_millis(1))
    }

    /// Registry whose `unsubscribe` polls the pin count at `poll_interval`.
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            entries: Mutex::new(IndexMap::new()),
            poll_interval,
        }
    }

    /// Register `handler` under `id`.
    ///
    /// Subscribing an identity that is already registered returns the
    /// existing handle and leaves its handler untouched.
    pub fn subscribe(&self, id: impl Into<SinkId>, handler: Arc<H>) -> HandlerRef<H> {
        let id = id.into();
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&id) {
            return Arc::clone(existing);
        }
        trace!(subscriber = %id, "subscribing event sink");
        let entry = Arc::new(HandlerEntry::new(id.clone(), handler));
        entries.insert(id, Arc::clone(&entry));
        entry
    }

    /// Remove `handle` and invalidate it once no dispatch holds it pinned.
    pub fn unsubscribe(&self, handle: &HandlerRef<H>) {
        {
            let mut entries = self.entries.lock();
            if entries
                .get(handle.id())
                .is_some_and(|current| Arc::ptr_eq(current, handle))
            {
                entries.shift_remove(handle.id());
            }
        }

        while handle.use_count() > 0 {
            thread::sleep(self.poll_interval);
        }
        handle.invalidate();
        trace!(subscriber = %handle.id(), "event sink unsubscribed");
    }

    /// Remove the subscriber registered under `id`, if any.
    pub fn unsubscribe_id(&self, id: &SinkId) -> bool {
        let handle = self.entries.lock().get(id).cloned();
        match handle {
            Some(handle) => {
                self.unsubscribe(&handle);
                true
            }
            None => false,
        }
    }

    /// Copy of the current handles, in registration order.
    pub fn snapshot(&self) -> Vec<HandlerRef<H>> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn contains(&self, id: &SinkId) -> bool {
        self.entries.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Invoke `f` for every live subscriber, in registration order.
    ///
    /// A panicking subscriber is logged and skipped; the remaining ones are
    /// still called. Returns the number of subscribers that panicked.
    pub fn for_each(&self, mut f: impl FnMut(&SinkId, &H)) -> usize {
        let mut panicked = 0;
        for entry in self.snapshot() {
            let outcome = entry.with_handler(|handler| {
                panic::catch_unwind(AssertUnwindSafe(|| f(entry.id(), handler)))
            });
            if matches!(outcome, Some(Err(_))) {
                panicked += 1;
                error!(subscriber = %entry.id(), "event sink subscriber panicked");
            }
        }
        panicked
    }
}

impl<H: ?Sized> Default for EventSinkRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;

    use super::*;

    trait Counter: Send + Sync {
        fn hit(&self);
    }

    #[derive(Default)]
    struct Hits(AtomicUsize);

    impl Counter for Hits {
        fn hit(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn subscribe_is_idempotent_per_identity() {
        let registry: EventSinkRegistry<dyn Counter> = EventSinkRegistry::new();
        let first = registry.subscribe("a", Arc::new(Hits::default()));
        let second = registry.subscribe("a", Arc::new(Hits::default()));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn snapshot_preserves_registration_order() {
        let registry: EventSinkRegistry<dyn Counter> = EventSinkRegistry::new();
        for id in ["c", "a", "b"] {
            registry.subscribe(id, Arc::new(Hits::default()));
        }
        let ids: Vec<String> = registry
            .snapshot()
            .iter()
            .map(|entry| entry.id().to_string())
            .collect();
        assert_eq!(ids, ["c", "a", "b"]);
    }

    #[test]
    fn unsubscribed_handler_is_never_invoked_again() {
        let registry: EventSinkRegistry<dyn Counter> = EventSinkRegistry::new();
        let hits = Arc::new(Hits::default());
        let handle = registry.subscribe("a", hits.clone());
        let stale = registry.snapshot();

        registry.unsubscribe(&handle);

        assert!(registry.is_empty());
        assert!(!handle.is_valid());
        for entry in stale {
            assert!(entry.with_handler(|handler| handler.hit()).is_none());
        }
        assert_eq!(hits.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_waits_for_pinned_dispatch() {
        struct Slow {
            entered: mpsc::Sender<()>,
            finished: AtomicBool,
        }
        impl Counter for Slow {
            fn hit(&self) {
                self.entered.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                self.finished.store(true, Ordering::SeqCst);
            }
        }

        let (tx, rx) = mpsc::channel();
        let slow = Arc::new(Slow {
            entered: tx,
            finished: AtomicBool::new(false),
        });
        let registry: Arc<EventSinkRegistry<dyn Counter>> = Arc::new(EventSinkRegistry::new());
        let handle = registry.subscribe("slow", slow.clone());

        let dispatcher = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.for_each(|_, handler| handler.hit()))
        };

        rx.recv().unwrap();
        registry.unsubscribe(&handle);
        assert!(slow.finished.load(Ordering::SeqCst));
        dispatcher.join().unwrap();
    }

    struct Explodes;

    impl Counter for Explodes {
        fn hit(&self) {
            panic!("subscriber failure");
        }
    }

    #[test]
    fn panicking_subscriber_does_not_stop_dispatch() {
        let registry: EventSinkRegistry<dyn Counter> = EventSinkRegistry::new();
        let before = Arc::new(Hits::default());
        let after = Arc::new(Hits::default());
        registry.subscribe("before", before.clone());
        let exploding = registry.subscribe("explodes", Arc::new(Explodes));
        registry.subscribe("after", after.clone());

        assert_eq!(registry.for_each(|_, handler| handler.hit()), 1);
        assert_eq!(before.0.load(Ordering::SeqCst), 1);
        assert_eq!(after.0.load(Ordering::SeqCst), 1);
        assert_eq!(exploding.use_count(), 0);
    }

    #[test]
    fn unsubscribe_by_id_reports_presence() {
        let registry: EventSinkRegistry<dyn Counter> = EventSinkRegistry::new();
        registry.subscribe("a", Arc::new(Hits::default()));
        assert!(registry.unsubscribe_id(&SinkId::from("a")));
        assert!(!registry.unsubscribe_id(&SinkId::from("a")));
    }
}
