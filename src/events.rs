//! Fan-out event emitters and scoped disposal.
//!
//! Every cross-cutting event in the broker (diagnostics, document lifecycle,
//! disposal, registration changes) flows through an [`Emitter`]. Subscribing
//! returns a [`Disposable`]; a [`DisposableCollection`] releases everything a
//! component opened, exactly once, when that component goes away.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

/// A resource release that runs exactly once, when `dispose` is called.
/// Dropping a `Disposable` without disposing leaves the resource registered;
/// long-lived owners hold them in a [`DisposableCollection`].
pub struct Disposable {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Disposable {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Disposable {
            release: Some(Box::new(release)),
        }
    }

    pub fn noop() -> Self {
        Disposable { release: None }
    }

    pub fn dispose(mut self) {
        if let Some(release) = self.release.take() {
            if catch_unwind(AssertUnwindSafe(release)).is_err() {
                warn!("a disposable release panicked; continuing disposal");
            }
        }
    }
}

/// Scoped holder for every subscription, handler and task a component opens.
/// Disposal releases each registered resource exactly once; a panicking
/// release does not stop the rest.
#[derive(Default)]
pub struct DisposableCollection {
    items: Mutex<Vec<Disposable>>,
    disposed: AtomicBool,
}

impl DisposableCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a disposable. If the collection was already disposed the
    /// resource is released immediately.
    pub fn push(&self, disposable: Disposable) {
        if self.disposed.load(Ordering::Acquire) {
            disposable.dispose();
            return;
        }
        self.items.lock().push(disposable);
    }

    pub fn push_fn(&self, release: impl FnOnce() + Send + 'static) {
        self.push(Disposable::new(release));
    }

    /// Registers a spawned task; disposal aborts it.
    pub fn push_task(&self, handle: JoinHandle<()>) {
        self.push_fn(move || handle.abort());
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let items = std::mem::take(&mut *self.items.lock());
        for item in items {
            item.dispose();
        }
    }
}

impl Drop for DisposableCollection {
    fn drop(&mut self) {
        self.dispose();
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct EmitterInner<T> {
    subscribers: Mutex<Vec<(u64, Callback<T>)>>,
    next_id: AtomicU64,
}

/// Ordered multi-subscriber event source. Dispatch snapshots the subscriber
/// list first, so a callback that (un)subscribes cannot corrupt the ongoing
/// fire.
pub struct Emitter<T> {
    inner: Arc<EmitterInner<T>>,
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Emitter {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> Emitter<T> {
    pub fn new() -> Self {
        Emitter {
            inner: Arc::new(EmitterInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Disposable {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((id, Arc::new(callback)));
        let inner = Arc::downgrade(&self.inner);
        Disposable::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.subscribers.lock().retain(|(sub_id, _)| *sub_id != id);
            }
        })
    }

    pub fn fire(&self, value: &T) {
        let snapshot: Vec<Callback<T>> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in snapshot {
            callback(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn subscribers_receive_fired_values_in_order() {
        let emitter: Emitter<u32> = Emitter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_a = seen.clone();
        let _a = emitter.subscribe(move |v| seen_a.lock().push(("a", *v)));
        let seen_b = seen.clone();
        let _b = emitter.subscribe(move |v| seen_b.lock().push(("b", *v)));

        emitter.fire(&1);
        emitter.fire(&2);

        assert_eq!(*seen.lock(), vec![("a", 1), ("b", 1), ("a", 2), ("b", 2)]);
    }

    #[test]
    fn dispose_unsubscribes() {
        let emitter: Emitter<u32> = Emitter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = count.clone();
        let sub = emitter.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        emitter.fire(&1);
        sub.dispose();
        emitter.fire(&2);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.subscriber_count(), 0);
    }

    #[test]
    fn collection_releases_each_item_once_even_when_one_panics() {
        let collection = DisposableCollection::new();
        let released = Arc::new(AtomicUsize::new(0));

        let r1 = released.clone();
        collection.push_fn(move || {
            r1.fetch_add(1, Ordering::SeqCst);
        });
        collection.push_fn(|| panic!("release failure"));
        let r2 = released.clone();
        collection.push_fn(move || {
            r2.fetch_add(1, Ordering::SeqCst);
        });

        collection.dispose();
        collection.dispose();

        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn push_after_dispose_releases_immediately() {
        let collection = DisposableCollection::new();
        collection.dispose();

        let released = Arc::new(AtomicBool::new(false));
        let released_clone = released.clone();
        collection.push_fn(move || released_clone.store(true, Ordering::SeqCst));

        assert!(released.load(Ordering::SeqCst));
    }
}
