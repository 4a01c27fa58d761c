//! Change-only snapshot publishing.
//!
//! A [`Publisher`] holds the latest value of a snapshot. Synchronous listeners
//! registered with [`Publisher::subscribe`] run on the publishing thread, and
//! async consumers can hold a `watch::Receiver` instead. Both see only changes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::watch;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    sender: watch::Sender<T>,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_id: AtomicU64,
}

impl<T> Inner<T> {
    fn listeners(&self) -> MutexGuard<'_, Vec<(u64, Listener<T>)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Latest-value cell that notifies subscribers when the value changes
pub struct Publisher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Publisher<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(initial: T) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            inner: Arc::new(Inner {
                sender,
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn current(&self) -> T {
        self.inner.sender.borrow().clone()
    }

    /// Store `value`; listeners run only if it differs from the current one
    pub fn publish(&self, value: T) -> bool {
        self.update(|current| *current = value)
    }

    /// Apply `update` to the current value in place and publish the result.
    ///
    /// The change is made under the channel's lock, so concurrent updates to
    /// different parts of the value never overwrite each other.
    pub fn update(&self, update: impl FnOnce(&mut T)) -> bool {
        let mut committed = None;
        self.inner.sender.send_if_modified(|current| {
            let before = current.clone();
            update(current);
            if *current == before {
                false
            } else {
                committed = Some(current.clone());
                true
            }
        });
        match committed {
            Some(value) => {
                self.notify(&value);
                true
            }
            None => false,
        }
    }

    fn notify(&self, value: &T) {
        let listeners: Vec<Listener<T>> = self
            .inner
            .listeners()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(value);
        }
    }

    /// Register a listener for future changes
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners().push((id, Arc::new(listener)));

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.listeners().retain(|(existing, _)| *existing != id);
                }
            })),
        }
    }

    pub fn watch(&self) -> watch::Receiver<T> {
        self.inner.sender.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners().len()
    }
}

/// Handle for a registered listener; dropping it unsubscribes
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
