//! Minimal typed publish/subscribe.
//!
//! Listeners may be tied to a [`CancellationToken`] scope. Once the token is
//! cancelled, every listener registered under it is dropped and never
//! invoked again.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio_util::sync::CancellationToken;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registration<T> {
    id: u64,
    scope: Option<CancellationToken>,
    listener: Listener<T>,
}

impl<T> Registration<T> {
    fn is_live(&self) -> bool {
        self.scope.as_ref().map_or(true, |s| !s.is_cancelled())
    }
}

pub struct Subject<T> {
    listeners: Arc<Mutex<Vec<Registration<T>>>>,
    next_id: AtomicU64,
}

impl<T: 'static> Subject<T> {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a listener. A cancelled `scope` makes this a no-op.
    pub fn subscribe<F>(&self, scope: Option<&CancellationToken>, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        if scope.map_or(false, CancellationToken::is_cancelled) {
            return Subscription::detached();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push(Registration {
            id,
            scope: scope.cloned(),
            listener: Arc::new(listener),
        });

        let listeners: Weak<Mutex<Vec<Registration<T>>>> = Arc::downgrade(&self.listeners);
        Subscription {
            unsubscribe: Some(Box::new(move || {
                if let Some(listeners) = listeners.upgrade() {
                    listeners.lock().retain(|r| r.id != id);
                }
            })),
        }
    }

    /// Deliver `event` to every live listener and return how many ran.
    pub fn publish(&self, event: &T) -> usize {
        // listeners run without the lock so they may subscribe or unsubscribe
        let snapshot: Vec<Listener<T>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(Registration::is_live);
            listeners.iter().map(|r| r.listener.clone()).collect()
        };

        for listener in &snapshot {
            listener(event);
        }
        snapshot.len()
    }

    pub fn listener_count(&self) -> usize {
        let mut listeners = self.listeners.lock();
        listeners.retain(Registration::is_live);
        listeners.len()
    }
}

impl<T: 'static> Default for Subject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Subject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

/// Handle returned by [`Subject::subscribe`].
///
/// Dropping the handle leaves the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn detached() -> Self {
        Self { unsubscribe: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}
