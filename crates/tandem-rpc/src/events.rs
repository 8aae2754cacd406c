//! Event plumbing: a latching one-shot event with synchronous
//! late-subscription, and a simple multi-subscriber bus.

use std::sync::Mutex;
use tokio::sync::oneshot;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

type OnceCallback<T> = Box<dyn FnOnce(&T) + Send>;

/// A one-shot event that latches its value.
///
/// Subscribers registered after the event fired are invoked synchronously
/// during `subscribe`, exactly once; waiters resolve immediately.  Firing a
/// second time is a no-op.
pub struct OnceEvent<T: Clone> {
    inner: Mutex<OnceInner<T>>,
}

struct OnceInner<T> {
    value: Option<T>,
    callbacks: Vec<OnceCallback<T>>,
    waiters: Vec<oneshot::Sender<T>>,
}

impl<T: Clone> OnceEvent<T> {
    pub fn new() -> Self {
        OnceEvent {
            inner: Mutex::new(OnceInner {
                value: None,
                callbacks: Vec::new(),
                waiters: Vec::new(),
            }),
        }
    }

    /// Latch `value` and notify everyone.  Returns false if already fired.
    pub fn fire(&self, value: T) -> bool {
        let (callbacks, waiters) = {
            let mut inner = lock(&self.inner);
            if inner.value.is_some() {
                return false;
            }
            inner.value = Some(value.clone());
            (
                std::mem::take(&mut inner.callbacks),
                std::mem::take(&mut inner.waiters),
            )
        };
        // Callbacks run outside the lock so they may re-subscribe or read
        // the latched value without deadlocking.
        for cb in callbacks {
            cb(&value);
        }
        for tx in waiters {
            let _ = tx.send(value.clone());
        }
        true
    }

    /// Register a callback; invoked synchronously if the event already fired.
    pub fn subscribe(&self, cb: impl FnOnce(&T) + Send + 'static) {
        let mut cb = Some(cb);
        let fired = {
            let mut inner = lock(&self.inner);
            match &inner.value {
                Some(v) => Some(v.clone()),
                None => {
                    inner.callbacks.push(Box::new(cb.take().unwrap()));
                    None
                }
            }
        };
        if let Some(v) = fired {
            (cb.take().unwrap())(&v);
        }
    }

    /// The latched value, if any.
    pub fn get(&self) -> Option<T> {
        lock(&self.inner).value.clone()
    }

    /// Wait for the event.  Returns `None` only if the event is dropped
    /// without ever firing.
    pub async fn wait(&self) -> Option<T> {
        let rx = {
            let mut inner = lock(&self.inner);
            if let Some(v) = &inner.value {
                return Some(v.clone());
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push(tx);
            rx
        };
        match rx.await {
            Ok(v) => Some(v),
            Err(_) => lock(&self.inner).value.clone(),
        }
    }
}

impl<T: Clone> Default for OnceEvent<T> {
    fn default() -> Self {
        Self::new()
    }
}

type BusCallback<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Multi-fire, multi-subscriber event bus.
pub struct Bus<T> {
    subscribers: Mutex<Vec<BusCallback<T>>>,
}

impl<T> Bus<T> {
    pub fn new() -> Self {
        Bus {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, cb: impl Fn(&T) + Send + Sync + 'static) {
        lock(&self.subscribers).push(Box::new(cb));
    }

    pub fn emit(&self, value: &T) {
        // Snapshot-free: callbacks run under the lock would deadlock on
        // re-subscription, so swap out, run, and merge back.
        let callbacks = std::mem::take(&mut *lock(&self.subscribers));
        for cb in &callbacks {
            cb(value);
        }
        let mut subs = lock(&self.subscribers);
        let added = std::mem::take(&mut *subs);
        *subs = callbacks;
        subs.extend(added);
    }
}

impl<T> Default for Bus<T> {
    fn default() -> Self {
        Self::new()
    }
}
