use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

pub type SubscriptionId = u64;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SubscriberSetInner<T> {
    subscribers: HashMap<SubscriptionId, Callback<T>>,
    next_id: SubscriptionId,
}

/// Set of live callbacks for one notification payload type. Registration
/// hands back an RAII [`Subscription`]; dropping the guard removes the
/// subscriber, which is the only cancellation surface readers have.
pub struct SubscriberSet<T> {
    inner: Arc<Mutex<SubscriberSetInner<T>>>,
}

impl<T: 'static> Default for SubscriberSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> SubscriberSet<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SubscriberSetInner {
                subscribers: HashMap::new(),
                next_id: 1,
            })),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, Arc::new(callback));
        let set: Weak<dyn Unsubscribe> = Arc::downgrade(&self.inner) as Weak<dyn Unsubscribe>;
        Subscription { id, set: Some(set) }
    }

    pub fn notify_all(&self, payload: &T) {
        // Snapshot the callbacks so a subscriber may drop its own guard
        // from inside the notification.
        let callbacks: Vec<Callback<T>> =
            self.inner.lock().subscribers.values().cloned().collect();
        for callback in callbacks {
            callback(payload);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().subscribers.is_empty()
    }
}

trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: SubscriptionId);
}

impl<T> Unsubscribe for Mutex<SubscriberSetInner<T>> {
    fn unsubscribe(&self, id: SubscriptionId) {
        self.lock().subscribers.remove(&id);
    }
}

/// RAII handle for one registered subscriber.
pub struct Subscription {
    id: SubscriptionId,
    set: Option<Weak<dyn Unsubscribe>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Keep the subscriber registered for the lifetime of the set.
    pub fn forget(mut self) {
        self.set = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(set) = self.set.take().and_then(|w| w.upgrade()) {
            set.unsubscribe(self.id);
        }
    }
}
