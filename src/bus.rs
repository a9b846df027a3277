use crate::overlay::cdc::CdcEvent;
use crate::reactive::subscription::{SubscriberSet, Subscription};
use uuid::Uuid;

/// A batch of committed CDC events tagged with the instance that produced
/// them, so an instance can skip its own rebroadcasts.
#[derive(Debug, Clone)]
pub struct CdcBatch {
    pub origin: Uuid,
    pub events: Vec<CdcEvent>,
}

/// Opaque pub/sub for CDC fan-out across instances. The bus is a bus, not
/// a transport with delivery guarantees: ordering across instances is not
/// trusted, and each instance re-derives its overlay from the durable
/// mutation log.
pub trait CdcBus: Send + Sync {
    fn publish(&self, batch: CdcBatch);
    fn subscribe(&self, callback: Box<dyn Fn(&CdcBatch) + Send + Sync>) -> Subscription;
}

/// In-process bus: instances sharing one `LoopbackBus` see each other's
/// commits. Stands in for whatever broadcast transport the host offers.
#[derive(Default)]
pub struct LoopbackBus {
    subscribers: SubscriberSet<CdcBatch>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CdcBus for LoopbackBus {
    fn publish(&self, batch: CdcBatch) {
        self.subscribers.notify_all(&batch);
    }

    fn subscribe(&self, callback: Box<dyn Fn(&CdcBatch) + Send + Sync>) -> Subscription {
        self.subscribers.subscribe(callback)
    }
}
