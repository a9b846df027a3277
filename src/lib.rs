//! tidedb — local-first, offline-capable document database core.
//!
//! Layers on an embedded ordered KV store:
//!
//! - an optimistic overlay merging the pending-mutation log into every
//!   read, so reads always reflect the latest user-visible state;
//! - causally-correct CDC derivation reconciling authoritative writes
//!   with the pending overlay;
//! - a reactive query cache with deduplicated live queries and
//!   micro-batched initial reads;
//! - a sync manager pushing local mutations with retries and
//!   cross-instance locking, and pulling authoritative changes with a
//!   cursor.

pub mod bus;
pub mod canon;
pub mod clock;
pub mod condition;
pub mod config;
pub mod error;
pub mod merge;
pub mod mutator;
pub mod overlay;
pub mod reactive;
pub mod storage;
pub mod sync;
pub mod types;
pub mod write;

pub use bus::{CdcBatch, CdcBus, LoopbackBus};
pub use condition::{Comparator, Condition};
pub use config::TidedbConfig;
pub use error::{TidedbError, TidedbErrorCode};
pub use mutator::{MutatorDef, PushAck, RemoteResolver};
pub use overlay::OverlayTransaction;
pub use overlay::cdc::CdcEvent;
pub use reactive::query::{QueryData, QueryOption, QueryResultChange};
pub use reactive::subscription::Subscription;
pub use storage::memory::{CollectionSpec, IndexSpec};
pub use sync::retry::ShouldRetry;
pub use sync::{PullOperation, PullResponse};
pub use types::{Key, Row, Scalar};

use crate::mutator::MutatorRegistry;
use crate::reactive::QueryEngine;
use crate::reactive::query::QueryNotification;
use crate::reactive::subscription::SubscriberSet;
use crate::storage::memory::{MemoryStore, is_internal_collection};
use crate::sync::SyncManager;
use crate::write::MutationContext;
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Routes committed CDC batches to the query cache, the instance's CDC
/// subscribers, and (for locally-produced batches) the cross-instance
/// bus. Events on the internal collections never leave this filter.
struct CdcRouter {
    instance_id: Uuid,
    engine: Arc<QueryEngine>,
    subscribers: Arc<SubscriberSet<Vec<CdcEvent>>>,
    bus: Arc<dyn CdcBus>,
}

impl CdcRouter {
    fn visible(events: Vec<CdcEvent>) -> Vec<CdcEvent> {
        events
            .into_iter()
            .filter(|e| !is_internal_collection(e.collection_name()))
            .collect()
    }

    fn dispatch_local(&self, events: Vec<CdcEvent>) {
        let visible = Self::visible(events);
        if visible.is_empty() {
            return;
        }
        self.engine.dispatch(&visible);
        self.subscribers.notify_all(&visible);
        self.bus.publish(CdcBatch {
            origin: self.instance_id,
            events: visible,
        });
    }

    fn dispatch_remote(&self, batch: &CdcBatch) {
        if batch.origin == self.instance_id {
            return;
        }
        let visible = Self::visible(batch.events.clone());
        if visible.is_empty() {
            return;
        }
        self.engine.dispatch(&visible);
        self.subscribers.notify_all(&visible);
    }
}

struct SharedReadTx {
    tx: Arc<OverlayTransaction>,
    opened: Instant,
}

/// The database facade: wires the store, overlay, query engine, and sync
/// manager together and exposes the public mutation/read/subscription
/// surface.
pub struct TidedbInstance {
    config: TidedbConfig,
    instance_id: Uuid,
    store: Arc<MemoryStore>,
    registry: Arc<MutatorRegistry>,
    engine: Arc<QueryEngine>,
    sync: Arc<SyncManager>,
    router: Arc<CdcRouter>,
    cdc_subscribers: Arc<SubscriberSet<Vec<CdcEvent>>>,
    shared_read: Mutex<Option<SharedReadTx>>,
    pull_task: Mutex<Option<JoinHandle<()>>>,
    bus_subscription: Mutex<Option<Subscription>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for TidedbInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TidedbInstance")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl TidedbInstance {
    /// Open an instance with an in-process loopback bus.
    pub fn open(
        config: TidedbConfig,
        collections: Vec<CollectionSpec>,
    ) -> Result<Arc<Self>, TidedbError> {
        Self::open_with_bus(config, collections, Arc::new(LoopbackBus::new()))
    }

    /// Open an instance on a caller-supplied broadcast bus, so sibling
    /// instances of the same database see each other's commits.
    pub fn open_with_bus(
        config: TidedbConfig,
        collections: Vec<CollectionSpec>,
        bus: Arc<dyn CdcBus>,
    ) -> Result<Arc<Self>, TidedbError> {
        config.validate()?;
        for spec in &collections {
            if is_internal_collection(&spec.name) {
                return Err(TidedbError::CollectionReserved {
                    collection: spec.name.clone(),
                });
            }
        }
        info!(
            name = %config.name,
            collections = collections.len(),
            pull_interval_ms = config.pull_interval_ms,
            read_batch_window_ms = config.read_batch_window_ms,
            "opening tidedb instance"
        );
        let store = MemoryStore::new(collections);
        let engine = QueryEngine::new(
            store.clone(),
            Duration::from_millis(config.read_batch_window_ms),
        );
        let cdc_subscribers: Arc<SubscriberSet<Vec<CdcEvent>>> = Arc::new(SubscriberSet::new());
        let instance_id = Uuid::new_v4();
        let router = Arc::new(CdcRouter {
            instance_id,
            engine: engine.clone(),
            subscribers: cdc_subscribers.clone(),
            bus,
        });
        let registry = Arc::new(MutatorRegistry::new());
        let commit_router = router.clone();
        let sync = SyncManager::new(
            store.clone(),
            config.clone(),
            registry.clone(),
            Arc::new(move |events| commit_router.dispatch_local(events)),
        );
        Ok(Arc::new(Self {
            config,
            instance_id,
            store,
            registry,
            engine,
            sync,
            router,
            cdc_subscribers,
            shared_read: Mutex::new(None),
            pull_task: Mutex::new(None),
            bus_subscription: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn config(&self) -> &TidedbConfig {
        &self.config
    }

    /// Attach to the bus, resume any mutations left over from a previous
    /// run, and start the scheduled pull loop.
    pub fn initialize(self: &Arc<Self>) {
        let router = self.router.clone();
        let subscription = self
            .router
            .bus
            .subscribe(Box::new(move |batch| router.dispatch_remote(batch)));
        *self.bus_subscription.lock() = Some(subscription);

        // Push/pull state lives entirely in __mutations + __meta.cursor, so
        // draining the log is all a restart needs.
        self.sync.schedule_push();

        let weak = Arc::downgrade(self);
        let interval = Duration::from_millis(self.config.pull_interval_ms);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(db) = weak.upgrade() else { break };
                if db.closed.load(Ordering::Acquire) {
                    break;
                }
                if db.sync.has_puller()
                    && let Err(error) = db.sync.pull().await
                {
                    warn!(error = %error, "scheduled pull failed");
                }
            }
        });
        *self.pull_task.lock() = Some(handle);
    }

    /// Stop background work. Reads keep working; mutations are refused.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(handle) = self.pull_task.lock().take() {
            handle.abort();
        }
        self.bus_subscription.lock().take();
        info!(name = %self.config.name, "tidedb instance closed");
    }

    pub fn register_mutator(&self, name: impl Into<String>, def: MutatorDef) {
        self.registry.register(name, def);
    }

    pub fn set_puller<F, Fut>(&self, puller: F)
    where
        F: Fn(Option<Scalar>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<PullResponse, TidedbError>> + Send + 'static,
    {
        self.sync.set_puller(puller);
    }

    /// Run the named mutator. The local resolver executes inside one
    /// overlay transaction; on success the mutation commits, CDC fires,
    /// and a push is scheduled. On failure everything rolls back and the
    /// resolver's error propagates.
    pub async fn mutate(
        self: &Arc<Self>,
        name: &str,
        args: Value,
    ) -> Result<Value, TidedbError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TidedbError::Closed);
        }
        let def = self
            .registry
            .get(name)
            .ok_or_else(|| TidedbError::MutatorUnknown {
                name: name.to_string(),
            })?;
        let tx = OverlayTransaction::write(self.store.clone()).await;
        let mutation_id = tx.allocate_mutation(name, args.clone())?;
        let ctx = MutationContext::new(&tx, mutation_id);
        match (def.local)(&ctx, args) {
            Ok(result) => {
                tx.complete_mutation(mutation_id, result.clone())?;
                let events = tx.commit()?;
                self.router.dispatch_local(events);
                self.sync.schedule_push();
                Ok(result)
            }
            Err(error) => {
                tx.rollback();
                Err(error)
            }
        }
    }

    /// Handle on a user collection for reads and subscriptions.
    pub fn collection(&self, name: &str) -> Result<CollectionHandle, TidedbError> {
        if is_internal_collection(name) {
            return Err(TidedbError::CollectionReserved {
                collection: name.to_string(),
            });
        }
        if !self.store.has_collection(name) {
            return Err(TidedbError::CollectionNotFound {
                collection: name.to_string(),
            });
        }
        Ok(CollectionHandle {
            engine: self.engine.clone(),
            name: name.to_string(),
        })
    }

    /// Run a read closure against a read-only overlay transaction.
    /// Concurrent calls within one batch window share a single
    /// transaction, and with it a single consistent snapshot.
    pub async fn batch_read<R>(
        &self,
        f: impl FnOnce(&OverlayTransaction) -> Result<R, TidedbError>,
    ) -> Result<R, TidedbError> {
        let tx = self.shared_read_tx();
        f(&tx)
    }

    fn shared_read_tx(&self) -> Arc<OverlayTransaction> {
        let window = Duration::from_millis(self.config.read_batch_window_ms);
        let mut guard = self.shared_read.lock();
        if let Some(shared) = guard.as_ref()
            && shared.opened.elapsed() <= window
        {
            return shared.tx.clone();
        }
        let tx = Arc::new(OverlayTransaction::read(self.store.clone()));
        *guard = Some(SharedReadTx {
            tx: tx.clone(),
            opened: Instant::now(),
        });
        tx
    }

    pub async fn pull(self: &Arc<Self>) -> Result<(), TidedbError> {
        self.sync.pull().await
    }

    /// Apply authoritative changes that arrived out-of-band, e.g. via a
    /// server push channel.
    pub async fn apply_change(&self, response: PullResponse) -> Result<(), TidedbError> {
        self.sync.apply_change(response).await
    }

    pub async fn push(self: &Arc<Self>) -> Result<(), TidedbError> {
        self.sync.push().await
    }

    /// Subscribe to every user-visible committed CDC batch.
    pub fn subscribe_to_cdc(
        &self,
        callback: impl Fn(&[CdcEvent]) + Send + Sync + 'static,
    ) -> Subscription {
        self.cdc_subscribers
            .subscribe(move |events: &Vec<CdcEvent>| callback(events))
    }

    /// Completed mutations not yet garbage-collected by a pull.
    pub fn pending_mutations_count(&self) -> Result<usize, TidedbError> {
        OverlayTransaction::read(self.store.clone()).completed_mutation_count()
    }

    /// The last persisted pull cursor.
    pub fn cursor(&self) -> Result<Option<Scalar>, TidedbError> {
        self.sync.cursor()
    }
}

/// Read surface scoped to one collection.
pub struct CollectionHandle {
    engine: Arc<QueryEngine>,
    name: String,
}

impl CollectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: impl Into<Key>) -> DocumentQuery {
        DocumentQuery {
            engine: self.engine.clone(),
            option: QueryOption::Get {
                collection_name: self.name.clone(),
                key: key.into(),
            },
        }
    }

    pub fn get_all(&self, filter: Option<Condition>) -> CollectionQuery {
        CollectionQuery {
            engine: self.engine.clone(),
            option: QueryOption::GetAll {
                collection_name: self.name.clone(),
                filter,
            },
        }
    }
}

/// A single-document query: one-shot execution or a live subscription.
pub struct DocumentQuery {
    engine: Arc<QueryEngine>,
    option: QueryOption,
}

impl DocumentQuery {
    pub async fn execute(&self) -> Result<Option<Value>, TidedbError> {
        match self.engine.read(self.option.clone()).await {
            Ok(QueryData::Document(value)) => Ok(value),
            Ok(QueryData::Collection(_)) => Err(TidedbError::Storage(
                "document query resolved to a collection result".into(),
            )),
            Err(message) => Err(TidedbError::Storage(message)),
        }
    }

    /// Live subscription; the callback receives the current document on
    /// every change (and immediately, once the initial read resolves).
    pub fn subscribe(
        &self,
        callback: impl Fn(Option<&Value>) + Send + Sync + 'static,
    ) -> Subscription {
        let query = self.engine.query(self.option.clone());
        query.subscribe(move |notification: &QueryNotification| {
            if let QueryData::Document(value) = &notification.data {
                callback(value.as_ref());
            }
        })
    }
}

/// A collection query: one-shot execution, full-data subscription, or an
/// incremental change watch.
pub struct CollectionQuery {
    engine: Arc<QueryEngine>,
    option: QueryOption,
}

impl CollectionQuery {
    pub async fn execute(&self) -> Result<Vec<Row>, TidedbError> {
        match self.engine.read(self.option.clone()).await {
            Ok(data) => data.collection_rows().ok_or_else(|| {
                TidedbError::Storage("collection query resolved to a document result".into())
            }),
            Err(message) => Err(TidedbError::Storage(message)),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&[Row]) + Send + Sync + 'static) -> Subscription {
        let query = self.engine.query(self.option.clone());
        query.subscribe(move |notification: &QueryNotification| {
            if let Some(rows) = notification.data.collection_rows() {
                callback(&rows);
            }
        })
    }

    /// Incremental change lists only, without the full data.
    pub fn watch(
        &self,
        callback: impl Fn(&[QueryResultChange]) + Send + Sync + 'static,
    ) -> Subscription {
        let query = self.engine.query(self.option.clone());
        query.watch(move |changes: &Vec<QueryResultChange>| callback(changes))
    }
}
