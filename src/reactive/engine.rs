use crate::overlay::OverlayTransaction;
use crate::overlay::cdc::CdcEvent;
use crate::reactive::query::{QueryData, QueryOption, ReactiveQuery};
use crate::storage::memory::MemoryStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

type ReadWaiter = oneshot::Sender<Result<QueryData, String>>;

struct BatchEntry {
    option: QueryOption,
    queries: Vec<Arc<ReactiveQuery>>,
    waiters: Vec<ReadWaiter>,
}

struct BatchState {
    entries: HashMap<String, BatchEntry>,
    scheduled: bool,
}

/// Deduplicating query cache plus the micro-batched read scheduler.
///
/// Every distinct option is backed by exactly one [`ReactiveQuery`].
/// Initial reads queue up; after the batch window a single read-only
/// overlay transaction services every queued entry, so N concurrent
/// subscribers to the same option cost one store read.
pub struct QueryEngine {
    store: Arc<MemoryStore>,
    window: Duration,
    queries: Mutex<HashMap<String, Arc<ReactiveQuery>>>,
    batch: Mutex<BatchState>,
}

impl QueryEngine {
    pub fn new(store: Arc<MemoryStore>, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            window,
            queries: Mutex::new(HashMap::new()),
            batch: Mutex::new(BatchState {
                entries: HashMap::new(),
                scheduled: false,
            }),
        })
    }

    /// The live query for an option, creating and scheduling its initial
    /// read on first use.
    pub fn query(self: &Arc<Self>, option: QueryOption) -> Arc<ReactiveQuery> {
        let key = option.cache_key();
        if let Some(existing) = self.queries.lock().get(&key) {
            return existing.clone();
        }
        let query = Arc::new(ReactiveQuery::new(option.clone()));
        // Double-checked under the lock: a racing caller may have won.
        let query = {
            let mut queries = self.queries.lock();
            queries.entry(key).or_insert_with(|| query.clone()).clone()
        };
        self.enqueue(option, Some(query.clone()), None);
        query
    }

    /// One-shot read through the same batched scheduler.
    pub async fn read(self: &Arc<Self>, option: QueryOption) -> Result<QueryData, String> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(option, None, Some(tx));
        rx.await
            .map_err(|_| "batched read dropped before resolving".to_string())?
    }

    fn enqueue(
        self: &Arc<Self>,
        option: QueryOption,
        query: Option<Arc<ReactiveQuery>>,
        waiter: Option<ReadWaiter>,
    ) {
        let mut batch = self.batch.lock();
        let entry = batch
            .entries
            .entry(option.cache_key())
            .or_insert_with(|| BatchEntry {
                option,
                queries: Vec::new(),
                waiters: Vec::new(),
            });
        if let Some(query) = query {
            entry.queries.push(query);
        }
        if let Some(waiter) = waiter {
            entry.waiters.push(waiter);
        }
        if !batch.scheduled {
            batch.scheduled = true;
            let engine = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(engine.window).await;
                engine.drain();
            });
        }
    }

    fn drain(self: &Arc<Self>) {
        let entries: Vec<BatchEntry> = {
            let mut batch = self.batch.lock();
            batch.scheduled = false;
            batch.entries.drain().map(|(_, entry)| entry).collect()
        };
        if entries.is_empty() {
            return;
        }
        debug!(reads = entries.len(), "draining batched initial reads");
        let tx = OverlayTransaction::read(self.store.clone());
        for entry in entries {
            let result = Self::execute(&tx, &entry.option);
            for query in entry.queries {
                match &result {
                    Ok(data) => query.resolve_initial(data.clone()),
                    Err(message) => query.resolve_error(message.clone()),
                }
            }
            for waiter in entry.waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }

    fn execute(tx: &OverlayTransaction, option: &QueryOption) -> Result<QueryData, String> {
        match option {
            QueryOption::Get {
                collection_name,
                key,
            } => tx
                .query_by_key(collection_name, key)
                .map(QueryData::Document)
                .map_err(|e| e.to_string()),
            QueryOption::GetAll {
                collection_name,
                filter,
            } => {
                let rows = match filter {
                    Some(condition) => tx.query_by_condition(collection_name, condition),
                    None => tx.query_all(collection_name),
                };
                rows.map(|rows| {
                    QueryData::Collection(rows.into_iter().map(|r| (r.key, r.value)).collect())
                })
                .map_err(|e| e.to_string())
            }
        }
    }

    /// Fan a committed batch of CDC events out to every affected query.
    pub fn dispatch(&self, events: &[CdcEvent]) {
        if events.is_empty() {
            return;
        }
        let queries: Vec<Arc<ReactiveQuery>> = self.queries.lock().values().cloned().collect();
        for query in queries {
            query.apply_cdc(events);
        }
    }

    pub fn cached_query_count(&self) -> usize {
        self.queries.lock().len()
    }
}
