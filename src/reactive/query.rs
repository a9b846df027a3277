use crate::canon::hash_object;
use crate::condition::Condition;
use crate::merge::merge_delta;
use crate::overlay::cdc::CdcEvent;
use crate::reactive::subscription::{SubscriberSet, Subscription};
use crate::types::{Key, Row};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Identity of a live query: a single-document lookup or a collection
/// scan with an optional single-field filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum QueryOption {
    Get {
        collection_name: String,
        key: Key,
    },
    GetAll {
        collection_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filter: Option<Condition>,
    },
}

impl QueryOption {
    pub fn collection_name(&self) -> &str {
        match self {
            QueryOption::Get {
                collection_name, ..
            }
            | QueryOption::GetAll {
                collection_name, ..
            } => collection_name,
        }
    }

    /// Canonical cache key; structurally equal options collide, key order
    /// never matters.
    pub fn cache_key(&self) -> String {
        let value = serde_json::to_value(self).expect("query option serializes infallibly");
        hash_object(&value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Idle,
    Reading,
    Success,
    Error,
}

/// Cached result shape: one document or an ordered collection view.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryData {
    Document(Option<Value>),
    Collection(BTreeMap<Key, Value>),
}

impl QueryData {
    /// Collection results as ordered rows; a document result has no row
    /// representation.
    pub fn collection_rows(&self) -> Option<Vec<Row>> {
        match self {
            QueryData::Document(_) => None,
            QueryData::Collection(map) => Some(
                map.iter()
                    .map(|(k, v)| Row::new(k.clone(), v.clone()))
                    .collect(),
            ),
        }
    }
}

/// One incremental step applied to a cached result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryResultChange {
    Insert { key: Key, value: Value },
    Update { key: Key, value: Value },
    Delete { key: Key },
}

/// Payload published to full-data subscribers: the entire cached result
/// plus the incremental changes since the previous notification.
#[derive(Debug, Clone)]
pub struct QueryNotification {
    pub data: QueryData,
    pub changes: Vec<QueryResultChange>,
}

struct QueryInner {
    state: QueryState,
    data: QueryData,
    buffered: Vec<CdcEvent>,
    error: Option<String>,
}

/// A live query: cached result, subscriber set, and the incremental
/// CDC-apply that keeps the cache equal to a from-scratch recompute.
pub struct ReactiveQuery {
    option: QueryOption,
    inner: Mutex<QueryInner>,
    subscribers: SubscriberSet<QueryNotification>,
    watchers: SubscriberSet<Vec<QueryResultChange>>,
}

impl ReactiveQuery {
    /// A fresh query is immediately scheduled for its initial read, so it
    /// is born `Reading`; CDC arriving before the read resolves buffers.
    pub fn new(option: QueryOption) -> Self {
        let data = match &option {
            QueryOption::Get { .. } => QueryData::Document(None),
            QueryOption::GetAll { .. } => QueryData::Collection(BTreeMap::new()),
        };
        Self {
            option,
            inner: Mutex::new(QueryInner {
                state: QueryState::Reading,
                data,
                buffered: Vec::new(),
                error: None,
            }),
            subscribers: SubscriberSet::new(),
            watchers: SubscriberSet::new(),
        }
    }

    pub fn option(&self) -> &QueryOption {
        &self.option
    }

    pub fn state(&self) -> QueryState {
        self.inner.lock().state
    }

    pub fn error(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    pub fn snapshot(&self) -> QueryData {
        self.inner.lock().data.clone()
    }

    /// Register for full-data notifications. A query that already resolved
    /// delivers its current snapshot right away.
    pub fn subscribe(
        &self,
        callback: impl Fn(&QueryNotification) + Send + Sync + 'static,
    ) -> Subscription {
        let current = {
            let inner = self.inner.lock();
            (inner.state == QueryState::Success).then(|| inner.data.clone())
        };
        if let Some(data) = current {
            callback(&QueryNotification {
                data,
                changes: Vec::new(),
            });
        }
        self.subscribers.subscribe(callback)
    }

    /// Register for incremental change lists only.
    pub fn watch(
        &self,
        callback: impl Fn(&Vec<QueryResultChange>) + Send + Sync + 'static,
    ) -> Subscription {
        self.watchers.subscribe(callback)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len() + self.watchers.len()
    }

    /// Resolve the initial read. Publishes the full data once, then drains
    /// any CDC buffered while the read was in flight through the normal
    /// incremental path.
    pub fn resolve_initial(&self, data: QueryData) {
        let buffered = {
            let mut inner = self.inner.lock();
            if inner.state != QueryState::Reading {
                warn!(option = ?self.option, "initial read resolved twice, ignoring");
                return;
            }
            inner.state = QueryState::Success;
            inner.data = data.clone();
            std::mem::take(&mut inner.buffered)
        };
        self.subscribers.notify_all(&QueryNotification {
            data,
            changes: Vec::new(),
        });
        if !buffered.is_empty() {
            self.apply_cdc(&buffered);
        }
    }

    pub fn resolve_error(&self, message: String) {
        let mut inner = self.inner.lock();
        warn!(option = ?self.option, error = %message, "initial query read failed");
        inner.state = QueryState::Error;
        inner.error = Some(message);
    }

    /// Whether an event can change this query's result, given the current
    /// cache. Events for keys already cached always affect: an update can
    /// move a row out of a filtered set.
    fn affects(option: &QueryOption, data: &QueryData, event: &CdcEvent) -> bool {
        if event.collection_name() != option.collection_name() {
            return false;
        }
        if matches!(event, CdcEvent::Clear { .. }) {
            return true;
        }
        match option {
            QueryOption::Get { key, .. } => event.key() == Some(key),
            QueryOption::GetAll { filter: None, .. } => true,
            QueryOption::GetAll {
                filter: Some(condition),
                ..
            } => {
                let cached = match (data, event.key()) {
                    (QueryData::Collection(map), Some(key)) => map.contains_key(key),
                    _ => false,
                };
                cached
                    || match event {
                        CdcEvent::Insert { value, .. } | CdcEvent::Delete { value, .. } => {
                            condition.satisfies(value)
                        }
                        CdcEvent::Update {
                            post_update_value, ..
                        } => condition.satisfies(post_update_value),
                        CdcEvent::Clear { .. } => true,
                    }
            }
        }
    }

    /// Apply a batch of CDC events. Publishes a single notification with
    /// the accumulated change list when anything moved.
    pub fn apply_cdc(&self, events: &[CdcEvent]) {
        let notification = {
            let mut inner = self.inner.lock();
            match inner.state {
                QueryState::Reading => {
                    inner.buffered.extend(events.iter().cloned());
                    return;
                }
                QueryState::Idle => {
                    warn!(option = ?self.option, "CDC delivered while query is idle, suppressing");
                    return;
                }
                QueryState::Error => return,
                QueryState::Success => {}
            }
            let mut changes = Vec::new();
            for event in events {
                if !Self::affects(&self.option, &inner.data, event) {
                    continue;
                }
                Self::apply_event(&self.option, &mut inner.data, event, &mut changes);
            }
            if changes.is_empty() {
                return;
            }
            QueryNotification {
                data: inner.data.clone(),
                changes,
            }
        };
        self.watchers.notify_all(&notification.changes);
        self.subscribers.notify_all(&notification);
    }

    fn apply_event(
        option: &QueryOption,
        data: &mut QueryData,
        event: &CdcEvent,
        changes: &mut Vec<QueryResultChange>,
    ) {
        match data {
            QueryData::Document(current) => match event {
                CdcEvent::Clear { .. } | CdcEvent::Delete { .. } => {
                    if current.take().is_some() {
                        let key = match option {
                            QueryOption::Get { key, .. } => key.clone(),
                            QueryOption::GetAll { .. } => return,
                        };
                        changes.push(QueryResultChange::Delete { key });
                    }
                }
                CdcEvent::Insert { key, value, .. } => {
                    *current = Some(value.clone());
                    changes.push(QueryResultChange::Insert {
                        key: key.clone(),
                        value: value.clone(),
                    });
                }
                CdcEvent::Update { key, delta, .. } => {
                    if let Some(base) = current.as_ref() {
                        let post = merge_delta(base, delta);
                        *current = Some(post.clone());
                        changes.push(QueryResultChange::Update {
                            key: key.clone(),
                            value: post,
                        });
                    }
                }
            },
            QueryData::Collection(map) => {
                let filter = match option {
                    QueryOption::GetAll { filter, .. } => filter.as_ref(),
                    QueryOption::Get { .. } => None,
                };
                match event {
                    CdcEvent::Clear { .. } => {
                        for key in std::mem::take(map).into_keys() {
                            changes.push(QueryResultChange::Delete { key });
                        }
                    }
                    CdcEvent::Insert { key, value, .. } => {
                        if filter.is_none_or(|c| c.satisfies(value)) {
                            map.insert(key.clone(), value.clone());
                            changes.push(QueryResultChange::Insert {
                                key: key.clone(),
                                value: value.clone(),
                            });
                        } else if map.remove(key).is_some() {
                            changes.push(QueryResultChange::Delete { key: key.clone() });
                        }
                    }
                    CdcEvent::Delete { key, .. } => {
                        if map.remove(key).is_some() {
                            changes.push(QueryResultChange::Delete { key: key.clone() });
                        }
                    }
                    CdcEvent::Update {
                        key,
                        post_update_value,
                        delta,
                        ..
                    } => {
                        let post = match map.get(key) {
                            Some(base) => merge_delta(base, delta),
                            None => post_update_value.clone(),
                        };
                        let matches = filter.is_none_or(|c| c.satisfies(&post));
                        let was_cached = map.contains_key(key);
                        if matches {
                            map.insert(key.clone(), post.clone());
                            changes.push(if was_cached {
                                QueryResultChange::Update {
                                    key: key.clone(),
                                    value: post,
                                }
                            } else {
                                QueryResultChange::Insert {
                                    key: key.clone(),
                                    value: post,
                                }
                            });
                        } else if was_cached {
                            map.remove(key);
                            changes.push(QueryResultChange::Delete { key: key.clone() });
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Comparator;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn get_all(filter: Option<Condition>) -> QueryOption {
        QueryOption::GetAll {
            collection_name: "todo".into(),
            filter,
        }
    }

    fn insert_event(key: &str, value: Value) -> CdcEvent {
        CdcEvent::Insert {
            collection_name: "todo".into(),
            key: Key::from(key),
            value,
        }
    }

    fn update_event(key: &str, pre: Value, delta: Value) -> CdcEvent {
        let post = merge_delta(&pre, &delta);
        CdcEvent::Update {
            collection_name: "todo".into(),
            key: Key::from(key),
            pre_update_value: pre,
            post_update_value: post,
            delta,
        }
    }

    #[test]
    fn cache_keys_are_key_order_independent_and_distinct() {
        let a = get_all(Some(Condition::new("status", Comparator::Eq, "open")));
        let b = get_all(Some(Condition::new("status", Comparator::Eq, "open")));
        let c = get_all(None);
        assert_eq!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), c.cache_key());
        assert_ne!(
            QueryOption::Get {
                collection_name: "todo".into(),
                key: Key::from("k1")
            }
            .cache_key(),
            c.cache_key()
        );
    }

    #[test]
    fn events_buffered_while_reading_drain_after_initial() {
        let query = ReactiveQuery::new(get_all(None));
        query.apply_cdc(&[insert_event("k2", json!({"n": 2}))]);

        let notifications = Arc::new(AtomicUsize::new(0));
        let seen = notifications.clone();
        let _sub = query.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let mut initial = BTreeMap::new();
        initial.insert(Key::from("k1"), json!({"n": 1}));
        query.resolve_initial(QueryData::Collection(initial));

        // One notification for the initial data, one for the drained buffer.
        assert_eq!(notifications.load(Ordering::SeqCst), 2);
        match query.snapshot() {
            QueryData::Collection(map) => {
                assert_eq!(map.len(), 2);
                assert_eq!(map[&Key::from("k2")], json!({"n": 2}));
            }
            other => panic!("expected collection, got {other:?}"),
        }
    }

    #[test]
    fn filtered_query_tracks_rows_entering_and_leaving_the_set() {
        let query = ReactiveQuery::new(get_all(Some(Condition::new(
            "status",
            Comparator::Eq,
            "open",
        ))));
        query.resolve_initial(QueryData::Collection(BTreeMap::new()));

        // Row enters via update even though it was never cached.
        query.apply_cdc(&[update_event(
            "k1",
            json!({"status": "done"}),
            json!({"status": "open"}),
        )]);
        match query.snapshot() {
            QueryData::Collection(map) => assert!(map.contains_key(&Key::from("k1"))),
            _ => unreachable!(),
        }

        // Row leaves when the update stops matching.
        query.apply_cdc(&[update_event(
            "k1",
            json!({"status": "open"}),
            json!({"status": "done"}),
        )]);
        match query.snapshot() {
            QueryData::Collection(map) => assert!(map.is_empty()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn clear_empties_the_cache_and_emits_deletes() {
        let query = ReactiveQuery::new(get_all(None));
        let mut initial = BTreeMap::new();
        initial.insert(Key::from("a"), json!({}));
        initial.insert(Key::from("b"), json!({}));
        query.resolve_initial(QueryData::Collection(initial));

        let seen: Arc<Mutex<Vec<QueryResultChange>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _watch = query.watch(move |changes| {
            sink.lock().extend(changes.iter().cloned());
        });

        query.apply_cdc(&[CdcEvent::Clear {
            collection_name: "todo".into(),
        }]);
        let changes = seen.lock().clone();
        assert_eq!(changes.len(), 2);
        assert!(changes
            .iter()
            .all(|c| matches!(c, QueryResultChange::Delete { .. })));
    }

    #[test]
    fn document_query_ignores_other_keys() {
        let query = ReactiveQuery::new(QueryOption::Get {
            collection_name: "todo".into(),
            key: Key::from("k1"),
        });
        query.resolve_initial(QueryData::Document(Some(json!({"n": 1}))));
        query.apply_cdc(&[insert_event("k2", json!({"n": 2}))]);
        assert_eq!(query.snapshot(), QueryData::Document(Some(json!({"n": 1}))));

        query.apply_cdc(&[update_event("k1", json!({"n": 1}), json!({"n": 3}))]);
        assert_eq!(query.snapshot(), QueryData::Document(Some(json!({"n": 3}))));
    }

    #[test]
    fn wrong_collection_never_affects() {
        let query = ReactiveQuery::new(get_all(None));
        query.resolve_initial(QueryData::Collection(BTreeMap::new()));
        query.apply_cdc(&[CdcEvent::Insert {
            collection_name: "other".into(),
            key: Key::from("k"),
            value: json!({}),
        }]);
        assert_eq!(query.snapshot(), QueryData::Collection(BTreeMap::new()));
    }
}
