pub mod cdc;
pub mod pending;

use crate::condition::Condition;
use crate::error::TidedbError;
use crate::merge::merge_delta;
use crate::overlay::cdc::{
    CdcEvent, derive_clear, derive_delete, derive_gc_change, derive_insert, derive_update,
};
use crate::overlay::pending::{
    MutationRow, PendingChange, PendingDocumentState, PendingStateMap, build_pending_state,
    fold_into,
};
use crate::storage::kv::{KvTransaction, TxMode};
use crate::storage::memory::{MUTATIONS_COLLECTION, META_COLLECTION, MemoryStore, is_internal_collection};
use crate::types::{Key, Row};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

type OverlayCompletionHook = Box<dyn FnOnce(&[CdcEvent]) + Send>;

struct OverlayState {
    pending: Option<PendingStateMap>,
    events: Vec<CdcEvent>,
    complete_hooks: Vec<OverlayCompletionHook>,
}

/// Transaction whose reads return documents as the user sees them: the
/// authoritative base merged with every completed pending mutation.
/// Writes derive the effective CDC events describing the transition from
/// the subscriber's current view, buffered until commit.
///
/// Two write tracks exist. Optimistic writes (`record_*`) only append to
/// the mutation log; the base tier is untouched and the overlay makes the
/// effect visible. Authoritative writes (`*_authoritative`, used by the
/// pull and GC paths) hit the base tier directly and correct their CDC for
/// whatever the overlay already showed.
pub struct OverlayTransaction {
    kv: KvTransaction,
    state: Mutex<OverlayState>,
}

impl OverlayTransaction {
    pub fn read(store: Arc<MemoryStore>) -> Self {
        Self::wrap(KvTransaction::read(store))
    }

    pub async fn write(store: Arc<MemoryStore>) -> Self {
        Self::wrap(KvTransaction::write(store).await)
    }

    fn wrap(kv: KvTransaction) -> Self {
        Self {
            kv,
            state: Mutex::new(OverlayState {
                pending: None,
                events: Vec::new(),
                complete_hooks: Vec::new(),
            }),
        }
    }

    pub fn mode(&self) -> TxMode {
        self.kv.mode()
    }

    pub fn is_active(&self) -> bool {
        self.kv.is_active()
    }

    pub fn on_complete(&self, hook: impl FnOnce(&[CdcEvent]) + Send + 'static) {
        self.state.lock().complete_hooks.push(Box::new(hook));
    }

    fn buffer(&self, event: Option<CdcEvent>) {
        if let Some(event) = event {
            self.state.lock().events.push(event);
        }
    }

    // ----- mutation log plumbing -------------------------------------

    fn encode_mutation(row: &MutationRow) -> Result<Value, TidedbError> {
        serde_json::to_value(row).map_err(|e| TidedbError::Encode(e.to_string()))
    }

    fn load_mutation_rows(&self) -> Result<Vec<MutationRow>, TidedbError> {
        self.kv
            .query_all(MUTATIONS_COLLECTION)?
            .into_iter()
            .map(|row| serde_json::from_value(row.value).map_err(TidedbError::from))
            .collect()
    }

    pub fn read_mutation(&self, id: i64) -> Result<Option<MutationRow>, TidedbError> {
        self.kv
            .query_by_key(MUTATIONS_COLLECTION, &Key::Integer(id))?
            .map(|value| serde_json::from_value(value).map_err(TidedbError::from))
            .transpose()
    }

    pub fn write_mutation(&self, row: &MutationRow) -> Result<(), TidedbError> {
        self.kv.upsert(
            MUTATIONS_COLLECTION,
            &Key::Integer(row.id),
            &Self::encode_mutation(row)?,
        )
    }

    /// Open a new mutation row, returning its log-assigned id. The row
    /// stays `is_completed = false` (invisible to the overlay) until the
    /// mutation body finishes.
    pub fn allocate_mutation(&self, name: &str, args: Value) -> Result<i64, TidedbError> {
        let mut row = MutationRow::new(0, name, args);
        let key = self
            .kv
            .insert_auto(MUTATIONS_COLLECTION, &Self::encode_mutation(&row)?)?;
        let Key::Integer(id) = key else {
            return Err(TidedbError::Storage(
                "mutation log assigned a non-integer key".into(),
            ));
        };
        row.id = id;
        self.kv
            .update(MUTATIONS_COLLECTION, &key, &Self::encode_mutation(&row)?)?;
        Ok(id)
    }

    pub fn complete_mutation(&self, id: i64, local_result: Value) -> Result<(), TidedbError> {
        let mut row = self
            .read_mutation(id)?
            .ok_or(TidedbError::MutationNotFound { id })?;
        row.is_completed = true;
        row.local_resolver_result = local_result;
        self.write_mutation(&row)
    }

    pub fn completed_mutation_count(&self) -> Result<usize, TidedbError> {
        Ok(self
            .load_mutation_rows()?
            .iter()
            .filter(|r| r.is_completed)
            .count())
    }

    pub fn completed_mutations(&self) -> Result<Vec<MutationRow>, TidedbError> {
        let mut rows: Vec<MutationRow> = self
            .load_mutation_rows()?
            .into_iter()
            .filter(|r| r.is_completed)
            .collect();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    // ----- overlay state ---------------------------------------------

    fn with_pending<R>(
        &self,
        f: impl FnOnce(&PendingStateMap) -> R,
    ) -> Result<R, TidedbError> {
        {
            let state = self.state.lock();
            if let Some(map) = &state.pending {
                return Ok(f(map));
            }
        }
        // Built outside the state lock; the kv snapshot cannot change
        // underneath an open transaction.
        let rows = self.load_mutation_rows()?;
        let built = build_pending_state(&rows);
        let mut state = self.state.lock();
        let map = state.pending.get_or_insert(built);
        Ok(f(map))
    }

    fn pending_state(
        &self,
        collection: &str,
        key: &Key,
    ) -> Result<Option<PendingDocumentState>, TidedbError> {
        self.with_pending(|map| map.get(collection).and_then(|m| m.get(key)).cloned())
    }

    fn pending_collection(
        &self,
        collection: &str,
    ) -> Result<BTreeMap<Key, PendingDocumentState>, TidedbError> {
        self.with_pending(|map| map.get(collection).cloned().unwrap_or_default())
    }

    // ----- reads -----------------------------------------------------

    pub fn query_by_key(&self, collection: &str, key: &Key) -> Result<Option<Value>, TidedbError> {
        let base = self.kv.query_by_key(collection, key)?;
        if is_internal_collection(collection) {
            return Ok(base);
        }
        let pending = self.pending_state(collection, key)?;
        Ok(match pending {
            None => base,
            Some(PendingDocumentState::Inserted { value })
            | Some(PendingDocumentState::UpdatePostInsert {
                post_update_value: value,
                ..
            }) => Some(value),
            Some(PendingDocumentState::Deleted { .. }) => None,
            Some(PendingDocumentState::Updated { delta, .. }) => {
                base.map(|b| merge_delta(&b, &delta))
            }
        })
    }

    pub fn query_all(&self, collection: &str) -> Result<Vec<Row>, TidedbError> {
        let base = self.kv.query_all(collection)?;
        if is_internal_collection(collection) {
            return Ok(base);
        }
        let mut result: BTreeMap<Key, Value> =
            base.into_iter().map(|r| (r.key, r.value)).collect();
        for (key, state) in self.pending_collection(collection)? {
            match state {
                PendingDocumentState::Inserted { value }
                | PendingDocumentState::UpdatePostInsert {
                    post_update_value: value,
                    ..
                } => {
                    result.insert(key, value);
                }
                PendingDocumentState::Deleted { .. } => {
                    result.remove(&key);
                }
                PendingDocumentState::Updated { delta, .. } => {
                    if let Some(base_value) = result.get(&key) {
                        let merged = merge_delta(base_value, &delta);
                        result.insert(key, merged);
                    }
                }
            }
        }
        Ok(result.into_iter().map(|(k, v)| Row::new(k, v)).collect())
    }

    /// Condition read through the overlay. A pending UPDATE may move a
    /// previously-non-matching row into the match set, so UPDATED entries
    /// absent from the base result fetch their base row by key before
    /// merging. A DELETED entry removes its key from the returned set iff
    /// the key is present in it; deletions are never synthesized for rows
    /// that were never in scope.
    pub fn query_by_condition(
        &self,
        collection: &str,
        condition: &Condition,
    ) -> Result<Vec<Row>, TidedbError> {
        let base = self.kv.query_by_condition(collection, condition)?;
        if is_internal_collection(collection) {
            return Ok(base);
        }
        let mut result: BTreeMap<Key, Value> =
            base.into_iter().map(|r| (r.key, r.value)).collect();
        for (key, state) in self.pending_collection(collection)? {
            match state {
                PendingDocumentState::Inserted { value }
                | PendingDocumentState::UpdatePostInsert {
                    post_update_value: value,
                    ..
                } => {
                    if condition.satisfies(&value) {
                        result.insert(key, value);
                    } else {
                        result.remove(&key);
                    }
                }
                PendingDocumentState::Deleted { .. } => {
                    result.remove(&key);
                }
                PendingDocumentState::Updated { delta, .. } => {
                    let base_value = match result.get(&key) {
                        Some(v) => Some(v.clone()),
                        None => self.kv.query_by_key(collection, &key)?,
                    };
                    if let Some(base_value) = base_value {
                        let effective = merge_delta(&base_value, &delta);
                        if condition.satisfies(&effective) {
                            result.insert(key, effective);
                        } else {
                            result.remove(&key);
                        }
                    }
                }
            }
        }
        Ok(result.into_iter().map(|(k, v)| Row::new(k, v)).collect())
    }

    // ----- optimistic writes (mutation recording) --------------------

    fn append_change(&self, mutation_id: i64, change: PendingChange) -> Result<(), TidedbError> {
        let mut row = self
            .read_mutation(mutation_id)?
            .ok_or(TidedbError::MutationNotFound { id: mutation_id })?;
        row.collections_affected
            .insert(change.collection_name().to_string());
        row.changes.push(change.clone());
        self.write_mutation(&row)?;
        // The map was built by the preceding overlay read; keep it in sync
        // so later reads in this transaction see this change.
        let mut state = self.state.lock();
        if let Some(map) = &mut state.pending {
            fold_into(map, &change);
        }
        Ok(())
    }

    pub fn record_insert(
        &self,
        mutation_id: i64,
        collection: &str,
        key: &Key,
        value: &Value,
    ) -> Result<(), TidedbError> {
        if self.query_by_key(collection, key)?.is_some() {
            return Err(TidedbError::DuplicateKey {
                collection: collection.to_string(),
                key: key.clone(),
            });
        }
        let pending = self.pending_state(collection, key)?;
        let ts = crate::clock::incrementing_timestamp();
        let change = PendingChange::Insert {
            id: PendingChange::change_id(mutation_id, ts),
            timestamp: ts,
            collection_name: collection.to_string(),
            key: key.clone(),
            value: value.clone(),
        };
        let event = derive_insert(collection, key, value, pending.as_ref(), false);
        self.append_change(mutation_id, change)?;
        self.buffer(event);
        Ok(())
    }

    /// Record an optimistic partial update; returns the post-update value
    /// visible through the overlay.
    pub fn record_update(
        &self,
        mutation_id: i64,
        collection: &str,
        key: &Key,
        delta: &Value,
    ) -> Result<Value, TidedbError> {
        let visible =
            self.query_by_key(collection, key)?
                .ok_or_else(|| TidedbError::DocumentNotFound {
                    collection: collection.to_string(),
                    key: key.clone(),
                })?;
        let pending = self.pending_state(collection, key)?;
        let post = merge_delta(&visible, delta);
        let ts = crate::clock::incrementing_timestamp();
        let change = PendingChange::Update {
            id: PendingChange::change_id(mutation_id, ts),
            timestamp: ts,
            collection_name: collection.to_string(),
            key: key.clone(),
            pre_update_value: visible.clone(),
            post_update_value: post.clone(),
            delta: delta.clone(),
        };
        let event = derive_update(
            collection,
            key,
            &visible,
            &post,
            delta,
            pending.as_ref(),
            false,
        );
        self.append_change(mutation_id, change)?;
        self.buffer(event);
        Ok(post)
    }

    pub fn record_delete(
        &self,
        mutation_id: i64,
        collection: &str,
        key: &Key,
    ) -> Result<(), TidedbError> {
        let visible =
            self.query_by_key(collection, key)?
                .ok_or_else(|| TidedbError::DocumentNotFound {
                    collection: collection.to_string(),
                    key: key.clone(),
                })?;
        let pending = self.pending_state(collection, key)?;
        let ts = crate::clock::incrementing_timestamp();
        let change = PendingChange::Delete {
            id: PendingChange::change_id(mutation_id, ts),
            timestamp: ts,
            collection_name: collection.to_string(),
            key: key.clone(),
            value: visible.clone(),
        };
        let event = derive_delete(collection, key, &visible, pending.as_ref(), false);
        self.append_change(mutation_id, change)?;
        self.buffer(event);
        Ok(())
    }

    // ----- authoritative writes (pull / GC) --------------------------

    /// Server-wins upsert straight into the base tier. The CDC corrects
    /// for any optimistic overlay masking the key.
    pub fn upsert_authoritative(
        &self,
        collection: &str,
        key: &Key,
        value: &Value,
    ) -> Result<(), TidedbError> {
        let pending = self.pending_state(collection, key)?;
        let base = self.kv.query_by_key(collection, key)?;
        let event = match &base {
            None => derive_insert(collection, key, value, pending.as_ref(), true),
            Some(previous) => derive_update(
                collection,
                key,
                previous,
                value,
                value,
                pending.as_ref(),
                true,
            ),
        };
        self.kv.upsert(collection, key, value)?;
        self.buffer(event);
        Ok(())
    }

    pub fn delete_authoritative(&self, collection: &str, key: &Key) -> Result<(), TidedbError> {
        let Some(previous) = self.kv.query_by_key(collection, key)? else {
            return Ok(());
        };
        let pending = self.pending_state(collection, key)?;
        let event = derive_delete(collection, key, &previous, pending.as_ref(), true);
        self.kv.delete(collection, key)?;
        self.buffer(event);
        Ok(())
    }

    pub fn clear_authoritative(&self, collection: &str) -> Result<(), TidedbError> {
        self.kv.clear(collection)?;
        self.buffer(Some(derive_clear(collection)));
        Ok(())
    }

    // ----- mutation GC -----------------------------------------------

    /// Delete a mutation row from the log, emitting the inverting CDC
    /// events that carry subscribers from the row's optimistic effect to
    /// the present authoritative state.
    pub fn delete_mutation_row(&self, id: i64) -> Result<(), TidedbError> {
        let Some(row) = self.read_mutation(id)? else {
            warn!(mutation_id = id, "mutation row already gone, skipping GC");
            return Ok(());
        };
        self.kv.delete(MUTATIONS_COLLECTION, &Key::Integer(id))?;
        let rebuilt = build_pending_state(&self.load_mutation_rows()?);
        for change in &row.changes {
            let authoritative = self
                .kv
                .query_by_key(change.collection_name(), change.key())?;
            let pending_after = rebuilt
                .get(change.collection_name())
                .and_then(|m| m.get(change.key()));
            let event = derive_gc_change(change, authoritative.as_ref(), pending_after);
            self.buffer(event);
        }
        self.state.lock().pending = Some(rebuilt);
        Ok(())
    }

    /// Push path for mutations without a remote resolver: their recorded
    /// changes become authoritative as-is, then the row is purged. The
    /// re-applies emit no CDC of their own; the GC events from the purge
    /// describe the (usually empty) visible transition.
    pub fn purge_and_apply_mutation(&self, id: i64) -> Result<(), TidedbError> {
        let Some(row) = self.read_mutation(id)? else {
            return Ok(());
        };
        for change in &row.changes {
            match change {
                PendingChange::Insert {
                    collection_name,
                    key,
                    value,
                    ..
                } => {
                    self.kv.upsert(collection_name, key, value)?;
                }
                PendingChange::Update {
                    collection_name,
                    key,
                    delta,
                    ..
                } => match self.kv.query_by_key(collection_name, key)? {
                    Some(base) => {
                        self.kv
                            .upsert(collection_name, key, &merge_delta(&base, delta))?;
                    }
                    None => {
                        warn!(
                            collection = %collection_name,
                            %key,
                            "re-applying update over a missing base row, skipping"
                        );
                    }
                },
                PendingChange::Delete {
                    collection_name,
                    key,
                    ..
                } => {
                    self.kv.delete(collection_name, key)?;
                }
            }
        }
        self.delete_mutation_row(id)
    }

    // ----- meta ------------------------------------------------------

    pub fn meta_get(&self, key: &str) -> Result<Option<Value>, TidedbError> {
        self.kv.query_by_key(META_COLLECTION, &Key::from(key))
    }

    pub fn meta_put(&self, key: &str, value: &Value) -> Result<(), TidedbError> {
        self.kv.upsert(META_COLLECTION, &Key::from(key), value)
    }

    // ----- lifecycle -------------------------------------------------

    /// Install the staged writes and return the buffered CDC events.
    /// Completion hooks fire only once the commit is durable.
    pub fn commit(self) -> Result<Vec<CdcEvent>, TidedbError> {
        let mut state = self.state.into_inner();
        self.kv.commit()?;
        for hook in state.complete_hooks.drain(..) {
            hook(&state.events);
        }
        Ok(state.events)
    }

    /// Abort the transaction; all buffered CDC events are suppressed.
    pub fn rollback(self) {
        self.kv.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::{CollectionSpec, IndexSpec};
    use crate::condition::Comparator;
    use serde_json::json;

    fn store() -> Arc<MemoryStore> {
        MemoryStore::new(vec![
            CollectionSpec::new("todo").with_index(IndexSpec::new("status")),
        ])
    }

    async fn seed(store: &Arc<MemoryStore>, rows: &[(&str, Value)]) {
        let tx = KvTransaction::write(store.clone()).await;
        for (key, value) in rows {
            tx.insert("todo", &Key::from(*key), value).unwrap();
        }
        tx.commit().unwrap();
    }

    /// Run a single mutation body against a fresh write transaction and
    /// commit it, returning the emitted CDC.
    async fn mutate(
        store: &Arc<MemoryStore>,
        f: impl FnOnce(&OverlayTransaction, i64) -> Result<(), TidedbError>,
    ) -> Vec<CdcEvent> {
        let tx = OverlayTransaction::write(store.clone()).await;
        let id = tx.allocate_mutation("test", Value::Null).unwrap();
        f(&tx, id).unwrap();
        tx.complete_mutation(id, Value::Null).unwrap();
        tx.commit().unwrap()
    }

    #[tokio::test]
    async fn insert_then_update_reads_back_merged_value() {
        let store = store();
        let events = mutate(&store, |tx, id| {
            tx.record_insert(id, "todo", &Key::from("k1"), &json!({"title": "a", "status": "incomplete"}))?;
            tx.record_update(id, "todo", &Key::from("k1"), &json!({"title": "b"}))?;
            Ok(())
        })
        .await;

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], CdcEvent::Insert { .. }));
        match &events[1] {
            CdcEvent::Update {
                delta,
                post_update_value,
                ..
            } => {
                assert_eq!(*delta, json!({"title": "b"}));
                assert_eq!(
                    *post_update_value,
                    json!({"title": "b", "status": "incomplete"})
                );
            }
            other => panic!("expected UPDATE, got {other:?}"),
        }

        let read = OverlayTransaction::read(store.clone());
        assert_eq!(
            read.query_by_key("todo", &Key::from("k1")).unwrap(),
            Some(json!({"title": "b", "status": "incomplete"}))
        );
        // The base tier never saw the document.
        let raw = KvTransaction::read(store);
        assert_eq!(raw.query_by_key("todo", &Key::from("k1")).unwrap(), None);
    }

    #[tokio::test]
    async fn pending_update_moves_row_into_condition_match_set() {
        let store = store();
        seed(&store, &[("k2", json!({"status": "finished"}))]).await;
        mutate(&store, |tx, id| {
            tx.record_update(id, "todo", &Key::from("k2"), &json!({"status": "incomplete"}))?;
            Ok(())
        })
        .await;

        let read = OverlayTransaction::read(store);
        let rows = read
            .query_by_condition(
                "todo",
                &Condition::new("status", Comparator::Eq, "incomplete"),
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, Key::from("k2"));
        assert_eq!(rows[0].value, json!({"status": "incomplete"}));

        // And it left the set it used to match.
        let finished = read
            .query_by_condition("todo", &Condition::new("status", Comparator::Eq, "finished"))
            .unwrap();
        assert!(finished.is_empty());
    }

    #[tokio::test]
    async fn pending_delete_hides_document_from_all_read_paths() {
        let store = store();
        seed(&store, &[("k1", json!({"status": "open"}))]).await;
        mutate(&store, |tx, id| {
            tx.record_delete(id, "todo", &Key::from("k1"))?;
            Ok(())
        })
        .await;

        let read = OverlayTransaction::read(store);
        assert_eq!(read.query_by_key("todo", &Key::from("k1")).unwrap(), None);
        assert!(read.query_all("todo").unwrap().is_empty());
        assert!(read
            .query_by_condition("todo", &Condition::new("status", Comparator::Eq, "open"))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn insert_over_visible_document_is_rejected() {
        let store = store();
        seed(&store, &[("k1", json!({"status": "open"}))]).await;
        let tx = OverlayTransaction::write(store.clone()).await;
        let id = tx.allocate_mutation("test", Value::Null).unwrap();
        let err = tx
            .record_insert(id, "todo", &Key::from("k1"), &json!({}))
            .unwrap_err();
        assert!(matches!(err, TidedbError::DuplicateKey { .. }));
        tx.rollback();
    }

    #[tokio::test]
    async fn insert_after_pending_delete_is_legal() {
        let store = store();
        seed(&store, &[("k1", json!({"status": "open"}))]).await;
        mutate(&store, |tx, id| {
            tx.record_delete(id, "todo", &Key::from("k1"))?;
            Ok(())
        })
        .await;
        let events = mutate(&store, |tx, id| {
            tx.record_insert(id, "todo", &Key::from("k1"), &json!({"status": "fresh"}))?;
            Ok(())
        })
        .await;
        assert!(matches!(events[0], CdcEvent::Insert { .. }));

        let read = OverlayTransaction::read(store);
        assert_eq!(
            read.query_by_key("todo", &Key::from("k1")).unwrap(),
            Some(json!({"status": "fresh"}))
        );
    }

    #[tokio::test]
    async fn rollback_suppresses_cdc_and_log_rows() {
        let store = store();
        let tx = OverlayTransaction::write(store.clone()).await;
        let id = tx.allocate_mutation("test", Value::Null).unwrap();
        tx.record_insert(id, "todo", &Key::from("k1"), &json!({}))
            .unwrap();
        tx.rollback();

        let read = OverlayTransaction::read(store);
        assert_eq!(read.query_by_key("todo", &Key::from("k1")).unwrap(), None);
        assert_eq!(read.completed_mutation_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn authoritative_insert_over_pending_update_emits_merged_insert() {
        let store = store();
        seed(&store, &[("k", json!({"title": "base"}))]).await;
        mutate(&store, |tx, id| {
            tx.record_update(id, "todo", &Key::from("k"), &json!({"title": "b"}))?;
            Ok(())
        })
        .await;
        // The base row vanishes out-of-band (no CDC): the overlay has
        // diverged from truth when the server's INSERT arrives.
        let raw = KvTransaction::write(store.clone()).await;
        raw.delete("todo", &Key::from("k")).unwrap();
        raw.commit().unwrap();

        let tx = OverlayTransaction::write(store.clone()).await;
        tx.upsert_authoritative("todo", &Key::from("k"), &json!({"title": "a", "status": "x"}))
            .unwrap();
        let events = tx.commit().unwrap();
        assert_eq!(
            events,
            vec![CdcEvent::Insert {
                collection_name: "todo".into(),
                key: Key::from("k"),
                value: json!({"title": "b", "status": "x"}),
            }],
            "base value merged with the pending delta"
        );

        let read = OverlayTransaction::read(store.clone());
        assert_eq!(
            read.query_by_key("todo", &Key::from("k")).unwrap(),
            Some(json!({"title": "b", "status": "x"})),
            "overlay delta still applies over the new base"
        );
        let raw = KvTransaction::read(store);
        assert_eq!(
            raw.query_by_key("todo", &Key::from("k")).unwrap(),
            Some(json!({"title": "a", "status": "x"}))
        );
    }

    #[tokio::test]
    async fn gc_of_insert_only_mutation_emits_inverse_delete() {
        let store = store();
        mutate(&store, |tx, id| {
            tx.record_insert(id, "todo", &Key::from("k"), &json!({"title": "a"}))?;
            Ok(())
        })
        .await;

        let tx = OverlayTransaction::write(store.clone()).await;
        let rows = tx.completed_mutations().unwrap();
        assert_eq!(rows.len(), 1);
        tx.delete_mutation_row(rows[0].id).unwrap();
        let events = tx.commit().unwrap();
        assert_eq!(
            events,
            vec![CdcEvent::Delete {
                collection_name: "todo".into(),
                key: Key::from("k"),
                value: json!({"title": "a"}),
            }]
        );

        let read = OverlayTransaction::read(store);
        assert_eq!(read.query_by_key("todo", &Key::from("k")).unwrap(), None);
    }

    #[tokio::test]
    async fn purge_and_apply_makes_local_mutation_authoritative_silently() {
        let store = store();
        mutate(&store, |tx, id| {
            tx.record_insert(id, "todo", &Key::from("k"), &json!({"title": "a"}))?;
            Ok(())
        })
        .await;

        let tx = OverlayTransaction::write(store.clone()).await;
        let rows = tx.completed_mutations().unwrap();
        tx.purge_and_apply_mutation(rows[0].id).unwrap();
        let events = tx.commit().unwrap();
        assert!(
            events.is_empty(),
            "value unchanged from the subscriber's perspective: {events:?}"
        );

        let raw = KvTransaction::read(store.clone());
        assert_eq!(
            raw.query_by_key("todo", &Key::from("k")).unwrap(),
            Some(json!({"title": "a"}))
        );
        let read = OverlayTransaction::read(store);
        assert_eq!(read.completed_mutation_count().unwrap(), 0);
    }
}
