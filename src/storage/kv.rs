use crate::condition::Condition;
use crate::error::TidedbError;
use crate::storage::memory::{CollectionData, MemoryStore, StoreSnapshot};
use crate::types::{Key, Row, Scalar};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

type CompletionHook = Box<dyn FnOnce() + Send>;
type ErrorHook = Box<dyn FnOnce(&TidedbError) + Send>;

struct TxInner {
    staged: StoreSnapshot,
    active: bool,
    permit: Option<tokio::sync::OwnedMutexGuard<()>>,
    on_complete: Vec<CompletionHook>,
    on_error: Vec<ErrorHook>,
}

/// Transaction over the authoritative tier. Stages every write against a
/// structurally-shared snapshot; nothing is visible to other transactions
/// until commit installs the staged snapshot.
///
/// This adapter never consults the mutation log; overlay semantics live a
/// layer up.
pub struct KvTransaction {
    store: Arc<MemoryStore>,
    mode: TxMode,
    inner: Mutex<TxInner>,
}

impl KvTransaction {
    /// Open a read-only transaction against the current snapshot.
    pub fn read(store: Arc<MemoryStore>) -> Self {
        let staged = store.snapshot();
        Self {
            store,
            mode: TxMode::ReadOnly,
            inner: Mutex::new(TxInner {
                staged,
                active: true,
                permit: None,
                on_complete: Vec::new(),
                on_error: Vec::new(),
            }),
        }
    }

    /// Open a read-write transaction. Writers serialize through the
    /// store's gate; the snapshot is taken after the gate is held so the
    /// transaction always stages on top of the latest committed state.
    pub async fn write(store: Arc<MemoryStore>) -> Self {
        let permit = store.write_gate.clone().lock_owned().await;
        let staged = store.snapshot();
        Self {
            store,
            mode: TxMode::ReadWrite,
            inner: Mutex::new(TxInner {
                staged,
                active: true,
                permit: Some(permit),
                on_complete: Vec::new(),
                on_error: Vec::new(),
            }),
        }
    }

    pub fn mode(&self) -> TxMode {
        self.mode
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    pub fn on_complete(&self, hook: impl FnOnce() + Send + 'static) {
        self.inner.lock().on_complete.push(Box::new(hook));
    }

    pub fn on_error(&self, hook: impl FnOnce(&TidedbError) + Send + 'static) {
        self.inner.lock().on_error.push(Box::new(hook));
    }

    /// Drain the error hooks with the first failure; the error still
    /// propagates to the caller.
    fn fail(inner: &mut TxInner, error: TidedbError) -> TidedbError {
        for hook in inner.on_error.drain(..) {
            hook(&error);
        }
        error
    }

    fn with_collection<R>(
        &self,
        collection: &str,
        f: impl FnOnce(&CollectionData) -> R,
    ) -> Result<R, TidedbError> {
        let mut inner = self.inner.lock();
        if !inner.active {
            return Err(Self::fail(&mut inner, TidedbError::TransactionInactive));
        }
        match inner.staged.get(collection) {
            Some(data) => Ok(f(data)),
            None => {
                let error = TidedbError::CollectionNotFound {
                    collection: collection.to_string(),
                };
                Err(Self::fail(&mut inner, error))
            }
        }
    }

    fn with_collection_mut<R>(
        &self,
        collection: &str,
        f: impl FnOnce(&mut CollectionData) -> Result<R, TidedbError>,
    ) -> Result<R, TidedbError> {
        let mut inner = self.inner.lock();
        if !inner.active {
            return Err(Self::fail(&mut inner, TidedbError::TransactionInactive));
        }
        if self.mode != TxMode::ReadWrite {
            let error = TidedbError::Storage("write attempted in a read-only transaction".into());
            return Err(Self::fail(&mut inner, error));
        }
        let result = match inner.staged.get_mut(collection) {
            Some(data) => f(data),
            None => Err(TidedbError::CollectionNotFound {
                collection: collection.to_string(),
            }),
        };
        result.map_err(|error| Self::fail(&mut inner, error))
    }

    pub fn query_by_key(&self, collection: &str, key: &Key) -> Result<Option<Value>, TidedbError> {
        self.with_collection(collection, |data| data.rows.get(key).cloned())
    }

    pub fn query_all(&self, collection: &str) -> Result<Vec<Row>, TidedbError> {
        self.with_collection(collection, |data| {
            data.rows
                .iter()
                .map(|(k, v)| Row::new(k.clone(), v.clone()))
                .collect()
        })
    }

    /// Range scan driven by the condition's secondary index. Falls back to
    /// a full scan with the in-memory predicate when the field carries no
    /// index; the two paths agree because the predicate and the range
    /// descriptor agree.
    pub fn query_by_condition(
        &self,
        collection: &str,
        condition: &Condition,
    ) -> Result<Vec<Row>, TidedbError> {
        self.with_collection(collection, |data| {
            let mut matched: BTreeMap<Key, Value> = BTreeMap::new();
            if let (Some(_), Some(index)) = (
                data.spec.index(&condition.field),
                data.indexes.get(&condition.field),
            ) {
                let (lower, upper) = condition.range();
                for (_, keys) in index.range::<_, Scalar>((lower, upper)) {
                    for key in keys {
                        if let Some(value) = data.rows.get(key) {
                            matched.insert(key.clone(), value.clone());
                        }
                    }
                }
            } else {
                debug!(
                    collection,
                    field = %condition.field,
                    "no secondary index for condition field, falling back to full scan"
                );
                for (key, value) in &data.rows {
                    if condition.satisfies(value) {
                        matched.insert(key.clone(), value.clone());
                    }
                }
            }
            matched
                .into_iter()
                .map(|(k, v)| Row::new(k, v))
                .collect()
        })
    }

    pub fn count(&self, collection: &str) -> Result<usize, TidedbError> {
        self.with_collection(collection, |data| data.rows.len())
    }

    fn check_unique(
        data: &CollectionData,
        collection: &str,
        key: &Key,
        value: &Value,
    ) -> Result<(), TidedbError> {
        for index in &data.spec.indexes {
            if !index.unique {
                continue;
            }
            for entry in crate::storage::memory::index_entries(index, value) {
                let taken = data
                    .indexes
                    .get(&index.field)
                    .and_then(|m| m.get(&entry))
                    .is_some_and(|keys| keys.iter().any(|k| k != key));
                if taken {
                    return Err(TidedbError::UniqueViolation {
                        collection: collection.to_string(),
                        index: index.field.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn insert(&self, collection: &str, key: &Key, value: &Value) -> Result<(), TidedbError> {
        self.with_collection_mut(collection, |data| {
            if data.rows.contains_key(key) {
                return Err(TidedbError::DuplicateKey {
                    collection: collection.to_string(),
                    key: key.clone(),
                });
            }
            Self::check_unique(data, collection, key, value)?;
            data.rows.insert(key.clone(), value.clone());
            data.index_insert(key, value);
            Ok(())
        })
    }

    /// Insert with an auto-assigned integer key. Only the mutation log
    /// collection is declared auto-increment.
    pub fn insert_auto(&self, collection: &str, value: &Value) -> Result<Key, TidedbError> {
        self.with_collection_mut(collection, |data| {
            if !data.spec.auto_increment {
                return Err(TidedbError::Storage(format!(
                    "collection '{collection}' does not auto-assign keys"
                )));
            }
            let key = Key::Integer(data.next_auto_key);
            data.next_auto_key += 1;
            data.rows.insert(key.clone(), value.clone());
            data.index_insert(&key, value);
            Ok(key)
        })
    }

    pub fn update(&self, collection: &str, key: &Key, value: &Value) -> Result<(), TidedbError> {
        self.with_collection_mut(collection, |data| {
            let Some(previous) = data.rows.get(key).cloned() else {
                return Err(TidedbError::DocumentNotFound {
                    collection: collection.to_string(),
                    key: key.clone(),
                });
            };
            Self::check_unique(data, collection, key, value)?;
            data.index_remove(key, &previous);
            data.rows.insert(key.clone(), value.clone());
            data.index_insert(key, value);
            Ok(())
        })
    }

    pub fn upsert(&self, collection: &str, key: &Key, value: &Value) -> Result<(), TidedbError> {
        self.with_collection_mut(collection, |data| {
            Self::check_unique(data, collection, key, value)?;
            if let Some(previous) = data.rows.get(key).cloned() {
                data.index_remove(key, &previous);
            }
            data.rows.insert(key.clone(), value.clone());
            data.index_insert(key, value);
            Ok(())
        })
    }

    /// Remove a row, returning its previous value when present.
    pub fn delete(&self, collection: &str, key: &Key) -> Result<Option<Value>, TidedbError> {
        self.with_collection_mut(collection, |data| {
            let Some(previous) = data.rows.remove(key) else {
                return Ok(None);
            };
            data.index_remove(key, &previous);
            Ok(Some(previous))
        })
    }

    pub fn clear(&self, collection: &str) -> Result<(), TidedbError> {
        self.with_collection_mut(collection, |data| {
            data.rows.clear();
            for (_, index) in data.indexes.iter_mut() {
                index.clear();
            }
            Ok(())
        })
    }

    /// Install the staged snapshot and release the write gate. The
    /// in-memory install itself cannot fail; the `Result` is the adapter
    /// contract, not this backend's.
    pub fn commit(self) -> Result<(), TidedbError> {
        let mut inner = self.inner.lock();
        inner.active = false;
        if self.mode == TxMode::ReadWrite {
            self.store.install(inner.staged.clone());
        }
        for hook in inner.on_complete.drain(..) {
            hook();
        }
        inner.permit.take();
        Ok(())
    }

    /// Drop the staged snapshot without installing it.
    pub fn rollback(self) {
        let mut inner = self.inner.lock();
        inner.active = false;
        inner.on_complete.clear();
        inner.on_error.clear();
        inner.permit.take();
    }
}
