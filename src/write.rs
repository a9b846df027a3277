use crate::condition::Condition;
use crate::error::TidedbError;
use crate::overlay::OverlayTransaction;
use crate::storage::memory::is_internal_collection;
use crate::types::{Key, Row};
use serde_json::Value;

/// Handed to a local resolver while its mutation runs. Everything the
/// resolver touches goes through one overlay transaction, so reads see the
/// mutation's own writes and a thrown error rolls the whole bundle back.
pub struct MutationContext<'a> {
    tx: &'a OverlayTransaction,
    mutation_id: i64,
}

impl<'a> MutationContext<'a> {
    pub(crate) fn new(tx: &'a OverlayTransaction, mutation_id: i64) -> Self {
        Self { tx, mutation_id }
    }

    pub fn mutation_id(&self) -> i64 {
        self.mutation_id
    }

    pub fn collection(&self, name: &str) -> Result<WriteTransaction<'a>, TidedbError> {
        if is_internal_collection(name) {
            return Err(TidedbError::CollectionReserved {
                collection: name.to_string(),
            });
        }
        Ok(WriteTransaction {
            tx: self.tx,
            mutation_id: self.mutation_id,
            collection: name.to_string(),
        })
    }
}

/// Collection-scoped recording surface for one mutation. Writes append
/// `PendingChange` entries to the mutation row; the base tier is never
/// touched here.
pub struct WriteTransaction<'a> {
    tx: &'a OverlayTransaction,
    mutation_id: i64,
    collection: String,
}

impl WriteTransaction<'_> {
    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    pub fn get(&self, key: impl Into<Key>) -> Result<Option<Value>, TidedbError> {
        self.tx.query_by_key(&self.collection, &key.into())
    }

    pub fn get_all(&self) -> Result<Vec<Row>, TidedbError> {
        self.tx.query_all(&self.collection)
    }

    pub fn find(&self, condition: &Condition) -> Result<Vec<Row>, TidedbError> {
        self.tx.query_by_condition(&self.collection, condition)
    }

    /// Record an insert. Fails on a key already visible through the
    /// overlay; inserting over a pending delete is legal.
    pub fn insert(&self, key: impl Into<Key>, value: Value) -> Result<(), TidedbError> {
        self.tx
            .record_insert(self.mutation_id, &self.collection, &key.into(), &value)
    }

    /// Record a partial update; returns the resulting visible value.
    pub fn update(&self, key: impl Into<Key>, delta: Value) -> Result<Value, TidedbError> {
        self.tx
            .record_update(self.mutation_id, &self.collection, &key.into(), &delta)
    }

    /// Record a delete. Fails when the key is not visible.
    pub fn delete(&self, key: impl Into<Key>) -> Result<(), TidedbError> {
        self.tx
            .record_delete(self.mutation_id, &self.collection, &key.into())
    }
}
