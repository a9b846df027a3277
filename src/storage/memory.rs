use crate::types::{Key, Scalar};
use im::{HashMap, OrdMap, OrdSet};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;

/// Append-only log of pending user mutations. Auto-incrementing integer
/// keys; the only collection with auto-assigned keys.
pub const MUTATIONS_COLLECTION: &str = "__mutations";
/// Cursor and advisory-lock rows. String keys.
pub const META_COLLECTION: &str = "__meta";

pub fn is_internal_collection(name: &str) -> bool {
    name == MUTATIONS_COLLECTION || name == META_COLLECTION
}

/// Secondary index over a top-level scalar field of the document value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub field: String,
    pub unique: bool,
    pub multi_entry: bool,
}

impl IndexSpec {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            unique: false,
            multi_entry: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    pub name: String,
    pub indexes: Vec<IndexSpec>,
    pub auto_increment: bool,
}

impl CollectionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
            auto_increment: false,
        }
    }

    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn index(&self, field: &str) -> Option<&IndexSpec> {
        self.indexes.iter().find(|i| i.field == field)
    }
}

/// Index entries a document contributes under one index: the scalar at the
/// indexed field, or one entry per array element for multi-entry indexes.
pub(crate) fn index_entries(spec: &IndexSpec, value: &Value) -> Vec<Scalar> {
    let Some(field_value) = value.get(&spec.field) else {
        return Vec::new();
    };
    if spec.multi_entry {
        if let Value::Array(items) = field_value {
            return items.iter().filter_map(Scalar::from_value).collect();
        }
    }
    Scalar::from_value(field_value).into_iter().collect()
}

#[derive(Debug, Clone)]
pub(crate) struct CollectionData {
    pub spec: Arc<CollectionSpec>,
    pub rows: OrdMap<Key, Value>,
    pub indexes: HashMap<String, OrdMap<Scalar, OrdSet<Key>>>,
    pub next_auto_key: i64,
}

impl CollectionData {
    fn new(spec: CollectionSpec) -> Self {
        let indexes = spec
            .indexes
            .iter()
            .map(|i| (i.field.clone(), OrdMap::new()))
            .collect();
        Self {
            spec: Arc::new(spec),
            rows: OrdMap::new(),
            indexes,
            next_auto_key: 1,
        }
    }

    pub(crate) fn index_insert(&mut self, key: &Key, value: &Value) {
        for index in &self.spec.indexes {
            for entry in index_entries(index, value) {
                self.indexes
                    .entry(index.field.clone())
                    .or_insert_with(OrdMap::new)
                    .entry(entry)
                    .or_insert_with(OrdSet::new)
                    .insert(key.clone());
            }
        }
    }

    pub(crate) fn index_remove(&mut self, key: &Key, value: &Value) {
        for index in &self.spec.indexes {
            for entry in index_entries(index, value) {
                if let Some(map) = self.indexes.get_mut(&index.field) {
                    let now_empty = match map.get_mut(&entry) {
                        Some(keys) => {
                            keys.remove(key);
                            keys.is_empty()
                        }
                        None => false,
                    };
                    if now_empty {
                        map.remove(&entry);
                    }
                }
            }
        }
    }
}

pub(crate) type StoreSnapshot = HashMap<String, CollectionData>;

/// Ordered, collection-based in-memory store with secondary indexes.
///
/// Transactions stage against a structurally-shared snapshot; commit swaps
/// the staged snapshot in. Write transactions serialize through an async
/// gate, read transactions never block.
pub struct MemoryStore {
    state: Mutex<StoreSnapshot>,
    pub(crate) write_gate: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryStore {
    pub fn new(collections: Vec<CollectionSpec>) -> Arc<Self> {
        let mut state: StoreSnapshot = HashMap::new();
        for spec in collections {
            state.insert(spec.name.clone(), CollectionData::new(spec));
        }
        let mut mutations = CollectionSpec::new(MUTATIONS_COLLECTION);
        mutations.auto_increment = true;
        state.insert(
            MUTATIONS_COLLECTION.to_string(),
            CollectionData::new(mutations),
        );
        state.insert(
            META_COLLECTION.to_string(),
            CollectionData::new(CollectionSpec::new(META_COLLECTION)),
        );
        Arc::new(Self {
            state: Mutex::new(state),
            write_gate: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.state.lock().contains_key(name)
    }

    pub(crate) fn snapshot(&self) -> StoreSnapshot {
        self.state.lock().clone()
    }

    pub(crate) fn install(&self, snapshot: StoreSnapshot) {
        *self.state.lock() = snapshot;
    }
}
