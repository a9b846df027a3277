use crate::merge::merge_delta;
use crate::types::Key;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

/// One recorded effect of a user mutation, as persisted in the mutation
/// log. `id` is `"<mutationId>-<timestamp>"`; the pair totally orders
/// changes across the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PendingChange {
    Insert {
        id: String,
        timestamp: i64,
        collection_name: String,
        key: Key,
        value: Value,
    },
    Update {
        id: String,
        timestamp: i64,
        collection_name: String,
        key: Key,
        pre_update_value: Value,
        post_update_value: Value,
        delta: Value,
    },
    Delete {
        id: String,
        timestamp: i64,
        collection_name: String,
        key: Key,
        value: Value,
    },
}

impl PendingChange {
    pub fn collection_name(&self) -> &str {
        match self {
            PendingChange::Insert {
                collection_name, ..
            }
            | PendingChange::Update {
                collection_name, ..
            }
            | PendingChange::Delete {
                collection_name, ..
            } => collection_name,
        }
    }

    pub fn key(&self) -> &Key {
        match self {
            PendingChange::Insert { key, .. }
            | PendingChange::Update { key, .. }
            | PendingChange::Delete { key, .. } => key,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            PendingChange::Insert { timestamp, .. }
            | PendingChange::Update { timestamp, .. }
            | PendingChange::Delete { timestamp, .. } => *timestamp,
        }
    }

    pub fn change_id(mutation_id: i64, timestamp: i64) -> String {
        format!("{mutation_id}-{timestamp}")
    }
}

/// A mutation row in the `__mutations` log: the atomic bundle of changes a
/// single `mutate()` call produced, plus its push lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRow {
    pub id: i64,
    pub mutation_name: String,
    pub mutation_args: Value,
    pub changes: Vec<PendingChange>,
    pub collections_affected: BTreeSet<String>,
    pub is_completed: bool,
    pub is_pushed: bool,
    pub remote_push_attempts: u32,
    pub local_resolver_result: Value,
    pub server_mutation_id: Option<i64>,
}

impl MutationRow {
    pub fn new(id: i64, mutation_name: impl Into<String>, mutation_args: Value) -> Self {
        Self {
            id,
            mutation_name: mutation_name.into(),
            mutation_args,
            changes: Vec::new(),
            collections_affected: BTreeSet::new(),
            is_completed: false,
            is_pushed: false,
            remote_push_attempts: 0,
            local_resolver_result: Value::Null,
            server_mutation_id: None,
        }
    }
}

/// Net pending effect on one document, after folding every completed
/// mutation's changes in `(mutationId, timestamp)` order.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingDocumentState {
    Inserted {
        value: Value,
    },
    Updated {
        delta: Value,
        post_update_value: Value,
    },
    UpdatePostInsert {
        delta: Value,
        post_update_value: Value,
    },
    Deleted {
        value: Value,
    },
}

impl PendingDocumentState {
    /// The document value this pending state makes visible, ignoring any
    /// base row. `Updated` has no standalone value (its delta still needs
    /// a base row); `Deleted` makes nothing visible.
    pub fn standalone_value(&self) -> Option<&Value> {
        match self {
            PendingDocumentState::Inserted { value }
            | PendingDocumentState::UpdatePostInsert {
                post_update_value: value,
                ..
            } => Some(value),
            PendingDocumentState::Updated { .. } | PendingDocumentState::Deleted { .. } => None,
        }
    }
}

pub type PendingStateMap = HashMap<String, BTreeMap<Key, PendingDocumentState>>;

/// One step of the document overlay state machine.
///
/// INSERT over a live pending document is a user error rejected when the
/// change is recorded; if a malformed log presents one anyway the change
/// is dropped with a warning rather than corrupting the fold. INSERT over
/// DELETED is legal: the pull GC path deletes mutation rows, after which a
/// later INSERT mutation restores the document.
pub fn fold_change(
    prior: Option<PendingDocumentState>,
    change: &PendingChange,
) -> Option<PendingDocumentState> {
    match change {
        PendingChange::Insert { value, .. } => match prior {
            None => Some(PendingDocumentState::Inserted {
                value: value.clone(),
            }),
            Some(PendingDocumentState::Deleted { .. }) => {
                Some(PendingDocumentState::Inserted {
                    value: value.clone(),
                })
            }
            Some(state) => {
                warn!(
                    collection = change.collection_name(),
                    key = %change.key(),
                    "pending INSERT over a live pending document, ignoring"
                );
                Some(state)
            }
        },
        PendingChange::Update {
            delta,
            post_update_value,
            ..
        } => match prior {
            None => Some(PendingDocumentState::Updated {
                delta: delta.clone(),
                post_update_value: post_update_value.clone(),
            }),
            Some(PendingDocumentState::Inserted { value }) => {
                Some(PendingDocumentState::UpdatePostInsert {
                    delta: delta.clone(),
                    post_update_value: merge_delta(&value, delta),
                })
            }
            Some(PendingDocumentState::Updated {
                delta: prior_delta,
                post_update_value: prior_value,
            }) => Some(PendingDocumentState::Updated {
                delta: merge_delta(&prior_delta, delta),
                post_update_value: merge_delta(&prior_value, delta),
            }),
            Some(PendingDocumentState::UpdatePostInsert {
                delta: prior_delta,
                post_update_value: prior_value,
            }) => Some(PendingDocumentState::UpdatePostInsert {
                delta: merge_delta(&prior_delta, delta),
                post_update_value: merge_delta(&prior_value, delta),
            }),
            Some(state @ PendingDocumentState::Deleted { .. }) => {
                warn!(
                    collection = change.collection_name(),
                    key = %change.key(),
                    "pending UPDATE over a deleted document, ignoring"
                );
                Some(state)
            }
        },
        PendingChange::Delete { value, .. } => match prior {
            None => Some(PendingDocumentState::Deleted {
                value: value.clone(),
            }),
            Some(PendingDocumentState::Inserted { value }) => {
                Some(PendingDocumentState::Deleted { value })
            }
            Some(PendingDocumentState::Updated {
                post_update_value, ..
            })
            | Some(PendingDocumentState::UpdatePostInsert {
                post_update_value, ..
            }) => Some(PendingDocumentState::Deleted {
                value: post_update_value,
            }),
            Some(state @ PendingDocumentState::Deleted { .. }) => Some(state),
        },
    }
}

/// Fold the completed mutation rows into a per-collection, per-key pending
/// state map. Changes are flattened and sorted by `(mutationId,
/// timestamp)`, so the fold is deterministic for any input permutation.
pub fn build_pending_state(rows: &[MutationRow]) -> PendingStateMap {
    let mut flattened: Vec<(i64, &PendingChange)> = rows
        .iter()
        .filter(|row| row.is_completed)
        .flat_map(|row| row.changes.iter().map(move |c| (row.id, c)))
        .collect();
    flattened.sort_by_key(|(mutation_id, change)| (*mutation_id, change.timestamp()));

    let mut map: PendingStateMap = HashMap::new();
    for (_, change) in flattened {
        let by_key = map
            .entry(change.collection_name().to_string())
            .or_default();
        let prior = by_key.remove(change.key());
        if let Some(next) = fold_change(prior, change) {
            by_key.insert(change.key().clone(), next);
        }
    }
    map
}

/// Fold one freshly recorded change into an already-built map, keeping an
/// open transaction's cached overlay in sync with its own writes.
pub fn fold_into(map: &mut PendingStateMap, change: &PendingChange) {
    let by_key = map
        .entry(change.collection_name().to_string())
        .or_default();
    let prior = by_key.remove(change.key());
    if let Some(next) = fold_change(prior, change) {
        by_key.insert(change.key().clone(), next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::incrementing_timestamp;
    use serde_json::json;

    fn insert(mutation_id: i64, collection: &str, key: &str, value: Value) -> PendingChange {
        let ts = incrementing_timestamp();
        PendingChange::Insert {
            id: PendingChange::change_id(mutation_id, ts),
            timestamp: ts,
            collection_name: collection.into(),
            key: Key::from(key),
            value,
        }
    }

    fn update(mutation_id: i64, collection: &str, key: &str, pre: Value, delta: Value) -> PendingChange {
        let ts = incrementing_timestamp();
        let post = merge_delta(&pre, &delta);
        PendingChange::Update {
            id: PendingChange::change_id(mutation_id, ts),
            timestamp: ts,
            collection_name: collection.into(),
            key: Key::from(key),
            pre_update_value: pre,
            post_update_value: post,
            delta,
        }
    }

    fn delete(mutation_id: i64, collection: &str, key: &str, value: Value) -> PendingChange {
        let ts = incrementing_timestamp();
        PendingChange::Delete {
            id: PendingChange::change_id(mutation_id, ts),
            timestamp: ts,
            collection_name: collection.into(),
            key: Key::from(key),
            value,
        }
    }

    fn row(id: i64, changes: Vec<PendingChange>) -> MutationRow {
        let mut row = MutationRow::new(id, "m", Value::Null);
        row.changes = changes;
        row.is_completed = true;
        row
    }

    #[test]
    fn insert_then_update_becomes_update_post_insert() {
        let rows = vec![row(
            1,
            vec![
                insert(1, "todo", "k1", json!({"title": "a"})),
                update(1, "todo", "k1", json!({"title": "a"}), json!({"title": "b"})),
            ],
        )];
        let map = build_pending_state(&rows);
        assert_eq!(
            map["todo"][&Key::from("k1")],
            PendingDocumentState::UpdatePostInsert {
                delta: json!({"title": "b"}),
                post_update_value: json!({"title": "b"}),
            }
        );
    }

    #[test]
    fn updates_accumulate_their_deltas() {
        let rows = vec![
            row(1, vec![update(1, "todo", "k1", json!({"a": 1, "b": 1}), json!({"a": 2}))]),
            row(2, vec![update(2, "todo", "k1", json!({"a": 2, "b": 1}), json!({"b": 3}))]),
        ];
        let map = build_pending_state(&rows);
        assert_eq!(
            map["todo"][&Key::from("k1")],
            PendingDocumentState::Updated {
                delta: json!({"a": 2, "b": 3}),
                post_update_value: json!({"a": 2, "b": 3}),
            }
        );
    }

    #[test]
    fn delete_wins_over_any_live_state_and_insert_resurrects() {
        let rows = vec![
            row(1, vec![insert(1, "todo", "k1", json!({"v": 1}))]),
            row(2, vec![delete(2, "todo", "k1", json!({"v": 1}))]),
            row(3, vec![insert(3, "todo", "k1", json!({"v": 2}))]),
        ];
        let map = build_pending_state(&rows);
        assert_eq!(
            map["todo"][&Key::from("k1")],
            PendingDocumentState::Inserted {
                value: json!({"v": 2})
            }
        );
    }

    #[test]
    fn incomplete_rows_do_not_contribute() {
        let mut incomplete = row(1, vec![insert(1, "todo", "k1", json!({}))]);
        incomplete.is_completed = false;
        let map = build_pending_state(&[incomplete]);
        assert!(map.is_empty());
    }

    #[test]
    fn update_over_deleted_is_ignored() {
        let rows = vec![
            row(1, vec![delete(1, "todo", "k1", json!({"v": 1}))]),
            row(2, vec![update(2, "todo", "k1", json!({"v": 1}), json!({"v": 9}))]),
        ];
        let map = build_pending_state(&rows);
        assert_eq!(
            map["todo"][&Key::from("k1")],
            PendingDocumentState::Deleted {
                value: json!({"v": 1})
            }
        );
    }

    #[test]
    fn fold_is_deterministic_under_row_permutation() {
        let a = row(1, vec![insert(1, "todo", "k1", json!({"n": 1}))]);
        let b = row(
            2,
            vec![update(2, "todo", "k1", json!({"n": 1}), json!({"n": 2}))],
        );
        let c = row(3, vec![delete(3, "todo", "k2", json!({"x": true}))]);

        let forward = build_pending_state(&[a.clone(), b.clone(), c.clone()]);
        let shuffled = build_pending_state(&[c, a, b]);
        assert_eq!(forward, shuffled);
    }
}
