use crate::merge::{extract_keys, merge_delta};
use crate::overlay::pending::{PendingChange, PendingDocumentState};
use crate::types::Key;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

/// A change event as observed by subscribers. Events describe the
/// transition from the subscriber's current view (base ⊕ overlay) to the
/// new view, never from the raw base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CdcEvent {
    Insert {
        collection_name: String,
        key: Key,
        value: Value,
    },
    Update {
        collection_name: String,
        key: Key,
        pre_update_value: Value,
        post_update_value: Value,
        delta: Value,
    },
    Delete {
        collection_name: String,
        key: Key,
        value: Value,
    },
    Clear {
        collection_name: String,
    },
}

impl CdcEvent {
    pub fn collection_name(&self) -> &str {
        match self {
            CdcEvent::Insert {
                collection_name, ..
            }
            | CdcEvent::Update {
                collection_name, ..
            }
            | CdcEvent::Delete {
                collection_name, ..
            }
            | CdcEvent::Clear { collection_name } => collection_name,
        }
    }

    pub fn key(&self) -> Option<&Key> {
        match self {
            CdcEvent::Insert { key, .. }
            | CdcEvent::Update { key, .. }
            | CdcEvent::Delete { key, .. } => Some(key),
            CdcEvent::Clear { .. } => None,
        }
    }
}

/// Effective CDC for a raw INSERT at a key whose pending state is `pending`.
///
/// Authoritative inserts have to unwind whatever the overlay already shows:
/// a pending UPDATE folds its delta over the arriving value, a pending
/// INSERT/UPDATE_POST_INSERT turns the event into an UPDATE toward the
/// overlay value, a pending DELETE suppresses the event entirely.
pub fn derive_insert(
    collection: &str,
    key: &Key,
    value: &Value,
    pending: Option<&PendingDocumentState>,
    authoritative: bool,
) -> Option<CdcEvent> {
    let insert = |value: Value| CdcEvent::Insert {
        collection_name: collection.to_string(),
        key: key.clone(),
        value,
    };
    match pending {
        None => Some(insert(value.clone())),
        Some(PendingDocumentState::Deleted { .. }) => {
            if authoritative {
                None
            } else {
                Some(insert(value.clone()))
            }
        }
        Some(PendingDocumentState::Updated { delta, .. }) if authoritative => {
            Some(insert(merge_delta(value, delta)))
        }
        Some(
            PendingDocumentState::Inserted {
                value: overlay_value,
            }
            | PendingDocumentState::UpdatePostInsert {
                post_update_value: overlay_value,
                ..
            },
        ) if authoritative => Some(CdcEvent::Update {
            collection_name: collection.to_string(),
            key: key.clone(),
            pre_update_value: value.clone(),
            post_update_value: merge_delta(value, overlay_value),
            delta: overlay_value.clone(),
        }),
        Some(_) => {
            // Optimistic INSERT over a live pending document is rejected
            // when the change is recorded; reaching this arm means the log
            // and the caller disagree.
            warn!(
                collection,
                %key,
                "optimistic INSERT over live pending state, suppressing event"
            );
            None
        }
    }
}

/// Effective CDC for a raw UPDATE. `pre`, `post`, `delta` describe the raw
/// transition as the caller computed it (against the base for
/// authoritative writes, against the overlay view for optimistic ones).
pub fn derive_update(
    collection: &str,
    key: &Key,
    pre: &Value,
    post: &Value,
    delta: &Value,
    pending: Option<&PendingDocumentState>,
    authoritative: bool,
) -> Option<CdcEvent> {
    let update = |pre: Value, delta: Value| {
        let post = merge_delta(&pre, &delta);
        CdcEvent::Update {
            collection_name: collection.to_string(),
            key: key.clone(),
            pre_update_value: pre,
            post_update_value: post,
            delta,
        }
    };
    match pending {
        None => Some(CdcEvent::Update {
            collection_name: collection.to_string(),
            key: key.clone(),
            pre_update_value: pre.clone(),
            post_update_value: post.clone(),
            delta: delta.clone(),
        }),
        Some(PendingDocumentState::Deleted { .. }) => None,
        Some(PendingDocumentState::Inserted {
            value: overlay_value,
        }) => {
            if authoritative {
                // The pending INSERT still masks the base; nothing visible
                // moves, but subscribers learn the event happened.
                Some(update(post.clone(), json!({})))
            } else {
                Some(update(overlay_value.clone(), delta.clone()))
            }
        }
        Some(PendingDocumentState::UpdatePostInsert {
            post_update_value: overlay_value,
            ..
        }) => {
            if authoritative {
                Some(update(post.clone(), json!({})))
            } else {
                Some(update(overlay_value.clone(), delta.clone()))
            }
        }
        Some(PendingDocumentState::Updated {
            delta: pending_delta,
            post_update_value: overlay_value,
        }) => {
            if authoritative {
                Some(update(post.clone(), merge_delta(delta, pending_delta)))
            } else {
                Some(update(
                    overlay_value.clone(),
                    merge_delta(pending_delta, delta),
                ))
            }
        }
    }
}

/// Effective CDC for a raw DELETE. `value` is the base value for
/// authoritative deletes and the overlay-visible value for optimistic
/// ones.
pub fn derive_delete(
    collection: &str,
    key: &Key,
    value: &Value,
    pending: Option<&PendingDocumentState>,
    authoritative: bool,
) -> Option<CdcEvent> {
    let delete = |value: Value| CdcEvent::Delete {
        collection_name: collection.to_string(),
        key: key.clone(),
        value,
    };
    if !authoritative {
        return Some(delete(value.clone()));
    }
    match pending {
        None => Some(delete(value.clone())),
        Some(PendingDocumentState::Updated { delta, .. }) => {
            Some(delete(merge_delta(value, delta)))
        }
        // A pending INSERT / UPDATE_POST_INSERT / DELETE keeps masking the
        // base row, so losing the base row changes nothing visible.
        Some(_) => None,
    }
}

pub fn derive_clear(collection: &str) -> CdcEvent {
    CdcEvent::Clear {
        collection_name: collection.to_string(),
    }
}

/// Inverting CDC for one recorded change whose mutation row is being
/// garbage-collected. `authoritative` is the present base value at the
/// change's key, `pending_after` the overlay state at that key once the
/// deleted row is out of the fold.
///
/// The discipline: subscribers must observe a continuous transition from
/// the optimistic view to the authoritative view even across log purges.
pub fn derive_gc_change(
    change: &PendingChange,
    authoritative: Option<&Value>,
    pending_after: Option<&PendingDocumentState>,
) -> Option<CdcEvent> {
    match change {
        PendingChange::Delete {
            collection_name,
            key,
            ..
        } => match (authoritative, pending_after) {
            (Some(value), None) => Some(CdcEvent::Insert {
                collection_name: collection_name.clone(),
                key: key.clone(),
                value: value.clone(),
            }),
            _ => None,
        },
        PendingChange::Insert {
            collection_name,
            key,
            value,
            ..
        } => match authoritative {
            None => Some(CdcEvent::Delete {
                collection_name: collection_name.clone(),
                key: key.clone(),
                value: value.clone(),
            }),
            Some(_) => None,
        },
        PendingChange::Update {
            collection_name,
            key,
            post_update_value,
            delta,
            ..
        } => authoritative.map(|present| {
            let restore = extract_keys(present, delta);
            CdcEvent::Update {
                collection_name: collection_name.clone(),
                key: key.clone(),
                pre_update_value: post_update_value.clone(),
                post_update_value: merge_delta(post_update_value, &restore),
                delta: restore,
            }
        }),
    }
}
