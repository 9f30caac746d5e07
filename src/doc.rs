//! Shared Document: a process-wide CRDT document holding one named `yrs`
//! map per synced entity kind. Records are stored as opaque JSON strings
//! (matching the Shared Document's own rationale: they are overwritten
//! wholesale, never field-merged), and every mutation is tagged with an
//! origin so observers can tell local writes from remote ones without
//! threading that information through call sites by hand.
//!
//! Grounded on `examples/other_examples/1403ba30_refmdio-refmd__api-src-infrastructure-realtime-hub.rs.rs`'s
//! `Doc`/`Awareness`/`observe_update_v1`/`encode_state_as_update_v1` usage.

use std::collections::HashMap;
use std::sync::Mutex;

use yrs::types::EntryChange;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::Value as YValue;
use yrs::{
    Doc, Map, MapRef, Observable, Origin, ReadTxn, StateVector, Subscription, Transact,
    TransactionMut, Update,
};

use crate::codec::{Kind, Record};

const ORIGIN_LOCAL: &[u8] = b"local";
const ORIGIN_REMOTE: &[u8] = b"remote";

/// Whether a batch of map changes came from this process's own write path or
/// from an applied remote update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone)]
pub struct MapChangeEvent {
    pub kind: Kind,
    pub origin: TransactionOrigin,
    pub key_changes: Vec<(String, ChangeAction)>,
}

#[derive(Debug, thiserror::Error)]
pub enum DocError {
    #[error("malformed update bytes: {0}")]
    Decode(String),
    #[error("record {0} is not valid JSON: {1}")]
    InvalidRecord(String, serde_json::Error),
}

/// The Shared Document. One `Doc` plus one `MapRef` per registered `Kind`.
pub struct SharedDocument {
    doc: Doc,
    maps: HashMap<Kind, MapRef>,
    // `yrs::Subscription`s must be kept alive for as long as the callback should fire;
    // dropping a subscription silently unregisters it.
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SharedDocument {
    pub fn new() -> Self {
        let doc = Doc::new();
        let mut maps = HashMap::new();
        for &kind in Kind::ALL {
            maps.insert(kind, doc.get_or_insert_map(kind.as_str()));
        }
        Self {
            doc,
            maps,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn map(&self, kind: Kind) -> &MapRef {
        self.maps
            .get(&kind)
            .expect("every Kind is registered in SharedDocument::new")
    }

    /// Run `f` in a transaction tagged as a local write.
    pub fn transact_local<T>(&self, f: impl FnOnce(&mut TransactionMut) -> T) -> T {
        let mut txn = self.doc.transact_mut_with(Origin::from(ORIGIN_LOCAL));
        f(&mut txn)
    }

    /// Run `f` in a transaction tagged as applying a remote change. Used both
    /// for inbound network updates and the Sync Bridge's own reentrancy-guarded
    /// writes so they never echo back out as local.
    pub fn transact_remote<T>(&self, f: impl FnOnce(&mut TransactionMut) -> T) -> T {
        let mut txn = self.doc.transact_mut_with(Origin::from(ORIGIN_REMOTE));
        f(&mut txn)
    }

    pub fn set(&self, kind: Kind, record: &Record) -> Result<(), DocError> {
        let payload = serde_json::to_string(record)
            .map_err(|e| DocError::InvalidRecord(record.id.clone(), e))?;
        self.transact_local(|txn| {
            self.map(kind).insert(txn, record.id.as_str(), payload);
        });
        Ok(())
    }

    /// Same as `set` but tagged as a remote-origin write; used by the provider
    /// when applying inbound updates and by the bridge when restoring a
    /// record that should win a merge without treating it as a fresh local edit.
    pub fn set_as_remote(&self, kind: Kind, record: &Record) -> Result<(), DocError> {
        let payload = serde_json::to_string(record)
            .map_err(|e| DocError::InvalidRecord(record.id.clone(), e))?;
        self.transact_remote(|txn| {
            self.map(kind).insert(txn, record.id.as_str(), payload);
        });
        Ok(())
    }

    pub fn delete(&self, kind: Kind, id: &str) {
        self.transact_local(|txn| {
            self.map(kind).remove(txn, id);
        });
    }

    /// Remove every entry of one named map in a single local transaction.
    /// Used when joining an existing room under a fresh identity, so stale
    /// local-only state (e.g. preferences) doesn't leak into the shared state.
    pub fn clear(&self, kind: Kind) {
        self.transact_local(|txn| {
            let keys: Vec<String> = self
                .map(kind)
                .iter(&*txn)
                .map(|(key, _)| key.to_string())
                .collect();
            for key in keys {
                self.map(kind).remove(txn, &key);
            }
        });
    }

    pub fn delete_as_remote(&self, kind: Kind, id: &str) {
        self.transact_remote(|txn| {
            self.map(kind).remove(txn, id);
        });
    }

    pub fn get(&self, kind: Kind, id: &str) -> Option<Record> {
        let txn = self.doc.transact();
        let value = self.map(kind).get(&txn, id)?;
        decode_record(id, &value)
    }

    pub fn entries(&self, kind: Kind) -> Vec<Record> {
        let txn = self.doc.transact();
        self.map(kind)
            .iter(&txn)
            .filter_map(|(id, value)| decode_record(id, &value))
            .collect()
    }

    pub fn size(&self, kind: Kind) -> u32 {
        let txn = self.doc.transact();
        self.map(kind).len(&txn)
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    pub fn encode_state_as_update(&self, peer_state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = StateVector::decode_v1(peer_state_vector)
            .map_err(|e| DocError::Decode(e.to_string()))?;
        Ok(self.doc.transact().encode_state_as_update_v1(&sv))
    }

    /// Apply a remote update. Always tagged with the remote origin so map
    /// observers distinguish it from local writes.
    pub fn apply_remote_update(&self, update_bytes: &[u8]) -> Result<(), DocError> {
        let update =
            Update::decode_v1(update_bytes).map_err(|e| DocError::Decode(e.to_string()))?;
        self.transact_remote(|txn| txn.apply_update(update));
        Ok(())
    }

    /// Batch several local mutations into a single transaction, so observers
    /// see one event instead of one per key.
    pub fn transact(&self, f: impl FnOnce(&mut TransactionMut)) {
        self.transact_local(f);
    }

    /// Subscribe to every raw update this document produces, regardless of
    /// origin or which map it touched. Used by the Durable Mirror to persist
    /// a replayable update log without knowing anything about named maps.
    pub fn observe_updates(&self, callback: impl FnMut(&[u8]) + Send + 'static) {
        let callback = Mutex::new(callback);
        let sub = self
            .doc
            .observe_update_v1(move |_txn, event| {
                (callback
                    .lock()
                    .expect("callback mutex is never held across a panic boundary"))(
                    &event.update,
                );
            })
            .expect("document is not mid-transaction when registering an observer");
        self.subscriptions
            .lock()
            .expect("subscriptions mutex is never held across a panic boundary")
            .push(sub);
    }

    /// Same as `observe_updates`, but also tells the callback whether the
    /// update's transaction was tagged remote. Used by the Sync Manager's
    /// provider to decide whether an update it just applied needs to be
    /// rebroadcast (yes, local-origin restores do; no, a raw network-applied
    /// update should not be echoed straight back out).
    pub fn observe_updates_with_origin(
        &self,
        callback: impl FnMut(&[u8], TransactionOrigin) + Send + 'static,
    ) {
        let callback = Mutex::new(callback);
        let sub = self
            .doc
            .observe_update_v1(move |txn, event| {
                let origin = match txn.origin() {
                    Some(origin) if origin.as_ref() == ORIGIN_REMOTE => TransactionOrigin::Remote,
                    _ => TransactionOrigin::Local,
                };
                (callback
                    .lock()
                    .expect("callback mutex is never held across a panic boundary"))(
                    &event.update, origin,
                );
            })
            .expect("document is not mid-transaction when registering an observer");
        self.subscriptions
            .lock()
            .expect("subscriptions mutex is never held across a panic boundary")
            .push(sub);
    }

    /// Subscribe to per-key changes on one named map. The returned
    /// subscription is owned by `SharedDocument` for the document's lifetime;
    /// callers that need early unsubscription should hold their own clone of
    /// the `Subscription` returned by `yrs` directly instead.
    pub fn observe(&self, kind: Kind, callback: impl FnMut(MapChangeEvent) + Send + 'static) {
        let kind_copy = kind;
        let callback = Mutex::new(callback);
        let sub = self.map(kind).observe(move |txn, event| {
            let origin = match txn.origin() {
                Some(origin) if origin.as_ref() == ORIGIN_REMOTE => TransactionOrigin::Remote,
                _ => TransactionOrigin::Local,
            };
            let key_changes = event
                .keys(txn)
                .iter()
                .map(|(key, change)| {
                    let action = match change {
                        EntryChange::Inserted(_) => ChangeAction::Add,
                        EntryChange::Updated(_, _) => ChangeAction::Update,
                        EntryChange::Removed(_) => ChangeAction::Delete,
                    };
                    (key.to_string(), action)
                })
                .collect();
            (callback
                .lock()
                .expect("callback mutex is never held across a panic boundary"))(
                MapChangeEvent {
                    kind: kind_copy,
                    origin,
                    key_changes,
                },
            );
        });
        self.subscriptions
            .lock()
            .expect("subscriptions mutex is never held across a panic boundary")
            .push(sub);
    }
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_record(id: &str, value: &YValue) -> Option<Record> {
    let payload = match value {
        YValue::Any(yrs::Any::String(s)) => s.to_string(),
        _ => return None,
    };
    match serde_json::from_str::<Record>(&payload) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(record_id = id, error = %e, "dropping malformed record in named map");
            None
        }
    }
}
