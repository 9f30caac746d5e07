//! Sync Bridge: keeps the legacy record-oriented local database and the
//! Shared Document in agreement using the timestamp rule, without full-field
//! merging. Reentrancy is broken with explicit flags rather than relying on
//! atomic execution across suspension points.
//!
//! Reconciles per-kind into a SQLite read model, logging and skipping a
//! failed row rather than aborting the whole batch.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::codec::{Kind, PreferenceEntry, Record};
use crate::doc::{ChangeAction, MapChangeEvent, SharedDocument, TransactionOrigin};
use crate::legacy_db::LegacyDb;

/// The interval during which a locally updated record cannot be deleted by a
/// remote tombstone.
pub const RECENT_WRITE_PROTECTION_WINDOW: Duration = Duration::from_secs(300);

/// Injectable wall clock so the recent-delete-protection tests don't need to sleep 300 real seconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock is after the unix epoch")
            .as_millis() as i64
    }
}

#[derive(Debug, Clone)]
pub struct RemoteChangeEvent {
    pub kind: Kind,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

enum PendingOp {
    Upsert(Kind, Record),
    Delete(Kind, String),
}

type RemoteChangeCallback = Box<dyn Fn(&RemoteChangeEvent) + Send + Sync>;
type PreferenceChangeCallback = Box<dyn Fn(&str, &serde_json::Value) + Send + Sync>;

pub struct SyncBridge {
    doc: Arc<SharedDocument>,
    legacy: Arc<LegacyDb>,
    clock: Arc<dyn Clock>,
    dm_ready: AtomicBool,
    is_applying_remote_change: Arc<AtomicBool>,
    is_applying_remote_preference: Arc<AtomicBool>,
    pending: Mutex<VecDeque<PendingOp>>,
    remote_change_subscribers: Mutex<HashMap<Kind, Vec<RemoteChangeCallback>>>,
    preference_change_subscribers: Mutex<Vec<PreferenceChangeCallback>>,
    preference_allow_list: Vec<&'static str>,
    window: Duration,
}

impl SyncBridge {
    pub fn new(doc: Arc<SharedDocument>, legacy: Arc<LegacyDb>) -> Self {
        Self::with_clock(doc, legacy, Arc::new(SystemClock))
    }

    pub fn with_clock(doc: Arc<SharedDocument>, legacy: Arc<LegacyDb>, clock: Arc<dyn Clock>) -> Self {
        Self {
            doc,
            legacy,
            clock,
            dm_ready: AtomicBool::new(false),
            is_applying_remote_change: Arc::new(AtomicBool::new(false)),
            is_applying_remote_preference: Arc::new(AtomicBool::new(false)),
            pending: Mutex::new(VecDeque::new()),
            remote_change_subscribers: Mutex::new(HashMap::new()),
            preference_change_subscribers: Mutex::new(Vec::new()),
            preference_allow_list: vec!["language", "theme", "notificationsEnabled"],
            window: RECENT_WRITE_PROTECTION_WINDOW,
        }
    }

    /// Override the recent-write protection window, e.g. to match a host's
    /// own `SyncConfig` rather than the pinned default.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Called once the Durable Mirror signals readiness: runs the startup
    /// merge for every synced kind, flushes any queued pending ops, then
    /// installs the per-kind observers that drive remote-change handling.
    pub async fn init(&self) -> Result<(), crate::legacy_db::LegacyDbError> {
        for &kind in Kind::RECORD_KINDS {
            self.startup_merge(kind).await?;
        }
        self.init_preferences().await?;
        self.dm_ready.store(true, Ordering::SeqCst);
        self.flush_pending().await?;
        tracing::debug!("sync bridge startup merge complete, pending queue flushed");
        Ok(())
    }

    fn is_dm_ready(&self) -> bool {
        self.dm_ready.load(Ordering::SeqCst)
    }

    async fn flush_pending(&self) -> Result<(), crate::legacy_db::LegacyDbError> {
        let queued: Vec<PendingOp> = {
            let mut q = self.pending.lock().expect("pending queue mutex poisoned");
            q.drain(..).collect()
        };
        for op in queued {
            match op {
                PendingOp::Upsert(kind, record) => self.upsert(kind, record).await?,
                PendingOp::Delete(kind, id) => self.delete(kind, &id).await?,
            }
        }
        Ok(())
    }

    /// Local write: forwarded to the Shared Document unless a remote change
    /// is currently being applied (breaks the echo loop), queued if the
    /// Durable Mirror is not yet ready.
    pub async fn upsert(&self, kind: Kind, record: Record) -> Result<(), crate::legacy_db::LegacyDbError> {
        if !self.is_dm_ready() {
            self.pending
                .lock()
                .expect("pending queue mutex poisoned")
                .push_back(PendingOp::Upsert(kind, record));
            return Ok(());
        }
        self.legacy.upsert(kind, &record).await?;
        if self.is_applying_remote_change.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.doc.set(kind, &record) {
            tracing::warn!(kind = kind.as_str(), error = %e, "failed to mirror local write into shared document");
        }
        Ok(())
    }

    pub async fn delete(&self, kind: Kind, id: &str) -> Result<(), crate::legacy_db::LegacyDbError> {
        if !self.is_dm_ready() {
            self.pending
                .lock()
                .expect("pending queue mutex poisoned")
                .push_back(PendingOp::Delete(kind, id.to_string()));
            return Ok(());
        }
        self.legacy.delete(kind, id).await?;
        if self.is_applying_remote_change.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.doc.delete(kind, id);
        Ok(())
    }

    pub fn on_preference_change(&self, callback: impl Fn(&str, &serde_json::Value) + Send + Sync + 'static) {
        self.preference_change_subscribers
            .lock()
            .expect("preference change subscribers mutex poisoned")
            .push(Box::new(callback));
    }

    pub fn on_remote_change(&self, kind: Kind, callback: impl Fn(&RemoteChangeEvent) + Send + Sync + 'static) {
        self.remote_change_subscribers
            .lock()
            .expect("remote change subscribers mutex poisoned")
            .entry(kind)
            .or_default()
            .push(Box::new(callback));
    }

    /// Pushes every locally-stored record of every synced kind into the
    /// Shared Document. Called by the Sync Controller before transitioning
    /// into `share` mode.
    pub async fn force_load_to_sd(&self) -> Result<(), crate::legacy_db::LegacyDbError> {
        for &kind in Kind::RECORD_KINDS {
            let records = self.legacy.list(kind).await?;
            self.doc.transact(|_txn| {});
            for record in records {
                if let Err(e) = self.doc.set(kind, &record) {
                    tracing::warn!(kind = kind.as_str(), record_id = %record.id, error = %e, "skipping record during force load");
                }
            }
        }
        Ok(())
    }

    async fn startup_merge(&self, kind: Kind) -> Result<(), crate::legacy_db::LegacyDbError> {
        let local_records = self.legacy.list(kind).await?;
        let sd_records = self.doc.entries(kind);

        if local_records.is_empty() && sd_records.is_empty() {
            return Ok(());
        }
        if sd_records.is_empty() {
            for record in &local_records {
                if let Err(e) = self.doc.set(kind, record) {
                    tracing::warn!(kind = kind.as_str(), error = %e, "skipping record pushing local state to shared document");
                }
            }
            return Ok(());
        }
        if local_records.is_empty() {
            for record in &sd_records {
                if let Err(e) = self.legacy.upsert(kind, record).await {
                    tracing::warn!(kind = kind.as_str(), error = %e, "skipping record absorbing shared document state locally");
                }
            }
            return Ok(());
        }

        let local_by_id: HashMap<&str, &Record> =
            local_records.iter().map(|r| (r.id.as_str(), r)).collect();
        let mut local_wins = Vec::new();

        for sd_record in &sd_records {
            match local_by_id.get(sd_record.id.as_str()) {
                None => {
                    let _ = self.legacy.upsert(kind, sd_record).await;
                }
                Some(local_record) => {
                    if timestamp_rule_prefers_first(sd_record, local_record) {
                        let _ = self.legacy.upsert(kind, sd_record).await;
                    } else {
                        local_wins.push((*local_record).clone());
                    }
                }
            }
        }
        let sd_ids: std::collections::HashSet<&str> =
            sd_records.iter().map(|r| r.id.as_str()).collect();
        for local_record in &local_records {
            if !sd_ids.contains(local_record.id.as_str()) {
                local_wins.push(local_record.clone());
            }
        }
        for record in local_wins {
            if let Err(e) = self.doc.set(kind, &record) {
                tracing::warn!(kind = kind.as_str(), error = %e, "skipping record restoring local state to shared document");
            }
        }
        Ok(())
    }

    /// Install the observer that reacts to remote-origin changes on one kind.
    /// Must be called once the bridge is wrapped in an `Arc` so the closure
    /// can hold a weak-free clone of the pieces it needs.
    pub fn install_observers(self: &Arc<Self>) {
        for &kind in Kind::RECORD_KINDS {
            let bridge = self.clone();
            self.doc.observe(kind, move |event: MapChangeEvent| {
                if event.origin != TransactionOrigin::Remote {
                    return;
                }
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    bridge.handle_remote_changes(event).await;
                });
            });
        }
        self.install_preference_observer();
    }

    async fn handle_remote_changes(&self, event: MapChangeEvent) {
        self.is_applying_remote_change.store(true, Ordering::SeqCst);

        let mut added = Vec::new();
        let mut updated = Vec::new();
        let mut deleted = Vec::new();

        for (id, action) in &event.key_changes {
            match action {
                ChangeAction::Add => {
                    let record = self.doc.get(event.kind, id);
                    if let Some(record) = record {
                        match self.legacy.get(event.kind, id).await {
                            Ok(None) => {
                                if let Err(e) = self.legacy.upsert(event.kind, &record).await {
                                    tracing::warn!(kind = event.kind.as_str(), record_id = %id, error = %e, "skipping added record during merge");
                                    continue;
                                }
                                added.push(id.clone());
                            }
                            Ok(Some(local)) => {
                                if timestamp_rule_prefers_first(&record, &local) {
                                    let _ = self.legacy.upsert(event.kind, &record).await;
                                    updated.push(id.clone());
                                } else {
                                    self.restore_local(event.kind, local);
                                }
                            }
                            Err(e) => tracing::warn!(kind = event.kind.as_str(), record_id = %id, error = %e, "skipping added record, local lookup failed"),
                        }
                    }
                }
                ChangeAction::Update => {
                    let record = self.doc.get(event.kind, id);
                    if let Some(record) = record {
                        match self.legacy.get(event.kind, id).await {
                            Ok(Some(local)) if !timestamp_rule_prefers_first(&record, &local) => {
                                self.restore_local(event.kind, local);
                            }
                            _ => {
                                if let Err(e) = self.legacy.upsert(event.kind, &record).await {
                                    tracing::warn!(kind = event.kind.as_str(), record_id = %id, error = %e, "skipping updated record during merge");
                                    continue;
                                }
                                updated.push(id.clone());
                            }
                        }
                    }
                }
                ChangeAction::Delete => {
                    match self.legacy.get(event.kind, id).await {
                        Ok(Some(local)) => {
                            let within_window = local
                                .effective_timestamp_millis()
                                .map(|ts| self.clock.now_millis() - ts < self.window.as_millis() as i64)
                                .unwrap_or(false);
                            if within_window {
                                self.restore_local(event.kind, local);
                            } else {
                                let _ = self.legacy.delete(event.kind, id).await;
                                deleted.push(id.clone());
                            }
                        }
                        Ok(None) => deleted.push(id.clone()),
                        Err(e) => tracing::warn!(kind = event.kind.as_str(), record_id = %id, error = %e, "skipping delete during merge"),
                    }
                }
            }
        }

        self.is_applying_remote_change.store(false, Ordering::SeqCst);

        if !added.is_empty() || !updated.is_empty() || !deleted.is_empty() {
            self.notify_remote_change(RemoteChangeEvent {
                kind: event.kind,
                added,
                updated,
                deleted,
            });
        }
    }

    /// Writes `record` back to the Shared Document as a fresh local-origin
    /// write so it both wins the merge and is re-propagated to senders —
    /// this is the "local wins" restore path used by the update and
    /// recent-delete-protection rules. Intentionally bypasses `upsert`
    /// (already applied to `legacy`; only the Shared Document needs the write).
    fn restore_local(&self, kind: Kind, record: Record) {
        if let Err(e) = self.doc.set(kind, &record) {
            tracing::warn!(kind = kind.as_str(), record_id = %record.id, error = %e, "failed to restore locally-won record");
        }
    }

    fn notify_remote_change(&self, event: RemoteChangeEvent) {
        let subscribers = self.remote_change_subscribers.lock().expect("remote change subscribers mutex poisoned");
        if let Some(callbacks) = subscribers.get(&event.kind) {
            for callback in callbacks {
                callback(&event);
            }
        }
    }

    async fn init_preferences(&self) -> Result<(), crate::legacy_db::LegacyDbError> {
        let all_empty = {
            let local_prefs = self.legacy.list_preferences().await?;
            local_prefs.is_empty()
        };
        if all_empty {
            for key in &self.preference_allow_list {
                if let Some(entry) = self.legacy.get_preference(key).await? {
                    self.write_preference_to_sd(key, &entry);
                }
            }
        } else {
            for key in &self.preference_allow_list {
                if let Some(entry) = self.legacy.get_preference(key).await? {
                    self.legacy.set_preference(key, &entry).await?;
                }
            }
        }
        Ok(())
    }

    fn write_preference_to_sd(&self, key: &str, entry: &PreferenceEntry) {
        self.is_applying_remote_preference.store(true, Ordering::SeqCst);
        let record = Record {
            id: key.to_string(),
            fields: serde_json::json!({"value": entry.value, "updatedAt": entry.updated_at}),
        };
        if let Err(e) = self.doc.set(Kind::Preferences, &record) {
            tracing::warn!(key, error = %e, "failed to seed preference into shared document");
        }
        self.is_applying_remote_preference.store(false, Ordering::SeqCst);
    }

    /// Observer on the preferences map: writes back to the legacy preference
    /// store only when the remote value differs from the current one, guarded
    /// by `is_applying_remote_preference` to avoid echoing the write it itself issues.
    fn install_preference_observer(self: &Arc<Self>) {
        let bridge = self.clone();
        self.doc.observe(Kind::Preferences, move |event: MapChangeEvent| {
            if event.origin != TransactionOrigin::Remote {
                return;
            }
            let bridge = bridge.clone();
            tokio::spawn(async move {
                for (key, _action) in &event.key_changes {
                    let Some(record) = bridge.doc.get(Kind::Preferences, key) else {
                        continue;
                    };
                    let incoming = PreferenceEntry {
                        value: record.fields.get("value").cloned().unwrap_or(serde_json::Value::Null),
                        updated_at: record
                            .fields
                            .get("updatedAt")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                    };
                    let current = bridge.legacy.get_preference(key).await.ok().flatten();
                    if current.as_ref().map(|c| &c.value) != Some(&incoming.value) {
                        bridge.is_applying_remote_preference.store(true, Ordering::SeqCst);
                        if let Err(e) = bridge.legacy.set_preference(key, &incoming).await {
                            tracing::warn!(key, error = %e, "failed to write remote preference into legacy store");
                        }
                        bridge.is_applying_remote_preference.store(false, Ordering::SeqCst);
                        let subscribers = bridge.preference_change_subscribers.lock().expect("preference change subscribers mutex poisoned");
                        for callback in subscribers.iter() {
                            callback(key, &incoming.value);
                        }
                    }
                }
            });
        });
    }

    /// A local settings-store write: records `{value, updatedAt: now}` into
    /// the preferences map unless currently applying a remote preference.
    pub fn set_preference(&self, key: &str, value: serde_json::Value) {
        if !self.preference_allow_list.contains(&key) {
            return;
        }
        if self.is_applying_remote_preference.load(Ordering::SeqCst) {
            return;
        }
        let updated_at = format_now_iso(self.clock.now_millis());
        let entry = PreferenceEntry::new(value, updated_at);
        self.write_preference_to_sd(key, &entry);
    }
}

/// True when the first record's effective timestamp is newer or equal to the second's.
fn timestamp_rule_prefers_first(a: &Record, b: &Record) -> bool {
    match (a.effective_timestamp_millis(), b.effective_timestamp_millis()) {
        (Some(ta), Some(tb)) => ta >= tb,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => true,
    }
}

fn format_now_iso(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .unwrap_or_else(|| chrono::DateTime::from_timestamp_millis(0).expect("epoch is representable"))
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedClock(std::sync::atomic::AtomicI64);
    impl Clock for FixedClock {
        fn now_millis(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    async fn bridge_with_clock(now: i64) -> (Arc<SyncBridge>, Arc<SharedDocument>, Arc<LegacyDb>) {
        let doc = Arc::new(SharedDocument::new());
        let legacy = Arc::new(LegacyDb::open("sqlite::memory:").await.unwrap());
        let clock = Arc::new(FixedClock(std::sync::atomic::AtomicI64::new(now)));
        let bridge = Arc::new(SyncBridge::with_clock(doc.clone(), legacy.clone(), clock));
        bridge.init().await.unwrap();
        bridge.install_observers();
        (bridge, doc, legacy)
    }

    fn record(id: &str, name: &str, ts: i64) -> Record {
        Record {
            id: id.to_string(),
            fields: json!({"name": name, "updatedAt": ts}),
        }
    }

    #[tokio::test]
    async fn solo_boot_upsert_reaches_shared_document_and_legacy() {
        let (bridge, doc, legacy) = bridge_with_clock(0).await;
        bridge.upsert(Kind::Agents, record("a1", "X", 0)).await.unwrap();
        assert_eq!(doc.get(Kind::Agents, "a1").unwrap().fields["name"], "X");
        assert!(legacy.get(Kind::Agents, "a1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn upserts_before_ready_are_queued_then_flushed() {
        let doc = Arc::new(SharedDocument::new());
        let legacy = Arc::new(LegacyDb::open("sqlite::memory:").await.unwrap());
        let bridge = Arc::new(SyncBridge::new(doc.clone(), legacy.clone()));
        bridge.upsert(Kind::Agents, record("a1", "X", 0)).await.unwrap();
        assert!(doc.get(Kind::Agents, "a1").is_none());
        bridge.init().await.unwrap();
        assert_eq!(doc.get(Kind::Agents, "a1").unwrap().fields["name"], "X");
    }

    #[tokio::test]
    async fn remote_add_is_absorbed_into_legacy_and_notifies_subscribers() {
        let (bridge, doc, legacy) = bridge_with_clock(10_000).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        bridge.on_remote_change(Kind::Conversations, move |event| {
            seen_clone.lock().unwrap().push(event.clone());
        });

        doc.set_as_remote(Kind::Conversations, &record("c1", "hello", 10_000)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(legacy.get(Kind::Conversations, "c1").await.unwrap().is_some());
        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].added, vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn timestamp_rule_prefers_newer_write_regardless_of_delivery_order() {
        let (bridge, doc, legacy) = bridge_with_clock(5_000).await;
        bridge.upsert(Kind::Knowledge, record("k1", "old", 1_000)).await.unwrap();

        doc.set_as_remote(Kind::Knowledge, &record("k1", "new", 2_000)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let local = legacy.get(Kind::Knowledge, "k1").await.unwrap().unwrap();
        assert_eq!(local.fields["name"], "new");
    }

    #[tokio::test]
    async fn remote_delete_within_recent_write_window_is_rejected_and_restored() {
        let (bridge, doc, legacy) = bridge_with_clock(60_000).await;
        // local record updated 60s ago relative to "now" = 60_000ms
        bridge.upsert(Kind::Tasks, record("t1", "mine", 0)).await.unwrap();

        doc.delete_as_remote(Kind::Tasks, "t1");
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(legacy.get(Kind::Tasks, "t1").await.unwrap().is_some());
        assert!(doc.get(Kind::Tasks, "t1").is_some());
    }

    #[tokio::test]
    async fn remote_delete_outside_window_is_applied() {
        let (bridge, doc, legacy) = bridge_with_clock(10 * 60 * 1000).await;
        bridge.upsert(Kind::Tasks, record("t1", "mine", 0)).await.unwrap();

        doc.delete_as_remote(Kind::Tasks, "t1");
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(legacy.get(Kind::Tasks, "t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn no_echo_invariant_blocks_forward_while_applying_remote_change() {
        let (bridge, doc, _legacy) = bridge_with_clock(0).await;
        bridge.is_applying_remote_change.store(true, Ordering::SeqCst);
        bridge.upsert(Kind::Agents, record("a1", "X", 0)).await.unwrap();
        assert!(doc.get(Kind::Agents, "a1").is_none());
    }
}
