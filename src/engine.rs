//! The owned-context object wiring the Shared Document, Durable Mirror,
//! Sync Bridge, Sync Manager, and Sync Controller into one handle a host
//! application constructs explicitly, plus the thin URL-parsing helpers
//! from the external-interfaces surface.
//!
//! Built as an explicit owned value rather than a process-global `OnceLock`
//! singleton — a host that wants a process-wide default can still opt into
//! one via `Engine::install_default`/`Engine::default_instance`.

use std::sync::{Arc, OnceLock};

use crate::bridge::SyncBridge;
use crate::codec::{Kind, PreferenceEntry, Record};
use crate::config::SyncConfig;
use crate::controller::{PersistedSessionState, SessionState, SyncController, SyncMode};
use crate::credentials::CredentialStore;
use crate::doc::SharedDocument;
use crate::error::SyncError;
use crate::legacy_db::LegacyDb;
use crate::manager::{SyncManager, SyncStatus};
use crate::mirror::DurableMirror;
use crate::provider::{ActivitySample, PeerDescriptor};

#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub session: SessionState,
    pub manager: SyncStatus,
    pub peers: Vec<PeerDescriptor>,
    pub recent_activity: Vec<ActivitySample>,
}

/// One fully wired sync engine: a Shared Document plus its durability,
/// reconciliation, networking, and state-machine collaborators.
pub struct Engine {
    doc: Arc<SharedDocument>,
    mirror: Arc<DurableMirror>,
    legacy: Arc<LegacyDb>,
    bridge: Arc<SyncBridge>,
    manager: Arc<SyncManager>,
    controller: Arc<SyncController>,
    config: SyncConfig,
}

impl Engine {
    /// Open the durable mirror at `mirror_url` and the legacy database at
    /// `legacy_url` (each e.g. `sqlite://path?mode=rwc` or `sqlite::memory:`
    /// for tests), then wire every collaborator together. Does not call
    /// `initialize()` — callers choose when to await the durable mirror.
    pub async fn open(
        mirror_url: &str,
        legacy_url: &str,
        config: SyncConfig,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Arc<Self>, SyncError> {
        let doc = Arc::new(SharedDocument::new());
        let mirror = Arc::new(DurableMirror::open_with_timeout(mirror_url, config.mirror_ready_timeout).await?);
        mirror.clone().init(doc.clone()).await;

        let legacy = Arc::new(LegacyDb::open(legacy_url).await?);
        let bridge = Arc::new(SyncBridge::new(doc.clone(), legacy.clone()).with_window(config.recent_write_protection_window));
        bridge.init().await?;
        bridge.install_observers();

        let manager = SyncManager::new(doc.clone(), config.clone());
        let controller = SyncController::new(
            doc.clone(),
            mirror.clone(),
            bridge.clone(),
            manager.clone(),
            credentials,
        );

        Ok(Arc::new(Self {
            doc,
            mirror,
            legacy,
            bridge,
            manager,
            controller,
            config,
        }))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn initialize(&self) {
        self.controller.initialize().await;
    }

    pub async fn seed_persisted_state(&self, persisted: PersistedSessionState) {
        self.controller.seed_persisted_state(persisted).await;
    }

    /// The `{enabled, roomId, mode, needsPasswordReentry}` record a host
    /// should write to its own settings store after any session change.
    pub async fn persisted_state(&self) -> PersistedSessionState {
        self.controller.persisted_state().await
    }

    pub async fn enable_sync(
        self: &Arc<Self>,
        room_id: &str,
        password: &str,
        mode: SyncMode,
        server_url: Option<&str>,
    ) -> Result<(), SyncError> {
        self.controller.enable_sync(room_id, password, mode, server_url).await
    }

    pub async fn disable_sync(&self) {
        self.controller.disable_sync().await;
    }

    pub async fn sync_item(&self, kind: Kind, record: Record) -> Result<(), SyncError> {
        self.bridge.upsert(kind, record).await?;
        Ok(())
    }

    pub async fn delete_item(&self, kind: Kind, id: &str) -> Result<(), SyncError> {
        self.bridge.delete(kind, id).await?;
        Ok(())
    }

    pub async fn load_data(&self, kind: Kind) -> Result<Vec<Record>, SyncError> {
        Ok(self.legacy.list(kind).await?)
    }

    pub async fn get_store_data(&self, kind: Kind, id: &str) -> Result<Option<Record>, SyncError> {
        Ok(self.legacy.get(kind, id).await?)
    }

    pub async fn force_load_data(&self) -> Result<(), SyncError> {
        self.bridge.force_load_to_sd().await?;
        Ok(())
    }

    pub fn clear_preferences(&self) {
        self.doc.clear(Kind::Preferences);
    }

    pub fn set_preference(&self, key: &str, value: serde_json::Value) {
        self.bridge.set_preference(key, value);
    }

    pub async fn get_preferences(&self) -> Result<Vec<(String, PreferenceEntry)>, SyncError> {
        Ok(self.legacy.list_preferences().await?)
    }

    pub async fn get_status(&self) -> StatusSnapshot {
        self.controller.sync_from_manager_status().await;
        StatusSnapshot {
            session: self.controller.state().await,
            manager: self.manager.status(),
            peers: self.manager.peers().await,
            recent_activity: self.manager.recent_activity().await,
        }
    }

    pub fn doc(&self) -> &Arc<SharedDocument> {
        &self.doc
    }

    pub fn mirror(&self) -> &Arc<DurableMirror> {
        &self.mirror
    }

    pub fn bridge(&self) -> &Arc<SyncBridge> {
        &self.bridge
    }

    pub fn manager(&self) -> &Arc<SyncManager> {
        &self.manager
    }
}

static DEFAULT_ENGINE: OnceLock<Arc<Engine>> = OnceLock::new();

/// Install a process-wide default `Engine`. Fails (returning the value back)
/// if one is already installed; a process gets at most one default instance.
pub fn install_default(engine: Arc<Engine>) -> Result<(), Arc<Engine>> {
    DEFAULT_ENGINE.set(engine)
}

pub fn default_instance() -> Option<Arc<Engine>> {
    DEFAULT_ENGINE.get().cloned()
}

/// Build the outbound sync-sharing URL for `room_id` against `origin`.
pub fn build_join_url(origin: &str, room_id: &str) -> String {
    format!("{}?join={}", origin.trim_end_matches('/'), room_id)
}

/// Parse a room id out of either a full join URL or a bare room id, accepting
/// both the `join` and `room` query parameter names.
pub fn parse_join_param(input: &str) -> Option<String> {
    let query = input.split('?').nth(1).unwrap_or(input);
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next()?;
        let value = parts.next();
        if let Some(value) = value {
            if key == "join" || key == "room" {
                return Some(value.to_string());
            }
        }
    }
    if !input.contains('?') && !input.contains('=') && !input.is_empty() {
        return Some(input.to_string());
    }
    None
}
