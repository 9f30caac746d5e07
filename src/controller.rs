//! Sync Controller: the process-wide enable/disable state machine. Wires the
//! Sync Bridge's local state into the Sync Manager's network session and
//! couples credential re-encryption to the transition.
//!
//! A connect/disconnect lifecycle guarded by a single mutex, generalized
//! from "one network mode" to the full idle/connecting/connected/
//! awaiting-reentry state machine.

use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use crate::bridge::SyncBridge;
use crate::credentials::CredentialStore;
use crate::doc::SharedDocument;
use crate::error::SyncError;
use crate::manager::{SyncManager, SyncStatus};
use crate::mirror::DurableMirror;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// This device owns the authoritative local state; push it into the room on enable.
    Share,
    /// This device is joining an existing room; discard local-only state (preferences) first.
    Join,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Idle,
    AwaitingReentry,
    PasswordPrompt { pending_room_id: String },
    Connecting,
    Connected,
}

/// The subset of controller state a host application persists across restarts.
/// The password itself is never part of this and must never be written to disk.
#[derive(Debug, Clone, Default)]
pub struct PersistedSessionState {
    pub enabled: bool,
    pub room_id: Option<String>,
    pub mode: Option<SyncMode>,
    pub needs_password_reentry: bool,
}

struct Inner {
    state: SessionState,
    persisted: PersistedSessionState,
}

pub struct SyncController {
    doc: Arc<SharedDocument>,
    mirror: Arc<DurableMirror>,
    bridge: Arc<SyncBridge>,
    manager: Arc<SyncManager>,
    credentials: Arc<dyn CredentialStore>,
    inner: Mutex<Inner>,
    initialized: OnceCell<()>,
}

impl SyncController {
    pub fn new(
        doc: Arc<SharedDocument>,
        mirror: Arc<DurableMirror>,
        bridge: Arc<SyncBridge>,
        manager: Arc<SyncManager>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            doc,
            mirror,
            bridge,
            manager,
            credentials,
            inner: Mutex::new(Inner {
                state: SessionState::Uninitialized,
                persisted: PersistedSessionState::default(),
            }),
            initialized: OnceCell::new(),
        })
    }

    /// Restore `persisted` as the starting point (e.g. loaded from a host
    /// application's own settings store) before the first `initialize()` call.
    pub async fn seed_persisted_state(&self, persisted: PersistedSessionState) {
        self.inner.lock().await.persisted = persisted;
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state.clone()
    }

    pub async fn persisted_state(&self) -> PersistedSessionState {
        self.inner.lock().await.persisted.clone()
    }

    /// Idempotent: concurrent callers all await the same underlying work via `OnceCell`.
    pub async fn initialize(&self) {
        self.initialized
            .get_or_init(|| async {
                self.mirror.wait_ready().await;
                let mut inner = self.inner.lock().await;
                inner.state = if inner.persisted.enabled && inner.persisted.room_id.is_some() {
                    inner.persisted.needs_password_reentry = true;
                    SessionState::AwaitingReentry
                } else {
                    SessionState::Idle
                };
            })
            .await;
    }

    /// Called when a host application discovers a room id to join (e.g. from
    /// a shared link) before it has a password to go with it.
    pub async fn set_pending_join_room_id(&self, room_id: String) {
        let mut inner = self.inner.lock().await;
        inner.state = SessionState::PasswordPrompt { pending_room_id: room_id };
    }

    /// Enable sync for `room_id` under `password`. Implicitly calls
    /// `initialize()` first if it hasn't run yet.
    #[tracing::instrument(skip(self, password, server_url), fields(room_id = %room_id, mode = ?mode))]
    pub async fn enable_sync(
        self: &Arc<Self>,
        room_id: &str,
        password: &str,
        mode: SyncMode,
        server_url: Option<&str>,
    ) -> Result<(), SyncError> {
        if password.is_empty() {
            return Err(SyncError::EmptyPassword);
        }
        if room_id.is_empty() {
            return Err(SyncError::MissingRoomId);
        }
        self.initialize().await;

        {
            let mut inner = self.inner.lock().await;
            inner.state = SessionState::Connecting;
        }
        tracing::info!("enabling sync session");

        if mode == SyncMode::Join {
            self.doc.clear(crate::codec::Kind::Preferences);
        } else {
            self.bridge.force_load_to_sd().await?;
        }

        self.manager.enable(room_id, password, server_url).await?;

        if let Err(e) = self.credentials.enable_sync_mode(password, room_id) {
            tracing::warn!(error = %e, "credential re-encryption into sync mode failed, continuing");
        }

        let mut inner = self.inner.lock().await;
        inner.state = match self.manager.status() {
            SyncStatus::Connected => SessionState::Connected,
            _ => SessionState::Connecting,
        };
        inner.persisted = PersistedSessionState {
            enabled: true,
            room_id: Some(room_id.to_string()),
            mode: Some(mode),
            needs_password_reentry: false,
        };
        tracing::info!(state = ?inner.state, "sync session enabled");
        Ok(())
    }

    /// Tear down the active session. Always succeeds locally even if
    /// credential re-encryption fails (private-browsing tolerance).
    pub async fn disable_sync(&self) {
        let room_id = self.inner.lock().await.persisted.room_id.clone();
        tracing::info!(?room_id, "disabling sync session");
        self.manager.disable().await;
        if let Err(e) = self.credentials.disable_sync_mode() {
            tracing::warn!(error = %e, "credential re-encryption into local-only mode failed, continuing");
        }
        let mut inner = self.inner.lock().await;
        inner.state = SessionState::Idle;
        inner.persisted = PersistedSessionState::default();
        tracing::info!(?room_id, "sync session disabled");
    }

    /// Reflect the manager's live connection status into the session state,
    /// called whenever a host polls or subscribes to `SM`'s status signal.
    pub async fn sync_from_manager_status(&self) {
        let status = self.manager.status();
        let mut inner = self.inner.lock().await;
        inner.state = match (&inner.state, status) {
            (SessionState::Connecting, SyncStatus::Connected) => SessionState::Connected,
            (SessionState::Connected, SyncStatus::Connecting) => SessionState::Connecting,
            (other, _) => other.clone(),
        };
    }
}
