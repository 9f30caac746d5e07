//! Worker Facade: a tagged request/response protocol so SD+DM+SB+SM+SC can
//! run on a separate execution context (a second OS thread or task owning
//! its own `Engine`) behind nothing but message passing. The facade holds
//! no logic beyond translating requests into `Engine` calls and tagging
//! replies with the originating request id.
//!
//! A request-dispatch match statement reshaped around channels instead of
//! an FFI boundary.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::bridge::RemoteChangeEvent;
use crate::codec::{Kind, PreferenceEntry, Record};
use crate::controller::SyncMode;
use crate::engine::{Engine, StatusSnapshot};
use crate::error::SyncError;
use crate::provider::ActivitySample;

#[derive(Debug)]
pub enum WorkerRequest {
    Init,
    Enable { room_id: String, password: String, mode: SyncMode, server_url: Option<String> },
    Disable,
    SyncItem { kind: Kind, record: Record },
    DeleteItem { kind: Kind, id: String },
    LoadData { kind: Kind },
    ForceLoadData,
    ClearPreferences,
    SetPreference { key: String, value: Value },
    GetPreferences,
    GetStoreData { kind: Kind, id: String },
    GetStatus,
}

#[derive(Debug, Clone)]
pub enum WorkerResponse {
    Initialized,
    Status(StatusSnapshotSummary),
    Records(Vec<Record>),
    Record(Option<Record>),
    Preferences(Vec<(String, PreferenceEntry)>),
    Ack,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct StatusSnapshotSummary {
    pub session: String,
    pub manager: String,
    pub peer_count: usize,
    pub recent_activity: Vec<ActivitySample>,
}

impl From<StatusSnapshot> for StatusSnapshotSummary {
    fn from(s: StatusSnapshot) -> Self {
        Self {
            session: format!("{:?}", s.session),
            manager: format!("{:?}", s.manager),
            peer_count: s.peers.len(),
            recent_activity: s.recent_activity,
        }
    }
}

/// Unsolicited events the worker task pushes without a matching request.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Ready,
    Status(StatusSnapshotSummary),
    RemoteChange(RemoteChangeEventSummary),
    PreferenceChange { key: String, value: Value },
    Activity(ActivitySample),
    Log(String),
}

#[derive(Debug, Clone)]
pub struct RemoteChangeEventSummary {
    pub kind: Kind,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

impl From<&RemoteChangeEvent> for RemoteChangeEventSummary {
    fn from(e: &RemoteChangeEvent) -> Self {
        Self {
            kind: e.kind,
            added: e.added.clone(),
            updated: e.updated.clone(),
            deleted: e.deleted.clone(),
        }
    }
}

struct PendingRequest {
    request: WorkerRequest,
    reply: oneshot::Sender<WorkerResponse>,
}

/// The caller-facing half of the facade: send a request and await its reply,
/// or subscribe to unsolicited events.
#[derive(Clone)]
pub struct WorkerHandle {
    requests: mpsc::Sender<PendingRequest>,
    events: broadcast::Sender<WorkerEvent>,
    request_timeout: Duration,
}

impl WorkerHandle {
    pub async fn call(&self, request: WorkerRequest) -> Result<WorkerResponse, SyncError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(PendingRequest { request, reply: tx })
            .await
            .map_err(|_| SyncError::WorkerChannelClosed)?;
        tokio::time::timeout(self.request_timeout, rx)
            .await
            .map_err(|_| SyncError::WorkerTimeout)?
            .map_err(|_| SyncError::WorkerChannelClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }
}

/// Spawn the task that owns `engine` and drains its request channel. Also
/// wires the engine's remote-change and preference-change callbacks, and its
/// manager status signal, into the broadcast event stream.
pub fn spawn_worker(engine: Arc<Engine>) -> WorkerHandle {
    let (request_tx, mut request_rx) = mpsc::channel::<PendingRequest>(64);
    let (event_tx, _event_rx) = broadcast::channel(256);
    let request_timeout = engine.config().worker_request_timeout;

    install_event_wiring(&engine, &event_tx);
    let _ = event_tx.send(WorkerEvent::Ready);

    tokio::spawn(async move {
        while let Some(pending) = request_rx.recv().await {
            let response = handle_request(&engine, pending.request).await;
            let _ = pending.reply.send(response);
        }
    });

    WorkerHandle { requests: request_tx, events: event_tx, request_timeout }
}

fn install_event_wiring(engine: &Arc<Engine>, event_tx: &broadcast::Sender<WorkerEvent>) {
    let tx = event_tx.clone();
    for &kind in Kind::RECORD_KINDS {
        let tx = tx.clone();
        engine.bridge().on_remote_change(kind, move |event| {
            let _ = tx.send(WorkerEvent::RemoteChange(event.into()));
        });
    }

    let tx = event_tx.clone();
    engine.bridge().on_preference_change(move |key, value| {
        let _ = tx.send(WorkerEvent::PreferenceChange { key: key.to_string(), value: value.clone() });
    });

    let mut status_rx = engine.manager().status_signal();
    let tx = event_tx.clone();
    let status_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            let _ = tx.send(WorkerEvent::Status(status_engine.get_status().await.into()));
            if status_rx.changed().await.is_err() {
                return;
            }
        }
    });

    let mut activity_rx = engine.manager().activity_signal();
    let tx = event_tx.clone();
    tokio::spawn(async move {
        loop {
            match activity_rx.recv().await {
                Ok(sample) => {
                    let _ = tx.send(WorkerEvent::Activity(sample));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    let mut log_rx = engine.manager().log_signal();
    let tx = event_tx.clone();
    tokio::spawn(async move {
        loop {
            match log_rx.recv().await {
                Ok(line) => {
                    let _ = tx.send(WorkerEvent::Log(line));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

async fn handle_request(engine: &Arc<Engine>, request: WorkerRequest) -> WorkerResponse {
    match request {
        WorkerRequest::Init => {
            engine.initialize().await;
            WorkerResponse::Initialized
        }
        WorkerRequest::Enable { room_id, password, mode, server_url } => {
            match engine.enable_sync(&room_id, &password, mode, server_url.as_deref()).await {
                Ok(()) => WorkerResponse::Ack,
                Err(e) => WorkerResponse::Error(e.to_string()),
            }
        }
        WorkerRequest::Disable => {
            engine.disable_sync().await;
            WorkerResponse::Ack
        }
        WorkerRequest::SyncItem { kind, record } => match engine.sync_item(kind, record).await {
            Ok(()) => WorkerResponse::Ack,
            Err(e) => WorkerResponse::Error(e.to_string()),
        },
        WorkerRequest::DeleteItem { kind, id } => match engine.delete_item(kind, &id).await {
            Ok(()) => WorkerResponse::Ack,
            Err(e) => WorkerResponse::Error(e.to_string()),
        },
        WorkerRequest::LoadData { kind } => match engine.load_data(kind).await {
            Ok(records) => WorkerResponse::Records(records),
            Err(e) => WorkerResponse::Error(e.to_string()),
        },
        WorkerRequest::ForceLoadData => match engine.force_load_data().await {
            Ok(()) => WorkerResponse::Ack,
            Err(e) => WorkerResponse::Error(e.to_string()),
        },
        WorkerRequest::ClearPreferences => {
            engine.clear_preferences();
            WorkerResponse::Ack
        }
        WorkerRequest::SetPreference { key, value } => {
            engine.set_preference(&key, value);
            WorkerResponse::Ack
        }
        WorkerRequest::GetPreferences => match engine.get_preferences().await {
            Ok(prefs) => WorkerResponse::Preferences(prefs),
            Err(e) => WorkerResponse::Error(e.to_string()),
        },
        WorkerRequest::GetStoreData { kind, id } => match engine.get_store_data(kind, &id).await {
            Ok(record) => WorkerResponse::Record(record),
            Err(e) => WorkerResponse::Error(e.to_string()),
        },
        WorkerRequest::GetStatus => WorkerResponse::Status(engine.get_status().await.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::credentials::InMemoryCredentialStore;
    use serde_json::json;

    async fn handle() -> WorkerHandle {
        let engine = Engine::open(
            "sqlite::memory:",
            "sqlite::memory:",
            SyncConfig::default(),
            Arc::new(InMemoryCredentialStore::new()),
        )
        .await
        .unwrap();
        spawn_worker(engine)
    }

    #[tokio::test]
    async fn init_request_initializes_the_controller() {
        let handle = handle().await;
        let response = handle.call(WorkerRequest::Init).await.unwrap();
        assert!(matches!(response, WorkerResponse::Initialized));
    }

    #[tokio::test]
    async fn sync_item_then_load_data_round_trips() {
        let handle = handle().await;
        handle
            .call(WorkerRequest::SyncItem {
                kind: Kind::Agents,
                record: Record { id: "a1".into(), fields: json!({"name": "X"}) },
            })
            .await
            .unwrap();
        let response = handle.call(WorkerRequest::LoadData { kind: Kind::Agents }).await.unwrap();
        match response {
            WorkerResponse::Records(records) => assert_eq!(records.len(), 1),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn enable_with_empty_password_surfaces_as_error_response() {
        let handle = handle().await;
        let response = handle
            .call(WorkerRequest::Enable {
                room_id: "room-1".into(),
                password: String::new(),
                mode: SyncMode::Share,
                server_url: None,
            })
            .await
            .unwrap();
        assert!(matches!(response, WorkerResponse::Error(_)));
    }

    #[tokio::test]
    async fn set_then_get_preferences_round_trips() {
        let handle = handle().await;
        handle.call(WorkerRequest::Init).await.unwrap();
        handle
            .call(WorkerRequest::SetPreference { key: "theme".into(), value: json!("dark") })
            .await
            .unwrap();
        let response = handle.call(WorkerRequest::GetPreferences).await.unwrap();
        match response {
            WorkerResponse::Preferences(prefs) => {
                assert!(prefs.iter().any(|(k, v)| k == "theme" && v.value == json!("dark")));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
