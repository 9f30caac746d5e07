//! Sync Manager: derives the room name and encryption key from the password,
//! opens the encrypting transport to the relay, binds it to the Shared
//! Document through the provider, and surfaces status/peers/activity.
//!
//! A single owned-transport collaborator exposing a `connection_status()`-
//! style signal, over a websocket relay carrying AEAD-sealed frames.

use std::sync::Arc;

use rand::RngCore;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::SyncConfig;
use crate::crypto::{self, CryptoError};
use crate::doc::SharedDocument;
use crate::provider::{ActivitySample, PeerDescriptor, SyncProvider, WireMessage};
use crate::transport::EncryptingTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Disabled,
    Connecting,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Transport(#[from] crate::transport::TransportError),
}

struct ActiveSession {
    io_task: JoinHandle<()>,
    provider: Arc<SyncProvider>,
}

/// Owns (at most) one live relay connection at a time. `enable` is an
/// idempotent replacement: calling it while already connected tears down the
/// previous session first.
pub struct SyncManager {
    doc: Arc<SharedDocument>,
    config: SyncConfig,
    session: Mutex<Option<ActiveSession>>,
    status_tx: watch::Sender<SyncStatus>,
    status_rx: watch::Receiver<SyncStatus>,
    activity_tx: broadcast::Sender<ActivitySample>,
    log_tx: broadcast::Sender<String>,
}

impl SyncManager {
    pub fn new(doc: Arc<SharedDocument>, config: SyncConfig) -> Arc<Self> {
        let (status_tx, status_rx) = watch::channel(SyncStatus::Disabled);
        let (activity_tx, _) = broadcast::channel(256);
        let (log_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            doc,
            config,
            session: Mutex::new(None),
            status_tx,
            status_rx,
            activity_tx,
            log_tx,
        })
    }

    pub fn status(&self) -> SyncStatus {
        *self.status_rx.borrow()
    }

    pub fn status_signal(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }

    /// Live feed of activity samples as they're recorded, across reconnects
    /// (subscribing once keeps working even if the underlying session is replaced).
    pub fn activity_signal(&self) -> broadcast::Receiver<ActivitySample> {
        self.activity_tx.subscribe()
    }

    /// Human-readable lines for conditions a host's UI may want to surface
    /// live (transport errors, dropped frames) without scraping `tracing` output.
    pub fn log_signal(&self) -> broadcast::Receiver<String> {
        self.log_tx.subscribe()
    }

    pub async fn peers(&self) -> Vec<PeerDescriptor> {
        match self.session.lock().await.as_ref() {
            Some(session) => session.provider.peers(),
            None => Vec::new(),
        }
    }

    pub async fn recent_activity(&self) -> Vec<ActivitySample> {
        match self.session.lock().await.as_ref() {
            Some(session) => session.provider.recent_activity(),
            None => Vec::new(),
        }
    }

    /// Enable (or idempotently replace) the sync session for `room_id` under `password`.
    #[tracing::instrument(skip(self, password, server_url), fields(room_id = %room_id))]
    pub async fn enable(
        self: &Arc<Self>,
        room_id: &str,
        password: &str,
        server_url: Option<&str>,
    ) -> Result<(), ManagerError> {
        self.disable().await;
        self.status_tx.send_replace(SyncStatus::Connecting);

        let iterations = self.config.pbkdf2_iterations;
        let (room_id_a, password_a) = (room_id.to_string(), password.to_string());
        let (room_id_b, password_b) = (room_id.to_string(), password.to_string());
        let (room_name, key) = tokio::try_join!(
            spawn_blocking_derive(move || crypto::derive_room_name(&room_id_a, &password_a, iterations)),
            spawn_blocking_derive(move || crypto::derive_encryption_key(&room_id_b, &password_b, iterations)),
        )?;

        let base_url = server_url.unwrap_or(&self.config.default_server_url);
        let url = format!("{}{}", base_url.trim_end_matches('/'), format!("/{room_name}"));
        let transport = EncryptingTransport::connect(&url, key).await?;
        tracing::info!("relay transport connected");

        let local_client_id = rand::thread_rng().next_u64();
        let (provider, outbound_rx) =
            SyncProvider::new(self.doc.clone(), local_client_id, self.config.activity_ring_capacity);
        let activity_tx = self.activity_tx.clone();
        provider.on_activity(move |sample| {
            let _ = activity_tx.send(sample.clone());
        });

        let manager = self.clone();
        let provider_for_task = provider.clone();
        let io_span = tracing::Span::current();
        let io_task = tokio::spawn(
            async move {
                manager.run_io_loop(transport, provider_for_task, outbound_rx).await;
            }
            .instrument(io_span),
        );

        *self.session.lock().await = Some(ActiveSession { io_task, provider: provider.clone() });
        provider.enqueue_handshake();
        self.status_tx.send_replace(SyncStatus::Connected);
        tracing::info!("sync manager connected");
        Ok(())
    }

    async fn run_io_loop(
        self: Arc<Self>,
        mut transport: EncryptingTransport<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        provider: Arc<SyncProvider>,
        mut outbound_rx: tokio::sync::mpsc::UnboundedReceiver<WireMessage>,
    ) {
        loop {
            tokio::select! {
                incoming = transport.recv() => {
                    match incoming {
                        Ok(Some(bytes)) => {
                            match serde_json::from_slice::<WireMessage>(&bytes) {
                                Ok(message) => provider.handle_inbound(message, bytes.len()),
                                Err(e) => {
                                    let _ = self.log_tx.send(format!("dropping frame with unparseable wire message: {e}"));
                                    tracing::warn!(error = %e, "dropping frame with unparseable wire message");
                                }
                            }
                        }
                        Ok(None) => {
                            let _ = self.log_tx.send("relay connection closed, transitioning to connecting".to_string());
                            self.status_tx.send_replace(SyncStatus::Connecting);
                            return;
                        }
                        Err(e) => {
                            let _ = self.log_tx.send(format!("transport error, transitioning to connecting: {e}"));
                            tracing::warn!(error = %e, "transport error, transitioning to connecting");
                            self.status_tx.send_replace(SyncStatus::Connecting);
                            return;
                        }
                    }
                }
                Some(message) = outbound_rx.recv() => {
                    match serde_json::to_vec(&message) {
                        Ok(bytes) => {
                            if let Err(e) = transport.send(&bytes).await {
                                let _ = self.log_tx.send(format!("failed to send frame, transitioning to connecting: {e}"));
                                tracing::warn!(error = %e, "failed to send frame, transitioning to connecting");
                                self.status_tx.send_replace(SyncStatus::Connecting);
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = self.log_tx.send(format!("failed to serialize outbound wire message: {e}"));
                            tracing::warn!(error = %e, "failed to serialize outbound wire message");
                        }
                    }
                }
            }
        }
    }

    /// Tear down the transport and any in-flight io task. Synchronous from
    /// the caller's view of local state: `status()` reflects `Disabled`
    /// immediately even though the underlying socket close races in the background.
    pub async fn disable(&self) {
        self.status_tx.send_replace(SyncStatus::Disabled);
        if let Some(session) = self.session.lock().await.take() {
            session.io_task.abort();
            tracing::info!("sync manager disconnected");
        }
    }
}

async fn spawn_blocking_derive<T, F>(f: F) -> Result<T, CryptoError>
where
    F: FnOnce() -> Result<T, CryptoError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .expect("PBKDF2 derivation task must not panic")
}
