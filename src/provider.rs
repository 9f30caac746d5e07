//! CRDT-over-websocket provider: binds an `EncryptingTransport` to the
//! Shared Document with a state-vector handshake, full-state exchange on
//! reconnect, and awareness-based peer presence.
//!
//! Grounded on `examples/other_examples/1403ba30_refmdio-refmd__api-src-infrastructure-realtime-hub.rs.rs`'s
//! sync-message construction around a `Doc`/`Awareness` pair.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::bridge::{Clock, SystemClock};
use crate::doc::{SharedDocument, TransactionOrigin};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone)]
pub struct ActivitySample {
    pub direction: Direction,
    pub bytes: usize,
    pub timestamp_millis: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub client_id: u64,
    pub is_local: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum WireMessage {
    SyncStep1 { state_vector: Vec<u8> },
    SyncStep2 { update: Vec<u8> },
    Update { update: Vec<u8> },
    Awareness { client_id: u64, present: bool },
}

type ActivityCallback = Box<dyn Fn(&ActivitySample) + Send + Sync>;

/// Outbound frames the provider wants sent, and inbound frames it has
/// already applied — kept as plain data so `manager.rs` owns the actual
/// transport I/O and this type stays transport-agnostic and unit-testable.
pub struct SyncProvider {
    doc: Arc<SharedDocument>,
    local_client_id: u64,
    peers: Mutex<HashSet<u64>>,
    activity: Mutex<VecDeque<ActivitySample>>,
    activity_capacity: usize,
    activity_subscribers: Mutex<Vec<ActivityCallback>>,
    outbound_tx: mpsc::UnboundedSender<WireMessage>,
    clock: Arc<dyn Clock>,
}

impl SyncProvider {
    /// Returns the provider alongside the receiving half of its outbound
    /// queue; `manager.rs` drains that queue and hands frames to the transport.
    pub fn new(
        doc: Arc<SharedDocument>,
        local_client_id: u64,
        activity_capacity: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<WireMessage>) {
        Self::with_clock(doc, local_client_id, activity_capacity, Arc::new(SystemClock))
    }

    /// Same as [`Self::new`] but with an injectable clock, for tests that need
    /// deterministic `ActivitySample` timestamps.
    pub fn with_clock(
        doc: Arc<SharedDocument>,
        local_client_id: u64,
        activity_capacity: usize,
        clock: Arc<dyn Clock>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<WireMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let provider = Arc::new(Self {
            doc,
            local_client_id,
            peers: Mutex::new(HashSet::from([local_client_id])),
            activity: Mutex::new(VecDeque::with_capacity(activity_capacity)),
            activity_capacity,
            activity_subscribers: Mutex::new(Vec::new()),
            outbound_tx,
            clock,
        });
        provider.clone().install_update_observer();
        (provider, outbound_rx)
    }

    /// Registers the doc-level observer that turns local-origin mutations
    /// into outbound `Update` frames.
    fn install_update_observer(self: Arc<Self>) {
        let provider = self;
        provider.doc.clone().observe_updates_with_origin(move |update, origin| {
            if origin == TransactionOrigin::Remote {
                // Applied directly from the network or from absorbing another
                // peer's state during merge; rebroadcasting it would loop.
                // Local "restore" writes from the Sync Bridge use the local
                // origin specifically so they DO get rebroadcast here.
                return;
            }
            provider.record_activity(Direction::Sent, update.len());
            provider.enqueue_outbound(WireMessage::Update { update: update.to_vec() });
        });
    }

    fn enqueue_outbound(&self, message: WireMessage) {
        let _ = self.outbound_tx.send(message);
    }

    pub fn state_vector_message(&self) -> WireMessage {
        WireMessage::SyncStep1 {
            state_vector: self.doc.encode_state_vector(),
        }
    }

    /// Kick off the handshake by announcing this document's state vector and
    /// this peer's presence, once a transport is ready to carry them.
    pub fn enqueue_handshake(&self) {
        self.enqueue_outbound(self.state_vector_message());
        self.enqueue_outbound(WireMessage::Awareness {
            client_id: self.local_client_id,
            present: true,
        });
    }

    /// Handle one inbound wire message. A `SyncStep1` handshake reply is
    /// pushed straight onto the outbound queue rather than returned, so
    /// callers (`manager.rs`) don't need special-case branching per variant.
    pub fn handle_inbound(&self, message: WireMessage, frame_len: usize) {
        match message {
            WireMessage::SyncStep1 { state_vector } => {
                self.record_activity(Direction::Received, frame_len);
                match self.doc.encode_state_as_update(&state_vector) {
                    Ok(update) => self.enqueue_outbound(WireMessage::SyncStep2 { update }),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to encode state as update for handshake reply");
                    }
                }
            }
            WireMessage::SyncStep2 { update } | WireMessage::Update { update } => {
                self.record_activity(Direction::Received, frame_len);
                if let Err(e) = self.doc.apply_remote_update(&update) {
                    tracing::warn!(error = %e, "dropping malformed update");
                }
            }
            WireMessage::Awareness { client_id, present } => {
                let mut peers = self.peers.lock().expect("peers mutex poisoned");
                if present {
                    peers.insert(client_id);
                } else {
                    peers.remove(&client_id);
                }
            }
        }
    }

    pub fn peers(&self) -> Vec<PeerDescriptor> {
        self.peers
            .lock()
            .expect("peers mutex poisoned")
            .iter()
            .map(|&client_id| PeerDescriptor {
                client_id,
                is_local: client_id == self.local_client_id,
            })
            .collect()
    }

    pub fn local_client_id(&self) -> u64 {
        self.local_client_id
    }

    fn record_activity(&self, direction: Direction, bytes: usize) {
        let sample = ActivitySample {
            direction,
            bytes,
            timestamp_millis: self.clock.now_millis(),
        };
        {
            let mut ring = self.activity.lock().expect("activity mutex poisoned");
            if ring.len() == self.activity_capacity {
                ring.pop_front();
            }
            ring.push_back(sample.clone());
        }
        for callback in self.activity_subscribers.lock().expect("activity subscribers mutex poisoned").iter() {
            callback(&sample);
        }
    }

    pub fn recent_activity(&self) -> Vec<ActivitySample> {
        self.activity.lock().expect("activity mutex poisoned").iter().cloned().collect()
    }

    /// Subscribe to every activity sample as it is recorded, for a caller
    /// (the Worker Facade) that wants a live feed rather than a periodic poll.
    pub fn on_activity(&self, callback: impl Fn(&ActivitySample) + Send + Sync + 'static) {
        self.activity_subscribers
            .lock()
            .expect("activity subscribers mutex poisoned")
            .push(Box::new(callback));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Kind, Record};
    use serde_json::json;

    #[test]
    fn handshake_round_trips_state_between_two_providers() {
        let doc_a = Arc::new(SharedDocument::new());
        doc_a
            .set(Kind::Agents, &Record { id: "a1".into(), fields: json!({"name": "X"}) })
            .unwrap();
        let (provider_a, mut out_a) = SyncProvider::new(doc_a.clone(), 1, 50);

        let doc_b = Arc::new(SharedDocument::new());
        let (provider_b, mut out_b) = SyncProvider::new(doc_b.clone(), 2, 50);

        // B asks A for its state via SyncStep1.
        provider_a.handle_inbound(provider_b.state_vector_message(), 0);
        let reply = out_a.try_recv().expect("A should reply with SyncStep2");
        provider_b.handle_inbound(reply, 0);

        assert_eq!(doc_b.get(Kind::Agents, "a1").unwrap().fields["name"], "X");
        assert!(out_b.try_recv().is_err());
    }

    #[test]
    fn local_write_is_queued_for_outbound_broadcast() {
        let doc = Arc::new(SharedDocument::new());
        let (_provider, mut out) = SyncProvider::new(doc.clone(), 1, 50);
        doc.set(Kind::Agents, &Record { id: "a1".into(), fields: json!({"name": "X"}) })
            .unwrap();
        assert!(matches!(out.try_recv(), Ok(WireMessage::Update { .. })));
    }

    #[test]
    fn remote_applied_update_is_not_rebroadcast() {
        let doc_a = Arc::new(SharedDocument::new());
        let (_provider_a, mut out_a) = SyncProvider::new(doc_a.clone(), 1, 50);
        doc_a
            .set_as_remote(Kind::Agents, &Record { id: "a1".into(), fields: json!({"name": "X"}) })
            .unwrap();
        assert!(out_a.try_recv().is_err());
    }

    #[test]
    fn awareness_tracks_peer_presence() {
        let doc = Arc::new(SharedDocument::new());
        let (provider, _out) = SyncProvider::new(doc, 1, 50);
        provider.handle_inbound(WireMessage::Awareness { client_id: 2, present: true }, 0);
        let peers = provider.peers();
        assert_eq!(peers.len(), 2);
        assert!(peers.iter().any(|p| p.client_id == 2 && !p.is_local));

        provider.handle_inbound(WireMessage::Awareness { client_id: 2, present: false }, 0);
        assert_eq!(provider.peers().len(), 1);
    }

    #[test]
    fn activity_samples_are_stamped_with_the_injected_clock() {
        struct FixedClock(i64);
        impl Clock for FixedClock {
            fn now_millis(&self) -> i64 {
                self.0
            }
        }

        let doc = Arc::new(SharedDocument::new());
        let (provider, _out) =
            SyncProvider::with_clock(doc.clone(), 1, 10, std::sync::Arc::new(FixedClock(1_700_000_000_000)));
        doc.set(Kind::Agents, &Record { id: "a1".into(), fields: json!({"name": "X"}) })
            .unwrap();
        let sample = provider.recent_activity().into_iter().next().unwrap();
        assert_eq!(sample.timestamp_millis, 1_700_000_000_000);
    }

    #[test]
    fn activity_ring_is_bounded() {
        let doc = Arc::new(SharedDocument::new());
        let (provider, _out) = SyncProvider::new(doc.clone(), 1, 2);
        for i in 0..5 {
            doc.set(
                Kind::Agents,
                &Record { id: format!("a{i}"), fields: json!({"name": "X"}) },
            )
            .unwrap();
        }
        assert_eq!(provider.recent_activity().len(), 2);
    }
}
