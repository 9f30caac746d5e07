//! End-to-end scenarios against two or more `Engine` instances, linked by an
//! in-process channel standing in for the encrypted relay so no real network
//! socket is needed.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::json;
use sync_engine::{Engine, Kind, PreferenceEntry, Record, SessionState, SyncConfig, SyncMode, SyncStatus};
use sync_engine::credentials::InMemoryCredentialStore;
use sync_engine::provider::SyncProvider;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn new_engine_uninitialized() -> Arc<Engine> {
    init_tracing();
    Engine::open(
        "sqlite::memory:",
        "sqlite::memory:",
        SyncConfig::default(),
        Arc::new(InMemoryCredentialStore::new()),
    )
    .await
    .unwrap()
}

async fn new_engine() -> Arc<Engine> {
    let engine = new_engine_uninitialized().await;
    engine.initialize().await;
    engine
}

/// A bare websocket acceptor standing in for the relay: holds the connection
/// open and drains frames without interpreting them. Enough for tests that
/// only need a real `enable_sync` to reach `Connected`, not multi-peer relay.
async fn spawn_local_relay() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                    while let Some(frame) = ws.next().await {
                        if frame.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
    format!("ws://{addr}")
}

/// Link two engines' Shared Documents directly through a pair of providers,
/// forwarding each side's outbound wire messages straight to the other's
/// inbound handler. Stands in for the encrypted relay in these tests.
async fn link(a: &Arc<Engine>, b: &Arc<Engine>) {
    let (provider_a, mut out_a) = SyncProvider::new(a.doc().clone(), 1, 50);
    let (provider_b, mut out_b) = SyncProvider::new(b.doc().clone(), 2, 50);

    tokio::spawn(async move {
        while let Some(message) = out_a.recv().await {
            provider_b.handle_inbound(message, 0);
        }
    });
    tokio::spawn(async move {
        while let Some(message) = out_b.recv().await {
            provider_a.handle_inbound(message, 0);
        }
    });

    // Kick off the handshake: each side asks the other for its current state.
    let sv_a = a.doc().encode_state_vector();
    let sv_b = b.doc().encode_state_vector();
    let update_for_b = a.doc().encode_state_as_update(&sv_b).unwrap();
    let update_for_a = b.doc().encode_state_as_update(&sv_a).unwrap();
    b.doc().apply_remote_update(&update_for_b).unwrap();
    a.doc().apply_remote_update(&update_for_a).unwrap();
}

async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

#[tokio::test]
async fn s1_solo_boot_upsert_reaches_map_and_local_db() {
    let engine = new_engine().await;
    engine
        .sync_item(Kind::Agents, Record { id: "a1".into(), fields: json!({"name": "X", "updatedAt": 0}) })
        .await
        .unwrap();

    assert_eq!(engine.doc().get(Kind::Agents, "a1").unwrap().fields["name"], "X");
    assert_eq!(engine.load_data(Kind::Agents).await.unwrap().len(), 1);
}

#[tokio::test]
async fn s2_two_peer_share_remote_change_fires_once_with_added_id() {
    let a = new_engine().await;
    let b = new_engine().await;
    link(&a, &b).await;

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    b.bridge().on_remote_change(Kind::Conversations, move |event| {
        seen_clone.lock().unwrap().push(event.clone());
    });

    a.sync_item(
        Kind::Conversations,
        Record { id: "c1".into(), fields: json!({"title": "hello", "updatedAt": 1_000}) },
    )
    .await
    .unwrap();
    settle().await;

    let events = seen.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].added, vec!["c1".to_string()]);
    assert_eq!(b.load_data(Kind::Conversations).await.unwrap().len(), 1);
}

#[tokio::test]
async fn s3_timestamp_wins_regardless_of_delivery_order() {
    let a = new_engine().await;
    let b = new_engine().await;

    a.sync_item(Kind::Knowledge, Record { id: "k1".into(), fields: json!({"body": "old", "updatedAt": 1_000}) })
        .await
        .unwrap();
    b.sync_item(Kind::Knowledge, Record { id: "k1".into(), fields: json!({"body": "new", "updatedAt": 2_000}) })
        .await
        .unwrap();

    link(&a, &b).await;
    settle().await;

    let a_local = a.load_data(Kind::Knowledge).await.unwrap();
    let b_local = b.load_data(Kind::Knowledge).await.unwrap();
    assert_eq!(a_local.iter().find(|r| r.id == "k1").unwrap().fields["body"], "new");
    assert_eq!(b_local.iter().find(|r| r.id == "k1").unwrap().fields["body"], "new");
}

#[tokio::test]
async fn s4_recent_delete_guard_survives_with_local_version() {
    let a = new_engine().await;
    let b = new_engine().await;

    // B "updated" t1 recently (effective timestamp close to the shared clock's now).
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    b.sync_item(Kind::Tasks, Record { id: "t1".into(), fields: json!({"name": "mine", "updatedAt": now}) })
        .await
        .unwrap();

    link(&a, &b).await;
    settle().await;

    a.delete_item(Kind::Tasks, "t1").await.unwrap();
    settle().await;

    assert!(b.load_data(Kind::Tasks).await.unwrap().iter().any(|r| r.id == "t1"));
}

#[tokio::test]
async fn s5_restart_requires_reentry_then_reconnects_on_password_resubmission() -> anyhow::Result<()> {
    let relay_url = spawn_local_relay().await;

    let engine_a = new_engine().await;
    engine_a
        .enable_sync("room-5", "correct-horse", SyncMode::Share, Some(&relay_url))
        .await?;
    settle().await;
    let status = engine_a.get_status().await;
    assert_eq!(status.session, SessionState::Connected);
    assert_eq!(status.manager, SyncStatus::Connected);

    let persisted = engine_a.persisted_state().await;
    assert!(persisted.enabled);

    // Simulate a cold restart: a fresh process with the persisted session
    // record (password is never part of it) and an empty in-memory mirror.
    let engine_b = new_engine_uninitialized().await;
    engine_b.seed_persisted_state(persisted).await;
    engine_b.initialize().await;

    let status = engine_b.get_status().await;
    assert_eq!(status.session, SessionState::AwaitingReentry);
    assert_eq!(status.manager, SyncStatus::Disabled);
    assert!(status.peers.is_empty());

    // The host's password-reentry modal resubmits the same password.
    engine_b
        .enable_sync("room-5", "correct-horse", SyncMode::Share, Some(&relay_url))
        .await?;
    settle().await;
    let status = engine_b.get_status().await;
    assert_eq!(status.session, SessionState::Connected);
    assert_eq!(status.manager, SyncStatus::Connected);
    assert!(!engine_b.persisted_state().await.needs_password_reentry);

    Ok(())
}

#[tokio::test]
async fn s6_join_clears_local_preferences_before_absorbing_room_state() {
    let b = new_engine().await;
    b.set_preference("language", json!("fr"));
    settle().await;
    assert_eq!(
        b.get_preferences().await.unwrap().into_iter().find(|(k, _)| k == "language").unwrap().1.value,
        json!("fr")
    );

    // Simulate joining: clear local prefs, then absorb the room's own value.
    b.clear_preferences();
    b.doc()
        .set_as_remote(
            Kind::Preferences,
            &Record { id: "language".into(), fields: json!({"value": "en", "updatedAt": "1"}) },
        )
        .unwrap();
    settle().await;

    let prefs = b.get_preferences().await.unwrap();
    let language = prefs.into_iter().find(|(k, _)| k == "language").map(|(_, v)| v);
    assert_eq!(language, Some(PreferenceEntry::new(json!("en"), "1")));
}
