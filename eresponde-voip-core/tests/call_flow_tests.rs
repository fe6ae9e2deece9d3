//! End-to-end call flows: two session managers sharing one store

use eresponde_voip_core::prelude::*;
use eresponde_voip_core::testing::{
    FakeAudioRouter, FakeMediaProvider, FakePeerConnector, StaticPermissions,
};
use eresponde_voip_core::{
    AudioRouter, CallError, CallRole, IceCandidate, MediaProvider, PeerConnector,
    RemoteStreamHandle, SdpType, SessionDescription, SignalingChannel,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Endpoint {
    manager: CallSessionManager,
    media: Arc<FakeMediaProvider>,
    router: Arc<FakeAudioRouter>,
    connector: Arc<FakePeerConnector>,
}

fn endpoint(store: &MemoryStore, user_id: &str) -> Endpoint {
    let media = Arc::new(FakeMediaProvider::new());
    let router = Arc::new(FakeAudioRouter::new());
    let connector = Arc::new(FakePeerConnector::new());
    let manager = CallSessionManager::with_config(
        Platform {
            store: Arc::new(store.clone()),
            permissions: Arc::new(StaticPermissions::granted()),
            media: Arc::clone(&media) as Arc<dyn MediaProvider>,
            router: Arc::clone(&router) as Arc<dyn AudioRouter>,
            connector: Arc::clone(&connector) as Arc<dyn PeerConnector>,
        },
        SessionConfig {
            offer_retry_base: Duration::from_millis(1),
            ..SessionConfig::default()
        },
    );
    manager.set_local_user(user_id);
    Endpoint {
        manager,
        media,
        router,
        connector,
    }
}

async fn seed_accounts(store: &MemoryStore) {
    store
        .set(
            "accounts/civilian/civ-1",
            json!({"firstName": "Ana", "lastName": "Cruz"}),
        )
        .await
        .unwrap();
    store
        .set(
            "accounts/police/pol-1",
            json!({"firstName": "Ria", "lastName": "Reyes"}),
        )
        .await
        .unwrap();
    store
        .set(
            "reports/r1",
            json!({"reporterUid": "civ-1", "assignedOfficerId": "pol-1"}),
        )
        .await
        .unwrap();
}

fn officer() -> Party {
    Party {
        user_id: "pol-1".to_string(),
        role: Role::Police,
        name: "Ria Reyes".to_string(),
    }
}

fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 UDP 2122260223 10.0.0.{n} 5000 typ host"),
        sdp_mline_index: Some(0),
        sdp_mid: Some("audio".to_string()),
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[tokio::test]
async fn test_full_call_round_trip() {
    init_tracing();
    let store = MemoryStore::new();
    seed_accounts(&store).await;
    let caller = endpoint(&store, "civ-1");
    let callee = endpoint(&store, "pol-1");

    // The callee is listening for incoming calls before anything happens.
    let watcher = IncomingCallWatcher::new(Arc::new(store.clone()));
    let mut incoming = watcher.watch("pol-1");

    let call_id = caller
        .manager
        .initiate(officer(), Some("r1".to_string()))
        .await
        .unwrap();

    let ringing = incoming.recv().await.unwrap();
    assert_eq!(ringing.call_id, call_id);
    assert_eq!(ringing.caller.name, "Ana Cruz");
    assert_eq!(ringing.status, CallStatus::Ringing);

    callee.manager.answer(call_id).await.unwrap();
    settle().await;

    // The caller's side picked up the published answer.
    let caller_peer = caller.connector.last_connection().unwrap();
    let applied = caller_peer.remote_description().unwrap();
    assert!(applied.sdp.contains("fake-answer"));

    // ICE trickles both ways through the store.
    caller.connector.emit_candidate(candidate(1));
    caller.connector.emit_candidate(candidate(2));
    callee.connector.emit_candidate(candidate(3));
    settle().await;

    let callee_peer = callee.connector.last_connection().unwrap();
    assert_eq!(
        callee_peer.applied_candidates(),
        vec![candidate(1), candidate(2)]
    );
    assert_eq!(caller_peer.applied_candidates(), vec![candidate(3)]);

    // The callee hangs up; the caller observes it and releases everything.
    let mut caller_events = caller.manager.subscribe_events();
    callee.manager.end(call_id).await.unwrap();
    settle().await;

    let record = store.get(&format!("calls/{call_id}")).await.unwrap();
    assert_eq!(record["status"], "ended");
    assert!(record.get("endedAt").is_some());

    assert!(caller.manager.current_call_id().await.is_none());
    assert!(callee.manager.current_call_id().await.is_none());
    assert!(caller_peer.is_closed());
    assert!(callee_peer.is_closed());
    assert!(caller.media.last_stream().unwrap().is_stopped());
    assert!(callee.media.last_stream().unwrap().is_stopped());

    let mut saw_remote_terminated = false;
    while let Ok(event) = caller_events.try_recv() {
        if matches!(
            event,
            CallEvent::RemoteTerminated {
                status: CallStatus::Ended,
                ..
            }
        ) {
            saw_remote_terminated = true;
        }
    }
    assert!(saw_remote_terminated);
}

#[tokio::test]
async fn test_caller_buffers_candidates_until_answer_applied() {
    let store = MemoryStore::new();
    seed_accounts(&store).await;
    let caller = endpoint(&store, "civ-1");

    let call_id = caller.manager.initiate(officer(), None).await.unwrap();
    let caller_peer = caller.connector.last_connection().unwrap();

    // Callee-side candidates land before any answer exists. They must not
    // reach the peer connection yet.
    let signaling = SignalingChannel::new(Arc::new(store.clone()));
    signaling
        .publish_ice_candidate(call_id, CallRole::Callee, &candidate(1))
        .await
        .unwrap();
    signaling
        .publish_ice_candidate(call_id, CallRole::Callee, &candidate(2))
        .await
        .unwrap();
    settle().await;
    assert!(caller_peer.applied_candidates().is_empty());

    // Once the answer arrives the buffered candidates flush in order.
    signaling
        .publish_answer(
            call_id,
            &SessionDescription {
                sdp: "v=0 remote-answer".to_string(),
                kind: SdpType::Answer,
            },
        )
        .await
        .unwrap();
    settle().await;

    assert_eq!(caller_peer.remote_description().unwrap().sdp, "v=0 remote-answer");
    assert_eq!(
        caller_peer.applied_candidates(),
        vec![candidate(1), candidate(2)]
    );
}

#[tokio::test]
async fn test_rejected_call_never_reaches_media() {
    let store = MemoryStore::new();
    seed_accounts(&store).await;
    let caller = endpoint(&store, "civ-1");
    let callee = endpoint(&store, "pol-1");

    let watcher = IncomingCallWatcher::new(Arc::new(store.clone()));
    let mut incoming = watcher.watch("pol-1");

    let call_id = caller.manager.initiate(officer(), None).await.unwrap();
    let ringing = incoming.recv().await.unwrap();
    callee.manager.reject(ringing.call_id).await.unwrap();
    settle().await;

    let record = store.get(&format!("calls/{call_id}")).await.unwrap();
    assert_eq!(record["status"], "rejected");
    assert!(callee.media.last_stream().is_none());

    // The caller's status watcher releases the pending call.
    assert!(caller.manager.current_call_id().await.is_none());
    assert!(caller.connector.last_connection().unwrap().is_closed());
}

#[tokio::test]
async fn test_answer_blocked_while_another_call_is_active() {
    let store = MemoryStore::new();
    seed_accounts(&store).await;
    let caller = endpoint(&store, "civ-1");

    caller.manager.initiate(officer(), None).await.unwrap();
    let result = caller.manager.answer(CallId::new()).await;
    assert!(matches!(result, Err(CallError::CallInProgress)));
}

#[tokio::test]
async fn test_remote_stream_switches_to_speakerphone() {
    let store = MemoryStore::new();
    seed_accounts(&store).await;
    let caller = endpoint(&store, "civ-1");

    caller.manager.initiate(officer(), None).await.unwrap();
    assert!(!caller.router.speakerphone());

    caller
        .connector
        .emit_remote_stream(RemoteStreamHandle {
            stream_id: "remote-audio".to_string(),
        });
    settle().await;
    assert!(caller.router.speakerphone());

    // Teardown routes audio back to the earpiece.
    let call_id = caller.manager.current_call_id().await.unwrap();
    caller.manager.end(call_id).await.unwrap();
    assert!(!caller.router.speakerphone());
}
