use std::sync::Arc;
use std::time::Duration;

use farmcall::memory::{InMemoryPubSub, LoopbackNegotiator, SimulatedDevices};
use farmcall::records::MemoryRecordSink;
use farmcall::signaling::inbox_channel;
use farmcall::{
    CallConfig, CallDependencies, CallError, CallFailure, CallId, CallIdentity, CallKind,
    CallRecordStatus, CallSessionRegistry, CallState, EndCode, EndReason, IceCandidateInit,
    RegistryStatus, SignalEnvelope, SignalMessage, UserId,
};

struct Party {
    registry: Arc<CallSessionRegistry>,
    devices: Arc<SimulatedDevices>,
    records: Arc<MemoryRecordSink>,
    negotiator: LoopbackNegotiator,
}

async fn party(
    user: &str,
    pubsub: &Arc<InMemoryPubSub>,
    devices: SimulatedDevices,
    config: CallConfig,
) -> Party {
    let _ = env_logger::builder().is_test(true).try_init();
    let devices = Arc::new(devices);
    let records = Arc::new(MemoryRecordSink::new());
    let negotiator = LoopbackNegotiator::new();
    let registry = CallSessionRegistry::start(
        UserId::new(user),
        config,
        CallDependencies {
            pubsub: pubsub.clone(),
            negotiator: Arc::new(negotiator.clone()),
            devices: devices.clone(),
            records: records.clone(),
        },
    )
    .await
    .unwrap();
    Party {
        registry,
        devices,
        records,
        negotiator,
    }
}

async fn wait_for(party: &Party, call_id: &CallId, expected: CallState) {
    let mut rx = party
        .registry
        .watch_state(call_id)
        .await
        .unwrap_or_else(|| panic!("{call_id} is not in the slot"));
    let reached = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == expected))
        .await
        .map(|r| r.is_ok());
    assert!(
        matches!(reached, Ok(true)),
        "expected {expected}, last {}",
        *rx.borrow()
    );
}

/// Places a call from `caller` to `callee` and answers it.
async fn connect(caller: &Party, callee: &Party, kind: CallKind) -> CallIdentity {
    let mut incoming = callee.registry.events().incoming_call.subscribe();
    let identity = caller
        .registry
        .initiate(callee.registry.local_user().clone(), kind)
        .await
        .unwrap();
    let offered = tokio::time::timeout(Duration::from_secs(2), incoming.recv())
        .await
        .expect("offer never reached the callee")
        .unwrap();
    assert_eq!(offered.identity.call_id, identity.call_id);
    assert_eq!(offered.identity.kind, kind);

    callee.registry.accept(&identity.call_id).await.unwrap();
    wait_for(caller, &identity.call_id, CallState::Connected).await;
    wait_for(callee, &identity.call_id, CallState::Connected).await;
    identity
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_voice_call_connects_and_hangs_up() {
    let pubsub = Arc::new(InMemoryPubSub::new());
    let grower = party("grower", &pubsub, SimulatedDevices::new(), CallConfig::default()).await;
    let advisor = party("advisor", &pubsub, SimulatedDevices::new(), CallConfig::default()).await;

    let mut caller_states = grower.registry.events().state_changed.subscribe();
    let mut caller_streams = grower.registry.events().remote_stream.subscribe();
    let mut callee_ended = advisor.registry.events().call_ended.subscribe();

    let call = connect(&grower, &advisor, CallKind::Voice).await;
    assert_eq!(
        grower.registry.status().await,
        RegistryStatus::InCall(call.clone())
    );
    let stream = caller_streams.recv().await.unwrap();
    assert_eq!(stream.call_id, call.call_id);

    grower.registry.hang_up(&call.call_id).await.unwrap();
    assert_eq!(
        grower.registry.state(&call.call_id).await,
        Some(CallState::Ended(EndReason::LocalHangUp))
    );
    let ended = callee_ended.recv().await.unwrap();
    assert_eq!(ended.reason, EndReason::RemoteHangUp);
    assert!(ended.duration_secs.is_some());

    let mut seen = Vec::new();
    while let Ok(change) = caller_states.try_recv() {
        seen.push(change.state);
    }
    assert_eq!(
        seen,
        vec![
            CallState::Initiating,
            CallState::Ringing,
            CallState::Negotiating,
            CallState::Connected,
            CallState::Ended(EndReason::LocalHangUp),
        ]
    );

    settle().await;
    assert_eq!(grower.devices.acquire_count(), 1);
    assert_eq!(grower.devices.release_count(), 1);
    assert_eq!(advisor.devices.acquire_count(), 1);
    assert_eq!(advisor.devices.release_count(), 1);
    assert_eq!(
        grower.records.statuses(),
        vec![CallRecordStatus::Ringing, CallRecordStatus::Ended]
    );
    assert_eq!(
        advisor.records.statuses(),
        vec![CallRecordStatus::Accepted, CallRecordStatus::Ended]
    );
    // Only the caller's insert stamps the row.
    let caller_rows = grower.records.writes();
    assert_eq!(caller_rows[0].created_at, Some(call.created_at));
    assert_eq!(caller_rows[1].created_at, None);
    assert!(advisor.records.writes().iter().all(|r| r.created_at.is_none()));
    assert_eq!(grower.registry.status().await, RegistryStatus::Idle);
    assert_eq!(advisor.registry.status().await, RegistryStatus::Idle);
}

#[tokio::test]
async fn test_video_call_holds_camera_until_teardown() {
    let pubsub = Arc::new(InMemoryPubSub::new());
    let grower = party("grower", &pubsub, SimulatedDevices::new(), CallConfig::default()).await;
    let advisor = party("advisor", &pubsub, SimulatedDevices::new(), CallConfig::default()).await;

    let call = connect(&grower, &advisor, CallKind::Video).await;
    grower
        .registry
        .set_video_enabled(&call.call_id, false)
        .await
        .unwrap();
    assert_eq!(grower.devices.is_enabled("cam-1"), Some(false));
    grower.registry.set_muted(&call.call_id, true).await.unwrap();
    assert_eq!(grower.devices.is_enabled("mic-0"), Some(false));

    advisor.registry.hang_up(&call.call_id).await.unwrap();
    wait_for(
        &grower,
        &call.call_id,
        CallState::Ended(EndReason::RemoteHangUp),
    )
    .await;
    settle().await;
    assert_eq!(grower.devices.released_tracks(), vec!["mic-0", "cam-1"]);
    assert_eq!(advisor.devices.release_count(), 1);
}

#[tokio::test]
async fn test_simultaneous_hang_up_releases_once() {
    let pubsub = Arc::new(InMemoryPubSub::new());
    let grower = party("grower", &pubsub, SimulatedDevices::new(), CallConfig::default()).await;
    let advisor = party("advisor", &pubsub, SimulatedDevices::new(), CallConfig::default()).await;
    let call = connect(&grower, &advisor, CallKind::Voice).await;

    let (a, b) = tokio::join!(
        grower.registry.hang_up(&call.call_id),
        advisor.registry.hang_up(&call.call_id)
    );
    assert_eq!(a, Ok(()));
    assert_eq!(b, Ok(()));

    settle().await;
    assert_eq!(grower.devices.release_count(), 1);
    assert_eq!(advisor.devices.release_count(), 1);
    for party in [&grower, &advisor] {
        let state = party.registry.state(&call.call_id).await;
        assert!(
            matches!(
                state,
                Some(CallState::Ended(EndReason::LocalHangUp | EndReason::RemoteHangUp))
            ),
            "unexpected {state:?}"
        );
    }
}

#[tokio::test]
async fn test_busy_while_connected() {
    let pubsub = Arc::new(InMemoryPubSub::new());
    let grower = party("grower", &pubsub, SimulatedDevices::new(), CallConfig::default()).await;
    let advisor = party("advisor", &pubsub, SimulatedDevices::new(), CallConfig::default()).await;
    let vet = party("vet", &pubsub, SimulatedDevices::new(), CallConfig::default()).await;
    let call = connect(&grower, &advisor, CallKind::Voice).await;

    // Outgoing attempt from a user who is already in a call.
    assert_eq!(
        grower
            .registry
            .initiate("vet".into(), CallKind::Voice)
            .await,
        Err(CallError::Busy)
    );

    // Incoming attempt to a user who is already in a call.
    let second = vet
        .registry
        .initiate("advisor".into(), CallKind::Voice)
        .await
        .unwrap();
    wait_for(
        &vet,
        &second.call_id,
        CallState::Failed(CallFailure::Busy),
    )
    .await;

    assert_eq!(
        grower.registry.state(&call.call_id).await,
        Some(CallState::Connected)
    );
    assert_eq!(
        advisor.registry.state(&call.call_id).await,
        Some(CallState::Connected)
    );
    assert_eq!(advisor.devices.acquire_count(), 1);
    settle().await;
    assert_eq!(vet.devices.release_count(), 1);
}

#[tokio::test]
async fn test_unanswered_call_times_out() {
    let pubsub = Arc::new(InMemoryPubSub::new());
    let config = CallConfig::default().with_ring_timeout(Duration::from_millis(100));
    let grower = party("grower", &pubsub, SimulatedDevices::new(), config).await;
    let advisor = party("advisor", &pubsub, SimulatedDevices::new(), CallConfig::default()).await;
    let mut caller_ended = grower.registry.events().call_ended.subscribe();
    let mut incoming = advisor.registry.events().incoming_call.subscribe();

    let call = grower
        .registry
        .initiate("advisor".into(), CallKind::Voice)
        .await
        .unwrap();
    incoming.recv().await.unwrap();

    let ended = tokio::time::timeout(Duration::from_secs(2), caller_ended.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ended.reason, EndReason::Failure(CallFailure::Timeout));
    assert_eq!(ended.duration_secs, None);
    assert_eq!(
        grower.registry.state(&call.call_id).await,
        Some(CallState::Failed(CallFailure::Timeout))
    );

    wait_for(
        &advisor,
        &call.call_id,
        CallState::Ended(EndReason::RemoteHangUp),
    )
    .await;
    settle().await;
    assert_eq!(grower.devices.release_count(), 1);
    assert_eq!(advisor.devices.acquire_count(), 0);
    assert_eq!(
        grower.records.statuses(),
        vec![CallRecordStatus::Ringing, CallRecordStatus::Ended]
    );

    let to_advisor = pubsub.published(&inbox_channel(&"advisor".into()));
    let last = SignalEnvelope::decode(to_advisor.last().unwrap()).unwrap();
    assert_eq!(last.message, SignalMessage::End(EndCode::Timeout));
}

#[tokio::test]
async fn test_rejected_call_never_acquires_callee_media() {
    let pubsub = Arc::new(InMemoryPubSub::new());
    let grower = party("grower", &pubsub, SimulatedDevices::new(), CallConfig::default()).await;
    let advisor = party("advisor", &pubsub, SimulatedDevices::new(), CallConfig::default()).await;
    let mut incoming = advisor.registry.events().incoming_call.subscribe();

    let call = grower
        .registry
        .initiate("advisor".into(), CallKind::Video)
        .await
        .unwrap();
    incoming.recv().await.unwrap();
    assert!(matches!(
        advisor.registry.status().await,
        RegistryStatus::Incoming(pending) if pending.call_id == call.call_id && pending.kind == CallKind::Video
    ));

    advisor.registry.reject(&call.call_id).await.unwrap();
    assert_eq!(
        advisor.registry.state(&call.call_id).await,
        Some(CallState::Ended(EndReason::Rejected))
    );
    wait_for(&grower, &call.call_id, CallState::Ended(EndReason::Declined)).await;

    settle().await;
    assert_eq!(advisor.devices.acquire_count(), 0);
    assert_eq!(advisor.devices.release_count(), 0);
    assert_eq!(grower.devices.release_count(), 1);
    assert_eq!(advisor.records.statuses(), vec![CallRecordStatus::Rejected]);
    assert_eq!(grower.records.statuses(), vec![CallRecordStatus::Ringing]);
}

#[tokio::test]
async fn test_hang_up_during_permission_prompt() {
    let pubsub = Arc::new(InMemoryPubSub::new());
    let slow = SimulatedDevices::new().with_delay(Duration::from_millis(200));
    let grower = party("grower", &pubsub, slow, CallConfig::default()).await;
    let advisor = party("advisor", &pubsub, SimulatedDevices::new(), CallConfig::default()).await;
    let mut caller_ended = grower.registry.events().call_ended.subscribe();

    let call = grower
        .registry
        .initiate("advisor".into(), CallKind::Voice)
        .await
        .unwrap();
    grower.registry.hang_up(&call.call_id).await.unwrap();

    // Ended right away, without waiting for the prompt.
    assert_eq!(
        grower.registry.state(&call.call_id).await,
        Some(CallState::Ended(EndReason::LocalHangUp))
    );
    assert_eq!(
        caller_ended.try_recv().unwrap().reason,
        EndReason::LocalHangUp
    );
    assert_eq!(grower.devices.release_count(), 0);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(grower.devices.acquire_count(), 1);
    assert_eq!(grower.devices.release_count(), 1);
    assert_eq!(advisor.registry.status().await, RegistryStatus::Idle);
    assert!(
        !pubsub
            .published(&inbox_channel(&"advisor".into()))
            .iter()
            .any(|p| matches!(
                SignalEnvelope::decode(p).map(|e| e.message),
                Ok(SignalMessage::Offer { .. })
            ))
    );
}

#[tokio::test]
async fn test_denied_camera_fails_before_offer() {
    let pubsub = Arc::new(InMemoryPubSub::new());
    let grower = party(
        "grower",
        &pubsub,
        SimulatedDevices::new().deny_camera(),
        CallConfig::default(),
    )
    .await;
    let advisor = party("advisor", &pubsub, SimulatedDevices::new(), CallConfig::default()).await;

    let call = grower
        .registry
        .initiate("advisor".into(), CallKind::Video)
        .await
        .unwrap();
    wait_for(
        &grower,
        &call.call_id,
        CallState::Failed(CallFailure::PermissionDenied),
    )
    .await;
    settle().await;
    assert_eq!(grower.devices.release_count(), 0);
    assert_eq!(advisor.registry.status().await, RegistryStatus::Idle);
    assert!(grower.records.statuses().is_empty());

    // The slot is free again.
    let retry = grower
        .registry
        .initiate("advisor".into(), CallKind::Voice)
        .await;
    assert!(retry.is_ok());
    grower.registry.shutdown().await;
}

#[tokio::test]
async fn test_candidate_ahead_of_offer_reaches_callee() {
    let pubsub = Arc::new(InMemoryPubSub::new());
    let advisor = party("advisor", &pubsub, SimulatedDevices::new(), CallConfig::default()).await;
    let mut incoming = advisor.registry.events().incoming_call.subscribe();
    let inbox = inbox_channel(&"advisor".into());
    let call_id = CallId::new("C1");

    // The candidate overtakes the offer on the wire.
    let early = SignalEnvelope::new(
        call_id.clone(),
        "grower".into(),
        SignalMessage::IceCandidate(IceCandidateInit::new("candidate:early")),
    );
    pubsub.deliver(&inbox, &early.encode());
    assert_eq!(advisor.registry.status().await, RegistryStatus::Idle);

    let offer = SignalEnvelope::new(
        call_id.clone(),
        "grower".into(),
        SignalMessage::Offer {
            sdp: "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n".into(),
            kind: CallKind::Voice,
        },
    );
    pubsub.deliver(&inbox, &offer.encode());
    tokio::time::timeout(Duration::from_secs(2), incoming.recv())
        .await
        .expect("offer never surfaced")
        .unwrap();

    advisor.registry.accept(&call_id).await.unwrap();
    wait_for(&advisor, &call_id, CallState::Connected).await;

    let journal = advisor.negotiator.journal();
    let answer_at = journal.iter().position(|e| e == "answer").unwrap();
    let early_at = journal
        .iter()
        .position(|e| e == "candidate:candidate:early")
        .unwrap_or_else(|| panic!("candidate missing from {journal:?}"));
    assert!(answer_at < early_at);
    advisor.registry.shutdown().await;
}
