//! Multi-device sync scenarios against an in-process relay.

#![allow(clippy::unwrap_used)]

use engram_core::{DeviceId, EntityId, HybridLogicalClock, ManualTimeSource, TimeSource};
use engram_crypto::{CryptoProvider, DeviceKeyPair};
use engram_journal::{sort_events_by_hlc, EntityType, EventFactory, OpKind, OpLogEvent};
use engram_pairing::{PairingCeremony, TrustRequest};
use engram_store::{LocalStore, StoreKey};
use engram_sync::{
    CycleOutcome, DeviceInfo, InMemoryRelay, Relay, SyncConfig, SyncService, PUSH_WATERMARK_KEY,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct TestDevice {
    time: Arc<ManualTimeSource>,
    clock: Arc<HybridLogicalClock>,
    crypto: Arc<CryptoProvider>,
    factory: EventFactory,
    store: Arc<LocalStore>,
    service: SyncService,
}

fn test_device(name: &str, start_ms: i64, relay: Arc<InMemoryRelay>) -> TestDevice {
    test_device_with_config(name, start_ms, relay, SyncConfig::default())
}

fn test_device_with_config(
    name: &str,
    start_ms: i64,
    relay: Arc<InMemoryRelay>,
    config: SyncConfig,
) -> TestDevice {
    let time = Arc::new(ManualTimeSource::new(start_ms));
    let device_id = DeviceId::new(name);
    let clock = Arc::new(HybridLogicalClock::new(device_id.clone(), time.clone()));
    let crypto = Arc::new(CryptoProvider::new(DeviceKeyPair::generate(
        device_id,
        time.as_ref(),
    )));
    let factory = EventFactory::new(clock.clone(), crypto.clone());
    let store = Arc::new(LocalStore::open_in_memory(StoreKey::generate()).unwrap());
    let service = SyncService::new(
        config,
        relay,
        store.clone(),
        clock.clone(),
        crypto.clone(),
        DeviceInfo {
            nickname: name.to_string(),
            platform: "test".to_string(),
        },
        time.clone(),
    );
    TestDevice {
        time,
        clock,
        crypto,
        factory,
        store,
        service,
    }
}

/// Run the real pairing ceremony between two devices.
fn pair(trusted: &TestDevice, joining: &TestDevice) {
    let ceremony = PairingCeremony::new(trusted.time.clone());
    let request = TrustRequest::new(&joining.crypto, "test peer", trusted.time.now_ms());
    let encoded = request.encode_transport().unwrap();
    let decoded = TrustRequest::decode_transport(&encoded).unwrap();
    let issued = ceremony.issue_code(&decoded).unwrap();
    let grant = ceremony.confirm_code(&issued.code, &trusted.crypto).unwrap();
    grant.adopt(&joining.crypto, "test peer").unwrap();
}

fn create_memory(device: &TestDevice, entity: &str, payload: serde_json::Value) -> OpLogEvent {
    let event = device
        .factory
        .create_event(
            EntityType::Memory,
            EntityId::new(entity),
            OpKind::Create,
            &payload,
        )
        .unwrap();
    device.store.append_own_event(&event).unwrap();
    event
}

#[tokio::test]
async fn three_devices_sort_and_reject_corruption() {
    let relay = Arc::new(InMemoryRelay::new());
    let alice = test_device("alice", 1_700_000_000_000, relay.clone());
    let bob = test_device("bob", 1_700_000_000_000, relay.clone());
    let carol = test_device("carol", 1_700_000_000_000, relay.clone());
    pair(&alice, &bob);
    pair(&alice, &carol);

    let e1 = create_memory(&alice, "m-1", json!({"n": 1}));
    alice.time.advance(1_000);
    let e2 = create_memory(&alice, "m-2", json!({"n": 2}));
    alice.time.advance(1_000);
    let e3 = create_memory(&alice, "m-3", json!({"n": 3}));
    assert!(e1.hlc < e2.hlc && e2.hlc < e3.hlc);

    // Sorting any permutation reproduces emission order.
    let mut shuffled = vec![e3.clone(), e1.clone(), e2.clone()];
    sort_events_by_hlc(&mut shuffled);
    assert_eq!(
        shuffled.iter().map(|e| e.op_id.as_str()).collect::<Vec<_>>(),
        vec![e1.op_id.as_str(), e2.op_id.as_str(), e3.op_id.as_str()]
    );

    // Alice pushes all three; e2 is corrupted in transit.
    let outcome = alice.service.sync_once().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            pushed: 3,
            pulled: 0,
            rejected: 0
        }
    );
    relay.tamper_event(e2.op_id.as_str(), |event| {
        let mut raw = *event.hash.as_bytes();
        raw[0] ^= 0x01;
        event.hash = engram_crypto::Hash256::new(raw);
    });

    // Bob accepts e1 and e3 but rejects e2.
    let outcome = bob.service.sync_once().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            pushed: 0,
            pulled: 2,
            rejected: 1
        }
    );
    assert!(bob.store.has_event(&e1.op_id).unwrap());
    assert!(!bob.store.has_event(&e2.op_id).unwrap());
    assert!(bob.store.has_event(&e3.op_id).unwrap());

    // Carol sees exactly the same accepted set; derived states agree.
    carol.service.sync_once().await.unwrap();
    assert_eq!(
        bob.store.derived_entities(EntityType::Memory).unwrap(),
        carol.store.derived_entities(EntityType::Memory).unwrap()
    );
}

#[tokio::test]
async fn pull_folds_remote_timestamps_into_local_clock() {
    let relay = Arc::new(InMemoryRelay::new());
    // Alice's wall clock runs far ahead of Bob's.
    let alice = test_device("alice", 1_700_000_900_000, relay.clone());
    let bob = test_device("bob", 1_700_000_000_000, relay.clone());
    pair(&alice, &bob);

    let event = create_memory(&alice, "m-1", json!({"n": 1}));
    alice.service.sync_once().await.unwrap();
    bob.service.sync_once().await.unwrap();

    // Every timestamp Bob issues from now on lands after Alice's event.
    let next = bob.clock.now();
    assert!(next > event.timestamp().unwrap());
}

#[tokio::test]
async fn idempotent_ingestion_across_cycles() {
    let relay = Arc::new(InMemoryRelay::new());
    let alice = test_device("alice", 1_700_000_000_000, relay.clone());
    let bob = test_device("bob", 1_700_000_000_000, relay.clone());
    pair(&alice, &bob);

    create_memory(&alice, "m-1", json!({"n": 1}));
    alice.service.sync_once().await.unwrap();

    bob.service.sync_once().await.unwrap();
    let count_after_first = bob.store.event_count().unwrap();
    bob.service.sync_once().await.unwrap();
    assert_eq!(bob.store.event_count().unwrap(), count_after_first);
    assert_eq!(bob.service.status().pulled_total, 1);
}

#[tokio::test]
async fn offline_relay_triggers_backoff_and_recovery() {
    let relay = Arc::new(InMemoryRelay::new());
    let config = SyncConfig {
        error_threshold: 2,
        base_backoff: Duration::from_secs(10),
        ..SyncConfig::default()
    };
    let alice = test_device_with_config("alice", 1_700_000_000_000, relay.clone(), config);

    relay.set_offline(true);
    assert_eq!(alice.service.sync_once().await.unwrap(), CycleOutcome::Offline);
    let status = alice.service.status();
    assert!(!status.online);
    assert_eq!(status.consecutive_errors, 1);
    assert!(status.in_backoff_until_ms.is_none());

    assert_eq!(alice.service.sync_once().await.unwrap(), CycleOutcome::Offline);
    let status = alice.service.status();
    assert_eq!(status.consecutive_errors, 2);
    assert!(status.in_backoff_until_ms.is_some());

    // Inside the backoff window nothing is attempted, even once the relay
    // is reachable again.
    relay.set_offline(false);
    assert_eq!(alice.service.sync_once().await.unwrap(), CycleOutcome::Backoff);

    // Past the window the cycle runs and the error counter resets.
    alice.time.advance(11_000);
    assert!(matches!(
        alice.service.sync_once().await.unwrap(),
        CycleOutcome::Completed { .. }
    ));
    let status = alice.service.status();
    assert!(status.online);
    assert_eq!(status.consecutive_errors, 0);
    assert!(status.in_backoff_until_ms.is_none());
}

#[tokio::test]
async fn partial_push_failure_repushes_only_the_remainder() {
    let relay = Arc::new(InMemoryRelay::new());
    let config = SyncConfig {
        batch_size: 2,
        ..SyncConfig::default()
    };
    let alice = test_device_with_config("alice", 1_700_000_000_000, relay.clone(), config);

    let events: Vec<OpLogEvent> = (0..5)
        .map(|i| create_memory(&alice, &format!("m-{i}"), json!({"n": i})))
        .collect();

    // First batch lands, the transport dies on the second.
    relay.fail_pushes_after(1);
    assert_eq!(alice.service.sync_once().await.unwrap(), CycleOutcome::Offline);
    assert_eq!(relay.buffered(), 2);
    assert_eq!(
        alice.store.sync_value(PUSH_WATERMARK_KEY).unwrap(),
        Some(events[1].op_id.as_str().to_string())
    );

    // Next cycle pushes exactly the remainder; nothing is lost or doubled.
    relay.clear_push_failures();
    let outcome = alice.service.sync_once().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            pushed: 3,
            pulled: 0,
            rejected: 0
        }
    );
    assert_eq!(relay.buffered(), 5);
    assert_eq!(
        alice.store.sync_value(PUSH_WATERMARK_KEY).unwrap(),
        Some(events[4].op_id.as_str().to_string())
    );
}

#[tokio::test]
async fn relay_rejections_are_surfaced_not_requeued() {
    let relay = Arc::new(InMemoryRelay::new());
    let alice = test_device("alice", 1_700_000_000_000, relay.clone());

    let events: Vec<OpLogEvent> = (0..3)
        .map(|i| create_memory(&alice, &format!("m-{i}"), json!({"n": i})))
        .collect();
    relay.reject_op(events[1].op_id.as_str());

    let outcome = alice.service.sync_once().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            pushed: 2,
            pulled: 0,
            rejected: 1
        }
    );
    assert_eq!(relay.buffered(), 2);

    // The rejection was logged and counted, not retried.
    let outcome = alice.service.sync_once().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            pushed: 0,
            pulled: 0,
            rejected: 0
        }
    );
    assert_eq!(alice.service.status().rejected_total, 1);
}

#[tokio::test]
async fn equivocating_device_is_halted() {
    let relay = Arc::new(InMemoryRelay::new());
    let alice = test_device("alice", 1_700_000_000_000, relay.clone());
    let bob = test_device("bob", 1_700_000_000_000, relay.clone());
    pair(&alice, &bob);

    let e1 = create_memory(&alice, "m-1", json!({"n": 1}));
    alice.time.advance(1_000);
    let e2 = create_memory(&alice, "m-2", json!({"n": 2}));
    alice.service.sync_once().await.unwrap();
    bob.service.sync_once().await.unwrap();
    assert_eq!(bob.service.status().pulled_total, 2);

    // Alice's key signs a second successor of e1: a fork.
    alice.time.advance(1_000);
    let forked_factory = EventFactory::with_chain_tail(
        alice.clock.clone(),
        alice.crypto.clone(),
        Some(e1.hash),
    );
    let fork = forked_factory
        .create_event(
            EntityType::Memory,
            EntityId::new("m-2"),
            OpKind::Update,
            &json!({"n": "forged"}),
        )
        .unwrap();
    relay
        .push_events(alice.crypto.device_id(), &[fork.clone()])
        .await
        .unwrap();

    // Bob detects the fork and halts acceptance from Alice.
    bob.service.sync_once().await.unwrap();
    assert!(!bob.store.has_event(&fork.op_id).unwrap());
    assert_eq!(bob.service.status().chain_breaks, 1);
    let chain = bob
        .store
        .chain_state(alice.crypto.device_id())
        .unwrap()
        .unwrap();
    assert!(!chain.consistent);
    assert_eq!(chain.tail_hash, Some(e2.hash));

    // Later legitimate events are held back while the flag stands.
    alice.time.advance(1_000);
    let e3 = create_memory(&alice, "m-3", json!({"n": 3}));
    alice.service.sync_once().await.unwrap();
    bob.service.sync_once().await.unwrap();
    assert!(!bob.store.has_event(&e3.op_id).unwrap());
}

#[tokio::test]
async fn chain_audit_flags_stored_gaps_and_reconciles() {
    let relay = Arc::new(InMemoryRelay::new());
    let alice = test_device("alice", 1_700_000_000_000, relay.clone());
    let bob = test_device("bob", 1_700_000_000_000, relay.clone());
    pair(&alice, &bob);

    let e1 = create_memory(&alice, "m-1", json!({"n": 1}));
    alice.time.advance(1_000);
    let _e2 = create_memory(&alice, "m-2", json!({"n": 2}));
    alice.time.advance(1_000);
    let e3 = create_memory(&alice, "m-3", json!({"n": 3}));

    // Simulate a store that somehow lost e2: insert e1 and e3 directly.
    bob.store.insert_events(&[e1, e3]).unwrap();
    assert!(!bob
        .service
        .audit_device_chain(alice.crypto.device_id())
        .unwrap());
    let chain = bob
        .store
        .chain_state(alice.crypto.device_id())
        .unwrap()
        .unwrap();
    assert!(!chain.consistent);

    bob.service
        .reconcile_device(alice.crypto.device_id())
        .unwrap();
    let chain = bob
        .store
        .chain_state(alice.crypto.device_id())
        .unwrap()
        .unwrap();
    assert!(chain.consistent);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_waits_for_in_flight_cycle_and_persists_status() {
    let relay = Arc::new(InMemoryRelay::new());
    let config = SyncConfig {
        sync_interval: Duration::from_millis(50),
        ..SyncConfig::default()
    };
    let alice = Arc::new(test_device_with_config(
        "alice",
        1_700_000_000_000,
        relay.clone(),
        config,
    ));
    create_memory(&alice, "m-1", json!({"n": 1}));

    let runner = {
        let alice = alice.clone();
        tokio::spawn(async move { alice.service.run().await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    alice.service.stop().await.unwrap();
    runner.await.unwrap();

    // The loop pushed the event and the final status reached the store.
    assert_eq!(relay.buffered(), 1);
    let persisted = alice.store.sync_value("sync.status").unwrap().unwrap();
    let status: engram_sync::SyncStatus = serde_json::from_str(&persisted).unwrap();
    assert!(status.online);
    assert_eq!(status.pushed_total, 1);

    // The clock state was persisted for the next start.
    assert!(alice
        .store
        .load_clock_state(alice.crypto.device_id())
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn paired_devices_replicate_metadata_but_not_plaintext() {
    let relay = Arc::new(InMemoryRelay::new());
    let alice = test_device("alice", 1_700_000_000_000, relay.clone());
    let bob = test_device("bob", 1_700_000_000_000, relay.clone());
    pair(&alice, &bob);

    let event = create_memory(&alice, "m-1", json!({"text": "only alice reads this"}));
    alice.service.sync_once().await.unwrap();
    bob.service.sync_once().await.unwrap();

    // Bob holds the verified event and its derived entity...
    let derived = bob
        .store
        .derived_entity(EntityType::Memory, &EntityId::new("m-1"))
        .unwrap()
        .unwrap();
    assert_eq!(derived.hlc, event.hlc);
    assert!(!derived.deleted);

    // ...but cannot decrypt the payload: keys are never shared.
    assert!(bob.factory.decrypt_event(&event).is_err());
    assert_eq!(alice.factory.decrypt_event(&event).unwrap()["text"], "only alice reads this");
}
