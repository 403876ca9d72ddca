//! Cross-device convergence: any device holding the same verified event set
//! materializes the same derived state.

#![allow(clippy::unwrap_used)]

use engram_core::{DeviceId, EntityId, HybridLogicalClock, ManualTimeSource};
use engram_crypto::{CryptoProvider, DeviceKeyPair, TrustedDevice};
use engram_journal::{
    sort_events_by_hlc, verify_event, DerivedState, EntityType, EventFactory, OpKind, OpLogEvent,
};
use serde_json::json;
use std::sync::Arc;

struct Device {
    factory: EventFactory,
    crypto: Arc<CryptoProvider>,
}

fn device(name: &str, start_ms: i64) -> Device {
    let time = Arc::new(ManualTimeSource::new(start_ms));
    let device_id = DeviceId::new(name);
    let clock = Arc::new(HybridLogicalClock::new(device_id.clone(), time.clone()));
    let crypto = Arc::new(CryptoProvider::new(DeviceKeyPair::generate(
        device_id,
        time.as_ref(),
    )));
    Device {
        factory: EventFactory::new(clock, crypto.clone()),
        crypto,
    }
}

fn trust_mutually(a: &Device, b: &Device) {
    a.crypto
        .trust_device(TrustedDevice::new(
            b.crypto.device_id().clone(),
            b.crypto.public_key_bytes(),
            b.crypto.device_id().as_str(),
            0,
        ))
        .unwrap();
    b.crypto
        .trust_device(TrustedDevice::new(
            a.crypto.device_id().clone(),
            a.crypto.public_key_bytes(),
            a.crypto.device_id().as_str(),
            0,
        ))
        .unwrap();
}

#[test]
fn concurrent_writers_converge_to_the_same_winner() {
    let alice = device("alice", 1_700_000_000_000);
    let bob = device("bob", 1_700_000_005_000);
    trust_mutually(&alice, &bob);

    let shared = EntityId::new("note-1");
    let from_alice = alice
        .factory
        .create_event(
            EntityType::Memory,
            shared.clone(),
            OpKind::Create,
            &json!({"text": "alice's version"}),
        )
        .unwrap();
    let from_bob = bob
        .factory
        .create_event(
            EntityType::Memory,
            shared.clone(),
            OpKind::Update,
            &json!({"text": "bob's version"}),
        )
        .unwrap();

    // Both devices verify both events, then replay in opposite arrival orders.
    for event in [&from_alice, &from_bob] {
        verify_event(&alice.crypto, event).unwrap();
        verify_event(&bob.crypto, event).unwrap();
    }
    let on_alice = DerivedState::replay(&[from_alice.clone(), from_bob.clone()]);
    let on_bob = DerivedState::replay(&[from_bob.clone(), from_alice.clone()]);

    assert_eq!(on_alice, on_bob);
    // Bob's clock ran ahead, so Bob's event wins last-writer-wins.
    let winner = on_alice.get(EntityType::Memory, &shared).unwrap();
    assert_eq!(winner.hlc, from_bob.hlc);
}

#[test]
fn corrupt_event_is_excluded_without_poisoning_siblings() {
    let alice = device("alice", 1_700_000_000_000);
    let bob = device("bob", 1_700_000_000_000);
    trust_mutually(&alice, &bob);

    let mut events: Vec<OpLogEvent> = (0..3)
        .map(|i| {
            alice
                .factory
                .create_event(
                    EntityType::Memory,
                    EntityId::new(format!("m-{i}")),
                    OpKind::Create,
                    &json!({"n": i}),
                )
                .unwrap()
        })
        .collect();

    // Corrupt the middle event's integrity hash in transit.
    let mut raw = *events[1].hash.as_bytes();
    raw[0] ^= 0x01;
    events[1].hash = engram_crypto::Hash256::new(raw);

    let accepted: Vec<OpLogEvent> = events
        .iter()
        .filter(|e| verify_event(&bob.crypto, e).is_ok())
        .cloned()
        .collect();

    assert_eq!(accepted.len(), 2);
    let state = DerivedState::replay(&accepted);
    assert!(state.get(EntityType::Memory, &EntityId::new("m-0")).is_some());
    assert!(state.get(EntityType::Memory, &EntityId::new("m-1")).is_none());
    assert!(state.get(EntityType::Memory, &EntityId::new("m-2")).is_some());
}

#[test]
fn causal_order_survives_clock_skew() {
    // Bob's wall clock is far behind Alice's, but after folding Alice's
    // timestamp Bob's events still sort after hers.
    let alice = device("alice", 1_700_000_900_000);
    let bob = device("bob", 1_700_000_000_000);
    trust_mutually(&alice, &bob);

    let from_alice = alice
        .factory
        .create_event(
            EntityType::Memory,
            EntityId::new("m-1"),
            OpKind::Create,
            &json!({"v": 1}),
        )
        .unwrap();

    // Bob observes Alice's event before writing his own.
    let bob_clock_time = Arc::new(ManualTimeSource::new(1_700_000_000_000));
    let bob_clock = HybridLogicalClock::new(DeviceId::new("bob"), bob_clock_time);
    bob_clock.update(&from_alice.timestamp().unwrap());
    let bob_factory = EventFactory::new(Arc::new(bob_clock), bob.crypto.clone());
    let from_bob = bob_factory
        .create_event(
            EntityType::Memory,
            EntityId::new("m-1"),
            OpKind::Update,
            &json!({"v": 2}),
        )
        .unwrap();

    let mut events = vec![from_bob.clone(), from_alice.clone()];
    sort_events_by_hlc(&mut events);
    assert_eq!(events[0].op_id, from_alice.op_id);
    assert_eq!(events[1].op_id, from_bob.op_id);

    let state = DerivedState::replay(&events);
    let winner = state.get(EntityType::Memory, &EntityId::new("m-1")).unwrap();
    assert_eq!(winner.hlc, from_bob.hlc);
}
