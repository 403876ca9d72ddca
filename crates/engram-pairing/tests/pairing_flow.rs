//! End-to-end pairing flow between two in-process devices.

#![allow(clippy::unwrap_used)]

use engram_core::{DeviceId, ManualTimeSource, TimeSource};
use engram_crypto::{CryptoProvider, DeviceKeyPair, TrustLevel};
use engram_pairing::{PairingCeremony, TrustRequest, TRANSPORT_PREFIX};
use std::sync::Arc;

fn provider(name: &str, time: &ManualTimeSource) -> CryptoProvider {
    CryptoProvider::new(DeviceKeyPair::generate(DeviceId::new(name), time))
}

#[test]
fn full_pairing_flow_establishes_mutual_trust() {
    let time = Arc::new(ManualTimeSource::new(1_700_000_000_000));
    let laptop = provider("laptop", &time);
    let phone = provider("new-phone", &time);

    // Step 1-2: the new device renders its self-signed request for transfer.
    let request = TrustRequest::new(&phone, "Phone", time.now_ms());
    let encoded = request.encode_transport().unwrap();
    assert!(encoded.starts_with(TRANSPORT_PREFIX));

    // Step 3-4: the laptop decodes it and issues a verification code.
    let ceremony = PairingCeremony::new(time.clone());
    let decoded = TrustRequest::decode_transport(&encoded).unwrap();
    time.advance(2 * 60 * 1_000); // within the ten-minute freshness window
    let issued = ceremony.issue_code(&decoded).unwrap();

    // Step 5: the user relays the code; trust lands on both sides.
    time.advance(60 * 1_000); // within the five-minute code window
    let grant = ceremony.confirm_code(&issued.code, &laptop).unwrap();
    grant.adopt(&phone, "Laptop").unwrap();

    let phone_on_laptop = laptop.trusted_device(phone.device_id()).unwrap();
    let laptop_on_phone = phone.trusted_device(laptop.device_id()).unwrap();
    assert_eq!(phone_on_laptop.trust_level, TrustLevel::Verified);
    assert_eq!(laptop_on_phone.trust_level, TrustLevel::Verified);
    assert_eq!(phone_on_laptop.public_key, phone.public_key_bytes());
    assert_eq!(laptop_on_phone.public_key, laptop.public_key_bytes());
    assert_eq!(
        phone_on_laptop.trust_evidence_hash,
        laptop_on_phone.trust_evidence_hash
    );

    // Paired devices now verify each other's signatures.
    let digest = phone.hash(b"some ciphertext");
    let sig = phone.sign(&digest);
    assert!(laptop.verify(&digest, &sig, phone.device_id()));
}

#[test]
fn code_submitted_after_six_minutes_fails() {
    let time = Arc::new(ManualTimeSource::new(1_700_000_000_000));
    let laptop = provider("laptop", &time);
    let phone = provider("new-phone", &time);
    let ceremony = PairingCeremony::new(time.clone());

    let issued = ceremony
        .issue_code(&TrustRequest::new(&phone, "Phone", time.now_ms()))
        .unwrap();

    time.advance(6 * 60 * 1_000);
    assert!(ceremony.confirm_code(&issued.code, &laptop).is_err());
    // The failed late submission never recorded trust.
    assert!(laptop.trusted_device(phone.device_id()).is_none());
}

#[test]
fn code_submitted_twice_fails_the_second_time() {
    let time = Arc::new(ManualTimeSource::new(1_700_000_000_000));
    let laptop = provider("laptop", &time);
    let phone = provider("new-phone", &time);
    let ceremony = PairingCeremony::new(time.clone());

    let issued = ceremony
        .issue_code(&TrustRequest::new(&phone, "Phone", time.now_ms()))
        .unwrap();

    assert!(ceremony.confirm_code(&issued.code, &laptop).is_ok());
    assert!(ceremony.confirm_code(&issued.code, &laptop).is_err());
}

#[test]
fn revocation_is_terminal_after_pairing() {
    let time = Arc::new(ManualTimeSource::new(1_700_000_000_000));
    let laptop = provider("laptop", &time);
    let phone = provider("new-phone", &time);
    let ceremony = PairingCeremony::new(time.clone());

    let issued = ceremony
        .issue_code(&TrustRequest::new(&phone, "Phone", time.now_ms()))
        .unwrap();
    ceremony.confirm_code(&issued.code, &laptop).unwrap();

    laptop.mark_compromised(phone.device_id()).unwrap();
    let digest = phone.hash(b"data");
    let sig = phone.sign(&digest);
    assert!(!laptop.verify(&digest, &sig, phone.device_id()));

    // Re-pairing the same device does not silently clear the revocation.
    let issued = ceremony
        .issue_code(&TrustRequest::new(&phone, "Phone again", time.now_ms()))
        .unwrap();
    assert!(ceremony.confirm_code(&issued.code, &laptop).is_err());
}
