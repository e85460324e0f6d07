//! Performance benchmarks for the relay's hot paths

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use server::auth::{Challenge, DidAuthEngine, Response};
use server::ownership::OwnershipManager;
use server::relay::RelayEngine;
use server::stats::Statistics;
use server::transport::{MemoryTransport, Transport};
use shared::did::{encode_pubkey_as_did, resolve_did_key};
use shared::messages::{encode, ServerAvatarMovement};
use shared::reliability::ReceiveChannels;
use shared::{Channel, DeliveryMethod, NONCE_LEN};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Benchmarks did:key encoding and resolution
#[test]
fn benchmark_did_key_resolution() {
    let key = SigningKey::generate(&mut OsRng);
    let did = encode_pubkey_as_did(&key.verifying_key().to_bytes());

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let document = resolve_did_key(&did).unwrap();
        assert_eq!(document.verification_methods.len(), 1);
    }

    let duration = start.elapsed();
    println!(
        "did:key resolution: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 5);
}

/// Benchmarks full challenge verification
#[test]
fn benchmark_challenge_verification() {
    let engine = DidAuthEngine::new(Duration::from_secs(1));
    let key = SigningKey::generate(&mut OsRng);
    let did = encode_pubkey_as_did(&key.verifying_key().to_bytes());

    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let challenge: Challenge = engine.make_challenge(&did);
        assert_eq!(challenge.nonce.len(), NONCE_LEN);
        let response = Response {
            signature: key.sign(&challenge.nonce).to_bytes().to_vec(),
            key_fragment: String::new(),
        };
        tokio_test::block_on(engine.verify_response(&response, &challenge)).unwrap();
    }

    let duration = start.elapsed();
    println!(
        "Challenge verification: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 10);
}

/// Stress tests ownership transfers across many keys and peers
#[test]
fn stress_test_ownership_transfers() {
    let ownership = OwnershipManager::new();

    let iterations = 100_000u32;
    let start = Instant::now();

    for i in 0..iterations {
        let key = format!("object-{}", i % 512);
        ownership.transfer(&key, i % 16, None);
    }
    let released: usize = (0..16).map(|peer| ownership.release_all(peer).len()).sum();

    let duration = start.elapsed();
    println!(
        "Ownership: {} transfers and release of {} keys in {:?}",
        iterations, released, duration
    );

    assert_eq!(released, 512);
    assert!(duration.as_secs() < 5);
}

/// Benchmarks fan-out of one movement update to a full room
#[test]
fn benchmark_movement_broadcast() {
    let transport = Arc::new(MemoryTransport::new());
    let peers: Vec<u32> = (0..64u16)
        .map(|i| {
            transport
                .accept(SocketAddr::from(([127, 0, 0, 1], 20_000 + i)))
                .unwrap()
        })
        .collect();
    let relay = RelayEngine::new(transport.clone(), Arc::new(Statistics::new(false)), 70);
    let payload = encode(&ServerAvatarMovement {
        player_id: peers[0],
        data: vec![0xAB; 48],
    })
    .unwrap();

    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        relay
            .broadcast_to_clients(
                Channel::PlayerAvatar,
                Some(peers[0]),
                &peers,
                DeliveryMethod::Sequenced,
                &payload,
            )
            .unwrap();
        transport.take_sent();
    }

    let duration = start.elapsed();
    println!(
        "Broadcast to {} peers: {} iterations in {:?} ({:.2} μs/iter)",
        peers.len() - 1,
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_secs() < 5);
}

/// Benchmarks reassembly of a reversed reliable-ordered stream
#[test]
fn benchmark_ordered_reassembly() {
    let iterations = 200;
    let window = 512u32;
    let start = Instant::now();

    for _ in 0..iterations {
        let mut receive = ReceiveChannels::new();
        let mut delivered = 0;
        for sequence in (0..window).rev() {
            delivered += receive
                .receive(8, DeliveryMethod::ReliableOrdered, sequence, vec![0; 32])
                .len();
        }
        assert_eq!(delivered, window as usize);
    }

    let duration = start.elapsed();
    println!(
        "Ordered reassembly: {} windows of {} in {:?}",
        iterations, window, duration
    );

    assert!(duration.as_secs() < 5);
}
