//! Proof-of-work search and verification working together.

use crate::generators::{getpubkey_object, msg_object, msg_object_with_ttl};
use bm_core::{unix_now, ObjectEnvelope, Sha512Cryptography};
use bm_pow::{verify, CancelHandle, PowError, PowParams, ProofOfWorkEngine};
use std::sync::Arc;
use std::time::Duration;

fn engine(params: PowParams, threads: usize) -> Arc<ProofOfWorkEngine> {
    Arc::new(ProofOfWorkEngine::new(
        Arc::new(Sha512Cryptography),
        params,
        Some(threads),
    ))
}

fn cheap() -> PowParams {
    PowParams::with_floors(1, 1, 1, 1)
}

// Roughly twenty thousand trials per object: a nonce found for a different
// payload is practically never valid.
fn moderate() -> PowParams {
    PowParams::with_floors(200, 1, 1, 1)
}

#[test]
fn test_found_nonce_verifies_without_ttl() {
    let engine = engine(cheap(), 1);
    let mined = engine
        .do_work(msg_object_with_ttl(1, 0), &CancelHandle::new())
        .unwrap();
    assert!(mined.nonce().is_some());
    assert!(engine.verify(&mined, unix_now()).is_ok());
}

#[test]
fn test_found_nonce_verifies_for_multi_day_ttl() {
    let engine = engine(cheap(), 2);
    let mined = engine
        .do_work(msg_object_with_ttl(1, 4 * 24 * 60 * 60), &CancelHandle::new())
        .unwrap();
    assert!(engine.verify(&mined, unix_now()).is_ok());
}

#[test]
fn test_independent_verifier_agrees() {
    let engine = engine(moderate(), 4);
    let mined = engine
        .do_work(getpubkey_object(1, [3; 32]), &CancelHandle::new())
        .unwrap();

    // A verifier built from scratch sees the same work.
    assert!(verify(&Sha512Cryptography, &mined, unix_now(), &moderate()).is_ok());
}

#[test]
fn test_tampered_object_fails_verification() {
    let engine = engine(moderate(), 2);
    let mined = engine
        .do_work(msg_object(1), &CancelHandle::new())
        .unwrap();
    let nonce = mined.nonce().unwrap();

    let other = msg_object(1).with_nonce(nonce);
    assert!(matches!(
        engine.verify(&other, unix_now()),
        Err(PowError::InsufficientWork { .. })
    ));
}

#[test]
fn test_unmined_object_is_rejected() {
    let engine = engine(cheap(), 1);
    assert!(matches!(
        engine.verify(&msg_object(1), unix_now()),
        Err(PowError::MissingNonce)
    ));
}

#[test]
fn test_repeated_work_hits_cache() {
    let engine = engine(moderate(), 2);
    let object: ObjectEnvelope = msg_object(1);

    let first = engine.do_work(object.clone(), &CancelHandle::new()).unwrap();
    assert_eq!(engine.cached(), 1);

    let second = engine.do_work(object, &CancelHandle::new()).unwrap();
    assert_eq!(first.nonce(), second.nonce());
    assert_eq!(engine.cached(), 1);
}

#[test]
fn test_cancelled_search_gives_up() {
    // Network difficulty on a large payload takes far longer than the test.
    let engine = engine(PowParams::default(), 2);
    let cancel = CancelHandle::new();
    cancel.cancel();

    let result = engine.do_work(msg_object_with_ttl(1, 28 * 24 * 60 * 60), &cancel);
    assert!(matches!(result, Err(PowError::Cancelled)));
}

#[tokio::test]
async fn test_async_work_can_be_cancelled_midway() {
    let engine = engine(PowParams::default(), 1);
    let cancel = CancelHandle::new();

    let task = tokio::spawn({
        let engine = Arc::clone(&engine);
        let cancel = cancel.clone();
        async move {
            engine
                .do_work_async(msg_object_with_ttl(1, 28 * 24 * 60 * 60), cancel)
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(PowError::Cancelled)));
}

#[tokio::test]
async fn test_async_work_produces_valid_nonce() {
    let engine = engine(cheap(), 2);
    let mined = engine
        .do_work_async(msg_object(1), CancelHandle::new())
        .await
        .unwrap();
    assert!(engine.verify(&mined, unix_now()).is_ok());
}
