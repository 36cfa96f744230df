//! Snapshot and restore behavior.

use crate::channel::{Channel, ChannelPhase};
use crate::error::ChannelError;
use crate::ingest::StreamedTx;
use crate::tests::common::*;

#[test]
fn restore_reproduces_the_snapshot() {
    env_logger::try_init().ok();
    let (mut initiator, mut responder) = open_channel_pair(100, 1000);
    payment(&mut initiator, &mut responder, 300).unwrap();

    let snapshot = initiator.snapshot();
    let (ic, _) = config_pair();
    let restored = Channel::from_snapshot(ic, snapshot.clone()).unwrap();
    assert_eq!(restored.snapshot(), snapshot);
    assert_eq!(restored.phase(), ChannelPhase::Open);
    assert_eq!(restored.balances().unwrap(), initiator.balances().unwrap());
}

#[test]
fn a_restored_channel_continues_identically() {
    // Running the remainder of a session on a restored channel produces the
    // same snapshots as the original would.
    let (mut initiator, mut responder) = open_channel_pair(100, 1000);
    payment(&mut initiator, &mut responder, 300).unwrap();

    let (ic, rc) = config_pair();
    let mut restored = Channel::from_snapshot(ic, initiator.snapshot()).unwrap();
    let mut responder_replica = Channel::from_snapshot(rc, responder.snapshot()).unwrap();

    // The original pair runs one more payment.
    let envelope = initiator.propose_payment(50).unwrap();
    let confirmed = responder.confirm_payment(envelope).unwrap();
    initiator.finalize_payment(confirmed.confirmer_signatures).unwrap();

    // The restored pair runs the same payment. Ed25519 signing is
    // deterministic, so the replicas end up byte for byte identical.
    let envelope = restored.propose_payment(50).unwrap();
    let confirmed = responder_replica.confirm_payment(envelope).unwrap();
    restored.finalize_payment(confirmed.confirmer_signatures).unwrap();

    assert_eq!(initiator.snapshot(), restored.snapshot());
    assert_eq!(responder.snapshot(), responder_replica.snapshot());
}

#[test]
fn restore_requires_the_same_configuration() {
    let (initiator, _) = open_channel_pair(100, 1000);
    let (_, rc) = config_pair();
    let err = Channel::from_snapshot(rc, initiator.snapshot()).unwrap_err();
    assert_eq!(err, ChannelError::SnapshotConfigMismatch);
}

#[test]
fn snapshot_survives_mid_proposal() {
    let (mut initiator, mut responder) = open_channel_pair(100, 1000);
    let envelope = initiator.propose_payment(200).unwrap();

    let (ic, _) = config_pair();
    let mut restored = Channel::from_snapshot(ic, initiator.snapshot()).unwrap();
    assert!(restored.latest_unauthorized_close_agreement().is_some());

    // The exchange completes on the restored replica.
    let confirmed = responder.confirm_payment(envelope).unwrap();
    let agreement = restored.finalize_payment(confirmed.confirmer_signatures).unwrap();
    assert_eq!(agreement.iteration_number(), 1);
}

#[test]
fn snapshot_preserves_ingestion_markers() {
    let (mut initiator, mut responder) = open_channel_pair(100, 1000);
    payment(&mut initiator, &mut responder, 300).unwrap();
    let (declaration, _) = initiator.close_txs().unwrap();
    initiator.ingest_tx(&StreamedTx { order_id: 9, tx: declaration, success: true }).unwrap();

    let (ic, _) = config_pair();
    let restored = Channel::from_snapshot(ic, initiator.snapshot()).unwrap();
    assert_eq!(restored.latest_declaration_executed(), Some(1));
}
