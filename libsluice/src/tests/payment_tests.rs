//! Tests for the payment exchange.

use crate::balance::ChannelBalances;
use crate::channel::ChannelPhase;
use crate::error::ChannelError;
use crate::tests::common::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[test]
fn open_and_single_payment() {
    // S1: both sides start at 1000, the initiator pays 300.
    env_logger::try_init().ok();
    let (mut initiator, mut responder) = open_channel_pair(100, 1000);
    let agreement = payment(&mut initiator, &mut responder, 300).unwrap();
    assert_eq!(agreement.iteration_number(), 1);
    assert_eq!(agreement.balances(), ChannelBalances::new(700, 1300));
    assert_eq!(responder.balances().unwrap(), ChannelBalances::new(700, 1300));
    assert_eq!(initiator.balances().unwrap(), responder.balances().unwrap());
}

#[test]
fn twenty_alternating_payments_conserve_balances() {
    // S2: twenty random payments in alternating directions. Conservation
    // and monotonic iterations hold at every step; replaying an old
    // envelope changes nothing.
    let contribution = 1_000_0000000;
    let (mut initiator, mut responder) = open_channel_pair(100, contribution);
    let total = 2 * contribution;
    let mut rng = StdRng::seed_from_u64(42);
    let mut envelopes = Vec::new();

    for i in 1..=20i64 {
        let initiator_pays = i % 2 == 1;
        let (proposer, confirmer) =
            if initiator_pays { (&mut initiator, &mut responder) } else { (&mut responder, &mut initiator) };
        let payer_balance = {
            let balances = proposer.balances().unwrap();
            if initiator_pays {
                balances.to_initiator
            } else {
                balances.to_responder
            }
        };
        let amount = rng.random_range(1..=payer_balance / 2);
        let envelope = proposer.propose_payment(amount).unwrap();
        envelopes.push(envelope.clone());
        let confirmed = confirmer.confirm_payment(envelope).unwrap();
        let agreement = proposer.finalize_payment(confirmed.confirmer_signatures).unwrap();

        assert_eq!(agreement.iteration_number(), i);
        assert_eq!(agreement.balances().total(), Some(total));
        assert_eq!(initiator.balances().unwrap(), responder.balances().unwrap());
    }
    assert_eq!(initiator.latest_authorized_close_agreement().unwrap().iteration_number(), 20);

    // Replaying any prior envelope yields no change.
    let before = initiator.snapshot();
    for envelope in &envelopes[..envelopes.len() - 1] {
        let err = initiator.confirm_payment(envelope.clone()).unwrap_err();
        assert!(matches!(err, ChannelError::IterationTooOld { .. }));
    }
    assert_eq!(initiator.snapshot(), before);
}

#[test]
fn consecutive_agreements_differ_by_the_payment_amount() {
    let (mut initiator, mut responder) = open_channel_pair(100, 1000);
    let mut previous = initiator.balances().unwrap();
    for (amount, initiator_pays) in [(300, true), (150, false), (25, true)] {
        let agreement = if initiator_pays {
            payment(&mut initiator, &mut responder, amount).unwrap()
        } else {
            payment(&mut responder, &mut initiator, amount).unwrap()
        };
        let signed = if initiator_pays { amount } else { -amount };
        assert_eq!(agreement.details().payment_amount, signed);
        assert_eq!(agreement.balances(), previous.apply_payment(signed).unwrap());
        previous = agreement.balances();
    }
}

#[test]
fn authorized_envelopes_are_fully_signed() {
    let (mut initiator, mut responder) = open_channel_pair(100, 1000);
    payment(&mut initiator, &mut responder, 300).unwrap();
    for channel in [&initiator, &responder] {
        let envelope = &channel.latest_authorized_close_agreement().unwrap().envelope;
        assert!(envelope.is_authorized());
        let (declaration, close) = channel.close_txs().unwrap();
        for tx in [&declaration, &close] {
            assert_eq!(tx.signatures().len(), 2);
            for decorated in tx.signatures() {
                assert!(tx.verify_signature(NETWORK, &decorated.signer, &decorated.signature));
            }
        }
    }
}

#[test]
fn replaying_the_authorized_envelope_is_a_no_op() {
    let (mut initiator, mut responder) = open_channel_pair(100, 1000);
    let envelope = initiator.propose_payment(300).unwrap();
    let confirmed = responder.confirm_payment(envelope).unwrap();
    let agreement = initiator.finalize_payment(confirmed.confirmer_signatures.clone()).unwrap();

    // Same envelope again on the confirmer.
    let replayed = responder.confirm_payment(confirmed.clone()).unwrap();
    assert_eq!(replayed, confirmed);
    assert_eq!(responder.latest_authorized_close_agreement().unwrap().iteration_number(), 1);

    // Same signatures again on the proposer.
    let refinalized = initiator.finalize_payment(confirmed.confirmer_signatures).unwrap();
    assert_eq!(refinalized, agreement);
}

#[test]
fn payment_requires_an_open_channel() {
    let (mut initiator, _) = channel_pair();
    assert_eq!(initiator.propose_payment(1).unwrap_err(), ChannelError::NotOpen);
    initiator.propose_open(open_params(100, 1000)).unwrap();
    assert_eq!(initiator.propose_payment(1).unwrap_err(), ChannelError::NotOpen);
}

#[test]
fn payment_amount_must_be_positive() {
    let (mut initiator, _) = open_channel_pair(100, 1000);
    assert_eq!(initiator.propose_payment(0).unwrap_err(), ChannelError::NonPositiveAmount(0));
    assert_eq!(initiator.propose_payment(-5).unwrap_err(), ChannelError::NonPositiveAmount(-5));
}

#[test]
fn overdrawing_the_channel_balance_is_underfunded() {
    let (mut initiator, _) = open_channel_pair(100, 1000);
    assert_eq!(initiator.propose_payment(1001).unwrap_err(), ChannelError::Underfunded);
}

#[test]
fn underfunded_then_refreshed() {
    // S6: the cached on-chain balance lags behind the payment.
    let (mut initiator, _) = open_channel_pair(100, 1000);
    initiator.update_local_channel_account_balance(500);
    assert_eq!(initiator.propose_payment(600).unwrap_err(), ChannelError::Underfunded);
    initiator.update_local_channel_account_balance(1000);
    initiator.propose_payment(600).unwrap();
}

#[test]
fn confirm_checks_the_proposer_funding() {
    let (mut initiator, mut responder) = open_channel_pair(100, 1000);
    responder.update_remote_channel_account_balance(500);
    let envelope = initiator.propose_payment(600).unwrap();
    assert_eq!(responder.confirm_payment(envelope.clone()).unwrap_err(), ChannelError::Underfunded);
    // The agent refreshes the counterparty balance and retries.
    responder.update_remote_channel_account_balance(1000);
    responder.confirm_payment(envelope).unwrap();
}

#[test]
fn confirm_rejects_tampered_balances() {
    let (mut initiator, mut responder) = open_channel_pair(100, 1000);
    let mut envelope = initiator.propose_payment(300).unwrap();
    envelope.details.balances = ChannelBalances::new(600, 1400);
    let err = responder.confirm_payment(envelope).unwrap_err();
    assert!(matches!(err, ChannelError::InvalidPayment(_)));
}

#[test]
fn confirm_rejects_wrong_iterations() {
    let (mut initiator, mut responder) = open_channel_pair(100, 1000);
    let envelope = initiator.propose_payment(300).unwrap();
    let mut too_new = envelope.clone();
    too_new.details.iteration_number = 5;
    assert!(matches!(
        responder.confirm_payment(too_new).unwrap_err(),
        ChannelError::IterationTooNew { expected: 1, actual: 5 }
    ));
    let mut too_old = envelope;
    too_old.details.iteration_number = 0;
    assert!(matches!(
        responder.confirm_payment(too_old).unwrap_err(),
        ChannelError::IterationTooOld { expected: 1, actual: 0 }
    ));
}

#[test]
fn a_second_proposal_waits_for_the_first() {
    let (mut initiator, _) = open_channel_pair(100, 1000);
    initiator.propose_payment(100).unwrap();
    let err = initiator.propose_payment(100).unwrap_err();
    assert!(matches!(err, ChannelError::InvalidPayment(_)));
}

#[test]
fn finalize_without_a_pending_proposal() {
    let (mut initiator, mut responder) = open_channel_pair(100, 1000);
    assert_eq!(
        initiator.finalize_payment(Default::default()).unwrap_err(),
        ChannelError::NoUnauthorizedAgreement
    );
    // Signatures matching the already authorized agreement are a no-op
    // replay rather than an error.
    let envelope = initiator.propose_payment(300).unwrap();
    let confirmed = responder.confirm_payment(envelope).unwrap();
    let replay = responder.finalize_payment(confirmed.confirmer_signatures).unwrap();
    assert_eq!(replay.iteration_number(), 1);
}

#[test]
fn finalize_rejects_bad_signatures() {
    let (mut initiator, mut responder) = open_channel_pair(100, 1000);
    let envelope = initiator.propose_payment(300).unwrap();
    let mut confirmed = responder.confirm_payment(envelope).unwrap();
    confirmed.confirmer_signatures.close = confirmed.confirmer_signatures.declaration;
    let err = initiator.finalize_payment(confirmed.confirmer_signatures).unwrap_err();
    assert!(matches!(err, ChannelError::InvalidSignature { .. }));
}

#[test]
fn memo_travels_with_the_agreement() {
    let (mut initiator, mut responder) = open_channel_pair(100, 1000);
    let envelope = initiator.propose_payment_with_memo(300, Some(b"invoice 7".to_vec())).unwrap();
    let confirmed = responder.confirm_payment(envelope).unwrap();
    let agreement = initiator.finalize_payment(confirmed.confirmer_signatures).unwrap();
    assert_eq!(agreement.details().memo.as_deref(), Some(b"invoice 7".as_slice()));
}

#[test]
fn simultaneous_proposals_resolve_by_address() {
    // S4: both sides propose at the same iteration. The proposal from the
    // smaller signer address wins on both sides; the loser re-proposes at
    // the next iteration.
    let (mut initiator, mut responder) = open_channel_pair(100, 1_000_0000000);
    for _ in 0..16 {
        payment(&mut initiator, &mut responder, 1000).unwrap();
    }

    let initiator_envelope = initiator.propose_payment(100).unwrap();
    let responder_envelope = responder.propose_payment(50).unwrap();
    assert_eq!(initiator_envelope.details.iteration_number, 17);
    assert_eq!(responder_envelope.details.iteration_number, 17);

    let initiator_wins = initiator_signer().address() < responder_signer().address();
    let (mut winner, mut loser, winning_envelope, losing_envelope) = if initiator_wins {
        (initiator, responder, initiator_envelope, responder_envelope)
    } else {
        (responder, initiator, responder_envelope, initiator_envelope)
    };

    // The winner rejects the loser's concurrent proposal outright.
    assert_eq!(winner.confirm_payment(losing_envelope).unwrap_err(), ChannelError::ProposalSuperseded);
    // The loser drops its own pending proposal and confirms the winner's.
    let confirmed = loser.confirm_payment(winning_envelope).unwrap();
    assert!(loser.latest_unauthorized_close_agreement().is_none());
    let agreement = winner.finalize_payment(confirmed.confirmer_signatures).unwrap();
    assert_eq!(agreement.iteration_number(), 17);

    // The loser retries at the next iteration.
    let envelope = loser.propose_payment(50).unwrap();
    assert_eq!(envelope.details.iteration_number, 18);
    let confirmed = winner.confirm_payment(envelope).unwrap();
    let agreement = loser.finalize_payment(confirmed.confirmer_signatures).unwrap();
    assert_eq!(agreement.iteration_number(), 18);
}

#[test]
fn payments_are_rejected_while_closing() {
    let (mut initiator, mut responder) = open_channel_pair(100, 1000);
    initiator.propose_close().unwrap();
    assert_eq!(initiator.phase(), ChannelPhase::Closing);
    assert_eq!(initiator.propose_payment(100).unwrap_err(), ChannelError::CloseInProgress);
    // A payment that arrives after the close begins is also rejected.
    let envelope = responder.propose_payment(100).unwrap();
    assert_eq!(initiator.confirm_payment(envelope).unwrap_err(), ChannelError::CloseInProgress);
}
