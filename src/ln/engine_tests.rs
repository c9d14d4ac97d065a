// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! End-to-end tests driving both sides of a channel through the commitment engine.

use crate::ln::chan_utils::{
	build_commitment_transaction, get_commitment_transaction_number_obscure_factor,
	make_funding_redeemscript, per_commitment_point, sign_commitment_transaction,
	CounterpartyCommitmentSecrets, FundingCoin, TxCreationKeys,
};
use crate::ln::commitment_spec::{CommitmentSpec, HtlcDirection};
use crate::ln::commitments::{
	ChannelError, ChannelEvent, ChannelParams, Changes, Commitments, HtlcOrigin, LocalCommit,
	RemoteCommit, RemoteNextCommitInfo,
};
use crate::ln::fundrecoverer;
use crate::ln::msgs::{OnionErrorPacket, OnionPacket};
use crate::ln::onion::{CryptoError, HTLCFailReason, SphinxHandler, SphinxSharedSecret, BADONION, PERM};
use crate::ln::types::{ChannelId, PaymentHash, PaymentPreimage};
use crate::sign::InMemoryChannelKeys;
use crate::util::config::ChannelConfig;
use crate::util::test_utils::TestLogger;

use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::hash_types::Txid;
use bitcoin::secp256k1::{self, PublicKey, Secp256k1, SecretKey};
use bitcoin::{Amount, Network, OutPoint};

use std::collections::HashMap;

const FEERATE: u32 = 1000;
const CHANNEL_VALUE_SAT: u64 = 1_000_000;

struct TestSphinx;

impl SphinxHandler for TestSphinx {
	fn parse_packet(&self, node_secret: &SecretKey, payment_hash: &PaymentHash, packet: &OnionPacket) -> Result<SphinxSharedSecret, CryptoError> {
		if packet.version != 0 {
			return Err(CryptoError::UnknownVersion);
		}
		let mut sha = Sha256::engine();
		sha.input(&node_secret.secret_bytes());
		sha.input(&payment_hash.0);
		sha.input(&packet.hop_data);
		Ok(SphinxSharedSecret(Sha256::from_engine(sha).to_byte_array()))
	}

	fn forward_error_packet(&self, packet: &OnionErrorPacket, shared_secret: &SphinxSharedSecret) -> OnionErrorPacket {
		let mut data = packet.data.clone();
		data.extend_from_slice(&shared_secret.0);
		OnionErrorPacket { data }
	}

	fn create_error_packet(&self, shared_secret: &SphinxSharedSecret, failure_code: u16) -> OnionErrorPacket {
		let mut data = failure_code.to_be_bytes().to_vec();
		data.extend_from_slice(&shared_secret.0);
		OnionErrorPacket { data }
	}
}

struct Node {
	cm: Commitments,
	keys: InMemoryChannelKeys,
	node_secret: SecretKey,
}

fn channel_keys(seed: u8) -> InMemoryChannelKeys {
	let key = |salt: u8| SecretKey::from_slice(&[seed.wrapping_mul(16).wrapping_add(salt); 32]).unwrap();
	InMemoryChannelKeys {
		funding_key: key(1),
		revocation_base_key: key(2),
		payment_base_key: key(3),
		delayed_payment_base_key: key(4),
		htlc_base_key: key(5),
		commitment_seed: [seed; 32],
	}
}

fn default_params() -> ChannelParams {
	ChannelParams {
		dust_limit_sat: 546,
		channel_reserve_sat: 10_000,
		to_self_delay: 144,
		htlc_minimum_msat: 1_000,
		max_htlc_value_in_flight_msat: 900_000_000,
		max_accepted_htlcs: 30,
	}
}

fn dummy_onion(secp_ctx: &Secp256k1<secp256k1::All>) -> OnionPacket {
	OnionPacket {
		version: 0,
		public_key: PublicKey::from_secret_key(secp_ctx, &SecretKey::from_slice(&[11; 32]).unwrap()),
		hop_data: vec![0x42; 64],
		hmac: [0; 32],
	}
}

/// Builds both sides of a channel at commitment number 0, with genuine initial signatures, the
/// way the open-channel handshake would have left them. Alice funds the channel.
fn open_channel(funder_balance_msat: u64, fundee_balance_msat: u64, feerate_per_kw: u32) -> (Node, Node) {
	let secp_ctx = Secp256k1::new();
	let alice_keys = channel_keys(1);
	let bob_keys = channel_keys(2);
	let alice_pubkeys = alice_keys.pubkeys(&secp_ctx);
	let bob_pubkeys = bob_keys.pubkeys(&secp_ctx);

	let funding = FundingCoin {
		outpoint: OutPoint { txid: Txid::all_zeros(), vout: 0 },
		value: Amount::from_sat(CHANNEL_VALUE_SAT),
		redeem_script: make_funding_redeemscript(&alice_pubkeys.funding_pubkey, &bob_pubkeys.funding_pubkey),
	};
	let obscure_factor = get_commitment_transaction_number_obscure_factor(
		&alice_pubkeys.payment_basepoint, &bob_pubkeys.payment_basepoint,
	);
	let params = default_params();
	let channel_id = ChannelId([3; 32]);

	let alice_spec = CommitmentSpec {
		htlcs: Vec::new(),
		feerate_per_kw,
		to_local_msat: funder_balance_msat,
		to_remote_msat: fundee_balance_msat,
	};
	let bob_spec = CommitmentSpec {
		htlcs: Vec::new(),
		feerate_per_kw,
		to_local_msat: fundee_balance_msat,
		to_remote_msat: funder_balance_msat,
	};

	let alice_point = per_commitment_point(&secp_ctx, &alice_keys.commitment_seed, 0);
	let alice_tx_keys = TxCreationKeys::derive_new(&secp_ctx, &alice_point, &alice_pubkeys, &bob_pubkeys);
	let (alice_tx, _) = build_commitment_transaction(
		&funding, &alice_tx_keys, 0, obscure_factor, true, params.dust_limit_sat,
		params.to_self_delay, &alice_spec,
	).unwrap();

	let bob_point = per_commitment_point(&secp_ctx, &bob_keys.commitment_seed, 0);
	let bob_tx_keys = TxCreationKeys::derive_new(&secp_ctx, &bob_point, &bob_pubkeys, &alice_pubkeys);
	let (bob_tx, _) = build_commitment_transaction(
		&funding, &bob_tx_keys, 0, obscure_factor, false, params.dust_limit_sat,
		params.to_self_delay, &bob_spec,
	).unwrap();

	let alice = Commitments {
		channel_id,
		is_funder: true,
		local_params: params.clone(),
		remote_params: params.clone(),
		local_pubkeys: alice_pubkeys.clone(),
		remote_pubkeys: bob_pubkeys.clone(),
		funding: funding.clone(),
		local_commit: LocalCommit {
			index: 0,
			spec: alice_spec.clone(),
			tx: alice_tx.clone(),
			counterparty_sig: sign_commitment_transaction(&secp_ctx, &alice_tx, &funding, &bob_keys.funding_key),
			htlc_txs_and_sigs: Vec::new(),
		},
		remote_commit: RemoteCommit {
			index: 0,
			spec: bob_spec.clone(),
			txid: bob_tx.compute_txid(),
			remote_per_commitment_point: bob_point,
		},
		remote_next_commit_info: RemoteNextCommitInfo::Revoked(per_commitment_point(&secp_ctx, &bob_keys.commitment_seed, 1)),
		local_changes: Changes::new(),
		remote_changes: Changes::new(),
		local_next_htlc_id: 0,
		remote_next_htlc_id: 0,
		origin_channels: HashMap::new(),
		remote_per_commitment_secrets: CounterpartyCommitmentSecrets::new(),
	};
	let bob = Commitments {
		channel_id,
		is_funder: false,
		local_params: params.clone(),
		remote_params: params.clone(),
		local_pubkeys: bob_pubkeys,
		remote_pubkeys: alice_pubkeys,
		funding: funding.clone(),
		local_commit: LocalCommit {
			index: 0,
			spec: bob_spec,
			tx: bob_tx.clone(),
			counterparty_sig: sign_commitment_transaction(&secp_ctx, &bob_tx, &funding, &alice_keys.funding_key),
			htlc_txs_and_sigs: Vec::new(),
		},
		remote_commit: RemoteCommit {
			index: 0,
			spec: alice_spec,
			txid: alice_tx.compute_txid(),
			remote_per_commitment_point: alice_point,
		},
		remote_next_commit_info: RemoteNextCommitInfo::Revoked(per_commitment_point(&secp_ctx, &alice_keys.commitment_seed, 1)),
		local_changes: Changes::new(),
		remote_changes: Changes::new(),
		local_next_htlc_id: 0,
		remote_next_htlc_id: 0,
		origin_channels: HashMap::new(),
		remote_per_commitment_secrets: CounterpartyCommitmentSecrets::new(),
	};

	(
		Node { cm: alice, keys: alice_keys, node_secret: SecretKey::from_slice(&[21; 32]).unwrap() },
		Node { cm: bob, keys: bob_keys, node_secret: SecretKey::from_slice(&[22; 32]).unwrap() },
	)
}

/// Runs one full signature exchange: `signer` signs, `receiver` acks, `signer` takes the
/// revocation.
fn cross_sign(signer: &mut Node, receiver: &mut Node) {
	let secp_ctx = Secp256k1::new();
	let logger = TestLogger::new();

	let (signer_cm, commit) = signer.cm.send_commit(&signer.keys, &secp_ctx, &&logger).unwrap();
	let (receiver_cm, revoke, _) = receiver.cm.receive_commit(&commit, &receiver.keys, &secp_ctx, &&logger).unwrap();
	let (signer_cm, _) = signer_cm.receive_revocation(&revoke, &secp_ctx, &&logger).unwrap();

	signer.cm = signer_cm;
	receiver.cm = receiver_cm;
}

/// Drives an HTLC from alice to bob all the way to cross-signed on both commitments.
fn add_and_cross_sign(alice: &mut Node, bob: &mut Node, amount_msat: u64, preimage: PaymentPreimage) -> u64 {
	let secp_ctx = Secp256k1::new();

	let (alice_cm, add) = alice.cm.send_add(
		amount_msat, preimage.payment_hash(), 500_000, dummy_onion(&secp_ctx), HtlcOrigin::Local,
	).unwrap();
	alice.cm = alice_cm;
	let (bob_cm, events) = bob.cm.receive_add(&add).unwrap();
	assert_eq!(events, vec![ChannelEvent::WeAcceptedAddHtlc { htlc: add.clone() }]);
	bob.cm = bob_cm;

	cross_sign(alice, bob);
	cross_sign(bob, alice);
	add.htlc_id
}

#[test]
fn full_commitment_dance_with_fulfill() {
	let (mut alice, mut bob) = open_channel(700_000_000, 300_000_000, FEERATE);
	let secp_ctx = Secp256k1::new();
	let logger = TestLogger::new();

	let preimage = PaymentPreimage([42; 32]);
	let htlc_id = add_and_cross_sign(&mut alice, &mut bob, 50_000_000, preimage);

	// The HTLC is now live on both commitments, in opposite directions.
	assert!(alice.cm.local_commit.spec.find_htlc(HtlcDirection::Outgoing, htlc_id).is_some());
	assert!(bob.cm.local_commit.spec.find_htlc(HtlcDirection::Incoming, htlc_id).is_some());
	assert_eq!(alice.cm.local_commit.htlc_txs_and_sigs.len(), 1);
	assert_eq!(bob.cm.local_commit.htlc_txs_and_sigs.len(), 1);

	// Bob settles with the preimage and both sides sign the settlement away.
	let (bob_cm, fulfill) = bob.cm.send_fulfill(htlc_id, preimage).unwrap();
	bob.cm = bob_cm;
	let (alice_cm, events) = alice.cm.receive_fulfill(&fulfill).unwrap();
	alice.cm = alice_cm;
	match &events[..] {
		[ChannelEvent::WeAcceptedFulfillHtlc { msg, origin, htlc }] => {
			assert_eq!(msg, &fulfill);
			assert_eq!(origin, &HtlcOrigin::Local);
			assert_eq!(htlc.htlc_id, htlc_id);
		},
		other => panic!("unexpected events {:?}", other),
	}

	cross_sign(&mut bob, &mut alice);
	cross_sign(&mut alice, &mut bob);

	// Value moved: 50k msat crossed from alice to bob and no HTLC remains.
	assert_eq!(alice.cm.local_commit.spec.to_local_msat, 650_000_000);
	assert_eq!(alice.cm.local_commit.spec.to_remote_msat, 350_000_000);
	assert_eq!(bob.cm.local_commit.spec.to_local_msat, 350_000_000);
	assert_eq!(bob.cm.local_commit.spec.to_remote_msat, 650_000_000);
	assert!(alice.cm.local_commit.spec.htlcs.is_empty());
	assert!(bob.cm.local_commit.spec.htlcs.is_empty());

	// The settled HTLC's origin has been pruned.
	assert!(alice.cm.origin_channels.is_empty());

	// Both sides are idle again: no pending changes anywhere.
	assert_eq!(alice.cm.send_commit(&alice.keys, &secp_ctx, &&logger).unwrap_err(), ChannelError::CannotSignWithoutChanges);
	assert_eq!(bob.cm.send_commit(&bob.keys, &secp_ctx, &&logger).unwrap_err(), ChannelError::CannotSignWithoutChanges);
}

#[test]
fn fail_htlc_refunds_the_sender() {
	let (mut alice, mut bob) = open_channel(700_000_000, 300_000_000, FEERATE);

	let preimage = PaymentPreimage([43; 32]);
	let htlc_id = add_and_cross_sign(&mut alice, &mut bob, 20_000_000, preimage);

	let sphinx = TestSphinx;
	let (bob_cm, fail) = bob.cm.send_fail(htlc_id, HTLCFailReason::FailureCode(PERM | 15), &bob.node_secret, &&sphinx).unwrap();
	bob.cm = bob_cm;
	assert!(!fail.reason.data.is_empty());

	let (alice_cm, events) = alice.cm.receive_fail(&fail).unwrap();
	alice.cm = alice_cm;
	assert!(matches!(events[0], ChannelEvent::WeAcceptedFailHtlc { .. }));

	cross_sign(&mut bob, &mut alice);
	cross_sign(&mut alice, &mut bob);

	// The value came back.
	assert_eq!(alice.cm.local_commit.spec.to_local_msat, 700_000_000);
	assert_eq!(bob.cm.local_commit.spec.to_local_msat, 300_000_000);
}

#[test]
fn fail_malformed_requires_the_badonion_bit() {
	let (mut alice, mut bob) = open_channel(700_000_000, 300_000_000, FEERATE);

	let preimage = PaymentPreimage([44; 32]);
	let htlc_id = add_and_cross_sign(&mut alice, &mut bob, 20_000_000, preimage);

	assert_eq!(
		bob.cm.send_fail_malformed(htlc_id, [9; 32], PERM | 1).unwrap_err(),
		ChannelError::InvalidFailureCode(PERM | 1)
	);

	let (bob_cm, malformed) = bob.cm.send_fail_malformed(htlc_id, [9; 32], BADONION | PERM | 4).unwrap();
	bob.cm = bob_cm;
	let (alice_cm, events) = alice.cm.receive_fail_malformed(&malformed).unwrap();
	alice.cm = alice_cm;
	assert!(matches!(events[0], ChannelEvent::WeAcceptedFailMalformedHtlc { .. }));

	cross_sign(&mut bob, &mut alice);
	cross_sign(&mut alice, &mut bob);
	assert_eq!(alice.cm.local_commit.spec.to_local_msat, 700_000_000);
}

#[test]
fn fulfill_validation() {
	let (mut alice, mut bob) = open_channel(700_000_000, 300_000_000, FEERATE);

	let preimage = PaymentPreimage([45; 32]);
	let htlc_id = add_and_cross_sign(&mut alice, &mut bob, 20_000_000, preimage);

	assert_eq!(bob.cm.send_fulfill(99, preimage).unwrap_err(), ChannelError::UnknownHtlcId(99));
	assert_eq!(
		bob.cm.send_fulfill(htlc_id, PaymentPreimage([0; 32])).unwrap_err(),
		ChannelError::InvalidPaymentPreimage(preimage.payment_hash())
	);

	let (bob_cm, fulfill) = bob.cm.send_fulfill(htlc_id, preimage).unwrap();
	assert_eq!(bob_cm.send_fulfill(htlc_id, preimage).unwrap_err(), ChannelError::HtlcAlreadySent(htlc_id));

	// The peer rejects a fulfill whose preimage does not match, too.
	let mut bogus = fulfill.clone();
	bogus.payment_preimage = PaymentPreimage([0; 32]);
	assert_eq!(
		alice.cm.receive_fulfill(&bogus).unwrap_err(),
		ChannelError::InvalidPaymentPreimage(preimage.payment_hash())
	);
}

#[test]
fn add_is_bounded_by_balance_and_minimums() {
	let (alice, _bob) = open_channel(700_000_000, 300_000_000, FEERATE);
	let secp_ctx = Secp256k1::new();

	assert_eq!(
		alice.cm.send_add(500, PaymentHash([0; 32]), 500_000, dummy_onion(&secp_ctx), HtlcOrigin::Local).unwrap_err(),
		ChannelError::HtlcValueTooSmall { minimum_msat: 1_000 }
	);

	// 700k sat total, 10k reserve: way more than the balance is unaffordable.
	assert!(matches!(
		alice.cm.send_add(695_000_000, PaymentHash([0; 32]), 500_000, dummy_onion(&secp_ctx), HtlcOrigin::Local).unwrap_err(),
		ChannelError::InsufficientFunds { .. }
	));
}

#[test]
fn sequential_htlc_ids_are_enforced() {
	let (alice, bob) = open_channel(700_000_000, 300_000_000, FEERATE);
	let secp_ctx = Secp256k1::new();

	let (_, add) = alice.cm.send_add(20_000_000, PaymentHash([7; 32]), 500_000, dummy_onion(&secp_ctx), HtlcOrigin::Local).unwrap();
	let mut skipped = add.clone();
	skipped.htlc_id = 5;
	assert_eq!(
		bob.cm.receive_add(&skipped).unwrap_err(),
		ChannelError::UnexpectedHtlcId { expected: 0, actual: 5 }
	);
}

#[test]
fn update_fee_flow() {
	let (mut alice, mut bob) = open_channel(700_000_000, 300_000_000, FEERATE);
	let config = ChannelConfig::default();

	// Only the funder may propose fees.
	assert_eq!(bob.cm.send_fee(1200).unwrap_err(), ChannelError::FundeeCannotSendUpdateFee);

	let (alice_cm, fee) = alice.cm.send_fee(1200).unwrap();
	alice.cm = alice_cm;

	// Too far from the fundee's own estimate is rejected, close by is accepted.
	let crazy = crate::ln::msgs::UpdateFee { channel_id: fee.channel_id, feerate_per_kw: 50_000 };
	assert_eq!(
		bob.cm.receive_fee(&crazy, FEERATE, &config).unwrap_err(),
		ChannelError::FeerateTooDifferent { remote_feerate_per_kw: 50_000, local_feerate_per_kw: FEERATE }
	);
	let (bob_cm, events) = bob.cm.receive_fee(&fee, FEERATE, &config).unwrap();
	bob.cm = bob_cm;
	assert_eq!(events, vec![ChannelEvent::WeAcceptedUpdateFee { feerate_per_kw: 1200 }]);

	cross_sign(&mut alice, &mut bob);
	assert_eq!(bob.cm.local_commit.spec.feerate_per_kw, 1200);
}

#[test]
fn funder_cannot_dip_below_reserve_with_fees() {
	// Alice's balance is exactly reserve + new fee - 1 sat.
	let funder_balance_msat = (10_000 + 724 - 1) * 1000;
	let (alice, _bob) = open_channel(funder_balance_msat, 1_000_000_000 - funder_balance_msat, 500);

	assert_eq!(
		alice.cm.send_fee(1000).unwrap_err(),
		ChannelError::CannotAffordFee { channel_reserve_sat: 10_000, fee_sat: 724, missing_sat: 1 }
	);
}

#[test]
fn signature_count_mismatch_leaves_state_unchanged() {
	let (mut alice, mut bob) = open_channel(700_000_000, 300_000_000, FEERATE);
	let secp_ctx = Secp256k1::new();
	let logger = TestLogger::new();

	let (alice_cm, add) = alice.cm.send_add(
		50_000_000, PaymentPreimage([46; 32]).payment_hash(), 500_000, dummy_onion(&secp_ctx), HtlcOrigin::Local,
	).unwrap();
	alice.cm = alice_cm;
	let (bob_cm, _) = bob.cm.receive_add(&add).unwrap();
	bob.cm = bob_cm;

	let (_, mut commit) = alice.cm.send_commit(&alice.keys, &secp_ctx, &&logger).unwrap();
	assert_eq!(commit.htlc_signatures.len(), 1);
	commit.htlc_signatures.clear();

	let before = bob.cm.clone();
	assert_eq!(
		bob.cm.receive_commit(&commit, &bob.keys, &secp_ctx, &&logger).unwrap_err(),
		ChannelError::SignatureCountMismatch { expected: 1, got: 0 }
	);
	assert_eq!(bob.cm, before);
}

#[test]
fn tampered_signatures_are_rejected() {
	let (mut alice, mut bob) = open_channel(700_000_000, 300_000_000, FEERATE);
	let secp_ctx = Secp256k1::new();
	let logger = TestLogger::new();

	let (alice_cm, add) = alice.cm.send_add(
		50_000_000, PaymentPreimage([47; 32]).payment_hash(), 500_000, dummy_onion(&secp_ctx), HtlcOrigin::Local,
	).unwrap();
	alice.cm = alice_cm;
	let (bob_cm, _) = bob.cm.receive_add(&add).unwrap();
	bob.cm = bob_cm;

	let (_, commit) = alice.cm.send_commit(&alice.keys, &secp_ctx, &&logger).unwrap();

	// Swap the commitment signature for the (valid but wrong) HTLC signature.
	let mut tampered = commit.clone();
	tampered.signature = commit.htlc_signatures[0];
	assert_eq!(
		bob.cm.receive_commit(&tampered, &bob.keys, &secp_ctx, &&logger).unwrap_err(),
		ChannelError::InvalidCommitmentSignature
	);

	// And the other way around: the HTLC signature check is aggregated per output.
	let mut tampered = commit.clone();
	tampered.htlc_signatures[0] = commit.signature;
	match bob.cm.receive_commit(&tampered, &bob.keys, &secp_ctx, &&logger).unwrap_err() {
		ChannelError::InvalidHtlcSignatures { invalid_outputs } => {
			assert_eq!(invalid_outputs.len(), 1);
		},
		err => panic!("unexpected error {:?}", err),
	}
}

#[test]
fn commitment_preconditions() {
	let (mut alice, mut bob) = open_channel(700_000_000, 300_000_000, FEERATE);
	let secp_ctx = Secp256k1::new();
	let logger = TestLogger::new();

	// Nothing to sign on a fresh channel, in either direction.
	assert_eq!(alice.cm.send_commit(&alice.keys, &secp_ctx, &&logger).unwrap_err(), ChannelError::CannotSignWithoutChanges);

	let dummy_commit = crate::ln::msgs::CommitmentSigned {
		channel_id: alice.cm.channel_id,
		signature: alice.cm.local_commit.counterparty_sig,
		htlc_signatures: Vec::new(),
	};
	assert_eq!(
		bob.cm.receive_commit(&dummy_commit, &bob.keys, &secp_ctx, &&logger).unwrap_err(),
		ChannelError::ReceivedCommitmentSignedWhenWeHaveNoPendingChanges
	);

	// Stage an HTLC; after signing once, alice must wait for the revocation.
	let (alice_cm, add) = alice.cm.send_add(
		20_000_000, PaymentPreimage([48; 32]).payment_hash(), 500_000, dummy_onion(&secp_ctx), HtlcOrigin::Local,
	).unwrap();
	alice.cm = alice_cm;
	let (bob_cm, _) = bob.cm.receive_add(&add).unwrap();
	bob.cm = bob_cm;

	let (alice_cm, commit) = alice.cm.send_commit(&alice.keys, &secp_ctx, &&logger).unwrap();
	alice.cm = alice_cm;
	assert_eq!(alice.cm.send_commit(&alice.keys, &secp_ctx, &&logger).unwrap_err(), ChannelError::CannotSignBeforeRevocation);

	// Revocation sanity: a random secret is rejected, and an unexpected revocation is too.
	let (bob_cm, revoke, _) = bob.cm.receive_commit(&commit, &bob.keys, &secp_ctx, &&logger).unwrap();
	bob.cm = bob_cm;

	let mut bogus = revoke.clone();
	bogus.per_commitment_secret = [9; 32];
	assert_eq!(alice.cm.receive_revocation(&bogus, &secp_ctx, &&logger).unwrap_err(), ChannelError::InvalidRevocation);

	let (alice_cm, _) = alice.cm.receive_revocation(&revoke, &secp_ctx, &&logger).unwrap();
	alice.cm = alice_cm;
	assert_eq!(alice.cm.receive_revocation(&revoke, &secp_ctx, &&logger).unwrap_err(), ChannelError::UnexpectedRevocation);
}

#[test]
fn engine_operations_are_pure() {
	let (mut alice, mut bob) = open_channel(700_000_000, 300_000_000, FEERATE);
	let secp_ctx = Secp256k1::new();
	let logger = TestLogger::new();

	let (alice_cm, add) = alice.cm.send_add(
		20_000_000, PaymentPreimage([49; 32]).payment_hash(), 500_000, dummy_onion(&secp_ctx), HtlcOrigin::Local,
	).unwrap();
	let (alice_cm_again, add_again) = alice.cm.send_add(
		20_000_000, PaymentPreimage([49; 32]).payment_hash(), 500_000, dummy_onion(&secp_ctx), HtlcOrigin::Local,
	).unwrap();
	assert_eq!(alice_cm, alice_cm_again);
	assert_eq!(add, add_again);
	alice.cm = alice_cm;

	let (bob_cm, _) = bob.cm.receive_add(&add).unwrap();
	bob.cm = bob_cm;

	let (alice_signed, commit) = alice.cm.send_commit(&alice.keys, &secp_ctx, &&logger).unwrap();
	let (alice_signed_again, commit_again) = alice.cm.send_commit(&alice.keys, &secp_ctx, &&logger).unwrap();
	assert_eq!(alice_signed, alice_signed_again);
	assert_eq!(commit, commit_again);

	let (bob_acked, revoke, events) = bob.cm.receive_commit(&commit, &bob.keys, &secp_ctx, &&logger).unwrap();
	let (bob_acked_again, revoke_again, events_again) = bob.cm.receive_commit(&commit, &bob.keys, &secp_ctx, &&logger).unwrap();
	assert_eq!(bob_acked, bob_acked_again);
	assert_eq!(revoke, revoke_again);
	assert_eq!(events, events_again);
}

#[test]
fn revoked_commitment_can_be_punished() {
	let (mut alice, mut bob) = open_channel(700_000_000, 300_000_000, FEERATE);
	let secp_ctx = Secp256k1::new();

	// Bob's commitment 0 is about to be revoked by the first signature exchange.
	let revoked_tx = bob.cm.local_commit.tx.clone();

	let preimage = PaymentPreimage([50; 32]);
	add_and_cross_sign(&mut alice, &mut bob, 20_000_000, preimage);

	// Alice now holds bob's secret for commitment 0 and can sweep both outputs of the old tx.
	let builder = fundrecoverer::create_penalty_tx(
		&secp_ctx, true, &alice.cm.funding, &alice.cm.remote_per_commitment_secrets,
		&alice.keys, &alice.cm.remote_pubkeys, &alice.cm.local_params, &alice.cm.remote_params,
		Network::Regtest, &revoked_tx,
	).unwrap();

	// Bob (the non-funder) broadcast, so the commitment fee came out of alice's balance.
	assert_eq!(builder.claimable_value(), Amount::from_sat(300_000 + 700_000 - 724));
	let penalty = builder.sign(&secp_ctx);
	assert_eq!(penalty.input.len(), 2);
}

#[test]
fn latest_remote_commitment_funds_are_recoverable() {
	let (mut alice, mut bob) = open_channel(700_000_000, 300_000_000, FEERATE);
	let secp_ctx = Secp256k1::new();

	let preimage = PaymentPreimage([51; 32]);
	add_and_cross_sign(&mut alice, &mut bob, 20_000_000, preimage);

	// Bob force-closes with his current commitment; alice recovers her to_remote balance.
	let bob_tx = bob.cm.local_commit.tx.clone();
	let builder = fundrecoverer::try_get_funds_from_remote_commitment_tx(
		&secp_ctx, true, &alice.cm.funding, &alice.cm.remote_per_commitment_secrets,
		&alice.cm.remote_commit, &alice.keys, &alice.cm.remote_pubkeys, Network::Regtest, &bob_tx,
	).unwrap();

	// 700k minus the 20k in-flight HTLC minus the commit fee (one HTLC output, paid by alice).
	assert_eq!(builder.claimable_value(), Amount::from_sat(700_000 - 20_000 - (724 + 172)));
}
