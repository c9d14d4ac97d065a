// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Reclaiming funds after a force close.
//!
//! When either side broadcasts a commitment transaction the channel is over; what remains is
//! identifying which commitment hit the chain (via its obscured commitment number) and
//! assembling a transaction claiming the outputs we own. Three paths exist: our plain balance on
//! a counterparty commitment, our delayed balance on our own commitment, and the penalty sweep
//! of everything on a *revoked* counterparty commitment.
//!
//! The functions here return a [`RecoveryTxBuilder`] holding the recovered inputs and their
//! spend paths; the caller picks destination outputs and an implicit fee, then calls
//! [`RecoveryTxBuilder::sign`].

use bitcoin::hash_types::Txid;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::ln::chan_utils::{
	self, ChannelPublicKeys, CounterpartyCommitmentSecrets, FundingCoin, ObscuredCommitmentNumber,
	COMMITMENT_TX_VERSION,
};
use crate::ln::channel_keys::{
	derive_private_key, derive_private_revocation_key, DelayedPaymentKey, PaymentKey, RevocationKey,
};
use crate::ln::commitments::{ChannelParams, RemoteCommit};
use crate::sign::InMemoryChannelKeys;

use core::fmt;

/// An error produced while validating a broadcast commitment transaction or assembling the
/// claiming transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoveryError {
	/// The transaction does not carry the version every commitment transaction has.
	InvalidTxVersionForCommitmentTx(i32),
	/// The transaction has no inputs at all.
	CommitmentTxHasNoInputs,
	/// The transaction has more than its single funding input.
	CommitmentTxHasMultipleInputs(usize),
	/// The transaction's input does not spend the channel funding output.
	CommitmentTxDoesNotSpendFunding {
		/// The funding outpoint a commitment transaction must spend.
		expected: OutPoint,
		/// The outpoint it actually spends.
		actual: OutPoint,
	},
	/// The locktime/sequence pair does not carry a tagged obscured commitment number.
	InvalidObscuredCommitmentNumber,
	/// The recovered commitment number is later than anything we have seen; our state is stale.
	CommitmentNumberFromTheFuture(u64),
	/// The commitment has not been revoked, so no penalty spend exists for it.
	CommitmentNotRevoked(u64),
	/// No output of the commitment transaction pays us enough to clear the dust limit.
	BalanceBelowDustLimit,
}

impl fmt::Display for RecoveryError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			RecoveryError::InvalidTxVersionForCommitmentTx(version) =>
				write!(f, "transaction version {} is not the commitment tx version", version),
			RecoveryError::CommitmentTxHasNoInputs => write!(f, "commitment tx has no inputs"),
			RecoveryError::CommitmentTxHasMultipleInputs(count) => write!(f, "commitment tx has {} inputs, expected one", count),
			RecoveryError::CommitmentTxDoesNotSpendFunding { expected, actual } =>
				write!(f, "commitment tx spends {} instead of the funding output {}", actual, expected),
			RecoveryError::InvalidObscuredCommitmentNumber =>
				write!(f, "locktime/sequence do not carry an obscured commitment number"),
			RecoveryError::CommitmentNumberFromTheFuture(number) =>
				write!(f, "commitment number {} is newer than our state", number),
			RecoveryError::CommitmentNotRevoked(number) =>
				write!(f, "commitment number {} has not been revoked", number),
			RecoveryError::BalanceBelowDustLimit => write!(f, "no claimable output above the dust limit"),
		}
	}
}

/// Checks that `tx` has the shape of a commitment transaction for the channel funded at
/// `funding_outpoint` and extracts its obscured commitment number.
pub fn validate_commitment_tx(funding_outpoint: &OutPoint, tx: &Transaction) -> Result<ObscuredCommitmentNumber, RecoveryError> {
	if tx.version != COMMITMENT_TX_VERSION {
		return Err(RecoveryError::InvalidTxVersionForCommitmentTx(tx.version.0));
	}
	if tx.input.is_empty() {
		return Err(RecoveryError::CommitmentTxHasNoInputs);
	}
	if tx.input.len() > 1 {
		return Err(RecoveryError::CommitmentTxHasMultipleInputs(tx.input.len()));
	}
	if tx.input[0].previous_output != *funding_outpoint {
		return Err(RecoveryError::CommitmentTxDoesNotSpendFunding {
			expected: *funding_outpoint,
			actual: tx.input[0].previous_output,
		});
	}
	ObscuredCommitmentNumber::from_locktime_and_sequence(tx.lock_time, tx.input[0].sequence)
		.ok_or(RecoveryError::InvalidObscuredCommitmentNumber)
}

/// How a recovered commitment output gets spent.
#[derive(Clone)]
enum SpendPath {
	/// A plain P2WPKH spend with the derived payment key: `<sig> <pubkey>`.
	Payment {
		key: SecretKey,
	},
	/// The delayed branch of a revokeable script: `<sig> <> <witness_script>`, with the input
	/// sequence set to the contest delay.
	DelayedPayment {
		key: SecretKey,
		witness_script: ScriptBuf,
		to_self_delay: u16,
	},
	/// The revocation branch of a revokeable script: `<sig> <1> <witness_script>`.
	Revocation {
		key: SecretKey,
		witness_script: ScriptBuf,
	},
}

impl core::fmt::Debug for SpendPath {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		match self {
			SpendPath::Payment { .. } => f.debug_struct("Payment").field("key", &"<redacted>").finish(),
			SpendPath::DelayedPayment { witness_script, to_self_delay, .. } => f
				.debug_struct("DelayedPayment")
				.field("key", &"<redacted>")
				.field("witness_script", witness_script)
				.field("to_self_delay", to_self_delay)
				.finish(),
			SpendPath::Revocation { witness_script, .. } => f
				.debug_struct("Revocation")
				.field("key", &"<redacted>")
				.field("witness_script", witness_script)
				.finish(),
		}
	}
}

/// One output of the broadcast commitment transaction we are able to claim.
#[derive(Clone, Debug)]
pub struct RecoveredOutput {
	/// The outpoint to spend.
	pub outpoint: OutPoint,
	/// The output being claimed.
	pub output: TxOut,
	path: SpendPath,
}

/// A partially-built transaction claiming our funds out of a broadcast commitment transaction.
///
/// The recovered inputs and their spend paths are fixed; the caller adds outputs (leaving the
/// difference as fee) and signs.
#[derive(Debug)]
pub struct RecoveryTxBuilder {
	/// The network the claimed coins live on, for the caller's destination-address derivation.
	pub network: Network,
	inputs: Vec<RecoveredOutput>,
	outputs: Vec<TxOut>,
}

impl RecoveryTxBuilder {
	fn new(network: Network) -> RecoveryTxBuilder {
		RecoveryTxBuilder { network, inputs: Vec::new(), outputs: Vec::new() }
	}

	/// The outputs this builder will claim.
	pub fn recovered_outputs(&self) -> &[RecoveredOutput] {
		&self.inputs
	}

	/// The total value of the claimed outputs. Whatever the added outputs leave unspent of this
	/// becomes the fee.
	pub fn claimable_value(&self) -> Amount {
		self.inputs.iter().map(|input| input.output.value).sum()
	}

	/// Adds a destination output.
	pub fn add_output(&mut self, output: TxOut) {
		self.outputs.push(output);
	}

	/// Builds and signs the claiming transaction.
	pub fn sign<T: secp256k1::Signing>(self, secp_ctx: &Secp256k1<T>) -> Transaction {
		let mut tx = Transaction {
			version: COMMITMENT_TX_VERSION,
			lock_time: bitcoin::absolute::LockTime::ZERO,
			input: self.inputs.iter().map(|input| TxIn {
				previous_output: input.outpoint,
				script_sig: ScriptBuf::new(),
				sequence: match &input.path {
					SpendPath::DelayedPayment { to_self_delay, .. } => Sequence(*to_self_delay as u32),
					_ => Sequence::ENABLE_RBF_NO_LOCKTIME,
				},
				witness: Witness::new(),
			}).collect(),
			output: self.outputs.clone(),
		};

		let mut witnesses = Vec::with_capacity(self.inputs.len());
		{
			let mut sighash_cache = SighashCache::new(&tx);
			for (idx, input) in self.inputs.iter().enumerate() {
				let (key, sighash) = match &input.path {
					SpendPath::Payment { key } => {
						let sighash = sighash_cache
							.p2wpkh_signature_hash(idx, &input.output.script_pubkey, input.output.value, EcdsaSighashType::All)
							.unwrap();
						(key, sighash.to_byte_array())
					},
					SpendPath::DelayedPayment { key, witness_script, .. } => {
						let sighash = sighash_cache
							.p2wsh_signature_hash(idx, witness_script, input.output.value, EcdsaSighashType::All)
							.unwrap();
						(key, sighash.to_byte_array())
					},
					SpendPath::Revocation { key, witness_script } => {
						let sighash = sighash_cache
							.p2wsh_signature_hash(idx, witness_script, input.output.value, EcdsaSighashType::All)
							.unwrap();
						(key, sighash.to_byte_array())
					},
				};
				let sig = secp_ctx.sign_ecdsa(&Message::from_digest(sighash), key);
				let mut sig_ser = sig.serialize_der().to_vec();
				sig_ser.push(EcdsaSighashType::All as u8);

				let mut witness = Witness::new();
				witness.push(sig_ser);
				match &input.path {
					SpendPath::Payment { key } => {
						witness.push(PublicKey::from_secret_key(secp_ctx, key).serialize().to_vec());
					},
					SpendPath::DelayedPayment { witness_script, .. } => {
						witness.push(Vec::new());
						witness.push(witness_script.as_bytes().to_vec());
					},
					SpendPath::Revocation { witness_script, .. } => {
						witness.push(vec![1u8]);
						witness.push(witness_script.as_bytes().to_vec());
					},
				}
				witnesses.push(witness);
			}
		}
		for (txin, witness) in tx.input.iter_mut().zip(witnesses.into_iter()) {
			txin.witness = witness;
		}
		tx
	}
}

fn unobscure(
	is_local_funder: bool, local_pubkeys: &ChannelPublicKeys, remote_pubkeys: &ChannelPublicKeys,
	obscured: ObscuredCommitmentNumber,
) -> u64 {
	let (funder, fundee) = if is_local_funder {
		(&local_pubkeys.payment_basepoint, &remote_pubkeys.payment_basepoint)
	} else {
		(&remote_pubkeys.payment_basepoint, &local_pubkeys.payment_basepoint)
	};
	obscured.unobscure(chan_utils::get_commitment_transaction_number_obscure_factor(funder, fundee))
}

/// Recovers our plain balance from a commitment transaction broadcast by the counterparty.
///
/// The per-commitment point is recovered either from the revocation secret the counterparty
/// revealed (for an old, revoked commitment) or from the point we recorded for the latest known
/// remote commitment. A commitment we know nothing about means our state is stale.
pub fn try_get_funds_from_remote_commitment_tx<T: secp256k1::Signing>(
	secp_ctx: &Secp256k1<T>, is_local_funder: bool, funding: &FundingCoin,
	remote_per_commitment_secrets: &CounterpartyCommitmentSecrets, remote_commit: &RemoteCommit,
	local_keys: &InMemoryChannelKeys, remote_pubkeys: &ChannelPublicKeys, network: Network,
	tx: &Transaction,
) -> Result<RecoveryTxBuilder, RecoveryError> {
	let obscured = validate_commitment_tx(&funding.outpoint, tx)?;
	let local_pubkeys = local_keys.pubkeys(secp_ctx);
	let number = unobscure(is_local_funder, &local_pubkeys, remote_pubkeys, obscured);

	let per_commitment_point = if let Some(secret) = remote_per_commitment_secrets.get_secret(number) {
		let secret_key = SecretKey::from_slice(&secret)
			.expect("a revealed per-commitment secret was validated against its point");
		PublicKey::from_secret_key(secp_ctx, &secret_key)
	} else if number == remote_commit.index {
		remote_commit.remote_per_commitment_point
	} else {
		return Err(RecoveryError::CommitmentNumberFromTheFuture(number));
	};

	let payment_key = derive_private_key(secp_ctx, &per_commitment_point, &local_keys.payment_base_key);
	let payment_pubkey = PaymentKey(PublicKey::from_secret_key(secp_ctx, &payment_key));
	let to_remote_script = chan_utils::get_to_remote_script(&payment_pubkey);

	let vout = tx.output.iter().position(|output| output.script_pubkey == to_remote_script)
		.ok_or(RecoveryError::BalanceBelowDustLimit)?;

	let mut builder = RecoveryTxBuilder::new(network);
	builder.inputs.push(RecoveredOutput {
		outpoint: OutPoint { txid: tx.compute_txid(), vout: vout as u32 },
		output: tx.output[vout].clone(),
		path: SpendPath::Payment { key: payment_key },
	});
	Ok(builder)
}

/// Recovers our delayed balance from a commitment transaction we broadcast ourselves.
///
/// The claiming input must (and will) carry a sequence of `to_self_delay`, so the signed
/// transaction only becomes valid once our contest delay has passed.
pub fn try_get_funds_from_local_commitment_tx<T: secp256k1::Signing + secp256k1::Verification>(
	secp_ctx: &Secp256k1<T>, is_local_funder: bool, funding: &FundingCoin,
	local_keys: &InMemoryChannelKeys, remote_pubkeys: &ChannelPublicKeys, to_self_delay: u16,
	network: Network, tx: &Transaction,
) -> Result<RecoveryTxBuilder, RecoveryError> {
	let obscured = validate_commitment_tx(&funding.outpoint, tx)?;
	let local_pubkeys = local_keys.pubkeys(secp_ctx);
	let number = unobscure(is_local_funder, &local_pubkeys, remote_pubkeys, obscured);

	// It is our own broadcast: every per-commitment point is derivable from our seed.
	let per_commitment_point = chan_utils::per_commitment_point(secp_ctx, &local_keys.commitment_seed, number);

	let delayed_key = derive_private_key(secp_ctx, &per_commitment_point, &local_keys.delayed_payment_base_key);
	let delayed_pubkey = DelayedPaymentKey(PublicKey::from_secret_key(secp_ctx, &delayed_key));
	let revocation_pubkey = RevocationKey::from_basepoint(secp_ctx, &remote_pubkeys.revocation_basepoint, &per_commitment_point);
	let witness_script = chan_utils::get_revokeable_redeemscript(&revocation_pubkey, to_self_delay, &delayed_pubkey);
	let to_local_script = witness_script.to_p2wsh();

	let vout = tx.output.iter().position(|output| output.script_pubkey == to_local_script)
		.ok_or(RecoveryError::BalanceBelowDustLimit)?;

	let mut builder = RecoveryTxBuilder::new(network);
	builder.inputs.push(RecoveredOutput {
		outpoint: OutPoint { txid: tx.compute_txid(), vout: vout as u32 },
		output: tx.output[vout].clone(),
		path: SpendPath::DelayedPayment { key: delayed_key, witness_script, to_self_delay },
	});
	Ok(builder)
}

/// Assembles the penalty transaction sweeping a *revoked* commitment the counterparty was
/// reckless enough to broadcast: our balance via the payment key, their balance via the
/// revocation key derived from the secret they revealed.
///
/// Outputs are scanned in the transaction's canonical (BIP 69) order; outputs at or below the
/// counterparty's dust limit are not worth claiming and are skipped.
pub fn create_penalty_tx<T: secp256k1::Signing + secp256k1::Verification>(
	secp_ctx: &Secp256k1<T>, is_local_funder: bool, funding: &FundingCoin,
	remote_per_commitment_secrets: &CounterpartyCommitmentSecrets, local_keys: &InMemoryChannelKeys,
	remote_pubkeys: &ChannelPublicKeys, local_params: &ChannelParams, remote_params: &ChannelParams,
	network: Network, tx: &Transaction,
) -> Result<RecoveryTxBuilder, RecoveryError> {
	let obscured = validate_commitment_tx(&funding.outpoint, tx)?;
	let local_pubkeys = local_keys.pubkeys(secp_ctx);
	let number = unobscure(is_local_funder, &local_pubkeys, remote_pubkeys, obscured);

	let secret = remote_per_commitment_secrets.get_secret(number)
		.ok_or(RecoveryError::CommitmentNotRevoked(number))?;
	let secret_key = SecretKey::from_slice(&secret)
		.expect("a revealed per-commitment secret was validated against its point");
	let per_commitment_point = PublicKey::from_secret_key(secp_ctx, &secret_key);

	let payment_key = derive_private_key(secp_ctx, &per_commitment_point, &local_keys.payment_base_key);
	let payment_pubkey = PaymentKey(PublicKey::from_secret_key(secp_ctx, &payment_key));
	let to_remote_script = chan_utils::get_to_remote_script(&payment_pubkey);

	let revocation_key = derive_private_revocation_key(secp_ctx, &secret_key, &local_keys.revocation_base_key);
	let revocation_pubkey = RevocationKey(PublicKey::from_secret_key(secp_ctx, &revocation_key));
	let their_delayed_pubkey = DelayedPaymentKey::from_basepoint(secp_ctx, &remote_pubkeys.delayed_payment_basepoint, &per_commitment_point);
	let to_local_script = chan_utils::get_revokeable_redeemscript(&revocation_pubkey, local_params.to_self_delay, &their_delayed_pubkey);
	let to_local_spk = to_local_script.to_p2wsh();

	let txid = tx.compute_txid();
	let mut builder = RecoveryTxBuilder::new(network);
	for (vout, output) in tx.output.iter().enumerate() {
		if output.value.to_sat() <= remote_params.dust_limit_sat {
			continue;
		}
		if output.script_pubkey == to_remote_script {
			builder.inputs.push(RecoveredOutput {
				outpoint: OutPoint { txid, vout: vout as u32 },
				output: output.clone(),
				path: SpendPath::Payment { key: payment_key },
			});
		} else if output.script_pubkey == to_local_spk {
			builder.inputs.push(RecoveredOutput {
				outpoint: OutPoint { txid, vout: vout as u32 },
				output: output.clone(),
				path: SpendPath::Revocation { key: revocation_key, witness_script: to_local_script.clone() },
			});
		}
	}
	if builder.inputs.is_empty() {
		return Err(RecoveryError::BalanceBelowDustLimit);
	}
	Ok(builder)
}
