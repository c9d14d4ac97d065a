// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Various utilities for building scripts, deriving per-commitment material and constructing the
//! commitment and HTLC transactions a channel state maps to.

use bitcoin::absolute::LockTime;
use bitcoin::hash_types::Txid;
use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::hashes::ripemd160::Hash as Ripemd160;
use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::opcodes;
use bitcoin::script::Builder;
use bitcoin::secp256k1;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, PubkeyHash, ScriptBuf, Sequence, Transaction, TxIn, TxOut, WPubkeyHash, Witness};

use crate::ln::channel_keys::{
	DelayedPaymentBasepoint, DelayedPaymentKey, HtlcBasepoint, HtlcKey, PaymentBasepoint, PaymentKey,
	RevocationBasepoint, RevocationKey,
};
use crate::ln::commitment_spec::{CommitmentSpec, HtlcDirection};
use crate::ln::commitments::ChannelError;
use crate::ln::types::PaymentHash;
use crate::util::transaction_utils;

/// The version every commitment transaction (and second-stage HTLC transaction) carries.
pub const COMMITMENT_TX_VERSION: Version = Version::TWO;

/// Commitment numbers are 48-bit counters.
pub const HIGHEST_COMMITMENT_NUMBER: u64 = (1 << 48) - 1;

/// The weight of a commitment transaction carrying no HTLC outputs.
pub const COMMITMENT_TX_BASE_WEIGHT: u64 = 724;
/// The incremental commitment transaction weight of one non-dust HTLC output.
pub const COMMITMENT_TX_WEIGHT_PER_HTLC: u64 = 172;

pub(crate) const HTLC_SUCCESS_TX_WEIGHT: u64 = 703;
pub(crate) const HTLC_TIMEOUT_TX_WEIGHT: u64 = 663;

/// The fee a second-stage HTLC-timeout transaction pays at the given feerate.
pub fn htlc_timeout_tx_fee_sat(feerate_per_kw: u32) -> u64 {
	feerate_per_kw as u64 * HTLC_TIMEOUT_TX_WEIGHT / 1000
}

/// The fee a second-stage HTLC-success transaction pays at the given feerate.
pub fn htlc_success_tx_fee_sat(feerate_per_kw: u32) -> u64 {
	feerate_per_kw as u64 * HTLC_SUCCESS_TX_WEIGHT / 1000
}

/// The fee the commitment transaction for the given spec pays, accounting for trimmed HTLCs.
///
/// An HTLC which cannot pay for its own second-stage transaction fee plus the dust limit does not
/// get an output; its value is added to the fee instead and it contributes no weight.
pub fn commit_tx_fee_sat(feerate_per_kw: u32, broadcaster_dust_limit_sat: u64, spec: &CommitmentSpec) -> u64 {
	let mut nondust_htlcs = 0u64;
	for htlc in spec.htlcs.iter() {
		let second_stage_fee = match htlc.direction {
			HtlcDirection::Outgoing => htlc_timeout_tx_fee_sat(feerate_per_kw),
			HtlcDirection::Incoming => htlc_success_tx_fee_sat(feerate_per_kw),
		};
		if htlc.add.amount_msat / 1000 >= broadcaster_dust_limit_sat + second_stage_fee {
			nondust_htlcs += 1;
		}
	}
	let weight = COMMITMENT_TX_BASE_WEIGHT + nondust_htlcs * COMMITMENT_TX_WEIGHT_PER_HTLC;
	feerate_per_kw as u64 * weight / 1000
}

/// The per-commitment secret for the commitment with the given number.
///
/// Secrets form a hash tree rooted at the seed: walking from the high bit down, every *zero* bit
/// of the commitment number costs one flip-and-hash step. Commitment 0 is therefore the deepest
/// leaf, and later commitments sit closer to the root, which is what lets a revealed secret
/// rederive all the earlier ones below it.
pub fn per_commitment_secret(commitment_seed: &[u8; 32], commitment_number: u64) -> [u8; 32] {
	debug_assert!(commitment_number <= HIGHEST_COMMITMENT_NUMBER);
	let mut res: [u8; 32] = commitment_seed.clone();
	for bitpos in (0..48usize).rev() {
		if commitment_number & (1 << bitpos) == 0 {
			res[bitpos / 8] ^= 1 << (bitpos & 7);
			res = Sha256::hash(&res).to_byte_array();
		}
	}
	res
}

/// The per-commitment point for the commitment with the given (increasing) number.
pub fn per_commitment_point<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, commitment_seed: &[u8; 32], commitment_number: u64) -> PublicKey {
	let secret = SecretKey::from_slice(&per_commitment_secret(commitment_seed, commitment_number))
		.expect("Hashes should always be valid keys unless SHA-256 is broken");
	PublicKey::from_secret_key(secp_ctx, &secret)
}

/// Compact storage for the per-commitment secrets the counterparty reveals, per the
/// [BOLT 3](https://github.com/lightning/bolts/blob/master/03-transactions.md#efficient-per-commitment-secret-storage)
/// scheme.
///
/// A secret whose commitment number ends in a run of one bits sits above every earlier secret
/// sharing its high bits in the derivation tree of [`per_commitment_secret`] and can rederive
/// them all, so 49 slots (one per possible run length) cover the whole 48-bit commitment-number
/// space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterpartyCommitmentSecrets {
	// One (secret, commitment_number) pair per trailing-ones run length; empty slots hold
	// NO_COMMITMENT.
	known_secrets: [([u8; 32], u64); 49],
}

/// Commitment numbers are 48 bits, so this can never name a real commitment.
const NO_COMMITMENT: u64 = u64::MAX;

impl CounterpartyCommitmentSecrets {
	/// Creates a new empty `CounterpartyCommitmentSecrets` structure.
	pub fn new() -> Self {
		Self { known_secrets: [([0; 32], NO_COMMITMENT); 49] }
	}

	/// The storage slot for a secret: how many trailing one bits its commitment number has,
	/// which is also how many earlier secrets it can rederive per high-bit prefix.
	#[inline]
	fn slot(commitment_number: u64) -> usize {
		commitment_number.trailing_ones().min(48) as usize
	}

	/// Walks down the derivation tree from a stored secret to the secret of an earlier
	/// commitment agreeing with it above the low `bits` bits: one flip-and-hash per zero bit of
	/// the target number, high bit first, exactly as [`per_commitment_secret`] does from the
	/// seed.
	#[inline]
	fn derive_secret(secret: [u8; 32], bits: usize, commitment_number: u64) -> [u8; 32] {
		let mut res: [u8; 32] = secret;
		for bitpos in (0..bits).rev() {
			if commitment_number & (1 << bitpos) == 0 {
				res[bitpos / 8] ^= 1 << (bitpos & 7);
				res = Sha256::hash(&res).to_byte_array();
			}
		}
		res
	}

	/// The highest commitment number whose secret has been revealed, or `None` for a fresh
	/// store. Every commitment up to and including it is coverable by [`Self::get_secret`].
	pub fn max_seen_commitment(&self) -> Option<u64> {
		self.known_secrets.iter()
			.filter(|(_, number)| *number != NO_COMMITMENT)
			.map(|(_, number)| *number)
			.max()
	}

	/// Stores the secret revealed for `commitment_number`. Returns `Err` if it is inconsistent
	/// with the secrets revealed before it, meaning the peer broke away from the chain it
	/// committed to.
	pub fn provide_secret(&mut self, commitment_number: u64, secret: [u8; 32]) -> Result<(), ()> {
		let slot = Self::slot(commitment_number);
		// The new secret supersedes everything in the lower slots; it must rederive each of
		// them exactly.
		for i in 0..slot {
			let (old_secret, old_number) = self.known_secrets[i];
			if Self::derive_secret(secret, slot, old_number) != old_secret {
				return Err(());
			}
		}
		if self.max_seen_commitment().map_or(false, |max| max >= commitment_number) {
			return Ok(());
		}
		self.known_secrets[slot] = (secret, commitment_number);
		Ok(())
	}

	/// Returns the secret for `commitment_number`, rederiving it from a stored later secret.
	/// Returns `None` if that commitment has not been revoked yet.
	pub fn get_secret(&self, commitment_number: u64) -> Option<[u8; 32]> {
		for i in 0..self.known_secrets.len() {
			let (secret, known_number) = self.known_secrets[i];
			if known_number != NO_COMMITMENT && known_number >> i == commitment_number >> i {
				return Some(Self::derive_secret(secret, i, commitment_number));
			}
		}
		debug_assert!(self.max_seen_commitment().map_or(true, |max| commitment_number > max));
		None
	}
}

/// One party's public keys which do not change over the life of a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelPublicKeys {
	/// The public key which is used to sign all commitment transactions, as it appears in the
	/// on-chain channel lock-in 2-of-2 multisig output.
	pub funding_pubkey: PublicKey,
	/// The base point which is used (with [`RevocationKey::from_basepoint`]) to derive
	/// per-commitment revocation keys. This is combined with the per-commitment secret generated
	/// by the counterparty to create a secret which the counterparty can reveal to revoke
	/// previous states.
	pub revocation_basepoint: RevocationBasepoint,
	/// The base point which is used to derive the per-commitment payment key which receives this
	/// party's immediately-spendable balance on the *counterparty's* commitment transactions.
	pub payment_basepoint: PaymentBasepoint,
	/// The base point which is used to derive a per-commitment payment key which receives funds
	/// which are only available for spending after some delay (or via the revocation path).
	pub delayed_payment_basepoint: DelayedPaymentBasepoint,
	/// The base point which is used to derive a per-commitment public key which encumbers
	/// HTLC-in-flight outputs.
	pub htlc_basepoint: HtlcBasepoint,
}

/// The set of public keys which are used in the creation of one commitment transaction.
/// These are derived from the channel base keys and per-commitment data.
///
/// A broadcaster key is provided from the potential broadcaster of the computed transaction.
/// A countersignatory key is coming from a protocol participant unable to broadcast the
/// transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxCreationKeys {
	/// The broadcaster's per-commitment public key which was used to derive the other keys.
	pub per_commitment_point: PublicKey,
	/// The revocation key which is used to allow the broadcaster of the commitment
	/// transaction to provide their counterparty the ability to punish them if they broadcast
	/// an old state.
	pub revocation_key: RevocationKey,
	/// Broadcaster's HTLC Key
	pub broadcaster_htlc_key: HtlcKey,
	/// Countersignatory's HTLC Key
	pub countersignatory_htlc_key: HtlcKey,
	/// Broadcaster's Payment Key (which isn't allowed to be spent from for some delay)
	pub broadcaster_delayed_payment_key: DelayedPaymentKey,
	/// Countersignatory's Payment Key, receiving the `to_remote` balance via plain P2WPKH
	pub countersignatory_payment_key: PaymentKey,
}

impl TxCreationKeys {
	/// Create per-commitment keys from channel base points and the per-commitment point
	pub fn derive_new<T: secp256k1::Signing + secp256k1::Verification>(
		secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey,
		broadcaster_keys: &ChannelPublicKeys, countersignatory_keys: &ChannelPublicKeys,
	) -> TxCreationKeys {
		TxCreationKeys {
			per_commitment_point: per_commitment_point.clone(),
			revocation_key: RevocationKey::from_basepoint(&secp_ctx, &countersignatory_keys.revocation_basepoint, &per_commitment_point),
			broadcaster_htlc_key: HtlcKey::from_basepoint(&secp_ctx, &broadcaster_keys.htlc_basepoint, &per_commitment_point),
			countersignatory_htlc_key: HtlcKey::from_basepoint(&secp_ctx, &countersignatory_keys.htlc_basepoint, &per_commitment_point),
			broadcaster_delayed_payment_key: DelayedPaymentKey::from_basepoint(&secp_ctx, &broadcaster_keys.delayed_payment_basepoint, &per_commitment_point),
			countersignatory_payment_key: PaymentKey::from_basepoint(&secp_ctx, &countersignatory_keys.payment_basepoint, &per_commitment_point),
		}
	}
}

/// The funding output being spent by every commitment transaction of the channel: its outpoint,
/// its value and the 2-of-2 multisig script encumbering it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FundingCoin {
	/// The outpoint of the funding output.
	pub outpoint: OutPoint,
	/// The channel value.
	pub value: Amount,
	/// The 2-of-2 multisig redeemscript, as produced by [`make_funding_redeemscript`].
	pub redeem_script: ScriptBuf,
}

/// A script either spendable by the revocation key or the broadcaster_delayed_payment_key after
/// the relative-locktime OP_CSV constraint is satisfied. Encumbers the `to_local` output on a
/// commitment transaction and the output of second-stage HTLC transactions.
pub fn get_revokeable_redeemscript(revocation_key: &RevocationKey, contest_delay: u16, broadcaster_delayed_payment_key: &DelayedPaymentKey) -> ScriptBuf {
	Builder::new().push_opcode(opcodes::all::OP_IF)
	              .push_slice(&revocation_key.to_public_key().serialize())
	              .push_opcode(opcodes::all::OP_ELSE)
	              .push_int(contest_delay as i64)
	              .push_opcode(opcodes::all::OP_CSV)
	              .push_opcode(opcodes::all::OP_DROP)
	              .push_slice(&broadcaster_delayed_payment_key.to_public_key().serialize())
	              .push_opcode(opcodes::all::OP_ENDIF)
	              .push_opcode(opcodes::all::OP_CHECKSIG)
	              .into_script()
}

/// The P2WPKH script paying the countersignatory's immediately-spendable balance.
pub fn get_to_remote_script(countersignatory_payment_key: &PaymentKey) -> ScriptBuf {
	ScriptBuf::new_p2wpkh(&WPubkeyHash::hash(&countersignatory_payment_key.to_public_key().serialize()))
}

/// Gets the redeemscript for a funding output from the two funding public keys.
/// Note that the order of funding public keys does not matter.
pub fn make_funding_redeemscript(broadcaster: &PublicKey, countersignatory: &PublicKey) -> ScriptBuf {
	let broadcaster_funding_key = broadcaster.serialize();
	let countersignatory_funding_key = countersignatory.serialize();

	let builder = Builder::new().push_opcode(opcodes::all::OP_PUSHNUM_2);
	if broadcaster_funding_key[..] < countersignatory_funding_key[..] {
		builder.push_slice(&broadcaster_funding_key)
			.push_slice(&countersignatory_funding_key)
	} else {
		builder.push_slice(&countersignatory_funding_key)
			.push_slice(&broadcaster_funding_key)
	}.push_opcode(opcodes::all::OP_PUSHNUM_2).push_opcode(opcodes::all::OP_CHECKMULTISIG).into_script()
}

/// Information about an HTLC as it appears in a commitment transaction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HTLCOutputInCommitment {
	/// Whether the HTLC was "offered" (ie outbound in relation to this commitment transaction).
	/// Note that this is not the same as whether it is outbound *from us*. To determine that you
	/// need to compare this value to whether the commitment transaction in question is that of
	/// the counterparty or our own.
	pub offered: bool,
	/// The value, in msat, of the HTLC. The value as it appears in the commitment transaction is
	/// this divided by 1000.
	pub amount_msat: u64,
	/// The CLTV lock-time at which this HTLC expires.
	pub cltv_expiry: u32,
	/// The hash of the preimage which unlocks this HTLC.
	pub payment_hash: PaymentHash,
	/// The position within the commitment transactions' outputs. This may be None if the value is
	/// below the dust limit (in which case no output appears in the commitment transaction and the
	/// value is spent to additional transaction fees).
	pub transaction_output_index: Option<u32>,
}

#[inline]
pub(crate) fn get_htlc_redeemscript_with_explicit_keys(htlc: &HTLCOutputInCommitment, broadcaster_htlc_key: &HtlcKey, countersignatory_htlc_key: &HtlcKey, revocation_key: &RevocationKey) -> ScriptBuf {
	let payment_hash160 = Ripemd160::hash(&htlc.payment_hash.0[..]).to_byte_array();
	if htlc.offered {
		Builder::new().push_opcode(opcodes::all::OP_DUP)
		              .push_opcode(opcodes::all::OP_HASH160)
		              .push_slice(&PubkeyHash::hash(&revocation_key.to_public_key().serialize()).to_byte_array())
		              .push_opcode(opcodes::all::OP_EQUAL)
		              .push_opcode(opcodes::all::OP_IF)
		              .push_opcode(opcodes::all::OP_CHECKSIG)
		              .push_opcode(opcodes::all::OP_ELSE)
		              .push_slice(&countersignatory_htlc_key.to_public_key().serialize())
		              .push_opcode(opcodes::all::OP_SWAP)
		              .push_opcode(opcodes::all::OP_SIZE)
		              .push_int(32)
		              .push_opcode(opcodes::all::OP_EQUAL)
		              .push_opcode(opcodes::all::OP_NOTIF)
		              .push_opcode(opcodes::all::OP_DROP)
		              .push_int(2)
		              .push_opcode(opcodes::all::OP_SWAP)
		              .push_slice(&broadcaster_htlc_key.to_public_key().serialize())
		              .push_int(2)
		              .push_opcode(opcodes::all::OP_CHECKMULTISIG)
		              .push_opcode(opcodes::all::OP_ELSE)
		              .push_opcode(opcodes::all::OP_HASH160)
		              .push_slice(&payment_hash160)
		              .push_opcode(opcodes::all::OP_EQUALVERIFY)
		              .push_opcode(opcodes::all::OP_CHECKSIG)
		              .push_opcode(opcodes::all::OP_ENDIF)
		              .push_opcode(opcodes::all::OP_ENDIF)
		              .into_script()
	} else {
		Builder::new().push_opcode(opcodes::all::OP_DUP)
		              .push_opcode(opcodes::all::OP_HASH160)
		              .push_slice(&PubkeyHash::hash(&revocation_key.to_public_key().serialize()).to_byte_array())
		              .push_opcode(opcodes::all::OP_EQUAL)
		              .push_opcode(opcodes::all::OP_IF)
		              .push_opcode(opcodes::all::OP_CHECKSIG)
		              .push_opcode(opcodes::all::OP_ELSE)
		              .push_slice(&countersignatory_htlc_key.to_public_key().serialize())
		              .push_opcode(opcodes::all::OP_SWAP)
		              .push_opcode(opcodes::all::OP_SIZE)
		              .push_int(32)
		              .push_opcode(opcodes::all::OP_EQUAL)
		              .push_opcode(opcodes::all::OP_IF)
		              .push_opcode(opcodes::all::OP_HASH160)
		              .push_slice(&payment_hash160)
		              .push_opcode(opcodes::all::OP_EQUALVERIFY)
		              .push_int(2)
		              .push_opcode(opcodes::all::OP_SWAP)
		              .push_slice(&broadcaster_htlc_key.to_public_key().serialize())
		              .push_int(2)
		              .push_opcode(opcodes::all::OP_CHECKMULTISIG)
		              .push_opcode(opcodes::all::OP_ELSE)
		              .push_opcode(opcodes::all::OP_DROP)
		              .push_int(htlc.cltv_expiry as i64)
		              .push_opcode(opcodes::all::OP_CLTV)
		              .push_opcode(opcodes::all::OP_DROP)
		              .push_opcode(opcodes::all::OP_CHECKSIG)
		              .push_opcode(opcodes::all::OP_ENDIF)
		              .push_opcode(opcodes::all::OP_ENDIF)
		              .into_script()
	}
}

/// Gets the witness redeemscript for an HTLC output in a commitment transaction. Note that htlc
/// does not need to have its transaction_output_index filled.
#[inline]
pub fn get_htlc_redeemscript(htlc: &HTLCOutputInCommitment, keys: &TxCreationKeys) -> ScriptBuf {
	get_htlc_redeemscript_with_explicit_keys(htlc, &keys.broadcaster_htlc_key, &keys.countersignatory_htlc_key, &keys.revocation_key)
}

/// The 48-bit commitment number of a commitment transaction, XOR'd with the channel's
/// pubkey-derived obscure factor and ready to be split across the transaction's locktime and
/// sequence fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObscuredCommitmentNumber(pub u64);

impl ObscuredCommitmentNumber {
	/// Obscures `commitment_number` with the given factor.
	pub fn obscure(commitment_number: u64, obscure_factor: u64) -> ObscuredCommitmentNumber {
		ObscuredCommitmentNumber((commitment_number ^ obscure_factor) & HIGHEST_COMMITMENT_NUMBER)
	}

	/// Recovers the commitment number this value obscures.
	pub fn unobscure(&self, obscure_factor: u64) -> u64 {
		(self.0 ^ obscure_factor) & HIGHEST_COMMITMENT_NUMBER
	}

	/// Splits the 48-bit value into the commitment transaction's locktime (low 24 bits, tagged
	/// `0x20`) and its input sequence (high 24 bits, tagged `0x80`).
	pub fn to_locktime_and_sequence(&self) -> (LockTime, Sequence) {
		let locktime = ((0x20 as u32) << 8 * 3) | ((self.0 & 0xffffff) as u32);
		let sequence = ((0x80 as u32) << 8 * 3) | (((self.0 >> 3 * 8) & 0xffffff) as u32);
		(LockTime::from_consensus(locktime), Sequence(sequence))
	}

	/// Reassembles the 48-bit value from a commitment transaction's locktime and input sequence.
	/// Returns `None` if either top byte does not carry the commitment tag.
	pub fn from_locktime_and_sequence(locktime: LockTime, sequence: Sequence) -> Option<ObscuredCommitmentNumber> {
		let locktime = locktime.to_consensus_u32();
		if locktime >> 8 * 3 != 0x20 || sequence.0 >> 8 * 3 != 0x80 {
			return None;
		}
		Some(ObscuredCommitmentNumber((((sequence.0 & 0xffffff) as u64) << 3 * 8) | ((locktime & 0xffffff) as u64)))
	}
}

/// The factor by which the channel's commitment numbers are obscured on-chain, committed to by
/// both parties' payment basepoints. The funder's basepoint is hashed first.
pub fn get_commitment_transaction_number_obscure_factor(funder_payment_basepoint: &PaymentBasepoint, fundee_payment_basepoint: &PaymentBasepoint) -> u64 {
	let mut sha = Sha256::engine();
	sha.input(&funder_payment_basepoint.to_public_key().serialize());
	sha.input(&fundee_payment_basepoint.to_public_key().serialize());
	let res = Sha256::from_engine(sha).to_byte_array();

	((res[26] as u64) << 5 * 8)
		| ((res[27] as u64) << 4 * 8)
		| ((res[28] as u64) << 3 * 8)
		| ((res[29] as u64) << 2 * 8)
		| ((res[30] as u64) << 1 * 8)
		| ((res[31] as u64) << 0 * 8)
}

/// Constructs the commitment transaction for the given spec, as seen (and broadcastable) by the
/// side owning the spec.
///
/// Returns the unsigned transaction and the full HTLC set with
/// [`HTLCOutputInCommitment::transaction_output_index`] assigned for every HTLC which made it
/// into an output. Outputs are in the canonical (BIP 69 plus CLTV tie-break) order the
/// counterparty will expect signatures in.
pub fn build_commitment_transaction(
	funding: &FundingCoin, keys: &TxCreationKeys, commitment_number: u64, obscure_factor: u64,
	broadcaster_is_funder: bool, broadcaster_dust_limit_sat: u64, contest_delay: u16,
	spec: &CommitmentSpec,
) -> Result<(Transaction, Vec<HTLCOutputInCommitment>), ChannelError> {
	let obscured = ObscuredCommitmentNumber::obscure(commitment_number, obscure_factor);
	let (lock_time, sequence) = obscured.to_locktime_and_sequence();

	let fee_sat = commit_tx_fee_sat(spec.feerate_per_kw, broadcaster_dust_limit_sat, spec);
	let (to_local_sat, to_remote_sat) = if broadcaster_is_funder {
		let to_local = (spec.to_local_msat / 1000).checked_sub(fee_sat)
			.ok_or_else(|| ChannelError::TransactionError(format!("Funder balance {} msat cannot pay the commit tx fee of {} sat", spec.to_local_msat, fee_sat)))?;
		(to_local, spec.to_remote_msat / 1000)
	} else {
		let to_remote = (spec.to_remote_msat / 1000).checked_sub(fee_sat)
			.ok_or_else(|| ChannelError::TransactionError(format!("Funder balance {} msat cannot pay the commit tx fee of {} sat", spec.to_remote_msat, fee_sat)))?;
		(spec.to_local_msat / 1000, to_remote)
	};

	let mut htlcs_in_tx: Vec<HTLCOutputInCommitment> = Vec::with_capacity(spec.htlcs.len());
	let mut txouts: Vec<(TxOut, Option<usize>)> = Vec::with_capacity(spec.htlcs.len() + 2);

	for directed in spec.htlcs.iter() {
		let offered = directed.direction == HtlcDirection::Outgoing;
		let second_stage_fee = if offered {
			htlc_timeout_tx_fee_sat(spec.feerate_per_kw)
		} else {
			htlc_success_tx_fee_sat(spec.feerate_per_kw)
		};
		let htlc = HTLCOutputInCommitment {
			offered,
			amount_msat: directed.add.amount_msat,
			cltv_expiry: directed.add.cltv_expiry,
			payment_hash: directed.add.payment_hash,
			transaction_output_index: None,
		};
		if htlc.amount_msat / 1000 >= broadcaster_dust_limit_sat + second_stage_fee {
			txouts.push((TxOut {
				script_pubkey: get_htlc_redeemscript(&htlc, keys).to_p2wsh(),
				value: Amount::from_sat(htlc.amount_msat / 1000),
			}, Some(htlcs_in_tx.len())));
		}
		htlcs_in_tx.push(htlc);
	}

	if to_local_sat >= broadcaster_dust_limit_sat {
		txouts.push((TxOut {
			script_pubkey: get_revokeable_redeemscript(&keys.revocation_key, contest_delay, &keys.broadcaster_delayed_payment_key).to_p2wsh(),
			value: Amount::from_sat(to_local_sat),
		}, None));
	}
	if to_remote_sat >= broadcaster_dust_limit_sat {
		txouts.push((TxOut {
			script_pubkey: get_to_remote_script(&keys.countersignatory_payment_key),
			value: Amount::from_sat(to_remote_sat),
		}, None));
	}

	// Two HTLC outputs to the same hash for the same amount are on-chain identical; the CLTV
	// expiry keeps the signature order deterministic on both sides.
	let cltv_of = |tag: &Option<usize>| tag.map(|idx| htlcs_in_tx[idx].cltv_expiry).unwrap_or(0);
	transaction_utils::sort_outputs(&mut txouts, |a, b| cltv_of(a).cmp(&cltv_of(b)));

	let mut outputs = Vec::with_capacity(txouts.len());
	for (vout, (txout, tag)) in txouts.drain(..).enumerate() {
		if let Some(idx) = tag {
			htlcs_in_tx[idx].transaction_output_index = Some(vout as u32);
		}
		outputs.push(txout);
	}

	let tx = Transaction {
		version: COMMITMENT_TX_VERSION,
		lock_time,
		input: vec![TxIn {
			previous_output: funding.outpoint,
			script_sig: ScriptBuf::new(),
			sequence,
			witness: Witness::new(),
		}],
		output: outputs,
	};
	Ok((tx, htlcs_in_tx))
}

/// Builds the second-stage transaction spending the given HTLC output of a commitment
/// transaction: an HTLC-timeout for offered HTLCs, an HTLC-success for received ones.
///
/// Panics if `htlc.transaction_output_index` is `None`.
pub fn build_htlc_transaction(prev_hash: &Txid, feerate_per_kw: u32, contest_delay: u16, htlc: &HTLCOutputInCommitment, broadcaster_delayed_payment_key: &DelayedPaymentKey, revocation_key: &RevocationKey) -> Transaction {
	let txins = vec![TxIn {
		previous_output: OutPoint {
			txid: prev_hash.clone(),
			vout: htlc.transaction_output_index.expect("Can't build an HTLC transaction for a dust output"),
		},
		script_sig: ScriptBuf::new(),
		sequence: Sequence::ZERO,
		witness: Witness::new(),
	}];

	let total_fee = if htlc.offered {
		htlc_timeout_tx_fee_sat(feerate_per_kw)
	} else {
		htlc_success_tx_fee_sat(feerate_per_kw)
	};

	let txouts = vec![TxOut {
		script_pubkey: get_revokeable_redeemscript(revocation_key, contest_delay, broadcaster_delayed_payment_key).to_p2wsh(),
		value: Amount::from_sat(htlc.amount_msat / 1000 - total_fee),
	}];

	Transaction {
		version: COMMITMENT_TX_VERSION,
		lock_time: if htlc.offered { LockTime::from_consensus(htlc.cltv_expiry) } else { LockTime::ZERO },
		input: txins,
		output: txouts,
	}
}

/// A second-stage HTLC-timeout transaction, reclaiming an offered HTLC after its CLTV expires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HtlcTimeoutTx {
	/// The unsigned transaction.
	pub tx: Transaction,
	/// The index, within `tx.input`, of the input spending the commitment HTLC output.
	pub which_input: u32,
	/// The witness script of the commitment output being spent, signed over by both parties.
	pub redeem_script: ScriptBuf,
	/// The value of the commitment output being spent.
	pub amount: Amount,
	/// The HTLC this transaction resolves.
	pub htlc: HTLCOutputInCommitment,
}

/// A second-stage HTLC-success transaction, claiming a received HTLC with its preimage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HtlcSuccessTx {
	/// The unsigned transaction.
	pub tx: Transaction,
	/// The index, within `tx.input`, of the input spending the commitment HTLC output.
	pub which_input: u32,
	/// The witness script of the commitment output being spent, signed over by both parties.
	pub redeem_script: ScriptBuf,
	/// The value of the commitment output being spent.
	pub amount: Amount,
	/// The HTLC this transaction resolves.
	pub htlc: HTLCOutputInCommitment,
}

/// Either kind of second-stage HTLC transaction. The two variants share their signing and sorting
/// paths but differ in how they are completed: a timeout tx needs nothing beyond the two
/// signatures, a success tx additionally needs the payment preimage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HtlcTx {
	/// An HTLC-timeout transaction.
	Timeout(HtlcTimeoutTx),
	/// An HTLC-success transaction.
	Success(HtlcSuccessTx),
}

impl HtlcTx {
	/// The unsigned transaction.
	pub fn tx(&self) -> &Transaction {
		match self {
			HtlcTx::Timeout(t) => &t.tx,
			HtlcTx::Success(s) => &s.tx,
		}
	}

	/// The index of the input spending the commitment HTLC output.
	pub fn which_input(&self) -> u32 {
		match self {
			HtlcTx::Timeout(t) => t.which_input,
			HtlcTx::Success(s) => s.which_input,
		}
	}

	/// The witness script of the commitment output being spent.
	pub fn redeem_script(&self) -> &ScriptBuf {
		match self {
			HtlcTx::Timeout(t) => &t.redeem_script,
			HtlcTx::Success(s) => &s.redeem_script,
		}
	}

	/// The value of the commitment output being spent.
	pub fn amount(&self) -> Amount {
		match self {
			HtlcTx::Timeout(t) => t.amount,
			HtlcTx::Success(s) => s.amount,
		}
	}

	/// The index of the commitment transaction output this transaction spends.
	pub fn commitment_output_index(&self) -> u32 {
		self.tx().input[self.which_input() as usize].previous_output.vout
	}
}

/// Builds the second-stage transactions for every HTLC of the given commitment transaction which
/// made it into an output.
pub fn build_htlc_transactions(commitment_txid: &Txid, feerate_per_kw: u32, contest_delay: u16, htlcs: &[HTLCOutputInCommitment], keys: &TxCreationKeys) -> (Vec<HtlcTimeoutTx>, Vec<HtlcSuccessTx>) {
	let mut timeout_txs = Vec::new();
	let mut success_txs = Vec::new();
	for htlc in htlcs.iter() {
		if htlc.transaction_output_index.is_none() {
			continue;
		}
		let tx = build_htlc_transaction(commitment_txid, feerate_per_kw, contest_delay, htlc, &keys.broadcaster_delayed_payment_key, &keys.revocation_key);
		let redeem_script = get_htlc_redeemscript(htlc, keys);
		let amount = Amount::from_sat(htlc.amount_msat / 1000);
		if htlc.offered {
			timeout_txs.push(HtlcTimeoutTx { tx, which_input: 0, redeem_script, amount, htlc: htlc.clone() });
		} else {
			success_txs.push(HtlcSuccessTx { tx, which_input: 0, redeem_script, amount, htlc: htlc.clone() });
		}
	}
	(timeout_txs, success_txs)
}

/// Merges the two kinds of HTLC transactions into the canonical signing order: ascending by the
/// commitment output each one spends. This is the order the peer expects `htlc_signatures` in.
pub fn sort_both_htlcs(timeout_txs: Vec<HtlcTimeoutTx>, success_txs: Vec<HtlcSuccessTx>) -> Vec<HtlcTx> {
	let mut all: Vec<HtlcTx> = timeout_txs.into_iter().map(HtlcTx::Timeout)
		.chain(success_txs.into_iter().map(HtlcTx::Success))
		.collect();
	// Two HTLC txs can never spend the same commitment output, so the key is unique.
	all.sort_unstable_by_key(|htlc_tx| htlc_tx.commitment_output_index());
	all
}

fn funding_sighash(tx: &Transaction, funding: &FundingCoin) -> Message {
	let sighash = SighashCache::new(tx)
		.p2wsh_signature_hash(0, &funding.redeem_script, funding.value, EcdsaSighashType::All)
		.unwrap();
	Message::from_digest(sighash.to_byte_array())
}

/// Signs the commitment transaction's funding input with the given funding key.
pub fn sign_commitment_transaction<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, tx: &Transaction, funding: &FundingCoin, funding_key: &SecretKey) -> Signature {
	secp_ctx.sign_ecdsa(&funding_sighash(tx, funding), funding_key)
}

/// Checks that `sig` by `funding_pubkey` completes the 2-of-2 on the commitment transaction's
/// funding input.
pub fn verify_commitment_signature<T: secp256k1::Verification>(secp_ctx: &Secp256k1<T>, tx: &Transaction, funding: &FundingCoin, sig: &Signature, funding_pubkey: &PublicKey) -> Result<(), secp256k1::Error> {
	secp_ctx.verify_ecdsa(&funding_sighash(tx, funding), sig, funding_pubkey)
}

fn htlc_tx_sighash(htlc_tx: &HtlcTx) -> Message {
	let sighash = SighashCache::new(htlc_tx.tx())
		.p2wsh_signature_hash(htlc_tx.which_input() as usize, htlc_tx.redeem_script(), htlc_tx.amount(), EcdsaSighashType::All)
		.unwrap();
	Message::from_digest(sighash.to_byte_array())
}

/// Signs a second-stage HTLC transaction with the given per-commitment HTLC key.
pub fn sign_htlc_transaction<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, htlc_tx: &HtlcTx, htlc_key: &SecretKey) -> Signature {
	secp_ctx.sign_ecdsa(&htlc_tx_sighash(htlc_tx), htlc_key)
}

/// Checks a counterparty's signature on a second-stage HTLC transaction.
pub fn verify_htlc_signature<T: secp256k1::Verification>(secp_ctx: &Secp256k1<T>, htlc_tx: &HtlcTx, sig: &Signature, htlc_pubkey: &HtlcKey) -> Result<(), secp256k1::Error> {
	secp_ctx.verify_ecdsa(&htlc_tx_sighash(htlc_tx), sig, &htlc_pubkey.to_public_key())
}

/// Assembles the witness completing a commitment transaction's funding input from both parties'
/// signatures. Due to BIP147 (NULLDUMMY) the leading CHECKMULTISIG element is empty; signatures
/// go in the order of the funding pubkeys in the redeemscript.
pub fn funding_input_witness(funding_redeemscript: &ScriptBuf, holder: (&PublicKey, &Signature), counterparty: (&PublicKey, &Signature)) -> Witness {
	let mut witness = Witness::new();
	witness.push(Vec::new());
	let holder_sig_first = holder.0.serialize()[..] < counterparty.0.serialize()[..];
	let (first, second) = if holder_sig_first { (holder.1, counterparty.1) } else { (counterparty.1, holder.1) };
	for sig in [first, second] {
		let mut sig_ser = sig.serialize_der().to_vec();
		sig_ser.push(EcdsaSighashType::All as u8);
		witness.push(sig_ser);
	}
	witness.push(funding_redeemscript.as_bytes().to_vec());
	witness
}
