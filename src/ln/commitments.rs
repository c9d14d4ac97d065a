// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The bilateral state of a payment channel and the engine advancing it.
//!
//! [`Commitments`] is a pure value: every protocol operation borrows the current state and
//! returns a replacement together with the message to send and/or the events the transition
//! produced. Nothing is mutated in place, so the caller can keep the old state around for
//! diagnostics, persist the new one atomically, and retry on failure without cleanup. Callers
//! are responsible for serializing operations per channel; distinct channels share nothing.

use bitcoin::hash_types::Txid;
use bitcoin::secp256k1;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::Transaction;

use crate::ln::chan_utils::{
	self, build_htlc_transactions, sort_both_htlcs, ChannelPublicKeys,
	CounterpartyCommitmentSecrets, FundingCoin, HTLCOutputInCommitment, HtlcTx, TxCreationKeys,
};
use crate::ln::channel_keys::derive_private_key;
use crate::ln::commitment_spec::{CommitmentSpec, HtlcDirection};
use crate::ln::msgs;
use crate::ln::msgs::{OnionPacket, UpdateMessage};
use crate::ln::onion::{CryptoError, HTLCFailReason, SphinxHandler, BADONION};
use crate::ln::types::{ChannelId, PaymentHash, PaymentPreimage};
use crate::sign::InMemoryChannelKeys;
use crate::util::config::ChannelConfig;
use crate::util::logger::Logger;

use core::fmt;
use core::ops::Deref;
use std::collections::{HashMap, HashSet};

/// An error returned by a commitment engine operation. The state the operation was invoked on is
/// untouched; whether an error is fatal to the channel (forcing a unilateral close) is the
/// caller's policy decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelError {
	/// The referenced HTLC is not cross-signed (or does not exist) in the required direction.
	UnknownHtlcId(u64),
	/// The peer skipped or reused an HTLC id; adds must use strictly sequential ids.
	UnexpectedHtlcId {
		/// The id we expected the peer's next HTLC to carry.
		expected: u64,
		/// The id it actually carried.
		actual: u64,
	},
	/// We already have a pending fulfill/fail staged for this HTLC.
	HtlcAlreadySent(u64),
	/// The supplied preimage does not hash to the HTLC's payment hash.
	InvalidPaymentPreimage(PaymentHash),
	/// An `update_fail_malformed_htlc` whose failure code is missing the `BADONION` bit.
	InvalidFailureCode(u16),
	/// We have no recorded origin for the referenced outgoing HTLC.
	UnknownHtlcOrigin(u64),
	/// The HTLC is below the counterparty's advertised minimum.
	HtlcValueTooSmall {
		/// The advertised minimum, in millisatoshi.
		minimum_msat: u64,
	},
	/// Accepting the HTLC would exceed the allowed number of pending HTLCs.
	TooManyAcceptedHtlcs {
		/// The allowed maximum.
		maximum: u16,
	},
	/// Accepting the HTLC would exceed the allowed total HTLC value in flight.
	HtlcValueInFlightTooHigh {
		/// The allowed maximum, in millisatoshi.
		maximum_msat: u64,
	},
	/// The sender cannot afford the staged update once the commitment fee and their reserve are
	/// accounted for.
	InsufficientFunds {
		/// How much is missing, in satoshi.
		missing_sat: u64,
	},
	/// A fee update would dip the funder below the counterparty's channel reserve.
	CannotAffordFee {
		/// The reserve which must remain untouched, in satoshi.
		channel_reserve_sat: u64,
		/// The commitment fee at the new feerate, in satoshi.
		fee_sat: u64,
		/// How much is missing, in satoshi.
		missing_sat: u64,
	},
	/// Only the channel funder may send `update_fee`.
	FundeeCannotSendUpdateFee,
	/// The peer's `update_fee` is too far from our own feerate estimate.
	FeerateTooDifferent {
		/// The peer's proposed feerate, per 1000 weight units.
		remote_feerate_per_kw: u32,
		/// Our current feerate estimate, per 1000 weight units.
		local_feerate_per_kw: u32,
	},
	/// `send_commit` was called with nothing to sign.
	CannotSignWithoutChanges,
	/// `send_commit` was called while the peer still owes us a `revoke_and_ack`.
	CannotSignBeforeRevocation,
	/// The peer sent `commitment_signed` although it has no unacknowledged changes.
	ReceivedCommitmentSignedWhenWeHaveNoPendingChanges,
	/// The peer's signature does not complete the funding 2-of-2 on our next commitment tx.
	InvalidCommitmentSignature,
	/// The peer sent the wrong number of HTLC signatures.
	SignatureCountMismatch {
		/// The number of second-stage transactions needing a signature.
		expected: usize,
		/// The number of signatures received.
		got: usize,
	},
	/// One or more of the peer's HTLC signatures failed verification. All HTLC transactions are
	/// checked before this is returned; the offending commitment output indices are listed.
	InvalidHtlcSignatures {
		/// The commitment tx output indices whose second-stage signature did not verify.
		invalid_outputs: Vec<u32>,
	},
	/// The peer sent `revoke_and_ack` although we are not waiting for one.
	UnexpectedRevocation,
	/// The revealed per-commitment secret does not match the commitment being revoked.
	InvalidRevocation,
	/// The sphinx implementation rejected an onion packet.
	Crypto(CryptoError),
	/// A commitment transaction could not be built for the requested state.
	TransactionError(String),
	/// The library was driven in a way that breaks its documented contract.
	ApiMisuse(&'static str),
}

impl From<CryptoError> for ChannelError {
	fn from(err: CryptoError) -> ChannelError {
		ChannelError::Crypto(err)
	}
}

impl fmt::Display for ChannelError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			ChannelError::UnknownHtlcId(id) => write!(f, "unknown HTLC id {}", id),
			ChannelError::UnexpectedHtlcId { expected, actual } => write!(f, "unexpected HTLC id {} (expected {})", actual, expected),
			ChannelError::HtlcAlreadySent(id) => write!(f, "a settlement of HTLC {} is already pending", id),
			ChannelError::InvalidPaymentPreimage(hash) => write!(f, "preimage does not hash to {}", hash),
			ChannelError::InvalidFailureCode(code) => write!(f, "failure code {:#06x} is missing the BADONION bit", code),
			ChannelError::UnknownHtlcOrigin(id) => write!(f, "no recorded origin for outgoing HTLC {}", id),
			ChannelError::HtlcValueTooSmall { minimum_msat } => write!(f, "HTLC below the counterparty minimum of {} msat", minimum_msat),
			ChannelError::TooManyAcceptedHtlcs { maximum } => write!(f, "cannot have more than {} pending HTLCs", maximum),
			ChannelError::HtlcValueInFlightTooHigh { maximum_msat } => write!(f, "cannot have more than {} msat in flight", maximum_msat),
			ChannelError::InsufficientFunds { missing_sat } => write!(f, "insufficient funds, missing {} sat", missing_sat),
			ChannelError::CannotAffordFee { channel_reserve_sat, fee_sat, missing_sat } =>
				write!(f, "cannot afford a commit tx fee of {} sat over the {} sat reserve, missing {} sat", fee_sat, channel_reserve_sat, missing_sat),
			ChannelError::FundeeCannotSendUpdateFee => write!(f, "only the channel funder may send update_fee"),
			ChannelError::FeerateTooDifferent { remote_feerate_per_kw, local_feerate_per_kw } =>
				write!(f, "peer feerate {} per kw too far from our feerate {} per kw", remote_feerate_per_kw, local_feerate_per_kw),
			ChannelError::CannotSignWithoutChanges => write!(f, "cannot sign a commitment with no pending changes"),
			ChannelError::CannotSignBeforeRevocation => write!(f, "cannot sign until the previous commitment is revoked"),
			ChannelError::ReceivedCommitmentSignedWhenWeHaveNoPendingChanges =>
				write!(f, "got commitment_signed with no pending changes to sign"),
			ChannelError::InvalidCommitmentSignature => write!(f, "invalid commitment tx signature from peer"),
			ChannelError::SignatureCountMismatch { expected, got } =>
				write!(f, "got wrong number of HTLC signatures ({}) from remote, expected {}", got, expected),
			ChannelError::InvalidHtlcSignatures { invalid_outputs } =>
				write!(f, "invalid HTLC tx signatures from peer for commitment outputs {:?}", invalid_outputs),
			ChannelError::UnexpectedRevocation => write!(f, "got revoke_and_ack while not expecting one"),
			ChannelError::InvalidRevocation => write!(f, "revealed per-commitment secret does not match the revoked commitment"),
			ChannelError::Crypto(err) => write!(f, "onion processing failed: {}", err),
			ChannelError::TransactionError(err) => write!(f, "failed to build commitment transaction: {}", err),
			ChannelError::ApiMisuse(err) => write!(f, "API misuse: {}", err),
		}
	}
}

/// Parameters one side committed to at channel open and which hold for the channel's lifetime.
///
/// `to_self_delay` and `channel_reserve_sat` are constraints this side imposes *on the
/// counterparty*: the delay encumbers the counterparty's commitment outputs and the reserve is
/// the balance the counterparty must retain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelParams {
	/// Outputs below this value are omitted from this side's commitment transactions.
	pub dust_limit_sat: u64,
	/// The balance the *counterparty* must retain at all times.
	pub channel_reserve_sat: u64,
	/// The CSV delay imposed on the *counterparty's* delayed outputs.
	pub to_self_delay: u16,
	/// The smallest HTLC this side will accept.
	pub htlc_minimum_msat: u64,
	/// The largest total of pending HTLCs this side will accept.
	pub max_htlc_value_in_flight_msat: u64,
	/// The largest number of pending HTLCs this side will accept.
	pub max_accepted_htlcs: u16,
}

/// The three-stage buffer of channel updates originated by one side.
///
/// Updates transition strictly `proposed -> signed -> acked`: `proposed` holds updates sent but
/// not yet covered by any commitment signature, `signed` those covered by an outstanding
/// `commitment_signed`, and `acked` those whose covering commitment has been revoked-and-acked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Changes {
	/// Updates sent, not yet signed for.
	pub proposed: Vec<UpdateMessage>,
	/// Updates covered by an outstanding `commitment_signed`.
	pub signed: Vec<UpdateMessage>,
	/// Updates irrevocably acknowledged by the other side.
	pub acked: Vec<UpdateMessage>,
}

impl Changes {
	/// An empty set of buffers, for channel-open time.
	pub fn new() -> Changes {
		Changes { proposed: Vec::new(), signed: Vec::new(), acked: Vec::new() }
	}
}

/// Our own current commitment: the spec it enacts plus everything needed to broadcast it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalCommit {
	/// The commitment number.
	pub index: u64,
	/// The spec this commitment transaction enacts, from our perspective.
	pub spec: CommitmentSpec,
	/// The commitment transaction, unsigned. Combine [`Self::counterparty_sig`] with our own
	/// funding signature via [`chan_utils::funding_input_witness`] to make it broadcastable.
	pub tx: Transaction,
	/// The counterparty's signature over [`Self::tx`].
	pub counterparty_sig: Signature,
	/// The second-stage HTLC transactions, in canonical order, each with the counterparty's
	/// signature. HTLC-success transactions additionally need the payment preimage to complete.
	pub htlc_txs_and_sigs: Vec<(HtlcTx, Signature)>,
}

/// The counterparty's current (or next, while unrevoked) commitment, as much of it as we know.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteCommit {
	/// The commitment number.
	pub index: u64,
	/// The spec this commitment enacts, from the *counterparty's* perspective.
	pub spec: CommitmentSpec,
	/// The txid of the counterparty's commitment transaction.
	pub txid: Txid,
	/// The per-commitment point the counterparty used for this commitment.
	pub remote_per_commitment_point: PublicKey,
}

/// Whether we may currently sign a new remote commitment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteNextCommitInfo {
	/// The counterparty has revoked its previous commitment and revealed the per-commitment
	/// point to use for the next one; we are free to sign.
	Revoked(PublicKey),
	/// We have signed a new remote commitment and are waiting for the matching
	/// `revoke_and_ack`; no further `commitment_signed` may be issued until it arrives.
	Waiting(RemoteCommit),
}

/// Where an outgoing HTLC came from, so its settlement can be propagated backwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HtlcOrigin {
	/// We originated the payment.
	Local,
	/// The HTLC forwards an incoming HTLC from another of our channels.
	Relayed {
		/// The channel the incoming HTLC arrived on.
		source_channel_id: ChannelId,
		/// The incoming HTLC's id on that channel.
		source_htlc_id: u64,
	},
}

/// A state transition the caller must react to, produced by the receive-side operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
	/// The peer added an HTLC; once it is cross-signed we must forward or settle it.
	WeAcceptedAddHtlc {
		/// The accepted HTLC.
		htlc: msgs::UpdateAddHTLC,
	},
	/// The peer fulfilled one of our outgoing HTLCs; the preimage must be propagated towards
	/// the HTLC's origin.
	WeAcceptedFulfillHtlc {
		/// The peer's fulfill message, carrying the preimage.
		msg: msgs::UpdateFulfillHTLC,
		/// Where the settled HTLC came from.
		origin: HtlcOrigin,
		/// The HTLC being settled.
		htlc: msgs::UpdateAddHTLC,
	},
	/// The peer failed one of our outgoing HTLCs; the failure must be propagated towards the
	/// HTLC's origin.
	WeAcceptedFailHtlc {
		/// The peer's fail message, carrying the wrapped failure payload.
		msg: msgs::UpdateFailHTLC,
		/// Where the failed HTLC came from.
		origin: HtlcOrigin,
		/// The HTLC being failed.
		htlc: msgs::UpdateAddHTLC,
	},
	/// The peer reported one of our outgoing HTLCs as malformed.
	WeAcceptedFailMalformedHtlc {
		/// The peer's fail message.
		msg: msgs::UpdateFailMalformedHTLC,
		/// Where the failed HTLC came from.
		origin: HtlcOrigin,
		/// The HTLC being failed.
		htlc: msgs::UpdateAddHTLC,
	},
	/// The funder updated the channel feerate.
	WeAcceptedUpdateFee {
		/// The new feerate, per 1000 weight units.
		feerate_per_kw: u32,
	},
	/// We accepted a `commitment_signed` and advanced our local commitment.
	WeAcceptedCommitmentSigned {
		/// The new local commitment number.
		commitment_number: u64,
	},
	/// We accepted a `revoke_and_ack` and the previously-signed remote commitment became
	/// current.
	WeAcceptedRevokeAndAck {
		/// The now-current remote commitment number.
		remote_commitment_number: u64,
	},
}

/// The full bilateral state of one payment channel.
///
/// Constructed by the embedder at channel open (typically from the `open_channel` /
/// `accept_channel` exchange plus the initial commitment signatures), advanced exclusively
/// through the engine operations below, and dropped at close.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commitments {
	/// The channel this state belongs to.
	pub channel_id: ChannelId,
	/// Whether we funded the channel (and hence pay commitment fees and may send `update_fee`).
	pub is_funder: bool,
	/// The constraints we imposed on the counterparty.
	pub local_params: ChannelParams,
	/// The constraints the counterparty imposed on us.
	pub remote_params: ChannelParams,
	/// Our channel-static public keys, as shared with the peer.
	pub local_pubkeys: ChannelPublicKeys,
	/// The peer's channel-static public keys.
	pub remote_pubkeys: ChannelPublicKeys,
	/// The funding output every commitment transaction spends.
	pub funding: FundingCoin,
	/// Our current commitment.
	pub local_commit: LocalCommit,
	/// The peer's current commitment.
	pub remote_commit: RemoteCommit,
	/// Whether we may sign a new remote commitment right now.
	pub remote_next_commit_info: RemoteNextCommitInfo,
	/// Updates we originated, by stage.
	pub local_changes: Changes,
	/// Updates the peer originated, by stage.
	pub remote_changes: Changes,
	/// The id our next outgoing HTLC will carry.
	pub local_next_htlc_id: u64,
	/// The id we expect on the peer's next HTLC.
	pub remote_next_htlc_id: u64,
	/// The origin of each live outgoing HTLC, for settlement propagation.
	pub origin_channels: HashMap<u64, HtlcOrigin>,
	/// Every per-commitment secret the peer has revealed, compactly.
	pub remote_per_commitment_secrets: CounterpartyCommitmentSecrets,
}

impl Commitments {
	/// Whether we have changes which a `commitment_signed` of ours would newly cover.
	pub fn local_has_changes(&self) -> bool {
		!self.remote_changes.acked.is_empty() || !self.local_changes.proposed.is_empty()
	}

	/// Whether the peer has changes which a `commitment_signed` of theirs would newly cover.
	pub fn remote_has_changes(&self) -> bool {
		!self.local_changes.acked.is_empty() || !self.remote_changes.proposed.is_empty()
	}

	/// An HTLC may only be settled once it appears in both parties' current commitments.
	fn get_htlc_cross_signed(&self, direction: HtlcDirection, htlc_id: u64) -> Option<msgs::UpdateAddHTLC> {
		let local = self.local_commit.spec.find_htlc(direction, htlc_id)?;
		self.remote_commit.spec.find_htlc(direction.opposite(), htlc_id)?;
		Some(local.add.clone())
	}

	/// Whether a settlement of `htlc_id` is already sitting in `proposed`.
	fn is_already_sent(htlc_id: u64, proposed: &[UpdateMessage]) -> bool {
		proposed.iter().any(|update| update.settled_htlc_id() == Some(htlc_id))
	}

	fn obscure_factor(&self) -> u64 {
		let (funder, fundee) = if self.is_funder {
			(&self.local_pubkeys.payment_basepoint, &self.remote_pubkeys.payment_basepoint)
		} else {
			(&self.remote_pubkeys.payment_basepoint, &self.local_pubkeys.payment_basepoint)
		};
		chan_utils::get_commitment_transaction_number_obscure_factor(funder, fundee)
	}

	/// Builds our own commitment transaction at `commitment_number` for the given spec.
	pub(crate) fn make_local_txs<T: secp256k1::Signing + secp256k1::Verification>(
		&self, secp_ctx: &Secp256k1<T>, commitment_number: u64, local_per_commitment_point: &PublicKey,
		spec: &CommitmentSpec,
	) -> Result<(Transaction, Vec<HTLCOutputInCommitment>, TxCreationKeys), ChannelError> {
		let keys = TxCreationKeys::derive_new(secp_ctx, local_per_commitment_point, &self.local_pubkeys, &self.remote_pubkeys);
		let (tx, htlcs) = chan_utils::build_commitment_transaction(
			&self.funding, &keys, commitment_number, self.obscure_factor(), self.is_funder,
			self.local_params.dust_limit_sat, self.remote_params.to_self_delay, spec,
		)?;
		Ok((tx, htlcs, keys))
	}

	/// Builds the counterparty's commitment transaction at `commitment_number` for the given
	/// spec (which must be expressed from the counterparty's perspective).
	pub(crate) fn make_remote_txs<T: secp256k1::Signing + secp256k1::Verification>(
		&self, secp_ctx: &Secp256k1<T>, commitment_number: u64, remote_per_commitment_point: &PublicKey,
		spec: &CommitmentSpec,
	) -> Result<(Transaction, Vec<HTLCOutputInCommitment>, TxCreationKeys), ChannelError> {
		let keys = TxCreationKeys::derive_new(secp_ctx, remote_per_commitment_point, &self.remote_pubkeys, &self.local_pubkeys);
		let (tx, htlcs) = chan_utils::build_commitment_transaction(
			&self.funding, &keys, commitment_number, self.obscure_factor(), !self.is_funder,
			self.remote_params.dust_limit_sat, self.local_params.to_self_delay, spec,
		)?;
		Ok((tx, htlcs, keys))
	}

	/// Stages a new outgoing HTLC, checking the counterparty's limits and our own ability to
	/// still pay for the resulting commitment.
	pub fn send_add(&self, amount_msat: u64, payment_hash: PaymentHash, cltv_expiry: u32, onion_routing_packet: OnionPacket, origin: HtlcOrigin) -> Result<(Commitments, msgs::UpdateAddHTLC), ChannelError> {
		if amount_msat < self.remote_params.htlc_minimum_msat {
			return Err(ChannelError::HtlcValueTooSmall { minimum_msat: self.remote_params.htlc_minimum_msat });
		}

		let add = msgs::UpdateAddHTLC {
			channel_id: self.channel_id,
			htlc_id: self.local_next_htlc_id,
			amount_msat,
			payment_hash,
			cltv_expiry,
			onion_routing_packet,
		};
		let mut proposed = self.local_changes.proposed.clone();
		proposed.push(UpdateMessage::AddHTLC(add.clone()));

		// The remote commitment is the one our new HTLC lands on first; check its limits there.
		let reduced = self.remote_commit.spec.reduce(&self.remote_changes.acked, &proposed, !self.is_funder)?;
		self.check_remote_limits(&reduced)?;

		let mut commitments = self.clone();
		commitments.local_changes.proposed = proposed;
		commitments.local_next_htlc_id += 1;
		commitments.origin_channels.insert(add.htlc_id, origin);
		Ok((commitments, add))
	}

	/// In the remote spec, HTLCs we offered flow towards the counterparty and are `Incoming`.
	fn check_remote_limits(&self, reduced: &CommitmentSpec) -> Result<(), ChannelError> {
		let (in_flight_msat, in_flight_count) = reduced.htlcs.iter()
			.filter(|htlc| htlc.direction == HtlcDirection::Incoming)
			.fold((0u64, 0u16), |(amt, count), htlc| (amt + htlc.add.amount_msat, count + 1));
		if in_flight_count > self.remote_params.max_accepted_htlcs {
			return Err(ChannelError::TooManyAcceptedHtlcs { maximum: self.remote_params.max_accepted_htlcs });
		}
		if in_flight_msat > self.remote_params.max_htlc_value_in_flight_msat {
			return Err(ChannelError::HtlcValueInFlightTooHigh { maximum_msat: self.remote_params.max_htlc_value_in_flight_msat });
		}

		// Only the funder pays the commitment fee, but both sides must respect the reserve.
		let fee_sat = if self.is_funder {
			chan_utils::commit_tx_fee_sat(reduced.feerate_per_kw, self.remote_params.dust_limit_sat, reduced)
		} else { 0 };
		let missing = (reduced.to_remote_msat / 1000) as i64
			- self.remote_params.channel_reserve_sat as i64 - fee_sat as i64;
		if missing < 0 {
			return Err(ChannelError::InsufficientFunds { missing_sat: (-missing) as u64 });
		}
		Ok(())
	}

	/// Accepts the peer's `update_add_htlc`, mirroring the checks of [`Self::send_add`] against
	/// our own limits.
	pub fn receive_add(&self, msg: &msgs::UpdateAddHTLC) -> Result<(Commitments, Vec<ChannelEvent>), ChannelError> {
		if msg.htlc_id != self.remote_next_htlc_id {
			return Err(ChannelError::UnexpectedHtlcId { expected: self.remote_next_htlc_id, actual: msg.htlc_id });
		}
		if msg.amount_msat < self.local_params.htlc_minimum_msat {
			return Err(ChannelError::HtlcValueTooSmall { minimum_msat: self.local_params.htlc_minimum_msat });
		}

		let mut proposed = self.remote_changes.proposed.clone();
		proposed.push(UpdateMessage::AddHTLC(msg.clone()));

		let reduced = self.local_commit.spec.reduce(&self.local_changes.acked, &proposed, self.is_funder)?;
		let (in_flight_msat, in_flight_count) = reduced.htlcs.iter()
			.filter(|htlc| htlc.direction == HtlcDirection::Incoming)
			.fold((0u64, 0u16), |(amt, count), htlc| (amt + htlc.add.amount_msat, count + 1));
		if in_flight_count > self.local_params.max_accepted_htlcs {
			return Err(ChannelError::TooManyAcceptedHtlcs { maximum: self.local_params.max_accepted_htlcs });
		}
		if in_flight_msat > self.local_params.max_htlc_value_in_flight_msat {
			return Err(ChannelError::HtlcValueInFlightTooHigh { maximum_msat: self.local_params.max_htlc_value_in_flight_msat });
		}

		let fee_sat = if self.is_funder { 0 } else {
			chan_utils::commit_tx_fee_sat(reduced.feerate_per_kw, self.local_params.dust_limit_sat, &reduced)
		};
		let missing = (reduced.to_remote_msat / 1000) as i64
			- self.local_params.channel_reserve_sat as i64 - fee_sat as i64;
		if missing < 0 {
			return Err(ChannelError::InsufficientFunds { missing_sat: (-missing) as u64 });
		}

		let mut commitments = self.clone();
		commitments.remote_changes.proposed = proposed;
		commitments.remote_next_htlc_id += 1;
		Ok((commitments, vec![ChannelEvent::WeAcceptedAddHtlc { htlc: msg.clone() }]))
	}

	/// Stages a fulfill of an incoming cross-signed HTLC, having checked the preimage.
	pub fn send_fulfill(&self, htlc_id: u64, payment_preimage: PaymentPreimage) -> Result<(Commitments, msgs::UpdateFulfillHTLC), ChannelError> {
		let htlc = self.get_htlc_cross_signed(HtlcDirection::Incoming, htlc_id)
			.ok_or(ChannelError::UnknownHtlcId(htlc_id))?;
		if Self::is_already_sent(htlc_id, &self.local_changes.proposed) {
			return Err(ChannelError::HtlcAlreadySent(htlc_id));
		}
		if payment_preimage.payment_hash() != htlc.payment_hash {
			return Err(ChannelError::InvalidPaymentPreimage(htlc.payment_hash));
		}

		let msg = msgs::UpdateFulfillHTLC {
			channel_id: self.channel_id,
			htlc_id,
			payment_preimage,
		};
		let mut commitments = self.clone();
		commitments.local_changes.proposed.push(UpdateMessage::FulfillHTLC(msg.clone()));
		Ok((commitments, msg))
	}

	/// Accepts the peer's fulfill of one of our outgoing HTLCs.
	pub fn receive_fulfill(&self, msg: &msgs::UpdateFulfillHTLC) -> Result<(Commitments, Vec<ChannelEvent>), ChannelError> {
		let htlc = self.get_htlc_cross_signed(HtlcDirection::Outgoing, msg.htlc_id)
			.ok_or(ChannelError::UnknownHtlcId(msg.htlc_id))?;
		if msg.payment_preimage.payment_hash() != htlc.payment_hash {
			return Err(ChannelError::InvalidPaymentPreimage(htlc.payment_hash));
		}
		let origin = self.origin_channels.get(&msg.htlc_id).cloned()
			.ok_or(ChannelError::UnknownHtlcOrigin(msg.htlc_id))?;

		let mut commitments = self.clone();
		commitments.remote_changes.proposed.push(UpdateMessage::FulfillHTLC(msg.clone()));
		Ok((commitments, vec![ChannelEvent::WeAcceptedFulfillHtlc { msg: msg.clone(), origin, htlc }]))
	}

	/// Stages a failure of an incoming cross-signed HTLC, resolving the onion shared secret so
	/// the failure payload can be wrapped for the return path.
	pub fn send_fail<S: Deref>(&self, htlc_id: u64, reason: HTLCFailReason, node_secret: &SecretKey, sphinx: &S) -> Result<(Commitments, msgs::UpdateFailHTLC), ChannelError>
		where S::Target: SphinxHandler
	{
		let htlc = self.get_htlc_cross_signed(HtlcDirection::Incoming, htlc_id)
			.ok_or(ChannelError::UnknownHtlcId(htlc_id))?;
		if Self::is_already_sent(htlc_id, &self.local_changes.proposed) {
			return Err(ChannelError::HtlcAlreadySent(htlc_id));
		}

		let shared_secret = sphinx.parse_packet(node_secret, &htlc.payment_hash, &htlc.onion_routing_packet)?;
		let packet = match reason {
			HTLCFailReason::ErrorPacket(packet) => sphinx.forward_error_packet(&packet, &shared_secret),
			HTLCFailReason::FailureCode(code) => sphinx.create_error_packet(&shared_secret, code),
		};

		let msg = msgs::UpdateFailHTLC {
			channel_id: self.channel_id,
			htlc_id,
			reason: packet,
		};
		let mut commitments = self.clone();
		commitments.local_changes.proposed.push(UpdateMessage::FailHTLC(msg.clone()));
		Ok((commitments, msg))
	}

	/// Accepts the peer's failure of one of our outgoing HTLCs.
	pub fn receive_fail(&self, msg: &msgs::UpdateFailHTLC) -> Result<(Commitments, Vec<ChannelEvent>), ChannelError> {
		let htlc = self.get_htlc_cross_signed(HtlcDirection::Outgoing, msg.htlc_id)
			.ok_or(ChannelError::UnknownHtlcId(msg.htlc_id))?;
		let origin = self.origin_channels.get(&msg.htlc_id).cloned()
			.ok_or(ChannelError::UnknownHtlcOrigin(msg.htlc_id))?;

		let mut commitments = self.clone();
		commitments.remote_changes.proposed.push(UpdateMessage::FailHTLC(msg.clone()));
		Ok((commitments, vec![ChannelEvent::WeAcceptedFailHtlc { msg: msg.clone(), origin, htlc }]))
	}

	/// Stages an `update_fail_malformed_htlc` for an incoming cross-signed HTLC whose onion we
	/// could not process at all.
	pub fn send_fail_malformed(&self, htlc_id: u64, sha256_of_onion: [u8; 32], failure_code: u16) -> Result<(Commitments, msgs::UpdateFailMalformedHTLC), ChannelError> {
		if failure_code & BADONION == 0 {
			return Err(ChannelError::InvalidFailureCode(failure_code));
		}
		self.get_htlc_cross_signed(HtlcDirection::Incoming, htlc_id)
			.ok_or(ChannelError::UnknownHtlcId(htlc_id))?;
		if Self::is_already_sent(htlc_id, &self.local_changes.proposed) {
			return Err(ChannelError::HtlcAlreadySent(htlc_id));
		}

		let msg = msgs::UpdateFailMalformedHTLC {
			channel_id: self.channel_id,
			htlc_id,
			sha256_of_onion,
			failure_code,
		};
		let mut commitments = self.clone();
		commitments.local_changes.proposed.push(UpdateMessage::FailMalformedHTLC(msg.clone()));
		Ok((commitments, msg))
	}

	/// Accepts the peer's `update_fail_malformed_htlc` for one of our outgoing HTLCs.
	pub fn receive_fail_malformed(&self, msg: &msgs::UpdateFailMalformedHTLC) -> Result<(Commitments, Vec<ChannelEvent>), ChannelError> {
		if msg.failure_code & BADONION == 0 {
			return Err(ChannelError::InvalidFailureCode(msg.failure_code));
		}
		let htlc = self.get_htlc_cross_signed(HtlcDirection::Outgoing, msg.htlc_id)
			.ok_or(ChannelError::UnknownHtlcId(msg.htlc_id))?;
		let origin = self.origin_channels.get(&msg.htlc_id).cloned()
			.ok_or(ChannelError::UnknownHtlcOrigin(msg.htlc_id))?;

		let mut commitments = self.clone();
		commitments.remote_changes.proposed.push(UpdateMessage::FailMalformedHTLC(msg.clone()));
		Ok((commitments, vec![ChannelEvent::WeAcceptedFailMalformedHtlc { msg: msg.clone(), origin, htlc }]))
	}

	/// Stages a feerate update. Only the funder may call this, and only if its balance still
	/// covers the reserve plus the commitment fee at the new rate.
	pub fn send_fee(&self, feerate_per_kw: u32) -> Result<(Commitments, msgs::UpdateFee), ChannelError> {
		if !self.is_funder {
			return Err(ChannelError::FundeeCannotSendUpdateFee);
		}

		let msg = msgs::UpdateFee { channel_id: self.channel_id, feerate_per_kw };
		// A newer fee update supersedes any unsigned previous one.
		let mut proposed: Vec<UpdateMessage> = self.local_changes.proposed.iter()
			.filter(|update| !matches!(update, UpdateMessage::Fee(_))).cloned().collect();
		proposed.push(UpdateMessage::Fee(msg.clone()));

		let reduced = self.remote_commit.spec.reduce(&self.remote_changes.acked, &proposed, !self.is_funder)?;
		let fee_sat = chan_utils::commit_tx_fee_sat(reduced.feerate_per_kw, self.remote_params.dust_limit_sat, &reduced);
		let missing = (reduced.to_remote_msat / 1000) as i64
			- self.remote_params.channel_reserve_sat as i64 - fee_sat as i64;
		if missing < 0 {
			return Err(ChannelError::CannotAffordFee {
				channel_reserve_sat: self.remote_params.channel_reserve_sat,
				fee_sat,
				missing_sat: (-missing) as u64,
			});
		}

		let mut commitments = self.clone();
		commitments.local_changes.proposed = proposed;
		Ok((commitments, msg))
	}

	/// Accepts the funder's feerate update, rejecting rates too far from our own estimate and
	/// rates the funder can no longer afford.
	pub fn receive_fee(&self, msg: &msgs::UpdateFee, local_feerate_per_kw: u32, config: &ChannelConfig) -> Result<(Commitments, Vec<ChannelEvent>), ChannelError> {
		if self.is_funder {
			return Err(ChannelError::FundeeCannotSendUpdateFee);
		}
		check_update_fee(config, msg, local_feerate_per_kw)?;

		let mut proposed: Vec<UpdateMessage> = self.remote_changes.proposed.iter()
			.filter(|update| !matches!(update, UpdateMessage::Fee(_))).cloned().collect();
		proposed.push(UpdateMessage::Fee(msg.clone()));

		let reduced = self.local_commit.spec.reduce(&self.local_changes.acked, &proposed, self.is_funder)?;
		let fee_sat = chan_utils::commit_tx_fee_sat(reduced.feerate_per_kw, self.local_params.dust_limit_sat, &reduced);
		let missing = (reduced.to_remote_msat / 1000) as i64
			- self.local_params.channel_reserve_sat as i64 - fee_sat as i64;
		if missing < 0 {
			return Err(ChannelError::CannotAffordFee {
				channel_reserve_sat: self.local_params.channel_reserve_sat,
				fee_sat,
				missing_sat: (-missing) as u64,
			});
		}

		let mut commitments = self.clone();
		commitments.remote_changes.proposed = proposed;
		Ok((commitments, vec![ChannelEvent::WeAcceptedUpdateFee { feerate_per_kw: msg.feerate_per_kw }]))
	}

	/// Signs the counterparty's next commitment, covering everything we have proposed and
	/// everything of theirs we have acknowledged.
	///
	/// The HTLC signatures are emitted in the canonical ascending-output order, which is the
	/// order the peer will verify them in.
	pub fn send_commit<T: secp256k1::Signing + secp256k1::Verification, L: Deref>(
		&self, keys: &InMemoryChannelKeys, secp_ctx: &Secp256k1<T>, logger: &L,
	) -> Result<(Commitments, msgs::CommitmentSigned), ChannelError>
		where L::Target: Logger
	{
		let remote_point = match &self.remote_next_commit_info {
			RemoteNextCommitInfo::Waiting(_) => return Err(ChannelError::CannotSignBeforeRevocation),
			RemoteNextCommitInfo::Revoked(point) => *point,
		};
		if !self.local_has_changes() {
			return Err(ChannelError::CannotSignWithoutChanges);
		}

		let spec = self.remote_commit.spec.reduce(&self.remote_changes.acked, &self.local_changes.proposed, !self.is_funder)?;
		let next_index = self.remote_commit.index + 1;
		let (tx, htlcs, tx_keys) = self.make_remote_txs(secp_ctx, next_index, &remote_point, &spec)?;
		let txid = tx.compute_txid();

		let signature = chan_utils::sign_commitment_transaction(secp_ctx, &tx, &self.funding, &keys.funding_key);

		let (timeout_txs, success_txs) = build_htlc_transactions(&txid, spec.feerate_per_kw, self.local_params.to_self_delay, &htlcs, &tx_keys);
		let sorted_htlc_txs = sort_both_htlcs(timeout_txs, success_txs);

		let htlc_key = derive_private_key(secp_ctx, &remote_point, &keys.htlc_base_key);
		let htlc_signatures: Vec<Signature> = sorted_htlc_txs.iter()
			.map(|htlc_tx| chan_utils::sign_htlc_transaction(secp_ctx, htlc_tx, &htlc_key))
			.collect();
		log_trace!(logger, "Signed remote commitment tx {} at number {} with {} htlc signatures in channel {}",
			txid, next_index, htlc_signatures.len(), self.channel_id);

		let msg = msgs::CommitmentSigned {
			channel_id: self.channel_id,
			signature,
			htlc_signatures,
		};

		let mut commitments = self.clone();
		commitments.local_changes = Changes {
			proposed: Vec::new(),
			signed: self.local_changes.proposed.clone(),
			acked: self.local_changes.acked.clone(),
		};
		commitments.remote_changes = Changes {
			proposed: self.remote_changes.proposed.clone(),
			signed: self.remote_changes.acked.clone(),
			acked: Vec::new(),
		};
		commitments.remote_next_commit_info = RemoteNextCommitInfo::Waiting(RemoteCommit {
			index: next_index,
			spec,
			txid,
			remote_per_commitment_point: remote_point,
		});
		Ok((commitments, msg))
	}

	/// Verifies and accepts the peer's `commitment_signed` over our next commitment, responding
	/// with the `revoke_and_ack` which retires the previous one.
	///
	/// HTLC signature failures are aggregated: every second-stage transaction is checked before
	/// the operation fails, so the caller sees the full picture.
	pub fn receive_commit<T: secp256k1::Signing + secp256k1::Verification, L: Deref>(
		&self, msg: &msgs::CommitmentSigned, keys: &InMemoryChannelKeys, secp_ctx: &Secp256k1<T>, logger: &L,
	) -> Result<(Commitments, msgs::RevokeAndACK, Vec<ChannelEvent>), ChannelError>
		where L::Target: Logger
	{
		if !self.remote_has_changes() {
			return Err(ChannelError::ReceivedCommitmentSignedWhenWeHaveNoPendingChanges);
		}

		let spec = self.local_commit.spec.reduce(&self.local_changes.acked, &self.remote_changes.proposed, self.is_funder)?;
		let next_index = self.local_commit.index + 1;
		let local_point = chan_utils::per_commitment_point(secp_ctx, &keys.commitment_seed, next_index);
		let (tx, htlcs, tx_keys) = self.make_local_txs(secp_ctx, next_index, &local_point, &spec)?;
		let txid = tx.compute_txid();

		log_trace!(logger, "Checking commitment tx signature {} by key {} against tx {} in channel {}",
			log_bytes!(msg.signature.serialize_compact()[..]),
			log_pubkey!(self.remote_pubkeys.funding_pubkey), txid, self.channel_id);
		if chan_utils::verify_commitment_signature(secp_ctx, &tx, &self.funding, &msg.signature, &self.remote_pubkeys.funding_pubkey).is_err() {
			return Err(ChannelError::InvalidCommitmentSignature);
		}

		let (timeout_txs, success_txs) = build_htlc_transactions(&txid, spec.feerate_per_kw, self.remote_params.to_self_delay, &htlcs, &tx_keys);
		let sorted_htlc_txs = sort_both_htlcs(timeout_txs, success_txs);
		if msg.htlc_signatures.len() != sorted_htlc_txs.len() {
			return Err(ChannelError::SignatureCountMismatch {
				expected: sorted_htlc_txs.len(),
				got: msg.htlc_signatures.len(),
			});
		}

		// An HTLC-timeout tx is complete once countersigned (we can always add our own half),
		// while an HTLC-success tx additionally waits on the payment preimage. Either way the
		// peer's signature must verify now; check them all before reporting.
		let mut invalid_outputs = Vec::new();
		for (htlc_tx, htlc_sig) in sorted_htlc_txs.iter().zip(msg.htlc_signatures.iter()) {
			let valid = match htlc_tx {
				HtlcTx::Timeout(_) => chan_utils::verify_htlc_signature(secp_ctx, htlc_tx, htlc_sig, &tx_keys.countersignatory_htlc_key).is_ok(),
				HtlcTx::Success(_) => chan_utils::verify_htlc_signature(secp_ctx, htlc_tx, htlc_sig, &tx_keys.countersignatory_htlc_key).is_ok(),
			};
			if !valid {
				log_trace!(logger, "Invalid HTLC tx signature {} for commitment output {} in channel {}",
					log_bytes!(htlc_sig.serialize_compact()[..]), htlc_tx.commitment_output_index(), self.channel_id);
				invalid_outputs.push(htlc_tx.commitment_output_index());
			}
		}
		if !invalid_outputs.is_empty() {
			return Err(ChannelError::InvalidHtlcSignatures { invalid_outputs });
		}

		// Revoke the commitment we are replacing and commit to the point two ahead.
		let revocation_secret = chan_utils::per_commitment_secret(&keys.commitment_seed, self.local_commit.index);
		let next_per_commitment_point = chan_utils::per_commitment_point(secp_ctx, &keys.commitment_seed, self.local_commit.index + 2);
		let revoke = msgs::RevokeAndACK {
			channel_id: self.channel_id,
			per_commitment_secret: revocation_secret,
			next_per_commitment_point,
		};

		let htlc_txs_and_sigs = sorted_htlc_txs.into_iter()
			.zip(msg.htlc_signatures.iter().cloned())
			.collect();

		let live_outgoing: HashSet<u64> = spec.htlcs.iter()
			.filter(|htlc| htlc.direction == HtlcDirection::Outgoing)
			.map(|htlc| htlc.add.htlc_id)
			.collect();

		let mut commitments = self.clone();
		commitments.local_commit = LocalCommit {
			index: next_index,
			spec,
			tx,
			counterparty_sig: msg.signature,
			htlc_txs_and_sigs,
		};
		commitments.local_changes.acked = Vec::new();
		commitments.remote_changes = Changes {
			proposed: Vec::new(),
			signed: self.remote_changes.signed.clone(),
			acked: self.remote_changes.acked.iter().chain(self.remote_changes.proposed.iter()).cloned().collect(),
		};
		commitments.origin_channels.retain(|htlc_id, _| live_outgoing.contains(htlc_id));

		log_trace!(logger, "Received valid commitment_signed for local commitment {} in channel {}", next_index, self.channel_id);
		let events = vec![ChannelEvent::WeAcceptedCommitmentSigned { commitment_number: next_index }];
		Ok((commitments, revoke, events))
	}

	/// Accepts the peer's `revoke_and_ack`: checks the revealed secret against the commitment
	/// being revoked, archives it in the compact secret store, and promotes the commitment we
	/// signed earlier to current.
	pub fn receive_revocation<T: secp256k1::Signing, L: Deref>(
		&self, msg: &msgs::RevokeAndACK, secp_ctx: &Secp256k1<T>, logger: &L,
	) -> Result<(Commitments, Vec<ChannelEvent>), ChannelError>
		where L::Target: Logger
	{
		let next_remote_commit = match &self.remote_next_commit_info {
			RemoteNextCommitInfo::Revoked(_) => return Err(ChannelError::UnexpectedRevocation),
			RemoteNextCommitInfo::Waiting(next) => next.clone(),
		};

		let revocation_key = SecretKey::from_slice(&msg.per_commitment_secret)
			.map_err(|_| ChannelError::InvalidRevocation)?;
		if PublicKey::from_secret_key(secp_ctx, &revocation_key) != self.remote_commit.remote_per_commitment_point {
			return Err(ChannelError::InvalidRevocation);
		}

		let mut commitments = self.clone();
		commitments.remote_per_commitment_secrets
			.provide_secret(self.remote_commit.index, msg.per_commitment_secret)
			.map_err(|_| ChannelError::InvalidRevocation)?;
		commitments.local_changes = Changes {
			proposed: self.local_changes.proposed.clone(),
			signed: Vec::new(),
			acked: self.local_changes.acked.iter().chain(self.local_changes.signed.iter()).cloned().collect(),
		};
		commitments.remote_changes.signed = Vec::new();
		commitments.remote_commit = next_remote_commit;
		commitments.remote_next_commit_info = RemoteNextCommitInfo::Revoked(msg.next_per_commitment_point);

		log_trace!(logger, "Received revocation of remote commitment {}; remote commitment {} is now current in channel {}",
			self.remote_commit.index, commitments.remote_commit.index, self.channel_id);
		let events = vec![ChannelEvent::WeAcceptedRevokeAndAck { remote_commitment_number: commitments.remote_commit.index }];
		Ok((commitments, events))
	}
}

/// Rejects fee updates which are wildly different from our own feerate estimate, in either
/// direction.
fn check_update_fee(config: &ChannelConfig, msg: &msgs::UpdateFee, local_feerate_per_kw: u32) -> Result<(), ChannelError> {
	let remote = msg.feerate_per_kw as f64;
	let local = local_feerate_per_kw as f64;
	let ratio = if remote > local { remote / local } else { local / remote };
	if !ratio.is_finite() || ratio > config.max_fee_rate_mismatch_ratio {
		return Err(ChannelError::FeerateTooDifferent {
			remote_feerate_per_kw: msg.feerate_per_kw,
			local_feerate_per_kw,
		});
	}
	Ok(())
}
