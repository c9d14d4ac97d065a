// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Shapes of the channel-update messages exchanged between peers.
//!
//! Only the message *structure* lives here; wire encoding and decoding is a peer-protocol concern
//! and is handled outside this crate. The commitment engine consumes and produces these values
//! directly.

use bitcoin::secp256k1::PublicKey;
use bitcoin::secp256k1::ecdsa::Signature;

use crate::ln::types::{ChannelId, PaymentHash, PaymentPreimage};

/// An onion packet as carried in an `update_add_htlc` message. Parsed and peeled by the sphinx
/// implementation the embedder provides; opaque bytes to this crate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnionPacket {
	/// Always 0 in the current protocol.
	pub version: u8,
	/// The ephemeral session key the origin used for this hop.
	pub public_key: PublicKey,
	/// The encrypted per-hop routing payload.
	pub hop_data: Vec<u8>,
	/// HMAC over the packet, keyed per-hop.
	pub hmac: [u8; 32],
}

/// An encrypted failure payload as carried in an `update_fail_htlc` message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnionErrorPacket {
	/// The failure data, onion-wrapped once per hop it has traversed.
	pub data: Vec<u8>,
}

/// An `update_add_htlc` message to be sent to or received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateAddHTLC {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The HTLC ID
	pub htlc_id: u64,
	/// The HTLC value in milli-satoshi
	pub amount_msat: u64,
	/// The payment hash, the pre-image of which controls HTLC redemption
	pub payment_hash: PaymentHash,
	/// The expiry height of the HTLC
	pub cltv_expiry: u32,
	/// The onion routing packet with encrypted data for the next hop.
	pub onion_routing_packet: OnionPacket,
}

/// An `update_fulfill_htlc` message to be sent to or received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFulfillHTLC {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The HTLC ID
	pub htlc_id: u64,
	/// The pre-image of the payment hash, allowing HTLC redemption
	pub payment_preimage: PaymentPreimage,
}

/// An `update_fail_htlc` message to be sent to or received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFailHTLC {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The HTLC ID
	pub htlc_id: u64,
	/// The reason for the HTLC failure, encrypted hop-by-hop on the return path.
	pub reason: OnionErrorPacket,
}

/// An `update_fail_malformed_htlc` message to be sent to or received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFailMalformedHTLC {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The HTLC ID
	pub htlc_id: u64,
	/// The SHA256 of the onion blob we couldn't process, proving to the origin what we saw.
	pub sha256_of_onion: [u8; 32],
	/// The failure code, which must have the `BADONION` bit set.
	pub failure_code: u16,
}

/// An `update_fee` message to be sent to or received from a peer. May only originate from the
/// channel funder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFee {
	/// The channel ID
	pub channel_id: ChannelId,
	/// Fee rate per 1000-weight of the transaction
	pub feerate_per_kw: u32,
}

/// A `commitment_signed` message to be sent to or received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitmentSigned {
	/// The channel ID
	pub channel_id: ChannelId,
	/// A signature on the commitment transaction
	pub signature: Signature,
	/// Signatures on the HTLC transactions, in the canonical output-index order.
	pub htlc_signatures: Vec<Signature>,
}

/// A `revoke_and_ack` message to be sent to or received from a peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevokeAndACK {
	/// The channel ID
	pub channel_id: ChannelId,
	/// The secret corresponding to the per-commitment point of the commitment being revoked
	pub per_commitment_secret: [u8; 32],
	/// The next sender-broadcast commitment transaction's per-commitment point
	pub next_per_commitment_point: PublicKey,
}

/// Any of the channel-update messages which can sit in a [`Changes`] buffer between being
/// proposed and being irrevocably committed on both sides.
///
/// [`Changes`]: crate::ln::commitments::Changes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateMessage {
	/// An `update_add_htlc`
	AddHTLC(UpdateAddHTLC),
	/// An `update_fulfill_htlc`
	FulfillHTLC(UpdateFulfillHTLC),
	/// An `update_fail_htlc`
	FailHTLC(UpdateFailHTLC),
	/// An `update_fail_malformed_htlc`
	FailMalformedHTLC(UpdateFailMalformedHTLC),
	/// An `update_fee`
	Fee(UpdateFee),
}

impl UpdateMessage {
	/// The HTLC id this update settles (fulfills or fails), if it settles one.
	pub(crate) fn settled_htlc_id(&self) -> Option<u64> {
		match self {
			UpdateMessage::FulfillHTLC(msg) => Some(msg.htlc_id),
			UpdateMessage::FailHTLC(msg) => Some(msg.htlc_id),
			UpdateMessage::FailMalformedHTLC(msg) => Some(msg.htlc_id),
			_ => None,
		}
	}
}
