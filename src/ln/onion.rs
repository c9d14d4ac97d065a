// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The seam between the commitment engine and the sphinx onion implementation.
//!
//! Failing an HTLC requires peeling the onion it arrived with (to recover the shared secret) and
//! wrapping a failure payload for the return trip. Both operations belong to the sphinx
//! implementation the embedder provides; the engine only needs the two entry points modeled by
//! [`SphinxHandler`].

use bitcoin::secp256k1::SecretKey;

use crate::ln::msgs::{OnionErrorPacket, OnionPacket};
use crate::ln::types::PaymentHash;

use core::fmt;

/// The `BADONION` failure-code bit, set on errors which report an unparseable onion.
pub const BADONION: u16 = 0x8000;
/// The `PERM` failure-code bit, set on permanent (non-retryable) failures.
pub const PERM: u16 = 0x4000;
/// The `NODE` failure-code bit, set on failures pertaining to the whole node rather than a channel.
pub const NODE: u16 = 0x2000;
/// The `UPDATE` failure-code bit, set on failures carrying an updated channel policy.
pub const UPDATE: u16 = 0x1000;

/// The per-hop shared secret recovered while parsing an onion packet, from which the return-path
/// failure obfuscation keys are derived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SphinxSharedSecret(pub [u8; 32]);

/// An error returned by the sphinx implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CryptoError {
	/// The packet's version byte is unknown.
	UnknownVersion,
	/// The packet's ephemeral public key is not a valid curve point.
	InvalidPublicKey,
	/// The packet's HMAC did not cover its contents.
	BadMac,
}

impl fmt::Display for CryptoError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			CryptoError::UnknownVersion => write!(f, "unknown onion packet version"),
			CryptoError::InvalidPublicKey => write!(f, "invalid ephemeral public key in onion packet"),
			CryptoError::BadMac => write!(f, "onion packet HMAC check failed"),
		}
	}
}

/// How a failed HTLC should be reported back to its origin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HTLCFailReason {
	/// Forward a failure payload received from a downstream node, wrapping it once more.
	ErrorPacket(OnionErrorPacket),
	/// We are the failing node: create a fresh failure payload for the given failure code.
	FailureCode(u16),
}

/// The two sphinx entry points the commitment engine needs when failing an HTLC.
///
/// This is deliberately a seam: onion routing is implemented elsewhere and handed in by the
/// embedder, the same way chain access and signing are.
pub trait SphinxHandler {
	/// Processes an incoming onion packet with our node secret, returning the shared secret this
	/// hop was keyed with. The payment hash is the packet's associated data.
	fn parse_packet(&self, node_secret: &SecretKey, payment_hash: &PaymentHash, packet: &OnionPacket) -> Result<SphinxSharedSecret, CryptoError>;

	/// Wraps a downstream failure payload (or a locally created one) for the trip back towards
	/// the origin, obfuscating it under the given shared secret.
	fn forward_error_packet(&self, packet: &OnionErrorPacket, shared_secret: &SphinxSharedSecret) -> OnionErrorPacket;

	/// Creates a failure payload reporting the given failure code, MAC'd and obfuscated under the
	/// given shared secret.
	fn create_error_packet(&self, shared_secret: &SphinxSharedSecret, failure_code: u16) -> OnionErrorPacket;
}
