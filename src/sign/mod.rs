// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Entropy and key material the library needs handed in from outside.
//!
//! Nothing here generates randomness or touches an HSM: the embedder implements
//! [`EntropySource`] and hands per-channel base secrets in as an [`InMemoryChannelKeys`] when an
//! operation needs to sign.

use bitcoin::secp256k1;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

use crate::ln::chan_utils::ChannelPublicKeys;
use crate::ln::channel_keys::{DelayedPaymentBasepoint, HtlcBasepoint, PaymentBasepoint, RevocationBasepoint};

/// A source of cryptographically secure randomness.
///
/// Implementations MUST return different data each call; the seed codec derives salts from this
/// and the salt is what makes re-enciphering the same entropy produce a fresh mnemonic.
pub trait EntropySource {
	/// Gets 32 bytes of fresh entropy.
	fn get_secure_random_bytes(&self) -> [u8; 32];
}

/// Set of lightning keys needed to operate a channel, held in memory.
///
/// Operations borrow this for the duration of a call and never retain any of the secrets in the
/// state they return; wiping the secrets when the channel closes is the owner's responsibility.
#[derive(Clone)]
pub struct InMemoryChannelKeys {
	/// Private key the channel funding output's 2-of-2 is locked to.
	pub funding_key: SecretKey,
	/// Local secret key for the blinded revocation pubkey.
	pub revocation_base_key: SecretKey,
	/// Local secret key the counterparty's commitment transactions pay our balance to.
	pub payment_base_key: SecretKey,
	/// Local secret key our own commitment transactions pay our delayed balance to.
	pub delayed_payment_base_key: SecretKey,
	/// Local secret key used in HTLC outputs and second-stage HTLC transactions.
	pub htlc_base_key: SecretKey,
	/// Seed of our per-commitment secret chain.
	pub commitment_seed: [u8; 32],
}

impl InMemoryChannelKeys {
	/// The public counterparts our peer was given at channel open.
	pub fn pubkeys<T: secp256k1::Signing>(&self, secp_ctx: &Secp256k1<T>) -> ChannelPublicKeys {
		let from_secret = |secret: &SecretKey| PublicKey::from_secret_key(secp_ctx, secret);
		ChannelPublicKeys {
			funding_pubkey: from_secret(&self.funding_key),
			revocation_basepoint: RevocationBasepoint(from_secret(&self.revocation_base_key)),
			payment_basepoint: PaymentBasepoint(from_secret(&self.payment_base_key)),
			delayed_payment_basepoint: DelayedPaymentBasepoint(from_secret(&self.delayed_payment_base_key)),
			htlc_basepoint: HtlcBasepoint(from_secret(&self.htlc_base_key)),
		}
	}
}
