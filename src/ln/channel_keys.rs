// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Keys used to generate commitment transactions.
//! See: <https://github.com/lightning/bolts/blob/master/03-transactions.md#keys>

use bitcoin::hashes::Hash;
use bitcoin::hashes::HashEngine;
use bitcoin::hashes::sha256::Hash as Sha256;
use bitcoin::secp256k1;
use bitcoin::secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};

macro_rules! doc_comment {
	($x:expr, $($tt:tt)*) => {
		#[doc = $x]
		$($tt)*
	};
}
macro_rules! basepoint_impl {
	($BasepointT:ty) => {
		impl $BasepointT {
			/// Get inner Public Key
			pub fn to_public_key(&self) -> PublicKey {
				self.0
			}
		}

		impl From<PublicKey> for $BasepointT {
			fn from(value: PublicKey) -> Self {
				Self(value)
			}
		}
	}
}
macro_rules! key_impl {
	($BasepointT:ty, $KeyName:expr) => {
		doc_comment! {
			concat!("Generate ", $KeyName, " using per_commitment_point"),
			pub fn from_basepoint<T: secp256k1::Signing>(
				secp_ctx: &Secp256k1<T>,
				basepoint: &$BasepointT,
				per_commitment_point: &PublicKey,
			) -> Self {
				Self(derive_public_key(secp_ctx, per_commitment_point, &basepoint.0))
			}
		}

		doc_comment! {
			concat!("Generate ", $KeyName, " from privkey"),
			pub fn from_secret_key<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, sk: &SecretKey) -> Self {
				Self(PublicKey::from_secret_key(&secp_ctx, &sk))
			}
		}

		/// Get inner Public Key
		pub fn to_public_key(&self) -> PublicKey {
			self.0
		}
	}
}

/// Master key used in conjunction with per_commitment_point to generate the `to_remote` payment
/// key for a given state of a channel. Shared with the counterparty at channel open so that they
/// can build our primary balance output on their commitment transactions.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub struct PaymentBasepoint(pub PublicKey);
basepoint_impl!(PaymentBasepoint);

/// A key derived from the [`PaymentBasepoint`] which receives the non-delayed, non-HTLC balance
/// on the counterparty's commitment transaction via a plain P2WPKH output. Ours to claim whenever
/// the counterparty force closes.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct PaymentKey(pub PublicKey);

impl PaymentKey {
	key_impl!(PaymentBasepoint, "localpubkey");
}

/// Master key used in conjunction with per_commitment_point to generate the delayed payment key
/// for the latest state of a channel. A watcher can be given a [`DelayedPaymentBasepoint`] to
/// recognize the broadcaster's delayed balance output on any commitment transaction.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub struct DelayedPaymentBasepoint(pub PublicKey);
basepoint_impl!(DelayedPaymentBasepoint);

/// A key derived from the [`DelayedPaymentBasepoint`] which receives the broadcaster's primary
/// balance, spendable only after their contest delay expires (or immediately via the revocation
/// path if the state was revoked).
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct DelayedPaymentKey(pub PublicKey);

impl DelayedPaymentKey {
	key_impl!(DelayedPaymentBasepoint, "delayedpubkey");
}

/// Master key used in conjunction with per_commitment_point to generate an [`HtlcKey`] for the
/// latest state of a channel.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub struct HtlcBasepoint(pub PublicKey);
basepoint_impl!(HtlcBasepoint);

/// A key derived from the [`HtlcBasepoint`] which encumbers the HTLC outputs on a commitment
/// transaction and the second-stage HTLC transactions which spend them.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct HtlcKey(pub PublicKey);

impl HtlcKey {
	key_impl!(HtlcBasepoint, "htlcpubkey");
}

/// Master key used in conjunction with per_commitment_point to generate a [`RevocationKey`].
/// A watcher can be given a [`RevocationBasepoint`] to generate per-commitment revocation keys
/// and create justice transactions.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub struct RevocationBasepoint(pub PublicKey);
basepoint_impl!(RevocationBasepoint);

/// The key which lets the punisher sweep every output of a revoked commitment transaction once
/// its broadcaster has handed over the matching per-commitment secret.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub struct RevocationKey(pub PublicKey);

impl RevocationKey {
	/// Derives a per-commitment-transaction revocation public key from its constituent parts.
	/// This is the public equivalent of [`derive_private_revocation_key`] - using only public
	/// keys to derive a public key instead of private keys.
	///
	/// Only the cheating participant owns a valid witness to propagate a revoked commitment
	/// transaction, thus per_commitment_point always comes from the cheater and
	/// revocation_base_point always comes from the punisher, which is the broadcaster of the
	/// transaction spending with this key knowledge.
	///
	/// Note that this is infallible iff we trust that at least one of the two input keys are
	/// randomly generated (ie our own).
	pub fn from_basepoint<T: secp256k1::Verification>(
		secp_ctx: &Secp256k1<T>,
		basepoint: &RevocationBasepoint,
		per_commitment_point: &PublicKey,
	) -> Self {
		let rev_append_commit_hash_key = {
			let mut sha = Sha256::engine();
			sha.input(&basepoint.to_public_key().serialize());
			sha.input(&per_commitment_point.serialize());

			Sha256::from_engine(sha).to_byte_array()
		};
		let commit_append_rev_hash_key = {
			let mut sha = Sha256::engine();
			sha.input(&per_commitment_point.serialize());
			sha.input(&basepoint.to_public_key().serialize());

			Sha256::from_engine(sha).to_byte_array()
		};

		let countersignatory_contrib = basepoint.to_public_key().mul_tweak(&secp_ctx, &Scalar::from_be_bytes(rev_append_commit_hash_key).unwrap())
			.expect("Multiplying a valid public key by a hash is expected to never fail per secp256k1 docs");
		let broadcaster_contrib = per_commitment_point.mul_tweak(&secp_ctx, &Scalar::from_be_bytes(commit_append_rev_hash_key).unwrap())
			.expect("Multiplying a valid public key by a hash is expected to never fail per secp256k1 docs");
		let pk = countersignatory_contrib.combine(&broadcaster_contrib)
			.expect("Addition only fails if the tweak is the inverse of the key. This is not possible when the tweak commits to the key.");
		Self(pk)
	}

	/// Get inner Public Key
	pub fn to_public_key(&self) -> PublicKey {
		self.0
	}
}

/// Derives a per-commitment-transaction public key (eg an htlc key or a delayed_payment key)
/// from the base point and the per_commitment_point. This is the public equivalent of
/// [`derive_private_key`] - using only public keys to derive a public key instead of private keys.
fn derive_public_key<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey, base_point: &PublicKey) -> PublicKey {
	let mut sha = Sha256::engine();
	sha.input(&per_commitment_point.serialize());
	sha.input(&base_point.serialize());
	let res = Sha256::from_engine(sha).to_byte_array();

	let hashkey = PublicKey::from_secret_key(&secp_ctx,
		&SecretKey::from_slice(&res).expect("Hashes should always be valid keys unless SHA-256 is broken"));
	base_point.combine(&hashkey)
		.expect("Addition only fails if the tweak is the inverse of the key. This is not possible when the tweak contains the hash of the key.")
}

/// Derives a per-commitment-transaction private key (eg an htlc key or delayed_payment key)
/// from the base secret and the per_commitment_point.
///
/// Note that this is infallible iff we trust that at least one of the two input keys are randomly
/// generated (ie our own).
pub fn derive_private_key<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, per_commitment_point: &PublicKey, base_secret: &SecretKey) -> SecretKey {
	let mut sha = Sha256::engine();
	sha.input(&per_commitment_point.serialize());
	sha.input(&PublicKey::from_secret_key(&secp_ctx, &base_secret).serialize());
	let res = Sha256::from_engine(sha).to_byte_array();

	base_secret.clone().add_tweak(&Scalar::from_be_bytes(res).expect("Hashes should always be valid keys unless SHA-256 is broken"))
		.expect("Addition only fails if the tweak is the inverse of the key. This is not possible when the tweak contains the hash of the key.")
}

/// Derives a per-commitment-transaction revocation private key from its constituent parts.
///
/// Only the cheating participant owns a valid witness to propagate a revoked commitment
/// transaction, thus per_commitment_secret always comes from the cheater and
/// revocation_base_secret always comes from the punisher, which is the broadcaster of the
/// transaction spending with this key knowledge.
///
/// Note that this is infallible iff we trust that at least one of the two input keys are randomly
/// generated (ie our own).
pub fn derive_private_revocation_key<T: secp256k1::Signing>(secp_ctx: &Secp256k1<T>, per_commitment_secret: &SecretKey, countersignatory_revocation_base_secret: &SecretKey) -> SecretKey {
	let countersignatory_revocation_base_point = PublicKey::from_secret_key(&secp_ctx, &countersignatory_revocation_base_secret);
	let per_commitment_point = PublicKey::from_secret_key(&secp_ctx, &per_commitment_secret);

	let rev_append_commit_hash_key = {
		let mut sha = Sha256::engine();
		sha.input(&countersignatory_revocation_base_point.serialize());
		sha.input(&per_commitment_point.serialize());

		Sha256::from_engine(sha).to_byte_array()
	};
	let commit_append_rev_hash_key = {
		let mut sha = Sha256::engine();
		sha.input(&per_commitment_point.serialize());
		sha.input(&countersignatory_revocation_base_point.serialize());

		Sha256::from_engine(sha).to_byte_array()
	};

	let countersignatory_contrib = countersignatory_revocation_base_secret.clone()
		.mul_tweak(&Scalar::from_be_bytes(rev_append_commit_hash_key).expect("Hashes should always be valid keys unless SHA-256 is broken"))
		.expect("Multiplying a valid secret key by a hash is expected to never fail per secp256k1 docs");
	let broadcaster_contrib = per_commitment_secret.clone()
		.mul_tweak(&Scalar::from_be_bytes(commit_append_rev_hash_key).expect("Hashes should always be valid keys unless SHA-256 is broken"))
		.expect("Multiplying a valid secret key by a hash is expected to never fail per secp256k1 docs");
	countersignatory_contrib.add_tweak(&Scalar::from(broadcaster_contrib))
		.expect("Addition only fails if the tweak is the inverse of the key. This is not possible when the tweak commits to the key.")
}

#[cfg(test)]
mod tests {
	use super::*;
	use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

	#[test]
	fn test_key_derivation() {
		// Test vectors from BOLT 3 Appendix E:
		let secp_ctx = Secp256k1::new();

		let base_secret = SecretKey::from_slice(&hex::decode("000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f").unwrap()[..]).unwrap();
		let per_commitment_secret = SecretKey::from_slice(&hex::decode("1f1e1d1c1b1a191817161514131211100f0e0d0c0b0a09080706050403020100").unwrap()[..]).unwrap();

		let base_point = PublicKey::from_secret_key(&secp_ctx, &base_secret);
		assert_eq!(base_point.serialize()[..], hex::decode("036d6caac248af96f6afa7f904f550253a0f3ef3f5aa2fe6838a95b216691468e2").unwrap()[..]);

		let per_commitment_point = PublicKey::from_secret_key(&secp_ctx, &per_commitment_secret);
		assert_eq!(per_commitment_point.serialize()[..], hex::decode("025f7117a78150fe2ef97db7cfc83bd57b2e2c0d0dd25eaf467a4a1c2a45ce1486").unwrap()[..]);

		assert_eq!(derive_public_key(&secp_ctx, &per_commitment_point, &base_point).serialize()[..],
			hex::decode("0235f2dbfaa89b57ec7b055afe29849ef7ddfeb1cefdb9ebdc43f5494984db29e5").unwrap()[..]);

		assert_eq!(derive_private_key(&secp_ctx, &per_commitment_point, &base_secret),
			SecretKey::from_slice(&hex::decode("cbced912d3b21bf196a766651e436aff192362621ce317704ea2f75d87e7be0f").unwrap()[..]).unwrap());
	}

	#[test]
	fn private_and_public_revocation_keys_agree() {
		let secp_ctx = Secp256k1::new();

		let revocation_base_secret = SecretKey::from_slice(&[41; 32]).unwrap();
		let per_commitment_secret = SecretKey::from_slice(&[42; 32]).unwrap();

		let revocation_basepoint = RevocationBasepoint(PublicKey::from_secret_key(&secp_ctx, &revocation_base_secret));
		let per_commitment_point = PublicKey::from_secret_key(&secp_ctx, &per_commitment_secret);

		let revocation_pubkey = RevocationKey::from_basepoint(&secp_ctx, &revocation_basepoint, &per_commitment_point);
		let revocation_privkey = derive_private_revocation_key(&secp_ctx, &per_commitment_secret, &revocation_base_secret);

		assert_eq!(revocation_pubkey.to_public_key(), PublicKey::from_secret_key(&secp_ctx, &revocation_privkey));
	}
}
