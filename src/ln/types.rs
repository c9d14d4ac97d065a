// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Various wrapper types (most around 32-byte arrays) for use in lightning.

use bitcoin::hashes::Hash;
use bitcoin::hashes::sha256::Hash as Sha256;

use core::fmt;

/// A unique 32-byte identifier for a channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub [u8; 32]);

impl fmt::Display for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		for i in self.0.iter() {
			write!(f, "{:02x}", i)?;
		}
		Ok(())
	}
}

impl fmt::Debug for ChannelId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

/// The payment hash is the hash of the [`PaymentPreimage`] which is the value used to lock funds
/// in HTLCs while they transit the lightning network.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PaymentHash(pub [u8; 32]);

impl fmt::Display for PaymentHash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		for i in self.0.iter() {
			write!(f, "{:02x}", i)?;
		}
		Ok(())
	}
}

impl fmt::Debug for PaymentHash {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

/// The payment preimage is the "secret key" which is used to claim the funds of an HTLC on-chain
/// or in a lightning channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PaymentPreimage(pub [u8; 32]);

impl PaymentPreimage {
	/// Hashes the preimage, producing the [`PaymentHash`] which locks the corresponding HTLC.
	pub fn payment_hash(&self) -> PaymentHash {
		PaymentHash(Sha256::hash(&self.0).to_byte_array())
	}
}

impl fmt::Display for PaymentPreimage {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		for i in self.0.iter() {
			write!(f, "{:02x}", i)?;
		}
		Ok(())
	}
}

impl fmt::Debug for PaymentPreimage {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		fmt::Display::fmt(self, f)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn payment_hash_of_preimage() {
		// sha256 of 32 zero bytes
		let preimage = PaymentPreimage([0; 32]);
		let hash = preimage.payment_hash();
		assert_eq!(
			hash.to_string(),
			"66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925"
		);
	}
}
