// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

// The AEZ v5 enciphering scheme, built from four-round AES as its round primitive. Only the
// "tiny" enciphering path for strings shorter than 32 bytes is implemented, which covers the
// 23-byte seed envelope this crate enciphers; the wide-block core path has no caller here.
//
// Authenticated encryption by enciphering: the plaintext is extended with `tau` zero bytes and
// the whole string is run through a tweakable strong PRP keyed by (key, nonce, ad). Decryption
// deciphers and accepts only if the `tau` trailing bytes are still zero - any change to the
// ciphertext, the key or the tweak diffuses over the entire string and trips the check.

use aes::hazmat::cipher_round;
use aes::Block as AesBlock;
use blake2::digest::consts::U48;
use blake2::{Blake2b, Digest};

type Block = [u8; 16];

const ZERO: Block = [0u8; 16];

#[inline]
fn xor_block(a: &Block, b: &Block) -> Block {
	let mut out = [0u8; 16];
	for i in 0..16 {
		out[i] = a[i] ^ b[i];
	}
	out
}

/// Doubling in GF(2^128), big-endian bit order, reduction polynomial x^128 + x^7 + x^2 + x + 1.
#[inline]
fn double_block(x: &Block) -> Block {
	let mut out = [0u8; 16];
	let carry = x[0] >> 7;
	for i in 0..15 {
		out[i] = (x[i] << 1) | (x[i + 1] >> 7);
	}
	out[15] = x[15] << 1;
	if carry != 0 {
		out[15] ^= 0x87;
	}
	out
}

/// Multiplication of `x` by the small integer `n` in GF(2^128).
fn mult_block(n: u64, x: &Block) -> Block {
	let mut out = ZERO;
	let mut power = *x;
	for bit in 0..64 {
		if n & (1 << bit) != 0 {
			out = xor_block(&out, &power);
		}
		power = double_block(&power);
	}
	out
}

#[inline]
fn aes_round(state: &mut Block, round_key: &Block) {
	let mut block = AesBlock::clone_from_slice(state);
	cipher_round(&mut block, AesBlock::from_slice(round_key));
	state.copy_from_slice(&block);
}

#[inline]
fn get_bit(buf: &[u8], idx: usize) -> u8 {
	(buf[idx / 8] >> (7 - idx % 8)) & 1
}

#[inline]
fn set_bit(buf: &mut [u8], idx: usize, bit: u8) {
	if bit != 0 {
		buf[idx / 8] |= 1 << (7 - idx % 8);
	}
}

/// Copies `len` bits of `src` starting at `start` into a fresh block, left-aligned.
fn extract_bits(src: &[u8], start: usize, len: usize) -> Block {
	let mut out = ZERO;
	for i in 0..len {
		set_bit(&mut out, i, get_bit(src, start + i));
	}
	out
}

/// Zeroes every bit of `block` at position `len` or later.
fn mask_bits(block: &Block, len: usize) -> Block {
	let mut out = ZERO;
	for i in 0..len {
		set_bit(&mut out, i, get_bit(block, i));
	}
	out
}

/// The `10*` padding of a left-aligned `len`-bit string to a full block.
fn pad_one_zero(block: &Block, len: usize) -> Block {
	let mut out = mask_bits(block, len);
	set_bit(&mut out, len, 1);
	out
}

/// An AEZ key, expanded into its three 16-byte subkeys.
pub(crate) struct Aez {
	key_i: Block,
	key_j: Block,
	key_l: Block,
}

impl Aez {
	/// Extracts the three subkeys. A 48-byte key is used as-is, anything else is first run
	/// through BLAKE2b-384.
	pub fn new(key: &[u8]) -> Aez {
		let mut extracted = [0u8; 48];
		if key.len() == 48 {
			extracted.copy_from_slice(key);
		} else {
			let mut hasher = Blake2b::<U48>::new();
			hasher.update(key);
			extracted.copy_from_slice(&hasher.finalize());
		}
		let mut key_i = ZERO;
		let mut key_j = ZERO;
		let mut key_l = ZERO;
		key_i.copy_from_slice(&extracted[0..16]);
		key_j.copy_from_slice(&extracted[16..32]);
		key_l.copy_from_slice(&extracted[32..48]);
		Aez { key_i, key_j, key_l }
	}

	/// Four AES rounds keyed (J, I, L, 0), the scheme's cheap tweakable primitive.
	fn aes4(&self, x: &Block) -> Block {
		let mut state = *x;
		aes_round(&mut state, &self.key_j);
		aes_round(&mut state, &self.key_i);
		aes_round(&mut state, &self.key_l);
		aes_round(&mut state, &ZERO);
		state
	}

	/// Ten AES rounds cycling (I, J, L), used where full PRF strength is needed.
	fn aes10(&self, x: &Block) -> Block {
		let mut state = *x;
		let schedule = [
			&self.key_i, &self.key_j, &self.key_l, &self.key_i, &self.key_j,
			&self.key_l, &self.key_i, &self.key_j, &self.key_l, &self.key_i,
		];
		for round_key in schedule {
			aes_round(&mut state, round_key);
		}
		state
	}

	/// The tweakable block cipher E^{j,i} the scheme composes everything from: an offset
	/// derived from (j, i) and the subkeys is folded into the input before the AES rounds.
	fn e(&self, j: i64, i: u64, x: &Block) -> Block {
		match j {
			-1 => {
				let delta = mult_block(i, &self.key_l);
				self.aes10(&xor_block(&delta, x))
			},
			0 => {
				let delta = mult_block(i, &self.key_i);
				self.aes4(&xor_block(&delta, x))
			},
			_ => {
				let delta = xor_block(&mult_block(j as u64, &self.key_j), &mult_block(i, &self.key_i));
				self.aes4(&xor_block(&delta, x))
			},
		}
	}

	/// Hashes the tweak vector (the zero-expansion length, the nonce and the associated data)
	/// into the single offset the enciphering is tweaked by.
	fn aez_hash(&self, tau: usize, nonce: &[u8], ad: &[u8]) -> Block {
		let mut tau_block = ZERO;
		tau_block[12..16].copy_from_slice(&((tau * 8) as u32).to_be_bytes());

		let mut delta = ZERO;
		for (idx, tweak) in [&tau_block[..], nonce, ad].iter().enumerate() {
			let j = (idx + 3) as i64;
			if tweak.is_empty() {
				delta = xor_block(&delta, &self.e(j, 0, &pad_one_zero(&ZERO, 0)));
				continue;
			}
			for (block_idx, chunk) in tweak.chunks(16).enumerate() {
				if chunk.len() == 16 {
					let mut block = ZERO;
					block.copy_from_slice(chunk);
					delta = xor_block(&delta, &self.e(j, (block_idx + 1) as u64, &block));
				} else {
					let mut block = ZERO;
					block[..chunk.len()].copy_from_slice(chunk);
					delta = xor_block(&delta, &self.e(j, 0, &pad_one_zero(&block, chunk.len() * 8)));
				}
			}
		}
		delta
	}

	/// The PRF used when there is no plaintext at all: `tau` bytes of keyed output bound to the
	/// tweak vector.
	fn aez_prf(&self, delta: &Block, tau: usize) -> Vec<u8> {
		let mut out = Vec::with_capacity(tau);
		let mut counter = 0u64;
		while out.len() < tau {
			let mut ctr_block = ZERO;
			ctr_block[8..16].copy_from_slice(&counter.to_be_bytes());
			let block = self.e(-1, 3, &xor_block(delta, &ctr_block));
			let take = core::cmp::min(16, tau - out.len());
			out.extend_from_slice(&block[..take]);
			counter += 1;
		}
		out
	}

	/// One Feistel round function over the right half: the padded half, the tweak offset and
	/// the round counter go through E^{0,7}, truncated back to a half-width string.
	fn feistel_round(&self, delta: &Block, half: &Block, half_bits: usize, round: u32) -> Block {
		let mut ctr_block = ZERO;
		ctr_block[15] = (round + 1) as u8;
		let input = xor_block(&xor_block(delta, &pad_one_zero(half, half_bits)), &ctr_block);
		mask_bits(&self.e(0, 7, &input), half_bits)
	}

	fn feistel_rounds(bits: usize) -> u32 {
		match bits {
			8 => 24,
			16 => 16,
			b if b < 128 => 10,
			_ => 8,
		}
	}

	/// Enciphers a string of fewer than 32 bytes as a balanced Feistel network over its two
	/// bit-level halves.
	fn encipher_tiny(&self, delta: &Block, x: &[u8]) -> Vec<u8> {
		let bits = x.len() * 8;
		let half_bits = bits / 2;
		let mut left = extract_bits(x, 0, half_bits);
		let mut right = extract_bits(x, half_bits, half_bits);

		for round in 0..Self::feistel_rounds(bits) {
			let fed = self.feistel_round(delta, &right, half_bits, round);
			let new_right = xor_block(&left, &fed);
			left = right;
			right = new_right;
		}
		Self::join_halves(&left, &right, half_bits, x.len())
	}

	/// Exact inverse of [`Self::encipher_tiny`].
	fn decipher_tiny(&self, delta: &Block, x: &[u8]) -> Vec<u8> {
		let bits = x.len() * 8;
		let half_bits = bits / 2;
		let mut left = extract_bits(x, 0, half_bits);
		let mut right = extract_bits(x, half_bits, half_bits);

		for round in (0..Self::feistel_rounds(bits)).rev() {
			let fed = self.feistel_round(delta, &left, half_bits, round);
			let new_left = xor_block(&right, &fed);
			right = left;
			left = new_left;
		}
		Self::join_halves(&left, &right, half_bits, x.len())
	}

	fn join_halves(left: &Block, right: &Block, half_bits: usize, len: usize) -> Vec<u8> {
		let mut out = vec![0u8; len];
		for i in 0..half_bits {
			set_bit(&mut out, i, get_bit(left, i));
			set_bit(&mut out, half_bits + i, get_bit(right, i));
		}
		out
	}

	/// Encrypts `plaintext`, expanding it by `tau` bytes of redundancy. The output length is
	/// always `plaintext.len() + tau`.
	///
	/// Only inputs where `plaintext.len() + tau < 32` are supported (the tiny path).
	pub fn encrypt(&self, nonce: &[u8], ad: &[u8], tau: usize, plaintext: &[u8]) -> Vec<u8> {
		debug_assert!(plaintext.len() + tau < 32, "only the AEZ-tiny enciphering path is implemented");
		let delta = self.aez_hash(tau, nonce, ad);
		if plaintext.is_empty() {
			return self.aez_prf(&delta, tau);
		}
		let mut x = plaintext.to_vec();
		x.resize(plaintext.len() + tau, 0);
		self.encipher_tiny(&delta, &x)
	}

	/// Decrypts `ciphertext`, stripping and checking the `tau` bytes of redundancy. Returns
	/// `None` on any authentication failure.
	pub fn decrypt(&self, nonce: &[u8], ad: &[u8], tau: usize, ciphertext: &[u8]) -> Option<Vec<u8>> {
		debug_assert!(ciphertext.len() < 32, "only the AEZ-tiny enciphering path is implemented");
		if ciphertext.len() < tau {
			return None;
		}
		let delta = self.aez_hash(tau, nonce, ad);
		if ciphertext.len() == tau {
			if self.aez_prf(&delta, tau) == ciphertext {
				return Some(Vec::new());
			}
			return None;
		}
		let mut x = self.decipher_tiny(&delta, ciphertext);
		if !x[x.len() - tau..].iter().all(|byte| *byte == 0) {
			return None;
		}
		x.truncate(ciphertext.len() - tau);
		Some(x)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const TAU: usize = 4;

	fn aez() -> Aez {
		Aez::new(&[7u8; 32])
	}

	#[test]
	fn roundtrip_all_tiny_lengths() {
		let cipher = aez();
		for len in 0..=27 {
			let plaintext: Vec<u8> = (0..len as u8).collect();
			let ciphertext = cipher.encrypt(b"", b"some ad", TAU, &plaintext);
			assert_eq!(ciphertext.len(), len + TAU);
			let recovered = cipher.decrypt(b"", b"some ad", TAU, &ciphertext).unwrap();
			assert_eq!(recovered, plaintext);
		}
	}

	#[test]
	fn encryption_is_deterministic() {
		let cipher = aez();
		let a = cipher.encrypt(b"nonce", b"ad", TAU, b"nineteen byte input");
		let b = cipher.encrypt(b"nonce", b"ad", TAU, b"nineteen byte input");
		assert_eq!(a, b);
	}

	#[test]
	fn wrong_key_fails() {
		let ciphertext = aez().encrypt(b"", b"ad", TAU, b"nineteen byte input");
		assert_eq!(Aez::new(&[8u8; 32]).decrypt(b"", b"ad", TAU, &ciphertext), None);
	}

	#[test]
	fn wrong_ad_or_nonce_fails() {
		let cipher = aez();
		let ciphertext = cipher.encrypt(b"n", b"ad", TAU, b"nineteen byte input");
		assert_eq!(cipher.decrypt(b"n", b"da", TAU, &ciphertext), None);
		assert_eq!(cipher.decrypt(b"m", b"ad", TAU, &ciphertext), None);
		assert!(cipher.decrypt(b"n", b"ad", TAU, &ciphertext).is_some());
	}

	#[test]
	fn any_ciphertext_bitflip_fails() {
		let cipher = aez();
		let ciphertext = cipher.encrypt(b"", b"ad", TAU, b"nineteen byte input");
		for bit in 0..ciphertext.len() * 8 {
			let mut tampered = ciphertext.clone();
			tampered[bit / 8] ^= 1 << (7 - bit % 8);
			assert_eq!(cipher.decrypt(b"", b"ad", TAU, &tampered), None, "bit {} accepted", bit);
		}
	}

	#[test]
	fn empty_plaintext_uses_prf_path() {
		let cipher = aez();
		let ciphertext = cipher.encrypt(b"", b"ad", TAU, b"");
		assert_eq!(ciphertext.len(), TAU);
		assert_eq!(cipher.decrypt(b"", b"ad", TAU, &ciphertext), Some(Vec::new()));
		let mut tampered = ciphertext.clone();
		tampered[0] ^= 1;
		assert_eq!(cipher.decrypt(b"", b"ad", TAU, &tampered), None);
	}

	#[test]
	fn distinct_keys_produce_distinct_subkeys() {
		let a = Aez::new(&[1u8; 32]);
		let b = Aez::new(&[2u8; 32]);
		assert_ne!(a.key_i, b.key_i);
		assert_ne!(a.key_j, b.key_j);
		assert_ne!(a.key_l, b.key_l);
	}
}
