// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The aezeed wallet-seed codec: 16 bytes of wallet entropy wrapped in a versioned,
//! checksum-protected, passphrase-enciphered envelope and rendered as a 24-word mnemonic.
//!
//! The enciphered envelope is 33 bytes: a version byte, 23 bytes of AEZ ciphertext over the
//! seed material, a 5-byte scrypt salt and a big-endian CRC32 over everything preceding it.
//! The plaintext additionally carries a "birthday" (days since the bitcoin genesis block) so a
//! restoring wallet knows how far back to rescan. Changing the passphrase re-enciphers the same
//! entropy under a fresh salt, yielding an unrelated-looking mnemonic.

use bip39::Language;
use zeroize::Zeroize;

use crate::crypto::aez::Aez;
use crate::sign::EntropySource;

use core::fmt;
use core::str::FromStr;

/// The only on-disk/on-paper seed version this codec understands.
pub const CIPHER_SEED_VERSION: u8 = 0;

/// Number of words in an aezeed mnemonic.
pub const NUM_MNEMONIC_WORDS: usize = 24;

/// Number of wordlist index bits carried per mnemonic word.
pub const BITS_PER_WORD: usize = 11;

/// Size of the raw wallet entropy.
pub const ENTROPY_SIZE: usize = 16;

/// Size of the per-encipherment scrypt salt.
pub const SALT_SIZE: usize = 5;

/// Size of the trailing CRC32 checksum.
pub const CHECKSUM_SIZE: usize = 4;

/// Size of the complete enciphered seed: version + ciphertext + salt + checksum.
pub const ENCIPHERED_CIPHER_SEED_SIZE: usize = 33;

/// Size of the plaintext seed: version + birthday + entropy.
pub const DECIPHERED_CIPHER_SEED_SIZE: usize = 19;

/// The passphrase used when the user supplies none.
pub const DEFAULT_PASSPHRASE: &[u8] = b"aezeed";

/// UNIX timestamp of the bitcoin mainnet genesis block header, the epoch birthdays count from.
pub const BITCOIN_GENESIS_DATE: u64 = 1231006505;

const AD_SIZE: usize = 1 + SALT_SIZE;
const KEY_LEN: usize = 32;
const CIPHER_TEXT_EXPANSION: usize = 4;
const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

// scrypt parameters: N = 32768, r = 8, p = 1.
const SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// An error produced while deciphering or re-enciphering a seed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AezeedError {
	/// The seed was produced by a codec version we do not understand.
	UnsupportedVersion(u8),
	/// The mnemonic's checksum does not cover its contents; a word is wrong or misordered.
	IncorrectMnemonic {
		/// The CRC32 computed over the mnemonic's payload.
		expected_checksum: u32,
		/// The CRC32 the mnemonic itself carries.
		actual_checksum: u32,
	},
	/// The envelope is intact but the passphrase cannot open it.
	InvalidPass,
	/// A word of the mnemonic is not part of the wordlist.
	UnknownMnemonicWord {
		/// The offending word.
		word: String,
		/// Its position within the mnemonic.
		index: usize,
	},
	/// The mnemonic does not consist of exactly 24 words.
	InvalidMnemonicWordCount(usize),
}

impl fmt::Display for AezeedError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			AezeedError::UnsupportedVersion(version) => write!(f, "unsupported seed version {}", version),
			AezeedError::IncorrectMnemonic { expected_checksum, actual_checksum } =>
				write!(f, "checksum mismatch: expected {:#010x}, got {:#010x}", expected_checksum, actual_checksum),
			AezeedError::InvalidPass => write!(f, "invalid passphrase"),
			AezeedError::UnknownMnemonicWord { word, index } => write!(f, "word {} (\"{}\") is not in the wordlist", index, word),
			AezeedError::InvalidMnemonicWordCount(count) => write!(f, "expected {} words, got {}", NUM_MNEMONIC_WORDS, count),
		}
	}
}

fn stretch_key(passphrase: Option<&[u8]>, salt: &[u8; SALT_SIZE]) -> [u8; KEY_LEN] {
	let passphrase = passphrase.unwrap_or(DEFAULT_PASSPHRASE);
	let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, KEY_LEN)
		.expect("the fixed scrypt parameters are valid");
	let mut key = [0u8; KEY_LEN];
	scrypt::scrypt(passphrase, salt, &params, &mut key)
		.expect("the output length matches the parameters");
	key
}

/// A deciphered wallet seed: the entropy itself, the wallet's birthday and the salt its
/// enciphered form is keyed under.
///
/// The entropy is wiped when the value is dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherSeed {
	internal_version: u8,
	/// Days between the bitcoin genesis block and the wallet's creation, bounding rescans.
	pub birthday: u16,
	entropy: [u8; ENTROPY_SIZE],
	salt: [u8; SALT_SIZE],
}

impl Drop for CipherSeed {
	fn drop(&mut self) {
		self.entropy.zeroize();
	}
}

impl core::fmt::Debug for CipherSeed {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("CipherSeed")
			.field("internal_version", &self.internal_version)
			.field("birthday", &self.birthday)
			.field("entropy", &"<redacted>")
			.field("salt", &"<redacted>")
			.finish()
	}
}

impl CipherSeed {
	/// Creates a fresh seed. When `entropy` is `None` it is drawn from the entropy source; the
	/// salt always is.
	pub fn new<ES: EntropySource + ?Sized>(birthday: u16, entropy: Option<[u8; ENTROPY_SIZE]>, entropy_source: &ES) -> CipherSeed {
		let entropy = entropy.unwrap_or_else(|| {
			let mut bytes = [0u8; ENTROPY_SIZE];
			bytes.copy_from_slice(&entropy_source.get_secure_random_bytes()[..ENTROPY_SIZE]);
			bytes
		});
		let mut salt = [0u8; SALT_SIZE];
		salt.copy_from_slice(&entropy_source.get_secure_random_bytes()[..SALT_SIZE]);
		CipherSeed {
			internal_version: CIPHER_SEED_VERSION,
			birthday,
			entropy,
			salt,
		}
	}

	/// The wallet entropy this seed protects.
	pub fn entropy(&self) -> &[u8; ENTROPY_SIZE] {
		&self.entropy
	}

	/// The wallet's birthday as an absolute UNIX timestamp.
	pub fn birthday_time(&self) -> u64 {
		BITCOIN_GENESIS_DATE + self.birthday as u64 * SECONDS_PER_DAY
	}

	/// Enciphers the seed under the given passphrase (or [`DEFAULT_PASSPHRASE`]), producing the
	/// 33-byte envelope the mnemonic encodes.
	pub fn encipher(&self, passphrase: Option<&[u8]>) -> [u8; ENCIPHERED_CIPHER_SEED_SIZE] {
		let mut plaintext = [0u8; DECIPHERED_CIPHER_SEED_SIZE];
		plaintext[0] = self.internal_version;
		plaintext[1..3].copy_from_slice(&self.birthday.to_be_bytes());
		plaintext[3..19].copy_from_slice(&self.entropy);

		let mut ad = [0u8; AD_SIZE];
		ad[0] = self.internal_version;
		ad[1..].copy_from_slice(&self.salt);

		let mut key = stretch_key(passphrase, &self.salt);
		let mut ciphertext = Aez::new(&key).encrypt(b"", &ad, CIPHER_TEXT_EXPANSION, &plaintext);
		key.zeroize();
		plaintext.zeroize();
		debug_assert_eq!(ciphertext.len(), DECIPHERED_CIPHER_SEED_SIZE + CIPHER_TEXT_EXPANSION);

		let mut enciphered = [0u8; ENCIPHERED_CIPHER_SEED_SIZE];
		enciphered[0] = self.internal_version;
		enciphered[1..24].copy_from_slice(&ciphertext);
		enciphered[24..29].copy_from_slice(&self.salt);
		let checksum = crc32fast::hash(&enciphered[..29]);
		enciphered[29..33].copy_from_slice(&checksum.to_be_bytes());
		ciphertext.zeroize();
		enciphered
	}

	fn decipher(enciphered: &[u8; ENCIPHERED_CIPHER_SEED_SIZE], passphrase: Option<&[u8]>) -> Result<CipherSeed, AezeedError> {
		if enciphered[0] != CIPHER_SEED_VERSION {
			return Err(AezeedError::UnsupportedVersion(enciphered[0]));
		}

		let mut actual = [0u8; CHECKSUM_SIZE];
		actual.copy_from_slice(&enciphered[29..33]);
		let actual_checksum = u32::from_be_bytes(actual);
		let expected_checksum = crc32fast::hash(&enciphered[..29]);
		if expected_checksum != actual_checksum {
			return Err(AezeedError::IncorrectMnemonic { expected_checksum, actual_checksum });
		}

		let mut salt = [0u8; SALT_SIZE];
		salt.copy_from_slice(&enciphered[24..29]);
		let mut ad = [0u8; AD_SIZE];
		ad[0] = enciphered[0];
		ad[1..].copy_from_slice(&salt);

		let mut key = stretch_key(passphrase, &salt);
		let plaintext = Aez::new(&key).decrypt(b"", &ad, CIPHER_TEXT_EXPANSION, &enciphered[1..24]);
		key.zeroize();
		let mut plaintext = plaintext.ok_or(AezeedError::InvalidPass)?;
		debug_assert_eq!(plaintext.len(), DECIPHERED_CIPHER_SEED_SIZE);

		let mut entropy = [0u8; ENTROPY_SIZE];
		entropy.copy_from_slice(&plaintext[3..19]);
		let seed = CipherSeed {
			internal_version: plaintext[0],
			birthday: u16::from_be_bytes([plaintext[1], plaintext[2]]),
			entropy,
			salt,
		};
		plaintext.zeroize();
		Ok(seed)
	}

	/// Renders the enciphered seed as a 24-word English mnemonic.
	pub fn to_mnemonic(&self, passphrase: Option<&[u8]>) -> Mnemonic {
		self.to_mnemonic_in(Language::English, passphrase)
	}

	/// Renders the enciphered seed as a 24-word mnemonic in the given wordlist.
	pub fn to_mnemonic_in(&self, language: Language, passphrase: Option<&[u8]>) -> Mnemonic {
		Mnemonic::from_enciphered_bytes(language, &self.encipher(passphrase))
	}
}

#[inline]
fn get_bit(buf: &[u8], idx: usize) -> u16 {
	((buf[idx / 8] >> (7 - idx % 8)) & 1) as u16
}

#[inline]
fn set_bit(buf: &mut [u8], idx: usize) {
	buf[idx / 8] |= 1 << (7 - idx % 8);
}

/// A 24-word encoding of an enciphered seed.
///
/// The 33 envelope bytes are read as a big-endian bit stream, 11 bits per word, each indexing
/// into the wordlist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mnemonic {
	words: Vec<String>,
	language: Language,
}

impl fmt::Display for Mnemonic {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		for (idx, word) in self.words.iter().enumerate() {
			if idx != 0 {
				write!(f, " ")?;
			}
			write!(f, "{}", word)?;
		}
		Ok(())
	}
}

impl FromStr for Mnemonic {
	type Err = AezeedError;

	fn from_str(s: &str) -> Result<Mnemonic, AezeedError> {
		Mnemonic::from_words(s.split_whitespace().map(|word| word.to_owned()).collect())
	}
}

impl Mnemonic {
	/// Wraps 24 English words as a mnemonic. The words are only validated against the wordlist
	/// when the mnemonic is deciphered.
	pub fn from_words(words: Vec<String>) -> Result<Mnemonic, AezeedError> {
		Mnemonic::from_words_in(Language::English, words)
	}

	/// Wraps 24 words of the given wordlist as a mnemonic.
	pub fn from_words_in(language: Language, words: Vec<String>) -> Result<Mnemonic, AezeedError> {
		if words.len() != NUM_MNEMONIC_WORDS {
			return Err(AezeedError::InvalidMnemonicWordCount(words.len()));
		}
		Ok(Mnemonic { words, language })
	}

	/// The mnemonic's words, in order.
	pub fn words(&self) -> &[String] {
		&self.words
	}

	fn from_enciphered_bytes(language: Language, enciphered: &[u8; ENCIPHERED_CIPHER_SEED_SIZE]) -> Mnemonic {
		let wordlist = language.words_by_prefix("");
		let mut words = Vec::with_capacity(NUM_MNEMONIC_WORDS);
		for word_idx in 0..NUM_MNEMONIC_WORDS {
			let mut index = 0u16;
			for bit in 0..BITS_PER_WORD {
				index = (index << 1) | get_bit(enciphered, word_idx * BITS_PER_WORD + bit);
			}
			words.push(wordlist[index as usize].to_owned());
		}
		Mnemonic { words, language }
	}

	/// Packs the words back into the 33-byte envelope, MSB first, 11 bits per word.
	fn to_enciphered_bytes(&self) -> Result<[u8; ENCIPHERED_CIPHER_SEED_SIZE], AezeedError> {
		let wordlist = self.language.words_by_prefix("");
		let mut enciphered = [0u8; ENCIPHERED_CIPHER_SEED_SIZE];
		for (word_idx, word) in self.words.iter().enumerate() {
			let index = wordlist.binary_search(&word.as_str())
				.map_err(|_| AezeedError::UnknownMnemonicWord { word: word.clone(), index: word_idx })?;
			for bit in 0..BITS_PER_WORD {
				if index & (1 << (BITS_PER_WORD - 1 - bit)) != 0 {
					set_bit(&mut enciphered, word_idx * BITS_PER_WORD + bit);
				}
			}
		}
		Ok(enciphered)
	}

	/// Maps the mnemonic back to a [`CipherSeed`], verifying the checksum and deciphering with
	/// the given passphrase (or [`DEFAULT_PASSPHRASE`]).
	pub fn to_cipher_seed(&self, passphrase: Option<&[u8]>) -> Result<CipherSeed, AezeedError> {
		let enciphered = self.to_enciphered_bytes()?;
		CipherSeed::decipher(&enciphered, passphrase)
	}

	/// Deciphers with the old passphrase and re-enciphers the same entropy and birthday under
	/// the new one, with a freshly generated salt. The resulting mnemonic shares no words
	/// structure with the old one.
	pub fn change_passphrase<ES: EntropySource + ?Sized>(
		&self, old_passphrase: Option<&[u8]>, new_passphrase: Option<&[u8]>, entropy_source: &ES,
	) -> Result<Mnemonic, AezeedError> {
		let seed = self.to_cipher_seed(old_passphrase)?;
		let reseeded = CipherSeed::new(seed.birthday, Some(seed.entropy), entropy_source);
		Ok(reseeded.to_mnemonic_in(self.language, new_passphrase))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::util::test_utils::TestEntropySource;

	use proptest::prelude::*;

	fn entropy_source() -> TestEntropySource {
		TestEntropySource::new([99u8; 32])
	}

	fn test_seed() -> CipherSeed {
		let entropy: [u8; 16] = core::array::from_fn(|i| i as u8);
		CipherSeed::new(0, Some(entropy), &entropy_source())
	}

	#[test]
	fn seed_roundtrip_through_mnemonic() {
		let seed = test_seed();
		let mnemonic = seed.to_mnemonic(None);
		assert_eq!(mnemonic.words().len(), NUM_MNEMONIC_WORDS);

		let recovered = mnemonic.to_cipher_seed(None).unwrap();
		assert_eq!(recovered.entropy(), seed.entropy());
		assert_eq!(recovered.birthday, 0);
		assert_eq!(recovered.birthday_time(), BITCOIN_GENESIS_DATE);
	}

	#[test]
	fn wrong_passphrase_is_rejected() {
		let mnemonic = test_seed().to_mnemonic(None);
		assert_eq!(mnemonic.to_cipher_seed(Some(b"bad")).unwrap_err(), AezeedError::InvalidPass);
	}

	#[test]
	fn passphrases_other_than_default_work() {
		let seed = test_seed();
		let mnemonic = seed.to_mnemonic(Some(b"pass"));
		assert_eq!(mnemonic.to_cipher_seed(Some(b"pass")).unwrap().entropy(), seed.entropy());
		assert_eq!(mnemonic.to_cipher_seed(None).unwrap_err(), AezeedError::InvalidPass);
	}

	#[test]
	fn changed_word_is_caught_by_the_checksum() {
		let mnemonic = test_seed().to_mnemonic(None);
		let mut words: Vec<String> = mnemonic.words().to_vec();

		// Swap the last word for its wordlist neighbour.
		let wordlist = Language::English.words_by_prefix("");
		let last = words.last().unwrap().clone();
		let idx = wordlist.binary_search(&last.as_str()).unwrap();
		let neighbour = if idx + 1 < wordlist.len() { wordlist[idx + 1] } else { wordlist[idx - 1] };
		*words.last_mut().unwrap() = neighbour.to_owned();

		let tampered = Mnemonic::from_words(words).unwrap();
		match tampered.to_cipher_seed(None).unwrap_err() {
			AezeedError::IncorrectMnemonic { expected_checksum, actual_checksum } => {
				assert_ne!(expected_checksum, actual_checksum);
			},
			err => panic!("unexpected error {:?}", err),
		}
	}

	#[test]
	fn change_passphrase_keeps_entropy() {
		let seed = test_seed();
		let mnemonic = seed.to_mnemonic(None);
		let changed = mnemonic.change_passphrase(None, Some(b"newpass"), &entropy_source()).unwrap();
		assert_ne!(mnemonic, changed);

		let recovered = changed.to_cipher_seed(Some(b"newpass")).unwrap();
		assert_eq!(recovered.entropy(), seed.entropy());
		assert_eq!(recovered.birthday, seed.birthday);

		// The old passphrase no longer opens the new mnemonic.
		assert_eq!(changed.to_cipher_seed(None).unwrap_err(), AezeedError::InvalidPass);
	}

	#[test]
	fn every_bitflip_is_rejected() {
		// CRC32 catches any single flipped bit before the KDF ever runs, whether the flip hits
		// the payload or the checksum itself.
		let enciphered = test_seed().encipher(None);
		for bit in 8..ENCIPHERED_CIPHER_SEED_SIZE * 8 {
			let mut tampered = enciphered;
			tampered[bit / 8] ^= 1 << (7 - bit % 8);
			match CipherSeed::decipher(&tampered, None).unwrap_err() {
				AezeedError::IncorrectMnemonic { expected_checksum, actual_checksum } => {
					assert_ne!(expected_checksum, actual_checksum, "bit {}", bit);
				},
				err => panic!("unexpected error {:?} for bit {}", err, bit),
			}
		}

		// Flips in the version byte surface as an unsupported version instead.
		let mut tampered = enciphered;
		tampered[0] ^= 1;
		assert_eq!(CipherSeed::decipher(&tampered, None).unwrap_err(), AezeedError::UnsupportedVersion(1));
	}

	#[test]
	fn unknown_word_is_reported_with_its_position() {
		let mnemonic = test_seed().to_mnemonic(None);
		let mut words = mnemonic.words().to_vec();
		words[7] = "definitelynotaword".to_owned();
		let err = Mnemonic::from_words(words).unwrap().to_cipher_seed(None).unwrap_err();
		assert_eq!(err, AezeedError::UnknownMnemonicWord { word: "definitelynotaword".to_owned(), index: 7 });
	}

	#[test]
	fn word_count_is_validated() {
		assert_eq!(
			Mnemonic::from_str("too few words").unwrap_err(),
			AezeedError::InvalidMnemonicWordCount(3)
		);
	}

	#[test]
	fn display_and_parse_are_inverses() {
		let mnemonic = test_seed().to_mnemonic(None);
		let parsed = Mnemonic::from_str(&mnemonic.to_string()).unwrap();
		assert_eq!(mnemonic, parsed);
	}

	proptest! {
		#[test]
		fn mnemonic_bit_packing_roundtrips(bytes in proptest::array::uniform32(any::<u8>()), last in any::<u8>()) {
			// Any 33-byte string maps to 24 words and back without loss; 24 * 11 bits cover
			// exactly 264 bits.
			let mut enciphered = [0u8; ENCIPHERED_CIPHER_SEED_SIZE];
			enciphered[..32].copy_from_slice(&bytes);
			enciphered[32] = last;

			let mnemonic = Mnemonic::from_enciphered_bytes(Language::English, &enciphered);
			prop_assert_eq!(mnemonic.words().len(), NUM_MNEMONIC_WORDS);
			prop_assert_eq!(mnemonic.to_enciphered_bytes().unwrap(), enciphered);
		}
	}
}
