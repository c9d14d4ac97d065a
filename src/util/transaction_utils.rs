// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use bitcoin::transaction::TxOut;

use core::cmp::Ordering;

/// Sorts the given outputs into the canonical (BIP 69) on-chain order, value first, script second.
/// Each output carries an opaque tag which travels with it; `tie_breaker` disambiguates outputs
/// which are byte-identical on-chain (eg two HTLCs to the same hash and amount, which differ only
/// in their CLTV expiry).
pub fn sort_outputs<T, C: Fn(&T, &T) -> Ordering>(outputs: &mut Vec<(TxOut, T)>, tie_breaker: C) {
	outputs.sort_unstable_by(|a, b| {
		a.0.value.cmp(&b.0.value).then_with(|| {
			a.0.script_pubkey[..].cmp(&b.0.script_pubkey[..]).then_with(|| {
				tie_breaker(&a.1, &b.1)
			})
		})
	});
}

#[cfg(test)]
mod tests {
	use super::*;

	use bitcoin::amount::Amount;
	use bitcoin::script::{Builder, ScriptBuf};
	use bitcoin::transaction::TxOut;

	#[test]
	fn sort_output_by_value() {
		let txout1 = TxOut {
			value: Amount::from_sat(100),
			script_pubkey: Builder::new().push_int(0).into_script(),
		};
		let txout1_ = txout1.clone();

		let txout2 = TxOut {
			value: Amount::from_sat(99),
			script_pubkey: Builder::new().push_int(0).into_script(),
		};
		let txout2_ = txout2.clone();

		let mut outputs = vec![(txout1, "ignore"), (txout2, "ignore")];
		sort_outputs(&mut outputs, |_, _| unreachable!());

		assert_eq!(&outputs, &vec![(txout2_, "ignore"), (txout1_, "ignore")]);
	}

	#[test]
	fn sort_output_by_script_pubkey() {
		let txout1 = TxOut {
			value: Amount::from_sat(100),
			script_pubkey: Builder::new().push_int(3).into_script(),
		};
		let txout1_ = txout1.clone();

		let txout2 = TxOut {
			value: Amount::from_sat(100),
			script_pubkey: Builder::new().push_int(1).push_int(2).into_script(),
		};
		let txout2_ = txout2.clone();

		let mut outputs = vec![(txout1, "ignore"), (txout2, "ignore")];
		sort_outputs(&mut outputs, |_, _| unreachable!());

		assert_eq!(&outputs, &vec![(txout2_, "ignore"), (txout1_, "ignore")]);
	}

	#[test]
	fn sort_output_tie_breaker_test() {
		let txout1 = TxOut {
			value: Amount::from_sat(100),
			script_pubkey: ScriptBuf::new(),
		};
		let txout1_ = txout1.clone();

		let txout2 = txout1.clone();
		let txout2_ = txout1.clone();

		let mut outputs = vec![(txout1, 420), (txout2, 69)];
		sort_outputs(&mut outputs, |a, b| a.cmp(b));

		assert_eq!(&outputs, &vec![(txout2_, 69), (txout1_, 420)]);
	}
}
