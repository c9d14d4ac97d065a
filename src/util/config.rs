// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Configuration knobs for how a channel reacts to its counterparty.

/// Options which apply on a per-channel basis.
#[derive(Copy, Clone, Debug)]
pub struct ChannelConfig {
	/// The maximum ratio, in either direction, which we will tolerate between a counterparty's
	/// `update_fee` and our own view of the current feerate before considering the channel unusable.
	///
	/// An `update_fee` with `max(theirs / ours, ours / theirs)` above this value is rejected.
	///
	/// Default value: 2.0
	pub max_fee_rate_mismatch_ratio: f64,
}

impl Default for ChannelConfig {
	/// Provides sane defaults for most configurations (but with zero relay fees!)
	fn default() -> Self {
		ChannelConfig {
			max_fee_rate_mismatch_ratio: 2.0,
		}
	}
}
