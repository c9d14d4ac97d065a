// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The pure value-level view of one side's commitment transaction: which HTLCs it carries, how
//! the non-HTLC balance splits, and at which feerate it pays for itself. Staged updates are folded
//! into a spec by [`CommitmentSpec::reduce`] to obtain the spec of the *next* commitment.

use crate::ln::commitments::ChannelError;
use crate::ln::msgs::{UpdateAddHTLC, UpdateMessage};

/// Whether an HTLC flows towards or away from the owner of the spec it appears in.
///
/// Note that this is relative to the spec, not to us: in our counterparty's commitment spec, an
/// HTLC we offered is `Incoming`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HtlcDirection {
	/// The spec owner is the recipient; the counterparty offered this HTLC.
	Incoming,
	/// The spec owner offered this HTLC.
	Outgoing,
}

impl HtlcDirection {
	/// The same HTLC, seen from the other side of the channel.
	pub fn opposite(&self) -> HtlcDirection {
		match self {
			HtlcDirection::Incoming => HtlcDirection::Outgoing,
			HtlcDirection::Outgoing => HtlcDirection::Incoming,
		}
	}
}

/// An HTLC plus the direction it flows, relative to the owner of the containing spec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectedHtlc {
	/// Which way the HTLC flows.
	pub direction: HtlcDirection,
	/// The `update_add_htlc` which created it.
	pub add: UpdateAddHTLC,
}

/// One side's view of the channel balance: the HTLC set plus the plain balances and the feerate
/// the next commitment transaction will pay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitmentSpec {
	/// All HTLCs present in the commitment, including ones which will be trimmed to fees.
	pub htlcs: Vec<DirectedHtlc>,
	/// The feerate, in satoshi per 1000 weight units, the commitment transaction pays.
	pub feerate_per_kw: u32,
	/// The spec owner's plain balance, before subtracting the commitment fee.
	pub to_local_msat: u64,
	/// The counterparty's plain balance, before subtracting the commitment fee.
	pub to_remote_msat: u64,
}

impl CommitmentSpec {
	/// Finds the HTLC with the given id flowing in the given direction, if any.
	pub fn find_htlc(&self, direction: HtlcDirection, htlc_id: u64) -> Option<&DirectedHtlc> {
		self.htlcs.iter().find(|htlc| htlc.direction == direction && htlc.add.htlc_id == htlc_id)
	}

	fn add_htlc(&mut self, direction: HtlcDirection, add: &UpdateAddHTLC) {
		match direction {
			HtlcDirection::Outgoing => { self.to_local_msat -= add.amount_msat; },
			HtlcDirection::Incoming => { self.to_remote_msat -= add.amount_msat; },
		}
		self.htlcs.push(DirectedHtlc { direction, add: add.clone() });
	}

	/// Removes the settled HTLC and credits its value. On fulfill the value crosses the channel,
	/// on failure it returns to the side which offered it.
	fn settle_htlc(&mut self, direction: HtlcDirection, htlc_id: u64, fulfilled: bool) -> Result<(), ChannelError> {
		let pos = self.htlcs.iter().position(|htlc| htlc.direction == direction && htlc.add.htlc_id == htlc_id)
			.ok_or(ChannelError::UnknownHtlcId(htlc_id))?;
		let htlc = self.htlcs.remove(pos);
		match (direction, fulfilled) {
			(HtlcDirection::Incoming, true) => { self.to_local_msat += htlc.add.amount_msat; },
			(HtlcDirection::Incoming, false) => { self.to_remote_msat += htlc.add.amount_msat; },
			(HtlcDirection::Outgoing, true) => { self.to_remote_msat += htlc.add.amount_msat; },
			(HtlcDirection::Outgoing, false) => { self.to_local_msat += htlc.add.amount_msat; },
		}
		Ok(())
	}

	fn apply(&mut self, update: &UpdateMessage, from_owner: bool, owner_is_funder: bool) -> Result<(), ChannelError> {
		// An update settles HTLCs flowing *towards* its sender; its adds flow away from it.
		let added_direction = if from_owner { HtlcDirection::Outgoing } else { HtlcDirection::Incoming };
		let settled_direction = added_direction.opposite();
		match update {
			UpdateMessage::AddHTLC(msg) => {
				self.add_htlc(added_direction, msg);
			},
			UpdateMessage::FulfillHTLC(msg) => {
				self.settle_htlc(settled_direction, msg.htlc_id, true)?;
			},
			UpdateMessage::FailHTLC(msg) => {
				self.settle_htlc(settled_direction, msg.htlc_id, false)?;
			},
			UpdateMessage::FailMalformedHTLC(msg) => {
				self.settle_htlc(settled_direction, msg.htlc_id, false)?;
			},
			UpdateMessage::Fee(msg) => {
				let sender_is_funder = if from_owner { owner_is_funder } else { !owner_is_funder };
				if !sender_is_funder {
					return Err(ChannelError::FundeeCannotSendUpdateFee);
				}
				self.feerate_per_kw = msg.feerate_per_kw;
			},
		}
		Ok(())
	}

	/// Folds staged updates into this spec, producing the spec of the next commitment.
	///
	/// `owner_changes` are the updates sent by the owner of this spec, `counterparty_changes`
	/// those sent by the other side. Updates are applied in list order; the first failing update
	/// aborts the fold.
	pub fn reduce(&self, owner_changes: &[UpdateMessage], counterparty_changes: &[UpdateMessage], owner_is_funder: bool) -> Result<CommitmentSpec, ChannelError> {
		let mut spec = self.clone();
		for update in owner_changes.iter() {
			spec.apply(update, true, owner_is_funder)?;
		}
		for update in counterparty_changes.iter() {
			spec.apply(update, false, owner_is_funder)?;
		}
		Ok(spec)
	}
}
