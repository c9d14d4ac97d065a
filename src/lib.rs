// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The cryptographic and protocol core of a lightning node, in library form: the aezeed
//! wallet-seed codec, the channel commitment state machine, and force-close fund recovery.
//!
//! There is no networking, no chain access, no threading and no persistence in here. Every
//! protocol operation is a pure transformation of a [`ln::commitments::Commitments`] value, so
//! the user (you) decides how state gets persisted, how messages reach the peer and how
//! operations are serialized per channel. This makes the library a good candidate for tight
//! integration into an existing node or wallet rather than a self-contained daemon.
//!
//! The seed codec ([`aezeed`]) is independent of the channel machinery and is CPU-bound
//! (scrypt); callers on latency-sensitive threads should offload it.

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

extern crate bitcoin;

#[macro_use]
pub mod util;

pub mod aezeed;
pub mod ln;
pub mod sign;

pub(crate) mod crypto;
