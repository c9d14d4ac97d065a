// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

use crate::sign::EntropySource;
use crate::util::logger::{Logger, Level, Record};

use bitcoin::hashes::{Hash, HashEngine};
use bitcoin::hashes::sha256::Hash as Sha256;

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::Mutex;

pub struct TestLogger {
	level: Level,
	pub id: String,
	pub lines: Mutex<HashMap<(String, String), usize>>,
}

impl TestLogger {
	pub fn new() -> TestLogger {
		Self::with_id("".to_owned())
	}

	pub fn with_id(id: String) -> TestLogger {
		TestLogger {
			level: Level::Trace,
			id,
			lines: Mutex::new(HashMap::new()),
		}
	}

	pub fn enable(&mut self, level: Level) {
		self.level = level;
	}

	pub fn assert_log(&self, module: String, line: String, count: usize) {
		let log_entries = self.lines.lock().unwrap();
		assert_eq!(log_entries.get(&(module, line)), Some(&count));
	}
}

impl Logger for TestLogger {
	fn log(&self, record: &Record) {
		*self.lines.lock().unwrap().entry((record.module_path.to_string(), format!("{}", record.args))).or_insert(0) += 1;
		if record.level >= self.level {
			println!("{:<5} {} [{} : {}, {}] {}", record.level.to_string(), self.id, record.module_path, record.file, record.line, record.args);
		}
	}
}

/// An entropy source which hashes a counter with a fixed seed, giving a deterministic but
/// non-repeating stream.
pub struct TestEntropySource {
	seed: [u8; 32],
	counter: Cell<u64>,
}

impl TestEntropySource {
	pub fn new(seed: [u8; 32]) -> Self {
		TestEntropySource { seed, counter: Cell::new(0) }
	}
}

impl EntropySource for TestEntropySource {
	fn get_secure_random_bytes(&self) -> [u8; 32] {
		let n = self.counter.get();
		self.counter.set(n + 1);
		let mut sha = Sha256::engine();
		sha.input(&self.seed);
		sha.input(&n.to_be_bytes());
		Sha256::from_engine(sha).to_byte_array()
	}
}
