//! An in-process key-value store with per-key expiry.
//!
//! Holds the short-lived state that never belongs in the ledger: shadow channel records while
//! their invoices are claimable, and the invoice spam counters that reset at UTC midnight.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
	expires_at: Instant,
	value: Vec<u8>,
}

/// An in-process TTL key-value store.
///
/// Expired entries are dropped lazily on access and swept opportunistically on writes; memory
/// use is bounded by the live key set.
pub struct EphemeralStore {
	inner: Mutex<HashMap<String, Entry>>,
}

impl Default for EphemeralStore {
	fn default() -> EphemeralStore {
		EphemeralStore::new()
	}
}

impl EphemeralStore {
	/// An empty store.
	pub fn new() -> EphemeralStore {
		EphemeralStore { inner: Mutex::new(HashMap::new()) }
	}

	/// Stores `value` under `key`, replacing any previous value and resetting the expiry.
	pub fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
		let mut map = self.inner.lock().unwrap();
		let now = Instant::now();
		map.retain(|_, e| e.expires_at > now);
		map.insert(key.to_owned(), Entry { expires_at: now + ttl, value });
	}

	/// The value under `key`, if present and not expired.
	pub fn get(&self, key: &str) -> Option<Vec<u8>> {
		let mut map = self.inner.lock().unwrap();
		match map.get(key) {
			Some(e) if e.expires_at > Instant::now() => Some(e.value.clone()),
			Some(_) => {
				map.remove(key);
				None
			},
			None => None,
		}
	}

	/// Removes `key`. Removing an absent key is fine.
	pub fn delete(&self, key: &str) {
		self.inner.lock().unwrap().remove(key);
	}

	/// Atomically increments the counter under `key` and returns the new count.
	///
	/// A fresh or expired counter starts at zero and gets the given ttl; incrementing a live
	/// counter keeps its original expiry.
	pub fn incr(&self, key: &str, ttl: Duration) -> u64 {
		let mut map = self.inner.lock().unwrap();
		let now = Instant::now();
		match map.get_mut(key) {
			Some(e) if e.expires_at > now => {
				let count = decode_counter(&e.value) + 1;
				e.value = count.to_le_bytes().to_vec();
				count
			},
			_ => {
				map.insert(
					key.to_owned(),
					Entry { expires_at: now + ttl, value: 1u64.to_le_bytes().to_vec() },
				);
				1
			},
		}
	}
}

fn decode_counter(value: &[u8]) -> u64 {
	match value.try_into() {
		Ok(bytes) => u64::from_le_bytes(bytes),
		Err(_) => 0,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::thread::sleep;

	#[test]
	fn set_get_delete() {
		let store = EphemeralStore::new();
		store.set("k", b"v".to_vec(), Duration::from_secs(60));
		assert_eq!(store.get("k"), Some(b"v".to_vec()));
		store.delete("k");
		assert_eq!(store.get("k"), None);
	}

	#[test]
	fn entries_expire() {
		let store = EphemeralStore::new();
		store.set("k", b"v".to_vec(), Duration::from_millis(20));
		assert!(store.get("k").is_some());
		sleep(Duration::from_millis(40));
		assert_eq!(store.get("k"), None);
	}

	#[test]
	fn counters_count_and_reset_after_expiry() {
		let store = EphemeralStore::new();
		assert_eq!(store.incr("c", Duration::from_millis(30)), 1);
		assert_eq!(store.incr("c", Duration::from_millis(30)), 2);
		assert_eq!(store.incr("c", Duration::from_millis(30)), 3);
		sleep(Duration::from_millis(60));
		assert_eq!(store.incr("c", Duration::from_millis(30)), 1);
	}

	#[test]
	fn expired_entries_are_swept_on_write() {
		let store = EphemeralStore::new();
		store.set("old", b"x".to_vec(), Duration::from_millis(10));
		sleep(Duration::from_millis(30));
		store.set("new", b"y".to_vec(), Duration::from_secs(60));
		assert_eq!(store.inner.lock().unwrap().len(), 1);
	}
}
