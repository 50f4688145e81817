//! C2: ACME Challenge Store. In-memory token -> keyAuthorization mapping
//! with TTL, grounded on the teacher's `state.acme_challenge_map`
//! (`RwLock<HashMap<Box<str>, Box<str>>>>` in `core/acme.rs`), generalized
//! with a per-entry expiry per spec.md §4.2.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

#[derive(Debug)]
struct Entry {
	key_authz: Box<str>,
	expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct ChallengeStore {
	map: RwLock<HashMap<Box<str>, Entry>>,
}

impl ChallengeStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn put(&self, token: &str, key_authz: &str, ttl: Duration) {
		self.map.write().insert(
			token.into(),
			Entry { key_authz: key_authz.into(), expires_at: Instant::now() + ttl },
		);
	}

	/// Lazily evicts the entry if expired, otherwise returns the key
	/// authorization to serve at `/.well-known/acme-challenge/{token}`.
	pub fn try_get(&self, token: &str) -> Option<Box<str>> {
		let mut map = self.map.write();
		match map.get(token) {
			Some(entry) if entry.expires_at > Instant::now() => Some(entry.key_authz.clone()),
			Some(_) => {
				map.remove(token);
				None
			}
			None => None,
		}
	}

	pub fn remove(&self, token: &str) {
		self.map.write().remove(token);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn put_then_get_returns_value() {
		let store = ChallengeStore::new();
		store.put("tok1", "authz1", Duration::from_secs(60));
		assert_eq!(store.try_get("tok1").as_deref(), Some("authz1"));
	}

	#[test]
	fn expired_entry_returns_none() {
		let store = ChallengeStore::new();
		store.put("tok1", "authz1", Duration::from_millis(0));
		std::thread::sleep(Duration::from_millis(5));
		assert_eq!(store.try_get("tok1"), None);
	}

	#[test]
	fn missing_token_returns_none() {
		let store = ChallengeStore::new();
		assert_eq!(store.try_get("nope"), None);
	}

	#[test]
	fn remove_evicts_entry() {
		let store = ChallengeStore::new();
		store.put("tok1", "authz1", Duration::from_secs(60));
		store.remove("tok1");
		assert_eq!(store.try_get("tok1"), None);
	}
}

// vim: ts=4
