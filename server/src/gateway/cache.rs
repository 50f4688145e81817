//! C11 tiered path-resolution cache (spec.md §3 "Cache keys", §4.10 step 3).
//! Every entry carries a CID tag and an MFS-path tag; invalidating either
//! tag (or bumping the global token) expires it. Grounded on the teacher's
//! `core/webserver.rs::CertResolver` cache shape (`RwLock<HashMap<..>>`
//! with lazy eviction) generalized to multiple value kinds and tag-based
//! invalidation instead of a single flat map.

use std::collections::HashMap;

use parking_lot::RwLock;

#[derive(Debug, Clone)]
pub enum CacheValue {
	/// `ls:<cid>:<dirLower>` - directory entries, on-disk case.
	Listing(Vec<String>),
	/// `resolve:<cid>:<inputLower>` - the actual-cased corrected path.
	Resolved(String),
	/// `exists:<cid>:<corrected>` - whether the corrected path exists.
	Exists(bool),
	/// `cid:<mfsPath>` - the current CID of an MFS tree.
	Cid(String),
	/// `local:<cid>` - whether this CID is served from the local gateway
	/// (as opposed to proxied through an external one).
	Local(bool),
}

struct Entry {
	value: CacheValue,
	cid_tag: Option<String>,
	mfs_tag: Option<String>,
	token: u64,
}

#[derive(Default)]
pub struct TieredCache {
	entries: RwLock<HashMap<String, Entry>>,
	global_token: RwLock<u64>,
}

impl TieredCache {
	pub fn new() -> Self {
		Self::default()
	}

	fn current_token(&self) -> u64 {
		*self.global_token.read()
	}

	pub fn get(&self, key: &str) -> Option<CacheValue> {
		let token = self.current_token();
		let entries = self.entries.read();
		match entries.get(key) {
			Some(e) if e.token == token => Some(e.value.clone()),
			_ => None,
		}
	}

	pub fn put(&self, key: impl Into<String>, value: CacheValue, cid_tag: Option<&str>, mfs_tag: Option<&str>) {
		let token = self.current_token();
		self.entries.write().insert(
			key.into(),
			Entry { value, cid_tag: cid_tag.map(String::from), mfs_tag: mfs_tag.map(String::from), token },
		);
	}

	/// Drops every cached entry (used when configuration changes in a way
	/// that invalidates assumptions baked into cache keys, e.g. a domain's
	/// site leaf changing).
	pub fn invalidate_all(&self) {
		*self.global_token.write() += 1;
	}

	/// Drops every entry tagged with `cid` (republish, IPNS promotion).
	pub fn invalidate_cid(&self, cid: &str) {
		self.entries.write().retain(|_, e| e.cid_tag.as_deref() != Some(cid));
	}

	/// `invalidateMfsCascade(path)` (spec.md §4.10): drops entries tagged at
	/// `path` or any ancestor of `path`, since a mutation at `path` also
	/// changes what every ancestor directory listing reports.
	pub fn invalidate_mfs_cascade(&self, path: &str) {
		self.entries.write().retain(|_, e| match &e.mfs_tag {
			Some(tag) => !is_ancestor_or_equal(tag, path),
			None => true,
		});
	}
}

fn is_ancestor_or_equal(ancestor: &str, path: &str) -> bool {
	if ancestor == path {
		return true;
	}
	let prefix = if ancestor.ends_with('/') { ancestor.to_string() } else { format!("{ancestor}/") };
	path.starts_with(&prefix)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn put_then_get_round_trips() {
		let cache = TieredCache::new();
		cache.put("resolve:cid1:/app.js", CacheValue::Resolved("/App.js".into()), Some("cid1"), Some("/app.js"));
		let hit = cache.get("resolve:cid1:/app.js");
		assert!(matches!(hit, Some(CacheValue::Resolved(ref p)) if p == "/App.js"));
	}

	#[test]
	fn invalidate_cid_drops_tagged_entries() {
		let cache = TieredCache::new();
		cache.put("exists:cid1:/x", CacheValue::Exists(true), Some("cid1"), Some("/x"));
		cache.invalidate_cid("cid1");
		assert!(cache.get("exists:cid1:/x").is_none());
	}

	#[test]
	fn invalidate_mfs_cascade_drops_ancestors() {
		let cache = TieredCache::new();
		cache.put("ls:cid1:/", CacheValue::Listing(vec!["assets".into()]), Some("cid1"), Some("/"));
		cache.put("ls:cid1:/assets", CacheValue::Listing(vec!["app.js".into()]), Some("cid1"), Some("/assets"));
		cache.invalidate_mfs_cascade("/assets/app.js");
		assert!(cache.get("ls:cid1:/").is_none());
		assert!(cache.get("ls:cid1:/assets").is_none());
	}

	#[test]
	fn invalidate_all_bumps_token() {
		let cache = TieredCache::new();
		cache.put("cid:/production/sites/example.com", CacheValue::Cid("bafy1".into()), None, None);
		cache.invalidate_all();
		assert!(cache.get("cid:/production/sites/example.com").is_none());
	}
}

// vim: ts=4
