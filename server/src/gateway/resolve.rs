//! C11 host -> content-root mapping and case-insensitive path resolution
//! with tiered caching (spec.md §4.10, §3 "Cache keys"). New code - the
//! teacher's proxy routes by a flat `ProxySiteEntry` lookup with no path
//! resolution step - grounded on that lookup shape (`crates/
//! cloudillo-proxy/src/lib.rs`'s `proxy_sites: RwLock<HashMap<...>>`) for
//! the host-lookup half, generalized with the node's `ls`/HEAD calls for
//! the path-resolution half.

use http_body_util::BodyExt;
use hyper::Method;

use crate::config::ConfigService;
use crate::node::Node;
use crate::prelude::*;

use super::cache::{CacheValue, TieredCache};

const SITES_PARENT: &str = "/production/sites";
const PINNED_PARENT: &str = "/production/pinned";

/// Where a request's content comes from: a live published site, or a
/// domain's pointer bundle (serving under a wildcard-authorized IPNS host).
pub struct ContentRoot {
	pub mfs_path: String,
	pub cid: String,
	pub ipns_name: Option<String>,
}

/// Resolves `host` to its content root, or `None` if the host is not a
/// mapped domain and not authorized under the wildcard-IPNS rule (spec.md
/// §4.10 "serve non-content paths (admin/UI) or 404").
pub async fn resolve_content_root(
	config: &ConfigService,
	node: &Node,
	cache: &TieredCache,
	host: &str,
) -> ClResult<Option<ContentRoot>> {
	let cfg = config.get().await;

	if let Some(rec) = cfg.domains.get(host) {
		let Some(cid) = rec.last_published_cid.clone() else { return Ok(None) };
		let mfs_path = format!("{SITES_PARENT}/{}", rec.site_folder_leaf);
		return Ok(Some(ContentRoot { mfs_path, cid, ipns_name: None }));
	}

	if let Some(rec) = cfg.resolve_wildcard_host(host) {
		let mfs_path = format!("{PINNED_PARENT}/{}", rec.tgp_folder_leaf);
		let cid = current_cid_of(node, cache, &mfs_path).await?;
		return Ok(Some(ContentRoot { mfs_path, cid, ipns_name: rec.ipns_key_name.clone() }));
	}

	Ok(None)
}

/// `cid:<mfsPath>` cache tier: the current CID of an MFS tree that isn't
/// tracked by a domain's `lastPublishedCid` field (wildcard pointer roots).
async fn current_cid_of(node: &Node, cache: &TieredCache, mfs_path: &str) -> ClResult<String> {
	let key = format!("cid:{mfs_path}");
	if let Some(CacheValue::Cid(cid)) = cache.get(&key) {
		return Ok(cid);
	}
	let stat = node.files_stat(mfs_path).await?;
	cache.put(key, CacheValue::Cid(stat.hash.clone()), Some(&stat.hash), Some(mfs_path));
	Ok(stat.hash)
}

/// Case-insensitive path resolution under a content root (spec.md §4.10
/// steps 1-3, invariant #8). Returns the actual on-disk-cased path, or
/// `None` if no case-variant of `requested` exists under `cid`.
pub async fn resolve_path(
	node: &Node,
	cache: &TieredCache,
	cid: &str,
	mfs_path: &str,
	requested: &str,
) -> ClResult<Option<String>> {
	let requested = requested.trim_start_matches('/');
	let input_lower = requested.to_ascii_lowercase();
	let resolve_key = format!("resolve:{cid}:{input_lower}");

	if let Some(CacheValue::Resolved(p)) = cache.get(&resolve_key) {
		return Ok(Some(p));
	}
	if let Some(CacheValue::Exists(false)) = cache.get(&format!("exists:{cid}:{input_lower}")) {
		return Ok(None);
	}

	// Step 1: try the requested path as-given.
	if head_exists(node, cid, requested).await? {
		cache_hit(cache, cid, mfs_path, &input_lower, requested);
		return Ok(Some(requested.to_string()));
	}

	// Step 2: walk the directory tree segment by segment, lowercasing.
	let corrected = walk_case_insensitive(node, cache, cid, mfs_path, requested).await?;
	match corrected {
		Some(path) => {
			cache_hit(cache, cid, mfs_path, &input_lower, &path);
			Ok(Some(path))
		}
		None => {
			cache.put(
				format!("exists:{cid}:{input_lower}"),
				CacheValue::Exists(false),
				Some(cid),
				Some(mfs_path),
			);
			Ok(None)
		}
	}
}

fn cache_hit(cache: &TieredCache, cid: &str, mfs_path: &str, input_lower: &str, corrected: &str) {
	cache.put(
		format!("resolve:{cid}:{input_lower}"),
		CacheValue::Resolved(corrected.to_string()),
		Some(cid),
		Some(mfs_path),
	);
	cache.put(
		format!("exists:{cid}:{corrected}"),
		CacheValue::Exists(true),
		Some(cid),
		Some(mfs_path),
	);
}

async fn head_exists(node: &Node, cid: &str, path: &str) -> ClResult<bool> {
	let cid_path = if path.is_empty() { cid.to_string() } else { format!("{cid}/{path}") };
	let uri = node.gateway_url(&cid_path);
	let body = http_body_util::Empty::new()
		.map_err(|_: std::convert::Infallible| Error::Internal("empty body is infallible".into()))
		.boxed();
	let req = hyper::Request::builder().method(Method::HEAD).uri(&uri).body(body)?;
	match node.send_raw(req).await {
		Ok(resp) => Ok(resp.status().is_success()),
		Err(_) => Ok(false),
	}
}

async fn walk_case_insensitive(
	node: &Node,
	cache: &TieredCache,
	cid: &str,
	mfs_path: &str,
	requested: &str,
) -> ClResult<Option<String>> {
	if requested.is_empty() {
		return Ok(Some(String::new()));
	}
	let segments: Vec<&str> = requested.split('/').collect();
	let mut resolved_segments: Vec<String> = Vec::with_capacity(segments.len());
	let mut dir_path = String::new();

	for (i, seg) in segments.iter().enumerate() {
		let is_last = i == segments.len() - 1;
		let dir_lower = dir_path.to_ascii_lowercase();
		let listing = list_dir(node, cache, cid, mfs_path, &dir_path, &dir_lower).await?;

		let seg_lower = seg.to_ascii_lowercase();
		let Some(actual) = listing.iter().find(|e| e.to_ascii_lowercase() == seg_lower) else {
			return Ok(None);
		};
		resolved_segments.push(actual.clone());

		if !is_last {
			dir_path =
				if dir_path.is_empty() { actual.clone() } else { format!("{dir_path}/{actual}") };
		}
	}

	Ok(Some(resolved_segments.join("/")))
}

async fn list_dir(
	node: &Node,
	cache: &TieredCache,
	cid: &str,
	mfs_path: &str,
	dir_path: &str,
	dir_lower: &str,
) -> ClResult<Vec<String>> {
	let key = format!("ls:{cid}:{dir_lower}");
	if let Some(CacheValue::Listing(entries)) = cache.get(&key) {
		return Ok(entries);
	}
	let cid_path = if dir_path.is_empty() { cid.to_string() } else { format!("{cid}/{dir_path}") };
	let entries = node.unixfs_ls(&cid_path).await?;
	cache.put(key, CacheValue::Listing(entries.clone()), Some(cid), Some(mfs_path));
	Ok(entries)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sites_and_pinned_parents_are_single_segments_joined_correctly() {
		assert_eq!(format!("{SITES_PARENT}/leaf"), "/production/sites/leaf");
		assert_eq!(format!("{PINNED_PARENT}/leaf"), "/production/pinned/leaf");
	}
}

// vim: ts=4
