//! C9: Naming-Key Reconciler. Periodically resolves managed IPNS keys,
//! mirrors newly-pointed-to content into versioned pinned folders, and
//! prunes superseded versions (spec.md §4.8). New code grounded on the
//! publish pipeline's stat/pin/restate discipline (`publish/pipeline.rs`)
//! and the worker pool's semaphore-plus-mutex-table concurrency shape
//! (`core/worker.rs`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex as AsyncMutex, Semaphore};

use crate::config::ConfigService;
use crate::core::utils::random_id;
use crate::formats::TgpMeta;
use crate::node::Node;
use crate::prelude::*;

const PINNED_PARENT: &str = "/production/pinned";
const STAGING_PARENT: &str = "/production/.staging/ipns";
const DEFAULT_MAX_CONCURRENCY: usize = 4;
const DEFAULT_SCHEDULER_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// `scheduledPerKeyCooldown` (spec.md §4.8 "Configuration"): a scheduled pass
/// skips a key resolved more recently than this; a forced resolve bypasses it.
const SCHEDULED_PER_KEY_COOLDOWN: Duration = Duration::from_secs(10 * 60);

pub struct IpnsReconciler {
	node: Arc<Node>,
	config: Arc<ConfigService>,
	run_all_lock: AsyncMutex<()>,
	key_locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
	last_attempt: AsyncMutex<HashMap<String, Instant>>,
	slots: Arc<Semaphore>,
}

impl IpnsReconciler {
	pub fn new(node: Arc<Node>, config: Arc<ConfigService>) -> Arc<Self> {
		Arc::new(IpnsReconciler {
			node,
			config,
			run_all_lock: AsyncMutex::new(()),
			key_locks: AsyncMutex::new(HashMap::new()),
			last_attempt: AsyncMutex::new(HashMap::new()),
			slots: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENCY)),
		})
	}

	/// Spawns the scheduled pass loop, running once immediately at startup.
	pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
		tokio::spawn(async move {
			self.run_all(false).await;
			let mut ticker = tokio::time::interval(DEFAULT_SCHEDULER_INTERVAL);
			ticker.tick().await;
			loop {
				ticker.tick().await;
				self.run_all(false).await;
			}
		})
	}

	/// `run-all` pass: prevents two full passes from overlapping, cleans
	/// the staging parent at start and end (spec.md §4.8 "Staging cleanup").
	pub async fn run_all(&self, force_resolve: bool) {
		let _guard = self.run_all_lock.lock().await;
		self.reset_staging_parent().await;

		let names: Vec<String> = self.config.get().await.naming_keys.keys().cloned().collect();
		let mut handles = Vec::new();
		for name in names {
			let Ok(permit) = self.slots.clone().acquire_owned().await else { break };
			let lock = self.key_lock(&name).await;
			let node = self.node.clone();
			let config = self.config.clone();
			let due = self.due_for_scheduled_attempt(&name).await;
			handles.push(tokio::spawn(async move {
				let _permit = permit;
				let _key_guard = lock.lock().await;
				if !force_resolve && !due {
					enforce_pruning_by_name(&node, &config, &name).await;
					return;
				}
				if let Err(e) = process_one(&node, &config, &name, force_resolve).await {
					warn!("IPNS reconciler: key {} failed: {}", name, e);
				}
			}));
		}
		for handle in handles {
			let _ = handle.await;
		}

		self.reset_staging_parent().await;
	}

	/// Runs a single key's pipeline immediately, bypassing the scheduled
	/// per-key cooldown (an operator-triggered resolve, spec.md §4.8
	/// `forceResolve` parameter).
	pub async fn resolve_one(&self, name: &str) -> ClResult<()> {
		let lock = self.key_lock(name).await;
		let _key_guard = lock.lock().await;
		let result = process_one(&self.node, &self.config, name, true).await;
		self.last_attempt.lock().await.insert(name.to_string(), Instant::now());
		result
	}

	/// Whether a scheduled (non-forced) pass is allowed to resolve `name`
	/// now, i.e. it has not been attempted within `scheduledPerKeyCooldown`.
	async fn due_for_scheduled_attempt(&self, name: &str) -> bool {
		let mut attempts = self.last_attempt.lock().await;
		let due = attempts.get(name).is_none_or(|t| t.elapsed() >= SCHEDULED_PER_KEY_COOLDOWN);
		if due {
			attempts.insert(name.to_string(), Instant::now());
		}
		due
	}

	async fn key_lock(&self, name: &str) -> Arc<AsyncMutex<()>> {
		let mut locks = self.key_locks.lock().await;
		locks.entry(name.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
	}

	async fn reset_staging_parent(&self) {
		let _ = self.node.files_rm(STAGING_PARENT, true).await;
		if let Err(e) = self.node.files_mkdir(STAGING_PARENT, true).await {
			warn!("IPNS reconciler: failed to recreate staging parent: {}", e);
		}
	}
}

/// Looks up `name`'s `keepOldCidPinned` setting and runs pruning only -
/// used when a scheduled pass skips a key still under
/// `scheduledPerKeyCooldown` (spec.md §4.8 "Configuration").
async fn enforce_pruning_by_name(node: &Node, config: &ConfigService, name: &str) {
	let keep_old_cid_pinned = config.get().await.naming_keys.get(name).map(|e| e.keep_old_cid_pinned).unwrap_or(true);
	enforce_pruning(node, config, name, keep_old_cid_pinned).await;
}

async fn process_one(node: &Node, config: &ConfigService, name: &str, force_resolve: bool) -> ClResult<()> {
	let cfg = config.get().await;
	let Some(entry) = cfg.naming_keys.get(name).cloned() else { return Ok(()) };

	if !force_resolve && !entry.auto_update {
		enforce_pruning(node, config, name, entry.keep_old_cid_pinned).await;
		return Ok(());
	}

	let resolved = node.name_resolve(name).await?;
	let pointer_cid = first_ipfs_segment(&resolved)
		.ok_or_else(|| Error::ValidationError(format!("unexpected IPNS resolve path: {resolved}")))?;

	let tgp_target_cid = fetch_tgp_target(node, &pointer_cid).await;

	if entry.current_cid.as_deref() == Some(pointer_cid.as_str()) {
		enforce_pruning(node, config, name, entry.keep_old_cid_pinned).await;
		return Ok(());
	}

	let next_version = next_version_number(node, name).await?;
	let uid = random_id()?;
	let stage_path = format!("{STAGING_PARENT}/{name}/{uid}");
	if let Some(parent) = stage_path.rsplit_once('/').map(|(p, _)| p.to_string()) {
		node.files_mkdir(&parent, true).await?;
	}
	node.files_cp(&format!("/ipfs/{pointer_cid}"), &stage_path).await?;
	node.pin_add(&pointer_cid, true).await?;
	node.routing_provide(&pointer_cid).await;
	if let Some(target) = &tgp_target_cid {
		node.pin_add(target, true).await?;
		node.routing_provide(target).await;
	}

	let final_path = format!("{PINNED_PARENT}/{name}-v{next_version:03}");
	node.files_mv_or_copy(&stage_path, &final_path).await?;
	let meta = TgpMeta::new(pointer_cid.clone(), tgp_target_cid.clone());
	node.files_write_bytes(&format!("{final_path}/.tgp-meta.json"), meta.to_bytes()?.into()).await?;

	config
		.update(|cfg| {
			if let Some(e) = cfg.naming_keys.get_mut(name) {
				e.current_cid = Some(pointer_cid.clone());
			}
			Ok(())
		})
		.await?;

	enforce_pruning(node, config, name, entry.keep_old_cid_pinned).await;
	Ok(())
}

/// Reads `tgp.json` at the pointer CID, if any, and returns its `current`
/// target CID (spec.md §4.8 step 3). Best-effort: any failure is `None`.
async fn fetch_tgp_target(node: &Node, pointer_cid: &str) -> Option<String> {
	let bytes = node.gateway_get(&format!("{pointer_cid}/tgp.json")).await.ok()?;
	let tgp = crate::formats::TgpJson::parse(&bytes).ok()?;
	if tgp.tgp != 1 {
		return None;
	}
	Some(tgp.current_cid().to_string())
}

fn first_ipfs_segment(path: &str) -> Option<String> {
	let rest = path.strip_prefix("/ipfs/")?;
	Some(rest.split('/').next().unwrap_or(rest).to_string())
}

async fn next_version_number(node: &Node, name: &str) -> ClResult<u32> {
	let entries = match node.files_ls(PINNED_PARENT).await {
		Ok(e) => e,
		Err(_) => return Ok(1),
	};
	let prefix = format!("{name}-v");
	let max = entries
		.iter()
		.filter_map(|e| e.name.strip_prefix(&prefix))
		.filter_map(|n| n.parse::<u32>().ok())
		.max()
		.unwrap_or(0);
	Ok(max + 1)
}

/// Keeps only the highest-numbered `<name>-vNNN` folder, unpinning the
/// pointer/target CIDs recorded in each removed folder's sidecar
/// (spec.md §4.8 step 8).
async fn enforce_pruning(node: &Node, _config: &ConfigService, name: &str, keep_old_cid_pinned: bool) {
	if keep_old_cid_pinned {
		return;
	}
	let entries = match node.files_ls(PINNED_PARENT).await {
		Ok(e) => e,
		Err(e) => {
			debug!("IPNS pruning: failed to list {}: {}", PINNED_PARENT, e);
			return;
		}
	};

	let prefix = format!("{name}-v");
	let mut versions: Vec<(u32, String)> = entries
		.iter()
		.filter_map(|e| e.name.strip_prefix(&prefix).map(|n| (n, e.name.clone())))
		.filter_map(|(n, full)| n.parse::<u32>().ok().map(|v| (v, full)))
		.collect();
	versions.sort_by_key(|(v, _)| *v);

	let Some((highest, _)) = versions.last().copied() else { return };
	for (version, folder) in versions {
		if version == highest {
			continue;
		}
		let path = format!("{PINNED_PARENT}/{folder}");
		let meta_path = format!("{path}/.tgp-meta.json");
		if let Ok(bytes) = node.files_read(&meta_path).await {
			if let Ok(meta) = TgpMeta::parse(&bytes) {
				node.pin_rm(&meta.pointer_cid).await.ok();
				if let Some(target) = meta.target_cid {
					node.pin_rm(&target).await.ok();
				}
			}
		}
		if let Err(e) = node.files_rm(&path, true).await {
			debug!("IPNS pruning: failed to remove {}: {}", path, e);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn first_ipfs_segment_extracts_cid() {
		assert_eq!(first_ipfs_segment("/ipfs/bafy123/sub/path").as_deref(), Some("bafy123"));
		assert_eq!(first_ipfs_segment("/ipns/other"), None);
	}
}

// vim: ts=4
