//! C7/C8 worker pipeline: the eleven-step publish sequence that turns a
//! staged upload into a live, pinned, IPNS-published site (spec.md §4.7).
//! New code grounded on the teacher's stat/pin/restate discipline as seen
//! in `core/acme.rs` (hash-then-pin pattern) and `config.rs`'s
//! temp-then-persist durability idiom, generalized to the node's MFS API.

use crate::config::{safe_leaf, now_unix, ConfigService};
use crate::formats::{pointer_index_html, TgpJson, IpnsKeyFile, LEGAL_MD};
use crate::node::Node;
use crate::prelude::*;

use super::queue::PublishJob;

const SITES_PARENT: &str = "/production/sites";
const PINNED_PARENT: &str = "/production/pinned";
const LEGACY_STAGING_MAX_AGE_SECS: i64 = 20 * 60;

pub async fn run(node: &Node, config: &ConfigService, job: &PublishJob) -> ClResult<()> {
	let index_path = format!("{}/index.html", job.staging_root);
	node.files_stat(&index_path).await.map_err(|_| {
		Error::ValidationError("staged content has no root index.html".into())
	})?;

	let new_site_stat = node.files_stat(&job.staging_root).await?;
	node.pin_add(&new_site_stat.hash, true).await?;

	let site_path = format!("{SITES_PARENT}/{}", job.site_leaf);
	swap_in_staging(node, &site_path, &job.staging_root).await?;

	let site_stat = node.files_stat(&site_path).await?;
	node.pin_add(&site_stat.hash, true).await?;
	let mut final_site_cid = site_stat.hash;

	let tgp_folder = format!("{PINNED_PARENT}/{}", job.tgp_leaf);
	node.files_mkdir(&tgp_folder, true).await?;
	write_tgp_bundle(node, &tgp_folder, &final_site_cid).await?;

	let tgp_stat = node.files_stat(&tgp_folder).await?;
	node.pin_add(&tgp_stat.hash, true).await?;
	let mut final_tgp_cid = tgp_stat.hash;

	let (key_name, peer_id) = ensure_ipns_key(node, config, &job.domain).await?;

	if let Some((new_site_cid, new_tgp_cid)) =
		apply_self_reference(node, &site_path, &tgp_folder, &final_site_cid, &peer_id).await?
	{
		node.pin_rm(&final_site_cid).await.ok();
		node.pin_rm(&final_tgp_cid).await.ok();
		final_site_cid = new_site_cid;
		final_tgp_cid = new_tgp_cid;
	}

	node.name_publish(&key_name, &final_tgp_cid).await?;

	config
		.update(|cfg| {
			let rec = cfg
				.domains
				.get_mut(&job.domain)
				.ok_or_else(|| Error::UnknownDomain(job.domain.clone()))?;
			rec.site_folder_leaf = job.site_leaf.clone();
			rec.tgp_folder_leaf = job.tgp_leaf.clone();
			rec.ipns_key_name = Some(key_name.clone());
			rec.ipns_peer_id = Some(peer_id.clone());
			rec.last_published_cid = Some(final_site_cid.clone());
			rec.last_published_at = Some(now_unix());
			Ok(())
		})
		.await?;

	cleanup_legacy_staging(node).await;

	Ok(())
}

/// Renames the current live site to a timestamped legacy-staging folder
/// (recoverable, swept up by `cleanup_legacy_staging` after 20 minutes)
/// before moving the freshly staged tree into place (spec.md §4.7 step 3).
async fn swap_in_staging(node: &Node, site_path: &str, staging_root: &str) -> ClResult<()> {
	if node.files_stat(site_path).await.is_ok() {
		let backup = format!("{site_path}.staging.{}", now_unix());
		node.files_mv_or_copy(site_path, &backup).await?;
	}
	node.files_mv_or_copy(staging_root, site_path).await
}

async fn write_tgp_bundle(node: &Node, tgp_folder: &str, site_cid: &str) -> ClResult<()> {
	let tgp = TgpJson::new(site_cid);
	node.files_write_bytes(&format!("{tgp_folder}/tgp.json"), tgp.to_bytes()?.into()).await?;
	node.files_write_bytes(&format!("{tgp_folder}/index.html"), pointer_index_html(None).into_bytes().into())
		.await?;
	node.files_write_bytes(&format!("{tgp_folder}/legal.md"), LEGAL_MD.as_bytes().to_vec().into()).await
}

/// Ensures an IPNS key exists for the domain, creating one named
/// `tg-<safeLeaf>` if the config has none yet (spec.md §4.7 step 7).
async fn ensure_ipns_key(node: &Node, config: &ConfigService, domain: &str) -> ClResult<(String, String)> {
	let cfg = config.get().await;
	let rec = cfg.domains.get(domain).ok_or_else(|| Error::UnknownDomain(domain.to_string()))?;

	if let (Some(name), Some(peer_id)) = (&rec.ipns_key_name, &rec.ipns_peer_id) {
		return Ok((name.clone(), peer_id.clone()));
	}

	let key_name = rec.ipns_key_name.clone().unwrap_or_else(|| format!("tg-{}", safe_leaf(domain)));
	let existing = node.key_list().await?;
	let peer_id = match existing.into_iter().find(|(name, _)| name == &key_name) {
		Some((_, id)) => id,
		None => node.key_gen(&key_name).await?,
	};

	Ok((key_name, peer_id))
}

/// IPNS self-reference rule (spec.md §4.7 step 8): if the site's
/// `ipns-key.json` is missing or stale, rewrite it, restate the site and
/// `tgp.json`, and return the new `(siteCid, tgpCid)` pair.
async fn apply_self_reference(
	node: &Node,
	site_path: &str,
	tgp_folder: &str,
	site_cid: &str,
	peer_id: &str,
) -> ClResult<Option<(String, String)>> {
	let key_file_path = format!("{site_path}/ipns-key.json");
	let current = node.gateway_get(&format!("{site_cid}/ipns-key.json")).await.ok();
	let needs_update = match current.as_ref().and_then(|b| IpnsKeyFile::parse(b).ok()) {
		Some(existing) => existing.ipns_key != peer_id,
		None => true,
	};
	if !needs_update {
		return Ok(None);
	}

	let payload = IpnsKeyFile { ipns_key: peer_id.to_string() };
	node.files_write_bytes(&key_file_path, payload.to_bytes()?.into()).await?;

	let new_site_stat = node.files_stat(site_path).await?;
	node.pin_add(&new_site_stat.hash, true).await?;

	let tgp = TgpJson::new(&new_site_stat.hash);
	node.files_write_bytes(&format!("{tgp_folder}/tgp.json"), tgp.to_bytes()?.into()).await?;
	let new_tgp_stat = node.files_stat(tgp_folder).await?;
	node.pin_add(&new_tgp_stat.hash, true).await?;

	Ok(Some((new_site_stat.hash, new_tgp_stat.hash)))
}

/// Best-effort cleanup of `<site>.staging.<unixSeconds>` backups older than
/// 20 minutes (spec.md §4.7 step 11).
async fn cleanup_legacy_staging(node: &Node) {
	let entries = match node.files_ls(SITES_PARENT).await {
		Ok(e) => e,
		Err(e) => {
			debug!("legacy staging cleanup: failed to list {}: {}", SITES_PARENT, e);
			return;
		}
	};

	let now = now_unix();
	for entry in entries {
		let Some((_, ts)) = entry.name.split_once(".staging.") else { continue };
		let Ok(created_at) = ts.parse::<i64>() else { continue };
		if now - created_at < LEGACY_STAGING_MAX_AGE_SECS {
			continue;
		}
		let path = format!("{SITES_PARENT}/{}", entry.name);
		if let Err(e) = node.files_rm(&path, true).await {
			debug!("legacy staging cleanup: failed to remove {}: {}", path, e);
		}
	}
}

// vim: ts=4
