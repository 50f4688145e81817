//! C8 intake half: `publishFromMultipartStream` (spec.md §4.7). Streams
//! multipart file parts straight into the content tree's `raw/` staging
//! folder (never buffers a whole request), then computes the path
//! normalization map before handing a `PublishJob` to the queue.

use axum::extract::Multipart;
use futures::stream::StreamExt;
use hyper::body::Frame;

use crate::core::utils::random_id;
use crate::config::ConfigService;
use crate::node::Node;
use crate::prelude::*;

use super::queue::{PublishJob, PublishQueue};

pub async fn publish_from_multipart(
	node: &Node,
	config: &ConfigService,
	queue: &PublishQueue,
	domain: &str,
	mut multipart: Multipart,
	note: Option<String>,
) -> ClResult<(String, usize)> {
	let cfg = config.get().await;
	let rec = cfg.domains.get(domain).ok_or_else(|| Error::UnknownDomain(domain.to_string()))?;
	let site_leaf = rec.site_folder_leaf.clone();
	let tgp_leaf = rec.tgp_folder_leaf.clone();

	let job_id = random_id()?;
	let staging_root = format!("/staging/sites/{site_leaf}/{job_id}");
	let raw_root = format!("{staging_root}/raw");
	node.files_mkdir(&raw_root, true).await?;

	let mut raw_paths: Vec<String> = Vec::new();

	while let Some(field) = multipart
		.next_field()
		.await
		.map_err(|e| Error::ValidationError(format!("invalid multipart body: {e}")))?
	{
		let Some(filename) = field.file_name().map(str::to_string) else { continue };
		let Some(cleaned) = clean_relative_path(&filename) else {
			node.files_rm(&staging_root, true).await.ok();
			return Err(Error::ValidationError(format!("unsafe file path in upload: {filename}")));
		};

		let dest = format!("{raw_root}/{cleaned}");
		if let Some(parent) = parent_mfs_path(&dest) {
			node.files_mkdir(&parent, true).await?;
		}

		let stream =
			field.map(|r| r.map(Frame::data).map_err(|e| std::io::Error::other(e.to_string())));
		node.files_write_stream(&dest, stream).await?;
		raw_paths.push(cleaned);
	}

	if raw_paths.is_empty() {
		node.files_rm(&staging_root, true).await.ok();
		return Err(Error::ValidationError("no files in upload".into()));
	}

	let mapping = match normalize_paths(&raw_paths) {
		Ok(m) => m,
		Err(e) => {
			node.files_rm(&staging_root, true).await.ok();
			return Err(e);
		}
	};
	let file_count = mapping.len();

	for (src, dst) in &mapping {
		node.files_mv_or_copy(&format!("{raw_root}/{src}"), &format!("{staging_root}/{dst}")).await?;
	}
	node.files_rm(&raw_root, true).await?;

	queue.enqueue(PublishJob {
		job_id: job_id.clone(),
		domain: domain.to_string(),
		site_leaf,
		tgp_leaf,
		staging_root,
		note,
	})?;

	Ok((job_id, file_count))
}

/// Backslashes to slashes, strips a leading `./`, rejects `.`/`..` segments
/// and absolute paths (spec.md §4.7 step 3).
fn clean_relative_path(raw: &str) -> Option<String> {
	let normalized = raw.replace('\\', "/");
	let trimmed = normalized.strip_prefix("./").unwrap_or(&normalized);
	let trimmed = trimmed.trim_start_matches('/');

	let mut segments = Vec::new();
	for seg in trimmed.split('/') {
		if seg.is_empty() || seg == "." || seg == ".." {
			return None;
		}
		segments.push(seg);
	}
	if segments.is_empty() {
		return None;
	}
	Some(segments.join("/"))
}

fn parent_mfs_path(path: &str) -> Option<String> {
	path.rfind('/').map(|i| path[..i].to_string())
}

/// Normalization map (spec.md §4.7 step 4): strip a shared first-folder
/// prefix, then fall back to the first `<X>/index.html` found, rejecting
/// the upload if no root `index.html` exists afterward.
fn normalize_paths(paths: &[String]) -> ClResult<Vec<(String, String)>> {
	let mut working: Vec<String> = paths.to_vec();

	if let Some(first_seg) = working.first().and_then(|p| p.split('/').next()) {
		if first_seg != "index.html"
			&& working.iter().all(|p| p.split('/').next() == Some(first_seg))
			&& working.iter().all(|p| p.contains('/'))
		{
			working = working
				.iter()
				.map(|p| p.splitn(2, '/').nth(1).unwrap_or_default().to_string())
				.collect();
		}
	}

	if !working.iter().any(|p| p == "index.html") {
		if let Some(found) = working
			.iter()
			.find(|p| {
				let mut segs = p.split('/');
				matches!((segs.next(), segs.next(), segs.next()), (Some(_), Some("index.html"), None))
			})
			.cloned()
		{
			let prefix_slash = format!("{}/", found.split('/').next().unwrap_or_default());
			working =
				working.iter().map(|p| p.strip_prefix(&prefix_slash).unwrap_or(p).to_string()).collect();
		}
	}

	if !working.iter().any(|p| p == "index.html") {
		return Err(Error::ValidationError("upload has no root index.html after normalization".into()));
	}

	Ok(paths.iter().cloned().zip(working).collect())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clean_relative_path_rejects_traversal() {
		assert_eq!(clean_relative_path("../etc/passwd"), None);
		assert_eq!(clean_relative_path("a/../b"), None);
		assert_eq!(clean_relative_path("./a/b.txt").as_deref(), Some("a/b.txt"));
		assert_eq!(clean_relative_path("a\\b\\c.txt").as_deref(), Some("a/b/c.txt"));
	}

	#[test]
	fn normalize_strips_common_prefix() {
		let paths = vec!["site/index.html".to_string(), "site/style.css".to_string()];
		let mapping = normalize_paths(&paths).unwrap();
		assert!(mapping.iter().any(|(_, dst)| dst == "index.html"));
	}

	#[test]
	fn normalize_falls_back_to_nested_index() {
		let paths = vec!["build/index.html".to_string(), "build/assets/app.js".to_string()];
		let mapping = normalize_paths(&paths).unwrap();
		assert!(mapping.iter().any(|(_, dst)| dst == "index.html"));
		assert!(mapping.iter().any(|(_, dst)| dst == "assets/app.js"));
	}

	#[test]
	fn normalize_rejects_missing_index() {
		let paths = vec!["about.html".to_string()];
		assert!(normalize_paths(&paths).is_err());
	}
}

// vim: ts=4
