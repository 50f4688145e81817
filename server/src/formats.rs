//! Wire/file formats shared by the publish pipeline (C7/C8) and the
//! naming-key reconciler (C9): `tgp.json`, `.tgp-meta.json`, `ipns-key.json`
//! and the pointer bundle's `index.html` (spec.md §6.2, §6.3). New code -
//! no teacher file defines a sibling format - written in the teacher's
//! plain-struct-plus-serde idiom (see `config.rs::DomainRecord`).

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::prelude::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TgpJson {
	pub tgp: u32,
	pub ts: String,
	pub current: String,
	pub legal: String,
}

impl TgpJson {
	pub fn new(current_cid: &str) -> Self {
		TgpJson {
			tgp: 1,
			ts: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
			current: format!("/ipfs/{current_cid}"),
			legal: "/legal.md".to_string(),
		}
	}

	pub fn to_bytes(&self) -> ClResult<Vec<u8>> {
		Ok(serde_json::to_vec_pretty(self)?)
	}

	pub fn parse(bytes: &[u8]) -> ClResult<Self> {
		Ok(serde_json::from_slice(bytes)?)
	}

	/// Strips the leading `/ipfs/` prefix off `current`, spec.md §4.8 step 3.
	pub fn current_cid(&self) -> &str {
		self.current.strip_prefix("/ipfs/").unwrap_or(&self.current)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TgpMeta {
	#[serde(rename = "Kind")]
	pub kind: String,
	#[serde(rename = "PointerCid")]
	pub pointer_cid: String,
	#[serde(rename = "TargetCid")]
	pub target_cid: Option<String>,
}

impl TgpMeta {
	pub fn new(pointer_cid: impl Into<String>, target_cid: Option<String>) -> Self {
		TgpMeta { kind: "tgp-meta".to_string(), pointer_cid: pointer_cid.into(), target_cid }
	}

	pub fn to_bytes(&self) -> ClResult<Vec<u8>> {
		Ok(serde_json::to_vec_pretty(self)?)
	}

	pub fn parse(bytes: &[u8]) -> ClResult<Self> {
		Ok(serde_json::from_slice(bytes)?)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpnsKeyFile {
	#[serde(rename = "IpnsKey")]
	pub ipns_key: String,
}

impl IpnsKeyFile {
	pub fn to_bytes(&self) -> ClResult<Vec<u8>> {
		Ok(serde_json::to_vec_pretty(self)?)
	}

	pub fn parse(bytes: &[u8]) -> ClResult<Self> {
		Ok(serde_json::from_slice(bytes)?)
	}
}

const REDIRECT_DOC_CID: &str = "bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi";

/// Pointer bundle landing page (spec.md §6.3): fetches `tgp.json` from a few
/// candidate paths, extracts `current`, and renders a full-viewport iframe
/// pointing at a gateway redirect document with `?redirectURL=<current>`.
pub fn pointer_index_html(override_base: Option<&str>) -> String {
	let override_js = match override_base {
		Some(base) => format!("const OVERRIDE_BASE = {};", serde_json::to_string(base).unwrap_or_default()),
		None => "const OVERRIDE_BASE = null;".to_string(),
	};

	format!(
		r##"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>TruthGate</title>
<style>html,body,iframe{{margin:0;padding:0;width:100%;height:100%;border:0}}</style>
</head>
<body>
<script>
{override_js}
const CANDIDATES = ["/tgp.json", "./tgp.json", "../tgp.json"];
const REDIRECT_DOC = "https://dweb.link/ipfs/{REDIRECT_DOC_CID}";

async function loadTgp() {{
	for (const path of CANDIDATES) {{
		try {{
			const res = await fetch(path, {{cache: "no-store"}});
			if (res.ok) return await res.json();
		}} catch (e) {{ /* try next candidate */ }}
	}}
	throw new Error("no tgp.json found");
}}

async function resolveBase() {{
	if (!OVERRIDE_BASE) return REDIRECT_DOC;
	try {{
		const res = await fetch(OVERRIDE_BASE + "/index.html", {{method: "HEAD"}});
		if (res.ok) return OVERRIDE_BASE;
	}} catch (e) {{ /* fall through to default */ }}
	return REDIRECT_DOC;
}}

(async () => {{
	const tgp = await loadTgp();
	const base = await resolveBase();
	const frame = document.createElement("iframe");
	frame.src = base + "/index.html?redirectURL=" + encodeURIComponent(tgp.current);
	document.body.appendChild(frame);
}})().catch(err => {{
	document.body.textContent = "Unable to resolve content: " + err;
}});
</script>
</body>
</html>
"##
	)
}

pub const LEGAL_MD: &str = "# Legal\n\nThis page is served over a content-addressed, decentralized network via TruthGate.\n";

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tgp_json_round_trips() {
		let tgp = TgpJson::new("bafy123");
		let bytes = tgp.to_bytes().unwrap();
		let parsed = TgpJson::parse(&bytes).unwrap();
		assert_eq!(parsed.current_cid(), "bafy123");
	}

	#[test]
	fn tgp_meta_round_trips() {
		let meta = TgpMeta::new("bafyPointer", Some("bafyTarget".to_string()));
		let bytes = meta.to_bytes().unwrap();
		let parsed = TgpMeta::parse(&bytes).unwrap();
		assert_eq!(parsed.pointer_cid, "bafyPointer");
		assert_eq!(parsed.target_cid.as_deref(), Some("bafyTarget"));
	}

	#[test]
	fn pointer_index_html_embeds_override() {
		let html = pointer_index_html(Some("https://gw.example"));
		assert!(html.contains("gw.example"));
	}
}

// vim: ts=4
