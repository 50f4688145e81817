//! C11 on-the-fly HTML rewriting and cache-control classification
//! (spec.md §4.10). New code - the teacher's proxy never post-processes
//! response bodies - built with `regex` per spec.md §9's explicit sanction
//! of a regex-based approach "because inputs are well-formed emitted HTML,
//! not arbitrary user markup". All rewrites are idempotent: running twice
//! must not double-prefix a URL or double-inject a script.

use std::sync::LazyLock;

use regex::{Captures, Regex};

const CLEANUP_SCRIPT_MARKER: &str = "data-truthgate-cleanup";
const RUNTIME_SCRIPT_MARKER: &str = "data-truthgate-runtime";

fn static_regex(pattern: &str) -> Regex {
	Regex::new(pattern).unwrap_or_else(|_| unreachable!("static rewrite pattern is always valid: {pattern}"))
}

static HEAD_OPEN: LazyLock<Regex> = LazyLock::new(|| static_regex(r"(?i)<head[^>]*>"));
static HEAD_CLOSE: LazyLock<Regex> = LazyLock::new(|| static_regex(r"(?i)</head>"));
static BODY_CLOSE: LazyLock<Regex> = LazyLock::new(|| static_regex(r"(?i)</body>"));
static BASE_TAG: LazyLock<Regex> = LazyLock::new(|| static_regex(r"(?i)<base\s"));

/// Matches `href|src|action="/path"` attributes with a root-relative value
/// (single leading slash, not protocol-relative `//`).
static ATTR_URL: LazyLock<Regex> =
	LazyLock::new(|| static_regex(r#"(?i)\b(href|src|action)=(["'])(/(?:[^/][^"']*)?)\2"#));

const UPDATE_CRITICAL_NAMES: &[&str] = &[
	"index.html",
	"manifest.json",
	"blazor.boot.json",
	"service-worker-assets.js",
	"asset-manifest.json",
	"vite-manifest.json",
	"build-manifest.json",
	"service-worker.js",
	"sw.js",
];

const QUERY_EXCEPTION_EXTS: &[&str] = &[".json", ".js", ".webmanifest"];

fn path_extension_is(path: &str, exts: &[&str]) -> bool {
	let path_only = path.split('?').next().unwrap_or(path);
	let lower = path_only.to_ascii_lowercase();
	exts.iter().any(|ext| lower.ends_with(ext))
}

fn file_name(path: &str) -> &str {
	path.rsplit('/').next().unwrap_or(path)
}

/// Classifies a response by spec.md §4.10's cache-policy table. `is_static`
/// is the caller's own classification of "this response role is static"
/// (e.g. assets served under a fixed content-addressed CID never change).
pub fn cache_control_for(path: &str, content_type: &str, is_static: bool) -> Option<&'static str> {
	let name = file_name(path);
	let is_update_critical = content_type.eq_ignore_ascii_case("text/html")
		|| name.eq_ignore_ascii_case("index.html")
		|| name.ends_with(".webmanifest")
		|| name.ends_with(".wasm")
		|| name.ends_with(".dll")
		|| UPDATE_CRITICAL_NAMES.iter().any(|n| name.eq_ignore_ascii_case(n));

	if is_update_critical {
		return Some("no-cache, must-revalidate");
	}
	if is_static {
		return Some("public, max-age=86400, must-revalidate");
	}
	None
}

/// Rewrite context: the content-addressed base prefix content is served
/// under (e.g. `/ipfs/<cid>/`), the CID or naming key for query tagging,
/// and the current unix timestamp for the `ts=` cache-busting parameter.
pub struct RewriteContext<'a> {
	pub prefix: &'a str,
	pub cid: Option<&'a str>,
	pub ipns_name: Option<&'a str>,
	pub now_unix: i64,
}

/// Rewrites an HTML document to resolve root-relative URLs through a
/// content-addressed base (spec.md §4.10). Only called when serving under a
/// content-addressed base prefix, never for admin/API responses.
pub fn rewrite_html(html: &str, ctx: &RewriteContext<'_>) -> String {
	let mut out = inject_base_href(html, ctx.prefix);
	out = rewrite_attribute_urls(&out, ctx);
	out = inject_cleanup_script(&out);
	out = inject_runtime_script(&out, ctx.prefix);
	out
}

fn inject_base_href(html: &str, prefix: &str) -> String {
	if BASE_TAG.is_match(html) {
		return html.to_string();
	}
	let Some(m) = HEAD_OPEN.find(html) else { return html.to_string() };
	let mut out = String::with_capacity(html.len() + 64);
	out.push_str(&html[..m.end()]);
	out.push_str(&format!(r#"<base href="{prefix}">"#));
	out.push_str(&html[m.end()..]);
	out
}

fn rewrite_attribute_urls(html: &str, ctx: &RewriteContext<'_>) -> String {
	ATTR_URL
		.replace_all(html, |caps: &Captures| {
			let attr = &caps[1];
			let quote = &caps[2];
			let path = &caps[3];

			if path_extension_is(path, QUERY_EXCEPTION_EXTS) {
				if path.contains("tgcid=") || path.contains("tgipns=") {
					return caps[0].to_string();
				}
				let mut qp = Vec::new();
				if let Some(cid) = ctx.cid {
					qp.push(format!("tgcid={cid}"));
				} else if let Some(name) = ctx.ipns_name {
					qp.push(format!("tgipns={name}"));
				}
				qp.push(format!("ts={}", ctx.now_unix));
				let sep = if path.contains('?') { "&" } else { "?" };
				return format!("{attr}={quote}{path}{sep}{}{quote}", qp.join("&"));
			}

			if path.starts_with(ctx.prefix) {
				return caps[0].to_string();
			}
			let rest = path.trim_start_matches('/');
			format!("{attr}={quote}{}{rest}{quote}", ctx.prefix)
		})
		.into_owned()
}

fn inject_cleanup_script(html: &str) -> String {
	if html.contains(CLEANUP_SCRIPT_MARKER) {
		return html.to_string();
	}
	let Some(m) = HEAD_CLOSE.find(html) else { return html.to_string() };
	let script = format!(
		r#"<script {CLEANUP_SCRIPT_MARKER}="1">
(function() {{
  if ('serviceWorker' in navigator) {{
    navigator.serviceWorker.getRegistrations().then(function(rs) {{
      rs.forEach(function(r) {{ r.unregister(); }});
    }});
  }}
  if (window.caches && caches.keys) {{
    caches.keys().then(function(keys) {{ keys.forEach(function(k) {{ caches.delete(k); }}); }});
  }}
  if (window.indexedDB && indexedDB.databases) {{
    indexedDB.databases().then(function(dbs) {{
      dbs.forEach(function(db) {{ if (db.name) indexedDB.deleteDatabase(db.name); }});
    }});
  }}
}})();
</script>
"#
	);
	let mut out = String::with_capacity(html.len() + script.len());
	out.push_str(&html[..m.start()]);
	out.push_str(&script);
	out.push_str(&html[m.start()..]);
	out
}

fn inject_runtime_script(html: &str, prefix: &str) -> String {
	if html.contains(RUNTIME_SCRIPT_MARKER) {
		return html.to_string();
	}
	let Some(m) = BODY_CLOSE.find(html) else { return html.to_string() };
	let script = format!(
		r#"<script {RUNTIME_SCRIPT_MARKER}="1">
(function() {{
  var PREFIX = {prefix:?};
  function blocked(url) {{
    return /^(https?:\/\/)?(127\.0\.0\.1|localhost):5001\b/i.test(url);
  }}
  function qualify(url) {{
    if (typeof url !== 'string') return url;
    if (/^https?:\/\//i.test(url) || url.indexOf('//') === 0) return url;
    if (/\.(json|js|webmanifest)(\?|$)/i.test(url) && url.indexOf('/') === 0) return url;
    if (url.indexOf(PREFIX) === 0) return url;
    if (url.indexOf('/') === 0) return PREFIX + url.slice(1);
    return url;
  }}
  var origFetch = window.fetch;
  if (origFetch) {{
    window.fetch = function(input, init) {{
      if (typeof input === 'string') {{
        if (blocked(input)) return Promise.reject(new Error('blocked origin'));
        input = qualify(input);
      }}
      return origFetch.call(this, input, init);
    }};
  }}
  var origOpen = XMLHttpRequest.prototype.open;
  XMLHttpRequest.prototype.open = function(method, url) {{
    if (blocked(url)) throw new Error('blocked origin');
    arguments[1] = qualify(url);
    return origOpen.apply(this, arguments);
  }};
  var OrigWebSocket = window.WebSocket;
  if (OrigWebSocket) {{
    window.WebSocket = function(url, protocols) {{
      if (blocked(url)) throw new Error('blocked origin');
      return protocols === undefined
        ? new OrigWebSocket(qualify(url))
        : new OrigWebSocket(qualify(url), protocols);
    }};
    window.WebSocket.prototype = OrigWebSocket.prototype;
  }}
  document.addEventListener('click', function(ev) {{
    var a = ev.target && ev.target.closest ? ev.target.closest('a[href]') : null;
    if (!a) return;
    var href = a.getAttribute('href');
    if (href && href.indexOf('/') === 0 && href.indexOf(PREFIX) !== 0) {{
      a.setAttribute('href', qualify(href));
    }}
  }}, true);
}})();
</script>
"#
	);
	let mut out = String::with_capacity(html.len() + script.len());
	out.push_str(&html[..m.start()]);
	out.push_str(&script);
	out.push_str(&html[m.start()..]);
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ctx<'a>(prefix: &'a str, cid: &'a str) -> RewriteContext<'a> {
		RewriteContext { prefix, cid: Some(cid), ipns_name: None, now_unix: 1_700_000_000 }
	}

	#[test]
	fn injects_base_href_after_head() {
		let html = "<html><head><title>x</title></head><body></body></html>";
		let out = rewrite_html(html, &ctx("/ipfs/bafy123/", "bafy123"));
		assert!(out.contains(r#"<base href="/ipfs/bafy123/">"#));
	}

	#[test]
	fn does_not_double_inject_base_href() {
		let html = r#"<html><head><base href="/custom/"><title>x</title></head><body></body></html>"#;
		let out = rewrite_html(html, &ctx("/ipfs/bafy123/", "bafy123"));
		assert_eq!(out.matches("<base").count(), 1);
	}

	#[test]
	fn rewrites_script_src_under_prefix() {
		// `.js` falls under the query-exception rule (spec.md §4.10): it is
		// never path-prefixed, only query-tagged, like the `.webmanifest`
		// case below.
		let html = r#"<html><head></head><body><script src="/app.js"></script></body></html>"#;
		let out = rewrite_html(html, &ctx("/ipfs/bafy123/", "bafy123"));
		assert!(out.contains(r#"src="/app.js?tgcid=bafy123&ts=1700000000""#));
	}

	#[test]
	fn appends_query_for_json_manifest_instead_of_prefixing() {
		let html = r#"<html><head><link rel="manifest" href="/app.webmanifest"></head><body></body></html>"#;
		let out = rewrite_html(html, &ctx("/ipfs/bafy123/", "bafy123"));
		assert!(out.contains(r#"href="/app.webmanifest?tgcid=bafy123&ts=1700000000""#));
	}

	#[test]
	fn rewrite_is_idempotent() {
		let html = r#"<html><head></head><body><script src="/app.js"></script></body></html>"#;
		let once = rewrite_html(html, &ctx("/ipfs/bafy123/", "bafy123"));
		let twice = rewrite_html(&once, &ctx("/ipfs/bafy123/", "bafy123"));
		assert_eq!(once, twice);
	}

	#[test]
	fn update_critical_classification() {
		assert_eq!(cache_control_for("/index.html", "text/html", false), Some("no-cache, must-revalidate"));
		assert_eq!(cache_control_for("/sw.js", "application/javascript", false), Some("no-cache, must-revalidate"));
		assert_eq!(cache_control_for("/app.css", "text/css", true), Some("public, max-age=86400, must-revalidate"));
		assert_eq!(cache_control_for("/app.css", "text/css", false), None);
	}
}

// vim: ts=4
