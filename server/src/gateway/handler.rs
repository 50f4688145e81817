//! C11 proxy-forwarding handler: resolves a request against its content
//! root, forwards it to the embedded node's local HTTP gateway, and (for
//! `text/html` responses) applies on-the-fly rewriting before returning.
//! Grounded on the teacher's `proxy/handler.rs` hop-by-hop header stripping
//! and header-copy shape, adapted for a fixed content-addressed backend
//! instead of an arbitrary configured one.

use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use http_body_util::BodyExt;

use crate::app::App;
use crate::prelude::*;

use super::resolve::{resolve_content_root, resolve_path};
use super::rewrite::{cache_control_for, rewrite_html, RewriteContext};

pub(crate) const HOP_BY_HOP_HEADERS: &[&str] = &[
	"connection",
	"keep-alive",
	"proxy-authenticate",
	"proxy-authorization",
	"te",
	"trailers",
	"transfer-encoding",
];

/// Conditional-GET headers the proxy strips on the outbound request (spec.md
/// §4.10 "strips conditional-GET headers ... to avoid spurious 304s from the
/// node"). `If-*` is a prefix match; the other two are exact.
fn is_conditional_get_header(name: &HeaderName) -> bool {
	let s = name.as_str();
	s.len() > 3 && s[..3].eq_ignore_ascii_case("if-")
		|| s.eq_ignore_ascii_case("cache-control")
		|| s.eq_ignore_ascii_case("pragma")
}

pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
	HOP_BY_HOP_HEADERS.iter().any(|h| name.as_str().eq_ignore_ascii_case(h))
}

/// Headers forwarded on to the node (spec.md §4.10 "forwards others"):
/// everything except hop-by-hop and conditional-GET headers, and `host`
/// (which must reflect the node's own address, not the public one).
fn copy_request_headers(src: &HeaderMap) -> HeaderMap {
	let mut dst = HeaderMap::new();
	for (name, value) in src.iter() {
		if is_hop_by_hop(name) || is_conditional_get_header(name) || name == header::HOST {
			continue;
		}
		dst.append(name.clone(), value.clone());
	}
	dst
}

fn copy_response_headers(src: &HeaderMap) -> HeaderMap {
	let mut dst = HeaderMap::new();
	for (name, value) in src.iter() {
		if is_hop_by_hop(name) {
			continue;
		}
		dst.append(name.clone(), value.clone());
	}
	dst
}

/// Permissive CORS (spec.md §4.10 "Sets permissive CORS").
fn apply_cors(headers: &mut HeaderMap) {
	headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
	headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, HEAD, OPTIONS"));
	headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
}

/// Rewrites a `Location:` response header pointing at the node's own gateway
/// back to the public origin (spec.md §4.10 "rewrites Location: pointing at
/// local node back to the public origin").
fn rewrite_location(headers: &mut HeaderMap, gateway_base: &str, public_host: &str) {
	let Some(loc) = headers.get(header::LOCATION).and_then(|v| v.to_str().ok()) else { return };
	if let Some(rest) = loc.strip_prefix(gateway_base) {
		let rewritten = format!("https://{public_host}{rest}");
		if let Ok(hv) = HeaderValue::from_str(&rewritten) {
			headers.insert(header::LOCATION, hv);
		}
	}
}

fn now_unix() -> i64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// Serves a request under its resolved content root: case-insensitive path
/// resolution (spec.md §4.10 steps 1-3), proxying to the node's gateway, and
/// - for `text/html` responses - on-the-fly rewriting (step 4). Returns
/// `Ok(None)` when `host` is not a content-routed host at all, so the caller
/// can fall through to the admin/API router or a plain 404.
pub async fn serve_content(
	app: &App,
	host: &str,
	method: &Method,
	path: &str,
	request_headers: &HeaderMap,
) -> ClResult<Option<Response>> {
	let cache = &app.gateway_cache;
	let Some(root) = resolve_content_root(&app.config, &app.node, cache, host).await? else {
		return Ok(None);
	};

	let corrected = resolve_path(&app.node, cache, &root.cid, &root.mfs_path, path).await?;
	let Some(corrected) = corrected else {
		return Ok(Some(StatusCode::NOT_FOUND.into_response()));
	};

	let cid_path = if corrected.is_empty() { root.cid.clone() } else { format!("{}/{corrected}", root.cid) };
	let uri = app.node.gateway_url(&cid_path);

	let body = http_body_util::Empty::new()
		.map_err(|_: std::convert::Infallible| Error::Internal("empty body is infallible".into()))
		.boxed();
	let mut req = hyper::Request::builder().method(method.clone()).uri(&uri).body(body)?;
	*req.headers_mut() = copy_request_headers(request_headers);

	let resp = app.node.send_raw(req).await?;
	let status = resp.status();
	let mut headers = copy_response_headers(resp.headers());
	apply_cors(&mut headers);
	rewrite_location(&mut headers, app.node.gateway_base(), host);

	let content_type = headers
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.unwrap_or("application/octet-stream")
		.to_string();

	if let Some(cc) = cache_control_for(&corrected, &content_type, false) {
		headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(cc));
	}

	let is_html = content_type
		.split(';')
		.next()
		.map(|m| m.trim().eq_ignore_ascii_case("text/html"))
		.unwrap_or(false);

	if is_html {
		let collected = resp
			.into_body()
			.collect()
			.await
			.map_err(|_| Error::NodeError("failed to read node response body".into()))?
			.to_bytes();
		let html = String::from_utf8_lossy(&collected);
		let prefix = format!("/ipfs/{}/", root.cid);
		let ctx = RewriteContext {
			prefix: &prefix,
			cid: Some(root.cid.as_str()),
			ipns_name: root.ipns_name.as_deref(),
			now_unix: now_unix(),
		};
		let rewritten = rewrite_html(&html, &ctx);
		headers.remove(header::CONTENT_LENGTH);
		let mut response = Response::new(Body::from(rewritten));
		*response.status_mut() = status;
		*response.headers_mut() = headers;
		return Ok(Some(response));
	}

	let mut response = Response::new(Body::new(resp.into_body()));
	*response.status_mut() = status;
	*response.headers_mut() = headers;
	Ok(Some(response))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hop_by_hop_headers_are_recognized() {
		assert!(is_hop_by_hop(&HeaderName::from_static("connection")));
		assert!(is_hop_by_hop(&HeaderName::from_static("transfer-encoding")));
		assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
	}

	#[test]
	fn conditional_get_headers_are_recognized() {
		assert!(is_conditional_get_header(&HeaderName::from_static("if-none-match")));
		assert!(is_conditional_get_header(&HeaderName::from_static("if-modified-since")));
		assert!(is_conditional_get_header(&HeaderName::from_static("cache-control")));
		assert!(is_conditional_get_header(&HeaderName::from_static("pragma")));
		assert!(!is_conditional_get_header(&HeaderName::from_static("accept")));
	}

	#[test]
	fn request_headers_drop_conditional_hop_by_hop_and_host() {
		let mut src = HeaderMap::new();
		src.insert(header::HOST, HeaderValue::from_static("node.local"));
		src.insert(header::IF_NONE_MATCH, HeaderValue::from_static("\"abc\""));
		src.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
		src.insert(header::ACCEPT, HeaderValue::from_static("text/html"));
		let dst = copy_request_headers(&src);
		assert!(!dst.contains_key(header::HOST));
		assert!(!dst.contains_key(header::IF_NONE_MATCH));
		assert!(!dst.contains_key(header::CONNECTION));
		assert!(dst.contains_key(header::ACCEPT));
	}

	#[test]
	fn location_rewritten_to_public_origin() {
		let mut headers = HeaderMap::new();
		headers.insert(header::LOCATION, HeaderValue::from_static("http://127.0.0.1:8080/ipfs/bafy/x"));
		rewrite_location(&mut headers, "http://127.0.0.1:8080", "example.com");
		assert_eq!(headers.get(header::LOCATION).unwrap(), "https://example.com/ipfs/bafy/x");
	}
}

// vim: ts=4
