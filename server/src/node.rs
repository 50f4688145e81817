//! HTTP client for the embedded content-addressed node (an IPFS-compatible
//! HTTP API, spoken to only over HTTP per spec.md §1 Non-goals). Every
//! publish/pin/naming-key/path-resolution operation in C7-C11 goes through
//! this one client. Grounded on the teacher's `core/request.rs` hyper-rustls
//! client wrapper shape (builder, timeout wrapper, typed JSON responses).

use std::time::Duration;

use futures_core::stream::Stream;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, StreamBody};
use hyper::body::{Body, Bytes, Frame};
use hyper::http::StatusCode;
use hyper::Method;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use tokio::time::timeout;

use crate::prelude::*;

const API_TIMEOUT: Duration = Duration::from_secs(30);

fn to_boxed<B>(body: B) -> BoxBody<Bytes, Error>
where
	B: Body<Data = Bytes> + Send + Sync + 'static,
	B::Error: Send + 'static,
{
	body.map_err(|_err| Error::NodeError("body stream error".into())).boxed()
}

/// A directory/file entry as returned by `files/ls -l`.
#[derive(Debug, Clone, Deserialize)]
pub struct LsEntry {
	#[serde(rename = "Name")]
	pub name: String,
	#[serde(rename = "Type")]
	pub typ: i32,
	#[serde(rename = "Size")]
	pub size: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct LsResponse {
	#[serde(rename = "Entries")]
	entries: Option<Vec<LsEntry>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatResponse {
	#[serde(rename = "Hash")]
	pub hash: String,
	#[serde(rename = "Size")]
	pub size: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct KeyEntry {
	#[serde(rename = "Name")]
	name: String,
	#[serde(rename = "Id")]
	id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct KeyListResponse {
	#[serde(rename = "Keys")]
	keys: Vec<KeyEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct NamePublishResponse {
	#[serde(rename = "Name")]
	name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct KeyGenResponse {
	#[serde(rename = "Id")]
	id: String,
	#[serde(rename = "Name")]
	name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct NameResolveResponse {
	#[serde(rename = "Path")]
	path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct UnixfsLink {
	#[serde(rename = "Name")]
	name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct UnixfsLsObject {
	#[serde(rename = "Links")]
	links: Option<Vec<UnixfsLink>>,
}

#[derive(Debug, Clone, Deserialize)]
struct UnixfsLsResponse {
	#[serde(rename = "Objects")]
	objects: Vec<UnixfsLsObject>,
}

#[derive(Debug, Clone)]
pub struct Node {
	api_base: String,
	gateway_base: String,
	client: Client<HttpConnector, BoxBody<Bytes, Error>>,
}

impl Node {
	pub fn new(api_base: impl Into<String>, gateway_base: impl Into<String>) -> Self {
		let connector = HttpConnector::new();
		Node {
			api_base: api_base.into(),
			gateway_base: gateway_base.into(),
			client: Client::builder(TokioExecutor::new()).build(connector),
		}
	}

	fn api_uri(&self, path: &str, query: &str) -> String {
		if query.is_empty() {
			format!("{}/api/v0{}", self.api_base.trim_end_matches('/'), path)
		} else {
			format!("{}/api/v0{}?{}", self.api_base.trim_end_matches('/'), path, query)
		}
	}

	pub fn gateway_url(&self, cid_path: &str) -> String {
		format!("{}/ipfs/{}", self.gateway_base.trim_end_matches('/'), cid_path.trim_start_matches('/'))
	}

	pub fn gateway_base(&self) -> &str {
		&self.gateway_base
	}

	pub fn api_base(&self) -> &str {
		&self.api_base
	}

	/// Sends a pre-built request straight to the node (API or gateway host,
	/// caller's choice of URI) and returns the raw streamed response without
	/// buffering the body - used by the gateway proxy (C11) to forward
	/// responses without collecting them into memory first.
	pub async fn send_raw(
		&self,
		req: hyper::Request<BoxBody<Bytes, Error>>,
	) -> ClResult<hyper::Response<hyper::body::Incoming>> {
		let uri = req.uri().to_string();
		timeout(API_TIMEOUT, self.client.request(req))
			.await
			.map_err(|_| Error::Timeout)?
			.map_err(|e| Error::NodeError(format!("{uri}: {e}")))
	}

	async fn post_empty(&self, path: &str, query: &str) -> ClResult<Bytes> {
		let uri = self.api_uri(path, query);
		let req = hyper::Request::builder()
			.method(Method::POST)
			.uri(&uri)
			.body(to_boxed(Empty::new()))?;
		let res = timeout(API_TIMEOUT, self.client.request(req))
			.await
			.map_err(|_| Error::Timeout)?
			.map_err(|e| Error::NodeError(format!("{uri}: {e}")))?;
		let status = res.status();
		let body = timeout(API_TIMEOUT, res.into_body().collect())
			.await
			.map_err(|_| Error::Timeout)?
			.map_err(|_| Error::NodeError("failed to read node response body".into()))?
			.to_bytes();
		if !status.is_success() {
			let prefix: String = String::from_utf8_lossy(&body[..body.len().min(200)]).into_owned();
			return Err(Error::NodeError(format!("{uri} -> {status}: {prefix}")));
		}
		Ok(body)
	}

	async fn post_json<Res: for<'de> Deserialize<'de>>(&self, path: &str, query: &str) -> ClResult<Res> {
		let body = self.post_empty(path, query).await?;
		Ok(serde_json::from_slice(&body)?)
	}

	/// `files/stat` on an MFS path. Returns the CID and size of the node
	/// there, used to capture "the hash of the content tree right now"
	/// (spec §4.7 steps 2/4/6, §4.9 step 2).
	pub async fn files_stat(&self, mfs_path: &str) -> ClResult<StatResponse> {
		self.post_json("/files/stat", &format!("arg={}&hash=true", urlencode(mfs_path))).await
	}

	pub async fn files_ls(&self, mfs_path: &str) -> ClResult<Vec<LsEntry>> {
		let res: LsResponse =
			self.post_json("/files/ls", &format!("arg={}&long=true", urlencode(mfs_path))).await?;
		Ok(res.entries.unwrap_or_default())
	}

	pub async fn files_mkdir(&self, mfs_path: &str, parents: bool) -> ClResult<()> {
		self.post_empty(
			"/files/mkdir",
			&format!("arg={}&parents={}", urlencode(mfs_path), parents),
		)
		.await?;
		Ok(())
	}

	pub async fn files_rm(&self, mfs_path: &str, recursive: bool) -> ClResult<()> {
		self.post_empty(
			"/files/rm",
			&format!("arg={}&recursive={}&force=true", urlencode(mfs_path), recursive),
		)
		.await?;
		Ok(())
	}

	/// `files/mv`, falling back to `files/cp` + `files/rm` the way spec
	/// §4.7 steps 3/5 require ("move; fall back to cp+rm").
	/// `files/read` on an MFS path. Used for sidecar files (`.tgp-meta.json`,
	/// `ipns-key.json`) that live in the node's managed tree, not behind a
	/// CID the gateway can serve directly.
	pub async fn files_read(&self, mfs_path: &str) -> ClResult<Bytes> {
		self.post_empty("/files/read", &format!("arg={}", urlencode(mfs_path))).await
	}

	pub async fn files_mv_or_copy(&self, src: &str, dst: &str) -> ClResult<()> {
		let query = format!("arg={}&arg={}", urlencode(src), urlencode(dst));
		if self.post_empty("/files/mv", &query).await.is_ok() {
			return Ok(());
		}
		warn!("files/mv failed for {} -> {}, falling back to cp+rm", src, dst);
		self.post_empty("/files/cp", &query).await?;
		self.files_rm(src, true).await
	}

	pub async fn files_cp(&self, src: &str, dst: &str) -> ClResult<()> {
		self.post_empty("/files/cp", &format!("arg={}&arg={}", urlencode(src), urlencode(dst)))
			.await?;
		Ok(())
	}

	pub async fn files_write_stream<S>(
		&self,
		mfs_path: &str,
		stream: S,
	) -> ClResult<()>
	where
		S: Stream<Item = Result<Frame<Bytes>, std::io::Error>> + Send + Sync + 'static,
	{
		let uri = self.api_uri(
			"/files/write",
			&format!(
				"arg={}&create=true&parents=true&truncate=true&raw-leaves=true",
				urlencode(mfs_path)
			),
		);
		let body = StreamBody::new(stream).map_err(|_err| Error::NodeError("upload stream error".into()));
		let req = hyper::Request::builder()
			.method(Method::POST)
			.uri(&uri)
			.header("Content-Type", "application/octet-stream")
			.body(to_boxed(body))?;
		let res = timeout(API_TIMEOUT, self.client.request(req))
			.await
			.map_err(|_| Error::Timeout)?
			.map_err(|e| Error::NodeError(format!("{uri}: {e}")))?;
		if !res.status().is_success() {
			return Err(Error::NodeError(format!("{uri} -> {}", res.status())));
		}
		Ok(())
	}

	pub async fn files_write_bytes(&self, mfs_path: &str, data: Bytes) -> ClResult<()> {
		let stream = futures::stream::once(async move { Ok(Frame::data(data)) });
		self.files_write_stream(mfs_path, stream).await
	}

	pub async fn pin_add(&self, cid: &str, recursive: bool) -> ClResult<()> {
		self.post_empty("/pin/add", &format!("arg={}&recursive={}", urlencode(cid), recursive))
			.await?;
		Ok(())
	}

	pub async fn pin_rm(&self, cid: &str) -> ClResult<()> {
		self.post_empty("/pin/rm", &format!("arg={}", urlencode(cid))).await?;
		Ok(())
	}

	pub async fn pin_ls(&self, cid: &str) -> bool {
		self.post_empty("/pin/ls", &format!("arg={}", urlencode(cid))).await.is_ok()
	}

	/// Best-effort DHT provide announcement (spec §4.8 step 5).
	pub async fn routing_provide(&self, cid: &str) {
		if let Err(e) = self.post_empty("/routing/provide", &format!("arg={}", urlencode(cid))).await {
			debug!("routing/provide({}) failed (best-effort): {}", cid, e);
		}
	}

	pub async fn name_publish(&self, key_name: &str, cid: &str) -> ClResult<()> {
		self.post_empty(
			"/name/publish",
			&format!("arg=/ipfs/{}&key={}&resolve=false", urlencode(cid), urlencode(key_name)),
		)
		.await?;
		Ok(())
	}

	/// Returns the `/ipfs/<cid>` path the key currently resolves to.
	pub async fn name_resolve(&self, ipns_name: &str) -> ClResult<String> {
		let res: NameResolveResponse =
			self.post_json("/name/resolve", &format!("arg=/ipns/{}", urlencode(ipns_name))).await?;
		Ok(res.path)
	}

	pub async fn key_gen(&self, name: &str) -> ClResult<String> {
		let res: KeyGenResponse =
			self.post_json("/key/gen", &format!("arg={}&type=ed25519", urlencode(name))).await?;
		debug_assert_eq!(res.name, name);
		Ok(res.id)
	}

	/// Lists direct children of `/ipfs/<cid>[/dir]` (spec.md §4.10 "walk the
	/// directory listing cache segment by segment"). Names are returned in
	/// their on-disk case.
	pub async fn unixfs_ls(&self, cid_path: &str) -> ClResult<Vec<String>> {
		let res: UnixfsLsResponse =
			self.post_json("/ls", &format!("arg=/ipfs/{}", urlencode(cid_path))).await?;
		Ok(res
			.objects
			.into_iter()
			.flat_map(|o| o.links.unwrap_or_default())
			.map(|l| l.name)
			.collect())
	}

	pub async fn key_list(&self) -> ClResult<Vec<(String, String)>> {
		let res: KeyListResponse = self.post_json("/key/list", "").await?;
		Ok(res.keys.into_iter().map(|k| (k.name, k.id)).collect())
	}

	/// Exports a key's raw key material (used by the admin backup endpoint,
	/// §6.2 `DomainBackup`). Returned bytes are the node's native key-export
	/// format, opaque to us - we only ever round-trip them through
	/// `key_import`.
	pub async fn key_export(&self, name: &str) -> ClResult<Bytes> {
		self.post_empty("/key/export", &format!("arg={}", urlencode(name))).await
	}

	/// Imports previously-exported key material under `name`, returning the
	/// resulting peer id (spec.md §6.1 `POST .../admin/import`).
	pub async fn key_import(&self, name: &str, key_bytes: &[u8]) -> ClResult<String> {
		let boundary = "----truthgate-key-import";
		let mut body = Vec::with_capacity(key_bytes.len() + 256);
		body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
		body.extend_from_slice(
			b"Content-Disposition: form-data; name=\"file\"; filename=\"key\"\r\n",
		);
		body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
		body.extend_from_slice(key_bytes);
		body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

		let uri = self.api_uri("/key/import", &format!("arg={}", urlencode(name)));
		let req = hyper::Request::builder()
			.method(Method::POST)
			.uri(&uri)
			.header("Content-Type", format!("multipart/form-data; boundary={boundary}"))
			.body(to_boxed(http_body_util::Full::new(Bytes::from(body))))?;
		let res = timeout(API_TIMEOUT, self.client.request(req))
			.await
			.map_err(|_| Error::Timeout)?
			.map_err(|e| Error::NodeError(format!("{uri}: {e}")))?;
		let status = res.status();
		let body = res
			.into_body()
			.collect()
			.await
			.map_err(|_| Error::NodeError("failed to read node response body".into()))?
			.to_bytes();
		if !status.is_success() {
			let prefix: String = String::from_utf8_lossy(&body[..body.len().min(200)]).into_owned();
			return Err(Error::NodeError(format!("{uri} -> {status}: {prefix}")));
		}
		let res: KeyGenResponse = serde_json::from_slice(&body)?;
		Ok(res.id)
	}

	/// Fetch arbitrary bytes via the gateway (used for `tgp.json` probes in
	/// the IPNS reconciler, §4.8 step 3).
	pub async fn gateway_get(&self, cid_path: &str) -> ClResult<Bytes> {
		let uri = self.gateway_url(cid_path);
		let req = hyper::Request::builder()
			.method(Method::GET)
			.uri(&uri)
			.body(to_boxed(Empty::new()))?;
		let res = timeout(API_TIMEOUT, self.client.request(req))
			.await
			.map_err(|_| Error::Timeout)?
			.map_err(|e| Error::NodeError(format!("{uri}: {e}")))?;
		if res.status() != StatusCode::OK {
			return Err(Error::NotFound);
		}
		let body = res
			.into_body()
			.collect()
			.await
			.map_err(|_| Error::NodeError("failed to read gateway response".into()))?
			.to_bytes();
		Ok(body)
	}
}

fn urlencode(s: &str) -> String {
	url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

// vim: ts=4
