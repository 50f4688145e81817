//! Admin API: the control-plane surface behind an API key, used to manage
//! domains and trigger publishes/backups/imports (spec.md §6.1). No teacher
//! file has an admin control plane of this shape - the `ApiKey` extractor
//! follows the teacher's `core/extract.rs` `FromRequestParts` pattern
//! (`Auth`/`IdTag` read from request parts, `Error::PermissionDenied` on
//! absence), generalized to a header/query-carried credential plus the rate
//! limiter's ban/grace bookkeeping (C10) instead of a session lookup.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, FromRequestParts, Multipart, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::app::App;
use crate::backup::DomainBackup;
use crate::config::{ConfigData, DomainRecord, NamingKeyEntry, WildcardIpnsRule};
use crate::prelude::*;
use truthgate_ratelimit::Scope;

/// A verified admin API key, extracted from `X-API-Key`, `Authorization:
/// Bearer ...`, or a `?api_key=`/`?key=` query parameter (spec.md §6.1).
/// Verification failures and successes both feed the rate limiter's
/// admin-scope bad-key counter (spec.md §4.9).
pub struct ApiKey(pub String);

fn peer_ip(parts: &Parts) -> IpAddr {
	parts
		.extensions
		.get::<ConnectInfo<SocketAddr>>()
		.map(|ConnectInfo(addr)| addr.ip())
		.unwrap_or_else(|| truthgate_ratelimit::AddrKey::loopback_v4().into())
}

fn extract_key_candidate(parts: &Parts) -> Option<String> {
	if let Some(v) = parts.headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
		return Some(v.to_string());
	}
	if let Some(v) = parts.headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
		if let Some(tok) = v.strip_prefix("Bearer ") {
			return Some(tok.to_string());
		}
	}
	let query = parts.uri.query().unwrap_or_default();
	url::form_urlencoded::parse(query.as_bytes())
		.find(|(k, _)| k == "api_key" || k == "key")
		.map(|(_, v)| v.into_owned())
}

impl FromRequestParts<App> for ApiKey {
	type Rejection = Error;

	async fn from_request_parts(parts: &mut Parts, app: &App) -> Result<Self, Self::Rejection> {
		let addr = peer_ip(parts);
		if app.rate_limiter.is_banned(addr) {
			return Err(Error::Banned);
		}

		let Some(key) = extract_key_candidate(parts) else {
			app.rate_limiter.record_admin_failure(addr).await;
			return Err(Error::Unauthorized);
		};

		if app.verify_admin_key(&key).await {
			app.rate_limiter.record_admin_success(addr, Some(&key)).await;
			return Ok(ApiKey(key));
		}

		if app.rate_limiter.has_grace(addr, &key).await {
			return Ok(ApiKey(key));
		}

		app.rate_limiter.record_admin_failure(addr).await;
		Err(Error::Unauthorized)
	}
}

// --- Domain CRUD (supplements the publish/backup/import flows with the
// minimal create/read/update/delete the spec assumes already exists) ---

#[derive(Debug, Deserialize)]
pub struct CreateDomainReq {
	pub domain: String,
	#[serde(default)]
	pub use_ssl: bool,
	#[serde(default)]
	pub redirect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateDomainReq {
	#[serde(default)]
	pub use_ssl: Option<bool>,
	#[serde(default)]
	pub redirect_url: Option<String>,
	#[serde(default)]
	pub keep_old_cid_pinned: Option<bool>,
	#[serde(default)]
	pub auto_update: Option<bool>,
}

pub async fn list_domains(_key: ApiKey, State(app): State<App>) -> Json<Vec<DomainRecord>> {
	let cfg = app.config.get().await;
	Json(cfg.domains.into_values().collect())
}

pub async fn get_domain(
	_key: ApiKey,
	State(app): State<App>,
	Path(domain): Path<String>,
) -> ClResult<Json<DomainRecord>> {
	let cfg = app.config.get().await;
	cfg.domains.get(&domain).cloned().map(Json).ok_or_else(|| Error::UnknownDomain(domain))
}

pub async fn create_domain(
	_key: ApiKey,
	State(app): State<App>,
	Json(req): Json<CreateDomainReq>,
) -> ClResult<Json<DomainRecord>> {
	if req.domain.trim().is_empty() {
		return Err(Error::ValidationError("domain must not be empty".into()));
	}
	let domain = req.domain.to_lowercase();

	app.config
		.update(|cfg: &mut ConfigData| {
			if cfg.domains.contains_key(&domain) {
				return Err(Error::Conflict(format!("domain already exists: {domain}")));
			}
			let mut rec = DomainRecord {
				domain: domain.clone(),
				use_ssl: req.use_ssl,
				redirect_url: req.redirect_url.clone(),
				..Default::default()
			};
			ConfigData::fill_leaves(&domain, &mut rec);
			cfg.domains.insert(domain.clone(), rec);
			Ok(())
		})
		.await?;

	let cfg = app.config.get().await;
	Ok(Json(cfg.domains.get(&domain).cloned().ok_or_else(|| Error::Internal("domain vanished after insert".into()))?))
}

pub async fn update_domain(
	_key: ApiKey,
	State(app): State<App>,
	Path(domain): Path<String>,
	Json(req): Json<UpdateDomainReq>,
) -> ClResult<Json<DomainRecord>> {
	app.config
		.update(|cfg: &mut ConfigData| {
			let rec = cfg.domains.get_mut(&domain).ok_or_else(|| Error::UnknownDomain(domain.clone()))?;
			if let Some(ssl) = req.use_ssl {
				rec.use_ssl = ssl;
			}
			if req.redirect_url.is_some() {
				rec.redirect_url = req.redirect_url.clone();
			}
			if let Some(key_name) = rec.ipns_key_name.clone() {
				if let Some(entry) = cfg.naming_keys.get_mut(&key_name) {
					if let Some(keep) = req.keep_old_cid_pinned {
						entry.keep_old_cid_pinned = keep;
					}
					if let Some(auto) = req.auto_update {
						entry.auto_update = auto;
					}
				}
			}
			Ok(())
		})
		.await?;

	let cfg = app.config.get().await;
	cfg.domains.get(&domain).cloned().map(Json).ok_or_else(|| Error::UnknownDomain(domain))
}

pub async fn delete_domain(
	_key: ApiKey,
	State(app): State<App>,
	Path(domain): Path<String>,
) -> ClResult<StatusCode> {
	app.config
		.update(|cfg: &mut ConfigData| {
			if cfg.domains.remove(&domain).is_none() {
				return Err(Error::UnknownDomain(domain.clone()));
			}
			Ok(())
		})
		.await?;
	app.gateway_cache.invalidate_all();
	Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct WildcardRuleReq {
	pub base_host: String,
	#[serde(default)]
	pub use_ssl: bool,
}

pub async fn set_wildcard_rule(
	_key: ApiKey,
	State(app): State<App>,
	Json(req): Json<WildcardRuleReq>,
) -> ClResult<StatusCode> {
	app.config
		.update(|cfg: &mut ConfigData| {
			cfg.wildcard_rule = Some(WildcardIpnsRule { base_host: req.base_host.clone(), use_ssl: req.use_ssl });
			Ok(())
		})
		.await?;
	Ok(StatusCode::NO_CONTENT)
}

/// Forces an immediate resolve of one naming key, bypassing
/// `scheduledPerKeyCooldown` (spec.md §4.8 `forceResolve`).
pub async fn resolve_ipns_key(
	_key: ApiKey,
	State(app): State<App>,
	Path(key_name): Path<String>,
) -> ClResult<StatusCode> {
	app.ipns_reconciler.resolve_one(&key_name).await?;
	app.gateway_cache.invalidate_all();
	Ok(StatusCode::NO_CONTENT)
}

// --- Publish ---

#[derive(Debug, Deserialize)]
pub struct PublishQuery {
	#[serde(default)]
	pub note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PublishAccepted {
	#[serde(rename = "jobId")]
	pub job_id: String,
	pub staged: bool,
	pub files: usize,
}

pub async fn publish(
	_key: ApiKey,
	State(app): State<App>,
	Path(domain): Path<String>,
	Query(q): Query<PublishQuery>,
	multipart: Multipart,
) -> ClResult<Response> {
	let (job_id, files) = crate::publish::intake::publish_from_multipart(
		&app.node,
		&app.config,
		&app.publish_queue,
		&domain,
		multipart,
		q.note,
	)
	.await?;
	app.gateway_cache.invalidate_all();
	Ok((StatusCode::ACCEPTED, Json(PublishAccepted { job_id, staged: true, files })).into_response())
}

// --- Backup / import ---

#[derive(Debug, Deserialize)]
pub struct PassphraseQuery {
	pub passphrase: String,
}

pub async fn backup_domain(
	_key: ApiKey,
	State(app): State<App>,
	Path(domain): Path<String>,
	Query(q): Query<PassphraseQuery>,
) -> ClResult<Json<DomainBackup>> {
	let cfg = app.config.get().await;
	let rec = cfg.domains.get(&domain).ok_or_else(|| Error::UnknownDomain(domain.clone()))?;

	let key_material = match &rec.ipns_key_name {
		Some(name) => app.node.key_export(name).await?.to_vec(),
		None => Vec::new(),
	};

	let backup = crate::backup::export(rec, &key_material, &q.passphrase)?;
	Ok(Json(backup))
}

pub async fn import_domain(
	_key: ApiKey,
	State(app): State<App>,
	Query(q): Query<PassphraseQuery>,
	Json(backup): Json<DomainBackup>,
) -> ClResult<Json<DomainRecord>> {
	let key_material = crate::backup::decrypt_key_material(&backup, &q.passphrase)?;

	let mut rec = DomainRecord {
		domain: backup.domain.clone(),
		site_folder_leaf: backup.site_folder_leaf.clone(),
		tgp_folder_leaf: backup.tgp_folder_leaf.clone(),
		ipns_peer_id: backup.ipns_peer_id.clone(),
		last_published_cid: backup.last_published_cid.clone(),
		..Default::default()
	};

	if let Some(key_name) = &backup.ipns_key_name {
		if !key_material.is_empty() {
			app.node.key_import(key_name, &key_material).await?;
		}
		rec.ipns_key_name = Some(key_name.clone());
	}

	let domain = rec.domain.clone();
	app.config
		.update(|cfg: &mut ConfigData| {
			cfg.domains.insert(domain.clone(), rec.clone());
			if let Some(key_name) = &backup.ipns_key_name {
				cfg.naming_keys.entry(key_name.clone()).or_insert_with(|| NamingKeyEntry {
					key_name: key_name.clone(),
					auto_update: true,
					keep_old_cid_pinned: false,
					current_cid: None,
				});
			}
			Ok(())
		})
		.await?;

	app.gateway_cache.invalidate_all();
	let cfg = app.config.get().await;
	cfg.domains.get(&domain).cloned().map(Json).ok_or_else(|| Error::UnknownDomain(domain))
}

// --- Rate limiter administration (supplements C10 with the minimal
// ban/whitelist management its gate needs an operator-facing surface for) ---

#[derive(Debug, Deserialize)]
pub struct BanReq {
	pub addr: IpAddr,
	#[serde(default)]
	pub prefix64: bool,
	#[serde(default = "default_ban_seconds")]
	pub duration_secs: u64,
	#[serde(default)]
	pub reason: Option<String>,
}

fn default_ban_seconds() -> u64 {
	3600
}

pub async fn list_bans(_key: ApiKey, State(app): State<App>) -> Json<Vec<BanInfoOut>> {
	Json(app.rate_limiter.list_bans().into_iter().map(BanInfoOut::from).collect())
}

#[derive(Debug, Serialize)]
pub struct BanInfoOut {
	pub id: Option<i64>,
	pub addr_key: String,
	pub scope: String,
	pub reason: String,
	pub expires_utc: i64,
}

impl From<truthgate_ratelimit::limiter::BanInfo> for BanInfoOut {
	fn from(b: truthgate_ratelimit::limiter::BanInfo) -> Self {
		BanInfoOut {
			id: b.id,
			addr_key: b.addr_key.to_db_string(),
			scope: format!("{:?}", b.scope),
			reason: b.reason_code,
			expires_utc: b.expires_utc,
		}
	}
}

pub async fn create_ban(_key: ApiKey, State(app): State<App>, Json(req): Json<BanReq>) -> ClResult<StatusCode> {
	use std::time::Duration;
	let duration = Duration::from_secs(req.duration_secs);
	let reason = req.reason.as_deref().unwrap_or("manual-admin-ban");
	if req.prefix64 {
		app.rate_limiter.ban_ipv6_prefix(req.addr, duration, Scope::Global, truthgate_ratelimit::limiter::BanType::True, reason).await;
	} else {
		app.rate_limiter.ban_ip(req.addr, duration, Scope::Global, truthgate_ratelimit::limiter::BanType::True, reason).await;
	}
	Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_ban(_key: ApiKey, State(app): State<App>, Path(id): Path<i64>) -> ClResult<StatusCode> {
	app.rate_limiter.unban_by_id(id).await;
	Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct WhitelistReq {
	pub addr: IpAddr,
	#[serde(default)]
	pub expires_utc: Option<i64>,
}

pub async fn whitelist_add(_key: ApiKey, State(app): State<App>, Json(req): Json<WhitelistReq>) -> ClResult<StatusCode> {
	app.rate_limiter.whitelist_add(req.addr, req.expires_utc).await;
	Ok(StatusCode::NO_CONTENT)
}

// vim: ts=4
