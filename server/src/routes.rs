//! Top-level request dispatch: builds the admin/API router and the
//! content-gateway dispatch function the TLS and plain-HTTP listeners both
//! serve. Grounded on the teacher's `core/webserver.rs::create_https_server`
//! `tower::service_fn` dispatch (host-based branching, `info_span!`-per-
//! request logging, status-based log level) generalized from the teacher's
//! `cl-o.` API-host-prefix/proxy-cache/app-router three-way split to this
//! gateway's two-way split: a mapped content host is served by the gateway
//! proxy (C11), anything else falls to the admin/API router.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use http_body_util::BodyExt;
use tower_http::cors::{Any, CorsLayer};

use crate::admin;
use crate::admin::ApiKey;
use crate::app::App;
use crate::gateway;
use crate::prelude::*;

/// `GET /.well-known/acme-challenge/{token}` (spec.md §4.2): served on both
/// the TLS and plain-HTTP listeners so ACME's HTTP-01 validator can reach it
/// whichever port it dials, without going through admin auth or the rate
/// limiter gate.
pub async fn acme_challenge(
	State(app): State<App>,
	axum::extract::Path(token): axum::extract::Path<String>,
) -> Response {
	match app.challenges.try_get(&token) {
		Some(key_authz) => ([("content-type", "text/plain")], key_authz.to_string()).into_response(),
		None => StatusCode::NOT_FOUND.into_response(),
	}
}

/// The admin/API router (spec.md §6.1), mounted under
/// `/api/truthgate/v1/admin` and gated by the `ApiKey` extractor on every
/// handler.
pub fn admin_router(app: App) -> Router {
	Router::new()
		.route("/domains", get(admin::list_domains).post(admin::create_domain))
		.route(
			"/domains/{domain}",
			get(admin::get_domain).put(admin::update_domain).delete(admin::delete_domain),
		)
		.route("/wildcard-rule", put(admin::set_wildcard_rule))
		.route("/ipns/{key_name}/resolve", post(admin::resolve_ipns_key))
		.route("/{domain}/publish", post(admin::publish))
		.route("/{domain}/backup", get(admin::backup_domain))
		.route("/import", post(admin::import_domain))
		.route("/bans", get(admin::list_bans).post(admin::create_ban))
		.route("/bans/{id}", delete(admin::delete_ban))
		.route("/whitelist", post(admin::whitelist_add))
		.layer(
			CorsLayer::new()
				.allow_origin(Any)
				.allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
				.allow_headers(Any),
		)
		.with_state(app)
}

/// `GET|POST /api/*` (spec.md §6.1, non-admin): proxies to the node's own
/// HTTP API after API-key auth. Grounded on `gateway/handler.rs::serve_content`'s
/// `send_raw` forwarding shape, pointed at `Node::api_base` instead of the
/// gateway base. Only reachable via `dispatch_via_router`'s fallback, which
/// `dispatch` only takes when the host isn't a mapped content root - so this
/// is implicitly "forbidden on mapped hosts" (spec.md §6.1) without a
/// separate check here.
async fn proxy_node_api(
	_key: ApiKey,
	State(app): State<App>,
	req: axum::http::Request<axum::body::Body>,
) -> ClResult<Response> {
	let path_and_query = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or_else(|| req.uri().path()).to_string();
	let uri = format!("{}{}", app.node.api_base().trim_end_matches('/'), path_and_query);
	let method = req.method().clone();
	let mut headers = axum::http::HeaderMap::new();
	for (name, value) in req.headers().iter() {
		if gateway::handler::is_hop_by_hop(name) || *name == header::HOST {
			continue;
		}
		headers.append(name.clone(), value.clone());
	}
	let body = req.into_body().map_err(|e| Error::NetworkError(format!("client body error: {e}"))).boxed();

	let mut out = hyper::Request::builder().method(method).uri(&uri).body(body)?;
	*out.headers_mut() = headers;

	let resp = app.node.send_raw(out).await?;
	let status = resp.status();
	let mut resp_headers = axum::http::HeaderMap::new();
	for (name, value) in resp.headers().iter() {
		if gateway::handler::is_hop_by_hop(name) {
			continue;
		}
		resp_headers.append(name.clone(), value.clone());
	}
	let mut response = Response::new(axum::body::Body::new(resp.into_body()));
	*response.status_mut() = status;
	*response.headers_mut() = resp_headers;
	Ok(response)
}

pub fn build_router(app: App) -> Router {
	Router::new()
		.route("/.well-known/acme-challenge/{token}", get(acme_challenge))
		.nest("/api/truthgate/v1/admin", admin_router(app.clone()))
		.route("/api/{*rest}", get(proxy_node_api).post(proxy_node_api))
		.with_state(app)
}

fn host_from_request<B>(req: &axum::http::Request<B>) -> String {
	req.uri()
		.host()
		.map(str::to_string)
		.or_else(|| req.headers().get(axum::http::header::HOST).and_then(|h| h.to_str().ok()).map(|h| h.split(':').next().unwrap_or(h).to_string()))
		.unwrap_or_default()
}

/// Per-request entry point shared by the TLS and plain-HTTP listeners:
/// resolves the effective host, applies the rate-limiter gate, then either
/// serves content (mapped host, spec.md §4.10) or falls through to the
/// admin/API router / plain 404 (spec.md §4.10 "serve non-content paths or
/// 404"). Grounded on the teacher's per-request `info_span!` + elapsed-time
/// + status-based log level idiom in `create_https_server`.
pub async fn dispatch(
	app: App,
	router: Router,
	peer: SocketAddr,
	mut req: axum::http::Request<axum::body::Body>,
) -> Result<Response, Infallible> {
	let start = Instant::now();
	let method = req.method().clone();
	let path = req.uri().path().to_string();
	let host = host_from_request(&req);
	let _span = info_span!("REQ", method = %method, path = %path, host = %host).entered();

	let ip = peer.ip();
	if app.rate_limiter.is_banned(ip) {
		warn!("RES: 403 banned tm:{:?}", start.elapsed());
		return Ok(Error::Banned.into_response());
	}
	app.rate_limiter.on_request_observed(ip);
	// The churn detector is specified in terms of TCP connections opened,
	// which would need a custom axum-server `Accept` hook below TLS
	// termination to observe directly. Approximated here by treating every
	// request as a connection signal - a request-keyed over-count relative
	// to true connection churn, but cheap and in the direction of the
	// detector's intent (busy-but-legitimate keep-alive traffic still has to
	// clear `churn_min_reqs_per_conn` to avoid tripping it).
	app.rate_limiter.on_connection_opened(ip).await;

	req.extensions_mut().insert(ConnectInfo(peer));

	// ACME validation must work regardless of host shape; everything else
	// tries the content gateway first so a mapped host's own `/api/` content
	// (if it has any) is served as content rather than diverted to the
	// admin/node-API router (spec.md §6.1 "forbidden on mapped hosts").
	let is_acme = path.starts_with("/.well-known/acme-challenge/");

	let result = if !is_acme {
		match gateway::serve_content(&app, &host, &method, &path, req.headers()).await {
			Ok(Some(resp)) => {
				app.rate_limiter.record_gateway_call(ip);
				Ok(resp)
			}
			Ok(None) => {
				app.rate_limiter.record_public_call(ip);
				dispatch_via_router(router, req).await
			}
			Err(e) => {
				warn!("gateway error serving {} {}: {}", host, path, e);
				Ok(e.into_response())
			}
		}
	} else {
		dispatch_via_router(router, req).await
	};

	let resp = result.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
	let status = resp.status();
	if status.is_client_error() || status.is_server_error() {
		warn!("RES: {} tm:{:?}", status, start.elapsed());
	} else {
		info!("RES: {} tm:{:?}", status, start.elapsed());
	}
	Ok(resp)
}

async fn dispatch_via_router(
	router: Router,
	req: axum::http::Request<axum::body::Body>,
) -> Result<Response, Infallible> {
	use tower::util::ServiceExt;
	match router.oneshot(req).await {
		Ok(resp) => Ok(resp),
		Err(_) => Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response()),
	}
}

// vim: ts=4
