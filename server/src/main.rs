//! Process entry point: reads settings from the environment, builds the
//! application state (C1-C11 plus the rate limiter and worker pool),
//! spawns every background reconciler, and runs the TLS and plain-HTTP
//! listeners to completion. Grounded on the teacher's
//! `core/app.rs::AppBuilder::run()` startup sequence (crypto provider
//! install, state construction, background task starts, TLS server bind,
//! optional plain-HTTP server, `tokio::try_join!`) and
//! `core/webserver.rs::create_https_server`'s `tower::service_fn` dispatch
//! shape, generalized to this gateway's two-listener split (spec.md §6.1).

mod admin;
mod app;
mod backup;
mod config;
mod core;
mod error;
mod formats;
mod gateway;
mod ipns;
mod node;
mod prelude;
mod publish;
mod routes;
mod tls;

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use crate::app::{App, AppState};
use crate::core::settings::Settings;
use crate::prelude::*;
use crate::tls::provider::CertSelector;

#[tokio::main]
async fn main() -> ClResult<()> {
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.init();

	if let Err(e) = rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider())
	{
		error!("failed to install default rustls crypto provider: {:?}", e);
		std::process::exit(1);
	}

	let settings = match Settings::from_env() {
		Ok(s) => s,
		Err(e) => {
			error!("fatal: {}", e);
			std::process::exit(1);
		}
	};

	let env_name = if settings.acme_staging { "staging" } else { "production" };
	info!("TruthGate starting (ACME environment: {})", env_name);

	let app = AppState::build(settings).await?;

	tls::reconciler::spawn(app.config.clone(), app.cert_provider.clone());
	app.ipns_reconciler.clone().spawn();
	app.rate_limiter.spawn_background();

	let router = routes::build_router(app.clone());

	let https_handle = spawn_https_server(app.clone(), router.clone()).await?;
	let http_handle = spawn_plain_http_listener(app.clone(), app.settings.http_addr.clone()).await?;

	if let Some(alt_addr) = app.settings.http_alt_addr.clone() {
		spawn_plain_http_listener(app.clone(), alt_addr).await?;
	}

	tokio::select! {
		res = https_handle => {
			if let Err(e) = res {
				error!("https server task failed: {}", e);
			}
		}
		res = http_handle => {
			if let Err(e) = res {
				error!("http server task failed: {}", e);
			}
		}
		_ = tokio::signal::ctrl_c() => {
			info!("received shutdown signal");
		}
	}

	Ok(())
}

async fn spawn_https_server(app: App, router: Router) -> ClResult<tokio::task::JoinHandle<()>> {
	let addr = SocketAddr::from_str(&app.settings.https_addr)
		.map_err(|e| Error::ConfigError(format!("invalid TRUTHGATE_HTTPS_ADDR: {e}")))?;

	let selector = Arc::new(CertSelector::new(app.cert_provider.clone()));
	let mut server_config = rustls::ServerConfig::builder().with_no_client_auth().with_cert_resolver(selector);
	server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

	let https_server =
		axum_server::bind_rustls(addr, axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(server_config)));

	let svc = tower::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
		let app = app.clone();
		let router = router.clone();
		async move {
			let peer = req
				.extensions()
				.get::<axum::extract::ConnectInfo<SocketAddr>>()
				.copied()
				.map(|axum::extract::ConnectInfo(addr)| addr)
				.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
			let req = req.map(axum::body::Body::new);
			routes::dispatch(app, router, peer, req).await
		}
	});

	info!("listening on HTTPS {}", addr);
	Ok(tokio::spawn(async move {
		if let Err(e) =
			https_server.serve(svc.into_make_service_with_connect_info::<SocketAddr>()).await
		{
			error!("https server error: {}", e);
		}
	}))
}

/// `:80`/`:8080` plain-HTTP listener (spec.md §6.1): serves only the ACME
/// HTTP-01 challenge endpoint.
async fn spawn_plain_http_listener(app: App, addr: String) -> ClResult<tokio::task::JoinHandle<()>> {
	let addr: SocketAddr =
		SocketAddr::from_str(&addr).map_err(|e| Error::ConfigError(format!("invalid plain-HTTP bind address: {e}")))?;

	let router = Router::new()
		.route("/.well-known/acme-challenge/{token}", get(routes::acme_challenge))
		.fallback(|| async { axum::http::StatusCode::NOT_FOUND })
		.with_state(app);

	let listener = tokio::net::TcpListener::bind(addr).await.map_err(Error::from)?;
	info!("listening on HTTP {}", addr);
	Ok(tokio::spawn(async move {
		if let Err(e) = axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>()).await {
			error!("plain-http server error: {}", e);
		}
	}))
}

// vim: ts=4
