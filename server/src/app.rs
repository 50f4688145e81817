//! Process-wide application state, wiring together every component named in
//! the component design (C1-C11) plus the rate limiter and worker pool.
//! Grounded on the teacher's `core/app.rs` (`AppState` struct + `type App =
//! Arc<AppState>`), trimmed of the tenant/adapter machinery that has no
//! counterpart here and extended with this gateway's own services.

use std::net::IpAddr;
use std::sync::Arc;

use truthgate_ratelimit::{RateLimitConfig, RateLimiter};

use crate::config::ConfigService;
use crate::core::settings::Settings;
use crate::core::worker::WorkerPool;
use crate::gateway::TieredCache;
use crate::ipns::IpnsReconciler;
use crate::node::Node;
use crate::prelude::*;
use crate::publish::queue::PublishQueue;
use crate::tls::certstore::CertEnv;
use crate::tls::challenge::ChallengeStore;
use crate::tls::issuer::AcmeIssuer;
use crate::tls::provider::LiveCertProvider;

pub struct AppState {
	pub settings: Settings,
	pub config: Arc<ConfigService>,
	pub node: Arc<Node>,
	pub challenges: Arc<ChallengeStore>,
	pub cert_provider: Arc<LiveCertProvider>,
	pub publish_queue: Arc<PublishQueue>,
	pub ipns_reconciler: Arc<IpnsReconciler>,
	pub rate_limiter: Arc<RateLimiter>,
	pub worker: Arc<WorkerPool>,
	pub gateway_cache: TieredCache,
}

pub type App = Arc<AppState>;

impl AppState {
	/// Builds the full dependency graph from process settings. Does not
	/// spawn any background task - callers decide what to start and when
	/// (see `main.rs`), matching the teacher's `AppBuilder::run()` split
	/// between construction and background task startup.
	pub async fn build(settings: Settings) -> ClResult<App> {
		let config = Arc::new(ConfigService::load(settings.config_path.clone()).await?);
		let node = Arc::new(Node::new(settings.node_api_url.clone(), settings.node_gateway_url.clone()));

		let challenges = Arc::new(ChallengeStore::new());

		let env = if settings.acme_staging { CertEnv::Staging } else { CertEnv::Production };
		let issuer = Arc::new(AcmeIssuer::new(env, settings.cert_path.clone(), challenges.clone()));

		let cert_ips: Vec<IpAddr> =
			settings.cert_ips.iter().filter_map(|s| s.parse::<IpAddr>().ok()).collect();
		let cert_provider = Arc::new(LiveCertProvider::new(
			config.clone(),
			settings.cert_path.clone(),
			issuer,
			env,
			cert_ips,
			settings.cert_dns.clone(),
		));

		let publish_queue = PublishQueue::start(node.clone(), config.clone());
		let ipns_reconciler = IpnsReconciler::new(node.clone(), config.clone());

		let rate_limiter =
			RateLimiter::new(RateLimitConfig::default(), settings.ratelimit_db_path.clone()).await?;

		let worker = Arc::new(WorkerPool::new(2, 2, 1));
		let gateway_cache = TieredCache::new();

		Ok(Arc::new(AppState {
			settings,
			config,
			node,
			challenges,
			cert_provider,
			publish_queue,
			ipns_reconciler,
			rate_limiter,
			worker,
			gateway_cache,
		}))
	}

	/// Checks `key` against the bootstrap admin API key (constant-time-ish
	/// string compare) or, failing that, against every configured user's
	/// bcrypt hash, offloaded to the worker pool (grounded on the teacher's
	/// bcrypt-on-worker-pool pattern in `auth-adapter-sqlite/src/crypto.rs`).
	pub async fn verify_admin_key(&self, key: &str) -> bool {
		if let Some(bootstrap) = &self.settings.admin_api_key {
			if constant_time_eq(bootstrap.as_bytes(), key.as_bytes()) {
				return true;
			}
		}

		let cfg = self.config.get().await;
		for user in cfg.users {
			let key = key.to_string();
			let hash = user.password_hash.clone();
			let matched =
				self.worker.run(move || crate::core::password::bcrypt_verify(&key, &hash)).await;
			if matches!(matched, Ok(true)) {
				return true;
			}
		}
		false
	}
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}
	diff == 0
}

// vim: ts=4
