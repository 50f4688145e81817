//! C5: Live Cert Provider. Host -> certificate decision table, two-tier
//! cache+disk lookup, cooldown/backoff and the `ResolvesServerCert` TLS
//! selector, grounded on the teacher's `core/webserver.rs::CertResolver`
//! (same sync-cache-then-block_in_place-disk-read shape, same
//! poisoned-lock recovery idiom) generalized with spec.md §4.5's decision
//! table, renewal-before-expiry rule, cooldown/backoff schedule, bounded
//! parallel issuance and self-signed fallback.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use rcgen::{CertificateParams, DistinguishedName, KeyPair, SanType};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::sync::Semaphore;
use x509_parser::time::ASN1Time;

use super::certstore::{CertEnv, CertStore};
use super::issuer::AcmeIssuer;
use crate::config::ConfigService;
use crate::prelude::*;

const RENEWAL_WINDOW_DAYS: i64 = 30;
const MAX_PARALLEL_ISSUANCE: usize = 2;
const BACKOFF_MINUTES: [u64; 5] = [1, 5, 15, 30, 60];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertDecision {
	RealIfPresent,
	NoneFailTls,
	SelfSigned,
}

#[derive(Clone)]
struct CachedCert {
	certified_key: Arc<CertifiedKey>,
	not_after: ASN1Time,
}

struct Cooldown {
	until: Instant,
	failures: u32,
}

pub struct LiveCertProvider {
	config: Arc<ConfigService>,
	store: CertStore,
	issuer: Arc<AcmeIssuer>,
	env: CertEnv,
	cache: SyncRwLock<HashMap<Box<str>, CachedCert>>,
	cooldown: SyncMutex<HashMap<Box<str>, Cooldown>>,
	inflight: SyncMutex<HashSet<Box<str>>>,
	semaphore: Arc<Semaphore>,
	self_signed: SyncRwLock<Option<Arc<CertifiedKey>>>,
	cert_ips: Vec<IpAddr>,
	cert_dns: Vec<String>,
}

impl LiveCertProvider {
	pub fn new(
		config: Arc<ConfigService>,
		cert_dir: PathBuf,
		issuer: Arc<AcmeIssuer>,
		env: CertEnv,
		cert_ips: Vec<IpAddr>,
		cert_dns: Vec<String>,
	) -> Self {
		LiveCertProvider {
			config,
			store: CertStore::new(cert_dir),
			issuer,
			env,
			cache: SyncRwLock::new(HashMap::new()),
			cooldown: SyncMutex::new(HashMap::new()),
			inflight: SyncMutex::new(HashSet::new()),
			semaphore: Arc::new(Semaphore::new(MAX_PARALLEL_ISSUANCE)),
			self_signed: SyncRwLock::new(None),
			cert_ips,
			cert_dns,
		}
	}

	/// `decideForHost` (spec.md §4.5).
	pub async fn decide_for_host(&self, host: &str) -> CertDecision {
		if host.parse::<IpAddr>().is_ok() {
			return CertDecision::SelfSigned;
		}
		let cfg = self.config.get().await;
		if let Some(rec) = cfg.domains.get(host) {
			return if rec.use_ssl { CertDecision::RealIfPresent } else { CertDecision::NoneFailTls };
		}
		if cfg.resolve_wildcard_host(host).is_some() {
			return CertDecision::RealIfPresent;
		}
		CertDecision::SelfSigned
	}

	/// Two-tier lookup: in-process cache then disk. A cert within 30 days
	/// of expiry is reported missing (and evicted) to force renewal.
	pub async fn try_load_issued(&self, host: &str) -> ClResult<Option<Arc<CertifiedKey>>> {
		if let Some(cached) = self.cache.read().get(host).cloned() {
			if days_until(cached.not_after) <= RENEWAL_WINDOW_DAYS {
				self.cache.write().remove(host);
			} else {
				return Ok(Some(cached.certified_key));
			}
		}

		let Some(loaded) = self.store.load(host, self.env).await? else { return Ok(None) };
		if days_until(loaded.not_after) <= RENEWAL_WINDOW_DAYS {
			return Ok(None);
		}
		self.cache.write().insert(
			host.into(),
			CachedCert { certified_key: loaded.certified_key.clone(), not_after: loaded.not_after },
		);
		Ok(Some(loaded.certified_key))
	}

	/// `tryQueueIssueIfMissing` (spec.md §4.5). Fire-and-forget; failures are
	/// recorded as cooldown and surfaced only through logs.
	pub async fn try_queue_issue_if_missing(self: &Arc<Self>, host: &str) {
		if self.decide_for_host(host).await != CertDecision::RealIfPresent {
			return;
		}
		if let Some(cd) = self.cooldown.lock().get(host) {
			if cd.until > Instant::now() {
				return;
			}
		}
		{
			let mut inflight = self.inflight.lock();
			if inflight.contains(host) {
				return;
			}
			inflight.insert(host.into());
		}

		let this = self.clone();
		let host = host.to_string();
		tokio::spawn(async move {
			this.issue_task(&host).await;
			this.inflight.lock().remove(host.as_str());
		});
	}

	async fn issue_task(&self, host: &str) {
		let _permit = match self.semaphore.clone().acquire_owned().await {
			Ok(p) => p,
			Err(_) => return,
		};

		match self.try_load_issued(host).await {
			Ok(Some(_)) => return,
			Ok(None) => {}
			Err(e) => warn!("cert store check failed for {}: {}", host, e),
		}

		info!("issuing certificate for {}", host);
		match self.issuer.issue_or_renew(host).await {
			Ok(issued) => match self.store.save(host, self.env, &issued.pfx).await {
				Ok(()) => {
					self.cache.write().remove(host);
					self.cooldown.lock().remove(host);
					info!("issued and saved certificate for {}", host);
				}
				Err(e) => {
					warn!("failed to save issued certificate for {}: {}", host, e);
					self.register_failure(host);
				}
			},
			Err(e) => {
				warn!("ACME issuance failed for {}: {}", host, e);
				self.register_failure(host);
			}
		}
	}

	fn register_failure(&self, host: &str) {
		let mut cooldown = self.cooldown.lock();
		let failures = cooldown.get(host).map_or(1, |c| c.failures + 1);
		let idx = (failures as usize).saturating_sub(1).min(BACKOFF_MINUTES.len() - 1);
		let minutes = BACKOFF_MINUTES[idx];
		cooldown
			.insert(host.into(), Cooldown { until: Instant::now() + Duration::from_secs(minutes * 60), failures });
	}

	/// Authorized `{peerId.base, keyName.base}` pairs under the configured
	/// wildcard base (spec.md §4.5 `enumerateAuthorizedIpnsHosts`).
	pub async fn enumerate_authorized_ipns_hosts(&self) -> Vec<String> {
		let cfg = self.config.get().await;
		let Some(rule) = cfg.wildcard_rule.as_ref() else { return Vec::new() };
		if !rule.use_ssl {
			return Vec::new();
		}
		let mut hosts = Vec::new();
		for rec in cfg.domains.values() {
			if !rec.use_ssl {
				continue;
			}
			if let Some(peer_id) = &rec.ipns_peer_id {
				hosts.push(format!("{}.{}", peer_id, rule.base_host));
			}
			if let Some(key_name) = &rec.ipns_key_name {
				hosts.push(format!("{}.{}", key_name, rule.base_host));
			}
		}
		hosts
	}

	/// Self-signed fallback cert, generated once and cached (spec.md
	/// "supplemented feature": unmapped hosts and IP literals must still
	/// complete a TLS handshake).
	fn self_signed_cert(&self) -> Option<Arc<CertifiedKey>> {
		if let Some(existing) = self.self_signed.read().clone() {
			return Some(existing);
		}

		let mut params = CertificateParams::default();
		params.distinguished_name = DistinguishedName::new();
		let mut sans = Vec::new();
		for ip in &self.cert_ips {
			sans.push(SanType::IpAddress(*ip));
		}
		for dns in &self.cert_dns {
			if let Ok(name) = dns.clone().try_into() {
				sans.push(SanType::DnsName(name));
			}
		}
		if sans.is_empty() {
			sans.push(SanType::DnsName("localhost".to_string().try_into().ok()?));
		}
		params.subject_alt_names = sans;

		let key_pair = KeyPair::generate().ok()?;
		let cert = params.self_signed(&key_pair).ok()?;

		let cert_der = CertificateDer::from(cert.der().to_vec());
		let key_der = PrivateKeyDer::try_from(key_pair.serialize_der()).ok()?;
		let provider = rustls::crypto::CryptoProvider::get_default()?;
		let certified_key = Arc::new(CertifiedKey::from_der(vec![cert_der], key_der, provider).ok()?);

		*self.self_signed.write() = Some(certified_key.clone());
		Some(certified_key)
	}
}

fn days_until(not_after: ASN1Time) -> i64 {
	let now = ASN1Time::now();
	(not_after.timestamp() - now.timestamp()) / 86400
}

/// Pure, non-blocking `(sniHost) -> certificate | null` selector (spec.md
/// §4.5). Like the teacher's `CertResolver`, reads only the in-memory cache
/// during the handshake; a miss triggers a background issuance attempt and
/// the handshake fails for that attempt (the next one finds the cache warm).
pub struct CertSelector {
	provider: Arc<LiveCertProvider>,
}

impl CertSelector {
	pub fn new(provider: Arc<LiveCertProvider>) -> Self {
		CertSelector { provider }
	}
}

impl std::fmt::Debug for CertSelector {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CertSelector").finish()
	}
}

impl ResolvesServerCert for CertSelector {
	fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
		let host = client_hello.server_name()?;

		if let Some(cached) = self.provider.cache.read().get(host).cloned() {
			return Some(cached.certified_key);
		}

		let decision = tokio::task::block_in_place(|| {
			tokio::runtime::Handle::current().block_on(self.provider.decide_for_host(host))
		});

		match decision {
			CertDecision::NoneFailTls => None,
			CertDecision::SelfSigned => self.provider.self_signed_cert(),
			CertDecision::RealIfPresent => {
				let loaded = tokio::task::block_in_place(|| {
					tokio::runtime::Handle::current().block_on(self.provider.try_load_issued(host))
				});
				match loaded {
					Ok(Some(cert)) => Some(cert),
					_ => {
						let provider = self.provider.clone();
						let host = host.to_string();
						tokio::spawn(async move {
							provider.try_queue_issue_if_missing(&host).await;
						});
						self.provider.self_signed_cert()
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn decide_ip_literal_is_self_signed() {
		let dir = tempfile::tempdir().unwrap();
		let config = Arc::new(ConfigService::load(dir.path().join("config.json")).await.unwrap());
		let challenges = Arc::new(super::super::challenge::ChallengeStore::new());
		let issuer =
			Arc::new(AcmeIssuer::new(CertEnv::Staging, dir.path().to_path_buf(), challenges));
		let provider = LiveCertProvider::new(
			config,
			dir.path().to_path_buf(),
			issuer,
			CertEnv::Staging,
			Vec::new(),
			Vec::new(),
		);
		assert_eq!(provider.decide_for_host("127.0.0.1").await, CertDecision::SelfSigned);
	}

	#[tokio::test]
	async fn decide_unknown_host_is_self_signed() {
		let dir = tempfile::tempdir().unwrap();
		let config = Arc::new(ConfigService::load(dir.path().join("config.json")).await.unwrap());
		let challenges = Arc::new(super::super::challenge::ChallengeStore::new());
		let issuer =
			Arc::new(AcmeIssuer::new(CertEnv::Staging, dir.path().to_path_buf(), challenges));
		let provider = LiveCertProvider::new(
			config,
			dir.path().to_path_buf(),
			issuer,
			CertEnv::Staging,
			Vec::new(),
			Vec::new(),
		);
		assert_eq!(provider.decide_for_host("unknown.example").await, CertDecision::SelfSigned);
	}
}

// vim: ts=4
