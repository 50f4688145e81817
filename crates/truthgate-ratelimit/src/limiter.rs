//! C10: Rate Limiter / Ban Engine (spec.md §4.9). In-memory hot path over
//! `parking_lot`-guarded maps, backed by SQLite via `Store` for durability.
//! Synthesizes two teacher patterns that never coexist in one file: the
//! governor-based `RateLimitManager`'s ban-list/penalty shape
//! (`rate_limit/limiter.rs`) and the sqlx WAL pool discipline from
//! `meta-adapter-sqlite` (kept in `store.rs`), generalized to spec.md's
//! minute-bucket counters, whitelist, grace pairs and TLS churn detector -
//! none of which the teacher's in-memory-only limiter has.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{TimeZone, Utc};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use crate::addr::{all_keys, AddrKey};
use crate::config::RateLimitConfig;
use crate::prelude::*;
use crate::store::{BanRow, CounterDelta, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
	Public,
	Admin,
	Gateway,
	Global,
}

impl Scope {
	fn as_str(self) -> &'static str {
		match self {
			Scope::Public => "public",
			Scope::Admin => "admin",
			Scope::Gateway => "gateway",
			Scope::Global => "global",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanType {
	Soft,
	True,
}

impl BanType {
	fn as_str(self) -> &'static str {
		match self {
			BanType::Soft => "soft",
			BanType::True => "true",
		}
	}
}

#[derive(Debug, Clone)]
pub struct BanInfo {
	pub id: Option<i64>,
	pub addr_key: AddrKey,
	pub scope: Scope,
	pub ban_type: BanType,
	pub reason_code: String,
	pub created_utc: i64,
	pub expires_utc: i64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
	public_calls: u32,
	admin_bad_key: u32,
	admin_good_key: u32,
	gateway_calls: u32,
	gateway_overage_used: u32,
}

#[derive(Debug, Default)]
struct ChurnEntry {
	new_connections: u32,
	requests: u32,
}

pub struct RateLimiter {
	cfg: RateLimitConfig,
	store: Arc<Store>,
	counters: RwLock<HashMap<(AddrKey, String), Counters>>,
	dirty: RwLock<HashMap<(AddrKey, String), CounterDelta>>,
	bans: RwLock<HashMap<AddrKey, BanInfo>>,
	whitelist: RwLock<HashMap<AddrKey, Option<i64>>>,
	churn: RwLock<HashMap<(AddrKey, i64), ChurnEntry>>,
}

fn now_unix() -> i64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// `yyyyMMddHHmm` - sorts lexicographically, per spec.md §4.9.
fn minute_bucket(ts: i64) -> String {
	Utc.timestamp_opt(ts, 0).single().map_or_else(|| "000000000000".to_string(), |dt| dt.format("%Y%m%d%H%M").to_string())
}

pub fn hash_api_key(key: &str) -> String {
	let mut hasher = Sha256::new();
	hasher.update(key.as_bytes());
	format!("{:x}", hasher.finalize())
}

impl RateLimiter {
	pub async fn new(cfg: RateLimitConfig, db_path: impl AsRef<std::path::Path>) -> ClResult<Arc<Self>> {
		let store = Arc::new(Store::open(db_path).await?);
		let limiter = Arc::new(RateLimiter {
			cfg,
			store,
			counters: RwLock::new(HashMap::new()),
			dirty: RwLock::new(HashMap::new()),
			bans: RwLock::new(HashMap::new()),
			whitelist: RwLock::new(HashMap::new()),
			churn: RwLock::new(HashMap::new()),
		});
		limiter.load_from_store().await?;
		Ok(limiter)
	}

	async fn load_from_store(&self) -> ClResult<()> {
		let now = now_unix();
		for row in self.store.load_active_bans(now).await? {
			if let Some(info) = ban_row_to_info(&row) {
				self.bans.write().insert(info.addr_key, info);
			}
		}
		for (addr_key, expires) in self.store.load_whitelist().await? {
			if let Some(key) = AddrKey::parse_db_string(&addr_key) {
				self.whitelist.write().insert(key, expires);
			}
		}
		Ok(())
	}

	/// Spawns the 7s flusher and the daily purger (spec.md §4.9, §5).
	pub fn spawn_background(self: &Arc<Self>) {
		let flusher = self.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(flusher.cfg.flush_interval);
			loop {
				ticker.tick().await;
				flusher.flush().await;
			}
		});

		let purger = self.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(purger.cfg.purge_interval);
			loop {
				ticker.tick().await;
				purger.purge().await;
			}
		});
	}

	async fn flush(&self) {
		let pending: Vec<((AddrKey, String), CounterDelta)> = {
			let mut dirty = self.dirty.write();
			std::mem::take(&mut *dirty).into_iter().collect()
		};
		for ((key, bucket), delta) in pending {
			if let Err(e) = self.store.flush_counter(&key.to_db_string(), &bucket, &delta).await {
				warn!("rate limiter: failed to flush counters for {:?}: {}", key, e);
			}
		}
	}

	async fn purge(&self) {
		let now = now_unix();
		let counters_cutoff = minute_bucket(now - self.cfg.purge_counters_older_than_days * 86400);
		let bans_cutoff = now - self.cfg.purge_expired_bans_older_than_days * 86400;
		if let Err(e) = self.store.purge(now, &counters_cutoff, bans_cutoff).await {
			warn!("rate limiter: daily purge failed: {}", e);
		}
	}

	fn is_whitelisted(&self, addr: IpAddr) -> bool {
		let now = now_unix();
		let whitelist = self.whitelist.read();
		for key in all_keys(addr) {
			if let Some(expires) = whitelist.get(&key) {
				if expires.is_none_or(|e| e > now) {
					return true;
				}
			}
		}
		false
	}

	/// `isBanned(ctx)` (spec.md §4.9 "Gate"): true iff not whitelisted AND an
	/// unexpired exact-IP or `/64`-prefix ban exists. Expired entries are
	/// evicted lazily.
	pub fn is_banned(&self, addr: IpAddr) -> bool {
		if self.is_whitelisted(addr) {
			return false;
		}
		let now = now_unix();
		let mut bans = self.bans.write();
		for key in all_keys(addr) {
			if let Some(ban) = bans.get(&key) {
				if ban.expires_utc <= now {
					bans.remove(&key);
				} else {
					return true;
				}
			}
		}
		false
	}

	fn bump(&self, addr: IpAddr, scope: Scope, bad_key: bool) {
		let now = now_unix();
		let bucket = minute_bucket(now);
		for key in all_keys(addr) {
			let entry_key = (key, bucket.clone());
			let mut counters = self.counters.write();
			let c = counters.entry(entry_key.clone()).or_default();
			let mut delta = CounterDelta::default();
			match scope {
				Scope::Public => {
					c.public_calls += 1;
					delta.public_calls = 1;
				}
				Scope::Admin if bad_key => {
					c.admin_bad_key += 1;
					delta.admin_bad_key = 1;
				}
				Scope::Admin => {
					c.admin_good_key += 1;
					delta.admin_good_key = 1;
				}
				Scope::Gateway => {
					c.gateway_calls += 1;
					delta.gateway_calls = 1;
				}
				Scope::Global => {}
			}
			drop(counters);
			let mut dirty = self.dirty.write();
			let d = dirty.entry(entry_key).or_default();
			d.public_calls += delta.public_calls;
			d.admin_bad_key += delta.admin_bad_key;
			d.admin_good_key += delta.admin_good_key;
			d.gateway_calls += delta.gateway_calls;
			d.gateway_overage_used += delta.gateway_overage_used;
		}
	}

	pub fn record_public_call(&self, addr: IpAddr) {
		self.bump(addr, Scope::Public, false);
	}

	pub fn record_gateway_call(&self, addr: IpAddr) {
		self.bump(addr, Scope::Gateway, false);
	}

	/// `recordFailure(admin=true)` (spec.md §4.9): bumps the bad-key counter,
	/// then sums bad-key counts for the IP across the last 24h (in-memory +
	/// SQLite) and soft-bans once the threshold is reached.
	pub async fn record_admin_failure(&self, addr: IpAddr) {
		self.bump(addr, Scope::Admin, true);

		let key = AddrKey::exact(addr);
		let now = now_unix();
		let since_bucket = minute_bucket(now - self.cfg.bad_key_lookback.as_secs() as i64);

		let persisted = self.store.bad_key_count_since(&key.to_db_string(), &since_bucket).await.unwrap_or(0);
		let in_memory: i64 = self
			.counters
			.read()
			.iter()
			.filter(|((k, bucket), _)| *k == key && bucket.as_str() >= since_bucket.as_str())
			.map(|(_, c)| i64::from(c.admin_bad_key))
			.sum();

		if persisted + in_memory >= i64::from(self.cfg.bad_key_threshold) {
			self.ban_ip(
				addr,
				self.cfg.bad_key_ban_duration,
				Scope::Admin,
				BanType::Soft,
				"too-many-bad-keys",
			)
			.await;
		}
	}

	/// `recordSuccess(apiKey?)` (spec.md §4.9): bumps the good counter and,
	/// if an API key was presented, upserts a grace pair.
	pub async fn record_admin_success(&self, addr: IpAddr, api_key: Option<&str>) {
		self.bump(addr, Scope::Admin, false);
		if let Some(key) = api_key {
			let hash = hash_api_key(key);
			let expires = now_unix() + self.cfg.grace_days * 86400;
			let addr_key = AddrKey::exact(addr).to_db_string();
			if let Err(e) = self.store.upsert_grace_pair(&addr_key, &hash, expires).await {
				warn!("rate limiter: failed to persist grace pair: {}", e);
			}
		}
	}

	pub async fn has_grace(&self, addr: IpAddr, api_key: &str) -> bool {
		let addr_key = AddrKey::exact(addr).to_db_string();
		let hash = hash_api_key(api_key);
		self.store.has_grace_pair(&addr_key, &hash, now_unix()).await.unwrap_or(false)
	}

	pub async fn ban_ip(&self, addr: IpAddr, duration: Duration, scope: Scope, ban_type: BanType, reason: &str) {
		self.ban_key(AddrKey::exact(addr), duration, scope, ban_type, reason).await;
	}

	pub async fn ban_ipv6_prefix(&self, addr: IpAddr, duration: Duration, scope: Scope, ban_type: BanType, reason: &str) {
		self.ban_key(AddrKey::prefix64(addr), duration, scope, ban_type, reason).await;
	}

	async fn ban_key(&self, key: AddrKey, duration: Duration, scope: Scope, ban_type: BanType, reason: &str) {
		let now = now_unix();
		let row = BanRow {
			id: None,
			addr_key: key.to_db_string(),
			scope: scope.as_str().to_string(),
			ban_type: ban_type.as_str().to_string(),
			reason_code: reason.to_string(),
			created_utc: now,
			expires_utc: now + duration.as_secs() as i64,
		};
		let id = self.store.insert_ban(&row).await.ok();
		self.bans.write().insert(
			key,
			BanInfo {
				id,
				addr_key: key,
				scope,
				ban_type,
				reason_code: reason.to_string(),
				created_utc: now,
				expires_utc: now + duration.as_secs() as i64,
			},
		);
	}

	/// `unbanIp` (spec.md §4.9): removes the ban and purges recent counters
	/// within `unbanReset` so a `recordFailure` right after unban doesn't
	/// immediately re-ban.
	pub async fn unban_ip(&self, addr: IpAddr) {
		let key = AddrKey::exact(addr);
		self.bans.write().remove(&key);
		let _ = self.store.delete_ban_by_addr(&key.to_db_string()).await;

		let cutoff = minute_bucket(now_unix() - self.cfg.unban_reset_window.as_secs() as i64);
		self.counters.write().retain(|(k, bucket), _| !(*k == key && bucket.as_str() >= cutoff.as_str()));
	}

	pub async fn unban_ipv6_prefix(&self, addr: IpAddr) {
		let key = AddrKey::prefix64(addr);
		self.bans.write().remove(&key);
		let _ = self.store.delete_ban_by_addr(&key.to_db_string()).await;
	}

	pub async fn unban_by_id(&self, id: i64) {
		self.bans.write().retain(|_, ban| ban.id != Some(id));
		let _ = self.store.delete_ban_by_id(id).await;
	}

	pub async fn whitelist_add(&self, addr: IpAddr, expires_utc: Option<i64>) {
		let key = AddrKey::exact(addr);
		self.whitelist.write().insert(key, expires_utc);
		let _ = self.store.upsert_whitelist(&key.to_db_string(), expires_utc).await;
	}

	pub fn list_bans(&self) -> Vec<BanInfo> {
		self.bans.read().values().cloned().collect()
	}

	/// TLS churn detector (spec.md §4.9, §9 Open Question: applied without
	/// consulting the whitelist, per the spec's literal text - flagged as
	/// the spec-acknowledged likely bug rather than silently fixed).
	pub async fn on_connection_opened(&self, addr: IpAddr) {
		let bucket = now_unix() / self.cfg.churn_window.as_secs().max(1) as i64;
		let key = AddrKey::exact(addr);
		let mut churn = self.churn.write();
		churn.entry((key, bucket)).or_default().new_connections += 1;
		drop(churn);
		self.maybe_apply_churn_ban(addr, bucket).await;
	}

	pub fn on_request_observed(&self, addr: IpAddr) {
		let bucket = now_unix() / self.cfg.churn_window.as_secs().max(1) as i64;
		let key = AddrKey::exact(addr);
		self.churn.write().entry((key, bucket)).or_default().requests += 1;
	}

	async fn maybe_apply_churn_ban(&self, addr: IpAddr, bucket: i64) {
		let key = AddrKey::exact(addr);
		let (new_conns, reqs) = {
			let churn = self.churn.read();
			match churn.get(&(key, bucket)) {
				Some(e) => (e.new_connections, e.requests),
				None => return,
			}
		};
		if new_conns <= self.cfg.churn_new_conn_threshold {
			return;
		}
		let avg = f64::from(reqs) / f64::from(new_conns);
		if avg <= self.cfg.churn_min_reqs_per_conn {
			self.ban_ip(addr, self.cfg.churn_ban_duration, Scope::Global, BanType::Soft, "tls-churn").await;
		}
	}
}

fn ban_row_to_info(row: &BanRow) -> Option<BanInfo> {
	let key = AddrKey::parse_db_string(&row.addr_key)?;
	let scope = match row.scope.as_str() {
		"public" => Scope::Public,
		"admin" => Scope::Admin,
		"gateway" => Scope::Gateway,
		_ => Scope::Global,
	};
	let ban_type = if row.ban_type == "true" { BanType::True } else { BanType::Soft };
	Some(BanInfo {
		id: row.id,
		addr_key: key,
		scope,
		ban_type,
		reason_code: row.reason_code.clone(),
		created_utc: row.created_utc,
		expires_utc: row.expires_utc,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::Ipv4Addr;

	async fn test_limiter() -> Arc<RateLimiter> {
		let dir = tempfile::tempdir().unwrap();
		RateLimiter::new(RateLimitConfig::default(), dir.path().join("rl.db")).await.unwrap()
	}

	#[tokio::test]
	async fn ban_and_unban_round_trip() {
		let limiter = test_limiter().await;
		let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
		assert!(!limiter.is_banned(ip));
		limiter.ban_ip(ip, Duration::from_secs(60), Scope::Admin, BanType::Soft, "test").await;
		assert!(limiter.is_banned(ip));
		limiter.unban_ip(ip).await;
		assert!(!limiter.is_banned(ip));
	}

	#[tokio::test]
	async fn whitelist_overrides_ban() {
		let limiter = test_limiter().await;
		let ip = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
		limiter.ban_ip(ip, Duration::from_secs(60), Scope::Admin, BanType::Soft, "test").await;
		assert!(limiter.is_banned(ip));
		limiter.whitelist_add(ip, None).await;
		assert!(!limiter.is_banned(ip));
	}

	#[tokio::test]
	async fn repeated_admin_failures_trigger_soft_ban() {
		let mut cfg = RateLimitConfig::default();
		cfg.bad_key_threshold = 3;
		let dir = tempfile::tempdir().unwrap();
		let limiter = RateLimiter::new(cfg, dir.path().join("rl.db")).await.unwrap();
		let ip = IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8));

		for _ in 0..2 {
			limiter.record_admin_failure(ip).await;
			assert!(!limiter.is_banned(ip));
		}
		limiter.record_admin_failure(ip).await;
		assert!(limiter.is_banned(ip));
	}

	#[tokio::test]
	async fn ipv6_prefix_ban_scopes_to_64() {
		let limiter = test_limiter().await;
		let banned: IpAddr = "2001:db8:1:2::5".parse().unwrap();
		let same_prefix: IpAddr = "2001:db8:1:2::9".parse().unwrap();
		let other_prefix: IpAddr = "2001:db8:1:3::5".parse().unwrap();

		limiter.ban_ipv6_prefix(banned, Duration::from_secs(60), Scope::Global, BanType::Soft, "test").await;
		assert!(limiter.is_banned(same_prefix));
		assert!(!limiter.is_banned(other_prefix));
	}

	#[tokio::test]
	async fn flush_moves_counters_to_store() {
		let limiter = test_limiter().await;
		let ip = IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9));
		limiter.record_public_call(ip);
		limiter.flush().await;
		assert!(limiter.dirty.read().is_empty());
	}
}

// vim: ts=4
