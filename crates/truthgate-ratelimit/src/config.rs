//! C10 tuning knobs (spec.md §4.9): ban thresholds/durations, TLS churn
//! detector parameters and SQLite retention windows. New code - the teacher's
//! `rate_limit/config.rs` tunes governor quotas per endpoint category, a
//! shape this crate doesn't use; kept as a plain struct with `Default` in
//! the same idiom.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
	/// Bad-key admin requests within the lookback window before a soft ban
	/// is issued (spec.md §4.9 `recordFailure`).
	pub bad_key_threshold: u32,
	/// Lookback window for counting bad-key calls.
	pub bad_key_lookback: Duration,
	/// Soft-ban duration applied once `bad_key_threshold` is reached.
	pub bad_key_ban_duration: Duration,
	/// TTL of a grace pair `(ip, hash(api key))` after a successful auth.
	pub grace_days: i64,
	/// TLS churn detector observation window.
	pub churn_window: Duration,
	/// New connections per window required to consider an IP churning.
	pub churn_new_conn_threshold: u32,
	/// Requests-per-new-connection at or below which churn is suspicious.
	pub churn_min_reqs_per_conn: f64,
	/// Ban duration applied by the churn detector.
	pub churn_ban_duration: Duration,
	/// In-memory-to-SQLite flush interval (spec.md §4.9, §5 "rate-limiter
	/// flush: 7s").
	pub flush_interval: Duration,
	/// Daily purge interval.
	pub purge_interval: Duration,
	/// Delete minute counters older than this many days.
	pub purge_counters_older_than_days: i64,
	/// Delete expired bans older than this many days.
	pub purge_expired_bans_older_than_days: i64,
	/// Window of recent counters cleared on `unbanIp` to avoid an immediate
	/// re-ban (spec.md §4.9 `unbanIp`).
	pub unban_reset_window: Duration,
}

impl Default for RateLimitConfig {
	fn default() -> Self {
		RateLimitConfig {
			bad_key_threshold: 10,
			bad_key_lookback: Duration::from_secs(24 * 3600),
			bad_key_ban_duration: Duration::from_secs(3600),
			grace_days: 7,
			churn_window: Duration::from_secs(60),
			churn_new_conn_threshold: 20,
			churn_min_reqs_per_conn: 1.0,
			churn_ban_duration: Duration::from_secs(15 * 60),
			flush_interval: Duration::from_secs(7),
			purge_interval: Duration::from_secs(24 * 3600),
			purge_counters_older_than_days: 30,
			purge_expired_bans_older_than_days: 30,
			unban_reset_window: Duration::from_secs(600),
		}
	}
}

// vim: ts=4
