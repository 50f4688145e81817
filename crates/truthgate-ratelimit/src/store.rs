//! SQLite persistence for rate-limiter counters, bans, whitelist and grace
//! pairs (spec.md §4.9, §6.4 PRAGMAs). Grounded on
//! `adapters/meta-adapter-sqlite/src/lib.rs`'s pool setup (single writer
//! connection + `SqliteConnectOptions` WAL/synchronous/temp_store PRAGMAs)
//! and `schema.rs`'s `CREATE TABLE IF NOT EXISTS` migration style.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::prelude::*;

#[derive(Debug, Clone)]
pub struct Store {
	pool: SqlitePool,
}

impl Store {
	pub async fn open(path: impl AsRef<Path>) -> ClResult<Self> {
		if let Some(parent) = path.as_ref().parent() {
			tokio::fs::create_dir_all(parent).await.map_err(|e| Error::Internal(e.to_string()))?;
		}
		let opts = SqliteConnectOptions::new()
			.filename(path.as_ref())
			.create_if_missing(true)
			.journal_mode(SqliteJournalMode::Wal)
			.synchronous(SqliteSynchronous::Normal)
			.pragma("temp_store", "MEMORY");

		let pool = SqlitePoolOptions::new()
			.max_connections(4)
			.connect_with(opts)
			.await
			.map_err(Error::from)?;

		init_schema(&pool).await?;
		Ok(Store { pool })
	}

	#[cfg(test)]
	pub async fn open_memory() -> ClResult<Self> {
		let opts = SqliteConnectOptions::new()
			.filename(":memory:")
			.journal_mode(SqliteJournalMode::Memory);
		let pool = SqlitePoolOptions::new().max_connections(1).connect_with(opts).await.map_err(Error::from)?;
		init_schema(&pool).await?;
		Ok(Store { pool })
	}

	/// Idempotent upsert of one minute-bucket counter row (spec.md §4.9
	/// "idempotent upsert per `(ip, bucket)`").
	pub async fn flush_counter(&self, addr_key: &str, bucket: &str, delta: &CounterDelta) -> ClResult<()> {
		sqlx::query(
			"INSERT INTO ip_minute_counters
				(addr_key, bucket, public_calls, admin_bad_key, admin_good_key, gateway_calls, gateway_overage_used)
			VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
			ON CONFLICT(addr_key, bucket) DO UPDATE SET
				public_calls = public_calls + excluded.public_calls,
				admin_bad_key = admin_bad_key + excluded.admin_bad_key,
				admin_good_key = admin_good_key + excluded.admin_good_key,
				gateway_calls = gateway_calls + excluded.gateway_calls,
				gateway_overage_used = gateway_overage_used + excluded.gateway_overage_used",
		)
		.bind(addr_key)
		.bind(bucket)
		.bind(delta.public_calls)
		.bind(delta.admin_bad_key)
		.bind(delta.admin_good_key)
		.bind(delta.gateway_calls)
		.bind(delta.gateway_overage_used)
		.execute(&self.pool)
		.await
		.map_err(Error::from)?;
		Ok(())
	}

	/// Sum of `admin_bad_key` for `addr_key` across buckets `>= since_bucket`
	/// (bucket strings sort lexicographically, spec.md §4.9).
	pub async fn bad_key_count_since(&self, addr_key: &str, since_bucket: &str) -> ClResult<i64> {
		let row = sqlx::query(
			"SELECT COALESCE(SUM(admin_bad_key), 0) AS total FROM ip_minute_counters
				WHERE addr_key = ?1 AND bucket >= ?2",
		)
		.bind(addr_key)
		.bind(since_bucket)
		.fetch_one(&self.pool)
		.await
		.map_err(Error::from)?;
		Ok(row.get::<i64, _>("total"))
	}

	pub async fn insert_ban(&self, ban: &BanRow) -> ClResult<i64> {
		let res = sqlx::query(
			"INSERT INTO bans (addr_key, scope, ban_type, reason_code, created_utc, expires_utc)
				VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
		)
		.bind(&ban.addr_key)
		.bind(&ban.scope)
		.bind(&ban.ban_type)
		.bind(&ban.reason_code)
		.bind(ban.created_utc)
		.bind(ban.expires_utc)
		.execute(&self.pool)
		.await
		.map_err(Error::from)?;
		Ok(res.last_insert_rowid())
	}

	pub async fn load_active_bans(&self, now: i64) -> ClResult<Vec<BanRow>> {
		let rows = sqlx::query(
			"SELECT id, addr_key, scope, ban_type, reason_code, created_utc, expires_utc
				FROM bans WHERE expires_utc > ?1",
		)
		.bind(now)
		.fetch_all(&self.pool)
		.await
		.map_err(Error::from)?;
		Ok(rows
			.into_iter()
			.map(|r| BanRow {
				id: Some(r.get::<i64, _>("id")),
				addr_key: r.get("addr_key"),
				scope: r.get("scope"),
				ban_type: r.get("ban_type"),
				reason_code: r.get("reason_code"),
				created_utc: r.get("created_utc"),
				expires_utc: r.get("expires_utc"),
			})
			.collect())
	}

	pub async fn delete_ban_by_addr(&self, addr_key: &str) -> ClResult<()> {
		sqlx::query("DELETE FROM bans WHERE addr_key = ?1").bind(addr_key).execute(&self.pool).await.map_err(Error::from)?;
		Ok(())
	}

	pub async fn delete_ban_by_id(&self, id: i64) -> ClResult<()> {
		sqlx::query("DELETE FROM bans WHERE id = ?1").bind(id).execute(&self.pool).await.map_err(Error::from)?;
		Ok(())
	}

	pub async fn upsert_whitelist(&self, addr_key: &str, expires_utc: Option<i64>) -> ClResult<()> {
		sqlx::query(
			"INSERT INTO whitelist (addr_key, expires_utc) VALUES (?1, ?2)
				ON CONFLICT(addr_key) DO UPDATE SET expires_utc = excluded.expires_utc",
		)
		.bind(addr_key)
		.bind(expires_utc)
		.execute(&self.pool)
		.await
		.map_err(Error::from)?;
		Ok(())
	}

	pub async fn load_whitelist(&self) -> ClResult<Vec<(String, Option<i64>)>> {
		let rows = sqlx::query("SELECT addr_key, expires_utc FROM whitelist").fetch_all(&self.pool).await.map_err(Error::from)?;
		Ok(rows.into_iter().map(|r| (r.get("addr_key"), r.get("expires_utc"))).collect())
	}

	pub async fn upsert_grace_pair(&self, addr_key: &str, key_hash: &str, expires_utc: i64) -> ClResult<()> {
		sqlx::query(
			"INSERT INTO grace_pairs (addr_key, key_hash, expires_utc) VALUES (?1, ?2, ?3)
				ON CONFLICT(addr_key, key_hash) DO UPDATE SET expires_utc = excluded.expires_utc",
		)
		.bind(addr_key)
		.bind(key_hash)
		.bind(expires_utc)
		.execute(&self.pool)
		.await
		.map_err(Error::from)?;
		Ok(())
	}

	pub async fn has_grace_pair(&self, addr_key: &str, key_hash: &str, now: i64) -> ClResult<bool> {
		let row = sqlx::query(
			"SELECT COUNT(*) AS n FROM grace_pairs WHERE addr_key = ?1 AND key_hash = ?2 AND expires_utc > ?3",
		)
		.bind(addr_key)
		.bind(key_hash)
		.bind(now)
		.fetch_one(&self.pool)
		.await
		.map_err(Error::from)?;
		Ok(row.get::<i64, _>("n") > 0)
	}

	/// Daily purge (spec.md §4.9): delete counters and expired bans past
	/// their retention windows.
	pub async fn purge(&self, now: i64, counters_cutoff_bucket: &str, bans_cutoff: i64) -> ClResult<()> {
		sqlx::query("DELETE FROM ip_minute_counters WHERE bucket < ?1")
			.bind(counters_cutoff_bucket)
			.execute(&self.pool)
			.await
			.map_err(Error::from)?;
		sqlx::query("DELETE FROM bans WHERE expires_utc < ?1 AND expires_utc < ?2")
			.bind(now)
			.bind(bans_cutoff)
			.execute(&self.pool)
			.await
			.map_err(Error::from)?;
		sqlx::query("DELETE FROM grace_pairs WHERE expires_utc < ?1").bind(now).execute(&self.pool).await.map_err(Error::from)?;
		sqlx::query("DELETE FROM whitelist WHERE expires_utc IS NOT NULL AND expires_utc < ?1")
			.bind(now)
			.execute(&self.pool)
			.await
			.map_err(Error::from)?;
		Ok(())
	}
}

#[derive(Debug, Clone, Default)]
pub struct CounterDelta {
	pub public_calls: i64,
	pub admin_bad_key: i64,
	pub admin_good_key: i64,
	pub gateway_calls: i64,
	pub gateway_overage_used: i64,
}

#[derive(Debug, Clone)]
pub struct BanRow {
	pub id: Option<i64>,
	pub addr_key: String,
	pub scope: String,
	pub ban_type: String,
	pub reason_code: String,
	pub created_utc: i64,
	pub expires_utc: i64,
}

async fn init_schema(pool: &SqlitePool) -> ClResult<()> {
	let mut tx = pool.begin().await.map_err(Error::from)?;

	sqlx::query(
		"CREATE TABLE IF NOT EXISTS ip_minute_counters (
			addr_key text NOT NULL,
			bucket text NOT NULL,
			public_calls integer NOT NULL DEFAULT 0,
			admin_bad_key integer NOT NULL DEFAULT 0,
			admin_good_key integer NOT NULL DEFAULT 0,
			gateway_calls integer NOT NULL DEFAULT 0,
			gateway_overage_used integer NOT NULL DEFAULT 0,
			PRIMARY KEY (addr_key, bucket)
		)",
	)
	.execute(&mut *tx)
	.await
	.map_err(Error::from)?;

	sqlx::query("CREATE INDEX IF NOT EXISTS idx_counters_bucket ON ip_minute_counters(bucket)")
		.execute(&mut *tx)
		.await
		.map_err(Error::from)?;

	sqlx::query(
		"CREATE TABLE IF NOT EXISTS bans (
			id integer PRIMARY KEY AUTOINCREMENT,
			addr_key text NOT NULL,
			scope text NOT NULL,
			ban_type text NOT NULL,
			reason_code text NOT NULL,
			created_utc integer NOT NULL,
			expires_utc integer NOT NULL
		)",
	)
	.execute(&mut *tx)
	.await
	.map_err(Error::from)?;

	sqlx::query("CREATE INDEX IF NOT EXISTS idx_bans_addr ON bans(addr_key)")
		.execute(&mut *tx)
		.await
		.map_err(Error::from)?;

	sqlx::query(
		"CREATE TABLE IF NOT EXISTS whitelist (
			addr_key text NOT NULL PRIMARY KEY,
			expires_utc integer
		)",
	)
	.execute(&mut *tx)
	.await
	.map_err(Error::from)?;

	sqlx::query(
		"CREATE TABLE IF NOT EXISTS grace_pairs (
			addr_key text NOT NULL,
			key_hash text NOT NULL,
			expires_utc integer NOT NULL,
			PRIMARY KEY (addr_key, key_hash)
		)",
	)
	.execute(&mut *tx)
	.await
	.map_err(Error::from)?;

	tx.commit().await.map_err(Error::from)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn flush_counter_accumulates() {
		let store = Store::open_memory().await.unwrap();
		let delta = CounterDelta { admin_bad_key: 3, ..Default::default() };
		store.flush_counter("exact:1.2.3.4", "202601010000", &delta).await.unwrap();
		store.flush_counter("exact:1.2.3.4", "202601010000", &delta).await.unwrap();
		let total = store.bad_key_count_since("exact:1.2.3.4", "202601010000").await.unwrap();
		assert_eq!(total, 6);
	}

	#[tokio::test]
	async fn ban_insert_and_load() {
		let store = Store::open_memory().await.unwrap();
		let ban = BanRow {
			id: None,
			addr_key: "exact:1.2.3.4".into(),
			scope: "admin".into(),
			ban_type: "soft".into(),
			reason_code: "bad-key".into(),
			created_utc: 1000,
			expires_utc: 2000,
		};
		store.insert_ban(&ban).await.unwrap();
		let active = store.load_active_bans(1500).await.unwrap();
		assert_eq!(active.len(), 1);
		let expired = store.load_active_bans(2500).await.unwrap();
		assert!(expired.is_empty());
	}

	#[tokio::test]
	async fn grace_pair_upsert_and_check() {
		let store = Store::open_memory().await.unwrap();
		store.upsert_grace_pair("exact:1.2.3.4", "hash1", 2000).await.unwrap();
		assert!(store.has_grace_pair("exact:1.2.3.4", "hash1", 1000).await.unwrap());
		assert!(!store.has_grace_pair("exact:1.2.3.4", "hash1", 2500).await.unwrap());
	}
}

// vim: ts=4
