//! C1: Config Service. Atomic JSON snapshot + exclusive-lock mutator over
//! the domain table, the optional wildcard-IPNS rule and the admin user
//! list (spec.md §3, §4.1). No teacher file does exactly this (cloudillo's
//! config lives in a SQL meta adapter, not a JSON file) - this is new code
//! in the teacher's durability idiom: temp-file + atomic rename, the same
//! discipline the teacher uses for cert writes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::core::password::bcrypt_hash;
use crate::prelude::*;

pub const DEFAULT_ADMIN_PASSWORD: &str = "truthgate";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DomainRecord {
	pub domain: String,
	#[serde(default)]
	pub use_ssl: bool,
	#[serde(default)]
	pub redirect_url: Option<String>,
	#[serde(default)]
	pub site_folder_leaf: String,
	#[serde(default)]
	pub tgp_folder_leaf: String,
	#[serde(default)]
	pub ipns_key_name: Option<String>,
	#[serde(default)]
	pub ipns_peer_id: Option<String>,
	#[serde(default)]
	pub last_published_cid: Option<String>,
	#[serde(default)]
	pub last_published_at: Option<i64>,
	#[serde(default)]
	pub enc_version: Option<u32>,
	#[serde(default)]
	pub enc_salt_b64: Option<String>,
	#[serde(default)]
	pub enc_cipher_b64: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WildcardIpnsRule {
	pub base_host: String,
	pub use_ssl: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
	pub username: String,
	pub password_hash: String,
}

fn default_true() -> bool {
	true
}

/// A naming key the IPNS reconciler (C9) mirrors into versioned pinned
/// folders, independent of the publish pipeline's own self-published keys
/// (spec.md §4.8 "Managed layout").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingKeyEntry {
	pub key_name: String,
	#[serde(default = "default_true")]
	pub auto_update: bool,
	#[serde(default)]
	pub keep_old_cid_pinned: bool,
	#[serde(default)]
	pub current_cid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigData {
	#[serde(default)]
	pub domains: HashMap<String, DomainRecord>,
	#[serde(default)]
	pub wildcard_rule: Option<WildcardIpnsRule>,
	#[serde(default)]
	pub users: Vec<UserRecord>,
	#[serde(default)]
	pub naming_keys: HashMap<String, NamingKeyEntry>,
}

impl ConfigData {
	/// Ensures an `admin` user exists with a default password hash, and
	/// that usernames are trimmed/lowercased (spec §4.1 deserialization
	/// normalization).
	fn normalize(&mut self) {
		for u in &mut self.users {
			u.username = u.username.trim().to_lowercase();
		}
		if !self.users.iter().any(|u| u.username == "admin") {
			warn!("config has no admin user, creating one with the default password");
			self.users.push(UserRecord {
				username: "admin".to_string(),
				password_hash: bcrypt_hash(DEFAULT_ADMIN_PASSWORD)
					.unwrap_or_else(|_| "*".to_string()),
			});
		}
	}

	/// Derive `siteFolderLeaf`/`tgpFolderLeaf` for a domain if they were
	/// left empty at creation time (spec §3 Domain record invariants: both
	/// are single path segments, no slashes, no `..`).
	pub fn fill_leaves(domain: &str, rec: &mut DomainRecord) {
		if rec.site_folder_leaf.is_empty() {
			rec.site_folder_leaf = safe_leaf(domain);
		}
		if rec.tgp_folder_leaf.is_empty() {
			rec.tgp_folder_leaf = format!("tgp-{}", rec.site_folder_leaf.replace('.', "-"));
		}
	}

	/// Authorized wildcard-IPNS hosts: `<label>.<baseHost>` where `<label>`
	/// equals some domain's `ipnsPeerId` or `ipnsKeyName` (spec §3).
	pub fn resolve_wildcard_host(&self, host: &str) -> Option<&DomainRecord> {
		let rule = self.wildcard_rule.as_ref()?;
		let suffix = format!(".{}", rule.base_host);
		let label = host.strip_suffix(&suffix)?;
		if label.is_empty() || label.contains('.') {
			return None;
		}
		self.domains.values().find(|d| {
			d.ipns_peer_id.as_deref() == Some(label) || d.ipns_key_name.as_deref() == Some(label)
		})
	}
}

/// Lowercase and reject path-unsafe characters, collapsing to a single
/// path segment (no slashes, no `..`).
pub fn safe_leaf(s: &str) -> String {
	let lower = s.to_lowercase();
	let mut out = String::with_capacity(lower.len());
	for c in lower.chars() {
		if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
			out.push(c);
		} else {
			out.push('-');
		}
	}
	out.trim_matches('-').to_string()
}

pub fn now_unix() -> i64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

pub struct ConfigService {
	path: PathBuf,
	data: RwLock<ConfigData>,
	mutate_lock: Mutex<()>,
}

impl ConfigService {
	pub async fn load(path: PathBuf) -> ClResult<Self> {
		let data = match tokio::fs::read(&path).await {
			Ok(bytes) => match serde_json::from_slice::<ConfigData>(&bytes) {
				Ok(mut data) => {
					data.normalize();
					data
				}
				Err(e) => {
					warn!("config parse failure at {:?}, starting with empty config: {}", path, e);
					let mut data = ConfigData::default();
					data.normalize();
					data
				}
			},
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				info!("no config file at {:?}, starting fresh", path);
				let mut data = ConfigData::default();
				data.normalize();
				data
			}
			Err(e) => return Err(Error::from(e)),
		};

		let svc = ConfigService { path, data: RwLock::new(data.clone()), mutate_lock: Mutex::new(()) };
		svc.persist(&data).await?;
		Ok(svc)
	}

	/// Deep-copy snapshot. Mutating the returned value never affects a
	/// subsequent `get()` (spec §8 invariant 7).
	pub async fn get(&self) -> ConfigData {
		self.data.read().await.clone()
	}

	/// Exclusive read-modify-write. Holds the mutator lock for the whole
	/// operation (spec §4.1, §5 "one exclusive lock around read-modify-write").
	pub async fn update<F>(&self, f: F) -> ClResult<()>
	where
		F: FnOnce(&mut ConfigData) -> ClResult<()>,
	{
		let _guard = self.mutate_lock.lock().await;
		let mut next = self.data.read().await.clone();
		f(&mut next)?;
		next.normalize();
		self.persist(&next).await?;
		*self.data.write().await = next;
		Ok(())
	}

	/// Temp-file + atomic rename + best-effort `.bak` copy of the previous
	/// snapshot, matching the cert store's durability discipline.
	async fn persist(&self, data: &ConfigData) -> ClResult<()> {
		if let Some(parent) = self.path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
			let backup = backup_path(&self.path);
			if let Err(e) = tokio::fs::copy(&self.path, &backup).await {
				warn!("failed to write config backup {:?}: {}", backup, e);
			}
		}

		let tmp = self.path.with_extension("json.tmp");
		let json = serde_json::to_vec_pretty(data)?;
		tokio::fs::write(&tmp, &json).await?;
		tokio::fs::rename(&tmp, &self.path).await?;
		Ok(())
	}
}

fn backup_path(path: &Path) -> PathBuf {
	let mut backup = path.as_os_str().to_owned();
	backup.push(".bak");
	PathBuf::from(backup)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn safe_leaf_strips_unsafe_chars() {
		assert_eq!(safe_leaf("Example.COM"), "example.com");
		assert_eq!(safe_leaf("foo/../bar"), "foo-.-bar");
	}

	#[test]
	fn fill_leaves_derives_from_domain() {
		let mut rec = DomainRecord { domain: "example.com".into(), ..Default::default() };
		ConfigData::fill_leaves("example.com", &mut rec);
		assert_eq!(rec.site_folder_leaf, "example.com");
		assert_eq!(rec.tgp_folder_leaf, "tgp-example-com");
	}

	#[tokio::test]
	async fn deep_copy_on_get() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.json");
		let svc = ConfigService::load(path).await.unwrap();

		let mut snap = svc.get().await;
		snap.domains.insert(
			"mutated.example".into(),
			DomainRecord { domain: "mutated.example".into(), ..Default::default() },
		);

		let snap2 = svc.get().await;
		assert!(!snap2.domains.contains_key("mutated.example"));
	}

	#[tokio::test]
	async fn admin_user_created_on_empty_config() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.json");
		let svc = ConfigService::load(path).await.unwrap();
		let snap = svc.get().await;
		assert!(snap.users.iter().any(|u| u.username == "admin"));
	}

	#[tokio::test]
	async fn wildcard_host_resolution() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("config.json");
		let svc = ConfigService::load(path).await.unwrap();
		svc.update(|cfg| {
			cfg.wildcard_rule =
				Some(WildcardIpnsRule { base_host: "gw.example".into(), use_ssl: true });
			cfg.domains.insert(
				"example.com".into(),
				DomainRecord {
					domain: "example.com".into(),
					ipns_peer_id: Some("k51abc".into()),
					..Default::default()
				},
			);
			Ok(())
		})
		.await
		.unwrap();

		let snap = svc.get().await;
		assert!(snap.resolve_wildcard_host("k51abc.gw.example").is_some());
		assert!(snap.resolve_wildcard_host("other.gw.example").is_none());
	}
}

// vim: ts=4
