//! Process-wide settings, read once from the environment at startup.
//!
//! No config crate is pulled in for this - the teacher codebase parses its
//! own startup environment by hand (`basic-server/src/main.rs`), so we do
//! the same here, just with more variables (see spec.md §6.4).

use std::path::PathBuf;

use crate::prelude::*;

#[derive(Debug, Clone)]
pub struct Settings {
	/// `TRUTHGATE_CONFIG_PATH` - absolute path to the JSON domain config.
	pub config_path: PathBuf,
	/// `TRUTHGATE_CERT_PATH` - directory for PKCS#12 files + ACME account key.
	pub cert_path: PathBuf,
	/// `TRUTHGATE_CERT_IPS` - CSV of IPs for self-signed SAN generation.
	pub cert_ips: Vec<String>,
	/// `TRUTHGATE_CERT_DNS` - CSV of DNS names for self-signed SAN generation.
	pub cert_dns: Vec<String>,
	/// Node (content-addressed storage) HTTP API base URL.
	pub node_api_url: String,
	/// Node HTTP gateway base URL (serves `/ipfs/<cid>/...`).
	pub node_gateway_url: String,
	/// SQLite database path for the rate limiter's persisted counters.
	pub ratelimit_db_path: PathBuf,
	/// ACME contact email. Issuance is disabled entirely if unset.
	pub acme_email: Option<String>,
	/// Use the ACME staging directory instead of production.
	pub acme_staging: bool,
	/// Admin API key (bootstrap credential, in addition to the `admin` user
	/// in the JSON config).
	pub admin_api_key: Option<String>,
	/// `:80` bind address for ACME HTTP-01 + redirect.
	pub http_addr: String,
	/// Optional secondary plain-HTTP bind address (dev convenience, e.g. `:8080`).
	pub http_alt_addr: Option<String>,
	/// `:443` bind address for TLS.
	pub https_addr: String,
}

fn env_csv(name: &str) -> Vec<String> {
	std::env::var(name)
		.ok()
		.map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
		.unwrap_or_default()
}

fn env_bool(name: &str, default: bool) -> bool {
	match std::env::var(name) {
		Ok(v) => matches!(v.trim(), "1" | "true" | "TRUE" | "yes"),
		Err(_) => default,
	}
}

impl Settings {
	/// Parse settings from the process environment. Missing mandatory
	/// variables are fatal (spec §6.5: exit non-zero).
	pub fn from_env() -> ClResult<Self> {
		let config_path = std::env::var("TRUTHGATE_CONFIG_PATH")
			.map_err(|_| Error::ConfigError("TRUTHGATE_CONFIG_PATH is not set".into()))?;
		let config_path = shellexpand_home(&config_path);

		let cert_path = std::env::var("TRUTHGATE_CERT_PATH")
			.unwrap_or_else(|_| "/opt/truthgate/certs".to_string());

		Ok(Settings {
			config_path: PathBuf::from(config_path),
			cert_path: PathBuf::from(shellexpand_home(&cert_path)),
			cert_ips: env_csv("TRUTHGATE_CERT_IPS"),
			cert_dns: env_csv("TRUTHGATE_CERT_DNS"),
			node_api_url: std::env::var("TRUTHGATE_NODE_API_URL")
				.unwrap_or_else(|_| "http://127.0.0.1:5001".to_string()),
			node_gateway_url: std::env::var("TRUTHGATE_NODE_GATEWAY_URL")
				.unwrap_or_else(|_| "http://127.0.0.1:8080".to_string()),
			ratelimit_db_path: PathBuf::from(
				std::env::var("TRUTHGATE_RATELIMIT_DB")
					.unwrap_or_else(|_| "/opt/truthgate/ratelimit.db".to_string()),
			),
			acme_email: std::env::var("TRUTHGATE_ACME_EMAIL").ok(),
			acme_staging: env_bool("TRUTHGATE_ACME_STAGING", false),
			admin_api_key: std::env::var("TRUTHGATE_ADMIN_API_KEY").ok(),
			http_addr: std::env::var("TRUTHGATE_HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:80".to_string()),
			http_alt_addr: std::env::var("TRUTHGATE_HTTP_ALT_ADDR").ok(),
			https_addr: std::env::var("TRUTHGATE_HTTPS_ADDR")
				.unwrap_or_else(|_| "0.0.0.0:443".to_string()),
		})
	}
}

/// Minimal `~` expansion - we don't pull in a whole crate for this.
fn shellexpand_home(path: &str) -> String {
	if let Some(rest) = path.strip_prefix("~/") {
		if let Ok(home) = std::env::var("HOME") {
			return format!("{home}/{rest}");
		}
	}
	path.to_string()
}

// vim: ts=4
