//! Domain backup/import (spec.md §6.1, §6.2): passphrase-encrypted export of
//! a domain's identity (leaves, IPNS key material) as a `DomainBackup` JSON
//! document. New code - no teacher file does passphrase-based key escrow -
//! written in the config service's plain-struct-plus-serde idiom, using
//! `scrypt` (key derivation) and `aes-gcm` (AEAD) the way the teacher reaches
//! for `sha2`/`hmac` elsewhere rather than hand-rolling either primitive.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use scrypt::Params;
use serde::{Deserialize, Serialize};

use crate::config::DomainRecord;
use crate::prelude::*;

const SCRYPT_LOG_N: u8 = 14; // N = 2^14
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const SCRYPT_KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainBackup {
	#[serde(rename = "Domain")]
	pub domain: String,
	#[serde(rename = "SiteFolderLeaf")]
	pub site_folder_leaf: String,
	#[serde(rename = "TgpFolderLeaf")]
	pub tgp_folder_leaf: String,
	#[serde(rename = "IpnsKeyName")]
	pub ipns_key_name: Option<String>,
	#[serde(rename = "IpnsPeerId")]
	pub ipns_peer_id: Option<String>,
	#[serde(rename = "LastPublishedCid")]
	pub last_published_cid: Option<String>,
	#[serde(rename = "EncVersion")]
	pub enc_version: u32,
	#[serde(rename = "SaltB64")]
	pub salt_b64: String,
	#[serde(rename = "CipherB64")]
	pub cipher_b64: String,
}

fn derive_key(passphrase: &str, salt: &[u8]) -> ClResult<[u8; SCRYPT_KEY_LEN]> {
	let params = Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, SCRYPT_KEY_LEN)
		.map_err(|e| Error::CryptoError(format!("invalid scrypt params: {e}")))?;
	let mut key = [0u8; SCRYPT_KEY_LEN];
	scrypt::scrypt(passphrase.as_bytes(), salt, &params, &mut key)
		.map_err(|e| Error::CryptoError(format!("scrypt derivation failed: {e}")))?;
	Ok(key)
}

/// Encrypts `plaintext` (the node's exported key material) under
/// `passphrase`, returning `(saltB64, cipherB64)` where `cipherB64` decodes
/// to `nonce‖ciphertext‖tag` (spec.md §6.2).
fn encrypt(passphrase: &str, plaintext: &[u8]) -> ClResult<(String, String)> {
	let mut salt = [0u8; SALT_LEN];
	rand::Rng::fill(&mut rand::rng(), &mut salt);
	let key_bytes = derive_key(passphrase, &salt)?;

	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
	let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
	let ciphertext = cipher
		.encrypt(&nonce, plaintext)
		.map_err(|_| Error::CryptoError("AES-GCM encryption failed".into()))?;

	let mut sealed = Vec::with_capacity(nonce.len() + ciphertext.len());
	sealed.extend_from_slice(&nonce);
	sealed.extend_from_slice(&ciphertext);

	let b64 = base64::engine::general_purpose::STANDARD;
	Ok((b64.encode(salt), b64.encode(sealed)))
}

fn decrypt(passphrase: &str, salt_b64: &str, cipher_b64: &str) -> ClResult<Vec<u8>> {
	let b64 = base64::engine::general_purpose::STANDARD;
	let salt =
		b64.decode(salt_b64).map_err(|_| Error::ValidationError("invalid backup salt encoding".into()))?;
	let sealed = b64
		.decode(cipher_b64)
		.map_err(|_| Error::ValidationError("invalid backup cipher encoding".into()))?;
	if sealed.len() < 12 {
		return Err(Error::ValidationError("backup cipher payload too short".into()));
	}
	let (nonce_bytes, ciphertext) = sealed.split_at(12);

	let key_bytes = derive_key(passphrase, &salt)?;
	let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
	let nonce = Nonce::<Aes256Gcm>::from_slice(nonce_bytes);
	cipher
		.decrypt(nonce, ciphertext)
		.map_err(|_| Error::ValidationError("wrong passphrase or corrupted backup".into()))
}

/// Builds a `DomainBackup` for `rec`, encrypting `key_material` (the node's
/// exported IPNS key, or an empty payload if the domain has no key yet)
/// under `passphrase`.
pub fn export(rec: &DomainRecord, key_material: &[u8], passphrase: &str) -> ClResult<DomainBackup> {
	let (salt_b64, cipher_b64) = encrypt(passphrase, key_material)?;
	Ok(DomainBackup {
		domain: rec.domain.clone(),
		site_folder_leaf: rec.site_folder_leaf.clone(),
		tgp_folder_leaf: rec.tgp_folder_leaf.clone(),
		ipns_key_name: rec.ipns_key_name.clone(),
		ipns_peer_id: rec.ipns_peer_id.clone(),
		last_published_cid: rec.last_published_cid.clone(),
		enc_version: 1,
		salt_b64,
		cipher_b64,
	})
}

/// Decrypts `backup`'s key material under `passphrase`, returning the raw
/// bytes to hand to `Node::key_import`.
pub fn decrypt_key_material(backup: &DomainBackup, passphrase: &str) -> ClResult<Vec<u8>> {
	if backup.enc_version != 1 {
		return Err(Error::ValidationError(format!(
			"unsupported backup encoding version: {}",
			backup.enc_version
		)));
	}
	decrypt(passphrase, &backup.salt_b64, &backup.cipher_b64)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn export_then_decrypt_round_trips() {
		let rec = DomainRecord {
			domain: "example.com".into(),
			site_folder_leaf: "example.com".into(),
			tgp_folder_leaf: "tgp-example-com".into(),
			ipns_key_name: Some("tg-example-com".into()),
			ipns_peer_id: Some("k51abc".into()),
			last_published_cid: Some("bafy123".into()),
			..Default::default()
		};
		let key_material = b"pretend-protobuf-key-bytes";
		let backup = export(&rec, key_material, "correct horse battery staple").unwrap();

		assert_eq!(backup.domain, "example.com");
		assert_eq!(backup.ipns_peer_id.as_deref(), Some("k51abc"));

		let recovered = decrypt_key_material(&backup, "correct horse battery staple").unwrap();
		assert_eq!(recovered, key_material);
	}

	#[test]
	fn wrong_passphrase_fails() {
		let rec = DomainRecord { domain: "example.com".into(), ..Default::default() };
		let backup = export(&rec, b"secret", "right-pass").unwrap();
		assert!(decrypt_key_material(&backup, "wrong-pass").is_err());
	}
}

// vim: ts=4
