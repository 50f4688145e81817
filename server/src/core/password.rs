//! Password hashing helpers. CPU-bound bcrypt work that should normally go
//! through the `WorkerPool`; `hash`/`verify` are exposed as plain sync
//! functions so callers choose how to offload them.

use crate::prelude::*;

const BCRYPT_COST: u32 = 12;

pub fn bcrypt_hash(password: &str) -> ClResult<String> {
	bcrypt::hash(password, BCRYPT_COST).map_err(|e| Error::Internal(format!("bcrypt: {e}")))
}

pub fn bcrypt_verify(password: &str, hash: &str) -> bool {
	bcrypt::verify(password, hash).unwrap_or(false)
}

// vim: ts=4
