//! TLS lifecycle: ACME challenge store (C2), PKCS#12 certificate store (C3),
//! ACME issuer (C4), live cert provider (C5) and the background reconciler
//! (C6).

pub mod certstore;
pub mod challenge;
pub mod issuer;
pub mod provider;
pub mod reconciler;

// vim: ts=4
