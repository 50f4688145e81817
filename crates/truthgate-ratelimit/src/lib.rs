//! C10: Rate Limiter / Ban Engine. Per-IP and per-/64-prefix counters with
//! SQLite persistence, whitelists, grace pairs and TLS churn detection
//! (spec.md §4.9). Extracted into its own crate (mirroring the teacher's
//! `cloudillo-core` split) so the gateway's admin/proxy layers and the
//! limiter's hot-path maps build in parallel.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

pub mod addr;
pub mod config;
pub mod error;
pub mod limiter;
pub mod prelude;
pub mod store;

pub use addr::AddrKey;
pub use config::RateLimitConfig;
pub use error::{ClResult, Error};
pub use limiter::{RateLimiter, Scope};
pub use store::Store;

// vim: ts=4
