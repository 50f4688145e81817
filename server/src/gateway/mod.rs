//! C11 Gateway Proxy / Router: the content-addressed reverse proxy that
//! serves published sites and wildcard-IPNS pointer bundles (spec.md §4.10).
//! Split into the pieces a request flows through in order: `resolve` (host
//! and path -> content root), `cache` (the tiered cache backing step 3 of
//! that resolution), `rewrite` (on-the-fly HTML post-processing), and
//! `handler` (the forwarding glue that ties them together).

pub mod cache;
pub mod handler;
pub mod resolve;
pub mod rewrite;

pub use cache::TieredCache;
pub use handler::serve_content;
pub use resolve::ContentRoot;

// vim: ts=4
