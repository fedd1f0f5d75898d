//! Client identity resolution for rate limiting.
//!
//! Identity is an opaque grouping key, not an authenticated principal. The
//! resolver prefers the first hop of `X-Forwarded-For` (the daemon normally
//! sits behind a reverse proxy), falls back to the peer socket address, and
//! finally to a shared sentinel. The sentinel deliberately merges all
//! unresolvable callers into one shared rate budget.

use std::net::SocketAddr;

use axum::http::HeaderMap;

/// Shared bucket for callers whose identity cannot be resolved.
pub const SENTINEL_IDENTITY: &str = "unidentified";

/// Resolve the rate-limit identity for an inbound request.
///
/// Pure function, no state or I/O.
pub fn resolve(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        // First hop is the original client; later hops are proxies.
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    match peer {
        Some(addr) => addr.ip().to_string(),
        None => SENTINEL_IDENTITY.to_string(),
    }
}
