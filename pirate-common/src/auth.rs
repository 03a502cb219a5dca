//! Bearer-token bootstrap helpers.
//!
//! The coordinator's `/auth` endpoint exchanges a caller-supplied
//! identity for an opaque bearer token, bound to a user id on the
//! WebSocket upgrade (see the external-interfaces Authorization
//! section). Token *storage* (mapping token → user id, refresh, etc.) is
//! the coordinator's concern; this module only contains the pure
//! generation logic, kept framework-free the way the teacher keeps its
//! own API helper functions free of HTTP-framework dependencies.

use std::sync::Mutex;

use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::clock::Clock;
use crate::error::AuthError;

/// Generate a new opaque bearer token: 32 random bytes, SHA-256'd into a
/// 64-character hex string. Not a JWT — it carries no embedded claims;
/// the coordinator looks it up in its in-memory token table.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let digest = Sha256::digest(bytes);
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Extract the bearer token from an `Authorization: Bearer <token>`
/// header value.
pub fn parse_bearer_header(header_value: &str) -> Result<&str, AuthError> {
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(AuthError::MissingToken)
}

/// Default assumed lifetime for a bootstrapped bearer token and the
/// margin before that expiry at which a caller should proactively
/// refresh rather than wait for a 401. `/auth` doesn't hand back a TTL
/// today, so a cached token is treated as good for `DEFAULT_TTL_MS` from
/// the moment it was issued.
pub const DEFAULT_TTL_MS: u64 = 60 * 60 * 1000;
pub const DEFAULT_REFRESH_MARGIN_MS: u64 = 60 * 60 * 1000;

struct Cached {
    token: String,
    issued_at_ms: u64,
    ttl_ms: u64,
}

/// In-process cache for the short-lived bearer a device bootstraps once
/// and then reuses for both REST calls and the WebSocket upgrade (see
/// the design note on token caching). Holding one behind a `Mutex`
/// rather than the kernel's single-actor style is deliberate: callers
/// span independent REST round trips and a WebSocket reconnect loop,
/// none of which share an owning task.
pub struct TokenCache {
    refresh_margin_ms: u64,
    cached: Mutex<Option<Cached>>,
}

impl TokenCache {
    pub fn new(refresh_margin_ms: u64) -> Self {
        Self { refresh_margin_ms, cached: Mutex::new(None) }
    }

    /// Returns the cached token if it's still outside its refresh margin;
    /// otherwise calls `fetch` for a fresh one (ttl in ms, `DEFAULT_TTL_MS`
    /// if the caller has no better estimate) and caches the result.
    pub async fn get_or_refresh<F, Fut, E>(&self, clock: &dyn Clock, fetch: F) -> Result<String, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(String, u64), E>>,
    {
        let now_ms = clock.now_ms();
        if let Some(cached) = self.cached.lock().unwrap().as_ref() {
            let expires_at_ms = cached.issued_at_ms + cached.ttl_ms;
            if now_ms + self.refresh_margin_ms < expires_at_ms {
                return Ok(cached.token.clone());
            }
        }

        let (token, ttl_ms) = fetch().await?;
        *self.cached.lock().unwrap() = Some(Cached { token: token.clone(), issued_at_ms: now_ms, ttl_ms });
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn generated_tokens_are_64_hex_chars_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn parses_well_formed_bearer_header() {
        assert_eq!(parse_bearer_header("Bearer abc123").unwrap(), "abc123");
    }

    #[test]
    fn rejects_missing_or_malformed_header() {
        assert!(parse_bearer_header("abc123").is_err());
        assert!(parse_bearer_header("Bearer ").is_err());
        assert!(parse_bearer_header("Basic abc123").is_err());
    }

    #[tokio::test]
    async fn token_cache_reuses_token_within_ttl() {
        let clock = SystemClock::new();
        let cache = TokenCache::new(DEFAULT_REFRESH_MARGIN_MS);
        let fetches = AtomicUsize::new(0);

        let first = cache
            .get_or_refresh::<_, _, AuthError>(&clock, || async {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(("tok-a".to_string(), DEFAULT_TTL_MS))
            })
            .await
            .unwrap();
        let second = cache
            .get_or_refresh::<_, _, AuthError>(&clock, || async {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(("tok-b".to_string(), DEFAULT_TTL_MS))
            })
            .await
            .unwrap();

        assert_eq!(first, "tok-a");
        assert_eq!(second, "tok-a", "second call must reuse the cached token");
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn token_cache_refetches_once_inside_the_refresh_margin() {
        let clock = SystemClock::new();
        // A TTL shorter than the refresh margin means the token is
        // already "due for refresh" the instant it's cached.
        let cache = TokenCache::new(DEFAULT_REFRESH_MARGIN_MS);

        let first = cache
            .get_or_refresh::<_, _, AuthError>(&clock, || async { Ok(("tok-a".to_string(), 10)) })
            .await
            .unwrap();
        let second = cache
            .get_or_refresh::<_, _, AuthError>(&clock, || async { Ok(("tok-b".to_string(), 10)) })
            .await
            .unwrap();

        assert_eq!(first, "tok-a");
        assert_eq!(second, "tok-b", "a token inside its refresh margin must be refreshed");
    }
}
