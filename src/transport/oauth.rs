// src/transport/oauth.rs
// OAuth-wrapped transport variant: any transport preceded by a pluggable
// credential provider that injects `Authorization: Bearer <token>` and
// refreshes before expiry. The token-endpoint implementation itself is an
// external collaborator (distilled §1, out of scope); this module only
// defines the seam.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::McpResult;
use crate::transport::HeaderProvider;

/// A bearer token plus the instant it should be considered expired. The
/// provider refreshes strictly before `expires_at`, never on a 401 retry
/// (servers are not required to signal expiry any other way).
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Instant,
}

impl AccessToken {
    pub fn is_fresh(&self, skew: Duration) -> bool {
        Instant::now() + skew < self.expires_at
    }
}

/// Pluggable credential provider: client-credentials grant, authorization-
/// code with PKCE, or any host-supplied scheme that ultimately produces a
/// bearer token. Implementations own their own refresh strategy; this
/// trait only asks for "a currently valid token".
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self) -> McpResult<AccessToken>;
}

/// Wraps any `CredentialProvider` as a `HeaderProvider`, caching the token
/// until it's within `refresh_skew` of expiring.
pub struct OAuthHeaderProvider {
    provider: Arc<dyn CredentialProvider>,
    cached: RwLock<Option<AccessToken>>,
    refresh_skew: Duration,
}

impl OAuthHeaderProvider {
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            provider,
            cached: RwLock::new(None),
            refresh_skew: Duration::from_secs(30),
        }
    }

    pub fn with_refresh_skew(mut self, skew: Duration) -> Self {
        self.refresh_skew = skew;
        self
    }

    async fn current_token(&self) -> McpResult<String> {
        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref() {
                if token.is_fresh(self.refresh_skew) {
                    return Ok(token.token.clone());
                }
            }
        }
        let fresh = self.provider.access_token().await?;
        let token = fresh.token.clone();
        *self.cached.write().await = Some(fresh);
        Ok(token)
    }
}

#[async_trait]
impl HeaderProvider for OAuthHeaderProvider {
    async fn headers(&self) -> McpResult<HashMap<String, String>> {
        let token = self.current_token().await?;
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticProvider(AccessToken);

    #[async_trait]
    impl CredentialProvider for StaticProvider {
        async fn access_token(&self) -> McpResult<AccessToken> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn caches_token_until_near_expiry() {
        let provider = Arc::new(StaticProvider(AccessToken {
            token: "tok-1".into(),
            expires_at: Instant::now() + Duration::from_secs(3600),
        }));
        let headers = OAuthHeaderProvider::new(provider);
        let h1 = headers.headers().await.unwrap();
        assert_eq!(h1.get("Authorization").unwrap(), "Bearer tok-1");
    }

    #[tokio::test]
    async fn refreshes_when_within_skew_of_expiry() {
        let provider = Arc::new(StaticProvider(AccessToken {
            token: "tok-expired".into(),
            expires_at: Instant::now() + Duration::from_millis(5),
        }));
        let headers = OAuthHeaderProvider::new(provider).with_refresh_skew(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_millis(10)).await;
        // still returns a token (the static provider always returns the
        // same one) but exercises the refresh path rather than the cache.
        let h = headers.headers().await.unwrap();
        assert_eq!(h.get("Authorization").unwrap(), "Bearer tok-expired");
    }
}
