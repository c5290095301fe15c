pub mod adc;
pub mod signer;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{RagError, Result};

pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const IAM_CREDENTIALS_BASE: &str = "https://iamcredentials.googleapis.com/v1/projects/-/serviceAccounts";

/// Tokens are refreshed this long before their reported expiry.
const REFRESH_MARGIN_SECS: i64 = 60;

/// Something that can hand out an OAuth bearer token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// Signs arbitrary bytes as a service account (used for V4 signed URLs).
#[async_trait]
pub trait BlobSigner: Send + Sync {
    fn service_account(&self) -> &str;
    async fn sign_blob(&self, payload: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + chrono::Duration::seconds(REFRESH_MARGIN_SECS) < self.expires_at
    }
}

async fn cached_or_refresh<F, Fut>(slot: &RwLock<Option<CachedToken>>, refresh: F) -> Result<String>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<CachedToken>>,
{
    {
        let cached = slot.read().await;
        if let Some(tok) = cached.as_ref().filter(|t| t.is_fresh(Utc::now())) {
            return Ok(tok.token.clone());
        }
    }

    let mut cached = slot.write().await;
    // Another task may have refreshed while we waited for the write lock.
    if let Some(tok) = cached.as_ref().filter(|t| t.is_fresh(Utc::now())) {
        return Ok(tok.token.clone());
    }
    let fresh = refresh().await?;
    let token = fresh.token.clone();
    *cached = Some(fresh);
    Ok(token)
}

/// Application-default credentials for the process's own identity.
pub struct AmbientCredentials {
    client: reqwest::Client,
    source: adc::CredentialSource,
    cached: RwLock<Option<CachedToken>>,
}

impl AmbientCredentials {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let source = adc::discover(|key| dotenv::var(key).ok())?;
        info!(source = source.kind(), "ambient credentials selected");
        Ok(Self::new(client, source))
    }

    pub fn new(client: reqwest::Client, source: adc::CredentialSource) -> Self {
        Self {
            client,
            source,
            cached: RwLock::new(None),
        }
    }
}

#[async_trait]
impl TokenSource for AmbientCredentials {
    async fn access_token(&self) -> Result<String> {
        cached_or_refresh(&self.cached, || adc::fetch_token(&self.client, &self.source)).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeneratedToken {
    access_token: String,
    expire_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedBlob {
    signed_blob: String,
}

/// Short-lived credentials for `target_principal`, minted from ambient
/// credentials through the IAM Credentials API.
pub struct ImpersonatedCredentials {
    client: reqwest::Client,
    source: Arc<dyn TokenSource>,
    target_principal: String,
    scopes: Vec<String>,
    lifetime: Duration,
    cached: RwLock<Option<CachedToken>>,
}

impl ImpersonatedCredentials {
    pub fn new(
        client: reqwest::Client,
        source: Arc<dyn TokenSource>,
        target_principal: impl Into<String>,
    ) -> Self {
        Self {
            client,
            source,
            target_principal: target_principal.into(),
            scopes: vec![CLOUD_PLATFORM_SCOPE.to_string()],
            lifetime: Duration::from_secs(3600),
            cached: RwLock::new(None),
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{}:{}", IAM_CREDENTIALS_BASE, self.target_principal, method)
    }

    async fn generate_access_token(&self) -> Result<CachedToken> {
        let source_token = self.source.access_token().await?;
        let body = serde_json::json!({
            "scope": self.scopes,
            "lifetime": format!("{}s", self.lifetime.as_secs()),
        });

        let resp = self
            .client
            .post(self.endpoint("generateAccessToken"))
            .bearer_auth(source_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::Credentials(format!("generateAccessToken failed: {e}")))?;
        let resp = resp
            .error_for_status()
            .map_err(|e| RagError::Credentials(e.to_string()))?;
        let generated: GeneratedToken = resp
            .json()
            .await
            .map_err(|e| RagError::Credentials(format!("bad generateAccessToken response: {e}")))?;

        let token = parse_generated_token(generated)?;
        debug!(
            principal = %self.target_principal,
            expires_at = %token.expires_at,
            "impersonated token minted"
        );
        Ok(token)
    }
}

fn parse_generated_token(generated: GeneratedToken) -> Result<CachedToken> {
    let expires_at = DateTime::parse_from_rfc3339(&generated.expire_time)
        .map_err(|e| RagError::Credentials(format!("bad expireTime `{}`: {e}", generated.expire_time)))?
        .with_timezone(&Utc);
    Ok(CachedToken {
        token: generated.access_token,
        expires_at,
    })
}

#[async_trait]
impl TokenSource for ImpersonatedCredentials {
    async fn access_token(&self) -> Result<String> {
        cached_or_refresh(&self.cached, || self.generate_access_token()).await
    }
}

#[async_trait]
impl BlobSigner for ImpersonatedCredentials {
    fn service_account(&self) -> &str {
        &self.target_principal
    }

    async fn sign_blob(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let token = self.access_token().await?;
        let body = serde_json::json!({ "payload": BASE64.encode(payload) });

        let resp = self
            .client
            .post(self.endpoint("signBlob"))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::Signing(format!("signBlob failed: {e}")))?;
        let resp = resp
            .error_for_status()
            .map_err(|e| RagError::Signing(e.to_string()))?;
        let signed: SignedBlob = resp
            .json()
            .await
            .map_err(|e| RagError::Signing(format!("bad signBlob response: {e}")))?;

        BASE64
            .decode(signed.signed_blob.as_bytes())
            .map_err(|e| RagError::Signing(format!("signedBlob is not base64: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_generated_token() {
        let generated: GeneratedToken = serde_json::from_value(serde_json::json!({
            "accessToken": "ya29.abc",
            "expireTime": "2026-10-18T12:00:00Z"
        }))
        .unwrap();
        let tok = parse_generated_token(generated).unwrap();
        assert_eq!(tok.token, "ya29.abc");
        assert_eq!(tok.expires_at.to_rfc3339(), "2026-10-18T12:00:00+00:00");
    }

    #[test]
    fn test_bad_expire_time() {
        let generated = GeneratedToken {
            access_token: "t".into(),
            expire_time: "tomorrow".into(),
        };
        assert!(matches!(
            parse_generated_token(generated),
            Err(RagError::Credentials(_))
        ));
    }

    #[test]
    fn test_token_freshness_margin() {
        let now = Utc::now();
        let nearly_expired = CachedToken {
            token: "t".into(),
            expires_at: now + chrono::Duration::seconds(30),
        };
        let fresh = CachedToken {
            token: "t".into(),
            expires_at: now + chrono::Duration::seconds(600),
        };
        assert!(!nearly_expired.is_fresh(now));
        assert!(fresh.is_fresh(now));
    }

    #[tokio::test]
    async fn test_ambient_static_token() {
        let creds = AmbientCredentials::new(
            reqwest::Client::new(),
            adc::CredentialSource::StaticToken("ya29.static".into()),
        );
        assert_eq!(creds.access_token().await.unwrap(), "ya29.static");
        assert_eq!(creds.access_token().await.unwrap(), "ya29.static");
    }

    #[tokio::test]
    async fn test_cached_token_reused() {
        let slot = RwLock::new(None);
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let token = cached_or_refresh(&slot, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(CachedToken {
                    token: "abc".into(),
                    expires_at: Utc::now() + chrono::Duration::hours(1),
                })
            })
            .await
            .unwrap();
            assert_eq!(token, "abc");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
