use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CachedToken, CLOUD_PLATFORM_SCOPE};
use crate::error::{RagError, Result};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const WELL_KNOWN_FILE: &str = "application_default_credentials.json";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Where ambient credentials come from, in application-default lookup order:
/// an explicit access token, `GOOGLE_APPLICATION_CREDENTIALS`, the gcloud
/// well-known file, then the metadata server.
pub enum CredentialSource {
    /// `GOOGLE_OAUTH_ACCESS_TOKEN`, used as-is and never refreshed.
    StaticToken(String),
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUser),
    Metadata,
}

impl CredentialSource {
    pub fn kind(&self) -> &'static str {
        match self {
            CredentialSource::StaticToken(_) => "static_token",
            CredentialSource::ServiceAccount(_) => "service_account",
            CredentialSource::AuthorizedUser(_) => "authorized_user",
            CredentialSource::Metadata => "metadata_server",
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CredentialsFile {
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUser),
}

/// A downloaded service-account key file.
#[derive(Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    private_key: String,
    #[serde(default)]
    private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

/// User credentials written by `gcloud auth application-default login`.
#[derive(Deserialize)]
pub struct AuthorizedUser {
    client_id: String,
    client_secret: String,
    refresh_token: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

/// Resolve the credential source from `env`. A credentials file that is named
/// but unreadable is an error rather than a silent fall-through.
pub fn discover<F>(env: F) -> Result<CredentialSource>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| env(key).filter(|v| !v.trim().is_empty());

    if let Some(token) = var("GOOGLE_OAUTH_ACCESS_TOKEN") {
        return Ok(CredentialSource::StaticToken(token));
    }
    if let Some(path) = var("GOOGLE_APPLICATION_CREDENTIALS") {
        return load_file(Path::new(&path));
    }
    if let Some(path) = well_known_file(&var).filter(|p| p.is_file()) {
        return load_file(&path);
    }
    Ok(CredentialSource::Metadata)
}

fn well_known_file(var: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    let dir = match var("CLOUDSDK_CONFIG") {
        Some(dir) => PathBuf::from(dir),
        None if cfg!(windows) => PathBuf::from(var("APPDATA")?).join("gcloud"),
        None => PathBuf::from(var("HOME")?).join(".config").join("gcloud"),
    };
    Some(dir.join(WELL_KNOWN_FILE))
}

fn load_file(path: &Path) -> Result<CredentialSource> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| RagError::Credentials(format!("cannot read {}: {e}", path.display())))?;
    let file: CredentialsFile = serde_json::from_str(&raw).map_err(|e| {
        RagError::Credentials(format!("unsupported credentials file {}: {e}", path.display()))
    })?;

    debug!(path = %path.display(), "credentials file loaded");
    Ok(match file {
        CredentialsFile::ServiceAccount(key) => CredentialSource::ServiceAccount(key),
        CredentialsFile::AuthorizedUser(user) => CredentialSource::AuthorizedUser(user),
    })
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

impl ServiceAccountKey {
    fn claims(&self, now: DateTime<Utc>) -> AssertionClaims<'_> {
        AssertionClaims {
            iss: &self.client_email,
            scope: CLOUD_PLATFORM_SCOPE,
            aud: &self.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        }
    }

    /// RS256-signed JWT exchanged at `token_uri` for an access token.
    fn assertion(&self, now: DateTime<Utc>) -> Result<String> {
        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes()).map_err(|e| {
            RagError::Credentials(format!("invalid private key for {}: {e}", self.client_email))
        })?;
        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.private_key_id.clone();

        jsonwebtoken::encode(&header, &self.claims(now), &key)
            .map_err(|e| RagError::Credentials(format!("cannot sign token assertion: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

impl TokenResponse {
    fn into_cached(self, now: DateTime<Utc>) -> CachedToken {
        CachedToken {
            token: self.access_token,
            expires_at: now + chrono::Duration::seconds(self.expires_in),
        }
    }
}

/// Mint a fresh access token from `source`.
pub(super) async fn fetch_token(
    client: &reqwest::Client,
    source: &CredentialSource,
) -> Result<CachedToken> {
    let resp = match source {
        CredentialSource::StaticToken(token) => {
            return Ok(CachedToken {
                token: token.clone(),
                expires_at: DateTime::<Utc>::MAX_UTC,
            })
        }
        CredentialSource::ServiceAccount(key) => {
            let assertion = key.assertion(Utc::now())?;
            client
                .post(&key.token_uri)
                .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
                .send()
                .await
        }
        CredentialSource::AuthorizedUser(user) => {
            client
                .post(DEFAULT_TOKEN_URI)
                .form(&[
                    ("grant_type", "refresh_token"),
                    ("client_id", user.client_id.as_str()),
                    ("client_secret", user.client_secret.as_str()),
                    ("refresh_token", user.refresh_token.as_str()),
                ])
                .send()
                .await
        }
        CredentialSource::Metadata => {
            client
                .get(METADATA_TOKEN_URL)
                .header("Metadata-Flavor", "Google")
                .send()
                .await
        }
    };

    let resp = resp
        .map_err(|e| RagError::Credentials(format!("{} token endpoint unreachable: {e}", source.kind())))?
        .error_for_status()
        .map_err(|e| RagError::Credentials(e.to_string()))?;
    let body: TokenResponse = resp
        .json()
        .await
        .map_err(|e| RagError::Credentials(format!("bad token response: {e}")))?;

    debug!(source = source.kind(), expires_in = body.expires_in, "ambient token refreshed");
    Ok(body.into_cached(Utc::now()))
}
