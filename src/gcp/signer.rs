use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::BlobSigner;
use crate::error::{RagError, Result};

const STORAGE_HOST: &str = "storage.googleapis.com";
const SIGNING_ALGORITHM: &str = "GOOG4-RSA-SHA256";
/// V4 signatures cannot outlive seven days.
pub const MAX_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

/// A signed URL must live at least a second and at most `MAX_TTL`.
pub fn check_ttl(ttl: Duration) -> Result<()> {
    if ttl.is_zero() || ttl > MAX_TTL {
        return Err(RagError::Signing(format!(
            "ttl must be between 1s and 7 days, got {}s",
            ttl.as_secs()
        )));
    }
    Ok(())
}

/// A bucket/object pair parsed from a `scheme://bucket/object-path` link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRef {
    pub bucket: String,
    pub object: String,
}

impl StorageRef {
    pub fn parse(link: &str) -> Result<Self> {
        let malformed = || RagError::MalformedSourceLink(link.to_string());

        let (_, rest) = link.split_once("://").ok_or_else(malformed)?;
        let (bucket, object) = rest.split_once('/').ok_or_else(malformed)?;
        if bucket.is_empty() || object.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            bucket: bucket.to_string(),
            object: object.to_string(),
        })
    }

    /// Last path segment of the object, used as the display name.
    pub fn basename(&self) -> &str {
        self.object.rsplit('/').next().unwrap_or(&self.object)
    }
}

/// Mints time-limited, read-only download URLs for stored source documents.
#[async_trait]
pub trait UrlSigner: Send + Sync {
    async fn sign(&self, object: &StorageRef, ttl: Duration) -> Result<String>;
}

/// GCS V4 query-string signer backed by a service account's `signBlob`.
pub struct GcsUrlSigner {
    credentials: Arc<dyn BlobSigner>,
}

impl GcsUrlSigner {
    pub fn new(credentials: Arc<dyn BlobSigner>) -> Self {
        Self { credentials }
    }

    pub async fn sign_at(
        &self,
        object: &StorageRef,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String> {
        check_ttl(ttl)?;

        let request = CanonicalRequest::new(
            object,
            self.credentials.service_account(),
            ttl.as_secs().max(1),
            now,
        );
        let string_to_sign = request.string_to_sign();
        let signature = self.credentials.sign_blob(string_to_sign.as_bytes()).await?;

        debug!(
            bucket = %object.bucket,
            object = %object.object,
            ttl_secs = ttl.as_secs(),
            "signed URL minted"
        );
        Ok(format!(
            "https://{}{}?{}&X-Goog-Signature={}",
            STORAGE_HOST,
            request.path,
            request.query,
            hex::encode(signature)
        ))
    }
}

#[async_trait]
impl UrlSigner for GcsUrlSigner {
    async fn sign(&self, object: &StorageRef, ttl: Duration) -> Result<String> {
        self.sign_at(object, ttl, Utc::now()).await
    }
}

struct CanonicalRequest {
    path: String,
    query: String,
    timestamp: String,
    scope: String,
}

impl CanonicalRequest {
    fn new(object: &StorageRef, account: &str, expires_secs: u64, now: DateTime<Utc>) -> Self {
        let datestamp = now.format("%Y%m%d").to_string();
        let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
        let scope = format!("{}/auto/storage/goog4_request", datestamp);
        let credential = format!("{}/{}", account, scope);

        let path = format!("/{}/{}", object.bucket, encode_object_path(&object.object));

        // Parameters are already in lexicographic order.
        let query = [
            ("X-Goog-Algorithm", SIGNING_ALGORITHM.to_string()),
            ("X-Goog-Credential", credential),
            ("X-Goog-Date", timestamp.clone()),
            ("X-Goog-Expires", expires_secs.to_string()),
            ("X-Goog-SignedHeaders", "host".to_string()),
        ]
        .iter()
        .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");

        Self {
            path,
            query,
            timestamp,
            scope,
        }
    }

    fn canonical(&self) -> String {
        format!(
            "GET\n{}\n{}\nhost:{}\n\nhost\nUNSIGNED-PAYLOAD",
            self.path, self.query, STORAGE_HOST
        )
    }

    fn string_to_sign(&self) -> String {
        let digest = Sha256::digest(self.canonical().as_bytes());
        format!(
            "{}\n{}\n{}\n{}",
            SIGNING_ALGORITHM,
            self.timestamp,
            self.scope,
            hex::encode(digest)
        )
    }
}

fn encode_object_path(object: &str) -> String {
    object
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    struct RecordingSigner {
        payloads: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BlobSigner for RecordingSigner {
        fn service_account(&self) -> &str {
            "signer@proj.iam.gserviceaccount.com"
        }

        async fn sign_blob(&self, payload: &[u8]) -> Result<Vec<u8>> {
            self.payloads
                .lock()
                .unwrap()
                .push(String::from_utf8(payload.to_vec()).unwrap());
            Ok(vec![0xde, 0xad, 0xbe, 0xef])
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 20, 9, 30, 0).unwrap()
    }

    #[test]
    fn test_parse_gs_link() {
        let r = StorageRef::parse("gs://bucket1/emails/2019/smith.pdf").unwrap();
        assert_eq!(r.bucket, "bucket1");
        assert_eq!(r.object, "emails/2019/smith.pdf");
        assert_eq!(r.basename(), "smith.pdf");
    }

    #[test]
    fn test_parse_malformed_links() {
        for link in ["smith.pdf", "gs://bucket-only", "gs:///object", "gs://bucket/", ""] {
            assert!(
                matches!(StorageRef::parse(link), Err(RagError::MalformedSourceLink(_))),
                "{link} should be rejected"
            );
        }
    }

    #[test]
    fn test_object_path_encoding() {
        assert_eq!(
            encode_object_path("mail/Re: Q3 notice #2.pdf"),
            "mail/Re%3A%20Q3%20notice%20%232.pdf"
        );
    }

    #[test]
    fn test_canonical_request_layout() {
        let object = StorageRef::parse("gs://bucket1/smith.pdf").unwrap();
        let req = CanonicalRequest::new(&object, "sa@p.iam.gserviceaccount.com", 900, fixed_now());
        assert_eq!(
            req.canonical(),
            "GET\n/bucket1/smith.pdf\n\
             X-Goog-Algorithm=GOOG4-RSA-SHA256\
             &X-Goog-Credential=sa%40p.iam.gserviceaccount.com%2F20240620%2Fauto%2Fstorage%2Fgoog4_request\
             &X-Goog-Date=20240620T093000Z&X-Goog-Expires=900&X-Goog-SignedHeaders=host\n\
             host:storage.googleapis.com\n\nhost\nUNSIGNED-PAYLOAD"
        );
        let sts = req.string_to_sign();
        let lines: Vec<_> = sts.lines().collect();
        assert_eq!(lines[0], "GOOG4-RSA-SHA256");
        assert_eq!(lines[1], "20240620T093000Z");
        assert_eq!(lines[2], "20240620/auto/storage/goog4_request");
        assert_eq!(lines[3].len(), 64);
    }

    #[tokio::test]
    async fn test_signed_url_shape() {
        let creds = Arc::new(RecordingSigner {
            payloads: Mutex::new(Vec::new()),
        });
        let signer = GcsUrlSigner::new(creds.clone());
        let object = StorageRef::parse("gs://bucket1/smith.pdf").unwrap();

        let url = signer.sign_at(&object, DEFAULT_TTL, fixed_now()).await.unwrap();
        assert!(url.starts_with("https://storage.googleapis.com/bucket1/smith.pdf?X-Goog-Algorithm="));
        assert!(url.contains("X-Goog-Expires=900"));
        assert!(url.ends_with("&X-Goog-Signature=deadbeef"));

        let payloads = creds.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].starts_with("GOOG4-RSA-SHA256\n20240620T093000Z\n"));
    }

    #[tokio::test]
    async fn test_fresh_expiry_per_call() {
        let signer = GcsUrlSigner::new(Arc::new(RecordingSigner {
            payloads: Mutex::new(Vec::new()),
        }));
        let object = StorageRef::parse("gs://bucket1/smith.pdf").unwrap();
        let first = signer.sign_at(&object, DEFAULT_TTL, fixed_now()).await.unwrap();
        let later = fixed_now() + chrono::Duration::minutes(5);
        let second = signer.sign_at(&object, DEFAULT_TTL, later).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_ttl_bounds() {
        let signer = GcsUrlSigner::new(Arc::new(RecordingSigner {
            payloads: Mutex::new(Vec::new()),
        }));
        let object = StorageRef::parse("gs://bucket1/smith.pdf").unwrap();
        for ttl in [Duration::ZERO, MAX_TTL + Duration::from_secs(1)] {
            assert!(matches!(
                signer.sign_at(&object, ttl, fixed_now()).await,
                Err(RagError::Signing(_))
            ));
        }
    }
}
