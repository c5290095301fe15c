use std::time::Duration;

use anyhow::{Context, Result};

use crate::gcp::signer::{check_ttl, DEFAULT_TTL};
use crate::rag::cache::DEFAULT_CAPACITY;

const DEFAULT_MODEL: &str = "claude-3-5-sonnet@20240620";

/// Process settings, read once from the environment (`.env` supported).
#[derive(Debug, Clone)]
pub struct Settings {
    pub project_id: String,
    pub search_location: String,
    pub datastore_id: String,
    pub llm_region: String,
    pub llm_model: String,
    pub client_name: String,
    pub signer_service_account: String,
    pub signed_url_ttl: Duration,
    pub result_cache_capacity: usize,
    pub http_timeout: Duration,
}

fn required(key: &str) -> Result<String> {
    dotenv::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .with_context(|| format!("{} required", key))
}

fn parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match dotenv::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .ok()
            .with_context(|| format!("{} is not a valid value: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

fn signed_url_ttl(minutes: u64) -> Result<Duration> {
    let secs = minutes
        .checked_mul(60)
        .with_context(|| format!("SIGNED_URL_TTL_MINUTES is too large: {}", minutes))?;
    let ttl = Duration::from_secs(secs);
    check_ttl(ttl).context("SIGNED_URL_TTL_MINUTES out of range")?;
    Ok(ttl)
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let ttl_minutes = parsed("SIGNED_URL_TTL_MINUTES", DEFAULT_TTL.as_secs() / 60)?;
        let signed_url_ttl = signed_url_ttl(ttl_minutes)?;

        Ok(Self {
            project_id: required("GCP_PROJECT_ID")?,
            search_location: dotenv::var("SEARCH_LOCATION").unwrap_or_else(|_| "global".to_string()),
            datastore_id: required("SEARCH_DATASTORE_ID")?,
            llm_region: dotenv::var("LLM_REGION").unwrap_or_else(|_| "us-east5".to_string()),
            llm_model: dotenv::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            client_name: required("CLIENT_NAME")?,
            signer_service_account: required("SIGNER_SERVICE_ACCOUNT")?,
            signed_url_ttl,
            result_cache_capacity: parsed("RESULT_CACHE_CAPACITY", DEFAULT_CAPACITY)?,
            http_timeout: Duration::from_secs(parsed("HTTP_TIMEOUT_SECS", 300)?),
        })
    }

    /// `:search` endpoint of the datastore's default serving config.
    pub fn search_url(&self) -> String {
        let host = if self.search_location == "global" {
            "discoveryengine.googleapis.com".to_string()
        } else {
            format!("{}-discoveryengine.googleapis.com", self.search_location)
        };
        format!(
            "https://{}/v1/projects/{}/locations/{}/collections/default_collection/dataStores/{}/servingConfigs/default_serving_config:search",
            host, self.project_id, self.search_location, self.datastore_id
        )
    }

    /// `streamRawPredict` endpoint for an Anthropic model on Vertex AI.
    pub fn generation_url(&self) -> String {
        format!(
            "https://{region}-aiplatform.googleapis.com/v1/projects/{}/locations/{region}/publishers/anthropic/models/{}:streamRawPredict",
            self.project_id,
            self.llm_model,
            region = self.llm_region,
        )
    }
}
