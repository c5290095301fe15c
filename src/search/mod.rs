pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::Settings;
use crate::error::{RagError, Result};
use crate::gcp::TokenSource;
use crate::rag::cache::{RequestToken, ResultCache};

use types::{SearchResponse, SearchResult};

pub const PAGE_SIZE: u32 = 10;
pub const MAX_EXTRACTIVE_SEGMENTS: u32 = 10;
/// Segments of surrounding context requested before and after each hit.
pub const CONTEXT_SEGMENTS: u32 = 3;

/// Body of a Discovery Engine `:search` call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    pub page_size: u32,
    pub content_search_spec: ContentSearchSpec,
    pub query_expansion_spec: QueryExpansionSpec,
    pub spell_correction_spec: SpellCorrectionSpec,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentSearchSpec {
    pub extractive_content_spec: ExtractiveContentSpec,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractiveContentSpec {
    pub max_extractive_segment_count: u32,
    pub return_extractive_segment_score: bool,
    pub num_previous_segments: u32,
    pub num_next_segments: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryExpansionSpec {
    pub condition: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpellCorrectionSpec {
    pub mode: &'static str,
}

impl SearchRequest {
    /// The fixed augmentation profile every user query is searched with.
    pub fn for_query(query: &str) -> Self {
        Self {
            query: query.to_string(),
            page_size: PAGE_SIZE,
            content_search_spec: ContentSearchSpec {
                extractive_content_spec: ExtractiveContentSpec {
                    max_extractive_segment_count: MAX_EXTRACTIVE_SEGMENTS,
                    return_extractive_segment_score: true,
                    num_previous_segments: CONTEXT_SEGMENTS,
                    num_next_segments: CONTEXT_SEGMENTS,
                },
            },
            query_expansion_spec: QueryExpansionSpec { condition: "AUTO" },
            spell_correction_spec: SpellCorrectionSpec { mode: "AUTO" },
        }
    }
}

/// Opaque ranked-search service.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchResult>>;
}

/// Vertex AI Search (Discovery Engine) REST client.
pub struct DiscoveryEngineClient {
    client: reqwest::Client,
    url: String,
    credentials: Arc<dyn TokenSource>,
}

impl DiscoveryEngineClient {
    pub fn new(
        client: reqwest::Client,
        settings: &Settings,
        credentials: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            client,
            url: settings.search_url(),
            credentials,
        }
    }
}

#[async_trait]
impl SearchBackend for DiscoveryEngineClient {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchResult>> {
        let token = self.credentials.access_token().await?;

        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(token)
            .json(request)
            .send()
            .await
            .map_err(|e| RagError::Retrieval(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(RagError::Retrieval(format!("{} {}", status, text)));
        }

        let body: SearchResponse = resp
            .json()
            .await
            .map_err(|e| RagError::Retrieval(format!("undecodable search response: {e}")))?;
        Ok(body.into_results())
    }
}

/// Result of one retrieval: the handle threaded from generation to citation
/// rendering, plus the result set itself.
#[derive(Debug, Clone)]
pub struct Retrieval {
    pub token: RequestToken,
    pub query: String,
    pub results: Arc<Vec<SearchResult>>,
}

pub struct EvidenceRetriever {
    backend: Arc<dyn SearchBackend>,
    cache: Arc<ResultCache>,
}

impl EvidenceRetriever {
    pub fn new(backend: Arc<dyn SearchBackend>, cache: Arc<ResultCache>) -> Self {
        Self { backend, cache }
    }

    /// Search once, cache the raw result set (even when empty), return both.
    pub async fn retrieve(&self, query: &str) -> Result<Retrieval> {
        if query.trim().is_empty() {
            return Err(RagError::EmptyQuery);
        }

        let request = SearchRequest::for_query(query);
        let results = Arc::new(self.backend.search(&request).await?);
        let token = self.cache.insert(query, results.clone()).await;

        info!(%token, results = results.len(), "retrieval complete");
        let cached_entries = self.cache.len().await;
        debug!(cached_entries, "result cache size");

        Ok(Retrieval {
            token,
            query: query.to_string(),
            results,
        })
    }
}
