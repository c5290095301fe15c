pub mod cache;
pub mod citations;
pub mod context;
pub mod prompts;

use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use crate::llm::{AnswerStream, AnswerStreamer};
use crate::search::{EvidenceRetriever, Retrieval};

use cache::{CachedResults, RequestToken, ResultCache};
use citations::CitationRenderer;

/// An answer in flight: the evidence it is grounded on and the fragment stream.
pub struct AnswerSession {
    pub retrieval: Retrieval,
    pub stream: AnswerStream,
}

/// Per-query orchestration: search, assemble evidence, stream the answer, and
/// later render citations from the same result set.
pub struct RagEngine {
    retriever: EvidenceRetriever,
    streamer: AnswerStreamer,
    renderer: CitationRenderer,
    cache: Arc<ResultCache>,
}

impl RagEngine {
    pub fn new(
        retriever: EvidenceRetriever,
        streamer: AnswerStreamer,
        renderer: CitationRenderer,
        cache: Arc<ResultCache>,
    ) -> Self {
        Self {
            retriever,
            streamer,
            renderer,
            cache,
        }
    }

    pub async fn answer(&self, query: &str) -> Result<AnswerSession> {
        let retrieval = self.retriever.retrieve(query).await?;
        let context = context::build_context(&retrieval.results);

        info!(
            token = %retrieval.token,
            query = %retrieval.query,
            documents = retrieval.results.len(),
            segments = context.segments,
            skipped = context.skipped,
            context_len = context.text.len(),
            "evidence assembled"
        );

        let stream = self.streamer.stream(query, &context.text).await?;
        Ok(AnswerSession { retrieval, stream })
    }

    /// Citations for the exact evidence an answer was generated from.
    pub async fn citations(&self, retrieval: &Retrieval) -> Result<String> {
        self.renderer.render(&retrieval.results).await
    }

    /// Re-render citations for an earlier request, with freshly signed links.
    pub async fn cached_citations(&self, token: RequestToken) -> Result<(Arc<CachedResults>, String)> {
        let entry = self.cache.get(token).await?;
        let block = self.renderer.render(&entry.results).await?;
        Ok((entry, block))
    }
}
