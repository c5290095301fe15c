use tracing::{debug, warn};

use crate::error::Result;
use crate::gcp::signer::StorageRef;
use crate::search::types::SearchResult;

/// Excerpts shown under a citation are cut to this many characters.
pub const EXCERPT_CHARS: usize = 250;

/// Evidence text handed to the model, plus bookkeeping for logs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptContext {
    pub text: String,
    pub segments: usize,
    pub skipped: usize,
}

/// Render every extractive segment as `[Title - Segment N]: text` blocks, in
/// rank order then segment order. No dedup and no length cap.
pub fn build_context(results: &[SearchResult]) -> PromptContext {
    let mut ctx = PromptContext::default();

    for result in results {
        let Some(doc) = &result.derived else {
            warn!(rank = result.rank, id = %result.id, "result has no derived data, skipping");
            ctx.skipped += 1;
            continue;
        };

        let title = doc
            .title
            .clone()
            .unwrap_or_else(|| format!("Document {}", result.rank + 1));

        let top_score = doc
            .extractive_segments
            .iter()
            .filter_map(|s| s.relevance_score)
            .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s))));
        debug!(
            rank = result.rank,
            segments = doc.extractive_segments.len(),
            top_score = ?top_score,
            "document evidence"
        );

        for (i, segment) in doc.extractive_segments.iter().enumerate() {
            ctx.text
                .push_str(&format!("[{} - Segment {}]: {}\n\n", title, i + 1, segment.content));
            ctx.segments += 1;
        }
    }

    ctx
}

/// A short excerpt listed under a citation.
#[derive(Debug, Clone, PartialEq)]
pub struct SubCitation {
    pub excerpt: String,
    pub page: Option<u32>,
}

/// Everything needed to render one citation except the signed URL.
#[derive(Debug, Clone, PartialEq)]
pub struct CitationSource {
    pub rank: usize,
    pub object: StorageRef,
    pub excerpts: Vec<SubCitation>,
}

impl CitationSource {
    pub fn display_name(&self) -> &str {
        self.object.basename()
    }
}

/// One entry per data-bearing result, in rank order. A result whose link
/// cannot be parsed yields an `Err` for that entry only.
pub fn citation_sources(results: &[SearchResult]) -> Vec<Result<CitationSource>> {
    results
        .iter()
        .filter_map(|result| {
            let Some(doc) = &result.derived else {
                warn!(rank = result.rank, id = %result.id, "result has no derived data, no citation");
                return None;
            };

            let source = StorageRef::parse(doc.link.as_deref().unwrap_or_default()).map(|object| {
                CitationSource {
                    rank: result.rank,
                    object,
                    excerpts: doc
                        .extractive_answers
                        .iter()
                        .map(|a| SubCitation {
                            excerpt: excerpt(&a.content),
                            page: a.page_number,
                        })
                        .collect(),
                }
            });
            Some(source)
        })
        .collect()
}

/// First `EXCERPT_CHARS` characters with newlines then removed.
pub fn excerpt(content: &str) -> String {
    content
        .chars()
        .take(EXCERPT_CHARS)
        .filter(|c| *c != '\n')
        .collect()
}
