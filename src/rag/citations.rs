use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::context::{citation_sources, SubCitation};
use crate::error::Result;
use crate::gcp::signer::UrlSigner;
use crate::search::types::SearchResult;

pub const SOURCES_MARKER: &str = "### Sources";

/// A citation with its freshly minted download link.
#[derive(Debug, Clone, PartialEq)]
pub struct Citation {
    pub rank: usize,
    pub title: String,
    pub url: String,
    pub excerpts: Vec<SubCitation>,
}

impl Citation {
    fn render_into(&self, out: &mut String) {
        out.push_str(&format!(
            "\n- [{}. {}](<{}>)",
            self.rank + 1,
            escape_markdown(&self.title),
            self.url
        ));
        for sub in &self.excerpts {
            let text = escape_markdown(&sub.excerpt);
            match sub.page {
                Some(page) => out.push_str(&format!(
                    "\n  - Page = {}: [{}...](<{}#page={}>)",
                    page, text, self.url, page
                )),
                None => out.push_str(&format!("\n  - [{}...](<{}>)", text, self.url)),
            }
        }
    }
}

/// Backslash-escape characters that would end link text or open emphasis.
fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '[' | ']' | '*' | '_' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Turns a result set into a markdown source list with signed links.
pub struct CitationRenderer {
    signer: Arc<dyn UrlSigner>,
    ttl: Duration,
}

impl CitationRenderer {
    pub fn new(signer: Arc<dyn UrlSigner>, ttl: Duration) -> Self {
        Self { signer, ttl }
    }

    /// Sign every citable result in rank order. Results with a malformed link
    /// are logged and left out; signing failures abort the whole list.
    pub async fn citations(&self, results: &[SearchResult]) -> Result<Vec<Citation>> {
        let mut citations = Vec::new();
        for source in citation_sources(results) {
            let source = match source {
                Ok(source) => source,
                Err(e) => {
                    warn!(error = %e, "citation omitted");
                    continue;
                }
            };

            let url = self.signer.sign(&source.object, self.ttl).await?;
            citations.push(Citation {
                rank: source.rank,
                title: source.display_name().to_string(),
                url,
                excerpts: source.excerpts,
            });
        }
        Ok(citations)
    }

    pub async fn render(&self, results: &[SearchResult]) -> Result<String> {
        let citations = self.citations(results).await?;
        debug!(count = citations.len(), "citations rendered");

        let mut out = String::from(SOURCES_MARKER);
        for citation in &citations {
            citation.render_into(&mut out);
        }
        Ok(out)
    }
}
