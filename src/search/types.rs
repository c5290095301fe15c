use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::warn;

/// One ranked document match from the search service.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub id: String,
    /// 0-based position in the service's ranking.
    pub rank: usize,
    /// `None` when the service returned no derived struct data for the document.
    pub derived: Option<DerivedData>,
}

/// The derived-fields map attached to a document (title, link, excerpts).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DerivedData {
    #[serde(default)]
    pub title: Option<String>,
    /// Storage location, e.g. `gs://bucket/path/to/file.pdf`.
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub extractive_segments: Vec<ExtractiveSegment>,
    #[serde(default)]
    pub extractive_answers: Vec<ExtractiveAnswer>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExtractiveSegment {
    #[serde(default)]
    pub content: String,
    #[serde(rename = "relevanceScore", default)]
    pub relevance_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExtractiveAnswer {
    #[serde(default)]
    pub content: String,
    #[serde(rename = "pageNumber", default, deserialize_with = "page_number")]
    pub page_number: Option<u32>,
}

/// Raw `:search` response body.
#[derive(Debug, Default, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub results: Vec<WireResult>,
}

#[derive(Debug, Deserialize)]
pub struct WireResult {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub document: Option<WireDocument>,
}

#[derive(Debug, Deserialize)]
pub struct WireDocument {
    #[serde(default)]
    pub id: Option<String>,
    /// Free-form struct; decoded per result so one bad document cannot sink
    /// the whole response.
    #[serde(rename = "derivedStructData", default)]
    pub derived_struct_data: Option<Value>,
}

impl SearchResponse {
    /// Flatten into ranked results, preserving service order.
    pub fn into_results(self) -> Vec<SearchResult> {
        self.results
            .into_iter()
            .enumerate()
            .map(|(rank, r)| {
                let (doc_id, derived) = match r.document {
                    Some(doc) => (doc.id, doc.derived_struct_data),
                    None => (None, None),
                };
                let id = r.id.or(doc_id).unwrap_or_default();
                let derived = derived.and_then(|raw| decode_derived(&id, rank, raw));
                SearchResult { id, rank, derived }
            })
            .collect()
    }
}

fn decode_derived(id: &str, rank: usize, raw: Value) -> Option<DerivedData> {
    if raw.is_null() {
        return None;
    }
    match serde_json::from_value(raw) {
        Ok(derived) => Some(derived),
        Err(e) => {
            warn!(rank, id, error = %e, "undecodable derived data, treating as missing");
            None
        }
    }
}

/// The REST surface encodes int64 page numbers as strings; accept both forms.
fn page_number<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}
