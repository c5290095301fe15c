use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{RagError, Result};
use crate::gcp::TokenSource;
use crate::rag::prompts;

const ANTHROPIC_VERTEX_VERSION: &str = "vertex-2023-10-16";
pub const MAX_OUTPUT_TOKENS: u32 = 4096;

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// One streaming completion call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Opaque token-stream completion service.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn stream(&self, request: GenerationRequest) -> Result<AnswerStream>;
}

/// What a generation pump sends to its [`AnswerStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Fragment(String),
    /// The service finished the answer. Must be the last item sent.
    Done,
}

/// Lazy, forward-only sequence of answer fragments.
///
/// Fragments are produced by a background task feeding a bounded channel.
/// Dropping the stream (or calling [`AnswerStream::close`]) aborts that task,
/// which drops the HTTP response and closes the connection. A failure is
/// delivered as an `Err` item and always ends the stream. So does a channel
/// that closes before the pump sent [`StreamItem::Done`], whether the pump
/// returned early or panicked.
pub struct AnswerStream {
    rx: mpsc::Receiver<Result<StreamItem>>,
    pump: Option<JoinHandle<()>>,
    finished: bool,
}

impl AnswerStream {
    pub fn new(rx: mpsc::Receiver<Result<StreamItem>>, pump: Option<JoinHandle<()>>) -> Self {
        Self {
            rx,
            pump,
            finished: false,
        }
    }

    /// Stop consuming and release the upstream connection.
    pub fn close(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.rx.close();
    }
}

impl Stream for AnswerStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        let item = match ready!(self.rx.poll_recv(cx)) {
            Some(Ok(StreamItem::Fragment(text))) => return Poll::Ready(Some(Ok(text))),
            Some(Ok(StreamItem::Done)) => None,
            Some(Err(e)) => Some(Err(e)),
            None => Some(Err(RagError::Generation(
                "answer stream ended without completing".to_string(),
            ))),
        };
        self.finished = true;
        Poll::Ready(item)
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        self.abort();
    }
}

/// A decoded server-sent event from the Messages streaming API.
#[derive(Debug, Clone, PartialEq)]
enum StreamEvent {
    Text(String),
    Stop,
    Error(String),
    Other,
}

fn parse_event(data: &str) -> Option<StreamEvent> {
    let json: Value = serde_json::from_str(data).ok()?;
    let event = match json["type"].as_str()? {
        "content_block_delta" if json["delta"]["type"] == "text_delta" => {
            StreamEvent::Text(json["delta"]["text"].as_str().unwrap_or_default().to_string())
        }
        "message_stop" => StreamEvent::Stop,
        "error" => StreamEvent::Error(
            json["error"]["message"]
                .as_str()
                .unwrap_or("unknown stream error")
                .to_string(),
        ),
        _ => StreamEvent::Other,
    };
    Some(event)
}

/// Splits a byte stream into lines without breaking multi-byte characters
/// that straddle chunk boundaries.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }
}

/// Forward text deltas from an SSE byte stream into `tx` until the service
/// signals `message_stop`. Anything else that ends the stream is an error.
async fn pump_events<S, B, E>(body: S, tx: mpsc::Sender<Result<StreamItem>>)
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut lines = LineBuffer::default();
    let mut fragments = 0usize;

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(RagError::Generation(e.to_string()))).await;
                return;
            }
        };

        for line in lines.push(chunk.as_ref()) {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            match parse_event(data.trim()) {
                Some(StreamEvent::Text(text)) if !text.is_empty() => {
                    fragments += 1;
                    if tx.send(Ok(StreamItem::Fragment(text))).await.is_err() {
                        debug!(fragments, "answer stream dropped by consumer");
                        return;
                    }
                }
                Some(StreamEvent::Stop) => {
                    info!(fragments, "answer stream complete");
                    let _ = tx.send(Ok(StreamItem::Done)).await;
                    return;
                }
                Some(StreamEvent::Error(message)) => {
                    warn!(%message, "answer stream aborted by service");
                    let _ = tx.send(Err(RagError::Generation(message))).await;
                    return;
                }
                _ => {}
            }
        }
    }

    let _ = tx
        .send(Err(RagError::Generation(
            "stream ended before message_stop".to_string(),
        )))
        .await;
}

/// Anthropic models served from Vertex AI (`streamRawPredict`).
pub struct VertexClaudeClient {
    client: reqwest::Client,
    url: String,
    credentials: Arc<dyn TokenSource>,
}

impl VertexClaudeClient {
    pub fn new(
        client: reqwest::Client,
        settings: &Settings,
        credentials: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            client,
            url: settings.generation_url(),
            credentials,
        }
    }
}

#[async_trait]
impl Generator for VertexClaudeClient {
    async fn stream(&self, request: GenerationRequest) -> Result<AnswerStream> {
        let token = self.credentials.access_token().await?;
        let body = serde_json::json!({
            "anthropic_version": ANTHROPIC_VERTEX_VERSION,
            "system": request.system,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": true,
        });

        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::Generation(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(RagError::Generation(format!("{} {}", status, text)));
        }

        let (tx, rx) = mpsc::channel(64);
        let pump = tokio::spawn(pump_events(resp.bytes_stream(), tx));
        Ok(AnswerStream::new(rx, Some(pump)))
    }
}

/// Builds the grounded prompt and opens a generation stream for it.
pub struct AnswerStreamer {
    generator: Arc<dyn Generator>,
    system: String,
}

impl AnswerStreamer {
    pub fn new(generator: Arc<dyn Generator>, client_name: &str) -> Self {
        Self {
            generator,
            system: prompts::system_prompt(client_name),
        }
    }

    pub fn request(&self, query: &str, context: &str) -> GenerationRequest {
        GenerationRequest {
            system: self.system.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompts::user_prompt(context, query),
            }],
            max_tokens: MAX_OUTPUT_TOKENS,
            temperature: 0.0,
        }
    }

    /// Each call is an independent generation; streams are not restartable.
    pub async fn stream(&self, query: &str, context: &str) -> Result<AnswerStream> {
        self.generator.stream(self.request(query, context)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sse(events: &[&str]) -> String {
        events
            .iter()
            .map(|e| format!("event: x\ndata: {}\n\n", e))
            .collect()
    }

    const DELTA_HELLO: &str =
        r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#;
    const DELTA_WORLD: &str =
        r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" world"}}"#;
    const STOP: &str = r#"{"type":"message_stop"}"#;

    async fn collect(stream: AnswerStream) -> Vec<Result<String>> {
        stream.collect().await
    }

    fn from_chunks(chunks: Vec<Vec<u8>>) -> AnswerStream {
        let (tx, rx) = mpsc::channel(8);
        let body = futures::stream::iter(
            chunks
                .into_iter()
                .map(Ok::<_, std::convert::Infallible>),
        );
        let pump = tokio::spawn(pump_events(body, tx));
        AnswerStream::new(rx, Some(pump))
    }

    #[test]
    fn test_parse_events() {
        assert_eq!(parse_event(DELTA_HELLO), Some(StreamEvent::Text("Hello".into())));
        assert_eq!(parse_event(STOP), Some(StreamEvent::Stop));
        assert_eq!(
            parse_event(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#),
            Some(StreamEvent::Error("Overloaded".into()))
        );
        assert_eq!(parse_event(r#"{"type":"ping"}"#), Some(StreamEvent::Other));
        assert_eq!(parse_event("not json"), None);
    }

    #[test]
    fn test_line_buffer_keeps_split_utf8() {
        let mut buf = LineBuffer::default();
        let bytes = "data: é\n".as_bytes();
        // Split inside the two-byte 'é'.
        assert!(buf.push(&bytes[..7]).is_empty());
        assert_eq!(buf.push(&bytes[7..]), vec!["data: é".to_string()]);
    }

    #[tokio::test]
    async fn test_fragments_in_arrival_order() {
        let body = sse(&[r#"{"type":"message_start"}"#, DELTA_HELLO, DELTA_WORLD, STOP]);
        let (a, b) = body.as_bytes().split_at(body.len() / 2);
        let items = collect(from_chunks(vec![a.to_vec(), b.to_vec()])).await;
        let text: Vec<_> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(text, vec!["Hello".to_string(), " world".to_string()]);
    }

    #[tokio::test]
    async fn test_truncated_stream_is_an_error() {
        let body = sse(&[DELTA_HELLO]);
        let items = collect(from_chunks(vec![body.into_bytes()])).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "Hello");
        assert!(matches!(items[1], Err(RagError::Generation(_))));
    }

    #[tokio::test]
    async fn test_service_error_event_aborts() {
        let body = sse(&[
            DELTA_HELLO,
            r#"{"type":"error","error":{"message":"Overloaded"}}"#,
            DELTA_WORLD,
        ]);
        let items = collect(from_chunks(vec![body.into_bytes()])).await;
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[1], Err(RagError::Generation(m)) if m == "Overloaded"));
    }

    #[tokio::test]
    async fn test_pump_that_stops_silently_is_an_error() {
        let (tx, rx) = mpsc::channel(4);
        let pump = tokio::spawn(async move {
            let _ = tx.send(Ok(StreamItem::Fragment("partial".into()))).await;
        });
        let items = collect(AnswerStream::new(rx, Some(pump))).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "partial");
        assert!(matches!(items[1], Err(RagError::Generation(_))));
    }

    #[tokio::test]
    async fn test_panicking_pump_is_an_error() {
        let (tx, rx) = mpsc::channel::<Result<StreamItem>>(4);
        let pump = tokio::spawn(async move {
            let _keep = tx;
            panic!("pump blew up");
        });
        let items = collect(AnswerStream::new(rx, Some(pump))).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(RagError::Generation(_))));
    }

    #[tokio::test]
    async fn test_done_ends_stream_cleanly() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(StreamItem::Fragment("a".into()))).await.unwrap();
        tx.send(Ok(StreamItem::Done)).await.unwrap();
        drop(tx);
        let items = collect(AnswerStream::new(rx, None)).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), "a");
    }

    #[tokio::test]
    async fn test_drop_aborts_pump() {
        let (tx, rx) = mpsc::channel::<Result<StreamItem>>(1);
        let pump = tokio::spawn(async move {
            loop {
                if tx.send(Ok(StreamItem::Fragment("x".into()))).await.is_err() {
                    return;
                }
            }
        });
        let pump_handle = pump.abort_handle();
        let stream = AnswerStream::new(rx, Some(pump));
        drop(stream);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pump_handle.is_finished());
    }

    struct Recording {
        seen: std::sync::Mutex<Vec<GenerationRequest>>,
    }

    #[async_trait]
    impl Generator for Recording {
        async fn stream(&self, request: GenerationRequest) -> Result<AnswerStream> {
            self.seen.lock().unwrap().push(request);
            let (_tx, rx) = mpsc::channel(1);
            Ok(AnswerStream::new(rx, None))
        }
    }

    #[tokio::test]
    async fn test_streamer_builds_fixed_request() {
        let generator = Arc::new(Recording {
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let streamer = AnswerStreamer::new(generator.clone(), "ABC Corp");
        streamer.stream("who signed?", "[Memo - Segment 1]: Bob\n\n").await.unwrap();

        let seen = generator.seen.lock().unwrap();
        let req = &seen[0];
        assert_eq!(req.max_tokens, 4096);
        assert_eq!(req.temperature, 0.0);
        assert!(req.system.contains("ABC Corp legal team"));
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, "user");
        assert!(req.messages[0].content.contains("[Memo - Segment 1]: Bob"));
        assert!(req.messages[0].content.contains("who signed?"));
    }
}
