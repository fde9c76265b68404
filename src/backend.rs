//! The downstream capability the engine drives, and its HTTP implementation.
//!
//! [`NativeHandler`] is anything that accepts a native request and produces a
//! native response or a sequence of native events. The engine never talks to
//! the network itself; production wires in [`HttpBackend`], tests wire in a
//! stub.

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::config::NativeConfig;
use crate::error::{NativeFailure, Result, ShimError};
use crate::translate::native_types::{
    NativeChatRequest, NativeChatResponse, NativeGenerateRequest, NativeGenerateResponse,
    NativeListResponse, NativeShowRequest, NativeShowResponse, NativeStreamLine,
};

/// Native events in production order. Dropping the stream tells the
/// producer to stop generating.
pub type NativeStream<T> = BoxStream<'static, Result<T>>;

/// A successful, complete native document with the status it came with.
#[derive(Debug, Clone)]
pub struct Native<T> {
    pub status: StatusCode,
    pub body: T,
}

impl<T> Native<T> {
    pub fn ok(body: T) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }
}

pub enum NativeReply<T> {
    Complete(Native<T>),
    Stream(NativeStream<T>),
}

/// Non-success outcomes are reported as `Err(ShimError::Downstream(..))`
/// so the engine can forward them unchanged.
#[async_trait]
pub trait NativeHandler: Send + Sync {
    async fn chat(&self, req: NativeChatRequest) -> Result<NativeReply<NativeChatResponse>>;

    async fn generate(
        &self,
        req: NativeGenerateRequest,
    ) -> Result<NativeReply<NativeGenerateResponse>>;

    async fn list(&self) -> Result<Native<NativeListResponse>>;

    async fn show(&self, req: NativeShowRequest) -> Result<Native<NativeShowResponse>>;
}

/// Forwards native requests to a model runtime over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(config: &NativeConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        Ok(Self {
            client: builder.build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<reqwest::Response> {
        let url = self.url(path);
        tracing::debug!(%url, "POST native");
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ShimError::unreachable(format!("Request to {url} failed: {e}")))?;
        check_status(response).await
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = self.url(path);
        tracing::debug!(%url, "GET native");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ShimError::unreachable(format!("Request to {url} failed: {e}")))?;
        check_status(response).await
    }
}

#[async_trait]
impl NativeHandler for HttpBackend {
    async fn chat(&self, req: NativeChatRequest) -> Result<NativeReply<NativeChatResponse>> {
        let response = self.post("/api/chat", &req).await?;
        reply(response, req.stream).await
    }

    async fn generate(
        &self,
        req: NativeGenerateRequest,
    ) -> Result<NativeReply<NativeGenerateResponse>> {
        let response = self.post("/api/generate", &req).await?;
        reply(response, req.stream).await
    }

    async fn list(&self) -> Result<Native<NativeListResponse>> {
        let response = self.get("/api/tags").await?;
        complete(response).await
    }

    async fn show(&self, req: NativeShowRequest) -> Result<Native<NativeShowResponse>> {
        let response = self.post("/api/show", &req).await?;
        complete(response).await
    }
}

/// Turn a non-success native response into a verbatim [`NativeFailure`].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let body = response
        .bytes()
        .await
        .map_err(|e| ShimError::unreachable(format!("Failed to read native error body: {e}")))?;

    Err(ShimError::Downstream(NativeFailure {
        status: StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
        content_type,
        body,
    }))
}

async fn reply<T>(response: reqwest::Response, stream: bool) -> Result<NativeReply<T>>
where
    T: DeserializeOwned + Send + 'static,
{
    if stream {
        Ok(NativeReply::Stream(Box::pin(ndjson_stream(
            response.bytes_stream(),
        ))))
    } else {
        Ok(NativeReply::Complete(complete(response).await?))
    }
}

async fn complete<T: DeserializeOwned>(response: reqwest::Response) -> Result<Native<T>> {
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::OK);
    let body = response
        .bytes()
        .await
        .map_err(|e| ShimError::unreachable(format!("Failed to read native response: {e}")))?;
    let body = serde_json::from_slice(&body).map_err(|e| {
        ShimError::unreachable(format!(
            "Failed to parse native response: {e}. Body: {}",
            truncate(&String::from_utf8_lossy(&body), 300)
        ))
    })?;
    Ok(Native { status, body })
}

/// Split a newline-delimited JSON byte stream into native events.
///
/// An in-band `{"error": ...}` line or a transport error ends the stream
/// with an `Err` item.
pub fn ndjson_stream<T, S, E>(byte_stream: S) -> impl Stream<Item = Result<T>> + Send + 'static
where
    T: DeserializeOwned + Send + 'static,
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        tokio::pin!(byte_stream);

        loop {
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                match parse_line::<T>(&line) {
                    Some(Ok(event)) => {
                        yield Ok(event);
                    }
                    Some(Err(e)) => {
                        yield Err(e);
                        return;
                    }
                    None => {}
                }
            }

            match byte_stream.next().await {
                Some(Ok(bytes)) => buffer.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    yield Err(ShimError::stream(format!("native byte stream error: {e}")));
                    return;
                }
                None => break,
            }
        }

        // Final line without a trailing newline.
        if let Some(item) = parse_line::<T>(&buffer) {
            yield item;
        }
    }
}

fn parse_line<T: DeserializeOwned>(line: &[u8]) -> Option<Result<T>> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(e) => {
            return Some(Err(ShimError::stream(format!(
                "native event is not valid UTF-8: {e}"
            ))))
        }
    };
    if text.is_empty() {
        return None;
    }
    Some(match serde_json::from_str::<NativeStreamLine<T>>(text) {
        Ok(NativeStreamLine::Event(event)) => Ok(event),
        Ok(NativeStreamLine::Error { error }) => Err(ShimError::stream(error)),
        Err(e) => Err(ShimError::stream(format!(
            "unparseable native event: {e}. Line: {}",
            truncate(text, 200)
        ))),
    })
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use futures::stream;
    use serde_json::json;

    fn bytes_of(parts: &[&str]) -> Vec<std::result::Result<Bytes, std::io::Error>> {
        parts
            .iter()
            .map(|p| Ok(Bytes::from(p.as_bytes().to_vec())))
            .collect()
    }

    #[tokio::test]
    async fn test_ndjson_lines_split_across_chunks() {
        let parts = bytes_of(&[
            "{\"model\":\"m\",\"response\":\"Hel\",\"done\":false}\n{\"model\":\"m\",\"resp",
            "onse\":\"lo\",\"done\":false}\n",
            "{\"model\":\"m\",\"response\":\"\",\"done\":true,\"done_reason\":\"stop\"}",
        ]);
        let events: Vec<Result<NativeGenerateResponse>> =
            ndjson_stream(stream::iter(parts)).collect().await;

        assert_eq!(events.len(), 3);
        let texts: Vec<String> = events
            .iter()
            .map(|e| e.as_ref().unwrap().response.clone())
            .collect();
        assert_eq!(texts, vec!["Hel", "lo", ""]);
        assert!(events[2].as_ref().unwrap().done);
    }

    #[tokio::test]
    async fn test_multibyte_char_split_across_chunks() {
        let line = "{\"response\":\"caf\u{e9}\",\"done\":false}\n";
        let bytes = line.as_bytes();
        let split = line.find('\u{e9}').unwrap() + 1;
        let parts: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::copy_from_slice(&bytes[..split])),
            Ok(Bytes::copy_from_slice(&bytes[split..])),
        ];
        let events: Vec<Result<NativeGenerateResponse>> =
            ndjson_stream(stream::iter(parts)).collect().await;
        assert_eq!(events[0].as_ref().unwrap().response, "caf\u{e9}");
    }

    #[tokio::test]
    async fn test_in_band_error_ends_stream() {
        let parts = bytes_of(&[
            "{\"response\":\"a\",\"done\":false}\n",
            "{\"error\":\"out of memory\"}\n",
            "{\"response\":\"b\",\"done\":false}\n",
        ]);
        let events: Vec<Result<NativeGenerateResponse>> =
            ndjson_stream(stream::iter(parts)).collect().await;
        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(matches!(&events[1], Err(ShimError::Stream { message }) if message == "out of memory"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_a_stream_error() {
        let parts: Vec<std::result::Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"{\"response\":\"ok\",\"done\":false}\n")),
            Ok(Bytes::from_static(b"{\"response\":\"\xff\xfe\",\"done\":false}\n")),
        ];
        let events: Vec<Result<NativeGenerateResponse>> =
            ndjson_stream(stream::iter(parts)).collect().await;
        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(
            matches!(&events[1], Err(ShimError::Stream { message }) if message.contains("UTF-8"))
        );
    }

    // -- HttpBackend against a local native server --

    const CHAT_STREAM: &str = concat!(
        "{\"model\":\"llama3\",\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n",
        "{\"model\":\"llama3\",\"message\":{\"role\":\"assistant\",\"content\":\"lo\"},\"done\":false}\n",
        "{\"model\":\"llama3\",\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"done_reason\":\"stop\"}\n",
    );

    async fn native_chat(Json(req): Json<NativeChatRequest>) -> Response {
        if req.stream {
            ([(header::CONTENT_TYPE, "application/x-ndjson")], CHAT_STREAM).into_response()
        } else {
            Json(json!({
                "model": req.model,
                "message": {"role": "assistant", "content": "Hello!"},
                "done": true,
                "done_reason": "stop",
                "prompt_eval_count": 3,
                "eval_count": 2
            }))
            .into_response()
        }
    }

    async fn native_generate_rejects() -> Response {
        (
            StatusCode::BAD_REQUEST,
            [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
            r#"{"error":"invalid request"}"#,
        )
            .into_response()
    }

    async fn native_tags() -> Json<serde_json::Value> {
        Json(json!({"models": [{"name": "llama3:latest", "size": 42}]}))
    }

    async fn spawn_native() -> HttpBackend {
        let app = Router::new()
            .route("/api/chat", post(native_chat))
            .route("/api/generate", post(native_generate_rejects))
            .route("/api/tags", get(native_tags));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        HttpBackend::new(&NativeConfig {
            base_url: format!("http://{addr}/"),
            timeout_secs: Some(5),
        })
        .unwrap()
    }

    fn chat_request(stream: bool) -> NativeChatRequest {
        NativeChatRequest {
            model: "llama3".to_string(),
            messages: Vec::new(),
            stream,
            format: None,
            options: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_native_error_is_captured_verbatim() {
        let backend = spawn_native().await;
        let req = NativeGenerateRequest {
            model: "llama3".to_string(),
            prompt: "Hello".to_string(),
            suffix: None,
            stream: false,
            options: Default::default(),
        };

        let failure = match backend.generate(req).await {
            Err(ShimError::Downstream(failure)) => failure,
            Err(e) => panic!("expected a downstream failure, got {e}"),
            Ok(_) => panic!("expected a downstream failure, got a reply"),
        };
        assert_eq!(failure.status, StatusCode::BAD_REQUEST);
        assert_eq!(
            failure.content_type.as_deref(),
            Some("application/json; charset=utf-8")
        );
        assert_eq!(failure.body, Bytes::from_static(br#"{"error":"invalid request"}"#));
    }

    #[tokio::test]
    async fn test_streaming_chat_yields_native_events() {
        let backend = spawn_native().await;
        assert!(!backend.base_url().ends_with('/'));

        let events = match backend.chat(chat_request(true)).await {
            Ok(NativeReply::Stream(events)) => events,
            Ok(NativeReply::Complete(_)) => panic!("expected a stream for stream: true"),
            Err(e) => panic!("chat failed: {e}"),
        };
        let events: Vec<NativeChatResponse> = events
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].message.content, "Hel");
        assert_eq!(events[1].message.content, "lo");
        assert!(events[2].done);
        assert_eq!(events[2].done_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_non_streaming_chat_is_complete() {
        let backend = spawn_native().await;

        let native = match backend.chat(chat_request(false)).await {
            Ok(NativeReply::Complete(native)) => native,
            Ok(NativeReply::Stream(_)) => panic!("expected a complete reply for stream: false"),
            Err(e) => panic!("chat failed: {e}"),
        };
        assert_eq!(native.status, StatusCode::OK);
        assert_eq!(native.body.message.content, "Hello!");
        assert_eq!(native.body.eval_count, Some(2));
    }

    #[tokio::test]
    async fn test_list_reads_tags() {
        let backend = spawn_native().await;
        let native = backend.list().await.unwrap();
        assert_eq!(native.body.models.len(), 1);
        assert_eq!(native.body.models[0].name, "llama3:latest");
        assert_eq!(native.body.models[0].size, 42);
    }

    #[tokio::test]
    async fn test_unreachable_runtime_is_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = HttpBackend::new(&NativeConfig {
            base_url: format!("http://{addr}"),
            timeout_secs: Some(5),
        })
        .unwrap();
        assert!(matches!(
            backend.list().await,
            Err(ShimError::Unreachable { .. })
        ));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("h\u{e9}llo", 2), "h");
        assert_eq!(truncate("short", 300), "short");
    }
}
