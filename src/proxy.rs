//! The middleware boundary between public callers and the native handler.
//!
//! Each operation rewrites the inbound request, invokes the injected
//! [`NativeHandler`] once, and reshapes what comes back. Streamed replies are
//! driven through a [`Reassembler`] and framed as SSE data payloads ending
//! with the `[DONE]` sentinel.

use axum::http::StatusCode;
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;

use crate::backend::{NativeHandler, NativeReply, NativeStream};
use crate::config::TranslationConfig;
use crate::error::{Result, ShimError};
use crate::logging::{ExchangeLog, ExchangeRecord, Outcome};
use crate::translate::models::{list_to_public, show_to_public};
use crate::translate::openai_types::{
    ChatCompletion, ChatCompletionRequest, Completion, CompletionRequest, ErrorResponse, Model,
    ModelList,
};
use crate::translate::request::{chat_to_native, completion_to_native, retrieve_to_native};
use crate::translate::response::{chat_to_public, completion_to_public, UsageEstimator};
use crate::translate::streaming::{ChatStream, CompletionStream, Reassembler, StreamKind};

pub const DONE_SENTINEL: &str = "[DONE]";

/// The closed set of public endpoints, each bound to one translator pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    ChatCompletions,
    Completions,
    ListModels,
    RetrieveModel,
}

impl Endpoint {
    pub const ALL: [Endpoint; 4] = [
        Self::ChatCompletions,
        Self::Completions,
        Self::ListModels,
        Self::RetrieveModel,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat.completions",
            Self::Completions => "completions",
            Self::ListModels => "models.list",
            Self::RetrieveModel => "models.retrieve",
        }
    }

    /// Route pattern in the router's path syntax.
    pub fn route(self) -> &'static str {
        match self {
            Self::ChatCompletions => "/v1/chat/completions",
            Self::Completions => "/v1/completions",
            Self::ListModels => "/v1/models",
            Self::RetrieveModel => "/v1/models/*model",
        }
    }
}

/// One SSE `data:` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub data: String,
}

impl SseFrame {
    pub fn done() -> Self {
        Self {
            data: DONE_SENTINEL.to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            data: serde_json::to_string(&ErrorResponse::api_error(message))
                .unwrap_or_else(|_| "{}".to_string()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.data == DONE_SENTINEL
    }
}

pub type SseStream = Pin<Box<dyn Stream<Item = SseFrame> + Send>>;

/// Outcome of a chat or completion exchange.
pub enum Reply<T> {
    Complete(StatusCode, T),
    Streaming(SseStream),
}

/// The translation engine for one process; every call is request-scoped.
#[derive(Clone)]
pub struct Engine {
    handler: Arc<dyn NativeHandler>,
    settings: TranslationConfig,
    log: ExchangeLog,
}

impl Engine {
    pub fn new(handler: Arc<dyn NativeHandler>, settings: TranslationConfig, log: ExchangeLog) -> Self {
        Self {
            handler,
            settings,
            log,
        }
    }

    pub fn log(&self) -> &ExchangeLog {
        &self.log
    }

    pub async fn chat(&self, req: ChatCompletionRequest) -> Result<Reply<ChatCompletion>> {
        let endpoint = Endpoint::ChatCompletions;
        let native = chat_to_native(&req, &self.settings)
            .map_err(|e| self.rejected(endpoint, &req.model, e))?;

        let estimator = self.settings.estimate_usage.then(|| {
            let prompt: Vec<&str> = native.messages.iter().map(|m| m.content.as_str()).collect();
            UsageEstimator::for_prompt(&prompt.join("\n"))
        });
        let include_usage = req.stream_options.as_ref().is_some_and(|o| o.include_usage);

        tracing::debug!(
            model = %native.model,
            stream = native.stream,
            messages = native.messages.len(),
            "forwarding chat request"
        );

        let reply = self
            .handler
            .chat(native)
            .await
            .map_err(|e| self.native_failed(endpoint, &req.model, e))?;

        match reply {
            NativeReply::Complete(native) => {
                self.completed(endpoint, &req.model);
                Ok(Reply::Complete(
                    native.status,
                    chat_to_public(&native.body, &req.model, estimator.as_ref()),
                ))
            }
            NativeReply::Stream(events) => {
                let reassembler =
                    Reassembler::<ChatStream>::new(&req.model, include_usage, estimator);
                self.stream(endpoint, &req.model, events, reassembler)
                    .await
                    .map(Reply::Streaming)
            }
        }
    }

    pub async fn completion(&self, req: CompletionRequest) -> Result<Reply<Completion>> {
        let endpoint = Endpoint::Completions;
        let native = completion_to_native(&req, &self.settings)
            .map_err(|e| self.rejected(endpoint, &req.model, e))?;

        let estimator = self
            .settings
            .estimate_usage
            .then(|| UsageEstimator::for_prompt(&native.prompt));
        let include_usage = req.stream_options.as_ref().is_some_and(|o| o.include_usage);

        tracing::debug!(model = %native.model, stream = native.stream, "forwarding completion request");

        let reply = self
            .handler
            .generate(native)
            .await
            .map_err(|e| self.native_failed(endpoint, &req.model, e))?;

        match reply {
            NativeReply::Complete(native) => {
                self.completed(endpoint, &req.model);
                Ok(Reply::Complete(
                    native.status,
                    completion_to_public(&native.body, &req.model, estimator.as_ref()),
                ))
            }
            NativeReply::Stream(events) => {
                let reassembler =
                    Reassembler::<CompletionStream>::new(&req.model, include_usage, estimator);
                self.stream(endpoint, &req.model, events, reassembler)
                    .await
                    .map(Reply::Streaming)
            }
        }
    }

    pub async fn list_models(&self) -> Result<(StatusCode, ModelList)> {
        let endpoint = Endpoint::ListModels;
        let native = self
            .handler
            .list()
            .await
            .map_err(|e| self.native_failed(endpoint, "-", e))?;

        let list = list_to_public(&native.body);
        self.log.record(
            ExchangeRecord::new(endpoint.name(), Outcome::Completed)
                .detail(format!("{} models", list.data.len())),
        );
        Ok((native.status, list))
    }

    /// `model` is the identifier taken from the request path.
    pub async fn retrieve_model(&self, model: &str) -> Result<(StatusCode, Model)> {
        let endpoint = Endpoint::RetrieveModel;
        let native_req =
            retrieve_to_native(model).map_err(|e| self.rejected(endpoint, model, e))?;
        let requested = native_req.model.clone();

        let native = self
            .handler
            .show(native_req)
            .await
            .map_err(|e| self.native_failed(endpoint, &requested, e))?;

        self.completed(endpoint, &requested);
        Ok((native.status, show_to_public(&requested, &native.body)))
    }

    /// Drive native events through the reassembler.
    ///
    /// The first native event is awaited before returning so that a failure
    /// reported before any output is forwarded like a non-streaming one.
    async fn stream<K>(
        &self,
        endpoint: Endpoint,
        model: &str,
        mut events: NativeStream<K::Event>,
        mut reassembler: Reassembler<K>,
    ) -> Result<SseStream>
    where
        K: StreamKind + Send + 'static,
        K::Event: Send + 'static,
        K::Chunk: Send + 'static,
    {
        let first = match events.next().await {
            Some(Ok(event)) => event,
            Some(Err(e)) => return Err(self.native_failed(endpoint, model, e)),
            None => {
                return Err(self.native_failed(
                    endpoint,
                    model,
                    ShimError::stream("native stream ended before producing any event"),
                ))
            }
        };

        let mut guard = StreamGuard::new(self.log.clone(), endpoint, model);

        let frames = async_stream::stream! {
            let mut pending = Some(first);

            loop {
                let event = match pending.take() {
                    Some(event) => event,
                    None => match events.next().await {
                        Some(Ok(event)) => event,
                        Some(Err(e)) => {
                            let message = e.to_string();
                            guard.finish(Outcome::Failed, Some(message.clone()));
                            yield SseFrame::error(message);
                            return;
                        }
                        None => {
                            let message = "native stream ended before completion".to_string();
                            guard.finish(Outcome::Failed, Some(message.clone()));
                            yield SseFrame::error(message);
                            return;
                        }
                    },
                };

                for chunk in reassembler.process(&event) {
                    if let Some(frame) = chunk_frame(&chunk) {
                        guard.sent += 1;
                        yield frame;
                    }
                }

                if reassembler.is_terminated() {
                    guard.finish(Outcome::Completed, None);
                    yield SseFrame::done();
                    return;
                }
            }
        };

        Ok(Box::pin(frames))
    }

    fn rejected(&self, endpoint: Endpoint, model: &str, err: ShimError) -> ShimError {
        self.log.record(
            ExchangeRecord::new(endpoint.name(), Outcome::Rejected)
                .model(model)
                .detail(err.to_string()),
        );
        err
    }

    fn native_failed(&self, endpoint: Endpoint, model: &str, err: ShimError) -> ShimError {
        let outcome = if matches!(err, ShimError::Downstream(_)) {
            Outcome::NativeError
        } else {
            Outcome::Failed
        };
        self.log.record(
            ExchangeRecord::new(endpoint.name(), outcome)
                .model(model)
                .detail(err.to_string()),
        );
        err
    }

    fn completed(&self, endpoint: Endpoint, model: &str) {
        self.log
            .record(ExchangeRecord::new(endpoint.name(), Outcome::Completed).model(model));
    }
}

fn chunk_frame<C: Serialize>(chunk: &C) -> Option<SseFrame> {
    match serde_json::to_string(chunk) {
        Ok(data) => Some(SseFrame { data }),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize stream chunk");
            None
        }
    }
}

/// Records how a stream ended. Dropped unfinished means the caller went away.
struct StreamGuard {
    log: ExchangeLog,
    endpoint: Endpoint,
    model: String,
    sent: usize,
    finished: bool,
}

impl StreamGuard {
    fn new(log: ExchangeLog, endpoint: Endpoint, model: &str) -> Self {
        Self {
            log,
            endpoint,
            model: model.to_string(),
            sent: 0,
            finished: false,
        }
    }

    fn finish(&mut self, outcome: Outcome, detail: Option<String>) {
        self.finished = true;
        let mut record = ExchangeRecord::new(self.endpoint.name(), outcome)
            .model(self.model.clone())
            .chunks(self.sent);
        if let Some(detail) = detail {
            record = record.detail(detail);
        }
        self.log.record(record);
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(Outcome::Cancelled, None);
        }
    }
}
