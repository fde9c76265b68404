use crate::error::ShimError;
use crate::logging::{ExchangeRecord, Outcome};
use crate::proxy::{Endpoint, Engine, Reply, SseStream};

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(Endpoint::ChatCompletions.route(), post(handle_chat))
        .route(Endpoint::Completions.route(), post(handle_completion))
        .route(Endpoint::ListModels.route(), get(handle_list_models))
        .route(Endpoint::RetrieveModel.route(), get(handle_retrieve_model))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_chat(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let req = match parse_body(&state, Endpoint::ChatCompletions, &body) {
        Ok(req) => req,
        Err(e) => return e.into_response(),
    };

    match state.engine.chat(req).await {
        Ok(reply) => reply_response(reply),
        Err(e) => e.into_response(),
    }
}

async fn handle_completion(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let req = match parse_body(&state, Endpoint::Completions, &body) {
        Ok(req) => req,
        Err(e) => return e.into_response(),
    };

    match state.engine.completion(req).await {
        Ok(reply) => reply_response(reply),
        Err(e) => e.into_response(),
    }
}

async fn handle_list_models(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.list_models().await {
        Ok((status, list)) => (status, Json(list)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_retrieve_model(
    State(state): State<Arc<AppState>>,
    Path(model): Path<String>,
) -> Response {
    match state.engine.retrieve_model(&model).await {
        Ok((status, model)) => (status, Json(model)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Decode a request body, recording the rejection if it is not a valid request.
fn parse_body<T: DeserializeOwned>(
    state: &AppState,
    endpoint: Endpoint,
    body: &[u8],
) -> Result<T, ShimError> {
    serde_json::from_slice(body).map_err(|e| {
        let err = ShimError::malformed_request(format!("Invalid request body: {e}"));
        state.engine.log().record(
            ExchangeRecord::new(endpoint.name(), Outcome::Rejected).detail(err.to_string()),
        );
        err
    })
}

fn reply_response<T: Serialize>(reply: Reply<T>) -> Response {
    match reply {
        Reply::Complete(status, body) => (status, Json(body)).into_response(),
        Reply::Streaming(frames) => sse_response(frames),
    }
}

fn sse_response(frames: SseStream) -> Response {
    let events =
        frames.map(|frame| -> Result<Event, Infallible> { Ok(Event::default().data(frame.data)) });

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}
