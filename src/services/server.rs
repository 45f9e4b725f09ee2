//! HTTP boundary: the two pipeline steps that need provider credentials,
//! served to callers that should never see those credentials.

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{any, get},
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::core::config::Config;
use crate::core::error::{StoryError, StoryResult};
use crate::core::model::{GenerationRequest, IllustrationStyle};
use crate::services::backend::{ConfigServiceFactory, ServiceFactory};
use crate::utils::data_uri;

const MISSING_STORY_FIELDS: &str = "Missing required fields: prompt, style, personalization, pageCount.";
const MISSING_FLIPBOOK_FIELDS: &str = "Missing pdfData or title in the request.";

#[derive(Clone)]
pub struct AppState {
    factory: Arc<dyn ServiceFactory>,
}

impl AppState {
    pub fn new(factory: Arc<dyn ServiceFactory>) -> Self {
        Self { factory }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/generate-story", any(generate_story))
        .route("/api/create-flipbook", any(create_flipbook))
        .with_state(state)
}

pub async fn serve(config: Config) -> Result<()> {
    let bind = config.server.bind.clone();
    let body_limit = config.server.body_limit_mb * 1024 * 1024;
    let state = AppState::new(Arc::new(ConfigServiceFactory::new(config)));
    let app = create_router(state).layer(DefaultBodyLimit::max(body_limit));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Listening on http://{}", bind);
    axum::serve(listener, app.into_make_service())
        .await
        .context("Server stopped unexpectedly")?;
    Ok(())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

fn reply_error(err: &StoryError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    // Client faults are answered with the bare message so callers can show it as-is.
    let message = match err {
        StoryError::Validation(m) => m.clone(),
        other => other.to_string(),
    };
    if status.is_server_error() {
        error!("{}", message);
    } else {
        warn!("Rejected request: {}", message);
    }
    let body = json!({
        "message": message,
        "kind": err.kind(),
        "detail": err.message(),
    });
    (status, Json(body)).into_response()
}

fn method_not_allowed() -> Response {
    (StatusCode::METHOD_NOT_ALLOWED, Json(json!({ "message": "Method Not Allowed" }))).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoryRequestBody {
    prompt: Option<String>,
    style: Option<String>,
    personalization: Option<String>,
    page_count: Option<usize>,
}

fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

pub(crate) fn parse_story_request(body: &[u8]) -> StoryResult<GenerationRequest> {
    let missing = || StoryError::Validation(MISSING_STORY_FIELDS.to_string());
    let body: StoryRequestBody = serde_json::from_slice(body).map_err(|_| missing())?;

    let (Some(prompt), Some(style), Some(personalization), Some(page_count)) = (
        present(body.prompt),
        present(body.style),
        present(body.personalization),
        body.page_count,
    ) else {
        return Err(missing());
    };
    let style: IllustrationStyle = style.parse()?;
    GenerationRequest::new(prompt, style, personalization, page_count)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlipbookRequestBody {
    pdf_data: Option<String>,
    title: Option<String>,
}

/// Accepts plain base64 as well as a `data:application/pdf;base64,` URI.
pub(crate) fn parse_flipbook_request(body: &[u8]) -> StoryResult<(Vec<u8>, String)> {
    let missing = || StoryError::Validation(MISSING_FLIPBOOK_FIELDS.to_string());
    let body: FlipbookRequestBody = serde_json::from_slice(body).map_err(|_| missing())?;
    let (Some(pdf_data), Some(title)) = (present(body.pdf_data), present(body.title)) else {
        return Err(missing());
    };

    let pdf = if pdf_data.starts_with("data:") {
        data_uri::decode(&pdf_data).map(|(_, bytes)| bytes).ok()
    } else {
        STANDARD.decode(pdf_data.trim()).ok()
    };
    match pdf {
        Some(pdf) if !pdf.is_empty() => Ok((pdf, title)),
        _ => Err(StoryError::Validation("pdfData is not valid base64.".into())),
    }
}

async fn generate_story(State(state): State<AppState>, method: Method, body: Bytes) -> Response {
    if method != Method::POST {
        return method_not_allowed();
    }
    let service = match state.factory.story_service() {
        Ok(service) => service,
        Err(e) => return reply_error(&e),
    };
    let request = match parse_story_request(&body) {
        Ok(request) => request,
        Err(e) => return reply_error(&e),
    };

    info!("Generating a {}-page {} story", request.page_count, request.style);
    match service.generate(&request).await {
        Ok(story) => (StatusCode::OK, Json(story)).into_response(),
        Err(e) => reply_error(&e),
    }
}

async fn create_flipbook(State(state): State<AppState>, method: Method, body: Bytes) -> Response {
    if method != Method::POST {
        return method_not_allowed();
    }
    let publisher = match state.factory.publisher() {
        Ok(publisher) => publisher,
        Err(e) => return reply_error(&e),
    };
    let (pdf, title) = match parse_flipbook_request(&body) {
        Ok(parsed) => parsed,
        Err(e) => return reply_error(&e),
    };

    match publisher.publish(pdf, &title).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(e) => reply_error(&e),
    }
}
