//! HTTP surface: the download relay, its preflight, and a health probe.

use crate::admission::{admission_layer, apply_cors, Gatekeeper};
use crate::error::{PoolError, RelayError};
use crate::middleware::LeaseRotationMiddleware;
use crate::pool::LeasePool;
use crate::rate_limit::RateLimitTier;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use log::{info, warn};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use url::Url;

/// Fetches third-party media through the lease pool.
pub struct Relay {
    pool: Arc<LeasePool>,
    client: ClientWithMiddleware,
}

impl Relay {
    pub fn new(pool: Arc<LeasePool>) -> Self {
        let client = ClientBuilder::new(reqwest::Client::new())
            .with(LeaseRotationMiddleware::new(Arc::clone(&pool)))
            .build();
        Self { pool, client }
    }

    pub fn pool(&self) -> &Arc<LeasePool> {
        &self.pool
    }

    /// GET `target` through up to `attempt_count` distinct proxies.
    pub async fn fetch(&self, target: &str) -> Result<reqwest::Response, RelayError> {
        let url = Url::parse(target).map_err(|_| RelayError::InvalidTarget(target.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RelayError::InvalidTarget(target.to_string()));
        }

        self.pool.initialize().await?;

        self.client.get(url).send().await.map_err(|e| match e {
            reqwest_middleware::Error::Middleware(err) => match err.downcast::<RelayError>() {
                Ok(relay_error) => relay_error,
                Err(other) => RelayError::AttemptsExhausted {
                    attempts: 0,
                    last_error: other.to_string(),
                },
            },
            reqwest_middleware::Error::Reqwest(err) => RelayError::AttemptsExhausted {
                attempts: 0,
                last_error: err.to_string(),
            },
        })
    }
}

/// State for the relay routes. `relay` is `None` when no leasing credentials exist.
#[derive(Clone)]
pub struct RelayState {
    pub relay: Option<Arc<Relay>>,
}

/// Build the gateway router. The relay route sits behind admission control.
pub fn router(state: RelayState, gate: Arc<Gatekeeper>) -> Router {
    let admission = middleware::from_fn_with_state(
        gate.layer_state(RateLimitTier::Download.config()),
        admission_layer,
    );

    Router::new()
        .route(
            "/api/relay",
            post(relay_download).route_layer(admission).options(preflight),
        )
        .route("/api/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct RelayRequest {
    url: Option<String>,
    filename: Option<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(error: RelayError) -> Self {
        match error {
            RelayError::InvalidTarget(_) => Self::bad_request("Invalid download url"),
            RelayError::Pool(PoolError::NotConfigured) => {
                Self::internal("Proxy service not configured")
            }
            RelayError::Pool(e) => Self::internal(format!("Proxy service unavailable: {e}")),
            RelayError::AttemptsExhausted { .. } => Self::internal("Failed to download file"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(json!({ "message": self.message }))).into_response();
        apply_cors(response.headers_mut());
        response
    }
}

async fn relay_download(
    State(state): State<RelayState>,
    payload: Result<Json<RelayRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|_| ApiError::bad_request("Invalid request body"))?;

    let (Some(url), Some(filename)) = (
        request.url.filter(|u| !u.trim().is_empty()),
        request.filename.filter(|f| !f.trim().is_empty()),
    ) else {
        return Err(ApiError::bad_request("Missing url or filename"));
    };

    let relay = state
        .relay
        .ok_or(ApiError::from(RelayError::Pool(PoolError::NotConfigured)))?;

    let upstream = relay.fetch(&url).await.map_err(|e| {
        warn!("Relay of {} failed: {}", url, e);
        ApiError::from(e)
    })?;

    info!("Relaying {} as {}", url, filename);

    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static(content_type_for_filename(&filename)));
    let content_length = upstream.content_length();

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    if let Ok(disposition) = HeaderValue::from_str(&build_content_disposition(&filename)) {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }
    if let Some(length) = content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    apply_cors(headers);

    Ok(response)
}

async fn preflight() -> Response {
    let mut response = StatusCode::OK.into_response();
    apply_cors(response.headers_mut());
    response
}

async fn health(State(state): State<RelayState>) -> Json<serde_json::Value> {
    let proxies = state.relay.as_ref().map(|relay| {
        let (total, live) = relay.pool().get_stats();
        json!({ "total": total, "live": live, "state": format!("{:?}", relay.pool().state()) })
    });
    Json(json!({ "status": "ok", "proxies": proxies }))
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        sanitize_ascii_filename(filename),
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ' | '(' | ')') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_keeps_ascii_and_encodes_the_rest() {
        assert_eq!(
            build_content_disposition("clip (1).mp4"),
            "attachment; filename=\"clip (1).mp4\"; filename*=UTF-8''clip%20%281%29.mp4"
        );
        assert_eq!(
            build_content_disposition("vidéo\".mp4"),
            "attachment; filename=\"vid_o_.mp4\"; filename*=UTF-8''vid%C3%A9o%22.mp4"
        );
        assert_eq!(sanitize_ascii_filename("///"), "___");
        assert_eq!(sanitize_ascii_filename("  "), "download.bin");
    }

    #[test]
    fn content_type_from_extension() {
        assert_eq!(content_type_for_filename("a.MP4"), "video/mp4");
        assert_eq!(content_type_for_filename("a.jpeg"), "image/jpeg");
        assert_eq!(content_type_for_filename("noext"), "application/octet-stream");
    }
}
