//! HTTP front end for the relay store

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, DefaultBodyLimit, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::store::{PostOutcome, RelayStore};

/// Body returned for an accepted POST
pub const ACCEPTED_BODY: &str = "proposals-accepted";

/// `errorCode` for a batch that failed validation
pub const INVALID_REQUEST_FORMAT: &str = "invalid-request-format";

const UNAVAILABLE: &str = "unavailable";

/// JSON error body: `{"errorCode": ..., "message": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error_code: String,
    pub message: String,
}

impl ErrorBody {
    fn response(status: StatusCode, error_code: &str, message: impl Into<String>) -> Response {
        let body = ErrorBody {
            error_code: error_code.to_string(),
            message: message.into(),
        };
        tracing::debug!("Returning an error: {}: {}", body.error_code, body.message);
        (status, Json(body)).into_response()
    }
}

/// Build the relay router: `GET /` and `POST /`
pub fn router(store: Arc<RelayStore>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", get(handle_get).post(handle_post))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

/// Serve the relay on `listener` until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    store: Arc<RelayStore>,
    max_body_bytes: usize,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("🌐 SNICKER relay listening on http://{}", addr);

    axum::serve(listener, router(store, max_body_bytes))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Relay server failed")?;

    tracing::info!("🛑 SNICKER relay on {} stopped", addr);
    Ok(())
}

async fn handle_get(State(store): State<Arc<RelayStore>>) -> Response {
    match store.get_all().await {
        Ok(contents) => {
            let headers = [
                (
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                ),
                (header::CONTENT_LENGTH, HeaderValue::from(contents.len())),
            ];
            (headers, contents).into_response()
        }
        Err(e) => {
            tracing::error!("❌ Failed to read proposal store: {:#}", e);
            ErrorBody::response(
                StatusCode::INTERNAL_SERVER_ERROR,
                UNAVAILABLE,
                "Proposal store unavailable",
            )
        }
    }
}

async fn handle_post(
    State(store): State<Arc<RelayStore>>,
    body: Result<Bytes, BytesRejection>,
) -> Response {
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            return ErrorBody::response(
                StatusCode::BAD_REQUEST,
                INVALID_REQUEST_FORMAT,
                format!("Invalid request format: {}", rejection.body_text()),
            );
        }
    };

    match store.post(&body).await {
        Ok(PostOutcome::Accepted(_)) => ACCEPTED_BODY.into_response(),
        Ok(PostOutcome::Rejected(reason)) => ErrorBody::response(
            StatusCode::BAD_REQUEST,
            INVALID_REQUEST_FORMAT,
            format!("Invalid request format: {}", reason),
        ),
        Err(e) => {
            tracing::error!("❌ Failed to append proposals: {:#}", e);
            ErrorBody::response(
                StatusCode::INTERNAL_SERVER_ERROR,
                UNAVAILABLE,
                "Proposal store unavailable",
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_uses_camel_case() {
        let body = ErrorBody {
            error_code: INVALID_REQUEST_FORMAT.to_string(),
            message: "Invalid request format".to_string(),
        };

        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["errorCode"], "invalid-request-format");
        assert_eq!(json["message"], "Invalid request format");
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RelayStore::open(dir.path().join("p.txt")).await.unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(serve(listener, store, 1024, shutdown.clone()));
        shutdown.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
