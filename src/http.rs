//! HTTP control plane: the ingest claim/commit/fail API and the store
//! replicate/query API (spec §6).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use ledgerd_core::{ErrorKind, Ulid};

use crate::ingest::IngestLog;
use crate::metrics::Metrics;
use crate::store::StoreLog;

const SEGMENT_TOKEN_HEADER: &str = "X-Segment-Token";

#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<IngestLog>,
    pub store: Arc<StoreLog>,
    pub metrics: Arc<Metrics>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ingest/next", get(ingest_next))
        .route("/ingest/commit", post(ingest_commit))
        .route("/ingest/fail", post(ingest_fail))
        .route("/store/replicate", post(store_replicate))
        .route("/store/query", get(store_query))
        .route("/store/stats", get(store_stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

struct ApiError(ledgerd_core::Error);

impl From<ledgerd_core::Error> for ApiError {
    fn from(e: ledgerd_core::Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::NotExist | ErrorKind::NoSuchToken => StatusCode::NOT_FOUND,
            ErrorKind::Conflict | ErrorKind::Exists => StatusCode::CONFLICT,
            ErrorKind::Denied => StatusCode::FORBIDDEN,
            ErrorKind::MalformedRecord => StatusCode::BAD_REQUEST,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::NoPeersAvailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        log::warn!("request failed: {}", self.0);
        (status, self.0.to_string()).into_response()
    }
}

async fn ingest_next(State(state): State<AppState>) -> Result<Response, ApiError> {
    Metrics::inc(&state.metrics.claims_attempted);
    let Some(claim) = state.ingest.oldest().await? else {
        Metrics::inc(&state.metrics.claims_empty);
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    let body = state.ingest.read_claim(&claim).await?;
    let mut headers = HeaderMap::new();
    headers.insert(
        SEGMENT_TOKEN_HEADER,
        HeaderValue::from_str(&claim.token).expect("token is ascii-safe"),
    );
    Ok((StatusCode::OK, headers, body).into_response())
}

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

async fn ingest_commit(State(state): State<AppState>, Query(q): Query<TokenQuery>) -> Result<StatusCode, ApiError> {
    state.ingest.commit(&q.token).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ingest_fail(State(state): State<AppState>, Query(q): Query<TokenQuery>) -> Result<StatusCode, ApiError> {
    state.ingest.fail(&q.token).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn store_replicate(State(state): State<AppState>, body: Bytes) -> Result<StatusCode, ApiError> {
    Metrics::inc(&state.metrics.replication_ingress);
    state.store.append(&body).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct RangeQuery {
    from: Ulid,
    to: Ulid,
}

async fn store_query(State(state): State<AppState>, Query(q): Query<RangeQuery>) -> Result<Vec<u8>, ApiError> {
    Ok(state.store.query(q.from, q.to).await?)
}

async fn store_stats(State(state): State<AppState>) -> Result<axum::Json<crate::store::Statistics>, ApiError> {
    Ok(axum::Json(state.store.statistics().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use ledgerd_core::{Filesystem, MemFilesystem};
    use std::path::PathBuf;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let fs: Arc<dyn Filesystem> = Arc::new(MemFilesystem::new());
        let metrics = Arc::new(Metrics::new());
        let ingest = Arc::new(
            IngestLog::open(PathBuf::from("/ingest"), fs.clone(), metrics.clone(), Duration::from_secs(60))
                .await
                .unwrap(),
        );
        let store = Arc::new(
            StoreLog::open(PathBuf::from("/store"), fs, u64::MAX, Duration::from_secs(60))
                .await
                .unwrap(),
        );
        AppState { ingest, store, metrics }
    }

    #[tokio::test]
    async fn ingest_next_returns_404_when_empty() {
        let app = router(test_state().await);
        let resp = app
            .oneshot(Request::builder().uri("/ingest/next").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn commit_unknown_token_is_404() {
        let app = router(test_state().await);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ingest/commit?token=nope")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn replicate_then_query_round_trips() {
        let state = test_state().await;
        let id = Ulid::new();
        let record = format!("{id} hello\n");
        let app = router(state.clone());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/store/replicate")
                    .body(axum::body::Body::from(record.clone()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let queried = state.store.query(id, id).await.unwrap();
        assert_eq!(String::from_utf8(queried).unwrap(), record);
    }
}
