//! The HTTP surface, grounded on `dtmsvr/api_http.go`'s route table and
//! `dtmutil.WrapHandler2`'s status-code translation. Handlers are thin:
//! parse, call into `TransactionEngine`, translate the `DtmResult`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dtm_engine::TransactionEngine;
use dtm_store::Store;
use dtm_types::{gen_gid, Branch, BranchOp, BranchStatus, DtmError, Global, TransType};
use serde_json::json;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TransactionEngine>,
    pub store: Arc<dyn Store>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/dtmsvr/newGid", get(new_gid))
        .route("/api/dtmsvr/prepare", post(prepare))
        .route("/api/dtmsvr/submit", post(submit))
        .route("/api/dtmsvr/abort", post(abort))
        .route("/api/dtmsvr/registerBranch", post(register_branch))
        .route("/api/dtmsvr/registerXaBranch", post(register_branch))
        .route("/api/dtmsvr/registerTccBranch", post(register_branch))
        .route("/api/dtmsvr/query", get(query))
        .route("/api/dtmsvr/all", get(all))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Maps the sentinel error taxonomy to HTTP status codes: `Failure` and
/// `Duplicated` both mean "the caller's second phase should not proceed" —
/// 409 is the signal every client SDK polls for. `Ongoing` means "retry at
/// the same cadence", surfaced as the non-standard 425 the whole ecosystem
/// has settled on. Anything else is an opaque 500.
fn dtm_error_response(err: DtmError) -> Response {
    let (status, body) = match &err {
        DtmError::Failure | DtmError::Duplicated => (StatusCode::CONFLICT, json!({"dtm_result": "FAILURE", "message": err.to_string()})),
        DtmError::Ongoing => (StatusCode::from_u16(425).unwrap(), json!({"dtm_result": "ONGOING", "message": err.to_string()})),
        DtmError::NotFound => (StatusCode::NOT_FOUND, json!({"message": err.to_string()})),
        DtmError::UniqueConflict | DtmError::Driver(_) => (StatusCode::INTERNAL_SERVER_ERROR, json!({"message": err.to_string()})),
    };
    (status, Json(body)).into_response()
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

async fn new_gid() -> impl IntoResponse {
    Json(json!({"gid": gen_gid(), "dtm_result": "SUCCESS"}))
}

async fn prepare(State(state): State<AppState>, Json(global): Json<Global>) -> Response {
    match state.engine.prepare(global).await {
        Ok(()) => Json(json!({"dtm_result": "SUCCESS"})).into_response(),
        Err(e) => dtm_error_response(e),
    }
}

async fn submit(State(state): State<AppState>, Json(global): Json<Global>) -> Response {
    match state.engine.submit(global).await {
        Ok(()) => Json(json!({"dtm_result": "SUCCESS"})).into_response(),
        Err(e) => dtm_error_response(e),
    }
}

#[derive(serde::Deserialize)]
struct AbortRequest {
    gid: String,
}

async fn abort(State(state): State<AppState>, Json(req): Json<AbortRequest>) -> Response {
    match state.engine.abort(&req.gid).await {
        Ok(()) => Json(json!({"dtm_result": "SUCCESS"})).into_response(),
        Err(e) => dtm_error_response(e),
    }
}

async fn register_branch(State(state): State<AppState>, Json(data): Json<HashMap<String, String>>) -> Response {
    let gid = data.get("gid").cloned().unwrap_or_default();
    let branch_id = data.get("branch_id").cloned().unwrap_or_default();
    let trans_type: TransType = match data.get("trans_type").and_then(|s| s.parse().ok()) {
        Some(t) => t,
        None => return dtm_error_response(DtmError::driver("missing or invalid trans_type")),
    };
    let bin_data = data.get("data").map(|s| serde_json::from_str(s).unwrap_or(serde_json::Value::String(s.clone()))).unwrap_or(serde_json::Value::Null);

    let mut branch = Branch::new(&gid, branch_id, BranchOp::Try, "", bin_data);
    branch.status = BranchStatus::Prepared;

    match state.engine.register_branch(trans_type, &branch, &data).await {
        Ok(()) => Json(json!({"dtm_result": "SUCCESS"})).into_response(),
        Err(e) => dtm_error_response(e),
    }
}

#[derive(serde::Deserialize)]
struct QueryRequest {
    gid: String,
}

async fn query(State(state): State<AppState>, Query(req): Query<QueryRequest>) -> Response {
    match state.store.find_global(&req.gid).await {
        Ok(Some(global)) => Json(global).into_response(),
        Ok(None) => dtm_error_response(DtmError::NotFound),
        Err(e) => dtm_error_response(e),
    }
}

#[derive(serde::Deserialize, Default)]
struct AllRequest {
    cursor: Option<i64>,
    limit: Option<i64>,
}

async fn all(State(state): State<AppState>, Query(req): Query<AllRequest>) -> Response {
    match state.store.scan_globals(req.cursor, req.limit.unwrap_or(100)).await {
        Ok(page) => Json(json!({"transGlobals": page.globals, "next_cursor": page.next_cursor})).into_response(),
        Err(e) => dtm_error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use dtm_engine::{Dispatcher, TransactionEngine};
    use dtm_store::SqliteStore;
    use dtm_types::Protocol;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let sqlite = SqliteStore::in_memory().await.unwrap();
        sqlite.ensure_schema().await.unwrap();
        let store: Arc<dyn Store> = Arc::new(sqlite);
        let flusher = dtm_engine::spawn_flusher(store.clone());
        let engine = Arc::new(TransactionEngine::new(store.clone(), Dispatcher::with_null_driver(), flusher, false));
        AppState { engine, store }
    }

    #[tokio::test]
    async fn new_gid_returns_a_gid() {
        let app = build_router(test_state().await);
        let resp = app.oneshot(Request::builder().uri("/api/dtmsvr/newGid").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn prepare_then_query_round_trips_the_global() {
        let app = build_router(test_state().await);
        let global = Global::new("ghttp1".into(), TransType::Saga, Protocol::Http);
        let body = serde_json::to_vec(&global).unwrap();
        let resp = app
            .clone()
            .oneshot(Request::builder().method("POST").uri("/api/dtmsvr/prepare").header("content-type", "application/json").body(Body::from(body)).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app.oneshot(Request::builder().uri("/api/dtmsvr/query?gid=ghttp1").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn query_for_unknown_gid_is_not_found() {
        let app = build_router(test_state().await);
        let resp = app.oneshot(Request::builder().uri("/api/dtmsvr/query?gid=nope").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
