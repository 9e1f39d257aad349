// =============================================================================
// server.rs - ONE ROUTE PER SOURCE
// =============================================================================
//
//   GET /api/scrape/{source}   run one source, answer with the JSON summary
//   GET /health                liveness for whatever hosts us
//   GET /metrics               per-source counters and dedup stats
//
// Scrape routes are GET only; anything else gets a JSON 405. A run that
// fails as a whole (no datastore, no targets, an abort-policy fetch
// failure, a browser that would not start, a panic) is a 500 that still
// carries the run log, so the cron job's output says what went wrong.
// =============================================================================

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

use crate::dedup::DedupEngine;
use crate::metrics::MetricsCollector;
use crate::models::{BasisEntry, ScrapeReport, SkippedRow, SourceId};
use crate::pipeline;
use crate::run_log::RunLog;
use crate::scanners::SourceAdapter;
use crate::store::BasisStore;

const STORE_NOT_CONFIGURED: &str =
    "Datastore is not configured (set CASH_BID_SUPABASE_URL and CASH_BID_SUPABASE_KEY)";

#[derive(Clone)]
pub struct AppState {
    pub adapters: Arc<HashMap<SourceId, Arc<dyn SourceAdapter>>>,
    /// None when the datastore credentials are missing
    pub store: Option<Arc<dyn BasisStore>>,
    pub dedup: Arc<DedupEngine>,
    pub metrics: Arc<MetricsCollector>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/scrape/:source",
            // HEAD would otherwise fall through to the GET handler and run a scrape
            get(scrape)
                .head(method_not_allowed)
                .fallback(method_not_allowed),
        )
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct ScrapeQuery {
    debug: Option<String>,
}

impl ScrapeQuery {
    fn wants_debug(&self) -> bool {
        matches!(self.debug.as_deref(), Some("true") | Some("1"))
    }
}

#[derive(Debug, Serialize)]
struct ScrapeSuccess {
    success: bool,
    message: String,
    log: Vec<String>,
    saved: Vec<BasisEntry>,
    skipped: Vec<SkippedRow>,
    errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    debug: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ScrapeFailure {
    success: bool,
    error: String,
    log: Vec<String>,
}

async fn scrape(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Query(query): Query<ScrapeQuery>,
) -> Response {
    let Some((source, adapter)) = source
        .parse::<SourceId>()
        .ok()
        .and_then(|id| state.adapters.get(&id).map(|a| (id, a.clone())))
    else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "error": format!("Unknown source '{}'", source) })),
        )
            .into_response();
    };

    let log = RunLog::new(source);
    let started = Instant::now();

    let outcome = match &state.store {
        None => Err(STORE_NOT_CONFIGURED.to_string()),
        Some(store) => {
            let today = Utc::now().date_naive();
            let run = pipeline::run(adapter.as_ref(), store.as_ref(), &state.dedup, today, &log);
            match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(report)) => Ok(report),
                Ok(Err(e)) => Err(e.to_string()),
                Err(panic) => Err(format!("Run panicked: {}", panic_message(panic.as_ref()))),
            }
        }
    };

    let elapsed = started.elapsed();
    match outcome {
        Ok(report) => {
            state.metrics.record_run(source, &report, elapsed);
            info!(
                source = %source,
                run_id = log.run_id(),
                saved = report.saved.len(),
                skipped = report.skipped.len(),
                errors = report.errors.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Run finished"
            );
            let debug = query
                .wants_debug()
                .then(|| debug_block(&log, &report, &state.dedup));
            success_response(source, report, log.lines(), debug)
        }
        Err(message) => {
            state.metrics.record_failure(source, elapsed);
            log.error(&message);
            error!(source = %source, run_id = log.run_id(), "Run failed: {}", message);
            failure_response(message, log.lines())
        }
    }
}

fn debug_block(log: &RunLog, report: &ScrapeReport, dedup: &DedupEngine) -> Value {
    json!({
        "run_id": log.run_id(),
        "rows_seen": report.rows_seen,
        "rows_ignored": report.rows_ignored,
        "targets": report.debug,
        "dedup": dedup.snapshot(),
    })
}

fn success_response(
    source: SourceId,
    report: ScrapeReport,
    log: Vec<String>,
    debug: Option<Value>,
) -> Response {
    let body = ScrapeSuccess {
        success: true,
        message: report.message(source),
        log,
        saved: report.saved,
        skipped: report.skipped,
        errors: report.errors,
        debug,
    };
    (StatusCode::OK, Json(body)).into_response()
}

fn failure_response(error: String, log: Vec<String>) -> Response {
    let body = ScrapeFailure {
        success: false,
        error,
        log,
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({ "success": false, "error": "Method not allowed" })),
    )
        .into_response()
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    Json(state.metrics.snapshot(state.dedup.snapshot())).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::models::{LocationTable, PageTarget, RawPage, Row};
    use crate::scanners::sheet_scanner::split_csv_rows;
    use crate::scanners::{FailurePolicy, TargetFetch};
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use futures::future::BoxFuture;
    use tower::ServiceExt;

    /// Serves one CSV page, or panics while tokenizing if asked to.
    struct CannedSheet {
        targets: Vec<PageTarget>,
        locations: LocationTable,
        csv: &'static str,
        panic_in_to_rows: bool,
    }

    impl SourceAdapter for CannedSheet {
        fn id(&self) -> SourceId {
            SourceId::Sheet
        }

        fn targets(&self) -> &[PageTarget] {
            &self.targets
        }

        fn locations(&self) -> &LocationTable {
            &self.locations
        }

        fn failure_policy(&self) -> FailurePolicy {
            FailurePolicy::Abort
        }

        fn fetch_raw<'a>(
            &'a self,
            _log: &'a RunLog,
        ) -> BoxFuture<'a, Result<Vec<TargetFetch>, SourceError>> {
            let fetched = self
                .targets
                .iter()
                .map(|target| TargetFetch {
                    target: target.clone(),
                    result: Ok(RawPage::Csv(self.csv.to_string())),
                })
                .collect();
            async move { Ok(fetched) }.boxed()
        }

        fn to_rows(&self, page: &RawPage) -> Vec<Row> {
            if self.panic_in_to_rows {
                panic!("sheet layout changed");
            }
            match page {
                RawPage::Csv(text) => split_csv_rows(text).into_iter().map(Row::from_cells).collect(),
                _ => Vec::new(),
            }
        }
    }

    fn state(store: Option<Arc<dyn BasisStore>>, panic_in_to_rows: bool) -> AppState {
        let sheet: Arc<dyn SourceAdapter> = Arc::new(CannedSheet {
            targets: vec![PageTarget {
                elevator_name: "Hampton Co-op".to_string(),
                url: "https://docs.example/sheet.csv".to_string(),
            }],
            locations: LocationTable::default(),
            csv: "Commodity,Cash,Basis\nCorn,4.05,-35\nSoybeans,9.87,\n",
            panic_in_to_rows,
        });
        AppState {
            adapters: Arc::new(HashMap::from([(SourceId::Sheet, sheet)])),
            store,
            dedup: Arc::new(DedupEngine::new(64)),
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    async fn call(state: AppState, source: &str, debug: bool) -> (StatusCode, Value) {
        let query = ScrapeQuery {
            debug: debug.then(|| "true".to_string()),
        };
        let response = scrape(State(state), Path(source.to_string()), Query(query)).await;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_successful_run_reports_saved_and_skipped() {
        let state = state(Some(Arc::new(MemoryStore::new())), false);
        let (status, body) = call(state.clone(), "sheet", false).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["saved"].as_array().unwrap().len(), 1);
        assert_eq!(body["saved"][0]["commodity"], "corn");
        assert_eq!(body["skipped"][0]["reason"], "Could not identify basis value");
        assert!(body.get("debug").is_none());
        assert!(body["message"].as_str().unwrap().starts_with("sheet: 3 rows read, 1 saved"));

        let snapshot = state.metrics.snapshot(state.dedup.snapshot());
        assert_eq!(snapshot.sources["sheet"].saved, 1);
    }

    #[tokio::test]
    async fn test_debug_block_on_request() {
        let state = state(Some(Arc::new(MemoryStore::new())), false);
        let (_, body) = call(state, "sheet", true).await;
        assert_eq!(body["debug"]["rows_seen"], 3);
        assert_eq!(body["debug"]["targets"][0]["kind"], "csv");
    }

    #[tokio::test]
    async fn test_missing_datastore_is_500_with_log() {
        let state = state(None, false);
        let (status, body) = call(state.clone(), "sheet", false).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], STORE_NOT_CONFIGURED);
        assert!(body["log"].as_array().unwrap().len() >= 2);
        assert_eq!(state.metrics.snapshot(state.dedup.snapshot()).sources["sheet"].failed_runs, 1);
    }

    #[tokio::test]
    async fn test_panicking_run_becomes_500() {
        let state = state(Some(Arc::new(MemoryStore::new())), true);
        let (status, body) = call(state, "sheet", false).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("sheet layout changed"));
    }

    #[tokio::test]
    async fn test_unknown_or_unregistered_source_is_404() {
        let (status, _) = call(state(None, false), "wheat", false).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(state(None, false), "chromium", false).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    async fn send(state: AppState, method: &str, uri: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    #[tokio::test]
    async fn test_router_runs_scrape_on_get() {
        let store = Arc::new(MemoryStore::new());
        let state = state(Some(store.clone()), false);

        let (status, bytes) = send(state, "GET", "/api/scrape/sheet?debug=1").await;
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["debug"]["rows_seen"], 3);
        assert_eq!(store.rows().len(), 1);
    }

    #[tokio::test]
    async fn test_router_rejects_post_without_touching_store() {
        let store = Arc::new(MemoryStore::new());
        let state = state(Some(store.clone()), false);

        let (status, bytes) = send(state.clone(), "POST", "/api/scrape/sheet").await;
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Method not allowed");
        assert!(store.rows().is_empty());
        let snapshot = state.metrics.snapshot(state.dedup.snapshot());
        assert_eq!(snapshot.sources["sheet"].runs + snapshot.sources["sheet"].failed_runs, 0);
    }

    #[tokio::test]
    async fn test_router_rejects_head_without_touching_store() {
        let store = Arc::new(MemoryStore::new());
        let state = state(Some(store.clone()), false);

        let (status, _) = send(state, "HEAD", "/api/scrape/sheet").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert!(store.rows().is_empty());
        assert_eq!(store.exists_calls(), 0);
    }
}
