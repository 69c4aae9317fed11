use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    error::ScanError,
    scanner::{ScanConfig, ScanHandle, Scanner, DEFAULT_CONCURRENCY},
    types::{ScanEvent, ScanRequest, ScanSummary, DEFAULT_TIMEOUT},
};

#[derive(Clone, Default)]
pub struct AppState {
    inner: Arc<RwLock<ServerState>>, // shared mutable state for progress/results
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Debug, Default)]
struct ServerState {
    status: Status,
    results: Option<ScanSummary>,
    cancel: Option<CancellationToken>,
    generation: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    #[default]
    Idle,
    Running,
    Done,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Status {
    pub total: u32,
    pub completed: u32,
    pub open: u32,
    pub state: ScanState,
}

#[derive(Debug, Deserialize)]
pub struct StartScanBody {
    pub address: String,
    pub start_port: u16,
    pub end_port: u16,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan))
        .route("/results", get(get_results))
        .route("/cancel", post(post_cancel))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str) -> Result<()> {
    let app = router(AppState::new());
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("serving scan API on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    (StatusCode::OK, Json(s.status.clone()))
}

async fn get_results(State(app): State<AppState>) -> Response {
    let s = app.inner.read().await;
    if let Some(res) = s.results.as_ref() {
        (StatusCode::OK, Json(res.clone())).into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

async fn post_cancel(State(app): State<AppState>) -> Response {
    let s = app.inner.read().await;
    match (&s.cancel, s.status.state) {
        (Some(c), ScanState::Running) => {
            c.cancel();
            (StatusCode::ACCEPTED, Json(s.status.clone())).into_response()
        }
        _ => error_response(StatusCode::CONFLICT, "no scan is running"),
    }
}

async fn post_scan(State(app): State<AppState>, Json(body): Json<StartScanBody>) -> Response {
    let timeout = body
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_TIMEOUT);
    let request =
        ScanRequest::new(body.address, body.start_port, body.end_port).with_timeout(timeout);
    let scanner = Scanner::new(ScanConfig::new(
        body.concurrency.unwrap_or(DEFAULT_CONCURRENCY),
    ));
    let total = request.total();
    let cancel = CancellationToken::new();

    let handle = match scanner.start_with_cancel(request, cancel.clone()).await {
        Ok(h) => h,
        Err(e @ ScanError::InvalidRequest(_)) => {
            return error_response(StatusCode::BAD_REQUEST, &e.to_string())
        }
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    let status = Status {
        total,
        completed: 0,
        open: 0,
        state: ScanState::Running,
    };
    let generation = {
        let mut s = app.inner.write().await;
        // Cancel any existing scan
        if let Some(c) = s.cancel.take() {
            c.cancel();
        }
        s.generation += 1;
        s.status = status.clone();
        s.results = None;
        s.cancel = Some(cancel);
        s.generation
    };

    tokio::spawn(follow_scan(app.clone(), handle, generation));

    (StatusCode::ACCEPTED, Json(status)).into_response()
}

/// Mirror a scan's event stream into the shared state until it finishes.
async fn follow_scan(app: AppState, mut handle: ScanHandle, generation: u64) {
    while let Some(event) = handle.next_event().await {
        let mut s = app.inner.write().await;
        if s.generation != generation {
            // superseded by a newer scan
            continue;
        }
        match event {
            ScanEvent::Verdict(v) if v.open => s.status.open += 1,
            ScanEvent::Progress(p) => s.status.completed = p.completed,
            ScanEvent::Finished(summary) => {
                s.status.completed = summary.completed;
                s.status.state = if summary.cancelled {
                    ScanState::Cancelled
                } else {
                    ScanState::Done
                };
                s.results = Some(summary);
                s.cancel = None;
            }
            _ => {}
        }
    }

    if let Err(e) = handle.finish().await {
        error!("scan error: {e}");
        let mut s = app.inner.write().await;
        if s.generation == generation {
            s.status.state = ScanState::Idle;
            s.cancel = None;
        }
    }
}

fn error_response(code: StatusCode, msg: &str) -> Response {
    (
        code,
        Json(ErrorBody {
            error: msg.to_string(),
        }),
    )
        .into_response()
}
