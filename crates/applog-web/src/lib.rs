//! Axum JSON dashboard for ApplyLog. Each page is a snapshot from the record
//! source pushed through the aggregation engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use applog_client::{snapshot, ClientConfig, RecordSource, SourceError};
use applog_core::{ApplicationPatch, ApplicationRecord, NewApplication, PayloadError, Status};
use applog_engine::{
    daily_histogram, day_label, days_since, filter_and_sort, group_by_date, recent, rollup,
    rollup_from_group_counts, time_ago, timeline_summary, within_timeframe, DayCount, Rollup,
    StatusFilter, Timeframe, TimelineSummary, ViewCriteria, DEFAULT_RECENT_LIMIT,
    DEFAULT_TREND_DAYS,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "applog-web";

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("APPLOG_WEB_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| {
                info!("APPLOG_WEB_PORT not set or invalid, using default: 8080");
                8080
            });
        Self { port }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub source: Arc<dyn RecordSource>,
    pub snapshot_limit: usize,
    fixed_now: Option<DateTime<Utc>>,
}

impl AppState {
    pub fn new(source: Arc<dyn RecordSource>) -> Self {
        Self {
            source,
            snapshot_limit: ClientConfig::default().page_limit,
            fixed_now: None,
        }
    }

    pub fn with_snapshot_limit(mut self, limit: usize) -> Self {
        self.snapshot_limit = limit.max(1);
        self
    }

    /// Pins the reference instant for every time-relative view.
    pub fn with_fixed_now(mut self, now: DateTime<Utc>) -> Self {
        self.fixed_now = Some(now);
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.fixed_now.unwrap_or_else(Utc::now)
    }

    async fn records(&self) -> Result<Vec<ApplicationRecord>, SourceError> {
        snapshot(self.source.as_ref(), self.snapshot_limit).await
    }
}

#[derive(Debug, Error)]
pub enum WebError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebError::Source(SourceError::NotFound { .. }) => StatusCode::NOT_FOUND,
            WebError::Source(SourceError::EmptyPatch { .. }) => StatusCode::BAD_REQUEST,
            WebError::Source(_) => StatusCode::BAD_GATEWAY,
            WebError::Payload(_) => StatusCode::BAD_REQUEST,
        };
        if status.is_server_error() {
            error!(error = %self, "record source failure");
        } else {
            warn!(error = %self, %status, "request rejected");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// A record plus the display fields every page shows next to it.
#[derive(Debug, Serialize)]
struct RecordRow<'a> {
    #[serde(flatten)]
    record: &'a ApplicationRecord,
    status_label: String,
    category_label: String,
    updated_ago: Option<String>,
}

impl<'a> RecordRow<'a> {
    fn new(record: &'a ApplicationRecord, now: DateTime<Utc>) -> Self {
        Self {
            record,
            status_label: record.status.label(),
            category_label: record.category.label(),
            updated_ago: record.last_touched().map(|ts| time_ago(ts, now)),
        }
    }
}

fn rows<'a>(
    records: impl IntoIterator<Item = &'a ApplicationRecord>,
    now: DateTime<Utc>,
) -> Vec<RecordRow<'a>> {
    records
        .into_iter()
        .map(|record| RecordRow::new(record, now))
        .collect()
}

#[derive(Debug, Serialize)]
struct HomeView<'a> {
    total: usize,
    rollup: Rollup,
    shares: BTreeMap<String, u32>,
    conversion_rate: u32,
    recent: Vec<RecordRow<'a>>,
}

#[derive(Debug, Serialize)]
struct ApplicationsView<'a> {
    shown: usize,
    total: usize,
    criteria: &'a ViewCriteria,
    applications: Vec<RecordRow<'a>>,
}

#[derive(Debug, Serialize)]
struct DetailView<'a> {
    #[serde(flatten)]
    row: RecordRow<'a>,
    applied_label: Option<String>,
    days_since_applied: Option<i64>,
    has_notes: bool,
    has_important_dates: bool,
    has_links: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct StatsQuery {
    timeframe: Timeframe,
}

#[derive(Debug, Serialize)]
struct StatsView {
    timeframe: Timeframe,
    rollup: Rollup,
    trend: Vec<DayCount>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TimelineQuery {
    status: StatusFilter,
    range: Timeframe,
}

#[derive(Debug, Serialize)]
struct TimelineGroup<'a> {
    date: &'a str,
    label: Option<String>,
    applications: Vec<RecordRow<'a>>,
}

#[derive(Debug, Serialize)]
struct TimelineView<'a> {
    summary: TimelineSummary,
    groups: Vec<TimelineGroup<'a>>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(home_handler))
        .route("/health", get(health_handler))
        .route(
            "/applications",
            get(applications_handler).post(create_handler),
        )
        .route(
            "/applications/{id}",
            get(detail_handler).put(update_handler).delete(delete_handler),
        )
        .route("/stats", get(stats_handler))
        .route("/timeline", get(timeline_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

pub async fn serve(config: WebConfig, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "dashboard listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("dashboard shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("received terminate signal, shutting down");
            }
            Err(err) => {
                warn!(error = %err, "failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn home_handler(State(state): State<Arc<AppState>>) -> Result<Response, WebError> {
    let stats = state.source.stats().await?;
    let records = state.records().await?;
    let now = state.now();

    let summary = rollup_from_group_counts(&stats.counts);
    let shares = [Status::Applied, Status::Interview, Status::Offer]
        .iter()
        .map(|status| (status.as_str().to_string(), summary.share_of(status)))
        .collect::<BTreeMap<_, _>>();
    let view = HomeView {
        total: summary.total,
        conversion_rate: summary.success_rate,
        shares,
        recent: rows(recent(&records, DEFAULT_RECENT_LIMIT), now),
        rollup: summary,
    };
    Ok(Json(view).into_response())
}

async fn applications_handler(
    State(state): State<Arc<AppState>>,
    Query(criteria): Query<ViewCriteria>,
) -> Result<Response, WebError> {
    let records = state.records().await?;
    let now = state.now();
    let view = filter_and_sort(&records, &criteria);
    let body = ApplicationsView {
        shown: view.len(),
        total: records.len(),
        criteria: &criteria,
        applications: rows(view, now),
    };
    Ok(Json(body).into_response())
}

async fn detail_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, WebError> {
    let record = state.source.get(&id).await?;
    let now = state.now();
    let applied = record.applied_on();
    let view = DetailView {
        applied_label: applied.map(|day| day_label(day, now)),
        days_since_applied: applied.map(|day| days_since(day, now)),
        has_notes: record.has_notes(),
        has_important_dates: record.has_important_dates(),
        has_links: record.has_links(),
        row: RecordRow::new(&record, now),
    };
    Ok(Json(view).into_response())
}

async fn create_handler(
    State(state): State<Arc<AppState>>,
    Json(fields): Json<NewApplication>,
) -> Result<Response, WebError> {
    let fields = fields.prepare(state.now().date_naive())?;
    let created = state.source.create(&fields).await?;
    info!(id = %created.id, company = %created.company_name, "application created");
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

async fn update_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<ApplicationPatch>,
) -> Result<Response, WebError> {
    let patch = patch.normalized()?;
    let updated = state.source.update(&id, &patch).await?;
    Ok(Json(updated).into_response())
}

async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, WebError> {
    state.source.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn stats_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Response, WebError> {
    let records = state.records().await?;
    let now = state.now();
    let windowed = within_timeframe(&records, query.timeframe, now);
    let view = StatsView {
        timeframe: query.timeframe,
        rollup: rollup(windowed),
        trend: daily_histogram(&records, now, DEFAULT_TREND_DAYS),
    };
    Ok(Json(view).into_response())
}

async fn timeline_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TimelineQuery>,
) -> Result<Response, WebError> {
    let records = state.records().await?;
    let now = state.now();
    let by_status = records.iter().filter(|r| query.status.admits(&r.status));
    let windowed = within_timeframe(by_status, query.range, now);
    let summary = timeline_summary(windowed.iter().copied());
    let groups = group_by_date(windowed)
        .into_iter()
        .map(|bucket| TimelineGroup {
            date: bucket.date,
            label: applog_core::parse_calendar_day(bucket.date).map(|day| day_label(day, now)),
            applications: rows(bucket.applications, now),
        })
        .collect();
    Ok(Json(TimelineView { summary, groups }).into_response())
}
