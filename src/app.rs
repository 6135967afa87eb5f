#![cfg(feature = "web")]
//! HTTP routes
//!
//! Account routes live in [`crate::auth`]; this module wires them together
//! with the reading, stats and report handlers. Everything under `/api`
//! except the sign-up and sign-in flow requires a session.

use axum::{
    Extension, Json, Router,
    body::{Body, Bytes},
    extract::{Multipart, Path, Query, State},
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use uuid::Uuid;

use crate::archive;
use crate::auth::{self, CurrentUser, User};
use crate::chart::{self, ChartKind, ChartOptions};
use crate::config::Config;
use crate::error::{AppError, StoreError};
use crate::export;
use crate::import;
use crate::mailer::Mailer;
use crate::reading::{GlucoseUnit, NewReading, Reading, ReadingPatch, ReadingQuery};
use crate::saving::{self, UserBackup};
use crate::stats::{StatSummary, StatsRecord};
use crate::store::Database;

const CSV_TYPE: &str = "text/csv; charset=utf-8";
const XLSX_TYPE: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const PDF_TYPE: &str = "application/pdf";
const BACKUP_TYPE: &str = "application/gzip";

pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub sessions: auth::SessionStore,
    pub mailer: Mailer,
}

impl AppState {
    pub fn new(config: Config, mailer: Mailer) -> Result<Self, StoreError> {
        let db = Database::open(&config.data_dir)?;
        let sessions = auth::SessionStore::new(config.session_ttl());
        Ok(Self {
            config,
            db,
            sessions,
            mailer,
        })
    }
}

#[derive(Serialize)]
struct ReadingView {
    #[serde(flatten)]
    reading: Reading,
    /// Value in the user's preferred unit
    display_value: f64,
}

impl ReadingView {
    fn new(reading: Reading, unit: GlucoseUnit) -> Self {
        let display_value = reading.value_in(unit);
        Self {
            reading,
            display_value,
        }
    }
}

#[derive(Serialize)]
struct ReadingsResponse {
    unit: GlucoseUnit,
    readings: Vec<ReadingView>,
}

#[derive(Serialize)]
struct ReadingResponse {
    status: &'static str,
    reading: ReadingView,
    stats: Vec<StatSummary>,
}

#[derive(Serialize)]
struct StatsResponse {
    unit: GlucoseUnit,
    refreshed_at: Option<chrono::DateTime<Utc>>,
    last_weekly_archive: Option<chrono::NaiveDate>,
    last_monthly_archive: Option<chrono::NaiveDate>,
    stats: Vec<StatSummary>,
}

impl StatsResponse {
    fn new(stats: &StatsRecord, unit: GlucoseUnit) -> Self {
        Self {
            unit,
            refreshed_at: stats.refreshed_at,
            last_weekly_archive: stats.last_weekly_archive,
            last_monthly_archive: stats.last_monthly_archive,
            stats: stats.summary(unit),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct UnitQuery {
    unit: Option<GlucoseUnit>,
}

#[derive(Debug, Default, Deserialize)]
struct ChartQuery {
    days: Option<i64>,
    kind: Option<ChartKind>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ReportFormat {
    #[default]
    Csv,
    Xlsx,
    Pdf,
}

#[derive(Debug, Deserialize)]
struct ShareRequest {
    to: String,
    #[serde(default)]
    format: ReportFormat,
    message: Option<String>,
    #[serde(default)]
    from: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    until: Option<chrono::DateTime<Utc>>,
}

/// Builds the router with all API routes and the static fallback
pub fn router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/api/auth/register", post(auth::handle_register))
        .route("/api/auth/verify-email", post(auth::handle_verify_email))
        .route("/api/auth/resend-otp", post(auth::handle_resend_otp))
        .route("/api/auth/login", post(auth::handle_login))
        .route("/api/auth/forgot-password", post(auth::handle_forgot_password))
        .route("/api/auth/reset-password", post(auth::handle_reset_password));

    let protected = Router::new()
        .route("/api/auth/logout", post(auth::handle_logout))
        .route("/api/auth/change-password", post(auth::handle_change_password))
        .route(
            "/api/me",
            get(auth::handle_me)
                .put(auth::handle_update_profile)
                .delete(auth::handle_delete_account),
        )
        .route("/api/readings", get(list_readings).post(create_reading))
        .route("/api/readings/:id", put(update_reading).delete(delete_reading))
        .route("/api/stats", get(get_stats))
        .route("/api/stats/archive", post(archive_stats))
        .route("/api/export/csv", get(export_csv))
        .route("/api/export/xlsx", get(export_xlsx))
        .route("/api/export/pdf", get(export_pdf))
        .route("/api/chart", get(get_chart))
        .route("/api/share", post(share_report))
        .route("/api/import/csv", post(import_csv))
        .route("/api/backup", get(download_backup).post(restore_backup))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_auth));

    Router::new()
        .merge(public)
        .merge(protected)
        .fallback_service(ServeDir::new(&state.config.static_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let mailer = Mailer::from_config(config.smtp.as_ref())?;
    let state = Arc::new(AppState::new(config, mailer)?);

    archive::spawn_archiver(state.clone());

    let address = state.config.address();
    let listener = TcpListener::bind(&address).await?;
    log::info!("Listening on http://{}", address);
    if state.config.bind == "0.0.0.0" {
        match local_ip_address::local_ip() {
            Ok(ip) => log::info!("Reachable on the local network at http://{}:{}", ip, state.config.port),
            Err(e) => log::warn!("Could not determine local IP address: {}", e),
        }
    }

    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

fn load_user(state: &AppState, username: &str) -> Result<User, AppError> {
    state
        .db
        .user(username)?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))
}

fn download(bytes: Vec<u8>, content_type: &str, filename: &str) -> Result<Response, AppError> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{}\"; filename*=UTF-8''{}",
                filename,
                urlencoding::encode(filename)
            ),
        )
        .body(Body::from(Bytes::from(bytes)))
        .map_err(|e| AppError::Internal(Box::new(e)))
}

fn report_name(user: &User, extension: &str) -> String {
    format!(
        "{}-glucose-{}.{}",
        user.username,
        Utc::now().format("%Y-%m-%d"),
        extension
    )
}

async fn list_readings(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    Query(query): Query<ReadingQuery>,
) -> Result<Json<ReadingsResponse>, AppError> {
    let user = load_user(&state, &username)?;
    let unit = user.profile.unit;
    let readings = query
        .apply(&state.db.readings(&username)?)
        .into_iter()
        .map(|r| ReadingView::new(r, unit))
        .collect();

    Ok(Json(ReadingsResponse { unit, readings }))
}

async fn create_reading(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    Json(new): Json<NewReading>,
) -> Result<impl IntoResponse, AppError> {
    let user = load_user(&state, &username)?;
    let now = Utc::now();
    let reading = Reading::create(new, user.profile.unit, now)?;

    state.db.update_readings(&username, |readings| {
        readings.push(reading.clone());
        Ok::<_, StoreError>(())
    })?;
    let stats = archive::refresh_user(&state.db, &username, now)?;

    Ok((
        StatusCode::CREATED,
        Json(ReadingResponse {
            status: "ok",
            reading: ReadingView::new(reading, user.profile.unit),
            stats: stats.summary(user.profile.unit),
        }),
    ))
}

async fn update_reading(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
    Json(patch): Json<ReadingPatch>,
) -> Result<Json<ReadingResponse>, AppError> {
    let user = load_user(&state, &username)?;
    let now = Utc::now();

    let updated = state.db.update_readings(&username, |readings| {
        let reading = readings
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| AppError::NotFound("Reading not found".to_string()))?;
        reading.apply(patch, user.profile.unit, now)?;
        Ok::<_, AppError>(reading.clone())
    })?;
    let stats = archive::refresh_user(&state.db, &username, now)?;

    Ok(Json(ReadingResponse {
        status: "ok",
        reading: ReadingView::new(updated, user.profile.unit),
        stats: stats.summary(user.profile.unit),
    }))
}

async fn delete_reading(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    state.db.update_readings(&username, |readings| {
        let before = readings.len();
        readings.retain(|r| r.id != id);
        if readings.len() == before {
            return Err(AppError::NotFound("Reading not found".to_string()));
        }
        Ok(())
    })?;
    archive::refresh_user(&state.db, &username, Utc::now())?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn get_stats(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    Query(query): Query<UnitQuery>,
) -> Result<Json<StatsResponse>, AppError> {
    let user = load_user(&state, &username)?;
    let stats = archive::refresh_user(&state.db, &username, Utc::now())?;
    Ok(Json(StatsResponse::new(
        &stats,
        query.unit.unwrap_or(user.profile.unit),
    )))
}

/// Rolls the caller's weekly and monthly stats over if a new period began
async fn archive_stats(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = archive::archive_user(&state.db, &username, Utc::now())?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "weekly": outcome.weekly,
        "monthly": outcome.monthly,
    })))
}

async fn export_csv(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    Query(filter): Query<ReadingQuery>,
    Query(query): Query<UnitQuery>,
) -> Result<Response, AppError> {
    let user = load_user(&state, &username)?;
    let readings = filter.apply(&state.db.readings(&username)?);
    let csv = export::to_csv(&readings, query.unit.unwrap_or(user.profile.unit));
    download(csv.into_bytes(), CSV_TYPE, &report_name(&user, "csv"))
}

async fn export_xlsx(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    Query(filter): Query<ReadingQuery>,
    Query(query): Query<UnitQuery>,
) -> Result<Response, AppError> {
    let user = load_user(&state, &username)?;
    let readings = filter.apply(&state.db.readings(&username)?);
    let stats = archive::refresh_user(&state.db, &username, Utc::now())?;
    let xlsx = export::to_xlsx(&readings, &stats, query.unit.unwrap_or(user.profile.unit))?;
    download(xlsx, XLSX_TYPE, &report_name(&user, "xlsx"))
}

/// Renders the PDF report off the async runtime
///
/// A chart that cannot be drawn (no fonts on the host, say) is left out
/// rather than failing the report.
async fn pdf_report(
    user: &User,
    readings: Vec<Reading>,
    stats: StatsRecord,
    unit: GlucoseUnit,
) -> Result<Vec<u8>, AppError> {
    let owner = user
        .profile
        .display_name
        .clone()
        .unwrap_or_else(|| user.username.clone());
    let options = ChartOptions {
        width: 1000,
        height: 500,
        unit,
        thresholds: user.profile.thresholds(),
        ..Default::default()
    };

    let pdf = tokio::task::spawn_blocking(move || {
        let chart = if readings.is_empty() {
            None
        } else {
            chart::render_image(&readings, &options)
                .map_err(|e| log::warn!("Leaving the chart out of the report for {}: {}", owner, e))
                .ok()
        };
        export::to_pdf(&owner, &readings, &stats, unit, chart.as_ref(), Utc::now())
    })
    .await
    .map_err(|e| AppError::Internal(Box::new(e)))??;
    Ok(pdf)
}

async fn export_pdf(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    Query(filter): Query<ReadingQuery>,
    Query(query): Query<UnitQuery>,
) -> Result<Response, AppError> {
    let user = load_user(&state, &username)?;
    let readings = filter.apply(&state.db.readings(&username)?);
    let stats = archive::refresh_user(&state.db, &username, Utc::now())?;
    let unit = query.unit.unwrap_or(user.profile.unit);
    let pdf = pdf_report(&user, readings, stats, unit).await?;
    download(pdf, PDF_TYPE, &report_name(&user, "pdf"))
}

async fn get_chart(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    Query(query): Query<ChartQuery>,
) -> Result<Response, AppError> {
    let user = load_user(&state, &username)?;
    let days = query.days.unwrap_or(30).clamp(1, 365);
    let filter = ReadingQuery {
        from: Some(Utc::now() - Duration::days(days)),
        ..Default::default()
    };
    let readings = filter.apply(&state.db.readings(&username)?);
    if readings.is_empty() {
        return Err(AppError::NotFound(format!(
            "No readings in the last {} days",
            days
        )));
    }

    let options = ChartOptions {
        title: format!("Blood glucose, last {} days", days),
        width: query.width.unwrap_or(800).clamp(200, 2000),
        height: query.height.unwrap_or(600).clamp(200, 2000),
        kind: query.kind.unwrap_or_default(),
        unit: user.profile.unit,
        thresholds: user.profile.thresholds(),
    };

    let png = tokio::task::spawn_blocking(move || chart::render_chart(&readings, &options))
        .await
        .map_err(|e| AppError::Internal(Box::new(e)))??;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "image/png")
        .body(Body::from(png))
        .map_err(|e| AppError::Internal(Box::new(e)))
}

/// Emails a report to someone else, usually a doctor
async fn share_report(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    Json(req): Json<ShareRequest>,
) -> Result<impl IntoResponse, AppError> {
    auth::validate_email(&req.to)?;
    let user = load_user(&state, &username)?;
    let unit = user.profile.unit;

    let filter = ReadingQuery {
        from: req.from,
        to: req.until,
        ..Default::default()
    };
    let readings = filter.apply(&state.db.readings(&username)?);

    let (content, content_type, filename) = match req.format {
        ReportFormat::Csv => (
            export::to_csv(&readings, unit).into_bytes(),
            "text/csv",
            report_name(&user, "csv"),
        ),
        ReportFormat::Xlsx => {
            let stats = archive::refresh_user(&state.db, &username, Utc::now())?;
            (
                export::to_xlsx(&readings, &stats, unit)?,
                XLSX_TYPE,
                report_name(&user, "xlsx"),
            )
        }
        ReportFormat::Pdf => {
            let stats = archive::refresh_user(&state.db, &username, Utc::now())?;
            (
                pdf_report(&user, readings, stats, unit).await?,
                PDF_TYPE,
                report_name(&user, "pdf"),
            )
        }
    };

    let sender = user
        .profile
        .display_name
        .clone()
        .unwrap_or_else(|| user.username.clone());
    state
        .mailer
        .send_report(
            &req.to,
            &sender,
            req.message.as_deref(),
            &filename,
            content,
            content_type,
        )
        .await?;
    log::info!("{} shared {} with {}", username, filename, req.to);

    Ok(Json(serde_json::json!({
        "status": "ok",
        "message": format!("Report sent to {}", req.to),
    })))
}

/// Imports readings from a CSV request body
///
/// Rows that already exist (same time, value within export rounding) are
/// skipped, so importing an export twice does not duplicate anything.
async fn import_csv(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    body: String,
) -> Result<impl IntoResponse, AppError> {
    let user = load_user(&state, &username)?;
    let now = Utc::now();
    let report = import::from_csv(&body, user.profile.unit, now)?;

    let parsed = report.readings.len();
    let added = state.db.update_readings(&username, |readings| {
        Ok::<_, StoreError>(import::merge_readings(readings, report.readings))
    })?;
    if added > 0 {
        archive::refresh_user(&state.db, &username, now)?;
    }
    log::info!("{} imported {} readings ({} skipped)", username, added, report.skipped.len());

    Ok(Json(serde_json::json!({
        "status": "ok",
        "imported": added,
        "duplicates": parsed - added,
        "skipped": report.skipped,
    })))
}

async fn download_backup(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
) -> Result<Response, AppError> {
    let user = load_user(&state, &username)?;
    let backup = UserBackup::new(
        &username,
        user.profile.clone(),
        state.db.readings(&username)?,
        state.db.stats(&username)?,
    );
    let bytes = saving::to_bytes(&backup).map_err(|e| AppError::Internal(Box::new(e)))?;
    download(bytes, BACKUP_TYPE, &format!("{}.glucolog.gz", username))
}

/// Restores readings and stats from an uploaded backup
///
/// Expects a multipart form with the file in a field named `backup`.
async fn restore_backup(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(username)): Extension<CurrentUser>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut file_data = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        if field.name() == Some("backup") {
            file_data = field
                .bytes()
                .await
                .map_err(|e| AppError::BadRequest(e.to_string()))?
                .to_vec();
        }
    }

    if file_data.is_empty() {
        return Err(AppError::BadRequest("No file data received".to_string()));
    }

    let backup = saving::from_bytes(&file_data)
        .map_err(|e| AppError::BadRequest(format!("Failed to load backup: {}", e)))?;
    if backup.username != username {
        log::info!("{} restored a backup taken from {}", username, backup.username);
    }

    let restored = backup.readings.len();
    state.db.update_readings(&username, |readings| {
        *readings = backup.readings;
        Ok::<_, StoreError>(())
    })?;
    state.db.save_stats(&username, &backup.stats)?;
    let stats = archive::refresh_user(&state.db, &username, Utc::now())?;
    let user = load_user(&state, &username)?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "readings": restored,
        "stats": stats.summary(user.profile.unit),
    })))
}
