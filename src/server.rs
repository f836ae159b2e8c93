//! HTTP operator API.
//!
//! Thin actix-web layer over [`DrawEngine`] and the registration helpers.
//! Errors come back as `{ "error": "..." }` with a status that tells the
//! console whether to retry, confirm, or give up.

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, ResponseError};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::engine::{DrawEngine, DrawError};
use crate::metrics::DrawMetrics;
use crate::registration::{self, roster, RegistrationError, RosterOrder};
use crate::registry::{Registry, RegistryError};
use crate::spin::SpinSettings;
use crate::sync::Replica;
use crate::tiers::{Slot, Tier, TierCounts};

/// Shared application state accessible from HTTP handlers.
pub struct AppState {
    pub engine: Arc<Mutex<DrawEngine>>,
    pub registry: Arc<dyn Registry>,
    pub replica: watch::Receiver<Replica>,
    pub metrics: Arc<DrawMetrics>,
}

fn error_body(error: &dyn std::fmt::Display, status: StatusCode) -> HttpResponse {
    HttpResponse::build(status).json(json!({ "error": error.to_string() }))
}

impl ResponseError for RegistryError {
    fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        error_body(self, self.status_code())
    }
}

impl ResponseError for DrawError {
    fn status_code(&self) -> StatusCode {
        match self {
            DrawError::AlreadySpinning | DrawError::SlotInFlight(_) | DrawError::Contended(_) => {
                StatusCode::CONFLICT
            }
            DrawError::NotConfirmed => StatusCode::PRECONDITION_FAILED,
            DrawError::EmptyPool
            | DrawError::NoOpenSlot
            | DrawError::SlotEmpty(_)
            | DrawError::IndexOutOfRange(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DrawError::Registry(e) => e.status_code(),
        }
    }

    fn error_response(&self) -> HttpResponse {
        error_body(self, self.status_code())
    }
}

impl ResponseError for RegistrationError {
    fn status_code(&self) -> StatusCode {
        match self {
            RegistrationError::Missing(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RegistrationError::NumberTaken(_)
            | RegistrationError::EmailTaken(_)
            | RegistrationError::Contended(_) => StatusCode::CONFLICT,
            RegistrationError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistrationError::Locked => StatusCode::LOCKED,
            RegistrationError::Registry(e) => e.status_code(),
        }
    }

    fn error_response(&self) -> HttpResponse {
        error_body(self, self.status_code())
    }
}

/// Mount every route on `cfg`.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/status", web::get().to(status))
        .route("/board", web::get().to(board))
        .route("/wheel", web::get().to(wheel))
        .route("/wheel/shuffle", web::post().to(shuffle_wheel))
        .route("/spin", web::post().to(spin))
        .route("/undo", web::post().to(undo))
        .route("/reset", web::post().to(reset))
        .route("/settings/tiers", web::put().to(configure_tiers))
        .route("/settings/spin", web::put().to(configure_spin))
        .route("/participants", web::get().to(participants))
        .route("/registrations", web::post().to(register))
        .route("/registrations/{number}", web::delete().to(delete_registration))
        .route("/lock", web::put().to(set_lock));
}

/// Liveness probe: 200 while the process is running.
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({"status": "ok"}))
}

async fn status(data: web::Data<AppState>) -> HttpResponse {
    let engine = data.engine.lock().await;
    let replica = data.replica.borrow().clone();
    HttpResponse::Ok().json(json!({
        "status": "running",
        "spinning": engine.is_spinning(),
        "preview": engine.preview(),
        "pool_size": replica.pool().len(),
        "registrants": replica.registrants.len(),
        "locked": replica.locked,
        "metrics": data.metrics.to_json(),
    }))
}

async fn board(data: web::Data<AppState>) -> HttpResponse {
    let preview = data.engine.lock().await.preview();
    let replica = data.replica.borrow().clone();
    HttpResponse::Ok().json(json!({
        "counts": replica.counts,
        "winners": replica.board,
        "preview": preview,
    }))
}

async fn wheel(data: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(data.engine.lock().await.view())
}

async fn shuffle_wheel(data: web::Data<AppState>) -> HttpResponse {
    let order = data.engine.lock().await.shuffle_wheel();
    HttpResponse::Ok().json(json!({ "wheel": order }))
}

async fn spin(data: web::Data<AppState>) -> Result<HttpResponse, DrawError> {
    let target = data.engine.lock().await.spin(Instant::now()).await?;
    Ok(HttpResponse::Accepted().json(target))
}

#[derive(Debug, Deserialize)]
struct UndoRequest {
    tier: Tier,
    index: usize,
    #[serde(default)]
    confirm: bool,
}

async fn undo(
    data: web::Data<AppState>,
    body: web::Json<UndoRequest>,
) -> Result<HttpResponse, DrawError> {
    let slot = Slot::new(body.tier, body.index);
    let number = data.engine.lock().await.undo(slot, body.confirm).await?;
    Ok(HttpResponse::Ok().json(json!({ "slot": slot, "number": number })))
}

#[derive(Debug, Deserialize)]
struct Confirmation {
    #[serde(default)]
    confirm: bool,
}

async fn reset(
    data: web::Data<AppState>,
    body: web::Json<Confirmation>,
) -> Result<HttpResponse, DrawError> {
    data.engine.lock().await.reset_all(body.confirm).await?;
    Ok(HttpResponse::NoContent().finish())
}

async fn configure_tiers(
    data: web::Data<AppState>,
    body: web::Json<TierCounts>,
) -> Result<HttpResponse, DrawError> {
    data.engine
        .lock()
        .await
        .configure_tiers(body.into_inner())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

async fn configure_spin(
    data: web::Data<AppState>,
    body: web::Json<SpinSettings>,
) -> Result<HttpResponse, DrawError> {
    data.engine
        .lock()
        .await
        .configure_spin(body.into_inner())
        .await?;
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Deserialize)]
struct RosterQuery {
    #[serde(default)]
    sort: RosterOrder,
}

async fn participants(
    data: web::Data<AppState>,
    query: web::Query<RosterQuery>,
) -> HttpResponse {
    let replica = data.replica.borrow().clone();
    let list = roster(&replica.invited, &replica.registrants, query.sort);
    let registered = list.iter().filter(|p| p.is_registered()).count();
    HttpResponse::Ok().json(json!({
        "participants": list,
        "registered": registered,
        "locked": replica.locked,
    }))
}

#[derive(Debug, Deserialize)]
struct RegistrationRequest {
    email: String,
    number: String,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

async fn register(
    data: web::Data<AppState>,
    body: web::Json<RegistrationRequest>,
) -> Result<HttpResponse, RegistrationError> {
    let registrant =
        registration::register(data.registry.as_ref(), &body.email, &body.number, now_ms())
            .await
            .inspect_err(|e| warn!(error = %e, "Registration refused"))?;
    Ok(HttpResponse::Created().json(registrant))
}

async fn delete_registration(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, RegistrationError> {
    registration::delete(data.registry.as_ref(), &path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Deserialize)]
struct LockRequest {
    locked: bool,
}

async fn set_lock(
    data: web::Data<AppState>,
    body: web::Json<LockRequest>,
) -> Result<HttpResponse, RegistryError> {
    registration::set_locked(data.registry.as_ref(), body.locked).await?;
    info!(locked = body.locked, "Lock toggled from the console");
    Ok(HttpResponse::Ok().json(json!({ "locked": body.locked })))
}
