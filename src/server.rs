//! HTTP trigger surface for the scheduler and internal tooling.
//!
//! All cron/test routes are protected by a shared secret, provided either as
//! an `Authorization: Bearer` token (hosted cron) or via the configured
//! header (local/dev). End users never hit these endpoints.

use crate::config::Config;
use crate::db;
use crate::diff::sync_and_detect;
use crate::email::{EmailSender, ProductCard};
use crate::fetch::{fetch_snapshot, FetchOptions};
use crate::lock::JobLock;
use crate::model::NewArrival;
use crate::notify::notify_new_arrivals;
use crate::parse::PageParser;
use crate::sms::{build_sms_body, SmsSender};
use actix_web::{get, post, web, HttpRequest, HttpResponse, Responder};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub pool: db::Pool,
    pub config: Config,
    pub http: reqwest::Client,
    pub parser: Arc<dyn PageParser>,
    pub email: Arc<dyn EmailSender>,
    pub sms: Arc<dyn SmsSender>,
    pub fetch_options: FetchOptions,
}

/// Register all routes on a service config. Shared between `main` and tests.
pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(
            web::resource("/api/cron/stock-check")
                .route(web::get().to(stock_check))
                .route(web::post().to(stock_check)),
        )
        .service(notify_job)
        .service(test_email)
        .service(test_sms);
}

fn authorized(req: &HttpRequest, config: &Config) -> bool {
    let secret = config.cron.secret.as_str();

    let bearer_ok = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|token| token == secret)
        .unwrap_or(false);

    let header_ok = req
        .headers()
        .get(config.cron.header_name.as_str())
        .and_then(|v| v.to_str().ok())
        .map(|provided| provided == secret)
        .unwrap_or(false);

    bearer_ok || header_ok
}

fn unauthorized() -> HttpResponse {
    HttpResponse::Unauthorized().json(serde_json::json!({ "error": "Unauthorized" }))
}

fn internal_error(context: &str, err: anyhow::Error) -> HttpResponse {
    error!(error = ?err, "{context}");
    HttpResponse::InternalServerError().json(serde_json::json!({
        "error": context,
        "details": err.to_string(),
    }))
}

#[get("/health")]
async fn health() -> impl Responder {
    web::Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct StockCheckQuery {
    #[serde(rename = "dryRun")]
    dry_run: Option<String>,
}

/// Scheduler entrypoint: fetch the page, diff against stored state, then
/// notify. Expected cadence is about once per minute; overlapping runs are
/// rejected with 409 via the advisory lock.
async fn stock_check(
    req: HttpRequest,
    query: web::Query<StockCheckQuery>,
    state: web::Data<AppState>,
) -> actix_web::Result<impl Responder> {
    if !authorized(&req, &state.config) {
        return Ok(unauthorized());
    }
    let dry_run = query.dry_run.as_deref() == Some("1");

    let lock = JobLock::new(
        state.pool.clone(),
        state.config.cron.lock_key.clone(),
        Duration::from_secs(state.config.cron.lock_ttl_seconds),
    );
    match lock.try_acquire().await {
        Ok(true) => {}
        Ok(false) => {
            warn!("lock not acquired; previous run may still be executing");
            return Ok(HttpResponse::Conflict().json(serde_json::json!({
                "skipped": true,
                "reason": "lock-not-acquired",
            })));
        }
        Err(err) => return Ok(internal_error("failed to acquire job lock", err)),
    }

    // Fetch + diff run under the lock; notification does not need it because
    // `notified_at` independently guarantees at-most-once delivery.
    let detect = async {
        let snapshot = fetch_snapshot(
            &state.pool,
            &state.http,
            &state.config.watch,
            state.parser.as_ref(),
            &state.fetch_options,
        )
        .await?;
        if snapshot.not_modified {
            return anyhow::Ok(None);
        }
        let arrivals = sync_and_detect(
            &state.pool,
            &snapshot,
            state.config.watch.max_tracked_products,
        )
        .await?;
        anyhow::Ok(Some((snapshot, arrivals)))
    };
    let outcome = detect.await;

    if let Err(err) = lock.release().await {
        error!(error = ?err, "failed to release job lock");
    }

    let (snapshot, arrivals) = match outcome {
        Ok(Some(pair)) => pair,
        Ok(None) => {
            info!("page not modified; nothing to do");
            return Ok(HttpResponse::Ok().json(serde_json::json!({
                "notModified": true,
                "productsFound": 0,
                "newArrivalsDetected": 0,
                "productsNotified": 0,
            })));
        }
        Err(err) => return Ok(internal_error("stock check failed", err)),
    };

    if dry_run {
        info!(
            products = snapshot.products.len(),
            arrivals = arrivals.len(),
            "dry run; skipping notifications"
        );
        return Ok(HttpResponse::Ok().json(serde_json::json!({
            "dryRun": true,
            "productsFound": snapshot.products.len(),
            "products": snapshot.products,
            "newArrivalsDetected": arrivals.len(),
            "newArrivals": arrivals,
            "productsNotified": 0,
        })));
    }

    if arrivals.is_empty() {
        return Ok(HttpResponse::Ok().json(serde_json::json!({
            "productsFound": snapshot.products.len(),
            "newArrivalsDetected": 0,
            "productsNotified": 0,
        })));
    }

    let notified = match notify_new_arrivals(
        &state.pool,
        state.email.as_ref(),
        state.sms.as_ref(),
        &state.config.sms.required_plan,
        &arrivals,
    )
    .await
    {
        Ok(ids) => ids,
        Err(err) => return Ok(internal_error("notification fan-out failed", err)),
    };

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "productsFound": snapshot.products.len(),
        "newArrivalsDetected": arrivals.len(),
        "productsNotified": notified.len(),
    })))
}

#[derive(Debug, Deserialize)]
struct NotifyRequest {
    #[serde(rename = "productIds", default)]
    product_ids: Vec<i64>,
}

/// Internal trigger that runs the fan-out for already-detected products.
/// Idempotent: products already marked notified are skipped by the gate.
#[post("/api/cron/notify")]
async fn notify_job(
    req: HttpRequest,
    payload: web::Json<NotifyRequest>,
    state: web::Data<AppState>,
) -> actix_web::Result<impl Responder> {
    if !authorized(&req, &state.config) {
        return Ok(unauthorized());
    }
    let product_ids = payload.into_inner().product_ids;
    if product_ids.is_empty() {
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({
            "error": "Invalid request: productIds required",
        })));
    }

    let products = match db::products_by_ids(&state.pool, &product_ids).await {
        Ok(rows) => rows,
        Err(err) => return Ok(internal_error("failed to load products", err)),
    };
    if products.is_empty() {
        return Ok(HttpResponse::Ok().json(serde_json::json!({
            "productsFound": 0,
            "notified": 0,
        })));
    }

    let arrivals: Vec<NewArrival> = products
        .iter()
        .map(|p| NewArrival {
            product_id: p.id,
            external_id: p.external_id.clone(),
            name: p.name.clone(),
            url: p.url.clone(),
            image_url: p.image_url.clone(),
            detected_at: p.created_at,
        })
        .collect();

    let notified = match notify_new_arrivals(
        &state.pool,
        state.email.as_ref(),
        state.sms.as_ref(),
        &state.config.sms.required_plan,
        &arrivals,
    )
    .await
    {
        Ok(ids) => ids,
        Err(err) => return Ok(internal_error("notification fan-out failed", err)),
    };

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "productsFound": products.len(),
        "notified": notified.len(),
        "notifiedProductIds": notified,
    })))
}

#[derive(Debug, Deserialize)]
struct TestEmailQuery {
    to: Option<String>,
}

/// One-off email send for verifying provider configuration.
#[get("/api/test/email")]
async fn test_email(
    req: HttpRequest,
    query: web::Query<TestEmailQuery>,
    state: web::Data<AppState>,
) -> actix_web::Result<impl Responder> {
    if !authorized(&req, &state.config) {
        return Ok(unauthorized());
    }
    let Some(to) = query.into_inner().to.filter(|t| !t.trim().is_empty()) else {
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({
            "error": "Recipient is required. Use ?to=user@example.com",
        })));
    };

    let sample = ProductCard {
        name: "Test product".into(),
        url: state.config.watch.page_url.clone(),
        image_url: None,
    };
    match state.email.send(&to, &[sample]).await {
        Ok(()) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "message": format!("Test email sent to {to}"),
        }))),
        Err(err) => Ok(internal_error("failed to send test email", err)),
    }
}

#[derive(Debug, Deserialize)]
struct TestSmsQuery {
    phone: Option<String>,
}

/// One-off SMS send for verifying provider configuration.
#[get("/api/test/sms")]
async fn test_sms(
    req: HttpRequest,
    query: web::Query<TestSmsQuery>,
    state: web::Data<AppState>,
) -> actix_web::Result<impl Responder> {
    if !authorized(&req, &state.config) {
        return Ok(unauthorized());
    }
    let Some(phone) = query.into_inner().phone.filter(|p| !p.trim().is_empty()) else {
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({
            "error": "Phone number is required. Use ?phone=+447911123456 (E.164 format)",
        })));
    };

    let body = build_sms_body(&[ProductCard {
        name: "Test product".into(),
        url: state.config.watch.page_url.clone(),
        image_url: None,
    }]);
    match state.sms.send(&phone, &body).await {
        Ok(()) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "message": format!("Test SMS sent to {phone}"),
        }))),
        Err(err) => Ok(internal_error("failed to send test SMS", err)),
    }
}
