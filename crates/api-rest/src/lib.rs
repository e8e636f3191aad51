//! # API REST
//!
//! REST API for the surgical waitlist.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - OpenAPI/Swagger documentation
//! - Mapping of [`WaitlistError`] onto HTTP status codes
//!
//! All queue logic lives in `waitlist-core`; handlers only translate between JSON and the
//! [`WaitlistService`] API. Every mutation body carries the actor and the reason that end up
//! in the audit trail.

#![warn(rust_2018_idioms)]

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use utoipa::{IntoParams, OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use waitlist_core::{
    Actor, AuditContext, AuditRecord, EntryChanges, EntryFilter, EntryId, ExitReason,
    ExternalEntryRequest, Position, PriorityTier, QueueIndicators, QueueRow, WaitlistEntry,
    WaitlistError, WaitlistResult, WaitlistService,
};

/// Error half of every handler result: status plus a human-readable message.
pub type ApiError = (StatusCode, String);

/// Application state shared across REST API handlers.
#[derive(Clone)]
pub struct AppState {
    service: Arc<WaitlistService>,
}

impl AppState {
    pub fn new(service: Arc<WaitlistService>) -> Self {
        Self { service }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        list_queue,
        get_entry,
        create_entry,
        update_entry,
        deactivate_entry,
        entry_history,
        patient_positions,
        indicators,
    ),
    components(schemas(
        HealthRes,
        EntryRes,
        CreateEntryReq,
        UpdateEntryReq,
        DeactivateEntryReq,
        QueueRes,
        HistoryRes,
        PatientPositionsRes,
        IndicatorsRes,
    ))
)]
pub struct ApiDoc;

/// Builds the REST router with Swagger UI and permissive CORS.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/queue", get(list_queue))
        .route("/entries", post(create_entry))
        .route("/entries/:id", get(get_entry).patch(update_entry))
        .route("/entries/:id/deactivate", post(deactivate_entry))
        .route("/entries/:id/history", get(entry_history))
        .route("/patients/:patient_ref/positions", get(patient_positions))
        .route("/indicators", get(indicators))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// HTTP status for a core error.
pub fn status_for(err: &WaitlistError) -> StatusCode {
    match err {
        WaitlistError::Validation(_) => StatusCode::BAD_REQUEST,
        WaitlistError::NotFound(_) | WaitlistError::PatientNotFound(_) => StatusCode::NOT_FOUND,
        WaitlistError::AlreadyInactive(_) | WaitlistError::ConcurrencyConflict { .. } => {
            StatusCode::CONFLICT
        }
        WaitlistError::Lookup { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(err: WaitlistError) -> ApiError {
    let status = status_for(&err);
    match status {
        // Storage details stay in the log.
        StatusCode::INTERNAL_SERVER_ERROR => {
            tracing::error!(error = %err, "waitlist request failed");
            (status, "Internal error".into())
        }
        _ => {
            tracing::warn!(error = %err, "waitlist request rejected");
            (status, err.to_string())
        }
    }
}

// ============================================================================
// DTOs
// ============================================================================

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthRes {
    pub ok: bool,
    pub message: String,
}

/// An entry with its current queue position (`null` once inactive).
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EntryRes {
    #[schema(value_type = Object)]
    pub entry: WaitlistEntry,
    #[schema(value_type = Option<u64>)]
    pub position: Option<Position>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateEntryReq {
    pub actor_name: String,
    pub actor_role: String,
    pub reason: String,
    /// External keys plus the entry's priority and workflow fields.
    #[schema(value_type = Object)]
    pub entry: ExternalEntryRequest,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UpdateEntryReq {
    pub actor_name: String,
    pub actor_role: String,
    pub reason: String,
    #[schema(value_type = Object)]
    pub changes: EntryChanges,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeactivateEntryReq {
    pub actor_name: String,
    pub actor_role: String,
    /// Recorded in the audit trail and as the entry's exit note.
    pub reason: String,
    /// One of `surgery_performed`, `deceased`, `surgery_elsewhere`, `self_excluded`.
    #[schema(value_type = String)]
    pub exit_reason: ExitReason,
}

fn audit_context(actor_name: &str, actor_role: &str, reason: &str) -> WaitlistResult<AuditContext> {
    AuditContext::new(Actor::new(actor_name, actor_role)?, reason)
}

/// Query string of `GET /queue`. List parameters are comma-separated.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct QueueQuery {
    pub specialty: Option<String>,
    pub procedure: Option<String>,
    pub physician: Option<String>,
    /// `ONCOLOGICAL`, `FLAGGED` or `NONE`.
    pub priority_tier: Option<String>,
    pub active: Option<bool>,
    pub judicial: Option<bool>,
    #[param(value_type = Option<String>)]
    pub entered_from: Option<NaiveDate>,
    #[param(value_type = Option<String>)]
    pub entered_to: Option<NaiveDate>,
    /// Case-insensitive substring of the patient ref.
    pub patient: Option<String>,
}

impl QueueQuery {
    fn into_filter(self) -> WaitlistResult<EntryFilter> {
        fn split(value: Option<String>) -> Vec<String> {
            value
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default()
        }

        Ok(EntryFilter {
            specialties: split(self.specialty),
            procedures: split(self.procedure),
            physicians: split(self.physician),
            priority_tier: self
                .priority_tier
                .map(|t| t.parse::<PriorityTier>())
                .transpose()?,
            active: self.active,
            has_judicial_order: self.judicial,
            entered_from: self.entered_from,
            entered_to: self.entered_to,
            patient_ref_contains: self.patient,
        })
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct QueueRes {
    #[schema(value_type = Vec<Object>)]
    pub rows: Vec<QueueRow>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HistoryRes {
    pub entry_id: u64,
    /// Newest first.
    #[schema(value_type = Vec<Object>)]
    pub records: Vec<AuditRecord>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PatientPositionsRes {
    pub patient_ref: String,
    #[schema(value_type = Vec<Object>)]
    pub active: Vec<QueueRow>,
    #[schema(value_type = Vec<Object>)]
    pub inactive: Vec<QueueRow>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct IndicatorsRes {
    #[schema(value_type = Object)]
    pub indicators: QueueIndicators,
}

// ============================================================================
// Handlers
// ============================================================================

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint for the REST API
#[axum::debug_handler]
async fn health(State(_state): State<AppState>) -> Json<HealthRes> {
    Json(HealthRes {
        ok: true,
        message: "Waitlist REST API is alive".into(),
    })
}

#[utoipa::path(
    get,
    path = "/queue",
    params(QueueQuery),
    responses(
        (status = 200, description = "Matching entries, active first in queue order", body = QueueRes),
        (status = 400, description = "Invalid filter")
    )
)]
/// List the queue
///
/// Filters narrow the listing only; every row keeps its position in the whole queue.
async fn list_queue(
    State(state): State<AppState>,
    Query(query): Query<QueueQuery>,
) -> Result<Json<QueueRes>, ApiError> {
    let filter = query.into_filter().map_err(api_error)?;
    let rows = state.service.list(&filter).map_err(api_error)?;
    Ok(Json(QueueRes { rows }))
}

#[utoipa::path(
    get,
    path = "/entries/{id}",
    params(("id" = u64, Path, description = "Waitlist entry id")),
    responses(
        (status = 200, description = "Entry with its position", body = EntryRes),
        (status = 404, description = "Entry not found")
    )
)]
/// Read one entry and its current position
async fn get_entry(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<EntryRes>, ApiError> {
    let (entry, position) = state
        .service
        .entry_with_position(EntryId(id))
        .map_err(api_error)?;
    Ok(Json(EntryRes { entry, position }))
}

#[utoipa::path(
    post,
    path = "/entries",
    request_body = CreateEntryReq,
    responses(
        (status = 201, description = "Entry created", body = EntryRes),
        (status = 400, description = "Bad request"),
        (status = 502, description = "External directory lookup failed"),
        (status = 500, description = "Internal server error")
    )
)]
/// Register a patient on the waitlist
///
/// External keys are resolved to internal references before anything is written.
#[axum::debug_handler]
async fn create_entry(
    State(state): State<AppState>,
    Json(req): Json<CreateEntryReq>,
) -> Result<(StatusCode, Json<EntryRes>), ApiError> {
    let ctx = audit_context(&req.actor_name, &req.actor_role, &req.reason).map_err(api_error)?;
    let (entry, position) = state
        .service
        .register_with_position(req.entry, &ctx)
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(EntryRes { entry, position })))
}

#[utoipa::path(
    patch,
    path = "/entries/{id}",
    params(("id" = u64, Path, description = "Waitlist entry id")),
    request_body = UpdateEntryReq,
    responses(
        (status = 200, description = "Entry updated", body = EntryRes),
        (status = 400, description = "Bad request"),
        (status = 404, description = "Entry not found"),
        (status = 409, description = "Version conflict")
    )
)]
/// Update priority, judicial and workflow fields of an entry
async fn update_entry(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<UpdateEntryReq>,
) -> Result<Json<EntryRes>, ApiError> {
    let ctx = audit_context(&req.actor_name, &req.actor_role, &req.reason).map_err(api_error)?;
    let (entry, position) = state
        .service
        .update_with_position(EntryId(id), &req.changes, &ctx)
        .map_err(api_error)?;
    Ok(Json(EntryRes { entry, position }))
}

#[utoipa::path(
    post,
    path = "/entries/{id}/deactivate",
    params(("id" = u64, Path, description = "Waitlist entry id")),
    request_body = DeactivateEntryReq,
    responses(
        (status = 200, description = "Entry removed from the queue", body = EntryRes),
        (status = 404, description = "Entry not found"),
        (status = 409, description = "Entry already inactive")
    )
)]
/// Remove an entry from the queue
async fn deactivate_entry(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(req): Json<DeactivateEntryReq>,
) -> Result<Json<EntryRes>, ApiError> {
    let ctx = audit_context(&req.actor_name, &req.actor_role, &req.reason).map_err(api_error)?;
    let entry = state
        .service
        .deactivate(EntryId(id), req.exit_reason, &ctx)
        .map_err(api_error)?;
    Ok(Json(EntryRes { entry, position: None }))
}

#[utoipa::path(
    get,
    path = "/entries/{id}/history",
    params(("id" = u64, Path, description = "Waitlist entry id")),
    responses(
        (status = 200, description = "Audit records, newest first", body = HistoryRes),
        (status = 404, description = "Entry not found")
    )
)]
/// Audit history of one entry
async fn entry_history(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<HistoryRes>, ApiError> {
    let records = state.service.history(EntryId(id)).map_err(api_error)?;
    Ok(Json(HistoryRes { entry_id: id, records }))
}

#[utoipa::path(
    get,
    path = "/patients/{patient_ref}/positions",
    params(("patient_ref" = String, Path, description = "Internal patient reference")),
    responses(
        (status = 200, description = "Every entry of the patient with its position", body = PatientPositionsRes),
        (status = 404, description = "Patient has no entries")
    )
)]
/// Where a patient stands in the queue
async fn patient_positions(
    State(state): State<AppState>,
    Path(patient_ref): Path<String>,
) -> Result<Json<PatientPositionsRes>, ApiError> {
    let report = state.service.patient_report(&patient_ref).map_err(api_error)?;
    Ok(Json(PatientPositionsRes {
        patient_ref: report.patient_ref,
        active: report.active,
        inactive: report.inactive,
    }))
}

#[utoipa::path(
    get,
    path = "/indicators",
    responses(
        (status = 200, description = "Aggregate queue indicators", body = IndicatorsRes)
    )
)]
/// Aggregate indicators for dashboards
async fn indicators(State(state): State<AppState>) -> Result<Json<IndicatorsRes>, ApiError> {
    let indicators = state.service.indicators().map_err(api_error)?;
    Ok(Json(IndicatorsRes { indicators }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use waitlist_core::{InMemoryAuditTrail, PassthroughResolver, WaitlistStore};

    fn app() -> Router {
        let store = WaitlistStore::in_memory(Arc::new(InMemoryAuditTrail::new()));
        let service = WaitlistService::new(Arc::new(store), Arc::new(PassthroughResolver));
        router(AppState::new(Arc::new(service)))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn create_body(patient: &str, extra: Value) -> Value {
        let mut entry = json!({
            "patient_key": patient,
            "procedure_key": "0408050500",
            "specialty_key": "ORT",
        });
        if let (Some(target), Some(extra)) = (entry.as_object_mut(), extra.as_object()) {
            target.extend(extra.clone());
        }
        json!({
            "actor_name": "Ana Souza",
            "actor_role": "Caseworker",
            "reason": "referral received",
            "entry": entry,
        })
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = send(&app(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn test_create_rank_and_positions() {
        let app = app();
        let (status, first) = send(&app, "POST", "/entries", Some(create_body("1001", json!({})))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(first["position"], 1);
        assert_eq!(first["entry"]["patient_ref"], "patient:1001");

        let (_, judicial) = send(
            &app,
            "POST",
            "/entries",
            Some(create_body("1002", json!({ "has_judicial_order": true }))),
        )
        .await;
        assert_eq!(judicial["position"], 1);

        let (status, queue) = send(&app, "GET", "/queue", None).await;
        assert_eq!(status, StatusCode::OK);
        let rows = queue["rows"].as_array().unwrap();
        assert_eq!(rows[0]["entry"]["id"], judicial["entry"]["id"]);
        assert_eq!(rows[1]["position"], 2);

        let (status, entry) = send(&app, "GET", "/entries/1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(entry["position"], 2);

        let (status, report) = send(&app, "GET", "/patients/patient:1001/positions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["active"][0]["position"], 2);
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let app = app();
        let (status, _) = send(&app, "GET", "/entries/99", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, "GET", "/patients/patient:none/positions", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let no_justification = create_body("1001", json!({ "priority_tier": "ONCOLOGICAL" }));
        let (status, _) = send(&app, "POST", "/entries", Some(no_justification)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "GET", "/queue?priority_tier=urgent", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_update_conflict_and_deactivation() {
        let app = app();
        send(&app, "POST", "/entries", Some(create_body("1001", json!({})))).await;

        let stale = json!({
            "actor_name": "Ana Souza",
            "actor_role": "Caseworker",
            "reason": "oncology confirmed",
            "changes": {
                "priority_tier": "ONCOLOGICAL",
                "priority_justification": "biopsy result",
                "expected_version": 7
            }
        });
        let (status, _) = send(&app, "PATCH", "/entries/1", Some(stale)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let fresh = json!({
            "actor_name": "Ana Souza",
            "actor_role": "Caseworker",
            "reason": "oncology confirmed",
            "changes": {
                "priority_tier": "ONCOLOGICAL",
                "priority_justification": "biopsy result",
                "expected_version": 1
            }
        });
        let (status, updated) = send(&app, "PATCH", "/entries/1", Some(fresh)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["entry"]["version"], 2);

        let remove = json!({
            "actor_name": "Dr. Pedro Alves",
            "actor_role": "Surgeon",
            "reason": "operated on 2025-03-01",
            "exit_reason": "surgery_performed"
        });
        let (status, removed) = send(&app, "POST", "/entries/1/deactivate", Some(remove.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(removed["entry"]["active"], false);
        assert!(removed["position"].is_null());

        let (status, _) = send(&app, "POST", "/entries/1/deactivate", Some(remove)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, history) = send(&app, "GET", "/entries/1/history", None).await;
        assert_eq!(status, StatusCode::OK);
        let records = history["records"].as_array().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["action"], "deactivated");
    }

    #[tokio::test]
    async fn test_update_returns_position_after_change() {
        let app = app();
        send(&app, "POST", "/entries", Some(create_body("1001", json!({})))).await;
        let (_, second) = send(&app, "POST", "/entries", Some(create_body("1002", json!({})))).await;
        assert_eq!(second["position"], 2);

        let court_order = json!({
            "actor_name": "Ana Souza",
            "actor_role": "Caseworker",
            "reason": "court order received",
            "changes": { "has_judicial_order": true, "judicial_case_number": "0001234-56.2025" }
        });
        let (status, updated) = send(&app, "PATCH", "/entries/2", Some(court_order)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["entry"]["version"], 2);
        assert_eq!(updated["entry"]["has_judicial_order"], true);
        assert_eq!(updated["position"], 1);
    }

    #[tokio::test]
    async fn test_indicators() {
        let app = app();
        send(&app, "POST", "/entries", Some(create_body("1001", json!({})))).await;
        let (status, body) = send(&app, "GET", "/indicators", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["indicators"]["patients_in_queue"], 1);
    }

    #[test]
    fn test_status_for_lookup_is_bad_gateway() {
        let err = WaitlistError::Lookup {
            kind: waitlist_core::RefKind::Patient,
            key: "1".into(),
            reason: "timeout".into(),
        };
        assert_eq!(status_for(&err), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(&WaitlistError::LockPoisoned), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
