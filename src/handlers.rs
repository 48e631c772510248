// =============================================================================
// HANDLERS MODULE
// =============================================================================
// HTTP request handlers. Each one extracts its input, calls one service
// operation and serializes the result; all domain rules live in the services.
//
// The acting user is taken from the `x-actor` header and recorded in the
// activity log and audit records.
// =============================================================================

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::app::AppState;
use crate::cache::{department_key, OCCUPANCY_ALL_KEY};
use crate::error::AppResult;
use crate::models::*;
use crate::resources::{AllocationReceipt, TransferReceipt};

// -----------------------------------------------------------------------------
// ACTOR
// -----------------------------------------------------------------------------
pub const ACTOR_HEADER: &str = "x-actor";

/// Who is making the request; "system" when the header is absent
pub struct Actor(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let actor = parts
            .headers
            .get(ACTOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or("system");
        Ok(Actor(actor.to_string()))
    }
}

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /ready
///
/// 503 when the store, or Redis if configured, is unreachable.
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let store_healthy = state.store.health_check().await;
    let redis_healthy = state.cache.ping().await;

    let ready = store_healthy && redis_healthy != Some(false);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "not_ready" }.to_string(),
            checks: ReadinessChecks {
                store: store_healthy,
                redis: redis_healthy,
            },
        }),
    )
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// DEPARTMENTS & BEDS
// =============================================================================

/// GET /api/v1/departments
///
/// Every department with live bed counts. Served from Redis when cached.
pub async fn list_departments(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<DepartmentOccupancy>>> {
    if let Some(cached) = state.cache.get(OCCUPANCY_ALL_KEY).await {
        return Ok(Json(cached));
    }
    let summaries = state.beds.list_occupancy().await?;
    state.cache.put(OCCUPANCY_ALL_KEY, &summaries).await;
    Ok(Json(summaries))
}

/// POST /api/v1/departments
///
/// ```json
/// { "name": "ICU", "code": "ICU", "beds": 4 }
/// ```
pub async fn create_department(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(request): Json<CreateDepartmentRequest>,
) -> AppResult<(StatusCode, Json<Department>)> {
    let department = state.beds.create_department(request, &actor).await?;
    Ok((StatusCode::CREATED, Json(department)))
}

/// GET /api/v1/departments/:id
pub async fn get_department(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<DepartmentOccupancy>> {
    let key = department_key(id);
    if let Some(cached) = state.cache.get(&key).await {
        return Ok(Json(cached));
    }
    let occupancy = state.beds.occupancy(id).await?;
    state.cache.put(&key, &occupancy).await;
    Ok(Json(occupancy))
}

/// GET /api/v1/departments/:id/beds
pub async fn list_beds(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<Bed>>> {
    Ok(Json(state.beds.list_beds(id).await?))
}

/// POST /api/v1/departments/:id/beds
pub async fn add_beds(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Actor(actor): Actor,
    Json(request): Json<AddBedsRequest>,
) -> AppResult<(StatusCode, Json<Vec<Bed>>)> {
    let beds = state.beds.add_beds(id, request.count, &actor).await?;
    Ok((StatusCode::CREATED, Json(beds)))
}

/// GET /api/v1/departments/:id/alternatives
pub async fn find_alternatives(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<DepartmentAlternative>>> {
    Ok(Json(state.beds.find_alternatives(id).await?))
}

/// GET /api/v1/departments/:id/shift-candidates
pub async fn find_shift_candidates(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<BedShiftCandidate>>> {
    Ok(Json(state.beds.find_shift_candidates(id).await?))
}

/// POST /api/v1/beds/:id/release
///
/// Frees the bed and takes it off the occupant's record in one step. The
/// occupant stays admitted and can be placed again.
pub async fn release_bed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Actor(actor): Actor,
) -> AppResult<Json<Bed>> {
    Ok(Json(state.admissions.release_bed(id, &actor).await?))
}

// =============================================================================
// PATIENTS
// =============================================================================

/// POST /api/v1/patients
///
/// 201 when a bed was assigned, 202 when the patient was registered but the
/// department had no bed (see `placement.suggestions`).
pub async fn admit_patient(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(request): Json<AdmitPatientRequest>,
) -> AppResult<(StatusCode, Json<AdmissionOutcome>)> {
    let outcome = state.admissions.admit(request, &actor).await?;
    let status = match outcome.placement {
        Placement::Assigned(_) => StatusCode::CREATED,
        Placement::Unplaced { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

/// GET /api/v1/patients/:id
pub async fn get_patient(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Patient>> {
    Ok(Json(state.admissions.get_patient(&id).await?))
}

/// POST /api/v1/patients/:id/alternative
pub async fn admit_to_alternative(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Actor(actor): Actor,
    Json(request): Json<AlternativeAdmissionRequest>,
) -> AppResult<Json<AdmissionOutcome>> {
    let outcome = state
        .admissions
        .admit_to_alternative(&id, request.department_id, &actor)
        .await?;
    Ok(Json(outcome))
}

/// POST /api/v1/patients/:id/bed-shift
pub async fn admit_with_bed_shift(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Actor(actor): Actor,
    Json(request): Json<BedShiftAdmissionRequest>,
) -> AppResult<Json<AdmissionOutcome>> {
    let outcome = state
        .admissions
        .admit_with_bed_shift(&id, request.bed_id, &actor)
        .await?;
    Ok(Json(outcome))
}

/// POST /api/v1/patients/:id/transfer
pub async fn transfer_patient(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Actor(actor): Actor,
    Json(request): Json<TransferPatientRequest>,
) -> AppResult<Json<TransferOutcome>> {
    let outcome = state
        .admissions
        .transfer_department(&id, request.department_id, &actor)
        .await?;
    Ok(Json(outcome))
}

/// POST /api/v1/patients/:id/discharge
pub async fn discharge_patient(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Actor(actor): Actor,
    request: Option<Json<DischargeRequest>>,
) -> AppResult<Json<DischargeOutcome>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let outcome = state.admissions.discharge(&id, request, &actor).await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct AllocationParams {
    pub status: Option<AllocationStatus>,
}

/// GET /api/v1/patients/:id/allocations?status=allocated
pub async fn list_allocations(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<AllocationParams>,
) -> AppResult<Json<Vec<AllocationRecord>>> {
    Ok(Json(state.resources.list_allocations(&id, params.status).await?))
}

// =============================================================================
// RESOURCE LEDGER
// =============================================================================

/// GET /api/v1/departments/:id/resources
pub async fn get_ledger(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<LedgerEntry>>> {
    Ok(Json(state.resources.get_ledger(id).await?))
}

/// PUT /api/v1/departments/:id/resources
///
/// ```json
/// { "entries": [{ "resource_type": "equipment", "resource_key": "ventilator",
///                 "name": "Ventilator", "quantity": 5 }] }
/// ```
pub async fn edit_ledger(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Actor(actor): Actor,
    Json(request): Json<LedgerEditRequest>,
) -> AppResult<Json<Vec<LedgerEntry>>> {
    Ok(Json(
        state.resources.edit_ledger(id, request.entries, &actor).await?,
    ))
}

/// GET /api/v1/departments/:id/transfers
pub async fn list_transfers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<ResourceTransferRecord>>> {
    Ok(Json(state.resources.list_transfers(id).await?))
}

/// POST /api/v1/resources/transfer
pub async fn transfer_resource(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(request): Json<ResourceTransferRequest>,
) -> AppResult<Json<TransferReceipt>> {
    Ok(Json(state.resources.transfer(request, &actor).await?))
}

/// POST /api/v1/resources/allocate
pub async fn allocate_resource(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(request): Json<ResourceAllocationRequest>,
) -> AppResult<Json<AllocationReceipt>> {
    Ok(Json(state.resources.allocate(request, &actor).await?))
}

/// POST /api/v1/resources/deallocate
pub async fn deallocate_resource(
    State(state): State<Arc<AppState>>,
    Actor(actor): Actor,
    Json(request): Json<ResourceAllocationRequest>,
) -> AppResult<Json<DeallocationResult>> {
    Ok(Json(state.resources.deallocate(request, &actor).await?))
}

// =============================================================================
// ACTIVITY LOG
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ActivityParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

/// GET /api/v1/activities?limit=20
pub async fn recent_activities(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ActivityParams>,
) -> AppResult<Json<Vec<Activity>>> {
    Ok(Json(state.activity.recent(params.limit).await?))
}
