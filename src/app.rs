// =============================================================================
// APPLICATION STATE AND ROUTES
// =============================================================================
// Wires the services onto one shared `AppState` and maps URLs to handlers.
// Kept out of main so tests can drive the full router in-process.
// =============================================================================

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::admission::AdmissionService;
use crate::audit::ActivityLog;
use crate::beds::BedAllocator;
use crate::cache::OccupancyCache;
use crate::collaborators::{AssessmentService, BillingService};
use crate::feed::ChangeFeed;
use crate::handlers;
use crate::metrics;
use crate::resources::ResourceLedger;
use crate::store::CapacityStore;

/// Shared by every request handler through `State<Arc<AppState>>`
pub struct AppState {
    pub store: Arc<dyn CapacityStore>,
    pub beds: BedAllocator,
    pub resources: ResourceLedger,
    pub admissions: AdmissionService,
    pub activity: ActivityLog,
    pub feed: ChangeFeed,
    pub cache: OccupancyCache,
    pub metrics_handle: PrometheusHandle,
}

impl AppState {
    pub fn new(
        store: Arc<dyn CapacityStore>,
        billing: Arc<dyn BillingService>,
        assessment: Arc<dyn AssessmentService>,
        cache: OccupancyCache,
        metrics_handle: PrometheusHandle,
    ) -> Self {
        let feed = ChangeFeed::default();
        let beds = BedAllocator::new(store.clone(), feed.clone());
        let resources = ResourceLedger::new(store.clone(), feed.clone());
        let admissions = AdmissionService::new(
            store.clone(),
            beds.clone(),
            resources.clone(),
            billing,
            assessment,
            feed.clone(),
        );
        Self {
            activity: ActivityLog::new(store.clone()),
            store,
            beds,
            resources,
            admissions,
            feed,
            cache,
            metrics_handle,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // ----- Health & Readiness -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        // ----- Departments & Beds -----
        .route(
            "/api/v1/departments",
            get(handlers::list_departments).post(handlers::create_department),
        )
        .route("/api/v1/departments/:id", get(handlers::get_department))
        .route(
            "/api/v1/departments/:id/beds",
            get(handlers::list_beds).post(handlers::add_beds),
        )
        .route(
            "/api/v1/departments/:id/alternatives",
            get(handlers::find_alternatives),
        )
        .route(
            "/api/v1/departments/:id/shift-candidates",
            get(handlers::find_shift_candidates),
        )
        .route(
            "/api/v1/departments/:id/resources",
            get(handlers::get_ledger).put(handlers::edit_ledger),
        )
        .route(
            "/api/v1/departments/:id/transfers",
            get(handlers::list_transfers),
        )
        .route("/api/v1/beds/:id/release", post(handlers::release_bed))
        // ----- Patients -----
        .route("/api/v1/patients", post(handlers::admit_patient))
        .route("/api/v1/patients/:id", get(handlers::get_patient))
        .route(
            "/api/v1/patients/:id/alternative",
            post(handlers::admit_to_alternative),
        )
        .route(
            "/api/v1/patients/:id/bed-shift",
            post(handlers::admit_with_bed_shift),
        )
        .route(
            "/api/v1/patients/:id/transfer",
            post(handlers::transfer_patient),
        )
        .route(
            "/api/v1/patients/:id/discharge",
            post(handlers::discharge_patient),
        )
        .route(
            "/api/v1/patients/:id/allocations",
            get(handlers::list_allocations),
        )
        // ----- Resources -----
        .route("/api/v1/resources/transfer", post(handlers::transfer_resource))
        .route("/api/v1/resources/allocate", post(handlers::allocate_resource))
        .route(
            "/api/v1/resources/deallocate",
            post(handlers::deallocate_resource),
        )
        .route("/api/v1/activities", get(handlers::recent_activities))
        // ----- Middleware -----
        .layer(middleware::from_fn(metrics::track_http))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
