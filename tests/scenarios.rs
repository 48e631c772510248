// =============================================================================
// WARD SCENARIOS
// =============================================================================
// End-to-end flows through the services against the in-memory store, plus a
// few requests through the full HTTP router.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use tower::ServiceExt;
use uuid::Uuid;

use ward_capacity::admission::AdmissionService;
use ward_capacity::app::{router, AppState};
use ward_capacity::beds::BedAllocator;
use ward_capacity::cache::OccupancyCache;
use ward_capacity::collaborators::{LogOnlyAssessment, LogOnlyBilling};
use ward_capacity::error::AppError;
use ward_capacity::feed::ChangeFeed;
use ward_capacity::models::*;
use ward_capacity::resources::ResourceLedger;
use ward_capacity::store::{CapacityStore, MemoryStore};

// -----------------------------------------------------------------------------
// FIXTURES
// -----------------------------------------------------------------------------

struct Hospital {
    store: Arc<MemoryStore>,
    beds: BedAllocator,
    resources: ResourceLedger,
    admissions: AdmissionService,
}

fn hospital() -> Hospital {
    let store = Arc::new(MemoryStore::new());
    let feed = ChangeFeed::default();
    let beds = BedAllocator::new(store.clone(), feed.clone());
    let resources = ResourceLedger::new(store.clone(), feed.clone());
    let admissions = AdmissionService::new(
        store.clone(),
        beds.clone(),
        resources.clone(),
        Arc::new(LogOnlyBilling),
        Arc::new(LogOnlyAssessment),
        feed,
    );
    Hospital {
        store,
        beds,
        resources,
        admissions,
    }
}

impl Hospital {
    async fn department(&self, name: &str, code: &str, beds: u32) -> Department {
        self.beds
            .create_department(
                CreateDepartmentRequest {
                    name: name.into(),
                    code: Some(code.into()),
                    beds,
                },
                "admin",
            )
            .await
            .unwrap()
    }

    async fn admit(&self, name: &str, department_id: Uuid) -> AdmissionOutcome {
        self.admissions
            .admit(
                AdmitPatientRequest {
                    name: name.into(),
                    department_id,
                    priority: Priority::Medium,
                },
                "desk",
            )
            .await
            .unwrap()
    }

    async fn stock(&self, department_id: Uuid, key: &str, name: &str, quantity: i32) {
        self.resources
            .edit_ledger(
                department_id,
                vec![LedgerEdit {
                    resource_type: ResourceType::Equipment,
                    resource_key: key.into(),
                    name: name.into(),
                    quantity,
                }],
                "admin",
            )
            .await
            .unwrap();
    }

    async fn entry(&self, department_id: Uuid, key: &str) -> Option<LedgerEntry> {
        self.store
            .get_ledger_entry(department_id, ResourceType::Equipment, key)
            .await
            .unwrap()
    }

    async fn available_beds(&self, department_id: Uuid) -> i64 {
        self.beds.occupancy(department_id).await.unwrap().available_beds
    }

    /// Occupied beds and their occupants agree, and no patient holds two beds
    async fn assert_beds_exclusive(&self) {
        let mut occupants = HashSet::new();
        for department in self.store.list_departments().await.unwrap() {
            for bed in self.store.list_beds(department.id).await.unwrap() {
                assert_eq!(
                    bed.status == BedStatus::Occupied,
                    bed.occupant_patient_id.is_some(),
                    "bed {} status and occupant disagree",
                    bed.bed_number
                );
                if let Some(occupant) = bed.occupant_patient_id {
                    assert!(occupants.insert(occupant), "patient holds two beds");
                }
            }
        }
    }

    async fn assert_ledger_balanced(&self, department_id: Uuid) {
        for entry in self.resources.get_ledger(department_id).await.unwrap() {
            assert_eq!(
                entry.available + entry.in_use,
                entry.quantity,
                "{} is unbalanced",
                entry.resource_key
            );
        }
    }
}

fn allocation(patient_id: &str, department_id: Uuid, key: &str, quantity: i32) -> ResourceAllocationRequest {
    ResourceAllocationRequest {
        patient_id: patient_id.into(),
        department_id,
        resource_type: ResourceType::Equipment,
        resource_key: key.into(),
        quantity,
    }
}

fn transfer(from: Uuid, to: Uuid, key: &str, quantity: i32) -> ResourceTransferRequest {
    ResourceTransferRequest {
        from_department_id: from,
        to_department_id: to,
        resource_type: ResourceType::Equipment,
        resource_key: key.into(),
        quantity,
        reason: "surge".into(),
    }
}

// =============================================================================
// BEDS
// =============================================================================

#[tokio::test]
async fn icu_fills_then_suggests_general_ward() {
    let h = hospital();
    let icu = h.department("ICU", "ICU", 2).await;
    let general = h.department("General", "GEN", 10).await;
    for i in 0..5 {
        h.admit(&format!("General {i}"), general.id).await;
    }

    let a = h.admit("A", icu.id).await;
    let bed_a = a.placement.assignment().expect("A placed");
    assert_eq!(bed_a.bed_number, "ICU-001");
    assert_eq!(h.available_beds(icu.id).await, 1);

    let b = h.admit("B", icu.id).await;
    assert!(b.placement.assignment().is_some());
    assert_eq!(h.available_beds(icu.id).await, 0);

    let c = h.admit("C", icu.id).await;
    match c.placement {
        Placement::Unplaced {
            error, suggestions, ..
        } => {
            assert_eq!(error, "CAPACITY_EXCEEDED");
            assert_eq!(suggestions.len(), 1);
            assert_eq!(suggestions[0].department_id, general.id);
            assert_eq!(suggestions[0].available_beds, 5);
            assert_eq!(suggestions[0].utilization, 0.5);
        }
        other => panic!("expected unplaced, got {:?}", other),
    }
    assert_eq!(c.patient.bed_id, None);
    assert_eq!(c.patient.status, PatientStatus::Active);

    h.assert_beds_exclusive().await;
}

#[tokio::test]
async fn suggestions_skip_full_departments_and_sort_by_utilization() {
    let h = hospital();
    let icu = h.department("ICU", "ICU", 1).await;
    let er = h.department("Emergency", "ER", 1).await;
    let busy = h.department("Cardiology", "CAR", 4).await;
    let quiet = h.department("Pediatrics", "PED", 4).await;

    h.admit("A", icu.id).await;
    h.admit("B", er.id).await;
    for i in 0..3 {
        h.admit(&format!("C{i}"), busy.id).await;
    }
    h.admit("D", quiet.id).await;

    let waiting = h.admit("E", icu.id).await;
    let err = h
        .beds
        .assign_bed(&waiting.patient.id, icu.id, "desk")
        .await
        .unwrap_err();
    let (occupied, total, suggestions) = match err {
        AppError::CapacityExceeded {
            occupied,
            total,
            suggestions,
            ..
        } => (occupied, total, suggestions),
        other => panic!("expected capacity exceeded, got {:?}", other),
    };
    assert_eq!((occupied, total), (1, 1));

    let ids: Vec<Uuid> = suggestions.iter().map(|s| s.department_id).collect();
    assert_eq!(ids, vec![quiet.id, busy.id]);
    assert!(suggestions.iter().all(|s| s.available_beds >= 1));
    assert!(suggestions[0].utilization <= suggestions[1].utilization);
}

#[tokio::test]
async fn department_without_beds_is_not_a_capacity_problem() {
    let h = hospital();
    let empty = h.department("Radiology", "RAD", 0).await;

    let outcome = h.admit("A", empty.id).await;
    match outcome.placement {
        Placement::Unplaced {
            error, suggestions, ..
        } => {
            assert_eq!(error, "NO_BEDS_CONFIGURED");
            assert!(suggestions.is_empty());
        }
        other => panic!("expected unplaced, got {:?}", other),
    }
}

#[tokio::test]
async fn waiting_patient_gets_a_bed_shifted_in_from_emergency() {
    let h = hospital();
    let icu = h.department("ICU", "ICU", 1).await;
    let er = h.department("Emergency", "ER", 3).await;
    h.admit("A", icu.id).await;

    let waiting = h.admit("B", icu.id).await;
    assert!(waiting.placement.assignment().is_none());

    let er_before = h.available_beds(er.id).await;
    let candidates = h.beds.find_shift_candidates(icu.id).await.unwrap();
    assert_eq!(candidates.len(), 3);
    let candidate = &candidates[0];
    assert_eq!(candidate.department_id, er.id);

    let outcome = h
        .admissions
        .admit_with_bed_shift(&waiting.patient.id, candidate.bed_id, "desk")
        .await
        .unwrap();

    let assignment = outcome.placement.assignment().expect("placed");
    assert_eq!(assignment.bed_id, candidate.bed_id);
    assert_eq!(assignment.department_id, icu.id);
    assert_eq!(h.available_beds(er.id).await, er_before - 1);

    let icu_now = h.beds.occupancy(icu.id).await.unwrap();
    assert_eq!(icu_now.total_beds, 2);
    assert_eq!(icu_now.occupied_beds, 2);
    assert_eq!(icu_now.available_beds, 0);

    let bed = h.store.get_bed(candidate.bed_id).await.unwrap().unwrap();
    assert_eq!(bed.department_id, icu.id);
    assert_eq!(bed.occupant_patient_id.as_deref(), Some(waiting.patient.id.as_str()));
    assert_eq!(outcome.patient.bed_id, Some(candidate.bed_id));

    h.assert_beds_exclusive().await;
}

#[tokio::test]
async fn shifting_an_occupied_bed_changes_nothing() {
    let h = hospital();
    let icu = h.department("ICU", "ICU", 1).await;
    let er = h.department("Emergency", "ER", 1).await;
    let er_patient = h.admit("A", er.id).await;
    let er_bed = er_patient.placement.assignment().unwrap().bed_id;
    h.admit("B", icu.id).await;
    let waiting = h.admit("C", icu.id).await;

    let err = h
        .admissions
        .admit_with_bed_shift(&waiting.patient.id, er_bed, "desk")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BedUnavailable(_)));

    let bed = h.store.get_bed(er_bed).await.unwrap().unwrap();
    assert_eq!(bed.department_id, er.id);
    assert_eq!(bed.occupant_patient_id.as_deref(), Some(er_patient.patient.id.as_str()));
    assert_eq!(h.admissions.get_patient(&waiting.patient.id).await.unwrap().bed_id, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_never_share_a_bed() {
    let h = hospital();
    let icu = h.department("ICU", "ICU", 3).await;
    let icu_id = icu.id;

    let mut handles = Vec::new();
    for i in 0..10 {
        let admissions = h.admissions.clone();
        handles.push(tokio::spawn(async move {
            admissions
                .admit(
                    AdmitPatientRequest {
                        name: format!("Patient {i}"),
                        department_id: icu_id,
                        priority: Priority::High,
                    },
                    "desk",
                )
                .await
                .unwrap()
        }));
    }

    let mut placed = 0;
    let mut bed_ids = HashSet::new();
    for handle in handles {
        let outcome = handle.await.unwrap();
        if let Some(assignment) = outcome.placement.assignment() {
            placed += 1;
            assert!(bed_ids.insert(assignment.bed_id), "bed handed out twice");
        }
    }

    assert_eq!(placed, 3);
    assert_eq!(h.available_beds(icu.id).await, 0);
    h.assert_beds_exclusive().await;
}

// =============================================================================
// RESOURCE LEDGER
// =============================================================================

#[tokio::test]
async fn ventilators_move_from_icu_to_emergency() {
    let h = hospital();
    let icu = h.department("ICU", "ICU", 1).await;
    let er = h.department("Emergency", "ER", 1).await;
    h.stock(icu.id, "ventilator", "Ventilator", 5).await;
    assert!(h.entry(er.id, "ventilator").await.is_none());

    let receipt = h
        .resources
        .transfer(transfer(icu.id, er.id, "ventilator", 3), "charge-nurse")
        .await
        .unwrap();

    assert_eq!((receipt.source.quantity, receipt.source.available), (2, 2));
    assert_eq!(
        (receipt.destination.quantity, receipt.destination.available),
        (3, 3)
    );
    assert_eq!(receipt.destination.name, "Ventilator");

    // A second transfer increments the existing entry
    h.resources
        .transfer(transfer(icu.id, er.id, "ventilator", 1), "charge-nurse")
        .await
        .unwrap();
    let er_entry = h.entry(er.id, "ventilator").await.unwrap();
    let icu_entry = h.entry(icu.id, "ventilator").await.unwrap();
    assert_eq!(er_entry.quantity, 4);
    assert_eq!(icu_entry.quantity + er_entry.quantity, 5);

    let history = h.resources.list_transfers(er.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|t| t.actor == "charge-nurse"));

    h.assert_ledger_balanced(icu.id).await;
    h.assert_ledger_balanced(er.id).await;
}

#[tokio::test]
async fn transfer_cannot_move_units_in_use() {
    let h = hospital();
    let icu = h.department("ICU", "ICU", 1).await;
    let er = h.department("Emergency", "ER", 1).await;
    h.stock(icu.id, "ventilator", "Ventilator", 2).await;
    let a = h.admit("A", icu.id).await;
    h.resources
        .allocate(allocation(&a.patient.id, icu.id, "ventilator", 1), "nurse")
        .await
        .unwrap();

    let err = h
        .resources
        .transfer(transfer(icu.id, er.id, "ventilator", 2), "charge-nurse")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::InsufficientAvailable {
            available: 1,
            requested: 2
        }
    ));

    let err = h
        .resources
        .transfer(transfer(icu.id, er.id, "oxygen", 1), "charge-nurse")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ResourceNotFound(_)));

    let icu_entry = h.entry(icu.id, "ventilator").await.unwrap();
    assert_eq!((icu_entry.quantity, icu_entry.available, icu_entry.in_use), (2, 1, 1));
    assert!(h.entry(er.id, "ventilator").await.is_none());
}

#[tokio::test]
async fn allocate_then_deallocate_restores_the_ledger() {
    let h = hospital();
    let icu = h.department("ICU", "ICU", 1).await;
    h.stock(icu.id, "ventilator", "Ventilator", 3).await;
    let a = h.admit("A", icu.id).await;
    let before = h.entry(icu.id, "ventilator").await.unwrap();

    let receipt = h
        .resources
        .allocate(allocation(&a.patient.id, icu.id, "ventilator", 2), "nurse")
        .await
        .unwrap();
    assert_eq!((receipt.entry.available, receipt.entry.in_use), (1, 2));
    h.assert_ledger_balanced(icu.id).await;

    let result = h
        .resources
        .deallocate(allocation(&a.patient.id, icu.id, "ventilator", 2), "nurse")
        .await
        .unwrap();
    assert_eq!(result.released, 2);
    assert_eq!(result.entry.available, before.available);
    assert_eq!(result.entry.in_use, before.in_use);
    assert_eq!(result.entry.quantity, before.quantity);

    let open = h
        .resources
        .list_allocations(&a.patient.id, Some(AllocationStatus::Allocated))
        .await
        .unwrap();
    assert!(open.is_empty());
}

#[tokio::test]
async fn over_deallocation_is_clamped_to_units_held() {
    let h = hospital();
    let icu = h.department("ICU", "ICU", 1).await;
    h.stock(icu.id, "ventilator", "Ventilator", 3).await;
    let a = h.admit("A", icu.id).await;
    h.resources
        .allocate(allocation(&a.patient.id, icu.id, "ventilator", 1), "nurse")
        .await
        .unwrap();

    let result = h
        .resources
        .deallocate(allocation(&a.patient.id, icu.id, "ventilator", 5), "nurse")
        .await
        .unwrap();
    assert_eq!(result.requested, 5);
    assert_eq!(result.released, 1);
    assert_eq!((result.entry.available, result.entry.in_use), (3, 0));
    h.assert_ledger_balanced(icu.id).await;
}

#[tokio::test]
async fn shared_entry_release_only_touches_the_callers_units() {
    let h = hospital();
    let icu = h.department("ICU", "ICU", 2).await;
    h.stock(icu.id, "ventilator", "Ventilator", 5).await;
    let a = h.admit("A", icu.id).await;
    let b = h.admit("B", icu.id).await;
    h.resources
        .allocate(allocation(&a.patient.id, icu.id, "ventilator", 1), "nurse")
        .await
        .unwrap();
    h.resources
        .allocate(allocation(&b.patient.id, icu.id, "ventilator", 2), "nurse")
        .await
        .unwrap();

    let result = h
        .resources
        .deallocate(allocation(&a.patient.id, icu.id, "ventilator", 3), "nurse")
        .await
        .unwrap();
    assert_eq!(result.released, 1);

    let entry = h.entry(icu.id, "ventilator").await.unwrap();
    assert_eq!((entry.available, entry.in_use), (3, 2));
    let b_open = h
        .resources
        .list_allocations(&b.patient.id, Some(AllocationStatus::Allocated))
        .await
        .unwrap();
    assert_eq!(b_open.iter().map(|r| r.quantity).sum::<i32>(), 2);
    h.assert_ledger_balanced(icu.id).await;
}

// =============================================================================
// PATIENT LIFECYCLE
// =============================================================================

#[tokio::test]
async fn discharge_returns_bed_and_equipment() {
    let h = hospital();
    let icu = h.department("ICU", "ICU", 2).await;
    let er = h.department("Emergency", "ER", 1).await;
    h.stock(icu.id, "ventilator", "Ventilator", 5).await;
    h.resources
        .transfer(transfer(icu.id, er.id, "ventilator", 3), "charge-nurse")
        .await
        .unwrap();

    let a = h.admit("A", icu.id).await;
    let bed_id = a.placement.assignment().unwrap().bed_id;
    let receipt = h
        .resources
        .allocate(allocation(&a.patient.id, icu.id, "ventilator", 1), "nurse")
        .await
        .unwrap();
    assert_eq!((receipt.entry.available, receipt.entry.in_use), (1, 1));

    let outcome = h
        .admissions
        .discharge(&a.patient.id, DischargeRequest::default(), "desk")
        .await
        .unwrap();

    assert!(outcome.steps.iter().all(|s| s.ok));
    assert_eq!(outcome.deallocated_records, 1);
    assert_eq!(outcome.released_bed.as_deref(), Some("ICU-001"));
    assert_eq!(outcome.patient.status, PatientStatus::Discharged);
    assert_eq!(outcome.patient.bed_id, None);
    assert!(outcome.patient.discharged_at.is_some());

    let bed = h.store.get_bed(bed_id).await.unwrap().unwrap();
    assert_eq!(bed.status, BedStatus::Available);
    assert_eq!(bed.occupant_patient_id, None);

    let ventilators = h.entry(icu.id, "ventilator").await.unwrap();
    assert_eq!((ventilators.available, ventilators.in_use), (2, 0));

    let open = h
        .resources
        .list_allocations(&a.patient.id, Some(AllocationStatus::Allocated))
        .await
        .unwrap();
    assert!(open.is_empty());

    let icu_now = h.store.get_department(icu.id).await.unwrap().unwrap();
    assert_eq!(icu_now.current_load, 0);
    h.assert_beds_exclusive().await;
}

#[tokio::test]
async fn discharge_releases_units_held_in_every_department() {
    let h = hospital();
    let icu = h.department("ICU", "ICU", 1).await;
    let er = h.department("Emergency", "ER", 1).await;
    h.stock(icu.id, "ventilator", "Ventilator", 2).await;
    h.stock(er.id, "monitor", "Monitor", 2).await;

    let a = h.admit("A", icu.id).await;
    h.resources
        .allocate(allocation(&a.patient.id, icu.id, "ventilator", 1), "nurse")
        .await
        .unwrap();
    h.resources
        .allocate(allocation(&a.patient.id, er.id, "monitor", 2), "nurse")
        .await
        .unwrap();

    let outcome = h
        .admissions
        .discharge(&a.patient.id, DischargeRequest::default(), "desk")
        .await
        .unwrap();
    assert_eq!(outcome.deallocated_records, 2);

    let monitors = h.entry(er.id, "monitor").await.unwrap();
    assert_eq!((monitors.available, monitors.in_use), (2, 0));
    let ventilators = h.entry(icu.id, "ventilator").await.unwrap();
    assert_eq!((ventilators.available, ventilators.in_use), (2, 0));
}

#[tokio::test]
async fn transfer_frees_old_bed_and_places_in_new_department() {
    let h = hospital();
    let icu = h.department("ICU", "ICU", 1).await;
    let general = h.department("General", "GEN", 2).await;
    let a = h.admit("A", icu.id).await;
    let old_bed = a.placement.assignment().unwrap().bed_id;

    let outcome = h
        .admissions
        .transfer_department(&a.patient.id, general.id, "desk")
        .await
        .unwrap();

    let assignment = outcome.placement.assignment().expect("placed");
    assert_eq!(assignment.department_id, general.id);
    assert_eq!(outcome.patient.status, PatientStatus::Transferred);
    assert_eq!(outcome.patient.department_id, general.id);

    let freed = h.store.get_bed(old_bed).await.unwrap().unwrap();
    assert_eq!(freed.status, BedStatus::Available);
    assert_eq!(h.available_beds(icu.id).await, 1);

    let icu_now = h.store.get_department(icu.id).await.unwrap().unwrap();
    let general_now = h.store.get_department(general.id).await.unwrap().unwrap();
    assert_eq!(icu_now.current_load, 0);
    assert_eq!(general_now.current_load, 1);

    // Discharging a transferred patient releases the new bed
    let discharged = h
        .admissions
        .discharge(&a.patient.id, DischargeRequest::default(), "desk")
        .await
        .unwrap();
    assert_eq!(discharged.released_bed.as_deref(), Some("GEN-001"));
    assert_eq!(h.available_beds(general.id).await, 2);
}

#[tokio::test]
async fn patient_transferred_into_full_ward_is_placed_once_a_bed_frees() {
    let h = hospital();
    let icu = h.department("ICU", "ICU", 1).await;
    let general = h.department("General", "GEN", 1).await;
    let a = h.admit("A", icu.id).await;
    let b = h.admit("B", general.id).await;

    let moved = h
        .admissions
        .transfer_department(&a.patient.id, general.id, "desk")
        .await
        .unwrap();
    assert!(moved.placement.assignment().is_none());

    h.admissions
        .discharge(&b.patient.id, DischargeRequest::default(), "desk")
        .await
        .unwrap();
    let placed = h
        .admissions
        .admit_to_alternative(&a.patient.id, general.id, "desk")
        .await
        .unwrap();

    assert_eq!(placed.patient.bed_number.as_deref(), Some("GEN-001"));
    let general_now = h.beds.occupancy(general.id).await.unwrap();
    assert_eq!((general_now.occupied_beds, general_now.current_load), (1, 1));
    h.assert_beds_exclusive().await;
}

#[tokio::test]
async fn released_bed_is_never_shared() {
    let h = hospital();
    let icu = h.department("ICU", "ICU", 1).await;
    let a = h.admit("A", icu.id).await;
    let bed_id = a.placement.assignment().unwrap().bed_id;

    h.admissions.release_bed(bed_id, "ops").await.unwrap();
    let b = h.admit("B", icu.id).await;
    assert_eq!(b.placement.assignment().unwrap().bed_id, bed_id);

    let a_now = h.admissions.get_patient(&a.patient.id).await.unwrap();
    assert_eq!(a_now.bed_id, None);
    let icu_now = h.store.get_department(icu.id).await.unwrap().unwrap();
    assert_eq!(icu_now.current_load, 1);
    h.assert_beds_exclusive().await;
}

// =============================================================================
// HTTP
// =============================================================================

fn app() -> axum::Router {
    let store = Arc::new(MemoryStore::new());
    let handle = PrometheusBuilder::new().build_recorder().handle();
    let state = AppState::new(
        store,
        Arc::new(LogOnlyBilling),
        Arc::new(LogOnlyAssessment),
        OccupancyCache::disabled(),
        handle,
    );
    router(Arc::new(state))
}

async fn send(
    app: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-actor", "dr-house");
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

#[tokio::test]
async fn health_and_readiness() {
    let app = app();

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "ward-capacity-service");

    let (status, body) = send(&app, "GET", "/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["store"], true);
    assert!(body["checks"]["redis"].is_null());
}

#[tokio::test]
async fn admission_over_http() {
    let app = app();

    let (status, icu) = send(
        &app,
        "POST",
        "/api/v1/departments",
        Some(serde_json::json!({ "name": "ICU", "code": "ICU", "beds": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let icu_id = icu["id"].as_str().unwrap().to_string();

    let admit = serde_json::json!({ "name": "Jane", "department_id": icu_id, "priority": "high" });
    let (status, first) = send(&app, "POST", "/api/v1/patients", Some(admit.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["placement"]["outcome"], "assigned");
    assert_eq!(first["placement"]["bed_number"], "ICU-001");

    let (status, second) = send(&app, "POST", "/api/v1/patients", Some(admit)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(second["placement"]["outcome"], "unplaced");
    assert_eq!(second["placement"]["error"], "CAPACITY_EXCEEDED");

    let (status, occupancy) = send(&app, "GET", &format!("/api/v1/departments/{icu_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(occupancy["available_beds"], 0);
    assert_eq!(occupancy["occupied_beds"], 1);

    let patient_id = first["patient"]["id"].as_str().unwrap();
    let (status, discharged) = send(
        &app,
        "POST",
        &format!("/api/v1/patients/{patient_id}/discharge"),
        Some(serde_json::json!({ "payment_status": "paid" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(discharged["patient"]["status"], "discharged");

    let (status, again) = send(
        &app,
        "POST",
        &format!("/api/v1/patients/{patient_id}/discharge"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(again["error"], "INVALID_REQUEST");

    let (status, activities) = send(&app, "GET", "/api/v1/activities?limit=5", None).await;
    assert_eq!(status, StatusCode::OK);
    let activities = activities.as_array().unwrap();
    assert!(!activities.is_empty());
    assert!(activities.iter().any(|a| a["actor"] == "dr-house"));
}

#[tokio::test]
async fn bed_release_over_http_clears_the_patient() {
    let app = app();

    let (_, icu) = send(
        &app,
        "POST",
        "/api/v1/departments",
        Some(serde_json::json!({ "name": "ICU", "code": "ICU", "beds": 1 })),
    )
    .await;
    let icu_id = icu["id"].as_str().unwrap().to_string();
    let admit = serde_json::json!({ "name": "Jane", "department_id": icu_id });
    let (_, first) = send(&app, "POST", "/api/v1/patients", Some(admit.clone())).await;
    let bed_id = first["placement"]["bed_id"].as_str().unwrap().to_string();
    let patient_id = first["patient"]["id"].as_str().unwrap().to_string();

    let (status, bed) = send(&app, "POST", &format!("/api/v1/beds/{bed_id}/release"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bed["status"], "available");

    let (_, patient) = send(&app, "GET", &format!("/api/v1/patients/{patient_id}"), None).await;
    assert!(patient["bed_id"].is_null());
    assert_eq!(patient["status"], "active");

    let (status, second) = send(&app, "POST", "/api/v1/patients", Some(admit)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(second["placement"]["bed_id"], bed_id.as_str());

    // bed moves go through the patient bed-shift endpoint only
    let (status, _) = send(
        &app,
        "POST",
        "/api/v1/beds/shift",
        Some(serde_json::json!({ "bed_id": bed_id, "target_department_id": icu_id, "patient_id": patient_id })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn errors_carry_codes_and_statuses() {
    let app = app();

    let (status, body) = send(&app, "GET", "/api/v1/patients/PT-19700101-0001", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "PATIENT_NOT_FOUND");

    let missing = Uuid::new_v4();
    let (status, body) = send(&app, "GET", &format!("/api/v1/departments/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "DEPARTMENT_NOT_FOUND");

    let (status, _) = send(&app, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
}
