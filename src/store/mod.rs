//! Capacity store: persistent departments, beds, patients and ledgers.
//!
//! Every method is one atomic unit. Implementations must never leave a bed
//! half-claimed or a ledger entry unbalanced, even when two sessions race for
//! the same department.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    Activity, AllocationRecord, AllocationStatus, Bed, BedCounts, Deallocation,
    DeallocationResult, Department, LedgerEdit, LedgerEntry, Patient, PatientUpdate,
    ResourceTransferRecord, ResourceType, VitalsRecord,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait CapacityStore: Send + Sync {
    // -------------------------------------------------------------------------
    // DEPARTMENTS
    // -------------------------------------------------------------------------
    async fn insert_department(&self, department: Department) -> AppResult<Department>;

    async fn get_department(&self, id: Uuid) -> AppResult<Option<Department>>;

    /// Ordered by name
    async fn list_departments(&self) -> AppResult<Vec<Department>>;

    /// Add `delta` to `current_load`, never dropping below zero.
    ///
    /// Fails with `DepartmentNotFound`.
    async fn adjust_department_load(&self, id: Uuid, delta: i32) -> AppResult<Department>;

    // -------------------------------------------------------------------------
    // BEDS
    // -------------------------------------------------------------------------
    /// Create `count` available beds numbered after the department's highest
    /// existing number and raise its capacity by `count`.
    async fn add_beds(&self, department_id: Uuid, count: u32) -> AppResult<Vec<Bed>>;

    async fn get_bed(&self, id: Uuid) -> AppResult<Option<Bed>>;

    /// Ordered by bed number
    async fn list_beds(&self, department_id: Uuid) -> AppResult<Vec<Bed>>;

    /// Live counts; departments without beds are absent from the map
    async fn bed_counts(&self) -> AppResult<HashMap<Uuid, BedCounts>>;

    /// Available beds owned by any department other than `department_id`
    async fn available_beds_outside(&self, department_id: Uuid) -> AppResult<Vec<Bed>>;

    /// Claim the lowest-numbered available bed in the department for the
    /// patient, updating the patient's bed and department fields in the same
    /// transaction. `Ok(None)` when no bed is free.
    ///
    /// Fails with `PatientNotFound`, or `InvalidRequest` when the patient
    /// already holds a bed.
    async fn claim_available_bed(
        &self,
        department_id: Uuid,
        patient_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Bed>>;

    /// Move a bed from `from_department_id` to `to_department_id` and claim
    /// it for the patient in one transaction. Donor capacity drops by one,
    /// recipient capacity grows by one.
    ///
    /// Fails with `BedUnavailable` if the bed is occupied or no longer owned
    /// by the donor; nothing is changed in that case.
    async fn shift_and_claim_bed(
        &self,
        bed_id: Uuid,
        from_department_id: Uuid,
        to_department_id: Uuid,
        patient_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Bed>;

    /// Mark a bed available. The occupant's patient record is left to the caller.
    async fn release_bed(&self, bed_id: Uuid) -> AppResult<Bed>;

    /// Free a bed and clear its occupant's bed fields in one transaction.
    /// Returns the occupant as updated, if the patient record still pointed
    /// at this bed.
    async fn vacate_bed(&self, bed_id: Uuid) -> AppResult<(Bed, Option<Patient>)>;

    // -------------------------------------------------------------------------
    // PATIENTS
    // -------------------------------------------------------------------------
    /// Next value of the per-day admission counter, starting at 1
    async fn next_patient_sequence(&self, day: NaiveDate) -> AppResult<u32>;

    async fn insert_patient(&self, patient: Patient) -> AppResult<Patient>;

    async fn get_patient(&self, id: &str) -> AppResult<Option<Patient>>;

    async fn update_patient(&self, id: &str, update: &PatientUpdate) -> AppResult<Patient>;

    async fn insert_vitals(&self, vitals: VitalsRecord) -> AppResult<()>;

    // -------------------------------------------------------------------------
    // RESOURCE LEDGER
    // -------------------------------------------------------------------------
    async fn get_ledger(&self, department_id: Uuid) -> AppResult<Vec<LedgerEntry>>;

    async fn get_ledger_entry(
        &self,
        department_id: Uuid,
        resource_type: ResourceType,
        resource_key: &str,
    ) -> AppResult<Option<LedgerEntry>>;

    /// Operator bulk edit; all lines apply or none do
    async fn apply_ledger_edits(
        &self,
        department_id: Uuid,
        edits: &[LedgerEdit],
        now: DateTime<Utc>,
    ) -> AppResult<Vec<LedgerEntry>>;

    /// Move idle units between departments and append the record.
    ///
    /// Returns the source and destination entries after the move.
    async fn transfer_resource(
        &self,
        record: &ResourceTransferRecord,
    ) -> AppResult<(LedgerEntry, LedgerEntry)>;

    /// Move units to in_use and append the allocation record
    async fn allocate_resource(&self, record: &AllocationRecord) -> AppResult<LedgerEntry>;

    /// Return units to available and settle the patient's matching allocation
    /// records oldest first. The release is clamped to what this patient holds
    /// in open records and to the entry's in_use; other patients' records on
    /// the same entry are never touched.
    async fn deallocate_resource(&self, request: &Deallocation) -> AppResult<DeallocationResult>;

    /// Oldest first
    async fn list_allocations(
        &self,
        patient_id: &str,
        department_id: Option<Uuid>,
        status: Option<AllocationStatus>,
    ) -> AppResult<Vec<AllocationRecord>>;

    /// Transfers into or out of the department, newest first
    async fn list_transfers(&self, department_id: Uuid) -> AppResult<Vec<ResourceTransferRecord>>;

    // -------------------------------------------------------------------------
    // ACTIVITY LOG
    // -------------------------------------------------------------------------
    async fn append_activity(&self, activity: Activity) -> AppResult<()>;

    /// Newest first
    async fn recent_activities(&self, limit: i64) -> AppResult<Vec<Activity>>;

    async fn health_check(&self) -> bool;
}

/// Highest numeric suffix among bed numbers carrying the department's prefix.
/// Callers pass every bed, wherever it sits now, so a number that left with a
/// shifted bed is never issued again.
pub(crate) fn highest_bed_sequence<'a>(numbers: impl Iterator<Item = &'a str>, code: &str) -> u32 {
    let prefix = format!("{}-", code);
    numbers
        .filter_map(|number| number.strip_prefix(&prefix))
        .filter_map(|suffix| suffix.parse::<u32>().ok())
        .max()
        .unwrap_or(0)
}

// -----------------------------------------------------------------------------
// SAMPLE DATA
// -----------------------------------------------------------------------------
/// Seed a small hospital when the store has no departments yet
pub async fn seed_sample_data(store: &dyn CapacityStore) -> AppResult<()> {
    if !store.list_departments().await?.is_empty() {
        return Ok(());
    }

    let departments = [
        ("ICU", "ICU", 4),
        ("Emergency", "ER", 8),
        ("General Ward", "GEN", 12),
        ("Pediatrics", "PED", 6),
    ];

    let now = Utc::now();
    for (name, code, beds) in departments {
        let department = store
            .insert_department(Department::new(name, code, 0))
            .await?;
        store.add_beds(department.id, beds).await?;

        let mut edits = vec![LedgerEdit {
            resource_type: ResourceType::Supply,
            resource_key: "iv_kit".into(),
            name: "IV Kit".into(),
            quantity: 40,
        }];
        if code == "ICU" {
            edits.push(LedgerEdit {
                resource_type: ResourceType::Equipment,
                resource_key: "ventilator".into(),
                name: "Ventilator".into(),
                quantity: 5,
            });
        }
        store.apply_ledger_edits(department.id, &edits, now).await?;
    }

    tracing::info!("Seeded sample departments");
    Ok(())
}
