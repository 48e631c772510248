//! In-process store behind a single async mutex.
//!
//! Each trait call holds the lock for its whole body, which makes every call
//! one atomic unit. Used by the test suite and by `STORE_BACKEND=memory`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{highest_bed_sequence, CapacityStore};
use crate::error::{AppError, AppResult};
use crate::ledger;
use crate::models::{
    format_bed_number, Activity, AllocationRecord, AllocationStatus, Bed, BedCounts, BedStatus,
    Deallocation, DeallocationResult, Department, LedgerEdit, LedgerEntry, Patient,
    PatientUpdate, ResourceTransferRecord, ResourceType, VitalsRecord,
};

type LedgerKey = (Uuid, ResourceType, String);

#[derive(Default)]
struct MemoryState {
    departments: HashMap<Uuid, Department>,
    beds: HashMap<Uuid, Bed>,
    patients: HashMap<String, Patient>,
    vitals: Vec<VitalsRecord>,
    ledger: HashMap<LedgerKey, LedgerEntry>,
    transfers: Vec<ResourceTransferRecord>,
    // insertion order is allocation order
    allocations: Vec<AllocationRecord>,
    activities: Vec<Activity>,
    sequences: HashMap<NaiveDate, u32>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of vitals records created for a patient
    pub async fn vitals_count(&self, patient_id: &str) -> usize {
        let state = self.state.lock().await;
        state
            .vitals
            .iter()
            .filter(|v| v.patient_id == patient_id)
            .count()
    }
}

fn ledger_key(department_id: Uuid, resource_type: ResourceType, resource_key: &str) -> LedgerKey {
    (department_id, resource_type, resource_key.to_string())
}

fn seat_patient(patient: &mut Patient, bed: &Bed) {
    patient.bed_id = Some(bed.id);
    patient.bed_number = Some(bed.bed_number.clone());
    patient.department_id = bed.department_id;
}

/// Open allocation of the requested resource to the requesting patient
fn held_by(record: &AllocationRecord, request: &Deallocation) -> bool {
    record.status == AllocationStatus::Allocated
        && record.patient_id == request.patient_id
        && record.department_id == request.department_id
        && record.resource_type == request.resource_type
        && record.resource_key == request.resource_key
}

fn claimable_patient<'a>(
    patients: &'a mut HashMap<String, Patient>,
    patient_id: &str,
) -> AppResult<&'a mut Patient> {
    let patient = patients
        .get_mut(patient_id)
        .ok_or_else(|| AppError::PatientNotFound(patient_id.to_string()))?;
    if let Some(bed_number) = &patient.bed_number {
        return Err(AppError::InvalidRequest(format!(
            "patient {} already holds bed {}",
            patient_id, bed_number
        )));
    }
    Ok(patient)
}

#[async_trait]
impl CapacityStore for MemoryStore {
    async fn insert_department(&self, department: Department) -> AppResult<Department> {
        let mut state = self.state.lock().await;
        if state.departments.values().any(|d| d.name == department.name) {
            return Err(AppError::InvalidRequest(format!(
                "department {} already exists",
                department.name
            )));
        }
        state.departments.insert(department.id, department.clone());
        Ok(department)
    }

    async fn get_department(&self, id: Uuid) -> AppResult<Option<Department>> {
        let state = self.state.lock().await;
        Ok(state.departments.get(&id).cloned())
    }

    async fn list_departments(&self) -> AppResult<Vec<Department>> {
        let state = self.state.lock().await;
        let mut departments: Vec<Department> = state.departments.values().cloned().collect();
        departments.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(departments)
    }

    async fn adjust_department_load(&self, id: Uuid, delta: i32) -> AppResult<Department> {
        let mut state = self.state.lock().await;
        let department = state
            .departments
            .get_mut(&id)
            .ok_or(AppError::DepartmentNotFound(id))?;
        department.current_load = (department.current_load + delta).max(0);
        department.updated_at = Utc::now();
        Ok(department.clone())
    }

    async fn add_beds(&self, department_id: Uuid, count: u32) -> AppResult<Vec<Bed>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let department = state
            .departments
            .get_mut(&department_id)
            .ok_or(AppError::DepartmentNotFound(department_id))?;

        // Beds shifted away keep their number, so every department is scanned
        let start = highest_bed_sequence(
            state.beds.values().map(|bed| bed.bed_number.as_str()),
            &department.code,
        );

        let beds: Vec<Bed> = (1..=count)
            .map(|offset| Bed {
                id: Uuid::new_v4(),
                department_id,
                bed_number: format_bed_number(&department.code, start + offset),
                status: BedStatus::Available,
                occupant_patient_id: None,
                occupied_at: None,
            })
            .collect();

        department.capacity += count as i32;
        department.updated_at = Utc::now();
        for bed in &beds {
            state.beds.insert(bed.id, bed.clone());
        }
        Ok(beds)
    }

    async fn get_bed(&self, id: Uuid) -> AppResult<Option<Bed>> {
        let state = self.state.lock().await;
        Ok(state.beds.get(&id).cloned())
    }

    async fn list_beds(&self, department_id: Uuid) -> AppResult<Vec<Bed>> {
        let state = self.state.lock().await;
        let mut beds: Vec<Bed> = state
            .beds
            .values()
            .filter(|bed| bed.department_id == department_id)
            .cloned()
            .collect();
        beds.sort_by(|a, b| a.bed_number.cmp(&b.bed_number));
        Ok(beds)
    }

    async fn bed_counts(&self) -> AppResult<HashMap<Uuid, BedCounts>> {
        let state = self.state.lock().await;
        let mut counts: HashMap<Uuid, BedCounts> = HashMap::new();
        for bed in state.beds.values() {
            let entry = counts.entry(bed.department_id).or_default();
            entry.total += 1;
            if bed.is_available() {
                entry.available += 1;
            }
        }
        Ok(counts)
    }

    async fn available_beds_outside(&self, department_id: Uuid) -> AppResult<Vec<Bed>> {
        let state = self.state.lock().await;
        let mut beds: Vec<Bed> = state
            .beds
            .values()
            .filter(|bed| bed.department_id != department_id && bed.is_available())
            .cloned()
            .collect();
        beds.sort_by(|a, b| a.bed_number.cmp(&b.bed_number));
        Ok(beds)
    }

    async fn claim_available_bed(
        &self,
        department_id: Uuid,
        patient_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Bed>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let patient = claimable_patient(&mut state.patients, patient_id)?;

        let candidate = state
            .beds
            .values_mut()
            .filter(|bed| bed.department_id == department_id && bed.is_available())
            .min_by(|a, b| a.bed_number.cmp(&b.bed_number));

        let Some(bed) = candidate else {
            return Ok(None);
        };

        bed.occupy(patient_id, now);
        seat_patient(patient, bed);
        Ok(Some(bed.clone()))
    }

    async fn shift_and_claim_bed(
        &self,
        bed_id: Uuid,
        from_department_id: Uuid,
        to_department_id: Uuid,
        patient_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Bed> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        for id in [from_department_id, to_department_id] {
            if !state.departments.contains_key(&id) {
                return Err(AppError::DepartmentNotFound(id));
            }
        }
        let patient = claimable_patient(&mut state.patients, patient_id)?;
        let bed = state
            .beds
            .get_mut(&bed_id)
            .ok_or(AppError::BedNotFound(bed_id))?;
        if !bed.is_available() || bed.department_id != from_department_id {
            return Err(AppError::BedUnavailable(bed.bed_number.clone()));
        }

        bed.department_id = to_department_id;
        bed.occupy(patient_id, now);
        seat_patient(patient, bed);
        let bed = bed.clone();

        if let Some(donor) = state.departments.get_mut(&from_department_id) {
            donor.capacity = (donor.capacity - 1).max(0);
            donor.updated_at = now;
        }
        if let Some(recipient) = state.departments.get_mut(&to_department_id) {
            recipient.capacity += 1;
            recipient.updated_at = now;
        }
        Ok(bed)
    }

    async fn release_bed(&self, bed_id: Uuid) -> AppResult<Bed> {
        let mut state = self.state.lock().await;
        let bed = state
            .beds
            .get_mut(&bed_id)
            .ok_or(AppError::BedNotFound(bed_id))?;
        bed.vacate();
        Ok(bed.clone())
    }

    async fn vacate_bed(&self, bed_id: Uuid) -> AppResult<(Bed, Option<Patient>)> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let bed = state
            .beds
            .get_mut(&bed_id)
            .ok_or(AppError::BedNotFound(bed_id))?;

        let occupant = bed
            .occupant_patient_id
            .as_deref()
            .and_then(|id| state.patients.get_mut(id))
            .filter(|patient| patient.bed_id == Some(bed_id))
            .map(|patient| {
                patient.bed_id = None;
                patient.bed_number = None;
                patient.clone()
            });

        bed.vacate();
        Ok((bed.clone(), occupant))
    }

    async fn next_patient_sequence(&self, day: NaiveDate) -> AppResult<u32> {
        let mut state = self.state.lock().await;
        let sequence = state.sequences.entry(day).or_insert(0);
        *sequence += 1;
        Ok(*sequence)
    }

    async fn insert_patient(&self, patient: Patient) -> AppResult<Patient> {
        let mut state = self.state.lock().await;
        if state.patients.contains_key(&patient.id) {
            return Err(AppError::InvalidRequest(format!(
                "patient {} already exists",
                patient.id
            )));
        }
        state.patients.insert(patient.id.clone(), patient.clone());
        Ok(patient)
    }

    async fn get_patient(&self, id: &str) -> AppResult<Option<Patient>> {
        let state = self.state.lock().await;
        Ok(state.patients.get(id).cloned())
    }

    async fn update_patient(&self, id: &str, update: &PatientUpdate) -> AppResult<Patient> {
        let mut state = self.state.lock().await;
        let patient = state
            .patients
            .get_mut(id)
            .ok_or_else(|| AppError::PatientNotFound(id.to_string()))?;
        update.apply(patient);
        Ok(patient.clone())
    }

    async fn insert_vitals(&self, vitals: VitalsRecord) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.vitals.push(vitals);
        Ok(())
    }

    async fn get_ledger(&self, department_id: Uuid) -> AppResult<Vec<LedgerEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<LedgerEntry> = state
            .ledger
            .values()
            .filter(|entry| entry.department_id == department_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            (a.resource_type.as_str(), &a.resource_key)
                .cmp(&(b.resource_type.as_str(), &b.resource_key))
        });
        Ok(entries)
    }

    async fn get_ledger_entry(
        &self,
        department_id: Uuid,
        resource_type: ResourceType,
        resource_key: &str,
    ) -> AppResult<Option<LedgerEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .get(&ledger_key(department_id, resource_type, resource_key))
            .cloned())
    }

    async fn apply_ledger_edits(
        &self,
        department_id: Uuid,
        edits: &[LedgerEdit],
        now: DateTime<Utc>,
    ) -> AppResult<Vec<LedgerEntry>> {
        let mut state = self.state.lock().await;
        if !state.departments.contains_key(&department_id) {
            return Err(AppError::DepartmentNotFound(department_id));
        }

        // Stage every line before touching the ledger
        let mut staged: HashMap<LedgerKey, LedgerEntry> = HashMap::new();
        for edit in edits {
            let key = ledger_key(department_id, edit.resource_type, &edit.resource_key);
            let existing = staged
                .get(&key)
                .cloned()
                .or_else(|| state.ledger.get(&key).cloned());
            let entry = ledger::apply_edit(department_id, existing, edit, now)?;
            staged.insert(key, entry);
        }

        let updated: Vec<LedgerEntry> = staged.values().cloned().collect();
        state.ledger.extend(staged);
        Ok(updated)
    }

    async fn transfer_resource(
        &self,
        record: &ResourceTransferRecord,
    ) -> AppResult<(LedgerEntry, LedgerEntry)> {
        let mut state = self.state.lock().await;
        for id in [record.from_department_id, record.to_department_id] {
            if !state.departments.contains_key(&id) {
                return Err(AppError::DepartmentNotFound(id));
            }
        }

        let source_key = ledger_key(
            record.from_department_id,
            record.resource_type,
            &record.resource_key,
        );
        let dest_key = ledger_key(
            record.to_department_id,
            record.resource_type,
            &record.resource_key,
        );

        let mut source = state
            .ledger
            .get(&source_key)
            .cloned()
            .ok_or_else(|| AppError::ResourceNotFound(record.resource_key.clone()))?;
        let destination = state.ledger.get(&dest_key).cloned();

        let destination = ledger::transfer_between(
            &mut source,
            destination,
            record.to_department_id,
            record.quantity,
            record.created_at,
        )?;

        state.ledger.insert(source_key, source.clone());
        state.ledger.insert(dest_key, destination.clone());
        state.transfers.push(record.clone());
        Ok((source, destination))
    }

    async fn allocate_resource(&self, record: &AllocationRecord) -> AppResult<LedgerEntry> {
        let mut state = self.state.lock().await;
        let key = ledger_key(
            record.department_id,
            record.resource_type,
            &record.resource_key,
        );
        let mut entry = state
            .ledger
            .get(&key)
            .cloned()
            .ok_or_else(|| AppError::ResourceNotFound(record.resource_key.clone()))?;

        entry.allocate(record.quantity, record.allocated_at)?;

        state.ledger.insert(key, entry.clone());
        state.allocations.push(record.clone());
        Ok(entry)
    }

    async fn deallocate_resource(&self, request: &Deallocation) -> AppResult<DeallocationResult> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let key = ledger_key(
            request.department_id,
            request.resource_type,
            &request.resource_key,
        );
        let mut entry = state
            .ledger
            .get(&key)
            .cloned()
            .ok_or_else(|| AppError::ResourceNotFound(request.resource_key.clone()))?;

        let held: i32 = state
            .allocations
            .iter()
            .filter(|r| held_by(r, request))
            .map(|r| r.quantity)
            .sum();

        let mut remaining = request.quantity.min(held);
        let released = if remaining > 0 {
            entry.deallocate(remaining, request.at)?
        } else {
            0
        };

        let mut records_closed = 0;
        for record in state.allocations.iter_mut().filter(|r| held_by(r, request)) {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(record.quantity);
            record.quantity -= take;
            remaining -= take;
            if record.quantity == 0 {
                record.status = AllocationStatus::Deallocated;
                record.deallocated_at = Some(request.at);
                records_closed += 1;
            }
        }

        state.ledger.insert(key, entry.clone());
        Ok(DeallocationResult {
            entry,
            requested: request.quantity,
            held,
            released,
            records_closed,
        })
    }

    async fn list_allocations(
        &self,
        patient_id: &str,
        department_id: Option<Uuid>,
        status: Option<AllocationStatus>,
    ) -> AppResult<Vec<AllocationRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .allocations
            .iter()
            .filter(|r| r.patient_id == patient_id)
            .filter(|r| department_id.map_or(true, |id| r.department_id == id))
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect())
    }

    async fn list_transfers(&self, department_id: Uuid) -> AppResult<Vec<ResourceTransferRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .transfers
            .iter()
            .rev()
            .filter(|t| t.from_department_id == department_id || t.to_department_id == department_id)
            .cloned()
            .collect())
    }

    async fn append_activity(&self, activity: Activity) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.activities.push(activity);
        Ok(())
    }

    async fn recent_activities(&self, limit: i64) -> AppResult<Vec<Activity>> {
        let state = self.state.lock().await;
        Ok(state
            .activities
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> bool {
        true
    }
}
