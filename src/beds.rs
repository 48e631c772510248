// =============================================================================
// BED ALLOCATION
// =============================================================================
// Bed Allocator, Alternative-Department Resolver and Bed-Shift Transfer.
//
// The claim itself (pick a free bed, occupy it, point the patient at it) is
// one store call and therefore one transaction. Everything here is either
// validation before that call or bookkeeping after it.
//
// CLAIM POLICY:
// The available bed with the lowest bed number wins. Bed numbers are zero
// padded per department ("ICU-002"), so this is the same as numeric order.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use crate::audit::ActivityLog;
use crate::error::{AppError, AppResult};
use crate::feed::{ChangeEvent, ChangeFeed};
use crate::metrics;
use crate::models::{
    department_code, ActivityKind, Bed, BedAssignment, BedCounts, BedShiftCandidate,
    CreateDepartmentRequest, Department, DepartmentAlternative, DepartmentOccupancy, Patient,
};
use crate::store::CapacityStore;

/// Upper bound for a single bulk bed creation
pub const MAX_BEDS_PER_REQUEST: u32 = 500;

/// current_load / capacity, falling back to live occupied / total when the
/// department has no configured capacity
fn utilization(department: &Department, counts: BedCounts) -> f64 {
    department.load_ratio().unwrap_or_else(|| {
        if counts.total > 0 {
            counts.occupied() as f64 / counts.total as f64
        } else {
            0.0
        }
    })
}

fn occupancy_of(department: &Department, counts: BedCounts) -> DepartmentOccupancy {
    DepartmentOccupancy {
        department_id: department.id,
        name: department.name.clone(),
        capacity: department.capacity,
        current_load: department.current_load,
        total_beds: counts.total,
        available_beds: counts.available,
        occupied_beds: counts.occupied(),
        utilization: if counts.total > 0 {
            counts.occupied() as f64 / counts.total as f64
        } else {
            0.0
        },
    }
}

#[derive(Clone)]
pub struct BedAllocator {
    store: Arc<dyn CapacityStore>,
    feed: ChangeFeed,
    activity: ActivityLog,
}

impl BedAllocator {
    pub fn new(store: Arc<dyn CapacityStore>, feed: ChangeFeed) -> Self {
        let activity = ActivityLog::new(store.clone());
        Self {
            store,
            feed,
            activity,
        }
    }

    async fn require_department(&self, id: Uuid) -> AppResult<Department> {
        self.store
            .get_department(id)
            .await?
            .ok_or(AppError::DepartmentNotFound(id))
    }

    // -------------------------------------------------------------------------
    // ASSIGN / RELEASE
    // -------------------------------------------------------------------------

    /// Claim a free bed in the department for the patient.
    ///
    /// On failure nothing has been mutated. A full department yields
    /// `CapacityExceeded` carrying ranked alternatives; a department with no
    /// beds at all yields `NoBedsConfigured`.
    pub async fn assign_bed(
        &self,
        patient_id: &str,
        department_id: Uuid,
        actor: &str,
    ) -> AppResult<BedAssignment> {
        let department = self.require_department(department_id).await?;

        let start = Instant::now();
        let claimed = self
            .store
            .claim_available_bed(department_id, patient_id, Utc::now())
            .await?;
        metrics::record_store_operation("claim_bed", start.elapsed().as_secs_f64());

        if let Some(bed) = claimed {
            tracing::info!(
                patient_id,
                department = %department.name,
                bed_number = %bed.bed_number,
                "Bed assigned"
            );
            metrics::record_bed_assignment(&department.name, "assigned");
            self.publish_bed(&bed);
            self.feed.publish(ChangeEvent::PatientChanged {
                patient_id: patient_id.to_string(),
            });
            self.activity
                .record_best_effort(
                    ActivityKind::BedAssigned,
                    format!(
                        "Bed {} in {} assigned to patient {}",
                        bed.bed_number, department.name, patient_id
                    ),
                    actor,
                )
                .await;
            return Ok(BedAssignment::from(&bed));
        }

        let counts = self
            .store
            .bed_counts()
            .await?
            .get(&department_id)
            .copied()
            .unwrap_or_default();

        if counts.total == 0 {
            metrics::record_bed_assignment(&department.name, "no_beds");
            return Err(AppError::NoBedsConfigured {
                department: department.name,
            });
        }

        let suggestions = self.find_alternatives(department_id).await?;
        metrics::record_bed_assignment(&department.name, "capacity_exceeded");
        tracing::info!(
            patient_id,
            department = %department.name,
            occupied = counts.occupied(),
            total = counts.total,
            suggestions = suggestions.len(),
            "Department full"
        );

        Err(AppError::CapacityExceeded {
            department: department.name,
            occupied: counts.occupied(),
            total: counts.total,
            suggestions,
        })
    }

    /// Mark the bed available. Clearing the occupant's patient record is up
    /// to the caller.
    pub async fn release_bed(&self, bed_id: Uuid, actor: &str) -> AppResult<Bed> {
        let bed = self.store.release_bed(bed_id).await?;
        tracing::info!(bed_number = %bed.bed_number, "Bed released");
        self.publish_bed(&bed);
        self.activity
            .record_best_effort(
                ActivityKind::BedReleased,
                format!("Bed {} released", bed.bed_number),
                actor,
            )
            .await;
        Ok(bed)
    }

    /// Mark the bed available and clear its occupant's bed fields in the same
    /// store transaction. Returns the occupant as updated.
    pub async fn vacate_bed(&self, bed_id: Uuid, actor: &str) -> AppResult<(Bed, Option<Patient>)> {
        let (bed, occupant) = self.store.vacate_bed(bed_id).await?;
        tracing::info!(
            bed_number = %bed.bed_number,
            patient_id = occupant.as_ref().map(|p| p.id.as_str()),
            "Bed vacated"
        );
        self.publish_bed(&bed);
        if let Some(patient) = &occupant {
            self.feed.publish(ChangeEvent::PatientChanged {
                patient_id: patient.id.clone(),
            });
        }
        self.activity
            .record_best_effort(
                ActivityKind::BedReleased,
                format!("Bed {} released", bed.bed_number),
                actor,
            )
            .await;
        Ok((bed, occupant))
    }

    // -------------------------------------------------------------------------
    // ALTERNATIVES
    // -------------------------------------------------------------------------

    /// Departments other than `exclude_department_id` with at least one
    /// available bed, least utilized first.
    ///
    /// Availability comes from a live bed count, never from `current_load`.
    pub async fn find_alternatives(
        &self,
        exclude_department_id: Uuid,
    ) -> AppResult<Vec<DepartmentAlternative>> {
        let departments = self.store.list_departments().await?;
        let counts = self.store.bed_counts().await?;

        let mut alternatives: Vec<DepartmentAlternative> = departments
            .iter()
            .filter(|d| d.id != exclude_department_id)
            .filter_map(|d| {
                let c = counts.get(&d.id).copied().unwrap_or_default();
                (c.available >= 1).then(|| DepartmentAlternative {
                    department_id: d.id,
                    name: d.name.clone(),
                    available_beds: c.available,
                    utilization: utilization(d, c),
                })
            })
            .collect();

        alternatives.sort_by(|a, b| a.utilization.total_cmp(&b.utilization));
        Ok(alternatives)
    }

    // -------------------------------------------------------------------------
    // BED SHIFT
    // -------------------------------------------------------------------------

    /// Available beds in other departments that could be moved into
    /// `target_department_id`, from the least utilized donor first.
    pub async fn find_shift_candidates(
        &self,
        target_department_id: Uuid,
    ) -> AppResult<Vec<BedShiftCandidate>> {
        self.require_department(target_department_id).await?;

        let departments: HashMap<Uuid, Department> = self
            .store
            .list_departments()
            .await?
            .into_iter()
            .map(|d| (d.id, d))
            .collect();
        let counts = self.store.bed_counts().await?;

        let mut candidates: Vec<BedShiftCandidate> = self
            .store
            .available_beds_outside(target_department_id)
            .await?
            .into_iter()
            .filter_map(|bed| {
                let donor = departments.get(&bed.department_id)?;
                let c = counts.get(&donor.id).copied().unwrap_or_default();
                Some(BedShiftCandidate {
                    bed_id: bed.id,
                    bed_number: bed.bed_number,
                    department_id: donor.id,
                    department_name: donor.name.clone(),
                    department_utilization: utilization(donor, c),
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.department_utilization
                .total_cmp(&b.department_utilization)
                .then_with(|| a.bed_number.cmp(&b.bed_number))
        });
        Ok(candidates)
    }

    /// Move a free bed from its current department into the target
    /// department and claim it for the patient.
    ///
    /// The move and the claim commit together. If the bed was claimed or
    /// moved by someone else first, this fails with `BedUnavailable` and the
    /// bed stays where it was.
    pub async fn shift_bed(
        &self,
        bed_id: Uuid,
        target_department_id: Uuid,
        patient_id: &str,
        actor: &str,
    ) -> AppResult<BedAssignment> {
        let target = self.require_department(target_department_id).await?;
        let bed = self
            .store
            .get_bed(bed_id)
            .await?
            .ok_or(AppError::BedNotFound(bed_id))?;

        if bed.department_id == target_department_id {
            return Err(AppError::InvalidRequest(format!(
                "bed {} already belongs to {}",
                bed.bed_number, target.name
            )));
        }
        if !bed.is_available() {
            return Err(AppError::BedUnavailable(bed.bed_number));
        }
        let donor = self.require_department(bed.department_id).await?;

        let claimed = self
            .store
            .shift_and_claim_bed(bed_id, donor.id, target.id, patient_id, Utc::now())
            .await?;

        tracing::info!(
            patient_id,
            bed_number = %claimed.bed_number,
            from = %donor.name,
            to = %target.name,
            "Bed shifted"
        );
        metrics::record_bed_shift(&donor.name, &target.name);

        self.feed.publish(ChangeEvent::DepartmentChanged {
            department_id: donor.id,
        });
        self.feed.publish(ChangeEvent::DepartmentChanged {
            department_id: target.id,
        });
        self.publish_bed(&claimed);
        self.feed.publish(ChangeEvent::PatientChanged {
            patient_id: patient_id.to_string(),
        });
        self.activity
            .record_best_effort(
                ActivityKind::BedShifted,
                format!(
                    "Bed {} shifted from {} to {} for patient {}",
                    claimed.bed_number, donor.name, target.name, patient_id
                ),
                actor,
            )
            .await;

        Ok(BedAssignment::from(&claimed))
    }

    // -------------------------------------------------------------------------
    // DEPARTMENTS
    // -------------------------------------------------------------------------

    pub async fn create_department(
        &self,
        request: CreateDepartmentRequest,
        actor: &str,
    ) -> AppResult<Department> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidRequest("department name is required".into()));
        }
        if request.beds > MAX_BEDS_PER_REQUEST {
            return Err(AppError::InvalidRequest(format!(
                "at most {} beds can be created at once",
                MAX_BEDS_PER_REQUEST
            )));
        }
        let code = request
            .code
            .as_deref()
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| department_code(name));

        let department = self
            .store
            .insert_department(Department::new(name, code, 0))
            .await?;
        if request.beds > 0 {
            self.store.add_beds(department.id, request.beds).await?;
        }
        let department = self.require_department(department.id).await?;

        tracing::info!(
            department_id = %department.id,
            name = %department.name,
            beds = request.beds,
            "Department created"
        );
        self.feed.publish(ChangeEvent::DepartmentChanged {
            department_id: department.id,
        });
        self.activity
            .record_best_effort(
                ActivityKind::DepartmentCreated,
                format!(
                    "Department {} created with {} beds",
                    department.name, request.beds
                ),
                actor,
            )
            .await;
        Ok(department)
    }

    /// Bulk-create beds numbered after the department's highest bed
    pub async fn add_beds(&self, department_id: Uuid, count: u32, actor: &str) -> AppResult<Vec<Bed>> {
        if count == 0 || count > MAX_BEDS_PER_REQUEST {
            return Err(AppError::InvalidRequest(format!(
                "bed count must be between 1 and {}",
                MAX_BEDS_PER_REQUEST
            )));
        }
        let department = self.require_department(department_id).await?;
        let beds = self.store.add_beds(department_id, count).await?;

        tracing::info!(department = %department.name, count, "Beds added");
        self.feed.publish(ChangeEvent::DepartmentChanged { department_id });
        self.activity
            .record_best_effort(
                ActivityKind::BedsAdded,
                format!("{} beds added to {}", count, department.name),
                actor,
            )
            .await;
        Ok(beds)
    }

    pub async fn list_beds(&self, department_id: Uuid) -> AppResult<Vec<Bed>> {
        self.require_department(department_id).await?;
        self.store.list_beds(department_id).await
    }

    pub async fn occupancy(&self, department_id: Uuid) -> AppResult<DepartmentOccupancy> {
        let department = self.require_department(department_id).await?;
        let counts = self
            .store
            .bed_counts()
            .await?
            .get(&department_id)
            .copied()
            .unwrap_or_default();
        let occupancy = occupancy_of(&department, counts);
        metrics::set_occupancy(&occupancy);
        Ok(occupancy)
    }

    /// Every department with live bed counts, ordered by name
    pub async fn list_occupancy(&self) -> AppResult<Vec<DepartmentOccupancy>> {
        let departments = self.store.list_departments().await?;
        let counts = self.store.bed_counts().await?;
        let summaries: Vec<DepartmentOccupancy> = departments
            .iter()
            .map(|d| occupancy_of(d, counts.get(&d.id).copied().unwrap_or_default()))
            .collect();
        for occupancy in &summaries {
            metrics::set_occupancy(occupancy);
        }
        Ok(summaries)
    }

    fn publish_bed(&self, bed: &Bed) {
        self.feed.publish(ChangeEvent::BedChanged {
            bed_id: bed.id,
            department_id: bed.department_id,
        });
    }
}
