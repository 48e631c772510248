// =============================================================================
// ADMISSION / DISCHARGE ORCHESTRATOR
// =============================================================================
// Composes bed allocation, the resource ledger and the external
// collaborators into the patient lifecycle:
//
//   unadmitted -> active (no bed) -> active (bed) -> discharged | transferred
//
// Each flow has one primary step whose failure is returned as an error. Every
// other step (load counters, vitals, billing, assessment, cleanup, activity
// log) runs regardless and is reported in the outcome's `steps`.
//
// LOAD ACCOUNTING:
// A patient counts against their department's `current_load` once they have
// been placed in a bed there, or once they have been transferred in.
// =============================================================================

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::audit::ActivityLog;
use crate::beds::BedAllocator;
use crate::collaborators::{AssessmentService, BillingService};
use crate::error::{AppError, AppResult};
use crate::feed::{ChangeEvent, ChangeFeed};
use crate::metrics;
use crate::models::{
    format_patient_id, ActivityKind, AdmissionOutcome, AdmitPatientRequest, AllocationStatus,
    Bed, BedAssignment, Department, DischargeOutcome, DischargeRequest, Patient, PatientStatus,
    PatientUpdate, Placement, Step, StepReport, TransferOutcome, VitalsRecord,
};
use crate::resources::ResourceLedger;
use crate::store::CapacityStore;

fn counts_against_load(patient: &Patient) -> bool {
    patient.bed_id.is_some() || patient.status == PatientStatus::Transferred
}

/// Turn an allocation failure into an unplaced outcome the caller can act on
fn unplaced(error: AppError) -> Placement {
    let code = error.code().to_string();
    let message = error.to_string();
    let suggestions = match error {
        AppError::CapacityExceeded { suggestions, .. } => suggestions,
        _ => Vec::new(),
    };
    Placement::Unplaced {
        error: code,
        message,
        suggestions,
    }
}

/// Collects secondary step results
#[derive(Default)]
struct Steps(Vec<StepReport>);

impl Steps {
    fn record<T>(&mut self, step: Step, patient_id: &str, result: AppResult<T>) -> Option<T> {
        match result {
            Ok(value) => {
                self.0.push(StepReport {
                    step,
                    ok: true,
                    error: None,
                });
                Some(value)
            }
            Err(e) => {
                tracing::warn!(patient_id, step = ?step, error = %e, "Step failed, continuing");
                metrics::record_step_failure(step);
                self.0.push(StepReport {
                    step,
                    ok: false,
                    error: Some(e.to_string()),
                });
                None
            }
        }
    }
}

#[derive(Clone)]
pub struct AdmissionService {
    store: Arc<dyn CapacityStore>,
    beds: BedAllocator,
    resources: ResourceLedger,
    billing: Arc<dyn BillingService>,
    assessment: Arc<dyn AssessmentService>,
    feed: ChangeFeed,
    activity: ActivityLog,
}

impl AdmissionService {
    pub fn new(
        store: Arc<dyn CapacityStore>,
        beds: BedAllocator,
        resources: ResourceLedger,
        billing: Arc<dyn BillingService>,
        assessment: Arc<dyn AssessmentService>,
        feed: ChangeFeed,
    ) -> Self {
        let activity = ActivityLog::new(store.clone());
        Self {
            store,
            beds,
            resources,
            billing,
            assessment,
            feed,
            activity,
        }
    }

    pub async fn get_patient(&self, patient_id: &str) -> AppResult<Patient> {
        self.store
            .get_patient(patient_id)
            .await?
            .ok_or_else(|| AppError::PatientNotFound(patient_id.to_string()))
    }

    async fn require_department(&self, id: Uuid) -> AppResult<Department> {
        self.store
            .get_department(id)
            .await?
            .ok_or(AppError::DepartmentNotFound(id))
    }

    /// Patient admitted or transferred in, still waiting for a bed
    async fn require_unplaced(&self, patient_id: &str) -> AppResult<Patient> {
        let patient = self.get_patient(patient_id).await?;
        if !patient.status.is_admitted() {
            return Err(AppError::InvalidRequest(format!(
                "patient {} is {}",
                patient.id, patient.status
            )));
        }
        if let Some(bed_number) = &patient.bed_number {
            return Err(AppError::InvalidRequest(format!(
                "patient {} already holds bed {}",
                patient.id, bed_number
            )));
        }
        Ok(patient)
    }

    // -------------------------------------------------------------------------
    // ADMISSION
    // -------------------------------------------------------------------------

    /// Register a new patient and try to place them in the requested
    /// department.
    ///
    /// A full department is not an error: the patient is created and the
    /// outcome is `Unplaced` with suggestions, so the caller can follow up
    /// with `admit_to_alternative` or `admit_with_bed_shift`.
    pub async fn admit(&self, request: AdmitPatientRequest, actor: &str) -> AppResult<AdmissionOutcome> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(AppError::InvalidRequest("patient name is required".into()));
        }
        let department = self.require_department(request.department_id).await?;

        let now = Utc::now();
        let sequence = self.store.next_patient_sequence(now.date_naive()).await?;
        let patient = self
            .store
            .insert_patient(Patient {
                id: format_patient_id(now.date_naive(), sequence),
                name: name.to_string(),
                department_id: department.id,
                bed_id: None,
                bed_number: None,
                status: PatientStatus::Active,
                priority: request.priority,
                admitted_at: now,
                discharged_at: None,
            })
            .await?;

        tracing::info!(
            patient_id = %patient.id,
            department = %department.name,
            priority = %patient.priority,
            "Patient admitted"
        );
        self.feed.publish(ChangeEvent::PatientChanged {
            patient_id: patient.id.clone(),
        });

        let mut steps = Steps::default();
        steps.record(
            Step::ActivityLog,
            &patient.id,
            self.activity
                .record(
                    ActivityKind::PatientAdmitted,
                    format!("Patient {} admitted to {}", patient.id, department.name),
                    actor,
                )
                .await,
        );

        let placement = match self.beds.assign_bed(&patient.id, department.id, actor).await {
            Ok(assignment) => {
                self.after_placement(&patient, &assignment, &mut steps).await;
                Placement::Assigned(assignment)
            }
            Err(e @ (AppError::CapacityExceeded { .. } | AppError::NoBedsConfigured { .. })) => {
                unplaced(e)
            }
            Err(e) => return Err(e),
        };

        Ok(AdmissionOutcome {
            patient: self.get_patient(&patient.id).await?,
            placement,
            steps: steps.0,
        })
    }

    /// Retry placement for an unplaced patient in a department the caller
    /// picked from the suggestions.
    pub async fn admit_to_alternative(
        &self,
        patient_id: &str,
        department_id: Uuid,
        actor: &str,
    ) -> AppResult<AdmissionOutcome> {
        let patient = self.require_unplaced(patient_id).await?;
        self.require_department(department_id).await?;

        let mut steps = Steps::default();
        let placement = match self.beds.assign_bed(&patient.id, department_id, actor).await {
            Ok(assignment) => {
                self.after_placement(&patient, &assignment, &mut steps).await;
                Placement::Assigned(assignment)
            }
            Err(e @ (AppError::CapacityExceeded { .. } | AppError::NoBedsConfigured { .. })) => {
                unplaced(e)
            }
            Err(e) => return Err(e),
        };

        Ok(AdmissionOutcome {
            patient: self.get_patient(&patient.id).await?,
            placement,
            steps: steps.0,
        })
    }

    /// Place an unplaced patient in their requested department by moving a
    /// free bed in from another department.
    pub async fn admit_with_bed_shift(
        &self,
        patient_id: &str,
        bed_id: Uuid,
        actor: &str,
    ) -> AppResult<AdmissionOutcome> {
        let patient = self.require_unplaced(patient_id).await?;

        let assignment = self
            .beds
            .shift_bed(bed_id, patient.department_id, &patient.id, actor)
            .await?;

        let mut steps = Steps::default();
        self.after_placement(&patient, &assignment, &mut steps).await;

        Ok(AdmissionOutcome {
            patient: self.get_patient(&patient.id).await?,
            placement: Placement::Assigned(assignment),
            steps: steps.0,
        })
    }

    /// Bookkeeping once a bed is claimed: load, vitals, assessment, billing.
    ///
    /// `before` is the patient as read before the claim. A transferred patient
    /// already counts against their department and is already billed, so they
    /// only move load and billing when the bed is in another department.
    async fn after_placement(&self, before: &Patient, assignment: &BedAssignment, steps: &mut Steps) {
        let patient_id = before.id.as_str();
        let department_id = assignment.department_id;
        let counted = counts_against_load(before);
        let moved = before.department_id != department_id;

        if counted && moved {
            steps.record(
                Step::PreviousDepartmentLoad,
                patient_id,
                self.store
                    .adjust_department_load(before.department_id, -1)
                    .await,
            );
            self.feed.publish(ChangeEvent::DepartmentChanged {
                department_id: before.department_id,
            });
        }
        if !counted || moved {
            steps.record(
                Step::DepartmentLoad,
                patient_id,
                self.store.adjust_department_load(department_id, 1).await,
            );
            self.feed
                .publish(ChangeEvent::DepartmentChanged { department_id });
        }

        let vitals = VitalsRecord {
            id: Uuid::new_v4(),
            patient_id: patient_id.to_string(),
            recorded_at: Utc::now(),
        };
        steps.record(
            Step::VitalsRecord,
            patient_id,
            self.store.insert_vitals(vitals).await,
        );

        // Fire and forget; the report only says the request was dispatched
        let dispatched = match self.store.get_patient(patient_id).await {
            Ok(Some(patient)) => {
                let assessment = self.assessment.clone();
                tokio::spawn(async move {
                    if let Err(e) = assessment.request_assessment(&patient).await {
                        tracing::warn!(patient_id = %patient.id, error = %e, "Assessment request failed");
                    }
                });
                Ok(())
            }
            Ok(None) => Err(AppError::PatientNotFound(patient_id.to_string())),
            Err(e) => Err(e),
        };
        steps.record(Step::Assessment, patient_id, dispatched);

        if !counted {
            steps.record(
                Step::BillingStart,
                patient_id,
                self.billing
                    .start_patient_billing(patient_id, department_id, Utc::now())
                    .await,
            );
        } else if moved {
            steps.record(
                Step::BillingDepartment,
                patient_id,
                self.billing
                    .update_billing_department(patient_id, department_id)
                    .await,
            );
        }
    }

    // -------------------------------------------------------------------------
    // DEPARTMENT TRANSFER
    // -------------------------------------------------------------------------

    /// Move an admitted patient to another department.
    ///
    /// Moving the patient record is the primary step; the old bed is released
    /// after it, the same order discharge uses. Failing to find a bed in the
    /// target leaves the patient transferred without one, reported in
    /// `placement`.
    pub async fn transfer_department(
        &self,
        patient_id: &str,
        department_id: Uuid,
        actor: &str,
    ) -> AppResult<TransferOutcome> {
        let patient = self.get_patient(patient_id).await?;
        if !patient.status.is_admitted() {
            return Err(AppError::InvalidRequest(format!(
                "patient {} is discharged",
                patient.id
            )));
        }
        if patient.department_id == department_id {
            return Err(AppError::InvalidRequest(format!(
                "patient {} is already in that department",
                patient.id
            )));
        }
        let target = self.require_department(department_id).await?;
        let counted = counts_against_load(&patient);
        let previous_department = patient.department_id;

        self.store
            .update_patient(
                &patient.id,
                &PatientUpdate {
                    department_id: Some(target.id),
                    status: Some(PatientStatus::Transferred),
                    clear_bed: true,
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(
            patient_id = %patient.id,
            from = %previous_department,
            to = %target.name,
            "Patient transferred"
        );
        self.feed.publish(ChangeEvent::PatientChanged {
            patient_id: patient.id.clone(),
        });

        let mut steps = Steps::default();
        if let Some(bed_id) = patient.bed_id {
            steps.record(
                Step::BedRelease,
                &patient.id,
                self.beds.release_bed(bed_id, actor).await,
            );
        }
        if counted {
            steps.record(
                Step::PreviousDepartmentLoad,
                &patient.id,
                self.store
                    .adjust_department_load(previous_department, -1)
                    .await,
            );
            self.feed.publish(ChangeEvent::DepartmentChanged {
                department_id: previous_department,
            });
        }
        steps.record(
            Step::DepartmentLoad,
            &patient.id,
            self.store.adjust_department_load(target.id, 1).await,
        );
        self.feed.publish(ChangeEvent::DepartmentChanged {
            department_id: target.id,
        });

        if counted {
            steps.record(
                Step::BillingDepartment,
                &patient.id,
                self.billing
                    .update_billing_department(&patient.id, target.id)
                    .await,
            );
        } else {
            steps.record(
                Step::BillingStart,
                &patient.id,
                self.billing
                    .start_patient_billing(&patient.id, target.id, Utc::now())
                    .await,
            );
        }

        let placement = match self.beds.assign_bed(&patient.id, target.id, actor).await {
            Ok(assignment) => Placement::Assigned(assignment),
            Err(e) => {
                tracing::warn!(patient_id = %patient.id, error = %e, "No bed after transfer");
                unplaced(e)
            }
        };

        steps.record(
            Step::ActivityLog,
            &patient.id,
            self.activity
                .record(
                    ActivityKind::PatientTransferred,
                    format!("Patient {} transferred to {}", patient.id, target.name),
                    actor,
                )
                .await,
        );

        Ok(TransferOutcome {
            patient: self.get_patient(&patient.id).await?,
            placement,
            steps: steps.0,
        })
    }

    // -------------------------------------------------------------------------
    // BED RELEASE
    // -------------------------------------------------------------------------

    /// Free a bed by hand. The occupant keeps their admission but loses the
    /// bed, and stops counting against their department's load unless they
    /// were transferred in.
    pub async fn release_bed(&self, bed_id: Uuid, actor: &str) -> AppResult<Bed> {
        let (bed, occupant) = self.beds.vacate_bed(bed_id, actor).await?;

        if let Some(patient) = occupant.filter(|p| !counts_against_load(p)) {
            let adjusted = self
                .store
                .adjust_department_load(patient.department_id, -1)
                .await;
            if let Err(e) = adjusted {
                tracing::warn!(patient_id = %patient.id, error = %e, "Load not adjusted after bed release");
                metrics::record_step_failure(Step::DepartmentLoad);
            }
            self.feed.publish(ChangeEvent::DepartmentChanged {
                department_id: patient.department_id,
            });
        }
        Ok(bed)
    }

    // -------------------------------------------------------------------------
    // DISCHARGE
    // -------------------------------------------------------------------------

    /// Discharge a patient.
    ///
    /// Marking the patient discharged is the primary step. Bed release, load,
    /// billing and resource cleanup each run afterwards whatever the others
    /// did, and none of them is rolled back.
    pub async fn discharge(
        &self,
        patient_id: &str,
        request: DischargeRequest,
        actor: &str,
    ) -> AppResult<DischargeOutcome> {
        let patient = self.get_patient(patient_id).await?;
        if !patient.status.is_admitted() {
            return Err(AppError::InvalidRequest(format!(
                "patient {} is already discharged",
                patient.id
            )));
        }
        let counted = counts_against_load(&patient);
        let now = Utc::now();

        let discharged = self
            .store
            .update_patient(
                &patient.id,
                &PatientUpdate {
                    status: Some(PatientStatus::Discharged),
                    discharged_at: Some(now),
                    clear_bed: true,
                    ..Default::default()
                },
            )
            .await?;

        tracing::info!(patient_id = %patient.id, "Patient discharged");
        self.feed.publish(ChangeEvent::PatientChanged {
            patient_id: patient.id.clone(),
        });

        let mut steps = Steps::default();

        let mut released_bed = None;
        if let Some(bed_id) = patient.bed_id {
            released_bed = steps
                .record(
                    Step::BedRelease,
                    &patient.id,
                    self.beds.release_bed(bed_id, actor).await,
                )
                .map(|bed| bed.bed_number);
        }

        if counted {
            steps.record(
                Step::DepartmentLoad,
                &patient.id,
                self.store
                    .adjust_department_load(patient.department_id, -1)
                    .await,
            );
            self.feed.publish(ChangeEvent::DepartmentChanged {
                department_id: patient.department_id,
            });
        }

        steps.record(
            Step::BillingStop,
            &patient.id,
            self.billing
                .stop_patient_billing(
                    &patient.id,
                    now,
                    request.payment_status.as_deref(),
                    request.notes.as_deref(),
                )
                .await,
        );

        let deallocated_records = steps
            .record(
                Step::ResourceDeallocation,
                &patient.id,
                self.release_all_resources(&patient.id, actor).await,
            )
            .unwrap_or(0);

        steps.record(
            Step::ActivityLog,
            &patient.id,
            self.activity
                .record(
                    ActivityKind::PatientDischarged,
                    format!("Patient {} discharged", patient.id),
                    actor,
                )
                .await,
        );

        Ok(DischargeOutcome {
            patient: discharged,
            released_bed,
            deallocated_records,
            steps: steps.0,
        })
    }

    /// `deallocate_all` for every department the patient holds units in.
    /// Returns the number of allocation records closed.
    async fn release_all_resources(&self, patient_id: &str, actor: &str) -> AppResult<usize> {
        let departments: BTreeSet<Uuid> = self
            .store
            .list_allocations(patient_id, None, Some(AllocationStatus::Allocated))
            .await?
            .into_iter()
            .map(|record| record.department_id)
            .collect();

        let mut closed = 0;
        let mut first_error = None;
        for department_id in departments {
            match self
                .resources
                .deallocate_all(patient_id, department_id, actor)
                .await
            {
                Ok(results) => closed += results.iter().map(|r| r.records_closed).sum::<usize>(),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(closed),
        }
    }
}
