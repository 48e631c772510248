// =============================================================================
// DEPARTMENT RESOURCE LEDGER
// =============================================================================
// Equipment and supplies per department, tracked as quantity / available /
// in_use. Transfers move ownership between departments; allocations move
// units between available and in_use inside one department for one patient.
//
// Each operation validates its input here, then hands the whole
// read-modify-write to a single store call so concurrent operations on the
// same entry can't lose updates.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::audit::ActivityLog;
use crate::error::{AppError, AppResult};
use crate::feed::{ChangeEvent, ChangeFeed};
use crate::ledger::{validate_key, validate_quantity};
use crate::metrics;
use crate::models::{
    ActivityKind, AllocationRecord, AllocationStatus, Deallocation, DeallocationResult,
    Department, LedgerEdit, LedgerEntry, ResourceAllocationRequest, ResourceTransferRecord,
    ResourceTransferRequest, ResourceType,
};
use crate::store::CapacityStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferReceipt {
    pub record: ResourceTransferRecord,
    pub source: LedgerEntry,
    pub destination: LedgerEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationReceipt {
    pub record: AllocationRecord,
    pub entry: LedgerEntry,
}

#[derive(Clone)]
pub struct ResourceLedger {
    store: Arc<dyn CapacityStore>,
    feed: ChangeFeed,
    activity: ActivityLog,
}

impl ResourceLedger {
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

    fn published(&self, entry: &LedgerEntry) {
        metrics::set_ledger_level(entry);
        self.feed.publish(ChangeEvent::LedgerChanged {
            department_id: entry.department_id,
        });
    }

    // -------------------------------------------------------------------------
    // TRANSFER
    // -------------------------------------------------------------------------

    /// Permanently move idle units from one department to another.
    ///
    /// The source loses ownership (quantity and available both drop). The
    /// destination entry is created when missing.
    pub async fn transfer(
        &self,
        request: ResourceTransferRequest,
        actor: &str,
    ) -> AppResult<TransferReceipt> {
        if request.from_department_id == request.to_department_id {
            return Err(AppError::InvalidRequest(
                "source and destination departments must differ".into(),
            ));
        }
        validate_key(&request.resource_key)?;
        validate_quantity(request.quantity)?;
        if request.reason.trim().is_empty() {
            return Err(AppError::InvalidRequest("reason is required".into()));
        }

        let record = ResourceTransferRecord {
            id: Uuid::new_v4(),
            from_department_id: request.from_department_id,
            to_department_id: request.to_department_id,
            resource_type: request.resource_type,
            resource_key: request.resource_key,
            quantity: request.quantity,
            reason: request.reason,
            actor: actor.to_string(),
            created_at: Utc::now(),
        };

        let start = Instant::now();
        let result = self.store.transfer_resource(&record).await;
        metrics::record_store_operation("transfer_resource", start.elapsed().as_secs_f64());
        metrics::record_ledger_operation("transfer", result.is_ok());
        let (source, destination) = result?;

        tracing::info!(
            resource_key = %record.resource_key,
            quantity = record.quantity,
            from = %record.from_department_id,
            to = %record.to_department_id,
            "Resource transferred"
        );
        self.published(&source);
        self.published(&destination);
        self.activity
            .record_best_effort(
                ActivityKind::ResourceTransferred,
                format!(
                    "Transferred {} {} to another department: {}",
                    record.quantity, source.name, record.reason
                ),
                actor,
            )
            .await;

        Ok(TransferReceipt {
            record,
            source,
            destination,
        })
    }

    // -------------------------------------------------------------------------
    // ALLOCATE / DEALLOCATE
    // -------------------------------------------------------------------------

    /// Put idle units to use for a patient in the same department
    pub async fn allocate(
        &self,
        request: ResourceAllocationRequest,
        actor: &str,
    ) -> AppResult<AllocationReceipt> {
        validate_key(&request.resource_key)?;
        validate_quantity(request.quantity)?;

        let patient = self
            .store
            .get_patient(&request.patient_id)
            .await?
            .ok_or_else(|| AppError::PatientNotFound(request.patient_id.clone()))?;
        if !patient.status.is_admitted() {
            return Err(AppError::InvalidRequest(format!(
                "patient {} is discharged",
                patient.id
            )));
        }

        let record = AllocationRecord {
            id: Uuid::new_v4(),
            patient_id: request.patient_id,
            department_id: request.department_id,
            resource_type: request.resource_type,
            resource_key: request.resource_key,
            quantity: request.quantity,
            actor: actor.to_string(),
            status: AllocationStatus::Allocated,
            allocated_at: Utc::now(),
            deallocated_at: None,
        };

        let result = self.store.allocate_resource(&record).await;
        metrics::record_ledger_operation("allocate", result.is_ok());
        let entry = result?;

        tracing::info!(
            patient_id = %record.patient_id,
            resource_key = %record.resource_key,
            quantity = record.quantity,
            "Resource allocated"
        );
        self.published(&entry);
        self.activity
            .record_best_effort(
                ActivityKind::ResourceAllocated,
                format!(
                    "Allocated {} {} to patient {}",
                    record.quantity, entry.name, record.patient_id
                ),
                actor,
            )
            .await;

        Ok(AllocationReceipt { record, entry })
    }

    /// Return units from a patient to the pool.
    ///
    /// Asking for more than is in use releases only what is in use; the
    /// result reports both numbers.
    pub async fn deallocate(
        &self,
        request: ResourceAllocationRequest,
        actor: &str,
    ) -> AppResult<DeallocationResult> {
        validate_key(&request.resource_key)?;
        validate_quantity(request.quantity)?;
        self.deallocate_units(
            &request.patient_id,
            request.department_id,
            request.resource_type,
            request.resource_key,
            request.quantity,
            actor,
        )
        .await
    }

    async fn deallocate_units(
        &self,
        patient_id: &str,
        department_id: Uuid,
        resource_type: ResourceType,
        resource_key: String,
        quantity: i32,
        actor: &str,
    ) -> AppResult<DeallocationResult> {
        let request = Deallocation {
            patient_id: patient_id.to_string(),
            department_id,
            resource_type,
            resource_key,
            quantity,
            at: Utc::now(),
        };

        let result = self.store.deallocate_resource(&request).await;
        metrics::record_ledger_operation("deallocate", result.is_ok());
        let result = result?;

        if result.released < result.requested {
            tracing::warn!(
                patient_id,
                resource_key = %request.resource_key,
                requested = result.requested,
                held = result.held,
                released = result.released,
                "Deallocation clamped to units the patient holds"
            );
        }
        tracing::info!(
            patient_id,
            resource_key = %request.resource_key,
            released = result.released,
            "Resource deallocated"
        );
        self.published(&result.entry);
        self.activity
            .record_best_effort(
                ActivityKind::ResourceDeallocated,
                format!(
                    "Returned {} {} from patient {}",
                    result.released, result.entry.name, patient_id
                ),
                actor,
            )
            .await;

        Ok(result)
    }

    /// Return everything the patient still holds in the department.
    ///
    /// Every resource is attempted even if an earlier one fails; the first
    /// failure is returned afterwards.
    pub async fn deallocate_all(
        &self,
        patient_id: &str,
        department_id: Uuid,
        actor: &str,
    ) -> AppResult<Vec<DeallocationResult>> {
        let open = self
            .store
            .list_allocations(patient_id, Some(department_id), Some(AllocationStatus::Allocated))
            .await?;

        // One deallocation per resource, summing its open records
        let mut totals: Vec<(ResourceType, String, i32)> = Vec::new();
        for record in open {
            match totals
                .iter_mut()
                .find(|(t, k, _)| *t == record.resource_type && *k == record.resource_key)
            {
                Some((_, _, quantity)) => *quantity += record.quantity,
                None => totals.push((record.resource_type, record.resource_key, record.quantity)),
            }
        }

        let mut results = Vec::with_capacity(totals.len());
        let mut first_error = None;
        for (resource_type, resource_key, quantity) in totals {
            let key = resource_key.clone();
            match self
                .deallocate_units(patient_id, department_id, resource_type, resource_key, quantity, actor)
                .await
            {
                Ok(result) => results.push(result),
                Err(e) => {
                    tracing::warn!(patient_id, resource_key = %key, error = %e, "Deallocation failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    // -------------------------------------------------------------------------
    // OPERATOR EDITS AND QUERIES
    // -------------------------------------------------------------------------

    /// Set owned quantities in bulk; creates missing entries
    pub async fn edit_ledger(
        &self,
        department_id: Uuid,
        edits: Vec<LedgerEdit>,
        actor: &str,
    ) -> AppResult<Vec<LedgerEntry>> {
        if edits.is_empty() {
            return Err(AppError::InvalidRequest("no ledger entries given".into()));
        }
        let mut seen = HashSet::new();
        for edit in &edits {
            if !seen.insert((edit.resource_type, edit.resource_key.as_str())) {
                return Err(AppError::InvalidRequest(format!(
                    "{} listed more than once",
                    edit.resource_key
                )));
            }
        }
        let department = self.require_department(department_id).await?;

        let result = self
            .store
            .apply_ledger_edits(department_id, &edits, Utc::now())
            .await;
        metrics::record_ledger_operation("edit", result.is_ok());
        let entries = result?;

        tracing::info!(department = %department.name, entries = entries.len(), "Ledger updated");
        for entry in &entries {
            metrics::set_ledger_level(entry);
        }
        self.feed.publish(ChangeEvent::LedgerChanged { department_id });
        self.activity
            .record_best_effort(
                ActivityKind::LedgerUpdated,
                format!("{} ledger entries updated in {}", entries.len(), department.name),
                actor,
            )
            .await;
        Ok(entries)
    }

    pub async fn get_ledger(&self, department_id: Uuid) -> AppResult<Vec<LedgerEntry>> {
        self.require_department(department_id).await?;
        self.store.get_ledger(department_id).await
    }

    pub async fn list_transfers(&self, department_id: Uuid) -> AppResult<Vec<ResourceTransferRecord>> {
        self.require_department(department_id).await?;
        self.store.list_transfers(department_id).await
    }

    pub async fn list_allocations(
        &self,
        patient_id: &str,
        status: Option<AllocationStatus>,
    ) -> AppResult<Vec<AllocationRecord>> {
        self.store.list_allocations(patient_id, None, status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Patient, PatientStatus, Priority};
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        ledger: ResourceLedger,
        icu: Department,
        er: Department,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let icu = store
            .insert_department(Department::new("ICU", "ICU", 0))
            .await
            .unwrap();
        let er = store
            .insert_department(Department::new("Emergency", "ER", 0))
            .await
            .unwrap();
        store
            .insert_patient(Patient {
                id: "PT-A".into(),
                name: "A".into(),
                department_id: icu.id,
                bed_id: None,
                bed_number: None,
                status: PatientStatus::Active,
                priority: Priority::High,
                admitted_at: Utc::now(),
                discharged_at: None,
            })
            .await
            .unwrap();

        let ledger = ResourceLedger::new(store.clone(), ChangeFeed::default());
        ledger
            .edit_ledger(
                icu.id,
                vec![LedgerEdit {
                    resource_type: ResourceType::Equipment,
                    resource_key: "ventilator".into(),
                    name: "Ventilator".into(),
                    quantity: 5,
                }],
                "ops",
            )
            .await
            .unwrap();

        Fixture {
            store,
            ledger,
            icu,
            er,
        }
    }

    fn transfer(from: Uuid, to: Uuid, quantity: i32) -> ResourceTransferRequest {
        ResourceTransferRequest {
            from_department_id: from,
            to_department_id: to,
            resource_type: ResourceType::Equipment,
            resource_key: "ventilator".into(),
            quantity,
            reason: "surge".into(),
        }
    }

    fn ventilators(department_id: Uuid, quantity: i32) -> ResourceAllocationRequest {
        ResourceAllocationRequest {
            patient_id: "PT-A".into(),
            department_id,
            resource_type: ResourceType::Equipment,
            resource_key: "ventilator".into(),
            quantity,
        }
    }

    #[tokio::test]
    async fn transfer_moves_ownership_and_records_it() {
        let f = fixture().await;
        let receipt = f
            .ledger
            .transfer(transfer(f.icu.id, f.er.id, 3), "ops")
            .await
            .unwrap();

        assert_eq!((receipt.source.quantity, receipt.source.available), (2, 2));
        assert_eq!(
            (receipt.destination.quantity, receipt.destination.available),
            (3, 3)
        );
        assert_eq!(receipt.destination.name, "Ventilator");

        let history = f.ledger.list_transfers(f.er.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].actor, "ops");
    }

    #[tokio::test]
    async fn transfer_validation() {
        let f = fixture().await;

        let same = f.ledger.transfer(transfer(f.icu.id, f.icu.id, 1), "ops").await;
        assert!(matches!(same, Err(AppError::InvalidRequest(_))));

        let mut no_reason = transfer(f.icu.id, f.er.id, 1);
        no_reason.reason = " ".into();
        assert!(matches!(
            f.ledger.transfer(no_reason, "ops").await,
            Err(AppError::InvalidRequest(_))
        ));

        let missing = f.ledger.transfer(transfer(f.er.id, f.icu.id, 1), "ops").await;
        assert!(matches!(missing, Err(AppError::ResourceNotFound(_))));

        let too_many = f.ledger.transfer(transfer(f.icu.id, f.er.id, 6), "ops").await;
        assert!(matches!(
            too_many,
            Err(AppError::InsufficientAvailable {
                available: 5,
                requested: 6
            })
        ));
    }

    #[tokio::test]
    async fn allocation_only_uses_idle_units() {
        let f = fixture().await;
        let receipt = f.ledger.allocate(ventilators(f.icu.id, 4), "nurse").await.unwrap();
        assert_eq!((receipt.entry.available, receipt.entry.in_use), (1, 4));

        let err = f
            .ledger
            .transfer(transfer(f.icu.id, f.er.id, 2), "ops")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InsufficientAvailable { .. }));
    }

    #[tokio::test]
    async fn deallocate_clamps_and_closes_records() {
        let f = fixture().await;
        f.ledger.allocate(ventilators(f.icu.id, 1), "nurse").await.unwrap();

        let result = f
            .ledger
            .deallocate(ventilators(f.icu.id, 3), "nurse")
            .await
            .unwrap();
        assert_eq!((result.requested, result.released), (3, 1));
        assert_eq!((result.entry.available, result.entry.in_use), (5, 0));
        assert_eq!(result.records_closed, 1);
    }

    /// Second ICU patient holding `quantity` ventilators
    async fn patient_b_holding(f: &Fixture, quantity: i32) {
        let mut b = f.store.get_patient("PT-A").await.unwrap().unwrap();
        b.id = "PT-B".into();
        b.name = "B".into();
        f.store.insert_patient(b).await.unwrap();

        let mut request = ventilators(f.icu.id, quantity);
        request.patient_id = "PT-B".into();
        f.ledger.allocate(request, "nurse").await.unwrap();
    }

    #[tokio::test]
    async fn deallocate_never_releases_another_patients_units() {
        let f = fixture().await;
        f.ledger.allocate(ventilators(f.icu.id, 1), "nurse").await.unwrap();
        patient_b_holding(&f, 2).await;

        let result = f
            .ledger
            .deallocate(ventilators(f.icu.id, 3), "nurse")
            .await
            .unwrap();
        assert_eq!((result.requested, result.held, result.released), (3, 1, 1));
        assert_eq!((result.entry.available, result.entry.in_use), (3, 2));

        let b_open = f
            .ledger
            .list_allocations("PT-B", Some(AllocationStatus::Allocated))
            .await
            .unwrap();
        assert_eq!(b_open.len(), 1);
        assert_eq!(b_open[0].quantity, 2);
    }

    #[tokio::test]
    async fn deallocate_without_holdings_releases_nothing() {
        let f = fixture().await;
        patient_b_holding(&f, 2).await;

        let result = f
            .ledger
            .deallocate(ventilators(f.icu.id, 1), "nurse")
            .await
            .unwrap();
        assert_eq!((result.held, result.released), (0, 0));
        assert_eq!((result.entry.available, result.entry.in_use), (3, 2));
    }

    #[tokio::test]
    async fn deallocate_all_leaves_nothing_allocated() {
        let f = fixture().await;
        f.ledger.allocate(ventilators(f.icu.id, 1), "nurse").await.unwrap();
        f.ledger.allocate(ventilators(f.icu.id, 2), "nurse").await.unwrap();

        let results = f.ledger.deallocate_all("PT-A", f.icu.id, "nurse").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].released, 3);
        assert_eq!(results[0].records_closed, 2);

        let open = f
            .ledger
            .list_allocations("PT-A", Some(AllocationStatus::Allocated))
            .await
            .unwrap();
        assert!(open.is_empty());
        let entry = f
            .store
            .get_ledger_entry(f.icu.id, ResourceType::Equipment, "ventilator")
            .await
            .unwrap()
            .unwrap();
        assert_eq!((entry.available, entry.in_use, entry.quantity), (5, 0, 5));
    }

    #[tokio::test]
    async fn allocation_requires_an_admitted_patient() {
        let f = fixture().await;
        let mut request = ventilators(f.icu.id, 1);
        request.patient_id = "PT-NOBODY".into();
        assert!(matches!(
            f.ledger.allocate(request, "nurse").await,
            Err(AppError::PatientNotFound(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_edit_lines_are_rejected() {
        let f = fixture().await;
        let line = LedgerEdit {
            resource_type: ResourceType::Supply,
            resource_key: "iv_kit".into(),
            name: "IV Kit".into(),
            quantity: 10,
        };
        let err = f
            .ledger
            .edit_ledger(f.er.id, vec![line.clone(), line], "ops")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
        assert!(f.ledger.get_ledger(f.er.id).await.unwrap().is_empty());
    }
}
