// =============================================================================
// MODELS MODULE
// =============================================================================
// Typed records for every persisted entity, explicit update structs, and the
// request/response shapes of the HTTP API.
//
// Entities:
// - Department       capacity and current load
// - Bed              exclusive occupancy, owned by exactly one department
// - Patient          admission state and bed assignment
// - LedgerEntry      quantity / available / in_use per department resource
// - ResourceTransferRecord, AllocationRecord, Activity   audit trail
// =============================================================================

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

// -----------------------------------------------------------------------------
// ENUM <-> TEXT COLUMNS
// -----------------------------------------------------------------------------
// Enums are stored as lowercase text. This macro generates `as_str`,
// `Display` and `FromStr` so both store backends share one spelling.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(AppError::Internal(format!(
                        "unknown {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

// =============================================================================
// DEPARTMENT
// =============================================================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Department {
    pub id: Uuid,

    /// Display name, e.g. "ICU"
    pub name: String,

    /// Short uppercase code used as the bed number prefix, e.g. "ICU"
    pub code: String,

    /// Number of beds the department is configured for
    pub capacity: i32,

    /// Admitted patients currently counted against the department
    pub current_load: i32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Department {
    pub fn new(name: impl Into<String>, code: impl Into<String>, capacity: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            code: code.into(),
            capacity,
            current_load: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// current_load / capacity, or `None` when capacity is zero
    pub fn load_ratio(&self) -> Option<f64> {
        if self.capacity > 0 {
            Some(self.current_load as f64 / self.capacity as f64)
        } else {
            None
        }
    }
}

/// Derive a bed-number prefix from a department name: "Emergency Room" -> "EMER"
pub fn department_code(name: &str) -> String {
    let code: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(4)
        .collect::<String>()
        .to_ascii_uppercase();
    if code.is_empty() {
        "DEPT".to_string()
    } else {
        code
    }
}

// =============================================================================
// BED
// =============================================================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BedStatus {
    Available,
    Occupied,
}

text_enum!(BedStatus {
    Available => "available",
    Occupied => "occupied",
});

/// A single bed.
///
/// `status == Occupied` holds exactly when `occupant_patient_id` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bed {
    pub id: Uuid,

    /// Owning department; changes when the bed is shifted
    pub department_id: Uuid,

    /// Human-readable, department-coded number, e.g. "ICU-002"
    pub bed_number: String,

    pub status: BedStatus,
    pub occupant_patient_id: Option<String>,
    pub occupied_at: Option<DateTime<Utc>>,
}

impl Bed {
    pub fn is_available(&self) -> bool {
        self.status == BedStatus::Available
    }

    pub(crate) fn occupy(&mut self, patient_id: &str, now: DateTime<Utc>) {
        self.status = BedStatus::Occupied;
        self.occupant_patient_id = Some(patient_id.to_string());
        self.occupied_at = Some(now);
    }

    pub(crate) fn vacate(&mut self) {
        self.status = BedStatus::Available;
        self.occupant_patient_id = None;
        self.occupied_at = None;
    }
}

/// Zero-padded so lexicographic order equals numeric order
pub fn format_bed_number(code: &str, sequence: u32) -> String {
    format!("{}-{:03}", code, sequence)
}

/// Live bed counts for one department
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BedCounts {
    pub total: i64,
    pub available: i64,
}

impl BedCounts {
    pub fn occupied(&self) -> i64 {
        self.total - self.available
    }
}

/// Result of a successful bed claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BedAssignment {
    pub bed_id: Uuid,
    pub bed_number: String,
    pub department_id: Uuid,
}

impl From<&Bed> for BedAssignment {
    fn from(bed: &Bed) -> Self {
        Self {
            bed_id: bed.id,
            bed_number: bed.bed_number.clone(),
            department_id: bed.department_id,
        }
    }
}

/// A department suggested when the requested one is full
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepartmentAlternative {
    pub department_id: Uuid,
    pub name: String,
    pub available_beds: i64,
    /// 0.0 - 1.0
    pub utilization: f64,
}

/// A free bed in another department that could be shifted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BedShiftCandidate {
    pub bed_id: Uuid,
    pub bed_number: String,
    pub department_id: Uuid,
    pub department_name: String,
    pub department_utilization: f64,
}

/// Department summary with live bed counts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepartmentOccupancy {
    pub department_id: Uuid,
    pub name: String,
    pub capacity: i32,
    pub current_load: i32,
    pub total_beds: i64,
    pub available_beds: i64,
    pub occupied_beds: i64,
    pub utilization: f64,
}

// =============================================================================
// PATIENT
// =============================================================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatientStatus {
    Active,
    Transferred,
    Discharged,
}

text_enum!(PatientStatus {
    Active => "active",
    Transferred => "transferred",
    Discharged => "discharged",
});

impl PatientStatus {
    /// Still in the hospital and counted against a department
    pub fn is_admitted(&self) -> bool {
        !matches!(self, PatientStatus::Discharged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

text_enum!(Priority {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
    /// Date-coded id, e.g. "PT-20261019-0003"
    pub id: String,
    pub name: String,
    pub department_id: Uuid,
    pub bed_id: Option<Uuid>,
    /// Denormalized from the bed for display
    pub bed_number: Option<String>,
    pub status: PatientStatus,
    pub priority: Priority,
    pub admitted_at: DateTime<Utc>,
    pub discharged_at: Option<DateTime<Utc>>,
}

pub fn format_patient_id(day: NaiveDate, sequence: u32) -> String {
    format!("PT-{}-{:04}", day.format("%Y%m%d"), sequence)
}

/// Field-level patient update. `None` leaves a field untouched.
///
/// Bed fields are only ever set by a bed claim inside the store; an update
/// can only clear them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatientUpdate {
    pub department_id: Option<Uuid>,
    pub status: Option<PatientStatus>,
    pub discharged_at: Option<DateTime<Utc>>,
    pub clear_bed: bool,
}

impl PatientUpdate {
    pub(crate) fn apply(&self, patient: &mut Patient) {
        if let Some(department_id) = self.department_id {
            patient.department_id = department_id;
        }
        if let Some(status) = self.status {
            patient.status = status;
        }
        if let Some(discharged_at) = self.discharged_at {
            patient.discharged_at = Some(discharged_at);
        }
        if self.clear_bed {
            patient.bed_id = None;
            patient.bed_number = None;
        }
    }
}

/// Initial empty vitals record created at admission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalsRecord {
    pub id: Uuid,
    pub patient_id: String,
    pub recorded_at: DateTime<Utc>,
}

// =============================================================================
// RESOURCE LEDGER
// =============================================================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Equipment,
    Supply,
}

text_enum!(ResourceType {
    Equipment => "equipment",
    Supply => "supply",
});

/// One named item in a department's ledger.
///
/// `available + in_use == quantity` at all times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub department_id: Uuid,
    pub resource_type: ResourceType,
    pub resource_key: String,
    pub name: String,
    /// Total units the department owns
    pub quantity: i32,
    /// Idle units
    pub available: i32,
    /// Units allocated to patients
    pub in_use: i32,
    pub updated_at: DateTime<Utc>,
}

/// Operator bulk-edit line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEdit {
    pub resource_type: ResourceType,
    pub resource_key: String,
    pub name: String,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTransferRecord {
    pub id: Uuid,
    pub from_department_id: Uuid,
    pub to_department_id: Uuid,
    pub resource_type: ResourceType,
    pub resource_key: String,
    pub quantity: i32,
    pub reason: String,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Allocated,
    Deallocated,
}

text_enum!(AllocationStatus {
    Allocated => "allocated",
    Deallocated => "deallocated",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub id: Uuid,
    pub patient_id: String,
    pub department_id: Uuid,
    pub resource_type: ResourceType,
    pub resource_key: String,
    /// Units still held by the patient under this record
    pub quantity: i32,
    pub actor: String,
    pub status: AllocationStatus,
    pub allocated_at: DateTime<Utc>,
    pub deallocated_at: Option<DateTime<Utc>>,
}

/// Return units from a patient to the department pool
#[derive(Debug, Clone, PartialEq)]
pub struct Deallocation {
    pub patient_id: String,
    pub department_id: Uuid,
    pub resource_type: ResourceType,
    pub resource_key: String,
    pub quantity: i32,
    pub at: DateTime<Utc>,
}

/// What a deallocation actually did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeallocationResult {
    pub entry: LedgerEntry,
    pub requested: i32,
    /// Units the patient held in open allocation records before the call
    pub held: i32,
    /// Clamped to `held` and to the entry's `in_use`
    pub released: i32,
    pub records_closed: usize,
}

// =============================================================================
// ACTIVITY LOG
// =============================================================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    PatientAdmitted,
    PatientTransferred,
    PatientDischarged,
    BedAssigned,
    BedReleased,
    BedShifted,
    BedsAdded,
    DepartmentCreated,
    ResourceTransferred,
    ResourceAllocated,
    ResourceDeallocated,
    LedgerUpdated,
}

text_enum!(ActivityKind {
    PatientAdmitted => "patient_admitted",
    PatientTransferred => "patient_transferred",
    PatientDischarged => "patient_discharged",
    BedAssigned => "bed_assigned",
    BedReleased => "bed_released",
    BedShifted => "bed_shifted",
    BedsAdded => "beds_added",
    DepartmentCreated => "department_created",
    ResourceTransferred => "resource_transferred",
    ResourceAllocated => "resource_allocated",
    ResourceDeallocated => "resource_deallocated",
    LedgerUpdated => "ledger_updated",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub kind: ActivityKind,
    pub message: String,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

impl Activity {
    pub fn new(kind: ActivityKind, message: impl Into<String>, actor: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            actor: actor.to_string(),
            created_at: Utc::now(),
        }
    }
}

// =============================================================================
// ORCHESTRATOR OUTCOMES
// =============================================================================
// Secondary steps (billing, vitals, audit, cleanup) never abort an admission
// or discharge. Each one is reported here with its own result.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    DepartmentLoad,
    PreviousDepartmentLoad,
    VitalsRecord,
    Assessment,
    BillingStart,
    BillingStop,
    BillingDepartment,
    BedRelease,
    ResourceDeallocation,
    ActivityLog,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step: Step,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Where the patient ended up after an allocation attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Placement {
    Assigned(BedAssignment),
    Unplaced {
        error: String,
        message: String,
        suggestions: Vec<DepartmentAlternative>,
    },
}

impl Placement {
    pub fn assignment(&self) -> Option<&BedAssignment> {
        match self {
            Placement::Assigned(assignment) => Some(assignment),
            Placement::Unplaced { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionOutcome {
    pub patient: Patient,
    pub placement: Placement,
    pub steps: Vec<StepReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub patient: Patient,
    pub placement: Placement,
    pub steps: Vec<StepReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DischargeOutcome {
    pub patient: Patient,
    pub released_bed: Option<String>,
    pub deallocated_records: usize,
    pub steps: Vec<StepReport>,
}

// =============================================================================
// API REQUEST STRUCTURES
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDepartmentRequest {
    pub name: String,
    /// Defaults to a code derived from the name
    #[serde(default)]
    pub code: Option<String>,
    /// Beds created up front
    #[serde(default)]
    pub beds: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddBedsRequest {
    pub count: u32,
}

/// # Example JSON
/// ```json
/// { "name": "Jane Doe", "department_id": "…", "priority": "high" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmitPatientRequest {
    pub name: String,
    pub department_id: Uuid,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlternativeAdmissionRequest {
    pub department_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BedShiftAdmissionRequest {
    pub bed_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferPatientRequest {
    pub department_id: Uuid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DischargeRequest {
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceTransferRequest {
    pub from_department_id: Uuid,
    pub to_department_id: Uuid,
    pub resource_type: ResourceType,
    pub resource_key: String,
    pub quantity: i32,
    pub reason: String,
}

/// Used for both allocate and deallocate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocationRequest {
    pub patient_id: String,
    pub department_id: Uuid,
    pub resource_type: ResourceType,
    pub resource_key: String,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEditRequest {
    pub entries: Vec<LedgerEdit>,
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub store: bool,
    /// `None` when the cache is disabled
    pub redis: Option<bool>,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Alternative departments when the requested one is full
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<DepartmentAlternative>>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
            suggestions: None,
        }
    }
}
