// =============================================================================
// POSTGRES STORE
// =============================================================================
// PostgreSQL implementation of `CapacityStore` on a SQLx connection pool.
//
// Every multi-row mutation runs in one transaction and locks the rows it
// reads with FOR UPDATE before writing them back, so concurrent admissions
// and ledger moves can never overwrite each other's changes. Returning early
// with `?` drops the transaction, which rolls it back.
// =============================================================================

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgConnection, PgPool, Row};
use uuid::Uuid;

use super::{highest_bed_sequence, CapacityStore};
use crate::error::{AppError, AppResult};
use crate::ledger;
use crate::models::{
    format_bed_number, Activity, AllocationRecord, AllocationStatus, Bed, BedCounts, BedStatus,
    Deallocation, DeallocationResult, Department, LedgerEdit, LedgerEntry, Patient,
    PatientUpdate, ResourceTransferRecord, ResourceType, VitalsRecord,
};

// -----------------------------------------------------------------------------
// COLUMN LISTS
// -----------------------------------------------------------------------------
// Macros rather than consts so they can be spliced with concat!
macro_rules! department_columns {
    () => {
        "id, name, code, capacity, current_load, created_at, updated_at"
    };
}

macro_rules! bed_columns {
    () => {
        "id, department_id, bed_number, status, occupant_patient_id, occupied_at"
    };
}

macro_rules! patient_columns {
    () => {
        "id, name, department_id, bed_id, bed_number, status, priority, admitted_at, discharged_at"
    };
}

macro_rules! ledger_columns {
    () => {
        "department_id, resource_type, resource_key, name, quantity, available, in_use, updated_at"
    };
}

macro_rules! allocation_columns {
    () => {
        "id, patient_id, department_id, resource_type, resource_key, quantity, actor, status, allocated_at, deallocated_at"
    };
}

// -----------------------------------------------------------------------------
// SCHEMA
// -----------------------------------------------------------------------------
// One statement per entry; prepared statements can't batch commands.
const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS departments (
        id UUID PRIMARY KEY,
        name VARCHAR(255) UNIQUE NOT NULL,
        code VARCHAR(16) NOT NULL,
        capacity INTEGER NOT NULL DEFAULT 0,
        current_load INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT non_negative_capacity CHECK (capacity >= 0),
        CONSTRAINT non_negative_load CHECK (current_load >= 0)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS patients (
        id VARCHAR(32) PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        department_id UUID NOT NULL REFERENCES departments(id),
        bed_id UUID,
        bed_number VARCHAR(32),
        status VARCHAR(16) NOT NULL,
        priority VARCHAR(16) NOT NULL,
        admitted_at TIMESTAMPTZ NOT NULL,
        discharged_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS beds (
        id UUID PRIMARY KEY,
        department_id UUID NOT NULL REFERENCES departments(id),
        bed_number VARCHAR(32) NOT NULL,
        status VARCHAR(16) NOT NULL DEFAULT 'available',
        occupant_patient_id VARCHAR(32) REFERENCES patients(id),
        occupied_at TIMESTAMPTZ,

        -- occupied exactly when someone is in it
        CONSTRAINT occupancy_matches_status
            CHECK ((status = 'occupied') = (occupant_patient_id IS NOT NULL))
    )
    "#,
    // One bed per patient
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_beds_occupant
        ON beds(occupant_patient_id) WHERE occupant_patient_id IS NOT NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_beds_department_status ON beds(department_id, status)
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_beds_number ON beds(bed_number)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS vitals (
        id UUID PRIMARY KEY,
        patient_id VARCHAR(32) NOT NULL REFERENCES patients(id),
        recorded_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS patient_sequences (
        day DATE PRIMARY KEY,
        last_value INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS department_resources (
        department_id UUID NOT NULL REFERENCES departments(id),
        resource_type VARCHAR(16) NOT NULL,
        resource_key VARCHAR(100) NOT NULL,
        name VARCHAR(255) NOT NULL,
        quantity INTEGER NOT NULL,
        available INTEGER NOT NULL,
        in_use INTEGER NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (department_id, resource_type, resource_key),
        CONSTRAINT balanced_ledger
            CHECK (available >= 0 AND in_use >= 0 AND available + in_use = quantity)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resource_transfers (
        id UUID PRIMARY KEY,
        from_department_id UUID NOT NULL REFERENCES departments(id),
        to_department_id UUID NOT NULL REFERENCES departments(id),
        resource_type VARCHAR(16) NOT NULL,
        resource_key VARCHAR(100) NOT NULL,
        quantity INTEGER NOT NULL,
        reason TEXT NOT NULL,
        actor VARCHAR(255) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resource_allocations (
        id UUID PRIMARY KEY,
        patient_id VARCHAR(32) NOT NULL,
        department_id UUID NOT NULL REFERENCES departments(id),
        resource_type VARCHAR(16) NOT NULL,
        resource_key VARCHAR(100) NOT NULL,
        quantity INTEGER NOT NULL,
        actor VARCHAR(255) NOT NULL,
        status VARCHAR(16) NOT NULL,
        allocated_at TIMESTAMPTZ NOT NULL,
        deallocated_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_allocations_patient
        ON resource_allocations(patient_id, status)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS activities (
        id UUID PRIMARY KEY,
        kind VARCHAR(64) NOT NULL,
        message TEXT NOT NULL,
        actor VARCHAR(255) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_activities_created ON activities(created_at DESC)
    "#,
];

// -----------------------------------------------------------------------------
// ROW MAPPING
// -----------------------------------------------------------------------------

fn department_from_row(row: &PgRow) -> AppResult<Department> {
    Ok(Department {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        code: row.try_get("code")?,
        capacity: row.try_get("capacity")?,
        current_load: row.try_get("current_load")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn bed_from_row(row: &PgRow) -> AppResult<Bed> {
    Ok(Bed {
        id: row.try_get("id")?,
        department_id: row.try_get("department_id")?,
        bed_number: row.try_get("bed_number")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        occupant_patient_id: row.try_get("occupant_patient_id")?,
        occupied_at: row.try_get("occupied_at")?,
    })
}

fn patient_from_row(row: &PgRow) -> AppResult<Patient> {
    Ok(Patient {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        department_id: row.try_get("department_id")?,
        bed_id: row.try_get("bed_id")?,
        bed_number: row.try_get("bed_number")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        priority: row.try_get::<String, _>("priority")?.parse()?,
        admitted_at: row.try_get("admitted_at")?,
        discharged_at: row.try_get("discharged_at")?,
    })
}

fn ledger_from_row(row: &PgRow) -> AppResult<LedgerEntry> {
    Ok(LedgerEntry {
        department_id: row.try_get("department_id")?,
        resource_type: row.try_get::<String, _>("resource_type")?.parse()?,
        resource_key: row.try_get("resource_key")?,
        name: row.try_get("name")?,
        quantity: row.try_get("quantity")?,
        available: row.try_get("available")?,
        in_use: row.try_get("in_use")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn allocation_from_row(row: &PgRow) -> AppResult<AllocationRecord> {
    Ok(AllocationRecord {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        department_id: row.try_get("department_id")?,
        resource_type: row.try_get::<String, _>("resource_type")?.parse()?,
        resource_key: row.try_get("resource_key")?,
        quantity: row.try_get("quantity")?,
        actor: row.try_get("actor")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        allocated_at: row.try_get("allocated_at")?,
        deallocated_at: row.try_get("deallocated_at")?,
    })
}

fn transfer_from_row(row: &PgRow) -> AppResult<ResourceTransferRecord> {
    Ok(ResourceTransferRecord {
        id: row.try_get("id")?,
        from_department_id: row.try_get("from_department_id")?,
        to_department_id: row.try_get("to_department_id")?,
        resource_type: row.try_get::<String, _>("resource_type")?.parse()?,
        resource_key: row.try_get("resource_key")?,
        quantity: row.try_get("quantity")?,
        reason: row.try_get("reason")?,
        actor: row.try_get("actor")?,
        created_at: row.try_get("created_at")?,
    })
}

fn activity_from_row(row: &PgRow) -> AppResult<Activity> {
    Ok(Activity {
        id: row.try_get("id")?,
        kind: row.try_get::<String, _>("kind")?.parse()?,
        message: row.try_get("message")?,
        actor: row.try_get("actor")?,
        created_at: row.try_get("created_at")?,
    })
}

// -----------------------------------------------------------------------------
// TRANSACTION HELPERS
// -----------------------------------------------------------------------------
// These take a bare connection so they work on `&mut *tx`.

async fn require_department(conn: &mut PgConnection, id: Uuid) -> AppResult<Department> {
    let row = sqlx::query(concat!(
        "SELECT ",
        department_columns!(),
        " FROM departments WHERE id = $1 FOR UPDATE"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(AppError::DepartmentNotFound(id))?;
    department_from_row(&row)
}

/// Lock the patient row and make sure it holds no bed yet
async fn lock_claimable_patient(conn: &mut PgConnection, patient_id: &str) -> AppResult<()> {
    let row = sqlx::query("SELECT bed_number FROM patients WHERE id = $1 FOR UPDATE")
        .bind(patient_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::PatientNotFound(patient_id.to_string()))?;

    let held: Option<String> = row.try_get("bed_number")?;
    if let Some(bed_number) = held {
        return Err(AppError::InvalidRequest(format!(
            "patient {} already holds bed {}",
            patient_id, bed_number
        )));
    }
    Ok(())
}

async fn write_bed(conn: &mut PgConnection, bed: &Bed) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE beds
        SET department_id = $2, status = $3, occupant_patient_id = $4, occupied_at = $5
        WHERE id = $1
        "#,
    )
    .bind(bed.id)
    .bind(bed.department_id)
    .bind(bed.status.as_str())
    .bind(&bed.occupant_patient_id)
    .bind(bed.occupied_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn seat_patient(conn: &mut PgConnection, patient_id: &str, bed: &Bed) -> AppResult<()> {
    sqlx::query(
        r#"
        UPDATE patients
        SET bed_id = $2, bed_number = $3, department_id = $4
        WHERE id = $1
        "#,
    )
    .bind(patient_id)
    .bind(bed.id)
    .bind(&bed.bed_number)
    .bind(bed.department_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn lock_ledger_entry(
    conn: &mut PgConnection,
    department_id: Uuid,
    resource_type: ResourceType,
    resource_key: &str,
) -> AppResult<Option<LedgerEntry>> {
    let row = sqlx::query(concat!(
        "SELECT ",
        ledger_columns!(),
        " FROM department_resources",
        " WHERE department_id = $1 AND resource_type = $2 AND resource_key = $3",
        " FOR UPDATE"
    ))
    .bind(department_id)
    .bind(resource_type.as_str())
    .bind(resource_key)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(ledger_from_row).transpose()
}

async fn write_ledger_entry(conn: &mut PgConnection, entry: &LedgerEntry) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO department_resources
            (department_id, resource_type, resource_key, name, quantity, available, in_use, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (department_id, resource_type, resource_key) DO UPDATE
        SET name = EXCLUDED.name,
            quantity = EXCLUDED.quantity,
            available = EXCLUDED.available,
            in_use = EXCLUDED.in_use,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(entry.department_id)
    .bind(entry.resource_type.as_str())
    .bind(&entry.resource_key)
    .bind(&entry.name)
    .bind(entry.quantity)
    .bind(entry.available)
    .bind(entry.in_use)
    .bind(entry.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// -----------------------------------------------------------------------------
// STORE
// -----------------------------------------------------------------------------
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a connection pool
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    /// Create tables and indexes. Safe to run on every start.
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to apply schema migration")?;
        }
        Ok(())
    }
}

#[async_trait]
impl CapacityStore for PgStore {
    async fn insert_department(&self, department: Department) -> AppResult<Department> {
        let result = sqlx::query(
            r#"
            INSERT INTO departments (id, name, code, capacity, current_load, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(department.id)
        .bind(&department.name)
        .bind(&department.code)
        .bind(department.capacity)
        .bind(department.current_load)
        .bind(department.created_at)
        .bind(department.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(department),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(
                AppError::InvalidRequest(format!("department {} already exists", department.name)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_department(&self, id: Uuid) -> AppResult<Option<Department>> {
        let row = sqlx::query(concat!(
            "SELECT ",
            department_columns!(),
            " FROM departments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(department_from_row).transpose()
    }

    async fn list_departments(&self) -> AppResult<Vec<Department>> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            department_columns!(),
            " FROM departments ORDER BY name ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(department_from_row).collect()
    }

    async fn adjust_department_load(&self, id: Uuid, delta: i32) -> AppResult<Department> {
        // Single statement, so the increment is atomic without an explicit transaction
        let row = sqlx::query(concat!(
            "UPDATE departments",
            " SET current_load = GREATEST(current_load + $2, 0), updated_at = NOW()",
            " WHERE id = $1",
            " RETURNING ",
            department_columns!()
        ))
        .bind(id)
        .bind(delta)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::DepartmentNotFound(id))?;
        department_from_row(&row)
    }

    async fn add_beds(&self, department_id: Uuid, count: u32) -> AppResult<Vec<Bed>> {
        let mut tx = self.pool.begin().await?;

        // The department row lock serializes numbering
        let department = require_department(&mut tx, department_id).await?;

        // Beds shifted away keep their number, so match on the prefix alone
        let numbers: Vec<String> =
            sqlx::query_scalar("SELECT bed_number FROM beds WHERE bed_number LIKE $1 || '-%'")
                .bind(&department.code)
                .fetch_all(&mut *tx)
                .await?;
        let start = highest_bed_sequence(numbers.iter().map(String::as_str), &department.code);

        let mut beds = Vec::with_capacity(count as usize);
        for offset in 1..=count {
            let bed = Bed {
                id: Uuid::new_v4(),
                department_id,
                bed_number: format_bed_number(&department.code, start + offset),
                status: BedStatus::Available,
                occupant_patient_id: None,
                occupied_at: None,
            };
            sqlx::query(
                r#"
                INSERT INTO beds (id, department_id, bed_number, status)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(bed.id)
            .bind(bed.department_id)
            .bind(&bed.bed_number)
            .bind(bed.status.as_str())
            .execute(&mut *tx)
            .await?;
            beds.push(bed);
        }

        sqlx::query(
            "UPDATE departments SET capacity = capacity + $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(department_id)
        .bind(count as i32)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(beds)
    }

    async fn get_bed(&self, id: Uuid) -> AppResult<Option<Bed>> {
        let row = sqlx::query(concat!("SELECT ", bed_columns!(), " FROM beds WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(bed_from_row).transpose()
    }

    async fn list_beds(&self, department_id: Uuid) -> AppResult<Vec<Bed>> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            bed_columns!(),
            " FROM beds WHERE department_id = $1 ORDER BY bed_number ASC"
        ))
        .bind(department_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(bed_from_row).collect()
    }

    async fn bed_counts(&self) -> AppResult<HashMap<Uuid, BedCounts>> {
        let rows = sqlx::query(
            r#"
            SELECT department_id,
                   COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status = 'available') AS available
            FROM beds
            GROUP BY department_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::with_capacity(rows.len());
        for row in &rows {
            counts.insert(
                row.try_get::<Uuid, _>("department_id")?,
                BedCounts {
                    total: row.try_get("total")?,
                    available: row.try_get("available")?,
                },
            );
        }
        Ok(counts)
    }

    async fn available_beds_outside(&self, department_id: Uuid) -> AppResult<Vec<Bed>> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            bed_columns!(),
            " FROM beds WHERE department_id <> $1 AND status = 'available'",
            " ORDER BY bed_number ASC"
        ))
        .bind(department_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(bed_from_row).collect()
    }

    async fn claim_available_bed(
        &self,
        department_id: Uuid,
        patient_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Bed>> {
        let mut tx = self.pool.begin().await?;
        lock_claimable_patient(&mut tx, patient_id).await?;

        // SKIP LOCKED: a bed another session is claiming right now is not free
        let row = sqlx::query(concat!(
            "SELECT ",
            bed_columns!(),
            " FROM beds WHERE department_id = $1 AND status = 'available'",
            " ORDER BY bed_number ASC LIMIT 1",
            " FOR UPDATE SKIP LOCKED"
        ))
        .bind(department_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut bed = bed_from_row(&row)?;
        bed.occupy(patient_id, now);
        write_bed(&mut tx, &bed).await?;
        seat_patient(&mut tx, patient_id, &bed).await?;

        tx.commit().await?;
        Ok(Some(bed))
    }

    async fn shift_and_claim_bed(
        &self,
        bed_id: Uuid,
        from_department_id: Uuid,
        to_department_id: Uuid,
        patient_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Bed> {
        let mut tx = self.pool.begin().await?;

        // Lock departments in id order so two opposite shifts can't deadlock
        let (first, second) = if from_department_id < to_department_id {
            (from_department_id, to_department_id)
        } else {
            (to_department_id, from_department_id)
        };
        require_department(&mut tx, first).await?;
        require_department(&mut tx, second).await?;
        lock_claimable_patient(&mut tx, patient_id).await?;

        let row = sqlx::query(concat!(
            "SELECT ",
            bed_columns!(),
            " FROM beds WHERE id = $1 FOR UPDATE"
        ))
        .bind(bed_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::BedNotFound(bed_id))?;

        let mut bed = bed_from_row(&row)?;
        if !bed.is_available() || bed.department_id != from_department_id {
            return Err(AppError::BedUnavailable(bed.bed_number));
        }

        bed.department_id = to_department_id;
        bed.occupy(patient_id, now);
        write_bed(&mut tx, &bed).await?;
        seat_patient(&mut tx, patient_id, &bed).await?;

        sqlx::query(
            "UPDATE departments SET capacity = GREATEST(capacity - 1, 0), updated_at = $2 WHERE id = $1",
        )
        .bind(from_department_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE departments SET capacity = capacity + 1, updated_at = $2 WHERE id = $1")
            .bind(to_department_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(bed)
    }

    async fn release_bed(&self, bed_id: Uuid) -> AppResult<Bed> {
        let row = sqlx::query(concat!(
            "UPDATE beds",
            " SET status = 'available', occupant_patient_id = NULL, occupied_at = NULL",
            " WHERE id = $1",
            " RETURNING ",
            bed_columns!()
        ))
        .bind(bed_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(AppError::BedNotFound(bed_id))?;
        bed_from_row(&row)
    }

    async fn vacate_bed(&self, bed_id: Uuid) -> AppResult<(Bed, Option<Patient>)> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(concat!(
            "SELECT ",
            bed_columns!(),
            " FROM beds WHERE id = $1 FOR UPDATE"
        ))
        .bind(bed_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AppError::BedNotFound(bed_id))?;
        let mut bed = bed_from_row(&row)?;

        // Only clear the occupant if their record still points at this bed
        let occupant = match bed.occupant_patient_id.as_deref() {
            Some(patient_id) => sqlx::query(concat!(
                "UPDATE patients SET bed_id = NULL, bed_number = NULL",
                " WHERE id = $1 AND bed_id = $2",
                " RETURNING ",
                patient_columns!()
            ))
            .bind(patient_id)
            .bind(bed_id)
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(patient_from_row)
            .transpose()?,
            None => None,
        };

        bed.vacate();
        write_bed(&mut tx, &bed).await?;

        tx.commit().await?;
        Ok((bed, occupant))
    }

    async fn next_patient_sequence(&self, day: NaiveDate) -> AppResult<u32> {
        let value: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO patient_sequences (day, last_value) VALUES ($1, 1)
            ON CONFLICT (day) DO UPDATE SET last_value = patient_sequences.last_value + 1
            RETURNING last_value
            "#,
        )
        .bind(day)
        .fetch_one(&self.pool)
        .await?;
        Ok(value as u32)
    }

    async fn insert_patient(&self, patient: Patient) -> AppResult<Patient> {
        sqlx::query(
            r#"
            INSERT INTO patients
                (id, name, department_id, bed_id, bed_number, status, priority, admitted_at, discharged_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&patient.id)
        .bind(&patient.name)
        .bind(patient.department_id)
        .bind(patient.bed_id)
        .bind(&patient.bed_number)
        .bind(patient.status.as_str())
        .bind(patient.priority.as_str())
        .bind(patient.admitted_at)
        .bind(patient.discharged_at)
        .execute(&self.pool)
        .await?;
        Ok(patient)
    }

    async fn get_patient(&self, id: &str) -> AppResult<Option<Patient>> {
        let row = sqlx::query(concat!(
            "SELECT ",
            patient_columns!(),
            " FROM patients WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(patient_from_row).transpose()
    }

    async fn update_patient(&self, id: &str, update: &PatientUpdate) -> AppResult<Patient> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(concat!(
            "SELECT ",
            patient_columns!(),
            " FROM patients WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::PatientNotFound(id.to_string()))?;

        let mut patient = patient_from_row(&row)?;
        update.apply(&mut patient);

        sqlx::query(
            r#"
            UPDATE patients
            SET name = $2, department_id = $3, bed_id = $4, bed_number = $5,
                status = $6, priority = $7, discharged_at = $8
            WHERE id = $1
            "#,
        )
        .bind(&patient.id)
        .bind(&patient.name)
        .bind(patient.department_id)
        .bind(patient.bed_id)
        .bind(&patient.bed_number)
        .bind(patient.status.as_str())
        .bind(patient.priority.as_str())
        .bind(patient.discharged_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(patient)
    }

    async fn insert_vitals(&self, vitals: VitalsRecord) -> AppResult<()> {
        sqlx::query("INSERT INTO vitals (id, patient_id, recorded_at) VALUES ($1, $2, $3)")
            .bind(vitals.id)
            .bind(&vitals.patient_id)
            .bind(vitals.recorded_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_ledger(&self, department_id: Uuid) -> AppResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            ledger_columns!(),
            " FROM department_resources WHERE department_id = $1",
            " ORDER BY resource_type ASC, resource_key ASC"
        ))
        .bind(department_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ledger_from_row).collect()
    }

    async fn get_ledger_entry(
        &self,
        department_id: Uuid,
        resource_type: ResourceType,
        resource_key: &str,
    ) -> AppResult<Option<LedgerEntry>> {
        let row = sqlx::query(concat!(
            "SELECT ",
            ledger_columns!(),
            " FROM department_resources",
            " WHERE department_id = $1 AND resource_type = $2 AND resource_key = $3"
        ))
        .bind(department_id)
        .bind(resource_type.as_str())
        .bind(resource_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(ledger_from_row).transpose()
    }

    async fn apply_ledger_edits(
        &self,
        department_id: Uuid,
        edits: &[LedgerEdit],
        now: DateTime<Utc>,
    ) -> AppResult<Vec<LedgerEntry>> {
        let mut tx = self.pool.begin().await?;
        require_department(&mut tx, department_id).await?;

        let mut updated = Vec::with_capacity(edits.len());
        for edit in edits {
            let existing =
                lock_ledger_entry(&mut tx, department_id, edit.resource_type, &edit.resource_key)
                    .await?;
            let entry = ledger::apply_edit(department_id, existing, edit, now)?;
            write_ledger_entry(&mut tx, &entry).await?;
            updated.push(entry);
        }

        tx.commit().await?;
        Ok(updated)
    }

    async fn transfer_resource(
        &self,
        record: &ResourceTransferRecord,
    ) -> AppResult<(LedgerEntry, LedgerEntry)> {
        let mut tx = self.pool.begin().await?;
        require_department(&mut tx, record.from_department_id).await?;
        require_department(&mut tx, record.to_department_id).await?;

        // Lock both entries in department id order so opposite transfers can't deadlock
        let (source, destination) = if record.from_department_id < record.to_department_id {
            let source = lock_ledger_entry(
                &mut tx,
                record.from_department_id,
                record.resource_type,
                &record.resource_key,
            )
            .await?;
            let destination = lock_ledger_entry(
                &mut tx,
                record.to_department_id,
                record.resource_type,
                &record.resource_key,
            )
            .await?;
            (source, destination)
        } else {
            let destination = lock_ledger_entry(
                &mut tx,
                record.to_department_id,
                record.resource_type,
                &record.resource_key,
            )
            .await?;
            let source = lock_ledger_entry(
                &mut tx,
                record.from_department_id,
                record.resource_type,
                &record.resource_key,
            )
            .await?;
            (source, destination)
        };

        let mut source =
            source.ok_or_else(|| AppError::ResourceNotFound(record.resource_key.clone()))?;
        let destination = ledger::transfer_between(
            &mut source,
            destination,
            record.to_department_id,
            record.quantity,
            record.created_at,
        )?;

        write_ledger_entry(&mut tx, &source).await?;
        write_ledger_entry(&mut tx, &destination).await?;

        sqlx::query(
            r#"
            INSERT INTO resource_transfers
                (id, from_department_id, to_department_id, resource_type, resource_key,
                 quantity, reason, actor, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(record.from_department_id)
        .bind(record.to_department_id)
        .bind(record.resource_type.as_str())
        .bind(&record.resource_key)
        .bind(record.quantity)
        .bind(&record.reason)
        .bind(&record.actor)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((source, destination))
    }

    async fn allocate_resource(&self, record: &AllocationRecord) -> AppResult<LedgerEntry> {
        let mut tx = self.pool.begin().await?;

        let mut entry = lock_ledger_entry(
            &mut tx,
            record.department_id,
            record.resource_type,
            &record.resource_key,
        )
        .await?
        .ok_or_else(|| AppError::ResourceNotFound(record.resource_key.clone()))?;

        entry.allocate(record.quantity, record.allocated_at)?;
        write_ledger_entry(&mut tx, &entry).await?;

        sqlx::query(
            r#"
            INSERT INTO resource_allocations
                (id, patient_id, department_id, resource_type, resource_key,
                 quantity, actor, status, allocated_at, deallocated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(&record.patient_id)
        .bind(record.department_id)
        .bind(record.resource_type.as_str())
        .bind(&record.resource_key)
        .bind(record.quantity)
        .bind(&record.actor)
        .bind(record.status.as_str())
        .bind(record.allocated_at)
        .bind(record.deallocated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(entry)
    }

    async fn deallocate_resource(&self, request: &Deallocation) -> AppResult<DeallocationResult> {
        let mut tx = self.pool.begin().await?;

        let mut entry = lock_ledger_entry(
            &mut tx,
            request.department_id,
            request.resource_type,
            &request.resource_key,
        )
        .await?
        .ok_or_else(|| AppError::ResourceNotFound(request.resource_key.clone()))?;

        let rows = sqlx::query(concat!(
            "SELECT ",
            allocation_columns!(),
            " FROM resource_allocations",
            " WHERE patient_id = $1 AND department_id = $2 AND resource_type = $3",
            " AND resource_key = $4 AND status = 'allocated'",
            " ORDER BY allocated_at ASC",
            " FOR UPDATE"
        ))
        .bind(&request.patient_id)
        .bind(request.department_id)
        .bind(request.resource_type.as_str())
        .bind(&request.resource_key)
        .fetch_all(&mut *tx)
        .await?;
        let records = rows
            .iter()
            .map(allocation_from_row)
            .collect::<AppResult<Vec<_>>>()?;

        let held: i32 = records.iter().map(|record| record.quantity).sum();
        let mut remaining = request.quantity.min(held);
        let released = if remaining > 0 {
            entry.deallocate(remaining, request.at)?
        } else {
            0
        };
        write_ledger_entry(&mut tx, &entry).await?;

        let mut records_closed = 0;
        for mut record in records {
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
            sqlx::query(
                r#"
                UPDATE resource_allocations
                SET quantity = $2, status = $3, deallocated_at = $4
                WHERE id = $1
                "#,
            )
            .bind(record.id)
            .bind(record.quantity)
            .bind(record.status.as_str())
            .bind(record.deallocated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
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
        let rows = sqlx::query(concat!(
            "SELECT ",
            allocation_columns!(),
            " FROM resource_allocations",
            " WHERE patient_id = $1",
            " AND ($2::uuid IS NULL OR department_id = $2)",
            " AND ($3::text IS NULL OR status = $3)",
            " ORDER BY allocated_at ASC"
        ))
        .bind(patient_id)
        .bind(department_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(allocation_from_row).collect()
    }

    async fn list_transfers(&self, department_id: Uuid) -> AppResult<Vec<ResourceTransferRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, from_department_id, to_department_id, resource_type, resource_key,
                   quantity, reason, actor, created_at
            FROM resource_transfers
            WHERE from_department_id = $1 OR to_department_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(department_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transfer_from_row).collect()
    }

    async fn append_activity(&self, activity: Activity) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO activities (id, kind, message, actor, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(activity.id)
        .bind(activity.kind.as_str())
        .bind(&activity.message)
        .bind(&activity.actor)
        .bind(activity.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_activities(&self, limit: i64) -> AppResult<Vec<Activity>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, message, actor, created_at
            FROM activities
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(activity_from_row).collect()
    }

    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}
