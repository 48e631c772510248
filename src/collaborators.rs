// =============================================================================
// EXTERNAL COLLABORATORS
// =============================================================================
// Billing and clinical assessment live in other services. The orchestrator
// only sees these traits; main wires in HTTP clients when URLs are
// configured and log-only stand-ins otherwise.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{Patient, Priority};

#[async_trait]
pub trait BillingService: Send + Sync {
    async fn start_patient_billing(
        &self,
        patient_id: &str,
        department_id: Uuid,
        start_time: DateTime<Utc>,
    ) -> AppResult<()>;

    async fn stop_patient_billing(
        &self,
        patient_id: &str,
        end_time: DateTime<Utc>,
        payment_status: Option<&str>,
        notes: Option<&str>,
    ) -> AppResult<()>;

    /// Move the patient's open billing record to another department
    async fn update_billing_department(&self, patient_id: &str, department_id: Uuid)
        -> AppResult<()>;
}

#[async_trait]
pub trait AssessmentService: Send + Sync {
    /// Ask for a risk assessment. Results are delivered elsewhere.
    async fn request_assessment(&self, patient: &Patient) -> AppResult<()>;
}

pub fn http_client(timeout: Duration) -> AppResult<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

// -----------------------------------------------------------------------------
// HTTP IMPLEMENTATIONS
// -----------------------------------------------------------------------------

#[derive(Serialize)]
struct StartBilling<'a> {
    patient_id: &'a str,
    department_id: Uuid,
    start_time: DateTime<Utc>,
}

#[derive(Serialize)]
struct StopBilling<'a> {
    patient_id: &'a str,
    end_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payment_status: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<&'a str>,
}

#[derive(Serialize)]
struct BillingDepartment<'a> {
    patient_id: &'a str,
    department_id: Uuid,
}

#[derive(Serialize)]
struct AssessmentRequest<'a> {
    patient_id: &'a str,
    name: &'a str,
    department_id: Uuid,
    priority: Priority,
    admitted_at: DateTime<Utc>,
}

pub struct HttpBilling {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBilling {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> AppResult<()> {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl BillingService for HttpBilling {
    async fn start_patient_billing(
        &self,
        patient_id: &str,
        department_id: Uuid,
        start_time: DateTime<Utc>,
    ) -> AppResult<()> {
        self.post(
            "/billing/start",
            &StartBilling {
                patient_id,
                department_id,
                start_time,
            },
        )
        .await
    }

    async fn stop_patient_billing(
        &self,
        patient_id: &str,
        end_time: DateTime<Utc>,
        payment_status: Option<&str>,
        notes: Option<&str>,
    ) -> AppResult<()> {
        self.post(
            "/billing/stop",
            &StopBilling {
                patient_id,
                end_time,
                payment_status,
                notes,
            },
        )
        .await
    }

    async fn update_billing_department(
        &self,
        patient_id: &str,
        department_id: Uuid,
    ) -> AppResult<()> {
        self.post(
            "/billing/department",
            &BillingDepartment {
                patient_id,
                department_id,
            },
        )
        .await
    }
}

pub struct HttpAssessment {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAssessment {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl AssessmentService for HttpAssessment {
    async fn request_assessment(&self, patient: &Patient) -> AppResult<()> {
        self.client
            .post(format!("{}/assessments", self.base_url))
            .json(&AssessmentRequest {
                patient_id: &patient.id,
                name: &patient.name,
                department_id: patient.department_id,
                priority: patient.priority,
                admitted_at: patient.admitted_at,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// LOG-ONLY IMPLEMENTATIONS
// -----------------------------------------------------------------------------
// Used when no collaborator URL is configured.

pub struct LogOnlyBilling;

#[async_trait]
impl BillingService for LogOnlyBilling {
    async fn start_patient_billing(
        &self,
        patient_id: &str,
        department_id: Uuid,
        _start_time: DateTime<Utc>,
    ) -> AppResult<()> {
        tracing::info!(patient_id, %department_id, "Billing start (no billing service configured)");
        Ok(())
    }

    async fn stop_patient_billing(
        &self,
        patient_id: &str,
        _end_time: DateTime<Utc>,
        payment_status: Option<&str>,
        _notes: Option<&str>,
    ) -> AppResult<()> {
        tracing::info!(
            patient_id,
            payment_status = payment_status.unwrap_or("pending"),
            "Billing stop (no billing service configured)"
        );
        Ok(())
    }

    async fn update_billing_department(
        &self,
        patient_id: &str,
        department_id: Uuid,
    ) -> AppResult<()> {
        tracing::info!(patient_id, %department_id, "Billing department change (no billing service configured)");
        Ok(())
    }
}

pub struct LogOnlyAssessment;

#[async_trait]
impl AssessmentService for LogOnlyAssessment {
    async fn request_assessment(&self, patient: &Patient) -> AppResult<()> {
        tracing::info!(patient_id = %patient.id, "Assessment requested (no assessment service configured)");
        Ok(())
    }
}
