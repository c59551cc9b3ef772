use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::alerts::{AlertId, AlertSeverity, ClinicalAlert};
use crate::phi::{outward_json, PhiError};

/// Outbound webhook body. Field order is part of the signed contract.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    alert_id: AlertId,
    severity: AlertSeverity,
    category: &'a str,
    patient_ref_hash: &'a str,
    recommended_interventions: &'a [String],
    generated_at: DateTime<Utc>,
}

/// Canonical JSON bytes signed and sent for `alert`.
pub fn canonical_body(alert: &ClinicalAlert) -> Result<Vec<u8>, PhiError> {
    let payload = WebhookPayload {
        alert_id: alert.alert_id,
        severity: alert.severity,
        category: &alert.category,
        patient_ref_hash: &alert.patient_ref_hash,
        recommended_interventions: &alert.recommended_interventions,
        generated_at: alert.generated_at,
    };
    outward_json(&payload, "webhook payload")
}
