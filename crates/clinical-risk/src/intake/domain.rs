use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alerts::{AlertEvaluation, AlertId, AlertSeverity, EventType};
use crate::domain::{Category, InstrumentType, PatientRef, ResponseId, RiskProfile};
use crate::forecast::RiskForecast;
use crate::interventions::Intervention;
use crate::phi::Answers;
use crate::population::{SimilarPatientMatch, TrendDirection, TrendReport};
use crate::scoring::{InstrumentSchema, ScoreDirection};

/// Inbound questionnaire payload. Only deserializable; it never leaves the process.
#[derive(Debug, Deserialize)]
pub struct QuestionnaireSubmission {
    pub instrument: InstrumentType,
    pub patient_ref: PatientRef,
    pub answers: Answers,
}

/// Everything computed for one submission.
#[derive(Debug, Clone)]
pub struct Assessment {
    pub profile: RiskProfile,
    pub neighbors: SimilarPatientMatch,
    pub trend: Option<TrendReport>,
    pub forecast: RiskForecast,
    pub interventions: Vec<Intervention>,
    pub alerts: AlertEvaluation,
}

impl Assessment {
    pub fn response_id(&self) -> ResponseId {
        self.profile.response_id
    }

    /// Outward summary; neighbour identities and patient hashes stay internal.
    pub fn view(&self) -> AssessmentView<'_> {
        AssessmentView {
            profile: &self.profile,
            neighbor_count: self.neighbors.len(),
            trend_direction: self.trend.as_ref().map(|report| report.direction),
            forecast: &self.forecast,
            interventions: &self.interventions,
            alerts: self
                .alerts
                .raised
                .iter()
                .map(|alert| AlertSummary {
                    alert_id: alert.alert_id,
                    severity: alert.severity,
                    event_type: alert.event_type(),
                })
                .collect(),
            alerts_suppressed: self.alerts.suppressed.len(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AssessmentView<'a> {
    pub profile: &'a RiskProfile,
    pub neighbor_count: usize,
    pub trend_direction: Option<TrendDirection>,
    pub forecast: &'a RiskForecast,
    pub interventions: &'a [Intervention],
    pub alerts: Vec<AlertSummary>,
    pub alerts_suppressed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AlertSummary {
    pub alert_id: AlertId,
    pub severity: AlertSeverity,
    pub event_type: EventType,
}

/// Public description of an instrument: its questions, not its cutoffs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstrumentTemplate {
    pub instrument: InstrumentType,
    pub name: String,
    pub primary_category: Category,
    pub direction: ScoreDirection,
    pub questions: Vec<QuestionTemplate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuestionTemplate {
    pub id: String,
    pub label: String,
    pub min: i32,
    pub max: i32,
}

impl From<&InstrumentSchema> for InstrumentTemplate {
    fn from(schema: &InstrumentSchema) -> Self {
        Self {
            instrument: schema.instrument.clone(),
            name: schema.name.clone(),
            primary_category: schema.primary_category,
            direction: schema.direction,
            questions: schema
                .questions
                .iter()
                .map(|question| QuestionTemplate {
                    id: question.id.clone(),
                    label: question.label.clone(),
                    min: question.min,
                    max: question.max,
                })
                .collect(),
        }
    }
}

/// Body of `POST /api/v1/population/trend`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TrendRequest {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}
