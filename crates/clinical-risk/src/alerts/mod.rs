//! Alert decisions for scored profiles.
//!
//! Each triggering condition (a safety flag, the band threshold, a confident escalation
//! forecast) becomes at most one alert per patient per cooldown window.


use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::cache::{CacheStats, TtlCache};
use crate::domain::{ProfileId, RiskBand, RiskProfile, SafetyFlag};
use crate::forecast::RiskForecast;
use crate::interventions::Intervention;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(pub Uuid);

impl AlertId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AlertId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Urgent,
    Critical,
}

impl AlertSeverity {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Urgent => "urgent",
            Self::Critical => "critical",
        }
    }

    fn for_band(band: RiskBand) -> Self {
        match band {
            RiskBand::Critical => Self::Critical,
            RiskBand::High => Self::Urgent,
            RiskBand::Low | RiskBand::Moderate => Self::Warning,
        }
    }
}

/// Event types subscribers can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SafetyFlag,
    RiskBandThreshold,
    ForecastEscalation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertCondition {
    SafetyFlag { flag: SafetyFlag },
    BandThreshold { band: RiskBand },
    ForecastEscalation { projected_band: RiskBand },
}

impl AlertCondition {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::SafetyFlag { .. } => EventType::SafetyFlag,
            Self::BandThreshold { .. } => EventType::RiskBandThreshold,
            Self::ForecastEscalation { .. } => EventType::ForecastEscalation,
        }
    }

    /// Stable per-condition suffix for deduplication keys. Band conditions include the
    /// band, so an escalation to a higher band is not held back by the lower band's cooldown.
    pub fn key(&self) -> String {
        match self {
            Self::SafetyFlag { flag } => format!("safety_flag:{}", flag.label()),
            Self::BandThreshold { band } => format!("risk_band_threshold:{band}"),
            Self::ForecastEscalation { projected_band } => {
                format!("forecast_escalation:{projected_band}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalAlert {
    pub alert_id: AlertId,
    pub profile_id: ProfileId,
    pub patient_ref_hash: String,
    pub dedup_key: String,
    pub condition: AlertCondition,
    pub severity: AlertSeverity,
    pub category: String,
    pub recommended_interventions: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl ClinicalAlert {
    pub fn event_type(&self) -> EventType {
        self.condition.event_type()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    NoAlert,
    AlertRaised,
}

/// Outcome of evaluating one profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertEvaluation {
    pub profile_id: ProfileId,
    pub raised: Vec<ClinicalAlert>,
    /// Dedup keys held back by an active cooldown.
    pub suppressed: Vec<String>,
}

impl AlertEvaluation {
    pub fn state(&self) -> AlertState {
        if self.raised.is_empty() {
            AlertState::NoAlert
        } else {
            AlertState::AlertRaised
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertConfig {
    pub band_threshold: RiskBand,
    pub cooldown: Duration,
    pub min_forecast_confidence: f64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            band_threshold: RiskBand::High,
            cooldown: Duration::hours(24),
            min_forecast_confidence: 0.5,
        }
    }
}

/// Receives raised alerts for outbound delivery.
pub trait AlertPublisher: Send + Sync {
    fn publish(&self, alert: &ClinicalAlert) -> Result<(), AlertPublishError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("alert publication failed: {0}")]
pub struct AlertPublishError(pub String);

pub struct AlertDispatcher {
    config: AlertConfig,
    cooldowns: Arc<TtlCache<String, AlertId>>,
}

impl AlertDispatcher {
    pub fn new(config: AlertConfig, cooldowns: Arc<TtlCache<String, AlertId>>) -> Self {
        Self { config, cooldowns }
    }

    pub fn with_default_cooldowns(config: AlertConfig) -> Self {
        let cooldowns = Arc::new(TtlCache::new(config.cooldown));
        Self::new(config, cooldowns)
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    /// Drops cooldown entries that have lapsed by `now`.
    pub fn purge_expired_cooldowns(&self, now: DateTime<Utc>) -> usize {
        self.cooldowns.purge_expired(now)
    }

    pub fn cooldown_stats(&self) -> CacheStats {
        self.cooldowns.stats()
    }

    /// Decides which alerts to raise, claiming a cooldown slot for each.
    pub fn evaluate(
        &self,
        profile: &RiskProfile,
        patient_ref_hash: &str,
        forecast: Option<&RiskForecast>,
        interventions: &[Intervention],
        now: DateTime<Utc>,
    ) -> AlertEvaluation {
        let recommended: Vec<String> = interventions
            .iter()
            .map(|intervention| intervention.code.to_string())
            .collect();
        let mut raised = Vec::new();
        let mut suppressed = Vec::new();

        for (condition, severity, category) in self.conditions(profile, forecast) {
            let dedup_key = format!("{patient_ref_hash}:{}", condition.key());
            let alert_id = AlertId::new();
            if !self.cooldowns.try_claim(dedup_key.clone(), alert_id, now) {
                suppressed.push(dedup_key);
                continue;
            }
            raised.push(ClinicalAlert {
                alert_id,
                profile_id: profile.profile_id,
                patient_ref_hash: patient_ref_hash.to_string(),
                dedup_key,
                condition,
                severity,
                category,
                recommended_interventions: recommended.clone(),
                generated_at: now,
            });
        }

        AlertEvaluation {
            profile_id: profile.profile_id,
            raised,
            suppressed,
        }
    }

    /// Evaluates the profile and hands every raised alert to `publisher`.
    ///
    /// Publication failures release the cooldown claim so a later submission can retry,
    /// and never fail the caller.
    pub fn process<P: AlertPublisher + ?Sized>(
        &self,
        profile: &RiskProfile,
        patient_ref_hash: &str,
        forecast: Option<&RiskForecast>,
        interventions: &[Intervention],
        now: DateTime<Utc>,
        publisher: &P,
    ) -> AlertEvaluation {
        let mut evaluation = self.evaluate(profile, patient_ref_hash, forecast, interventions, now);

        if evaluation.raised.is_empty() {
            info!(
                profile_id = %profile.profile_id,
                band = %profile.band(),
                suppressed = evaluation.suppressed.len(),
                "alert evaluation completed without alerts"
            );
            return evaluation;
        }

        evaluation.raised.retain(|alert| match publisher.publish(alert) {
            Ok(()) => {
                info!(
                    alert_id = %alert.alert_id,
                    profile_id = %alert.profile_id,
                    severity = alert.severity.label(),
                    category = %alert.category,
                    "clinical alert raised"
                );
                metrics::counter!("risk_alerts_raised_total", "severity" => alert.severity.label())
                    .increment(1);
                true
            }
            Err(err) => {
                error!(
                    alert_id = %alert.alert_id,
                    profile_id = %alert.profile_id,
                    error = %err,
                    "clinical alert could not be handed to delivery"
                );
                self.cooldowns.remove(&alert.dedup_key);
                false
            }
        });

        evaluation
    }

    fn conditions(
        &self,
        profile: &RiskProfile,
        forecast: Option<&RiskForecast>,
    ) -> Vec<(AlertCondition, AlertSeverity, String)> {
        let mut conditions: Vec<(AlertCondition, AlertSeverity, String)> = profile
            .safety_flags()
            .iter()
            .map(|flag| {
                (
                    AlertCondition::SafetyFlag { flag },
                    AlertSeverity::Critical,
                    flag.label().to_string(),
                )
            })
            .collect();

        let band = profile.band();
        if band >= self.config.band_threshold {
            conditions.push((
                AlertCondition::BandThreshold { band },
                AlertSeverity::for_band(band),
                profile.primary_category().label().to_string(),
            ));
        }

        if let Some(forecast) = forecast.filter(|forecast| {
            forecast.escalates() && forecast.confidence >= self.config.min_forecast_confidence
        }) {
            conditions.push((
                AlertCondition::ForecastEscalation {
                    projected_band: forecast.projected_band,
                },
                AlertSeverity::for_band(forecast.projected_band),
                profile.primary_category().label().to_string(),
            ));
        }

        conditions
    }
}
