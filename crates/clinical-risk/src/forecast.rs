//! Band projection combining neighbor outcomes with the population trend.
//!
//! Rules are evaluated in order and the first match wins:
//! 1. escalate one band when most neighbors sit higher and the population is worsening;
//! 2. de-escalate one band when most neighbors sit lower, the population is improving,
//!    and no safety flag is active;
//! 3. otherwise hold the current band.

use serde::{Deserialize, Serialize};

use crate::domain::{ProfileId, RiskBand, RiskProfile};
use crate::population::{SimilarPatientMatch, TrendDirection, TrendReport};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastConfig {
    /// Share of neighbors required to agree on a direction.
    pub agreement_ratio: f64,
    /// Neighbor count at which sample size stops discounting confidence.
    pub neighbor_floor: usize,
    pub max_horizon_days: u32,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            agreement_ratio: 0.6,
            neighbor_floor: 5,
            max_horizon_days: 365,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastRule {
    Escalate,
    DeEscalate,
    Hold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskForecast {
    pub profile_id: ProfileId,
    pub horizon_days: u32,
    pub current_band: RiskBand,
    pub projected_band: RiskBand,
    pub confidence: f64,
    pub rule: ForecastRule,
    pub neighbor_count: usize,
    pub trend: TrendDirection,
}

impl RiskForecast {
    pub fn escalates(&self) -> bool {
        self.projected_band > self.current_band
    }
}

#[derive(Debug, Clone)]
pub struct RiskForecaster {
    config: ForecastConfig,
}

impl RiskForecaster {
    pub fn new(config: ForecastConfig) -> Self {
        Self { config }
    }

    /// A missing trend report is treated as a stable population.
    pub fn forecast(
        &self,
        profile: &RiskProfile,
        trend: Option<&TrendReport>,
        neighbors: &SimilarPatientMatch,
        horizon_days: u32,
    ) -> Result<RiskForecast, ForecastError> {
        if horizon_days == 0 || horizon_days > self.config.max_horizon_days {
            return Err(ForecastError::InvalidHorizon {
                horizon_days,
                max: self.config.max_horizon_days,
            });
        }

        let current = profile.band();
        let direction = trend.map_or(TrendDirection::Stable, |report| report.direction);
        let above = neighbors.share_above(current);
        let below = neighbors.share_below(current);
        let threshold = self.config.agreement_ratio;

        let (rule, projected, agreement) = if above >= threshold
            && direction == TrendDirection::Worsening
            && current != RiskBand::Critical
        {
            (ForecastRule::Escalate, current.step_up(), above)
        } else if below >= threshold
            && direction == TrendDirection::Improving
            && !profile.safety_flags().any()
            && current != RiskBand::Low
        {
            (ForecastRule::DeEscalate, current.step_down(), below)
        } else {
            (
                ForecastRule::Hold,
                current,
                neighbors.share_matching(current),
            )
        };

        let confidence = self.confidence(agreement, neighbors.len(), horizon_days);

        Ok(RiskForecast {
            profile_id: profile.profile_id,
            horizon_days,
            current_band: current,
            projected_band: projected,
            confidence,
            rule,
            neighbor_count: neighbors.len(),
            trend: direction,
        })
    }

    fn confidence(&self, agreement: f64, neighbor_count: usize, horizon_days: u32) -> f64 {
        if neighbor_count == 0 {
            return 0.0;
        }
        let floor = self.config.neighbor_floor.max(1) as f64;
        let sample_factor = (neighbor_count as f64 / floor).min(1.0);
        let horizon_factor = 1.0 / (1.0 + f64::from(horizon_days) / 365.0);
        (agreement * sample_factor * horizon_factor).clamp(0.0, 1.0)
    }
}

impl Default for RiskForecaster {
    fn default() -> Self {
        Self::new(ForecastConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ForecastError {
    #[error("forecast horizon must be between 1 and {max} days, got {horizon_days}")]
    InvalidHorizon { horizon_days: u32, max: u32 },
}
