use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::RiskBand;

use super::PopulationIndex;

/// Half-open window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, TrendError> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    pub fn trailing(end: DateTime<Utc>, length: Duration) -> Self {
        Self {
            start: end - length,
            end,
        }
    }

    pub fn midpoint(&self) -> DateTime<Utc> {
        self.start + (self.end - self.start) / 2
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }

    pub fn validate(&self) -> Result<(), TrendError> {
        if self.start >= self.end {
            return Err(TrendError::InvalidWindow);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Worsening,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BandCounts {
    pub low: usize,
    pub moderate: usize,
    pub high: usize,
    pub critical: usize,
}

impl BandCounts {
    pub fn record(&mut self, band: RiskBand) {
        match band {
            RiskBand::Low => self.low += 1,
            RiskBand::Moderate => self.moderate += 1,
            RiskBand::High => self.high += 1,
            RiskBand::Critical => self.critical += 1,
        }
    }

    pub fn get(&self, band: RiskBand) -> usize {
        match band {
            RiskBand::Low => self.low,
            RiskBand::Moderate => self.moderate,
            RiskBand::High => self.high,
            RiskBand::Critical => self.critical,
        }
    }

    pub fn total(&self) -> usize {
        self.low + self.moderate + self.high + self.critical
    }

    /// Share of `band` in percent. Zero when empty.
    pub fn share_pct(&self, band: RiskBand) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.get(band) as f64 * 100.0 / total as f64,
        }
    }

    pub fn elevated_share_pct(&self) -> f64 {
        self.share_pct(RiskBand::High) + self.share_pct(RiskBand::Critical)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrendConfig {
    pub min_samples: usize,
    /// Percentage-point change in the elevated share treated as noise.
    pub stable_tolerance_pct: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            min_samples: 30,
            stable_tolerance_pct: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendReport {
    pub window: TimeRange,
    pub sample_count: usize,
    pub opening: BandCounts,
    pub closing: BandCounts,
    /// Closing share minus opening share, in percentage points.
    pub band_deltas: BTreeMap<RiskBand, f64>,
    pub elevated_delta_pct: f64,
    pub direction: TrendDirection,
}

#[derive(Debug, Clone)]
pub struct PopulationTrendAnalyzer {
    config: TrendConfig,
}

impl PopulationTrendAnalyzer {
    pub fn new(config: TrendConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TrendConfig {
        &self.config
    }

    /// Compares band shares between the two halves of `window`.
    pub fn analyze(
        &self,
        window: TimeRange,
        population: &PopulationIndex,
    ) -> Result<TrendReport, TrendError> {
        window.validate()?;
        let midpoint = window.midpoint();
        let mut opening = BandCounts::default();
        let mut closing = BandCounts::default();

        for entry in population
            .entries()
            .iter()
            .filter(|entry| window.contains(entry.computed_at))
        {
            if entry.computed_at < midpoint {
                opening.record(entry.band);
            } else {
                closing.record(entry.band);
            }
        }

        let sample_count = opening.total() + closing.total();
        if sample_count < self.config.min_samples || opening.total() == 0 || closing.total() == 0 {
            debug!(
                sample_count,
                opening = opening.total(),
                closing = closing.total(),
                required = self.config.min_samples,
                "population trend window lacks data"
            );
            return Err(TrendError::InsufficientData {
                required: self.config.min_samples,
                found: sample_count,
            });
        }

        let band_deltas = RiskBand::ordered()
            .into_iter()
            .map(|band| (band, closing.share_pct(band) - opening.share_pct(band)))
            .collect();
        let elevated_delta_pct = closing.elevated_share_pct() - opening.elevated_share_pct();
        let direction = if elevated_delta_pct > self.config.stable_tolerance_pct {
            TrendDirection::Worsening
        } else if elevated_delta_pct < -self.config.stable_tolerance_pct {
            TrendDirection::Improving
        } else {
            TrendDirection::Stable
        };

        Ok(TrendReport {
            window,
            sample_count,
            opening,
            closing,
            band_deltas,
            elevated_delta_pct,
            direction,
        })
    }
}

impl Default for PopulationTrendAnalyzer {
    fn default() -> Self {
        Self::new(TrendConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrendError {
    #[error("insufficient population data: {found} profiles in window, {required} required with both halves populated")]
    InsufficientData { required: usize, found: usize },
    #[error("trend window start must precede its end")]
    InvalidWindow,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FeatureVector, InstrumentType, ProfileId};
    use crate::population::PopulationEntry;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn window() -> TimeRange {
        let end = Utc
            .with_ymd_and_hms(2025, 4, 1, 0, 0, 0)
            .single()
            .expect("valid timestamp");
        TimeRange::trailing(end, Duration::days(90))
    }

    fn entries(band: RiskBand, count: usize, at: DateTime<Utc>) -> Vec<PopulationEntry> {
        (0..count)
            .map(|_| PopulationEntry {
                profile_id: ProfileId(Uuid::new_v4()),
                instrument: InstrumentType::Phq9,
                band,
                features: FeatureVector::zeros(),
                computed_at: at,
            })
            .collect()
    }

    fn population(opening: &[(RiskBand, usize)], closing: &[(RiskBand, usize)]) -> PopulationIndex {
        let window = window();
        let early = window.start + Duration::days(10);
        let late = window.end - Duration::days(10);
        let mut all = Vec::new();
        for (band, count) in opening {
            all.extend(entries(*band, *count, early));
        }
        for (band, count) in closing {
            all.extend(entries(*band, *count, late));
        }
        PopulationIndex::new(all)
    }

    #[test]
    fn rising_elevated_share_is_worsening() {
        let index = population(
            &[(RiskBand::Low, 16), (RiskBand::High, 4)],
            &[(RiskBand::Low, 12), (RiskBand::High, 6), (RiskBand::Critical, 2)],
        );

        let report = PopulationTrendAnalyzer::default()
            .analyze(window(), &index)
            .expect("enough data");

        assert_eq!(report.sample_count, 40);
        assert_eq!(report.direction, TrendDirection::Worsening);
        assert!((report.elevated_delta_pct - 20.0).abs() < 1e-9);
        assert!((report.band_deltas[&RiskBand::Low] + 20.0).abs() < 1e-9);
    }

    #[test]
    fn falling_elevated_share_is_improving() {
        let index = population(
            &[(RiskBand::Moderate, 10), (RiskBand::High, 10)],
            &[(RiskBand::Moderate, 16), (RiskBand::High, 4)],
        );

        let report = PopulationTrendAnalyzer::default()
            .analyze(window(), &index)
            .expect("enough data");

        assert_eq!(report.direction, TrendDirection::Improving);
    }

    #[test]
    fn changes_within_tolerance_are_stable() {
        let index = population(
            &[(RiskBand::Low, 15), (RiskBand::High, 5)],
            &[(RiskBand::Low, 14), (RiskBand::High, 6)],
        );

        let report = PopulationTrendAnalyzer::default()
            .analyze(window(), &index)
            .expect("enough data");

        assert_eq!(report.direction, TrendDirection::Stable);
    }

    #[test]
    fn sparse_windows_report_insufficient_data() {
        let index = population(&[(RiskBand::Low, 10)], &[(RiskBand::High, 10)]);

        match PopulationTrendAnalyzer::default().analyze(window(), &index) {
            Err(TrendError::InsufficientData { required, found }) => {
                assert_eq!(required, 30);
                assert_eq!(found, 20);
            }
            other => panic!("expected insufficient data, got {other:?}"),
        }
    }

    #[test]
    fn empty_half_reports_insufficient_data() {
        let index = population(&[], &[(RiskBand::High, 40)]);
        assert!(matches!(
            PopulationTrendAnalyzer::default().analyze(window(), &index),
            Err(TrendError::InsufficientData { .. })
        ));
    }

    #[test]
    fn entries_outside_window_are_ignored() {
        let window = window();
        let mut all = entries(RiskBand::Critical, 50, window.start - Duration::days(1));
        all.extend(entries(RiskBand::Critical, 50, window.end));
        let index = PopulationIndex::new(all);

        match PopulationTrendAnalyzer::default().analyze(window, &index) {
            Err(TrendError::InsufficientData { found, .. }) => assert_eq!(found, 0),
            other => panic!("expected insufficient data, got {other:?}"),
        }
    }

    #[test]
    fn inverted_window_is_rejected() {
        let window = window();
        assert_eq!(
            TimeRange::new(window.end, window.start),
            Err(TrendError::InvalidWindow)
        );
    }
}
