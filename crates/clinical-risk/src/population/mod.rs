//! Read-only population snapshot plus the analyses that run against it.
//!
//! The index is rebuilt outside the request path and swapped in whole through
//! [`PopulationHandle`]; readers always work on one immutable snapshot.

mod import;
mod similarity;
mod trend;

pub use import::PopulationImportError;
pub use similarity::{Neighbor, SimilarPatientMatch, SimilarityMatcher};
pub use trend::{
    BandCounts, PopulationTrendAnalyzer, TimeRange, TrendConfig, TrendDirection, TrendError,
    TrendReport,
};

use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    FeatureVector, InstrumentType, ProfileId, RiskBand, RiskProfile, FEATURE_DIMENSIONS,
};

/// De-identified profile summary held in the population snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationEntry {
    pub profile_id: ProfileId,
    pub instrument: InstrumentType,
    pub band: RiskBand,
    pub features: FeatureVector,
    pub computed_at: DateTime<Utc>,
}

impl From<&RiskProfile> for PopulationEntry {
    fn from(profile: &RiskProfile) -> Self {
        Self {
            profile_id: profile.profile_id,
            instrument: profile.scores.instrument.clone(),
            band: profile.band(),
            features: profile.scores.features,
            computed_at: profile.computed_at,
        }
    }
}

/// Per-dimension z-score parameters fitted on the population.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureScaling {
    means: [f64; FEATURE_DIMENSIONS],
    std_devs: [f64; FEATURE_DIMENSIONS],
}

impl FeatureScaling {
    pub fn fit(entries: &[PopulationEntry]) -> Self {
        let mut means = [0.0; FEATURE_DIMENSIONS];
        let mut std_devs = [1.0; FEATURE_DIMENSIONS];
        if entries.is_empty() {
            return Self { means, std_devs };
        }

        let count = entries.len() as f64;
        for dimension in 0..FEATURE_DIMENSIONS {
            let mean = entries
                .iter()
                .map(|entry| entry.features.0[dimension])
                .sum::<f64>()
                / count;
            let variance = entries
                .iter()
                .map(|entry| (entry.features.0[dimension] - mean).powi(2))
                .sum::<f64>()
                / count;
            means[dimension] = mean;
            let std_dev = variance.sqrt();
            std_devs[dimension] = if std_dev > f64::EPSILON { std_dev } else { 1.0 };
        }
        Self { means, std_devs }
    }

    pub fn apply(&self, features: &FeatureVector) -> [f64; FEATURE_DIMENSIONS] {
        let mut scaled = features.0;
        for (dimension, value) in scaled.iter_mut().enumerate() {
            *value = (*value - self.means[dimension]) / self.std_devs[dimension];
        }
        scaled
    }
}

#[derive(Debug, Clone, Default)]
pub struct PopulationIndex {
    entries: Vec<PopulationEntry>,
    scaling: Option<FeatureScaling>,
}

impl PopulationIndex {
    /// Index over raw feature vectors.
    pub fn new(entries: Vec<PopulationEntry>) -> Self {
        Self {
            entries,
            scaling: None,
        }
    }

    /// Index that z-score normalizes features before distance comparisons.
    pub fn with_zscore(entries: Vec<PopulationEntry>) -> Self {
        let scaling = FeatureScaling::fit(&entries);
        Self {
            entries,
            scaling: Some(scaling),
        }
    }

    pub fn entries(&self) -> &[PopulationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn scaling(&self) -> Option<&FeatureScaling> {
        self.scaling.as_ref()
    }

    pub(crate) fn project(&self, features: &FeatureVector) -> [f64; FEATURE_DIMENSIONS] {
        match &self.scaling {
            Some(scaling) => scaling.apply(features),
            None => features.0,
        }
    }
}

/// Shared pointer to the current population snapshot.
#[derive(Debug, Default)]
pub struct PopulationHandle {
    current: RwLock<Arc<PopulationIndex>>,
}

impl PopulationHandle {
    pub fn new(index: PopulationIndex) -> Self {
        Self {
            current: RwLock::new(Arc::new(index)),
        }
    }

    pub fn snapshot(&self) -> Arc<PopulationIndex> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Installs a rebuilt index. Readers holding the previous snapshot are unaffected.
    pub fn replace(&self, index: PopulationIndex) -> Arc<PopulationIndex> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, Arc::new(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn entry(value: f64) -> PopulationEntry {
        PopulationEntry {
            profile_id: ProfileId(Uuid::new_v4()),
            instrument: InstrumentType::Phq9,
            band: RiskBand::Low,
            features: FeatureVector([value; FEATURE_DIMENSIONS]),
            computed_at: Utc
                .with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
                .single()
                .expect("valid timestamp"),
        }
    }

    #[test]
    fn zscore_centres_each_dimension() {
        let index = PopulationIndex::with_zscore(vec![entry(0.2), entry(0.4), entry(0.6)]);
        let projected = index.project(&FeatureVector([0.4; FEATURE_DIMENSIONS]));
        assert!(projected.iter().all(|value| value.abs() < 1e-9));
    }

    #[test]
    fn constant_dimensions_do_not_divide_by_zero() {
        let index = PopulationIndex::with_zscore(vec![entry(0.5), entry(0.5)]);
        let projected = index.project(&FeatureVector([1.0; FEATURE_DIMENSIONS]));
        assert!(projected.iter().all(|value| (value - 0.5).abs() < 1e-9));
    }

    #[test]
    fn replacing_snapshot_leaves_existing_readers_untouched() {
        let handle = PopulationHandle::new(PopulationIndex::new(vec![entry(0.1)]));
        let before = handle.snapshot();

        let previous = handle.replace(PopulationIndex::new(vec![entry(0.1), entry(0.2)]));

        assert_eq!(before.len(), 1);
        assert_eq!(previous.len(), 1);
        assert_eq!(handle.snapshot().len(), 2);
    }
}
