use std::collections::BTreeMap;

use crate::domain::{Category, FeatureVector, RiskBand, SafetyFlags};

use super::tables::InstrumentSchema;

/// Min-max scales category scores into the fixed feature layout.
///
/// Categories the instrument does not measure stay at zero. Wellbeing is stored as a deficit
/// so every dimension grows with risk.
pub fn build_features(
    schema: &InstrumentSchema,
    category_scores: &BTreeMap<Category, u32>,
    band: RiskBand,
    safety_flags: &SafetyFlags,
) -> FeatureVector {
    let mut features = FeatureVector::zeros();

    for (category, score) in category_scores {
        let max = schema.category_max(*category);
        if max == 0 {
            continue;
        }
        let ratio = (f64::from(*score) / f64::from(max)).clamp(0.0, 1.0);
        features.0[category.feature_index()] = match category {
            Category::Wellbeing => 1.0 - ratio,
            _ => ratio,
        };
    }

    features.0[FeatureVector::BAND_DIMENSION] = f64::from(band.ordinal()) / 3.0;
    features.0[FeatureVector::SAFETY_DIMENSION] = if safety_flags.any() { 1.0 } else { 0.0 };
    features
}
