use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{InstrumentType, ProfileId, RiskBand, RiskProfile};

use super::PopulationIndex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub profile_id: ProfileId,
    pub instrument: InstrumentType,
    pub band: RiskBand,
    pub distance: f64,
    pub computed_at: DateTime<Utc>,
}

/// Up to `k` nearest population entries, ordered by ascending distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarPatientMatch {
    pub profile_id: ProfileId,
    pub k: usize,
    pub neighbors: Vec<Neighbor>,
}

impl SimilarPatientMatch {
    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    /// Fraction of neighbors whose band is strictly above `band`.
    pub fn share_above(&self, band: RiskBand) -> f64 {
        self.share(|neighbor| neighbor.band > band)
    }

    pub fn share_below(&self, band: RiskBand) -> f64 {
        self.share(|neighbor| neighbor.band < band)
    }

    pub fn share_matching(&self, band: RiskBand) -> f64 {
        self.share(|neighbor| neighbor.band == band)
    }

    fn share(&self, predicate: impl Fn(&Neighbor) -> bool) -> f64 {
        if self.neighbors.is_empty() {
            return 0.0;
        }
        let count = self.neighbors.iter().filter(|n| predicate(n)).count();
        count as f64 / self.neighbors.len() as f64
    }
}

/// Linear-scan k-nearest-neighbor search over a population snapshot.
pub struct SimilarityMatcher;

impl SimilarityMatcher {
    /// Ties on distance prefer the most recent entry, then the lowest profile id.
    pub fn find_similar(
        profile: &RiskProfile,
        k: usize,
        population: &PopulationIndex,
    ) -> SimilarPatientMatch {
        if k == 0 || population.is_empty() {
            return SimilarPatientMatch {
                profile_id: profile.profile_id,
                k,
                neighbors: Vec::new(),
            };
        }

        let query = population.project(profile.features());
        let mut neighbors: Vec<Neighbor> = population
            .entries()
            .iter()
            .filter(|entry| entry.profile_id != profile.profile_id)
            .map(|entry| {
                let candidate = population.project(&entry.features);
                let distance = query
                    .iter()
                    .zip(candidate.iter())
                    .map(|(left, right)| (left - right).powi(2))
                    .sum::<f64>()
                    .sqrt();
                Neighbor {
                    profile_id: entry.profile_id,
                    instrument: entry.instrument.clone(),
                    band: entry.band,
                    distance,
                    computed_at: entry.computed_at,
                }
            })
            .collect();

        neighbors.sort_by(compare_neighbors);
        neighbors.truncate(k);

        SimilarPatientMatch {
            profile_id: profile.profile_id,
            k,
            neighbors,
        }
    }
}

fn compare_neighbors(left: &Neighbor, right: &Neighbor) -> Ordering {
    left.distance
        .total_cmp(&right.distance)
        .then_with(|| right.computed_at.cmp(&left.computed_at))
        .then_with(|| left.profile_id.cmp(&right.profile_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Category, FeatureVector, ResponseId, SafetyFlags, ScoreCard, FEATURE_DIMENSIONS,
    };
    use crate::population::PopulationEntry;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 1, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn features(depression: f64) -> FeatureVector {
        let mut values = [0.0; FEATURE_DIMENSIONS];
        values[0] = depression;
        FeatureVector(values)
    }

    fn profile(depression: f64) -> RiskProfile {
        RiskProfile::derive(
            ResponseId::new(),
            ScoreCard {
                instrument: InstrumentType::Phq9,
                tables_version: "test".to_string(),
                category_scores: BTreeMap::from([(Category::Depression, 0)]),
                primary_category: Category::Depression,
                primary_score: 0,
                band: RiskBand::Low,
                safety_flags: SafetyFlags::default(),
                features: features(depression),
            },
            base_time(),
        )
    }

    fn entry(id: u128, depression: f64, band: RiskBand, age_days: i64) -> PopulationEntry {
        PopulationEntry {
            profile_id: ProfileId(Uuid::from_u128(id)),
            instrument: InstrumentType::Phq9,
            band,
            features: features(depression),
            computed_at: base_time() - Duration::days(age_days),
        }
    }

    #[test]
    fn returns_k_nearest_in_ascending_distance() {
        let index = PopulationIndex::new(vec![
            entry(1, 0.9, RiskBand::High, 1),
            entry(2, 0.45, RiskBand::Moderate, 1),
            entry(3, 0.1, RiskBand::Low, 1),
            entry(4, 0.55, RiskBand::Moderate, 1),
        ]);

        let matched = SimilarityMatcher::find_similar(&profile(0.5), 2, &index);

        let ids: Vec<u128> = matched.neighbors.iter().map(|n| n.profile_id.0.as_u128()).collect();
        assert_eq!(matched.len(), 2);
        assert!(ids.contains(&2) && ids.contains(&4));
        assert!(matched.neighbors[0].distance <= matched.neighbors[1].distance);
    }

    #[test]
    fn ties_prefer_recent_then_lowest_id() {
        let index = PopulationIndex::new(vec![
            entry(9, 0.6, RiskBand::Moderate, 10),
            entry(7, 0.6, RiskBand::Moderate, 2),
            entry(5, 0.6, RiskBand::Moderate, 2),
        ]);

        let matched = SimilarityMatcher::find_similar(&profile(0.6), 3, &index);

        let ids: Vec<u128> = matched.neighbors.iter().map(|n| n.profile_id.0.as_u128()).collect();
        assert_eq!(ids, vec![5, 7, 9]);
    }

    #[test]
    fn fewer_entries_than_k_returns_all() {
        let index = PopulationIndex::new(vec![entry(1, 0.2, RiskBand::Low, 1)]);
        let matched = SimilarityMatcher::find_similar(&profile(0.2), 10, &index);
        assert_eq!(matched.len(), 1);
        assert_eq!(matched.k, 10);
    }

    #[test]
    fn zero_k_or_empty_population_yield_no_neighbors() {
        let index = PopulationIndex::new(vec![entry(1, 0.2, RiskBand::Low, 1)]);
        assert!(SimilarityMatcher::find_similar(&profile(0.2), 0, &index).is_empty());
        assert!(
            SimilarityMatcher::find_similar(&profile(0.2), 5, &PopulationIndex::default())
                .is_empty()
        );
    }

    #[test]
    fn query_profile_is_excluded() {
        let query = profile(0.3);
        let mut own = entry(1, 0.3, RiskBand::Low, 0);
        own.profile_id = query.profile_id;
        let index = PopulationIndex::new(vec![own, entry(2, 0.8, RiskBand::High, 0)]);

        let matched = SimilarityMatcher::find_similar(&query, 5, &index);

        assert_eq!(matched.len(), 1);
        assert_eq!(matched.neighbors[0].profile_id.0.as_u128(), 2);
    }

    #[test]
    fn band_shares_are_fractions_of_neighbors() {
        let index = PopulationIndex::new(vec![
            entry(1, 0.5, RiskBand::High, 1),
            entry(2, 0.5, RiskBand::High, 1),
            entry(3, 0.5, RiskBand::Low, 1),
            entry(4, 0.5, RiskBand::Moderate, 1),
        ]);
        let matched = SimilarityMatcher::find_similar(&profile(0.5), 4, &index);

        assert!((matched.share_above(RiskBand::Moderate) - 0.5).abs() < 1e-9);
        assert!((matched.share_below(RiskBand::Moderate) - 0.25).abs() < 1e-9);
        assert!((matched.share_matching(RiskBand::Moderate) - 0.25).abs() < 1e-9);
    }
}
