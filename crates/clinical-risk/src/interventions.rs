use std::collections::BTreeSet;

use serde::Serialize;

use crate::domain::{Category, RiskBand, RiskProfile, SafetyFlag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Immediate,
    Soon,
    Routine,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Intervention {
    pub code: &'static str,
    pub title: &'static str,
    /// Lower values sort first.
    pub priority: u8,
    pub urgency: Urgency,
}

/// A rule matches when the band reaches `min_band` and every optional condition holds.
#[derive(Debug, Clone)]
pub struct InterventionRule {
    pub min_band: RiskBand,
    pub flag: Option<SafetyFlag>,
    pub category: Option<Category>,
    pub intervention: Intervention,
}

impl InterventionRule {
    fn matches(&self, profile: &RiskProfile) -> bool {
        profile.band() >= self.min_band
            && self
                .flag
                .map_or(true, |flag| profile.safety_flags().is_set(flag))
            && self
                .category
                .map_or(true, |category| profile.primary_category() == category)
    }
}

const fn rule(
    min_band: RiskBand,
    flag: Option<SafetyFlag>,
    category: Option<Category>,
    code: &'static str,
    title: &'static str,
    priority: u8,
    urgency: Urgency,
) -> InterventionRule {
    InterventionRule {
        min_band,
        flag,
        category,
        intervention: Intervention {
            code,
            title,
            priority,
            urgency,
        },
    }
}

const DEFAULT_RULES: &[InterventionRule] = &[
    rule(
        RiskBand::Low,
        Some(SafetyFlag::SuicideIdeation),
        None,
        "crisis_safety_plan",
        "Complete a crisis safety plan with the patient",
        0,
        Urgency::Immediate,
    ),
    rule(
        RiskBand::Low,
        Some(SafetyFlag::SuicideIdeation),
        None,
        "crisis_line_referral",
        "Provide crisis line contact details",
        1,
        Urgency::Immediate,
    ),
    rule(
        RiskBand::Low,
        Some(SafetyFlag::AnaphylaxisNoEpipen),
        None,
        "epinephrine_prescription",
        "Prescribe an epinephrine auto-injector and train on use",
        2,
        Urgency::Immediate,
    ),
    rule(
        RiskBand::Critical,
        None,
        Some(Category::Depression),
        "urgent_psychiatric_evaluation",
        "Arrange urgent psychiatric evaluation",
        3,
        Urgency::Immediate,
    ),
    rule(
        RiskBand::High,
        None,
        Some(Category::Depression),
        "psychotherapy_and_medication_review",
        "Start psychotherapy and review medication",
        10,
        Urgency::Soon,
    ),
    rule(
        RiskBand::High,
        None,
        Some(Category::AlcoholUse),
        "substance_use_treatment_referral",
        "Refer to substance use treatment services",
        11,
        Urgency::Soon,
    ),
    rule(
        RiskBand::High,
        None,
        Some(Category::Wellbeing),
        "behavioral_health_referral",
        "Refer to behavioral health for assessment",
        12,
        Urgency::Soon,
    ),
    rule(
        RiskBand::Moderate,
        None,
        Some(Category::Anxiety),
        "anxiety_cbt_referral",
        "Refer for cognitive behavioral therapy",
        20,
        Urgency::Routine,
    ),
    rule(
        RiskBand::Moderate,
        None,
        Some(Category::AlcoholUse),
        "brief_alcohol_intervention",
        "Deliver a brief alcohol intervention",
        21,
        Urgency::Routine,
    ),
    rule(
        RiskBand::Moderate,
        None,
        Some(Category::Depression),
        "depression_screening_followup",
        "Repeat depression screening within four weeks",
        22,
        Urgency::Routine,
    ),
    rule(
        RiskBand::Moderate,
        None,
        None,
        "behavioral_health_referral",
        "Refer to behavioral health for assessment",
        23,
        Urgency::Routine,
    ),
];

/// Static rule lookup from profile to recommended interventions.
#[derive(Debug, Clone)]
pub struct InterventionRecommender {
    rules: Vec<InterventionRule>,
}

impl InterventionRecommender {
    pub fn new(rules: Vec<InterventionRule>) -> Self {
        Self { rules }
    }

    /// Matching interventions, deduplicated by code and ordered by priority then code.
    ///
    /// When two rules share a code the higher-priority one wins. An empty list is valid.
    pub fn recommend(&self, profile: &RiskProfile) -> Vec<Intervention> {
        let mut matched: Vec<&Intervention> = self
            .rules
            .iter()
            .filter(|rule| rule.matches(profile))
            .map(|rule| &rule.intervention)
            .collect();
        matched.sort_by(|left, right| {
            left.priority
                .cmp(&right.priority)
                .then_with(|| left.code.cmp(right.code))
        });

        let mut seen = BTreeSet::new();
        matched
            .into_iter()
            .filter(|intervention| seen.insert(intervention.code))
            .cloned()
            .collect()
    }
}

impl Default for InterventionRecommender {
    fn default() -> Self {
        Self::new(DEFAULT_RULES.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::domain::{FeatureVector, InstrumentType, ResponseId, SafetyFlags, ScoreCard};

    fn profile(
        instrument: InstrumentType,
        category: Category,
        band: RiskBand,
        flags: &[SafetyFlag],
    ) -> RiskProfile {
        RiskProfile::derive(
            ResponseId::new(),
            ScoreCard {
                instrument,
                tables_version: "test".to_string(),
                category_scores: BTreeMap::from([(category, 0)]),
                primary_category: category,
                primary_score: 0,
                band,
                safety_flags: flags.iter().copied().collect::<SafetyFlags>(),
                features: FeatureVector::zeros(),
            },
            Utc::now(),
        )
    }

    fn codes(interventions: &[Intervention]) -> Vec<&'static str> {
        interventions.iter().map(|i| i.code).collect()
    }

    #[test]
    fn suicide_flag_puts_crisis_steps_first() {
        let recommendations = InterventionRecommender::default().recommend(&profile(
            InstrumentType::Phq9,
            Category::Depression,
            RiskBand::Moderate,
            &[SafetyFlag::SuicideIdeation],
        ));

        assert_eq!(
            codes(&recommendations),
            vec![
                "crisis_safety_plan",
                "crisis_line_referral",
                "depression_screening_followup",
                "behavioral_health_referral",
            ]
        );
    }

    #[test]
    fn anaphylaxis_without_epinephrine_recommends_prescription() {
        let recommendations = InterventionRecommender::default().recommend(&profile(
            InstrumentType::Custom("allergy-history".to_string()),
            Category::Allergy,
            RiskBand::Low,
            &[SafetyFlag::AnaphylaxisNoEpipen],
        ));
        assert_eq!(codes(&recommendations), vec!["epinephrine_prescription"]);
    }

    #[test]
    fn duplicate_codes_keep_highest_priority_rule() {
        let recommendations = InterventionRecommender::default().recommend(&profile(
            InstrumentType::Who5,
            Category::Wellbeing,
            RiskBand::High,
            &[],
        ));

        assert_eq!(codes(&recommendations), vec!["behavioral_health_referral"]);
        assert_eq!(recommendations[0].priority, 12);
    }

    #[test]
    fn critical_depression_includes_urgent_evaluation() {
        let recommendations = InterventionRecommender::default().recommend(&profile(
            InstrumentType::Phq9,
            Category::Depression,
            RiskBand::Critical,
            &[],
        ));
        assert_eq!(recommendations[0].code, "urgent_psychiatric_evaluation");
        assert!(codes(&recommendations).contains(&"psychotherapy_and_medication_review"));
    }

    #[test]
    fn low_band_without_flags_is_empty() {
        let recommendations = InterventionRecommender::default().recommend(&profile(
            InstrumentType::Gad7,
            Category::Anxiety,
            RiskBand::Low,
            &[],
        ));
        assert!(recommendations.is_empty());
    }
}
