use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deriving profile identifiers from response identifiers.
const PROFILE_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2b7e_84a3_4d6b_9e21_5c0f_a7d3_1b48);

/// Number of dimensions in every risk feature vector.
pub const FEATURE_DIMENSIONS: usize = 7;

/// Identifier wrapper for sealed questionnaire responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseId(pub Uuid);

impl ResponseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResponseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier for a derived risk profile, stable for a given response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(pub Uuid);

impl ProfileId {
    pub fn for_response(response_id: ResponseId) -> Self {
        Self(Uuid::new_v5(&PROFILE_NAMESPACE, response_id.0.as_bytes()))
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque reference to the owning patient record.
///
/// Only deserializable: the raw reference never leaves the engine, outward structures carry
/// the keyed hash produced by [`crate::phi::PatientRefHasher`] instead.
#[derive(Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(transparent)]
pub struct PatientRef(String);

impl PatientRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for PatientRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PatientRef([REDACTED])")
    }
}

/// Questionnaire instruments understood by the scoring tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InstrumentType {
    Phq9,
    Gad7,
    AuditC,
    Who5,
    Custom(String),
}

impl InstrumentType {
    pub fn code(&self) -> &str {
        match self {
            Self::Phq9 => "phq9",
            Self::Gad7 => "gad7",
            Self::AuditC => "audit_c",
            Self::Who5 => "who5",
            Self::Custom(name) => name.as_str(),
        }
    }
}

impl From<String> for InstrumentType {
    fn from(value: String) -> Self {
        let normalized: String = value
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| *c != '-' && *c != '_' && *c != ' ')
            .collect();
        match normalized.as_str() {
            "phq9" => Self::Phq9,
            "gad7" => Self::Gad7,
            "auditc" => Self::AuditC,
            "who5" => Self::Who5,
            _ => Self::Custom(value.trim().to_ascii_lowercase()),
        }
    }
}

impl From<&str> for InstrumentType {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<InstrumentType> for String {
    fn from(value: InstrumentType) -> Self {
        value.code().to_string()
    }
}

impl fmt::Display for InstrumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Clinical categories a question can contribute to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Depression,
    Anxiety,
    AlcoholUse,
    Wellbeing,
    Allergy,
}

impl Category {
    pub const fn ordered() -> [Self; 5] {
        [
            Self::Depression,
            Self::Anxiety,
            Self::AlcoholUse,
            Self::Wellbeing,
            Self::Allergy,
        ]
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Depression => "depression",
            Self::Anxiety => "anxiety",
            Self::AlcoholUse => "alcohol_use",
            Self::Wellbeing => "wellbeing",
            Self::Allergy => "allergy",
        }
    }

    pub(crate) const fn feature_index(self) -> usize {
        match self {
            Self::Depression => 0,
            Self::Anxiety => 1,
            Self::AlcoholUse => 2,
            Self::Wellbeing => 3,
            Self::Allergy => 4,
        }
    }
}

/// Ordinal risk classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskBand {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskBand {
    pub const fn ordered() -> [Self; 4] {
        [Self::Low, Self::Moderate, Self::High, Self::Critical]
    }

    pub const fn ordinal(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Moderate => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// One level more severe, saturating at critical.
    pub const fn step_up(self) -> Self {
        match self {
            Self::Low => Self::Moderate,
            Self::Moderate => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }

    /// One level less severe, saturating at low.
    pub const fn step_down(self) -> Self {
        match self {
            Self::Low | Self::Moderate => Self::Low,
            Self::High => Self::Moderate,
            Self::Critical => Self::High,
        }
    }

    pub fn distance(self, other: Self) -> u8 {
        self.ordinal().abs_diff(other.ordinal())
    }
}

impl fmt::Display for RiskBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown risk band '{0}' (expected low, moderate, high, or critical)")]
pub struct ParseRiskBandError(pub String);

impl FromStr for RiskBand {
    type Err = ParseRiskBandError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "moderate" => Ok(Self::Moderate),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(ParseRiskBandError(value.to_string())),
        }
    }
}

/// Acute-risk indicators raised independently of the aggregate score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyFlag {
    SuicideIdeation,
    AnaphylaxisNoEpipen,
}

impl SafetyFlag {
    pub const fn label(self) -> &'static str {
        match self {
            Self::SuicideIdeation => "suicide_ideation",
            Self::AnaphylaxisNoEpipen => "anaphylaxis_no_epipen",
        }
    }
}

/// Set of active safety flags. Flags are only ever added.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SafetyFlags(BTreeSet<SafetyFlag>);

impl SafetyFlags {
    pub fn raise(&mut self, flag: SafetyFlag) {
        self.0.insert(flag);
    }

    pub fn is_set(&self, flag: SafetyFlag) -> bool {
        self.0.contains(&flag)
    }

    pub fn any(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = SafetyFlag> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<SafetyFlag> for SafetyFlags {
    fn from_iter<T: IntoIterator<Item = SafetyFlag>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Fixed-length normalized feature vector used for similarity search.
///
/// Dimensions: depression, anxiety, alcohol use, wellbeing deficit, allergy, band ordinal,
/// safety indicator. Every component lies in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(pub [f64; FEATURE_DIMENSIONS]);

impl FeatureVector {
    pub const BAND_DIMENSION: usize = 5;
    pub const SAFETY_DIMENSION: usize = 6;

    pub fn zeros() -> Self {
        Self([0.0; FEATURE_DIMENSIONS])
    }

    pub fn values(&self) -> &[f64; FEATURE_DIMENSIONS] {
        &self.0
    }
}

/// Pure scoring output for one set of answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreCard {
    pub instrument: InstrumentType,
    pub tables_version: String,
    pub category_scores: BTreeMap<Category, u32>,
    pub primary_category: Category,
    pub primary_score: u32,
    pub band: RiskBand,
    pub safety_flags: SafetyFlags,
    pub features: FeatureVector,
}

/// Risk profile derived from exactly one questionnaire response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskProfile {
    pub profile_id: ProfileId,
    pub response_id: ResponseId,
    pub scores: ScoreCard,
    pub computed_at: DateTime<Utc>,
}

impl RiskProfile {
    pub fn derive(response_id: ResponseId, scores: ScoreCard, computed_at: DateTime<Utc>) -> Self {
        Self {
            profile_id: ProfileId::for_response(response_id),
            response_id,
            scores,
            computed_at,
        }
    }

    pub fn band(&self) -> RiskBand {
        self.scores.band
    }

    pub fn safety_flags(&self) -> &SafetyFlags {
        &self.scores.safety_flags
    }

    pub fn features(&self) -> &FeatureVector {
        &self.scores.features
    }

    pub fn primary_category(&self) -> Category {
        self.scores.primary_category
    }
}
