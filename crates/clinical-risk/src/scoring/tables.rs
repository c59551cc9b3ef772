use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{Category, InstrumentType, RiskBand, SafetyFlag};

pub const DEFAULT_TABLES_VERSION: &str = "2024.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreDirection {
    HigherIsWorse,
    LowerIsWorse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionSpec {
    pub id: String,
    pub label: String,
    pub min: i32,
    pub max: i32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    pub category: Category,
}

fn default_weight() -> u32 {
    1
}

fn default_multiplier() -> u32 {
    1
}

/// Cutoffs for the primary score. A missing cutoff means the band is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BandCutoffs {
    pub moderate: Option<u32>,
    pub high: Option<u32>,
    pub critical: Option<u32>,
}

impl BandCutoffs {
    pub fn classify(&self, score: u32, direction: ScoreDirection) -> RiskBand {
        let reaches = |cutoff: Option<u32>| match (cutoff, direction) {
            (Some(limit), ScoreDirection::HigherIsWorse) => score >= limit,
            (Some(limit), ScoreDirection::LowerIsWorse) => score <= limit,
            (None, _) => false,
        };

        if reaches(self.critical) {
            RiskBand::Critical
        } else if reaches(self.high) {
            RiskBand::High
        } else if reaches(self.moderate) {
            RiskBand::Moderate
        } else {
            RiskBand::Low
        }
    }

    fn is_monotonic(&self, direction: ScoreDirection) -> bool {
        let present: Vec<u32> = [self.moderate, self.high, self.critical]
            .into_iter()
            .flatten()
            .collect();
        present.windows(2).all(|pair| match direction {
            ScoreDirection::HigherIsWorse => pair[0] < pair[1],
            ScoreDirection::LowerIsWorse => pair[0] > pair[1],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum TriggerCondition {
    AtLeast(i32),
    AtMost(i32),
    Equals(i32),
}

impl TriggerCondition {
    pub fn matches(self, answer: i32) -> bool {
        match self {
            Self::AtLeast(limit) => answer >= limit,
            Self::AtMost(limit) => answer <= limit,
            Self::Equals(expected) => answer == expected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerClause {
    pub question_id: String,
    pub condition: TriggerCondition,
}

/// Raises `flag` when every clause matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyTrigger {
    pub flag: SafetyFlag,
    pub clauses: Vec<TriggerClause>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSchema {
    pub instrument: InstrumentType,
    pub name: String,
    pub primary_category: Category,
    pub direction: ScoreDirection,
    #[serde(default = "default_multiplier")]
    pub score_multiplier: u32,
    pub cutoffs: BandCutoffs,
    pub questions: Vec<QuestionSpec>,
    #[serde(default)]
    pub safety_triggers: Vec<SafetyTrigger>,
}

impl InstrumentSchema {
    pub fn question(&self, id: &str) -> Option<&QuestionSpec> {
        self.questions.iter().find(|question| question.id == id)
    }

    /// Highest reachable score for `category` after weighting and scaling.
    /// Saturates for schemas that never passed [`InstrumentSchema::validate`].
    pub fn category_max(&self, category: Category) -> u32 {
        self.checked_category_max(category).unwrap_or(u32::MAX)
    }

    fn checked_category_max(&self, category: Category) -> Option<u32> {
        self.questions
            .iter()
            .filter(|question| question.category == category)
            .try_fold(0u32, |sum, question| {
                (question.max.max(0) as u32)
                    .checked_mul(question.weight)
                    .and_then(|weighted| sum.checked_add(weighted))
            })?
            .checked_mul(self.score_multiplier)
    }

    pub fn categories(&self) -> BTreeSet<Category> {
        self.questions
            .iter()
            .map(|question| question.category)
            .collect()
    }

    fn validate(&self) -> Result<(), TablesError> {
        let invalid = |reason: String| TablesError::InvalidSchema {
            instrument: self.instrument.clone(),
            reason,
        };

        if self.questions.is_empty() {
            return Err(invalid("no questions defined".to_string()));
        }

        let mut seen = BTreeSet::new();
        for question in &self.questions {
            if !seen.insert(question.id.as_str()) {
                return Err(invalid(format!("duplicate question '{}'", question.id)));
            }
            if question.min < 0 || question.min > question.max {
                return Err(invalid(format!(
                    "question '{}' has an invalid range {}..={}",
                    question.id, question.min, question.max
                )));
            }
        }

        if !self
            .questions
            .iter()
            .any(|question| question.category == self.primary_category)
        {
            return Err(invalid(format!(
                "no question contributes to primary category '{}'",
                self.primary_category.label()
            )));
        }

        if self.score_multiplier == 0 {
            return Err(invalid("score multiplier must be positive".to_string()));
        }

        if let Some(category) = self
            .categories()
            .into_iter()
            .find(|category| self.checked_category_max(*category).is_none())
        {
            return Err(invalid(format!(
                "weighted maximum for category '{}' overflows",
                category.label()
            )));
        }

        if !self.cutoffs.is_monotonic(self.direction) {
            return Err(invalid("band cutoffs are not monotonic".to_string()));
        }

        for trigger in &self.safety_triggers {
            if trigger.clauses.is_empty() {
                return Err(invalid(format!(
                    "safety trigger '{}' has no clauses",
                    trigger.flag.label()
                )));
            }
            if let Some(clause) = trigger
                .clauses
                .iter()
                .find(|clause| self.question(&clause.question_id).is_none())
            {
                return Err(invalid(format!(
                    "safety trigger references unknown question '{}'",
                    clause.question_id
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct TablesDocument {
    version: String,
    instruments: Vec<InstrumentSchema>,
}

/// Versioned set of instrument schemas loaded at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringTables {
    version: String,
    instruments: BTreeMap<InstrumentType, InstrumentSchema>,
}

impl ScoringTables {
    pub fn new(
        version: impl Into<String>,
        schemas: impl IntoIterator<Item = InstrumentSchema>,
    ) -> Result<Self, TablesError> {
        let mut instruments = BTreeMap::new();
        for schema in schemas {
            schema.validate()?;
            let key = schema.instrument.clone();
            if instruments.insert(key.clone(), schema).is_some() {
                return Err(TablesError::DuplicateInstrument(key));
            }
        }
        Ok(Self {
            version: version.into(),
            instruments,
        })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TablesError> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, TablesError> {
        let document: TablesDocument = serde_json::from_reader(reader)?;
        Self::new(document.version, document.instruments)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn schema(&self, instrument: &InstrumentType) -> Option<&InstrumentSchema> {
        self.instruments.get(instrument)
    }

    pub fn schemas(&self) -> impl Iterator<Item = &InstrumentSchema> {
        self.instruments.values()
    }
}

impl Default for ScoringTables {
    fn default() -> Self {
        Self {
            version: DEFAULT_TABLES_VERSION.to_string(),
            instruments: default_schemas()
                .into_iter()
                .map(|schema| (schema.instrument.clone(), schema))
                .collect(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TablesError {
    #[error("failed to read scoring tables: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse scoring tables: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("instrument '{0}' is defined more than once")]
    DuplicateInstrument(InstrumentType),
    #[error("instrument '{instrument}' is invalid: {reason}")]
    InvalidSchema {
        instrument: InstrumentType,
        reason: String,
    },
}

fn items(category: Category, min: i32, max: i32, labels: &[&str]) -> Vec<QuestionSpec> {
    labels
        .iter()
        .enumerate()
        .map(|(index, label)| QuestionSpec {
            id: format!("item_{}", index + 1),
            label: (*label).to_string(),
            min,
            max,
            weight: 1,
            category,
        })
        .collect()
}

fn clause(question_id: &str, condition: TriggerCondition) -> TriggerClause {
    TriggerClause {
        question_id: question_id.to_string(),
        condition,
    }
}

fn default_schemas() -> Vec<InstrumentSchema> {
    vec![
        InstrumentSchema {
            instrument: InstrumentType::Phq9,
            name: "Patient Health Questionnaire (PHQ-9)".to_string(),
            primary_category: Category::Depression,
            direction: ScoreDirection::HigherIsWorse,
            score_multiplier: 1,
            cutoffs: BandCutoffs {
                moderate: Some(10),
                high: Some(15),
                critical: Some(20),
            },
            questions: items(
                Category::Depression,
                0,
                3,
                &[
                    "Little interest or pleasure in doing things",
                    "Feeling down, depressed, or hopeless",
                    "Trouble falling or staying asleep, or sleeping too much",
                    "Feeling tired or having little energy",
                    "Poor appetite or overeating",
                    "Feeling bad about yourself",
                    "Trouble concentrating on things",
                    "Moving or speaking slowly, or being fidgety or restless",
                    "Thoughts that you would be better off dead or of hurting yourself",
                ],
            ),
            safety_triggers: vec![SafetyTrigger {
                flag: SafetyFlag::SuicideIdeation,
                clauses: vec![clause("item_9", TriggerCondition::AtLeast(1))],
            }],
        },
        InstrumentSchema {
            instrument: InstrumentType::Gad7,
            name: "Generalized Anxiety Disorder scale (GAD-7)".to_string(),
            primary_category: Category::Anxiety,
            direction: ScoreDirection::HigherIsWorse,
            score_multiplier: 1,
            cutoffs: BandCutoffs {
                moderate: Some(10),
                high: Some(15),
                critical: None,
            },
            questions: items(
                Category::Anxiety,
                0,
                3,
                &[
                    "Feeling nervous, anxious, or on edge",
                    "Not being able to stop or control worrying",
                    "Worrying too much about different things",
                    "Trouble relaxing",
                    "Being so restless that it is hard to sit still",
                    "Becoming easily annoyed or irritable",
                    "Feeling afraid as if something awful might happen",
                ],
            ),
            safety_triggers: Vec::new(),
        },
        InstrumentSchema {
            instrument: InstrumentType::AuditC,
            name: "Alcohol Use Disorders Identification Test (AUDIT-C)".to_string(),
            primary_category: Category::AlcoholUse,
            direction: ScoreDirection::HigherIsWorse,
            score_multiplier: 1,
            cutoffs: BandCutoffs {
                moderate: Some(4),
                high: Some(6),
                critical: Some(8),
            },
            questions: items(
                Category::AlcoholUse,
                0,
                4,
                &[
                    "How often do you have a drink containing alcohol",
                    "How many drinks do you have on a typical drinking day",
                    "How often do you have six or more drinks on one occasion",
                ],
            ),
            safety_triggers: Vec::new(),
        },
        InstrumentSchema {
            instrument: InstrumentType::Who5,
            name: "WHO-5 Well-Being Index".to_string(),
            primary_category: Category::Wellbeing,
            direction: ScoreDirection::LowerIsWorse,
            score_multiplier: 4,
            cutoffs: BandCutoffs {
                moderate: Some(51),
                high: Some(28),
                critical: Some(12),
            },
            questions: items(
                Category::Wellbeing,
                0,
                5,
                &[
                    "I have felt cheerful and in good spirits",
                    "I have felt calm and relaxed",
                    "I have felt active and vigorous",
                    "I woke up feeling fresh and rested",
                    "My daily life has been filled with things that interest me",
                ],
            ),
            safety_triggers: Vec::new(),
        },
        InstrumentSchema {
            instrument: InstrumentType::Custom("allergy-history".to_string()),
            name: "Allergy history screen".to_string(),
            primary_category: Category::Allergy,
            direction: ScoreDirection::HigherIsWorse,
            score_multiplier: 1,
            cutoffs: BandCutoffs {
                moderate: Some(2),
                high: Some(4),
                critical: Some(6),
            },
            questions: vec![
                QuestionSpec {
                    id: "item_1".to_string(),
                    label: "Previous severe allergic reaction (anaphylaxis)".to_string(),
                    min: 0,
                    max: 1,
                    weight: 3,
                    category: Category::Allergy,
                },
                QuestionSpec {
                    id: "item_2".to_string(),
                    label: "Currently carries an epinephrine auto-injector".to_string(),
                    min: 0,
                    max: 1,
                    weight: 0,
                    category: Category::Allergy,
                },
                QuestionSpec {
                    id: "item_3".to_string(),
                    label: "Number of known allergen classes".to_string(),
                    min: 0,
                    max: 5,
                    weight: 1,
                    category: Category::Allergy,
                },
            ],
            safety_triggers: vec![SafetyTrigger {
                flag: SafetyFlag::AnaphylaxisNoEpipen,
                clauses: vec![
                    clause("item_1", TriggerCondition::AtLeast(1)),
                    clause("item_2", TriggerCondition::Equals(0)),
                ],
            }],
        },
    ]
}
