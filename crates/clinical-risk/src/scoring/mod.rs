mod features;
mod rules;
mod tables;


pub use tables::{
    BandCutoffs, InstrumentSchema, QuestionSpec, SafetyTrigger, ScoreDirection, ScoringTables,
    TablesError, TriggerClause, TriggerCondition, DEFAULT_TABLES_VERSION,
};

use std::sync::Arc;

use crate::domain::{InstrumentType, ScoreCard};
use crate::phi::Answers;

/// Stateless scorer applying the versioned tables to one set of answers.
///
/// The same tables and answers always yield an identical [`ScoreCard`].
#[derive(Debug, Clone)]
pub struct ScoringEngine {
    tables: Arc<ScoringTables>,
}

impl ScoringEngine {
    pub fn new(tables: Arc<ScoringTables>) -> Self {
        Self { tables }
    }

    pub fn tables(&self) -> &ScoringTables {
        &self.tables
    }

    pub fn score(
        &self,
        instrument: &InstrumentType,
        answers: &Answers,
    ) -> Result<ScoreCard, ScoringError> {
        let schema = self
            .tables
            .schema(instrument)
            .ok_or_else(|| ScoringError::UnknownInstrument(instrument.clone()))?;
        rules::score_answers(schema, self.tables.version(), answers)
    }
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self::new(Arc::new(ScoringTables::default()))
    }
}

/// Answer validation failures. Messages name question ids and ranges, never answer values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScoringError {
    #[error("instrument '{0}' is not defined in the scoring tables")]
    UnknownInstrument(InstrumentType),
    #[error("{instrument} response is incomplete; missing answers for {}", missing.join(", "))]
    IncompleteResponse {
        instrument: InstrumentType,
        missing: Vec<String>,
    },
    #[error("answer to {question_id} must be between {min} and {max}")]
    OutOfRangeAnswer {
        question_id: String,
        min: i32,
        max: i32,
    },
    #[error("{instrument} has no question '{question_id}'")]
    UnknownQuestion {
        instrument: InstrumentType,
        question_id: String,
    },
}
