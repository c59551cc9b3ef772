use std::collections::BTreeMap;

use crate::domain::{Category, SafetyFlags, ScoreCard};
use crate::phi::Answers;

use super::features::build_features;
use super::tables::InstrumentSchema;
use super::ScoringError;

/// Every schema question must be answered, within range, and nothing else may be present.
pub(crate) fn validate_answers(
    schema: &InstrumentSchema,
    answers: &Answers,
) -> Result<(), ScoringError> {
    let missing: Vec<String> = schema
        .questions
        .iter()
        .filter(|question| answers.get(&question.id).is_none())
        .map(|question| question.id.clone())
        .collect();
    if !missing.is_empty() {
        return Err(ScoringError::IncompleteResponse {
            instrument: schema.instrument.clone(),
            missing,
        });
    }

    if let Some(unknown) = answers
        .question_ids()
        .find(|id| schema.question(id).is_none())
    {
        return Err(ScoringError::UnknownQuestion {
            instrument: schema.instrument.clone(),
            question_id: unknown.to_string(),
        });
    }

    for question in &schema.questions {
        let value = answers.get(&question.id).unwrap_or(question.min);
        if value < question.min || value > question.max {
            return Err(ScoringError::OutOfRangeAnswer {
                question_id: question.id.clone(),
                min: question.min,
                max: question.max,
            });
        }
    }

    Ok(())
}

/// Weighted, scaled per-category totals. Assumes answers were validated.
pub(crate) fn category_scores(
    schema: &InstrumentSchema,
    answers: &Answers,
) -> BTreeMap<Category, u32> {
    let mut totals: BTreeMap<Category, u32> = schema
        .categories()
        .into_iter()
        .map(|category| (category, 0))
        .collect();

    for question in &schema.questions {
        let value = answers.get(&question.id).unwrap_or(0).max(0) as u32;
        let total = totals.entry(question.category).or_default();
        *total = total.saturating_add(value.saturating_mul(question.weight));
    }

    for total in totals.values_mut() {
        *total = total.saturating_mul(schema.score_multiplier);
    }
    totals
}

pub(crate) fn safety_flags(schema: &InstrumentSchema, answers: &Answers) -> SafetyFlags {
    schema
        .safety_triggers
        .iter()
        .filter(|trigger| {
            trigger.clauses.iter().all(|clause| {
                answers
                    .get(&clause.question_id)
                    .is_some_and(|value| clause.condition.matches(value))
            })
        })
        .map(|trigger| trigger.flag)
        .collect()
}

pub(crate) fn score_answers(
    schema: &InstrumentSchema,
    tables_version: &str,
    answers: &Answers,
) -> Result<ScoreCard, ScoringError> {
    validate_answers(schema, answers)?;

    let category_scores = category_scores(schema, answers);
    let primary_score = category_scores
        .get(&schema.primary_category)
        .copied()
        .unwrap_or_default();
    let band = schema.cutoffs.classify(primary_score, schema.direction);
    let safety_flags = safety_flags(schema, answers);
    let features = build_features(schema, &category_scores, band, &safety_flags);

    Ok(ScoreCard {
        instrument: schema.instrument.clone(),
        tables_version: tables_version.to_string(),
        category_scores,
        primary_category: schema.primary_category,
        primary_score,
        band,
        safety_flags,
        features,
    })
}
