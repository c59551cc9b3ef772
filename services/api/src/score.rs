use clap::Args;
use clinical_risk::domain::{InstrumentType, ScoreCard};
use clinical_risk::error::AppError;
use clinical_risk::phi::Answers;
use clinical_risk::scoring::ScoringEngine;
use std::path::PathBuf;

use crate::infra::load_scoring_engine;

#[derive(Args, Debug)]
pub(crate) struct ScoreArgs {
    /// Instrument code, e.g. phq9, gad7, audit-c, who5
    #[arg(long)]
    pub(crate) instrument: String,
    /// Answers in question order, comma separated
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true, required = true)]
    pub(crate) answers: Vec<i32>,
    /// Scoring tables JSON; the built-in tables are used when omitted
    #[arg(long, env = "APP_SCORING_TABLES")]
    pub(crate) tables: Option<PathBuf>,
    /// Print the score card as JSON instead of a summary
    #[arg(long)]
    pub(crate) json: bool,
}

pub(crate) fn run_score(args: ScoreArgs) -> Result<(), AppError> {
    let json = args.json;
    let engine = load_scoring_engine(args.tables.as_deref())?;
    let card = score_card(&engine, &args.instrument, &args.answers)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&card)?);
    } else {
        render_score_card(&card);
    }
    Ok(())
}

pub(crate) fn score_card(
    engine: &ScoringEngine,
    instrument: &str,
    answers: &[i32],
) -> Result<ScoreCard, AppError> {
    let instrument = InstrumentType::from(instrument);
    let answers = Answers::from_sequence(answers);
    Ok(engine.score(&instrument, &answers)?)
}

fn render_score_card(card: &ScoreCard) {
    println!("Instrument: {} (tables {})", card.instrument, card.tables_version);
    println!(
        "Primary: {} = {} -> {} risk",
        card.primary_category.label(),
        card.primary_score,
        card.band
    );

    if card.category_scores.len() > 1 {
        println!("\nCategory scores:");
        for (category, score) in &card.category_scores {
            println!("- {:<12} {score}", category.label());
        }
    }

    let flags: Vec<&str> = card.safety_flags.iter().map(|flag| flag.label()).collect();
    if flags.is_empty() {
        println!("\nSafety flags: none");
    } else {
        println!("\nSafety flags: {}", flags.join(", "));
    }
}
