use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::domain::{
    Category, FeatureVector, InstrumentType, ProfileId, RiskBand, FEATURE_DIMENSIONS,
};

use super::{PopulationEntry, PopulationIndex};

impl PopulationIndex {
    /// Loads a z-scored index from a batch export CSV.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PopulationImportError> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, PopulationImportError> {
        Ok(Self::with_zscore(parse_entries(reader)?))
    }
}

pub(crate) fn parse_entries<R: Read>(
    reader: R,
) -> Result<Vec<PopulationEntry>, PopulationImportError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut entries = Vec::new();

    for (index, record) in csv_reader.deserialize::<PopulationRow>().enumerate() {
        let row = record?;
        let line = index as u64 + 2;
        entries.push(row.into_entry(line)?);
    }

    Ok(entries)
}

#[derive(Debug, Deserialize)]
struct PopulationRow {
    profile_id: ProfileId,
    instrument: InstrumentType,
    band: RiskBand,
    computed_at: DateTime<Utc>,
    depression: f64,
    anxiety: f64,
    alcohol_use: f64,
    wellbeing_deficit: f64,
    allergy: f64,
    safety: f64,
}

impl PopulationRow {
    fn into_entry(self, line: u64) -> Result<PopulationEntry, PopulationImportError> {
        let mut features = [0.0; FEATURE_DIMENSIONS];
        features[Category::Depression.feature_index()] = self.depression;
        features[Category::Anxiety.feature_index()] = self.anxiety;
        features[Category::AlcoholUse.feature_index()] = self.alcohol_use;
        features[Category::Wellbeing.feature_index()] = self.wellbeing_deficit;
        features[Category::Allergy.feature_index()] = self.allergy;
        features[FeatureVector::BAND_DIMENSION] = f64::from(self.band.ordinal()) / 3.0;
        features[FeatureVector::SAFETY_DIMENSION] = self.safety;

        if let Some(value) = features
            .iter()
            .find(|value| !value.is_finite() || !(0.0..=1.0).contains(*value))
        {
            return Err(PopulationImportError::InvalidRow {
                line,
                reason: format!("feature value {value} is outside 0..=1"),
            });
        }

        Ok(PopulationEntry {
            profile_id: self.profile_id,
            instrument: self.instrument,
            band: self.band,
            features: FeatureVector(features),
            computed_at: self.computed_at,
        })
    }
}

#[derive(Debug)]
pub enum PopulationImportError {
    Io(std::io::Error),
    Csv(csv::Error),
    InvalidRow { line: u64, reason: String },
}

impl fmt::Display for PopulationImportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PopulationImportError::Io(err) => write!(f, "failed to read population export: {err}"),
            PopulationImportError::Csv(err) => {
                write!(f, "failed to parse population export: {err}")
            }
            PopulationImportError::InvalidRow { line, reason } => {
                write!(f, "population export line {line} is invalid: {reason}")
            }
        }
    }
}

impl std::error::Error for PopulationImportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PopulationImportError::Io(err) => Some(err),
            PopulationImportError::Csv(err) => Some(err),
            PopulationImportError::InvalidRow { .. } => None,
        }
    }
}

impl From<std::io::Error> for PopulationImportError {
    fn from(value: std::io::Error) -> Self {
        PopulationImportError::Io(value)
    }
}

impl From<csv::Error> for PopulationImportError {
    fn from(value: csv::Error) -> Self {
        PopulationImportError::Csv(value)
    }
}
