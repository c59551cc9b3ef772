use chrono::{DateTime, Utc};

use crate::domain::ResponseId;
use crate::phi::QuestionnaireResponse;

/// Storage for sealed questionnaire responses. Records are never updated.
pub trait ResponseRepository: Send + Sync {
    fn insert(&self, response: QuestionnaireResponse) -> Result<(), RepositoryError>;
    fn fetch(&self, id: &ResponseId) -> Result<QuestionnaireResponse, RepositoryError>;
    /// Deletes responses submitted strictly before `cutoff`, returning how many were removed.
    fn purge_submitted_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError>;
}

/// Error enumeration for repository failures.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}
