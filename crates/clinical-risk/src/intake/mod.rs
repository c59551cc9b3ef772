//! Questionnaire intake: the orchestrator that turns a submission into a stored, sealed
//! response plus a risk assessment, and the HTTP routes in front of it.

pub mod domain;
pub mod repository;
pub mod router;
pub mod service;

#[cfg(test)]
mod tests;

pub use domain::{
    AlertSummary, Assessment, AssessmentView, InstrumentTemplate, QuestionTemplate,
    QuestionnaireSubmission, TrendRequest,
};
pub use repository::{RepositoryError, ResponseRepository};
pub use router::assessment_router;
pub use service::{AssessmentError, AssessmentService, AssessmentSettings, ErrorKind};
