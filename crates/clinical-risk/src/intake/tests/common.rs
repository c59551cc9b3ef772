use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::response::Response;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::alerts::{AlertPublishError, AlertPublisher, ClinicalAlert};
use crate::domain::{FeatureVector, InstrumentType, PatientRef, ProfileId, ResponseId, RiskBand};
use crate::intake::repository::{RepositoryError, ResponseRepository};
use crate::intake::{AssessmentService, AssessmentSettings, QuestionnaireSubmission};
use crate::phi::{Answers, PatientRefHasher, PhiGuard, PhiKey, QuestionnaireResponse};
use crate::population::{PopulationEntry, PopulationHandle, PopulationIndex};
use crate::scoring::ScoringEngine;

pub(super) const PATIENT: &str = "patient-7731";
pub(super) const PHQ9_EXAMPLE: [i32; 9] = [2, 3, 1, 2, 1, 0, 1, 0, 3];

pub(super) fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 1, 9, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub(super) fn submission(instrument: InstrumentType, answers: &[i32]) -> QuestionnaireSubmission {
    submission_for(PATIENT, instrument, answers)
}

pub(super) fn submission_for(
    patient: &str,
    instrument: InstrumentType,
    answers: &[i32],
) -> QuestionnaireSubmission {
    QuestionnaireSubmission {
        instrument,
        patient_ref: PatientRef::new(patient),
        answers: Answers::from_sequence(answers),
    }
}

pub(super) fn phq9_example() -> QuestionnaireSubmission {
    submission(InstrumentType::Phq9, &PHQ9_EXAMPLE)
}

pub(super) fn guard() -> PhiGuard {
    PhiGuard::new(PhiKey::generate(), PatientRefHasher::new("intake-test-salt"))
}

/// Moderate depression profiles spread over the last thirty days.
pub(super) fn moderate_population(count: usize) -> PopulationIndex {
    let entries = (0..count)
        .map(|offset| {
            let mut features = FeatureVector::zeros();
            features.0[0] = 0.45;
            features.0[FeatureVector::BAND_DIMENSION] = 1.0 / 3.0;
            PopulationEntry {
                profile_id: ProfileId(Uuid::new_v4()),
                instrument: InstrumentType::Phq9,
                band: RiskBand::Moderate,
                features,
                computed_at: now() - Duration::days(offset as i64 + 1),
            }
        })
        .collect();
    PopulationIndex::new(entries)
}

pub(super) fn build_service<R, P>(
    repository: Arc<R>,
    publisher: Arc<P>,
    population: PopulationIndex,
) -> AssessmentService<R, P>
where
    R: ResponseRepository + 'static,
    P: AlertPublisher + 'static,
{
    AssessmentService::new(
        Arc::new(guard()),
        Arc::new(ScoringEngine::default()),
        Arc::new(PopulationHandle::new(population)),
        repository,
        publisher,
        AssessmentSettings::default(),
    )
}

pub(super) type MemoryService = AssessmentService<MemoryRepository, RecordingPublisher>;

pub(super) fn memory_service() -> (MemoryService, Arc<MemoryRepository>, Arc<RecordingPublisher>) {
    let repository = Arc::new(MemoryRepository::default());
    let publisher = Arc::new(RecordingPublisher::default());
    let service = build_service(
        Arc::clone(&repository),
        Arc::clone(&publisher),
        PopulationIndex::default(),
    );
    (service, repository, publisher)
}

#[derive(Default)]
pub(super) struct MemoryRepository {
    pub(super) records: Mutex<HashMap<ResponseId, QuestionnaireResponse>>,
}

impl MemoryRepository {
    pub(super) fn len(&self) -> usize {
        self.records.lock().expect("repository mutex").len()
    }
}

impl ResponseRepository for MemoryRepository {
    fn insert(&self, response: QuestionnaireResponse) -> Result<(), RepositoryError> {
        let mut records = self.records.lock().expect("repository mutex");
        if records.contains_key(&response.response_id()) {
            return Err(RepositoryError::Conflict);
        }
        records.insert(response.response_id(), response);
        Ok(())
    }

    fn fetch(&self, id: &ResponseId) -> Result<QuestionnaireResponse, RepositoryError> {
        self.records
            .lock()
            .expect("repository mutex")
            .get(id)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    fn purge_submitted_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let mut records = self.records.lock().expect("repository mutex");
        let before = records.len();
        records.retain(|_, response| response.submitted_at() >= cutoff);
        Ok(before - records.len())
    }
}

pub(super) struct ConflictRepository;

impl ResponseRepository for ConflictRepository {
    fn insert(&self, _response: QuestionnaireResponse) -> Result<(), RepositoryError> {
        Err(RepositoryError::Conflict)
    }

    fn fetch(&self, _id: &ResponseId) -> Result<QuestionnaireResponse, RepositoryError> {
        Err(RepositoryError::NotFound)
    }

    fn purge_submitted_before(&self, _cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        Ok(0)
    }
}

pub(super) struct UnavailableRepository;

impl ResponseRepository for UnavailableRepository {
    fn insert(&self, _response: QuestionnaireResponse) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("primary offline".to_string()))
    }

    fn fetch(&self, _id: &ResponseId) -> Result<QuestionnaireResponse, RepositoryError> {
        Err(RepositoryError::Unavailable("primary offline".to_string()))
    }

    fn purge_submitted_before(&self, _cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        Err(RepositoryError::Unavailable("primary offline".to_string()))
    }
}

#[derive(Default)]
pub(super) struct RecordingPublisher {
    published: Mutex<Vec<ClinicalAlert>>,
}

impl RecordingPublisher {
    pub(super) fn alerts(&self) -> Vec<ClinicalAlert> {
        self.published.lock().expect("publisher mutex").clone()
    }
}

impl AlertPublisher for RecordingPublisher {
    fn publish(&self, alert: &ClinicalAlert) -> Result<(), AlertPublishError> {
        self.published
            .lock()
            .expect("publisher mutex")
            .push(alert.clone());
        Ok(())
    }
}

pub(super) struct FailingPublisher;

impl AlertPublisher for FailingPublisher {
    fn publish(&self, _alert: &ClinicalAlert) -> Result<(), AlertPublishError> {
        Err(AlertPublishError("subscription directory offline".to_string()))
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
