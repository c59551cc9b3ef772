use chrono::{DateTime, Utc};
use clinical_risk::config::EngineConfig;
use clinical_risk::delivery::{
    DirectoryError, SubscriptionDirectory, SubscriptionId, WebhookSubscription,
};
use clinical_risk::domain::ResponseId;
use clinical_risk::error::AppError;
use clinical_risk::intake::{RepositoryError, ResponseRepository};
use clinical_risk::phi::{PatientRefHasher, PhiGuard, PhiKey, QuestionnaireResponse};
use clinical_risk::population::PopulationIndex;
use clinical_risk::scoring::{ScoringEngine, ScoringTables};
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

#[derive(Default, Clone)]
pub(crate) struct InMemoryResponseRepository {
    records: Arc<Mutex<HashMap<ResponseId, QuestionnaireResponse>>>,
}

impl InMemoryResponseRepository {
    fn lock(
        &self,
    ) -> Result<MutexGuard<'_, HashMap<ResponseId, QuestionnaireResponse>>, RepositoryError> {
        self.records
            .lock()
            .map_err(|_| RepositoryError::Unavailable("repository mutex poisoned".to_string()))
    }
}

impl ResponseRepository for InMemoryResponseRepository {
    fn insert(&self, response: QuestionnaireResponse) -> Result<(), RepositoryError> {
        let mut guard = self.lock()?;
        if guard.contains_key(&response.response_id()) {
            return Err(RepositoryError::Conflict);
        }
        guard.insert(response.response_id(), response);
        Ok(())
    }

    fn fetch(&self, id: &ResponseId) -> Result<QuestionnaireResponse, RepositoryError> {
        self.lock()?.get(id).cloned().ok_or(RepositoryError::NotFound)
    }

    fn purge_submitted_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let mut guard = self.lock()?;
        let before = guard.len();
        guard.retain(|_, response| response.submitted_at() >= cutoff);
        Ok(before - guard.len())
    }
}

/// Subscriptions read once at startup from a JSON array.
#[derive(Debug, Default, Clone)]
pub(crate) struct FileSubscriptionDirectory {
    subscriptions: Vec<WebhookSubscription>,
}

impl FileSubscriptionDirectory {
    pub(crate) fn from_path(path: &Path) -> Result<Self, AppError> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    pub(crate) fn from_reader<R: Read>(reader: R) -> Result<Self, AppError> {
        let subscriptions: Vec<WebhookSubscription> = serde_json::from_reader(reader)?;
        Ok(Self { subscriptions })
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }
}

impl SubscriptionDirectory for FileSubscriptionDirectory {
    fn active_subscriptions(&self) -> Result<Vec<WebhookSubscription>, DirectoryError> {
        Ok(self
            .subscriptions
            .iter()
            .filter(|subscription| subscription.active)
            .cloned()
            .collect())
    }

    fn is_active(&self, subscription_id: &SubscriptionId) -> Result<bool, DirectoryError> {
        Ok(self.subscriptions.iter().any(|subscription| {
            subscription.active && &subscription.subscription_id == subscription_id
        }))
    }
}

pub(crate) fn load_scoring_engine(path: Option<&Path>) -> Result<ScoringEngine, AppError> {
    let tables = match path {
        Some(path) => ScoringTables::from_path(path)?,
        None => ScoringTables::default(),
    };
    Ok(ScoringEngine::new(Arc::new(tables)))
}

pub(crate) fn load_population(path: Option<&Path>) -> Result<PopulationIndex, AppError> {
    match path {
        Some(path) => {
            let index = PopulationIndex::from_path(path)?;
            info!(profiles = index.len(), path = %path.display(), "population index imported");
            Ok(index)
        }
        None => Ok(PopulationIndex::default()),
    }
}

pub(crate) fn load_subscriptions(
    path: Option<&Path>,
) -> Result<FileSubscriptionDirectory, AppError> {
    match path {
        Some(path) => {
            let directory = FileSubscriptionDirectory::from_path(path)?;
            info!(subscriptions = directory.len(), "webhook subscriptions loaded");
            Ok(directory)
        }
        None => {
            warn!("no subscriptions file configured; alerts will not be delivered");
            Ok(FileSubscriptionDirectory::default())
        }
    }
}

/// Production config guarantees both secrets; elsewhere missing ones are generated per process.
pub(crate) fn phi_guard(engine: &EngineConfig) -> PhiGuard {
    let key = engine.phi_key.clone().unwrap_or_else(|| {
        warn!("APP_PHI_KEY not set; sealing with an ephemeral key");
        PhiKey::generate()
    });
    let hasher = engine.patient_hasher.clone().unwrap_or_else(|| {
        warn!("APP_PATIENT_HASH_SALT not set; using an ephemeral salt");
        PatientRefHasher::random()
    });
    PhiGuard::new(key, hasher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinical_risk::domain::{InstrumentType, PatientRef};
    use clinical_risk::phi::Answers;

    const SUBSCRIPTIONS: &str = r#"[
        {
            "subscription_id": "care-team",
            "url": "https://care.example.org/hooks",
            "secret": "whsec_care",
            "event_types": ["safety_flag", "risk_band_threshold"]
        },
        {
            "subscription_id": "retired",
            "url": "https://old.example.org/hooks",
            "secret": "whsec_old",
            "event_types": ["safety_flag"],
            "active": false
        }
    ]"#;

    #[test]
    fn subscription_file_keeps_only_active_entries_live() {
        let directory =
            FileSubscriptionDirectory::from_reader(SUBSCRIPTIONS.as_bytes()).expect("parses");

        assert_eq!(directory.len(), 2);
        let active = directory.active_subscriptions().expect("directory readable");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].subscription_id, SubscriptionId::new("care-team"));
        assert!(!directory
            .is_active(&SubscriptionId::new("retired"))
            .expect("directory readable"));
    }

    #[test]
    fn malformed_subscription_file_is_rejected() {
        match FileSubscriptionDirectory::from_reader("{\"url\": 1}".as_bytes()) {
            Err(AppError::Subscriptions(_)) => {}
            other => panic!("expected subscriptions error, got {other:?}"),
        }
    }

    #[test]
    fn repository_rejects_duplicates_and_purges_by_age() {
        let guard = PhiGuard::new(PhiKey::generate(), PatientRefHasher::new("infra-salt"));
        let repository = InMemoryResponseRepository::default();
        let submitted = Utc::now();
        let response = guard
            .seal(
                PatientRef::new("mrn-1"),
                InstrumentType::Gad7,
                &Answers::from_sequence(&[0, 1, 0, 1, 0, 0, 1]),
                submitted,
            )
            .expect("seals");
        let id = response.response_id();

        repository.insert(response.clone()).expect("first insert");
        assert!(matches!(
            repository.insert(response),
            Err(RepositoryError::Conflict)
        ));
        assert!(repository.fetch(&id).is_ok());

        let purged = repository
            .purge_submitted_before(submitted + chrono::Duration::seconds(1))
            .expect("purge");
        assert_eq!(purged, 1);
        assert!(matches!(repository.fetch(&id), Err(RepositoryError::NotFound)));
    }
}
