use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::alerts::{AlertConfig, AlertDispatcher, AlertPublisher};
use crate::cache::CacheStats;
use crate::domain::{ResponseId, RiskProfile, ScoreCard};
use crate::forecast::{ForecastConfig, ForecastError, RiskForecaster};
use crate::interventions::InterventionRecommender;
use crate::phi::{AccessPurpose, PhiError, PhiGuard, RedactedView};
use crate::population::{
    PopulationHandle, PopulationTrendAnalyzer, SimilarityMatcher, TimeRange, TrendConfig,
    TrendError, TrendReport,
};
use crate::scoring::{ScoringEngine, ScoringError};

use super::domain::{Assessment, InstrumentTemplate, QuestionnaireSubmission};
use super::repository::{RepositoryError, ResponseRepository};

/// Tunables for the assessment pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssessmentSettings {
    pub similarity_k: usize,
    pub trend_window: Duration,
    pub forecast_horizon_days: u32,
    pub retention: Duration,
    pub trend: TrendConfig,
    pub forecast: ForecastConfig,
    pub alerts: AlertConfig,
}

impl Default for AssessmentSettings {
    fn default() -> Self {
        Self {
            similarity_k: 10,
            trend_window: Duration::days(90),
            forecast_horizon_days: 90,
            retention: Duration::days(2555),
            trend: TrendConfig::default(),
            forecast: ForecastConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

/// Runs a submission through scoring, sealing, population analysis, and alerting.
pub struct AssessmentService<R, P> {
    guard: Arc<PhiGuard>,
    engine: Arc<ScoringEngine>,
    population: Arc<PopulationHandle>,
    trends: PopulationTrendAnalyzer,
    forecaster: RiskForecaster,
    recommender: InterventionRecommender,
    dispatcher: AlertDispatcher,
    repository: Arc<R>,
    publisher: Arc<P>,
    settings: AssessmentSettings,
}

impl<R, P> AssessmentService<R, P>
where
    R: ResponseRepository + 'static,
    P: AlertPublisher + 'static,
{
    pub fn new(
        guard: Arc<PhiGuard>,
        engine: Arc<ScoringEngine>,
        population: Arc<PopulationHandle>,
        repository: Arc<R>,
        publisher: Arc<P>,
        settings: AssessmentSettings,
    ) -> Self {
        Self {
            guard,
            engine,
            population,
            trends: PopulationTrendAnalyzer::new(settings.trend),
            forecaster: RiskForecaster::new(settings.forecast),
            recommender: InterventionRecommender::default(),
            dispatcher: AlertDispatcher::with_default_cooldowns(settings.alerts),
            repository,
            publisher,
            settings,
        }
    }

    pub fn settings(&self) -> &AssessmentSettings {
        &self.settings
    }

    pub fn population(&self) -> &PopulationHandle {
        &self.population
    }

    pub fn submit_questionnaire(
        &self,
        submission: QuestionnaireSubmission,
    ) -> Result<Assessment, AssessmentError> {
        self.assess(submission, Utc::now())
    }

    /// Scores and stores the submission, then runs the population pipeline as of `now`.
    ///
    /// Nothing is stored when validation fails. Alert publication failures are logged and
    /// never fail the assessment.
    pub fn assess(
        &self,
        submission: QuestionnaireSubmission,
        now: DateTime<Utc>,
    ) -> Result<Assessment, AssessmentError> {
        let QuestionnaireSubmission {
            instrument,
            patient_ref,
            answers,
        } = submission;
        if patient_ref.is_blank() {
            return Err(AssessmentError::MissingPatientRef);
        }

        let scores = self.engine.score(&instrument, &answers)?;
        let response = self.guard.seal(patient_ref, instrument, &answers, now)?;
        drop(answers);
        let patient_hash = self.guard.patient_hash(response.patient_ref());
        let profile = RiskProfile::derive(response.response_id(), scores, now);

        let population = self.population.snapshot();
        let neighbors =
            SimilarityMatcher::find_similar(&profile, self.settings.similarity_k, &population);
        let window = TimeRange::trailing(now, self.settings.trend_window);
        let trend = match self.trends.analyze(window, &population) {
            Ok(report) => Some(report),
            Err(TrendError::InsufficientData { required, found }) => {
                debug!(required, found, "population trend unavailable; assuming stable");
                None
            }
            Err(err @ TrendError::InvalidWindow) => {
                warn!(error = %err, "configured trend window is empty; assuming stable");
                None
            }
        };
        let forecast = self.forecaster.forecast(
            &profile,
            trend.as_ref(),
            &neighbors,
            self.settings.forecast_horizon_days,
        )?;
        let interventions = self.recommender.recommend(&profile);

        self.repository.insert(response)?;

        let alerts = self.dispatcher.process(
            &profile,
            &patient_hash,
            Some(&forecast),
            &interventions,
            now,
            self.publisher.as_ref(),
        );

        info!(
            response_id = %profile.response_id,
            profile_id = %profile.profile_id,
            instrument = %profile.scores.instrument,
            band = %profile.band(),
            neighbors = neighbors.len(),
            projected_band = %forecast.projected_band,
            alerts = alerts.raised.len(),
            "questionnaire assessed"
        );

        Ok(Assessment {
            profile,
            neighbors,
            trend,
            forecast,
            interventions,
            alerts,
        })
    }

    /// Redacted view of a stored response.
    pub fn redacted(&self, id: &ResponseId) -> Result<RedactedView, AssessmentError> {
        let response = self.repository.fetch(id)?;
        Ok(self.guard.expose(&response))
    }

    /// Recomputes the score card of a stored response with the current tables.
    pub fn rescore(&self, id: &ResponseId) -> Result<ScoreCard, AssessmentError> {
        let response = self.repository.fetch(id)?;
        let answers = self.guard.unseal(&response, AccessPurpose::Rescoring)?;
        Ok(self.engine.score(response.instrument(), &answers)?)
    }

    pub fn alert_cooldowns(&self) -> CacheStats {
        self.dispatcher.cooldown_stats()
    }

    /// Removes responses older than the retention period and lapsed alert cooldowns.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, AssessmentError> {
        let cutoff = now - self.settings.retention;
        let cooldowns = self.dispatcher.purge_expired_cooldowns(now);
        if cooldowns > 0 {
            debug!(cooldowns, "lapsed alert cooldowns dropped");
        }
        let purged = self.repository.purge_submitted_before(cutoff)?;
        if purged > 0 {
            info!(purged, %cutoff, "expired questionnaire responses purged");
        }
        Ok(purged)
    }

    pub fn trend_report(&self, window: TimeRange) -> Result<TrendReport, AssessmentError> {
        let population = self.population.snapshot();
        Ok(self.trends.analyze(window, &population)?)
    }

    pub fn instruments(&self) -> Vec<InstrumentTemplate> {
        self.engine
            .tables()
            .schemas()
            .map(InstrumentTemplate::from)
            .collect()
    }
}

/// Error taxonomy shared by the HTTP and CLI surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller-fixable; never retried.
    Validation,
    InsufficientData,
    /// Fatal; the request fails closed.
    PhiExposureViolation,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum AssessmentError {
    #[error("patient reference must not be blank")]
    MissingPatientRef,
    #[error(transparent)]
    Scoring(#[from] ScoringError),
    #[error(transparent)]
    Phi(#[from] PhiError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Trend(#[from] TrendError),
    #[error(transparent)]
    Forecast(#[from] ForecastError),
}

impl AssessmentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingPatientRef
            | Self::Scoring(_)
            | Self::Forecast(_)
            | Self::Trend(TrendError::InvalidWindow) => ErrorKind::Validation,
            Self::Trend(TrendError::InsufficientData { .. }) => ErrorKind::InsufficientData,
            Self::Phi(PhiError::ExposureViolation { .. }) => ErrorKind::PhiExposureViolation,
            Self::Phi(_) | Self::Repository(_) => ErrorKind::Internal,
        }
    }
}
