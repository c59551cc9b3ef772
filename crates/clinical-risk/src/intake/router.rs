use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::Serialize;
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::alerts::AlertPublisher;
use crate::domain::ResponseId;
use crate::phi::{outward_json, PhiError};
use crate::population::{TimeRange, TrendError};

use super::domain::{QuestionnaireSubmission, TrendRequest};
use super::repository::{RepositoryError, ResponseRepository};
use super::service::{AssessmentError, AssessmentService, ErrorKind};

/// Router builder exposing questionnaire intake and population endpoints.
pub fn assessment_router<R, P>(service: Arc<AssessmentService<R, P>>) -> Router
where
    R: ResponseRepository + 'static,
    P: AlertPublisher + 'static,
{
    Router::new()
        .route("/api/v1/questionnaires", post(submit_handler::<R, P>))
        .route(
            "/api/v1/questionnaires/:response_id",
            get(redacted_handler::<R, P>),
        )
        .route("/api/v1/instruments", get(instruments_handler::<R, P>))
        .route("/api/v1/population/trend", post(trend_handler::<R, P>))
        .with_state(service)
}

pub(crate) async fn submit_handler<R, P>(
    State(service): State<Arc<AssessmentService<R, P>>>,
    axum::Json(submission): axum::Json<QuestionnaireSubmission>,
) -> Response
where
    R: ResponseRepository + 'static,
    P: AlertPublisher + 'static,
{
    match service.submit_questionnaire(submission) {
        Ok(assessment) => outward(StatusCode::CREATED, &assessment.view(), "assessment view"),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn redacted_handler<R, P>(
    State(service): State<Arc<AssessmentService<R, P>>>,
    Path(response_id): Path<String>,
) -> Response
where
    R: ResponseRepository + 'static,
    P: AlertPublisher + 'static,
{
    let Ok(uuid) = Uuid::parse_str(&response_id) else {
        let payload = json!({ "error": "response id must be a UUID" });
        return (StatusCode::BAD_REQUEST, axum::Json(payload)).into_response();
    };

    match service.redacted(&ResponseId(uuid)) {
        Ok(view) => outward(StatusCode::OK, &view, "redacted view"),
        Err(err) => error_response(err),
    }
}

pub(crate) async fn instruments_handler<R, P>(
    State(service): State<Arc<AssessmentService<R, P>>>,
) -> Response
where
    R: ResponseRepository + 'static,
    P: AlertPublisher + 'static,
{
    (StatusCode::OK, axum::Json(service.instruments())).into_response()
}

pub(crate) async fn trend_handler<R, P>(
    State(service): State<Arc<AssessmentService<R, P>>>,
    axum::Json(request): axum::Json<TrendRequest>,
) -> Response
where
    R: ResponseRepository + 'static,
    P: AlertPublisher + 'static,
{
    let report = TimeRange::new(request.start, request.end)
        .map_err(AssessmentError::from)
        .and_then(|window| service.trend_report(window));
    match report {
        Ok(report) => (StatusCode::OK, axum::Json(report)).into_response(),
        Err(err) => error_response(err),
    }
}

fn outward<T: Serialize>(status: StatusCode, value: &T, context: &'static str) -> Response {
    match outward_json(value, context) {
        Ok(body) => (status, [(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(err) => error_response(err.into()),
    }
}

pub(crate) fn error_response(err: AssessmentError) -> Response {
    let (status, payload) = match (&err, err.kind()) {
        (AssessmentError::Repository(RepositoryError::NotFound), _) => (
            StatusCode::NOT_FOUND,
            json!({ "error": "questionnaire response not found" }),
        ),
        (AssessmentError::Repository(RepositoryError::Conflict), _) => (
            StatusCode::CONFLICT,
            json!({ "error": "questionnaire response already exists" }),
        ),
        (AssessmentError::Trend(TrendError::InsufficientData { required, found }), _) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({
                "error": "insufficient_data",
                "detail": err.to_string(),
                "required": required,
                "found": found,
            }),
        ),
        (_, ErrorKind::Validation) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({ "error": err.to_string() }),
        ),
        (_, ErrorKind::PhiExposureViolation) => {
            error!(error = %err, "request failed closed on PHI exposure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "internal error" }),
            )
        }
        (AssessmentError::Phi(PhiError::UnsealFailed | PhiError::CorruptedPayload), _) => {
            error!(error = %err, "stored response could not be opened");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "internal error" }),
            )
        }
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": err.to_string() }),
        ),
    };
    (status, axum::Json(payload)).into_response()
}
