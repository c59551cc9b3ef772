use crate::infra::AppState;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Extension;
use axum::Json;
use clinical_risk::alerts::AlertPublisher;
use clinical_risk::delivery::{
    delivery_router, DeliveryLedger, SubscriptionDirectory, WebhookDeliveryService,
};
use clinical_risk::intake::{assessment_router, AssessmentService, ResponseRepository};
use serde_json::json;
use std::sync::Arc;

pub(crate) fn with_routes<R, P, L, D>(
    assessment: Arc<AssessmentService<R, P>>,
    delivery: Arc<WebhookDeliveryService<L, D>>,
) -> axum::Router
where
    R: ResponseRepository + 'static,
    P: AlertPublisher + 'static,
    L: DeliveryLedger + 'static,
    D: SubscriptionDirectory + 'static,
{
    assessment_router(assessment)
        .merge(delivery_router(delivery))
        .route("/health", axum::routing::get(healthcheck))
        .route("/ready", axum::routing::get(readiness_endpoint))
        .route("/metrics", axum::routing::get(metrics_endpoint))
}

pub(crate) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
