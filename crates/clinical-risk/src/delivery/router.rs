use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use uuid::Uuid;

use super::{
    DeliveryId, DeliveryLedger, SubscriptionDirectory, SubscriptionId, WebhookDeliveryService,
};

/// Operator endpoints for inspecting and cancelling webhook deliveries.
pub fn delivery_router<L, D>(service: Arc<WebhookDeliveryService<L, D>>) -> Router
where
    L: DeliveryLedger + 'static,
    D: SubscriptionDirectory + 'static,
{
    Router::new()
        .route(
            "/api/v1/deliveries/abandoned",
            get(abandoned_handler::<L, D>),
        )
        .route(
            "/api/v1/deliveries/:delivery_id",
            get(history_handler::<L, D>),
        )
        .route(
            "/api/v1/subscriptions/:subscription_id/cancel-pending",
            post(cancel_pending_handler::<L, D>),
        )
        .with_state(service)
}

pub(crate) async fn abandoned_handler<L, D>(
    State(service): State<Arc<WebhookDeliveryService<L, D>>>,
) -> Response
where
    L: DeliveryLedger + 'static,
    D: SubscriptionDirectory + 'static,
{
    match service.abandoned() {
        Ok(attempts) => (StatusCode::OK, axum::Json(attempts)).into_response(),
        Err(err) => {
            let payload = json!({ "error": err.to_string() });
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(payload)).into_response()
        }
    }
}

pub(crate) async fn history_handler<L, D>(
    State(service): State<Arc<WebhookDeliveryService<L, D>>>,
    Path(delivery_id): Path<String>,
) -> Response
where
    L: DeliveryLedger + 'static,
    D: SubscriptionDirectory + 'static,
{
    let Ok(uuid) = Uuid::parse_str(&delivery_id) else {
        let payload = json!({ "error": "delivery id must be a UUID" });
        return (StatusCode::BAD_REQUEST, axum::Json(payload)).into_response();
    };

    match service.history(&DeliveryId(uuid)) {
        Ok(history) if history.is_empty() => {
            let payload = json!({ "error": "delivery not found" });
            (StatusCode::NOT_FOUND, axum::Json(payload)).into_response()
        }
        Ok(history) => (StatusCode::OK, axum::Json(history)).into_response(),
        Err(err) => {
            let payload = json!({ "error": err.to_string() });
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(payload)).into_response()
        }
    }
}

pub(crate) async fn cancel_pending_handler<L, D>(
    State(service): State<Arc<WebhookDeliveryService<L, D>>>,
    Path(subscription_id): Path<String>,
) -> Response
where
    L: DeliveryLedger + 'static,
    D: SubscriptionDirectory + 'static,
{
    let subscription_id = SubscriptionId(subscription_id);
    match service.abandon_pending_for(&subscription_id) {
        Ok(abandoned) => {
            let payload = json!({
                "subscription_id": subscription_id.0,
                "abandoned": abandoned,
            });
            (StatusCode::OK, axum::Json(payload)).into_response()
        }
        Err(err) => {
            let payload = json!({ "error": err.to_string() });
            (StatusCode::INTERNAL_SERVER_ERROR, axum::Json(payload)).into_response()
        }
    }
}
