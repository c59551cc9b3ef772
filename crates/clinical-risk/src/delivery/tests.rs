use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::Utc;
use tokio::time::Instant;
use tower::ServiceExt;

use super::signing::{verify, ATTEMPT_HEADER, DELIVERY_ID_HEADER, SIGNATURE_HEADER};
use super::*;
use crate::alerts::{AlertCondition, AlertSeverity};
use crate::domain::{ProfileId, SafetyFlag};

struct ScriptedTransport {
    calls: Mutex<Vec<(Instant, WebhookRequest)>>,
    responses: Mutex<VecDeque<Result<u16, TransportError>>>,
    fallback: Result<u16, TransportError>,
    delay: Option<Duration>,
}

impl ScriptedTransport {
    fn always(result: Result<u16, TransportError>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
            fallback: result,
            delay: None,
        }
    }

    fn calls(&self) -> Vec<(Instant, WebhookRequest)> {
        self.calls.lock().expect("transport mutex poisoned").clone()
    }
}

#[async_trait]
impl WebhookTransport for ScriptedTransport {
    async fn send(&self, request: &WebhookRequest) -> Result<u16, TransportError> {
        self.calls
            .lock()
            .expect("transport mutex poisoned")
            .push((Instant::now(), request.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .responses
            .lock()
            .expect("transport mutex poisoned")
            .pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}

#[derive(Default)]
struct StaticDirectory {
    subscriptions: Mutex<Vec<WebhookSubscription>>,
}

impl StaticDirectory {
    fn with(subscriptions: Vec<WebhookSubscription>) -> Self {
        Self {
            subscriptions: Mutex::new(subscriptions),
        }
    }

    fn deactivate(&self, subscription_id: &str) {
        let mut subscriptions = self.subscriptions.lock().expect("directory mutex poisoned");
        for subscription in subscriptions.iter_mut() {
            if subscription.subscription_id.0 == subscription_id {
                subscription.active = false;
            }
        }
    }
}

impl SubscriptionDirectory for StaticDirectory {
    fn active_subscriptions(&self) -> Result<Vec<WebhookSubscription>, DirectoryError> {
        let subscriptions = self.subscriptions.lock().expect("directory mutex poisoned");
        Ok(subscriptions.iter().filter(|s| s.active).cloned().collect())
    }

    fn is_active(&self, subscription_id: &SubscriptionId) -> Result<bool, DirectoryError> {
        let subscriptions = self.subscriptions.lock().expect("directory mutex poisoned");
        Ok(subscriptions
            .iter()
            .any(|s| &s.subscription_id == subscription_id && s.active))
    }
}

fn subscription(id: &str, events: &[EventType]) -> WebhookSubscription {
    WebhookSubscription {
        subscription_id: SubscriptionId::new(id),
        url: format!("https://hooks.example.test/{id}"),
        secret: SigningSecret::new(format!("{id}-secret")),
        event_types: events.iter().copied().collect::<BTreeSet<_>>(),
        active: true,
    }
}

fn safety_alert() -> ClinicalAlert {
    ClinicalAlert {
        alert_id: AlertId::new(),
        profile_id: ProfileId(uuid::Uuid::new_v4()),
        patient_ref_hash: "9b1f".to_string(),
        dedup_key: "9b1f:safety_flag:suicide_ideation".to_string(),
        condition: AlertCondition::SafetyFlag {
            flag: SafetyFlag::SuicideIdeation,
        },
        severity: AlertSeverity::Critical,
        category: "suicide_ideation".to_string(),
        recommended_interventions: vec!["crisis_safety_plan".to_string()],
        generated_at: Utc::now(),
    }
}

fn config(retry_secs: &[u64]) -> DeliveryConfig {
    DeliveryConfig {
        retry_offsets: retry_secs.iter().map(|s| Duration::from_secs(*s)).collect(),
        request_timeout: Duration::from_secs(10),
        worker_count: 2,
        queue_capacity: 16,
    }
}

type Harness = (
    WebhookDeliveryService<InMemoryDeliveryLedger, StaticDirectory>,
    Arc<InMemoryDeliveryLedger>,
    Arc<StaticDirectory>,
    Arc<ScriptedTransport>,
);

fn harness(config: DeliveryConfig, transport: ScriptedTransport) -> Harness {
    let ledger = Arc::new(InMemoryDeliveryLedger::new());
    let directory = Arc::new(StaticDirectory::with(vec![subscription(
        "ehr",
        &[EventType::SafetyFlag, EventType::RiskBandThreshold],
    )]));
    let transport = Arc::new(transport);
    let service = WebhookDeliveryService::start(
        config,
        Arc::clone(&ledger),
        Arc::clone(&directory),
        transport.clone(),
    );
    (service, ledger, directory, transport)
}

async fn wait_until(ledger: &InMemoryDeliveryLedger, id: DeliveryId, outcome: DeliveryOutcome) {
    for _ in 0..1_000 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let history = ledger.history(&id).expect("history readable");
        if history.iter().any(|attempt| attempt.outcome == outcome) {
            return;
        }
    }
    panic!("delivery {id} never reached {}", outcome.label());
}

#[tokio::test(start_paused = true)]
async fn failing_endpoint_is_retried_at_fixed_offsets_then_abandoned() {
    let (service, ledger, directory, transport) =
        harness(config(&[60, 180, 300]), ScriptedTransport::always(Ok(500)));
    let subscriptions = directory.active_subscriptions().expect("directory readable");

    let ids = service
        .dispatch(&safety_alert(), &subscriptions)
        .expect("dispatch succeeds");
    wait_until(&ledger, ids[0], DeliveryOutcome::Abandoned).await;

    let calls = transport.calls();
    assert_eq!(calls.len(), 4);
    let start = calls[0].0;
    for (call, expected) in calls.iter().skip(1).zip([60u64, 180, 300]) {
        let elapsed = call.0 - start;
        assert!(
            elapsed >= Duration::from_secs(expected) && elapsed < Duration::from_secs(expected + 1),
            "retry at {elapsed:?}, expected {expected}s"
        );
    }
    let attempts: Vec<&str> = calls
        .iter()
        .map(|(_, request)| request.header(ATTEMPT_HEADER).expect("attempt header"))
        .collect();
    assert_eq!(attempts, vec!["1", "2", "3", "4"]);

    let history = ledger.history(&ids[0]).expect("history readable");
    let outcomes: Vec<DeliveryOutcome> = history.iter().map(|attempt| attempt.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            DeliveryOutcome::Pending,
            DeliveryOutcome::Failed,
            DeliveryOutcome::Failed,
            DeliveryOutcome::Failed,
            DeliveryOutcome::Abandoned,
        ]
    );
    assert_eq!(history[4].response_status, Some(500));
    assert_eq!(service.abandoned().expect("ledger readable").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn successful_delivery_is_signed_and_settled() {
    let (service, ledger, directory, transport) =
        harness(config(&[60]), ScriptedTransport::always(Ok(202)));
    let subscriptions = directory.active_subscriptions().expect("directory readable");
    let alert = safety_alert();

    let ids = service.dispatch(&alert, &subscriptions).expect("dispatch succeeds");
    wait_until(&ledger, ids[0], DeliveryOutcome::Delivered).await;

    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    let request = &calls[0].1;
    let signature = request.header(SIGNATURE_HEADER).expect("signature header");
    assert!(verify(b"ehr-secret", &request.body, signature));
    assert_eq!(&*request.body, canonical_body(&alert).expect("encodes").as_slice());
    assert_eq!(
        request.header(DELIVERY_ID_HEADER),
        Some(ids[0].to_string().as_str())
    );

    let latest = ledger.latest(&ids[0]).expect("readable").expect("present");
    assert_eq!(latest.response_status, Some(202));
    assert_eq!(latest.attempt_number, 1);
}

#[tokio::test(start_paused = true)]
async fn slow_endpoints_count_as_failed_attempts() {
    let transport = ScriptedTransport {
        delay: Some(Duration::from_secs(30)),
        ..ScriptedTransport::always(Ok(200))
    };
    let (service, ledger, directory, _transport) = harness(config(&[]), transport);
    let subscriptions = directory.active_subscriptions().expect("directory readable");

    let ids = service
        .dispatch(&safety_alert(), &subscriptions)
        .expect("dispatch succeeds");
    wait_until(&ledger, ids[0], DeliveryOutcome::Abandoned).await;

    let latest = ledger.latest(&ids[0]).expect("readable").expect("present");
    assert_eq!(latest.last_error.as_deref(), Some("webhook request timed out"));
}

#[tokio::test(start_paused = true)]
async fn deactivated_subscription_abandons_before_next_attempt() {
    let (service, ledger, directory, transport) =
        harness(config(&[60, 180, 300]), ScriptedTransport::always(Ok(503)));
    let subscriptions = directory.active_subscriptions().expect("directory readable");

    let ids = service
        .dispatch(&safety_alert(), &subscriptions)
        .expect("dispatch succeeds");
    wait_until(&ledger, ids[0], DeliveryOutcome::Failed).await;
    directory.deactivate("ehr");
    wait_until(&ledger, ids[0], DeliveryOutcome::Abandoned).await;

    assert_eq!(transport.calls().len(), 1);
    let latest = ledger.latest(&ids[0]).expect("readable").expect("present");
    assert_eq!(latest.last_error.as_deref(), Some("subscription deactivated"));
}

#[tokio::test(start_paused = true)]
async fn cancelling_pending_deliveries_stops_retries() {
    let (service, ledger, directory, transport) =
        harness(config(&[60]), ScriptedTransport::always(Ok(500)));
    let subscriptions = directory.active_subscriptions().expect("directory readable");

    let ids = service
        .dispatch(&safety_alert(), &subscriptions)
        .expect("dispatch succeeds");
    wait_until(&ledger, ids[0], DeliveryOutcome::Failed).await;

    let cancelled = service
        .abandon_pending_for(&SubscriptionId::new("ehr"))
        .expect("ledger writable");
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(cancelled, 1);
    assert_eq!(transport.calls().len(), 1);
    let latest = ledger.latest(&ids[0]).expect("readable").expect("present");
    assert_eq!(latest.outcome, DeliveryOutcome::Abandoned);
}

#[tokio::test(start_paused = true)]
async fn cancelling_during_an_in_flight_attempt_stays_abandoned() {
    let transport = ScriptedTransport {
        delay: Some(Duration::from_secs(5)),
        ..ScriptedTransport::always(Ok(500))
    };
    let (service, ledger, directory, transport) = harness(config(&[60, 180, 300]), transport);
    let subscriptions = directory.active_subscriptions().expect("directory readable");

    let ids = service
        .dispatch(&safety_alert(), &subscriptions)
        .expect("dispatch succeeds");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(transport.calls().len(), 1, "first attempt is in flight");

    let cancelled = service
        .abandon_pending_for(&SubscriptionId::new("ehr"))
        .expect("ledger writable");
    tokio::time::sleep(Duration::from_secs(400)).await;

    assert_eq!(cancelled, 1);
    assert_eq!(transport.calls().len(), 1);
    let outcomes: Vec<DeliveryOutcome> = ledger
        .history(&ids[0])
        .expect("history readable")
        .iter()
        .map(|attempt| attempt.outcome)
        .collect();
    assert_eq!(
        outcomes,
        vec![DeliveryOutcome::Pending, DeliveryOutcome::Abandoned]
    );
}

#[tokio::test(start_paused = true)]
async fn dispatch_only_targets_matching_event_types() {
    let (service, _ledger, _directory, _transport) =
        harness(config(&[]), ScriptedTransport::always(Ok(200)));
    let subscriptions = vec![
        subscription("ehr", &[EventType::SafetyFlag]),
        subscription("forecasts", &[EventType::ForecastEscalation]),
        WebhookSubscription {
            active: false,
            ..subscription("retired", &[EventType::SafetyFlag])
        },
    ];

    let ids = service
        .dispatch(&safety_alert(), &subscriptions)
        .expect("dispatch succeeds");

    assert_eq!(ids.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn abandoned_route_lists_dead_deliveries() {
    let (service, ledger, directory, _transport) =
        harness(config(&[]), ScriptedTransport::always(Ok(500)));
    let subscriptions = directory.active_subscriptions().expect("directory readable");
    let ids = service
        .dispatch(&safety_alert(), &subscriptions)
        .expect("dispatch succeeds");
    wait_until(&ledger, ids[0], DeliveryOutcome::Abandoned).await;

    let response = delivery_router(Arc::new(service))
        .oneshot(
            axum::http::Request::get("/api/v1/deliveries/abandoned")
                .body(axum::body::Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("router responds");

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body readable");
    let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json body");
    assert_eq!(body.as_array().map(Vec::len), Some(1));
    assert_eq!(body[0]["outcome"], "abandoned");
}
