use crate::cli::ServeArgs;
use crate::infra::{
    load_population, load_scoring_engine, load_subscriptions, phi_guard, AppState,
    InMemoryResponseRepository,
};
use crate::routes::with_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use chrono::Utc;
use clinical_risk::alerts::AlertPublisher;
use clinical_risk::config::AppConfig;
use clinical_risk::delivery::{
    HttpWebhookTransport, InMemoryDeliveryLedger, WebhookDeliveryService,
};
use clinical_risk::error::AppError;
use clinical_risk::intake::{AssessmentService, ResponseRepository};
use clinical_risk::population::PopulationHandle;
use clinical_risk::telemetry;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let engine = &config.engine;
    let scoring = Arc::new(load_scoring_engine(engine.scoring_tables.as_deref())?);
    let population = Arc::new(PopulationHandle::new(load_population(
        engine.population_csv.as_deref(),
    )?));
    let directory = Arc::new(load_subscriptions(engine.subscriptions_file.as_deref())?);

    let delivery_config = engine.delivery_config();
    let transport = Arc::new(HttpWebhookTransport::new(delivery_config.request_timeout)?);
    let delivery = Arc::new(WebhookDeliveryService::start(
        delivery_config,
        Arc::new(InMemoryDeliveryLedger::new()),
        directory,
        transport,
    ));

    let assessment = Arc::new(AssessmentService::new(
        Arc::new(phi_guard(engine)),
        scoring,
        population,
        Arc::new(InMemoryResponseRepository::default()),
        Arc::clone(&delivery),
        engine.assessment_settings(),
    ));
    tokio::spawn(purge_expired_responses(Arc::clone(&assessment)));

    let app = with_routes(assessment, delivery)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "clinical risk engine ready");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn purge_expired_responses<R, P>(service: Arc<AssessmentService<R, P>>)
where
    R: ResponseRepository + 'static,
    P: AlertPublisher + 'static,
{
    let mut ticker = tokio::time::interval(PURGE_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(err) = service.purge_expired(Utc::now()) {
            warn!(error = %err, "retention purge failed");
        }
    }
}
