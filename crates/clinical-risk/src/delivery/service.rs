use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertId, AlertPublishError, AlertPublisher, ClinicalAlert};

use super::payload::canonical_body;
use super::signing::{
    sign, ALERT_ID_HEADER, ATTEMPT_HEADER, DELIVERY_ID_HEADER, EVENT_TYPE_HEADER,
    SIGNATURE_HEADER,
};
use super::transport::{TransportError, WebhookRequest, WebhookTransport};
use super::{
    DeliveryConfig, DeliveryError, DeliveryId, DeliveryLedger, DeliveryOutcome, LedgerError,
    SubscriptionDirectory, SubscriptionId, WebhookDeliveryAttempt, WebhookSubscription,
};

#[derive(Debug, Clone, Copy)]
struct FirstAttempt {
    instant: Instant,
    at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct DeliveryJob {
    delivery_id: DeliveryId,
    subscription_id: SubscriptionId,
    alert_id: AlertId,
    event_type: &'static str,
    url: String,
    body: Arc<[u8]>,
    signature: Arc<str>,
    attempt_number: u32,
    first_attempt: Option<FirstAttempt>,
}

impl DeliveryJob {
    fn request(&self) -> WebhookRequest {
        WebhookRequest {
            url: self.url.clone(),
            headers: vec![
                (SIGNATURE_HEADER, self.signature.to_string()),
                (ALERT_ID_HEADER, self.alert_id.to_string()),
                (DELIVERY_ID_HEADER, self.delivery_id.to_string()),
                (ATTEMPT_HEADER, self.attempt_number.to_string()),
                (EVENT_TYPE_HEADER, self.event_type.to_string()),
            ],
            body: Arc::clone(&self.body),
        }
    }
}

#[derive(Debug)]
struct ScheduledJob {
    due: Instant,
    sequence: u64,
    job: DeliveryJob,
}

impl PartialEq for ScheduledJob {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl Eq for ScheduledJob {}

impl PartialOrd for ScheduledJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

struct DeliveryInner<L, D> {
    config: DeliveryConfig,
    ledger: Arc<L>,
    directory: Arc<D>,
    transport: Arc<dyn WebhookTransport>,
    schedule_tx: mpsc::UnboundedSender<ScheduledJob>,
    sequence: AtomicU64,
}

/// Signs alerts, fans them out to subscribers, and drives retries on a worker pool.
pub struct WebhookDeliveryService<L, D> {
    inner: Arc<DeliveryInner<L, D>>,
}

impl<L, D> WebhookDeliveryService<L, D>
where
    L: DeliveryLedger + 'static,
    D: SubscriptionDirectory + 'static,
{
    /// Spawns the scheduler and worker tasks on the current Tokio runtime.
    pub fn start(
        config: DeliveryConfig,
        ledger: Arc<L>,
        directory: Arc<D>,
        transport: Arc<dyn WebhookTransport>,
    ) -> Self {
        let (schedule_tx, schedule_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::channel(config.queue_capacity.max(1));
        let ready_rx = Arc::new(Mutex::new(ready_rx));
        let worker_count = config.worker_count.max(1);

        let inner = Arc::new(DeliveryInner {
            config,
            ledger,
            directory,
            transport,
            schedule_tx,
            sequence: AtomicU64::new(0),
        });

        tokio::spawn(run_scheduler(schedule_rx, ready_tx));
        for worker_id in 0..worker_count {
            tokio::spawn(run_worker(
                worker_id,
                Arc::clone(&ready_rx),
                Arc::clone(&inner),
            ));
        }

        info!(worker_count, "webhook delivery service started");
        Self { inner }
    }

    /// Records a pending delivery per accepting subscription and queues the first attempt.
    pub fn dispatch(
        &self,
        alert: &ClinicalAlert,
        subscriptions: &[WebhookSubscription],
    ) -> Result<Vec<DeliveryId>, DeliveryError> {
        let body: Arc<[u8]> = Arc::from(canonical_body(alert)?);
        let now = Utc::now();
        let mut delivery_ids = Vec::new();

        for subscription in subscriptions.iter().filter(|s| s.accepts(alert)) {
            let delivery_id = DeliveryId::new();
            self.inner.ledger.record(WebhookDeliveryAttempt {
                delivery_id,
                subscription_id: subscription.subscription_id.clone(),
                alert_id: alert.alert_id,
                attempt_number: 1,
                recorded_at: now,
                sent_at: None,
                response_status: None,
                next_retry_at: Some(now),
                outcome: DeliveryOutcome::Pending,
                last_error: None,
            })?;

            let job = DeliveryJob {
                delivery_id,
                subscription_id: subscription.subscription_id.clone(),
                alert_id: alert.alert_id,
                event_type: event_label(alert),
                url: subscription.url.clone(),
                signature: Arc::from(sign(subscription.secret.as_bytes(), &body)),
                body: Arc::clone(&body),
                attempt_number: 1,
                first_attempt: None,
            };
            self.inner.schedule(job, Instant::now())?;
            debug!(
                %delivery_id,
                subscription_id = %subscription.subscription_id,
                alert_id = %alert.alert_id,
                "webhook delivery queued"
            );
            delivery_ids.push(delivery_id);
        }

        Ok(delivery_ids)
    }

    /// Abandons every in-flight delivery for a deactivated subscription.
    pub fn abandon_pending_for(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<usize, DeliveryError> {
        let in_flight = self.inner.ledger.in_flight_for(subscription_id)?;
        let mut abandoned = 0;
        for latest in &in_flight {
            let recorded = self.inner.ledger.record(WebhookDeliveryAttempt {
                recorded_at: Utc::now(),
                sent_at: None,
                response_status: None,
                next_retry_at: None,
                outcome: DeliveryOutcome::Abandoned,
                last_error: Some("subscription deactivated".to_string()),
                ..latest.clone()
            });
            match recorded {
                Ok(()) => abandoned += 1,
                // Settled by a worker between the query and this record.
                Err(LedgerError::Settled(_)) => continue,
                Err(err) => return Err(err.into()),
            }
            metrics::counter!("webhook_deliveries_total", "outcome" => "abandoned").increment(1);
        }
        if abandoned > 0 {
            warn!(
                %subscription_id,
                abandoned,
                "pending webhook deliveries abandoned for deactivated subscription"
            );
        }
        Ok(abandoned)
    }

    pub fn abandoned(&self) -> Result<Vec<WebhookDeliveryAttempt>, DeliveryError> {
        Ok(self.inner.ledger.abandoned()?)
    }

    pub fn history(
        &self,
        delivery_id: &DeliveryId,
    ) -> Result<Vec<WebhookDeliveryAttempt>, DeliveryError> {
        Ok(self.inner.ledger.history(delivery_id)?)
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.inner.config
    }
}

impl<L, D> AlertPublisher for WebhookDeliveryService<L, D>
where
    L: DeliveryLedger + 'static,
    D: SubscriptionDirectory + 'static,
{
    fn publish(&self, alert: &ClinicalAlert) -> Result<(), AlertPublishError> {
        let subscriptions = self
            .inner
            .directory
            .active_subscriptions()
            .map_err(|err| AlertPublishError(err.to_string()))?;
        self.dispatch(alert, &subscriptions)
            .map(|_| ())
            .map_err(|err| AlertPublishError(err.to_string()))
    }
}

fn event_label(alert: &ClinicalAlert) -> &'static str {
    use crate::alerts::EventType;
    match alert.event_type() {
        EventType::SafetyFlag => "safety_flag",
        EventType::RiskBandThreshold => "risk_band_threshold",
        EventType::ForecastEscalation => "forecast_escalation",
    }
}

impl<L, D> DeliveryInner<L, D>
where
    L: DeliveryLedger,
    D: SubscriptionDirectory,
{
    fn schedule(&self, job: DeliveryJob, due: Instant) -> Result<(), DeliveryError> {
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        self.schedule_tx
            .send(ScheduledJob { due, sequence, job })
            .map_err(|_| DeliveryError::SchedulerClosed)
    }

    async fn attempt(&self, mut job: DeliveryJob) {
        match self.ledger.latest(&job.delivery_id) {
            Ok(Some(latest)) if latest.outcome.is_terminal() => {
                debug!(
                    delivery_id = %job.delivery_id,
                    outcome = latest.outcome.label(),
                    "skipping attempt for settled delivery"
                );
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(
                    delivery_id = %job.delivery_id,
                    error = %err,
                    "could not read delivery state"
                );
            }
        }

        match self.directory.is_active(&job.subscription_id) {
            Ok(true) => {}
            Ok(false) => {
                self.settle(
                    &job,
                    DeliveryOutcome::Abandoned,
                    None,
                    None,
                    Some("subscription deactivated".to_string()),
                );
                return;
            }
            Err(err) => {
                let first = *job.first_attempt.get_or_insert_with(now_pair);
                self.fail(job, first, None, None, err.to_string());
                return;
            }
        }

        let first = *job.first_attempt.get_or_insert_with(now_pair);
        let sent_at = Utc::now();
        let request = job.request();
        let result = match tokio::time::timeout(
            self.config.request_timeout,
            self.transport.send(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        match result {
            Ok(status) if (200..300).contains(&status) => {
                self.settle(
                    &job,
                    DeliveryOutcome::Delivered,
                    Some(sent_at),
                    Some(status),
                    None,
                );
            }
            Ok(status) => {
                let reason = format!("endpoint responded with status {status}");
                self.fail(job, first, Some(sent_at), Some(status), reason);
            }
            Err(err) => {
                self.fail(job, first, Some(sent_at), None, err.to_string());
            }
        }
    }

    fn fail(
        &self,
        job: DeliveryJob,
        first: FirstAttempt,
        sent_at: Option<DateTime<Utc>>,
        status: Option<u16>,
        reason: String,
    ) {
        let retry_index = job.attempt_number as usize - 1;
        let Some(offset) = self.config.retry_offsets.get(retry_index).copied() else {
            self.settle(&job, DeliveryOutcome::Abandoned, sent_at, status, Some(reason));
            return;
        };

        let next_retry_at =
            first.at + chrono::Duration::milliseconds(offset.as_millis() as i64);
        let recorded = self.ledger.record(WebhookDeliveryAttempt {
            delivery_id: job.delivery_id,
            subscription_id: job.subscription_id.clone(),
            alert_id: job.alert_id,
            attempt_number: job.attempt_number,
            recorded_at: Utc::now(),
            sent_at,
            response_status: status,
            next_retry_at: Some(next_retry_at),
            outcome: DeliveryOutcome::Failed,
            last_error: Some(reason.clone()),
        });
        match recorded {
            Ok(()) => {}
            Err(LedgerError::Settled(_)) => {
                debug!(
                    delivery_id = %job.delivery_id,
                    attempt = job.attempt_number,
                    "delivery settled while the attempt was in flight; no retry"
                );
                return;
            }
            Err(err) => error!(
                delivery_id = %job.delivery_id,
                error = %err,
                "failed to record delivery attempt"
            ),
        }
        metrics::counter!("webhook_deliveries_total", "outcome" => "failed").increment(1);
        warn!(
            delivery_id = %job.delivery_id,
            subscription_id = %job.subscription_id,
            attempt = job.attempt_number,
            %next_retry_at,
            reason = %reason,
            "webhook delivery attempt failed; retry scheduled"
        );

        let retry = DeliveryJob {
            attempt_number: job.attempt_number + 1,
            first_attempt: Some(first),
            ..job.clone()
        };
        if self.schedule(retry, first.instant + offset).is_err() {
            self.settle(
                &job,
                DeliveryOutcome::Abandoned,
                None,
                None,
                Some("delivery scheduler stopped".to_string()),
            );
        }
    }

    fn settle(
        &self,
        job: &DeliveryJob,
        outcome: DeliveryOutcome,
        sent_at: Option<DateTime<Utc>>,
        status: Option<u16>,
        reason: Option<String>,
    ) {
        let recorded = self.ledger.record(WebhookDeliveryAttempt {
            delivery_id: job.delivery_id,
            subscription_id: job.subscription_id.clone(),
            alert_id: job.alert_id,
            attempt_number: job.attempt_number,
            recorded_at: Utc::now(),
            sent_at,
            response_status: status,
            next_retry_at: None,
            outcome,
            last_error: reason.clone(),
        });
        match recorded {
            Ok(()) => {}
            Err(LedgerError::Settled(_)) => {
                debug!(
                    delivery_id = %job.delivery_id,
                    outcome = outcome.label(),
                    "delivery already settled; outcome not recorded"
                );
                return;
            }
            Err(err) => error!(
                delivery_id = %job.delivery_id,
                error = %err,
                "failed to record delivery outcome"
            ),
        }
        metrics::counter!("webhook_deliveries_total", "outcome" => outcome.label()).increment(1);

        match outcome {
            DeliveryOutcome::Delivered => info!(
                delivery_id = %job.delivery_id,
                subscription_id = %job.subscription_id,
                attempt = job.attempt_number,
                "webhook delivered"
            ),
            _ => warn!(
                delivery_id = %job.delivery_id,
                subscription_id = %job.subscription_id,
                attempt = job.attempt_number,
                reason = reason.as_deref().unwrap_or("unknown"),
                "webhook delivery abandoned"
            ),
        }
    }
}

fn now_pair() -> FirstAttempt {
    FirstAttempt {
        instant: Instant::now(),
        at: Utc::now(),
    }
}

/// Holds queued attempts until due, then hands them to the worker pool.
async fn run_scheduler(
    mut inbox: mpsc::UnboundedReceiver<ScheduledJob>,
    ready: mpsc::Sender<DeliveryJob>,
) {
    let mut queue: BinaryHeap<Reverse<ScheduledJob>> = BinaryHeap::new();
    let mut inbox_open = true;

    loop {
        let now = Instant::now();
        while queue.peek().is_some_and(|Reverse(next)| next.due <= now) {
            if let Some(Reverse(scheduled)) = queue.pop() {
                if ready.send(scheduled.job).await.is_err() {
                    debug!("delivery workers stopped; scheduler exiting");
                    return;
                }
            }
        }

        if !inbox_open && queue.is_empty() {
            return;
        }

        let next_due = queue.peek().map(|Reverse(next)| next.due);
        let wait = async {
            match next_due {
                Some(due) => tokio::time::sleep_until(due).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            incoming = inbox.recv(), if inbox_open => match incoming {
                Some(scheduled) => queue.push(Reverse(scheduled)),
                None => inbox_open = false,
            },
            _ = wait => {}
        }
    }
}

async fn run_worker<L, D>(
    worker_id: usize,
    jobs: Arc<Mutex<mpsc::Receiver<DeliveryJob>>>,
    inner: Arc<DeliveryInner<L, D>>,
) where
    L: DeliveryLedger,
    D: SubscriptionDirectory,
{
    debug!(worker_id, "delivery worker started");
    loop {
        let job = {
            let mut receiver = jobs.lock().await;
            receiver.recv().await
        };
        let Some(job) = job else {
            debug!(worker_id, "delivery worker stopping (queue closed)");
            return;
        };
        inner.attempt(job).await;
    }
}
