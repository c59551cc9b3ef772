use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::{DeliveryId, SubscriptionId, WebhookDeliveryAttempt, WebhookSubscription};

/// Append-only record of delivery attempts.
pub trait DeliveryLedger: Send + Sync {
    /// Appends `attempt`. Fails with [`LedgerError::Settled`] once the delivery's latest
    /// record is terminal; the check and the append are atomic.
    fn record(&self, attempt: WebhookDeliveryAttempt) -> Result<(), LedgerError>;
    fn latest(
        &self,
        delivery_id: &DeliveryId,
    ) -> Result<Option<WebhookDeliveryAttempt>, LedgerError>;
    fn history(&self, delivery_id: &DeliveryId) -> Result<Vec<WebhookDeliveryAttempt>, LedgerError>;
    /// Latest record of every delivery for `subscription_id` that is not yet terminal.
    fn in_flight_for(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<WebhookDeliveryAttempt>, LedgerError>;
    /// Latest record of every abandoned delivery, oldest first.
    fn abandoned(&self) -> Result<Vec<WebhookDeliveryAttempt>, LedgerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("delivery ledger unavailable: {0}")]
    Unavailable(String),
    #[error("delivery {0} is already settled")]
    Settled(DeliveryId),
}

/// Source of webhook subscriptions, managed outside the engine.
pub trait SubscriptionDirectory: Send + Sync {
    fn active_subscriptions(&self) -> Result<Vec<WebhookSubscription>, DirectoryError>;
    fn is_active(&self, subscription_id: &SubscriptionId) -> Result<bool, DirectoryError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectoryError {
    #[error("subscription directory unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Default)]
struct LedgerState {
    order: Vec<DeliveryId>,
    attempts: HashMap<DeliveryId, Vec<WebhookDeliveryAttempt>>,
}

/// Process-local ledger.
#[derive(Debug, Default)]
pub struct InMemoryDeliveryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryDeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn latest_matching(
        &self,
        predicate: impl Fn(&WebhookDeliveryAttempt) -> bool,
    ) -> Vec<WebhookDeliveryAttempt> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .order
            .iter()
            .filter_map(|id| state.attempts.get(id).and_then(|history| history.last()))
            .filter(|attempt| predicate(attempt))
            .cloned()
            .collect()
    }
}

impl DeliveryLedger for InMemoryDeliveryLedger {
    fn record(&self, attempt: WebhookDeliveryAttempt) -> Result<(), LedgerError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let delivery_id = attempt.delivery_id;
        let settled = state
            .attempts
            .get(&delivery_id)
            .and_then(|history| history.last())
            .is_some_and(|latest| latest.outcome.is_terminal());
        if settled {
            return Err(LedgerError::Settled(delivery_id));
        }
        if !state.attempts.contains_key(&delivery_id) {
            state.order.push(delivery_id);
        }
        state.attempts.entry(delivery_id).or_default().push(attempt);
        Ok(())
    }

    fn latest(
        &self,
        delivery_id: &DeliveryId,
    ) -> Result<Option<WebhookDeliveryAttempt>, LedgerError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .attempts
            .get(delivery_id)
            .and_then(|history| history.last())
            .cloned())
    }

    fn history(
        &self,
        delivery_id: &DeliveryId,
    ) -> Result<Vec<WebhookDeliveryAttempt>, LedgerError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.attempts.get(delivery_id).cloned().unwrap_or_default())
    }

    fn in_flight_for(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Vec<WebhookDeliveryAttempt>, LedgerError> {
        Ok(self.latest_matching(|attempt| {
            &attempt.subscription_id == subscription_id && !attempt.outcome.is_terminal()
        }))
    }

    fn abandoned(&self) -> Result<Vec<WebhookDeliveryAttempt>, LedgerError> {
        Ok(self.latest_matching(|attempt| attempt.outcome == super::DeliveryOutcome::Abandoned))
    }
}
