//! Signed webhook delivery with a ledger-backed retry schedule.
//!
//! Every attempt is written to the [`DeliveryLedger`] before the next one is scheduled.
//! Retries run at fixed offsets from the first attempt; once they are exhausted the
//! delivery is abandoned and listed for operators.

mod ledger;
mod payload;
mod router;
mod service;
pub mod signing;
mod transport;

#[cfg(test)]
mod tests;

pub use ledger::{
    DeliveryLedger, DirectoryError, InMemoryDeliveryLedger, LedgerError, SubscriptionDirectory,
};
pub use payload::canonical_body;
pub use router::delivery_router;
pub use service::WebhookDeliveryService;
pub use transport::{
    HttpWebhookTransport, TransportError, WebhookRequest, WebhookTransport,
};

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::alerts::{AlertId, ClinicalAlert, EventType};
use crate::phi::PhiError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub String);

impl SubscriptionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Shared HMAC secret for one subscriber. Wiped on drop.
#[derive(Clone, PartialEq, Eq, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SigningSecret(String);

impl SigningSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret([REDACTED])")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WebhookSubscription {
    pub subscription_id: SubscriptionId,
    pub url: String,
    pub secret: SigningSecret,
    pub event_types: BTreeSet<EventType>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl WebhookSubscription {
    pub fn accepts(&self, alert: &ClinicalAlert) -> bool {
        self.active && self.event_types.contains(&alert.event_type())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Pending,
    Delivered,
    Failed,
    Abandoned,
}

impl DeliveryOutcome {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Abandoned)
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }
}

/// One ledger row. The latest row for a delivery is its current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDeliveryAttempt {
    pub delivery_id: DeliveryId,
    pub subscription_id: SubscriptionId,
    pub alert_id: AlertId,
    pub attempt_number: u32,
    pub recorded_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub response_status: Option<u16>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub outcome: DeliveryOutcome,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Delays from the first attempt for each retry.
    pub retry_offsets: Vec<Duration>,
    pub request_timeout: Duration,
    pub worker_count: usize,
    pub queue_capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry_offsets: vec![
                Duration::from_secs(60),
                Duration::from_secs(180),
                Duration::from_secs(300),
            ],
            request_timeout: Duration::from_secs(10),
            worker_count: 4,
            queue_capacity: 1024,
        }
    }
}

impl DeliveryConfig {
    pub fn max_attempts(&self) -> u32 {
        self.retry_offsets.len() as u32 + 1
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Payload(#[from] PhiError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("delivery scheduler is not running")]
    SchedulerClosed,
}
