use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::webhooks::ingress::WebhookOutcome;

/// Acknowledgement of a provider completion webhook.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct WebhookAck {
    pub outcome: WebhookOutcome,
}

/// How a payment gateway webhook was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PaymentWebhookOutcome {
    Settled,
    AlreadySettled,
    /// Verified, but not an event that settles an order
    Ignored,
    UnknownOrder,
    /// The order had failed or been abandoned
    NotPending,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentWebhookAck {
    pub outcome: PaymentWebhookOutcome,
}
