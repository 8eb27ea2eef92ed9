//! Webhook Event Types
//!
//! Strongly-typed representations of purchase and subscription webhook
//! events. The envelope is parsed first; the `data` object is only decoded
//! into a typed payload once the event type says which shape to expect.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{GuardError, GuardResult};

/// Event types we handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookEventType {
    // Purchase events
    PurchaseApproved,
    PurchaseComplete,
    PurchaseCanceled,
    PurchaseRefunded,
    PurchaseChargeback,
    PurchaseDelayed,

    // Subscription events
    SubscriptionCancellation,
    SwitchPlan,

    // Catch-all for events we don't explicitly handle
    #[serde(other)]
    Unknown,
}

impl FromStr for WebhookEventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "PURCHASE_APPROVED" => Self::PurchaseApproved,
            "PURCHASE_COMPLETE" => Self::PurchaseComplete,
            "PURCHASE_CANCELED" => Self::PurchaseCanceled,
            "PURCHASE_REFUNDED" => Self::PurchaseRefunded,
            "PURCHASE_CHARGEBACK" => Self::PurchaseChargeback,
            "PURCHASE_DELAYED" => Self::PurchaseDelayed,
            "SUBSCRIPTION_CANCELLATION" => Self::SubscriptionCancellation,
            "SWITCH_PLAN" => Self::SwitchPlan,
            _ => Self::Unknown,
        })
    }
}

impl WebhookEventType {
    /// Get the string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PurchaseApproved => "PURCHASE_APPROVED",
            Self::PurchaseComplete => "PURCHASE_COMPLETE",
            Self::PurchaseCanceled => "PURCHASE_CANCELED",
            Self::PurchaseRefunded => "PURCHASE_REFUNDED",
            Self::PurchaseChargeback => "PURCHASE_CHARGEBACK",
            Self::PurchaseDelayed => "PURCHASE_DELAYED",
            Self::SubscriptionCancellation => "SUBSCRIPTION_CANCELLATION",
            Self::SwitchPlan => "SWITCH_PLAN",
            Self::Unknown => "unknown",
        }
    }

    /// Check if this is a known event type
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    pub fn is_purchase(&self) -> bool {
        matches!(
            self,
            Self::PurchaseApproved
                | Self::PurchaseComplete
                | Self::PurchaseCanceled
                | Self::PurchaseRefunded
                | Self::PurchaseChargeback
                | Self::PurchaseDelayed
        )
    }
}

/// Generic webhook envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    /// Provider's unique event id; the idempotency key
    pub id: String,

    /// Event name, e.g. `PURCHASE_APPROVED`
    pub event: String,

    /// Creation time (Unix milliseconds) as reported by the provider
    #[serde(default)]
    pub creation_date: Option<i64>,

    /// Provider version of the payload format
    #[serde(default)]
    pub version: Option<String>,

    /// Event-specific payload
    #[serde(default)]
    pub data: Value,
}

impl WebhookEnvelope {
    /// Decode the envelope from an already sanitized value.
    pub fn from_value(value: Value) -> GuardResult<Self> {
        let envelope: Self = serde_json::from_value(value).map_err(|e| {
            debug!(error = %e, "Webhook envelope rejected");
            GuardError::validation("Invalid webhook payload: expected {id, event, data}")
        })?;

        if envelope.id.trim().is_empty() {
            return Err(GuardError::validation("Webhook event id is required"));
        }
        if envelope.event.trim().is_empty() {
            return Err(GuardError::validation("Webhook event name is required"));
        }
        Ok(envelope)
    }

    /// Get the typed event type
    pub fn typed_event_type(&self) -> WebhookEventType {
        match WebhookEventType::from_str(&self.event) {
            Ok(event_type) => event_type,
            Err(never) => match never {},
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(&self) -> GuardResult<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            debug!(event_id = %self.id, error = %e, "Webhook data rejected");
            GuardError::validation(format!("Invalid payload for {}", self.event))
        })
    }

    /// Extract purchase from event data
    pub fn as_purchase(&self) -> GuardResult<PurchaseEvent> {
        let event_type = self.typed_event_type();
        if !event_type.is_purchase() {
            return Err(GuardError::validation(format!(
                "Event {} is not a purchase event",
                self.event
            )));
        }

        Ok(PurchaseEvent {
            event_id: self.id.clone(),
            event_type,
            data: self.decode()?,
        })
    }

    /// Extract subscription change from event data
    pub fn as_subscription_change(&self) -> GuardResult<SubscriptionChangeEvent> {
        let event_type = self.typed_event_type();
        match event_type {
            WebhookEventType::SubscriptionCancellation | WebhookEventType::SwitchPlan => {
                let data: SubscriptionChangeData = self.decode()?;
                if event_type == WebhookEventType::SwitchPlan && data.plan.is_none() {
                    return Err(GuardError::validation("SWITCH_PLAN requires a plan"));
                }
                Ok(SubscriptionChangeEvent {
                    event_id: self.id.clone(),
                    event_type,
                    data,
                })
            }
            _ => Err(GuardError::validation(format!(
                "Event {} is not a subscription event",
                self.event
            ))),
        }
    }
}

/// Purchaser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Buyer {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    /// CPF or other tax document; stored encrypted
    #[serde(default)]
    pub document: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub value: f64,
    #[serde(default)]
    pub currency_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Purchase {
    /// Provider transaction id
    pub transaction: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub price: Option<Price>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    #[serde(default)]
    pub id: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub plan: Option<Plan>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub name: Option<String>,
}

/// `data` of a purchase event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseData {
    pub buyer: Buyer,
    pub purchase: Purchase,
    #[serde(default)]
    pub subscription: Option<SubscriptionInfo>,
    #[serde(default)]
    pub product: Option<Product>,
}

/// Typed purchase event
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseEvent {
    pub event_id: String,
    pub event_type: WebhookEventType,
    pub data: PurchaseData,
}

impl PurchaseEvent {
    pub fn subscriber_email(&self) -> &str {
        &self.data.buyer.email
    }

    pub fn plan_name(&self) -> Option<&str> {
        self.data
            .subscription
            .as_ref()
            .and_then(|s| s.plan.as_ref())
            .map(|p| p.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscriber {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Provider subscriber code
    #[serde(default)]
    pub code: Option<String>,
}

/// `data` of a subscription cancellation or plan switch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionChangeData {
    pub subscriber: Subscriber,
    /// New plan (SWITCH_PLAN)
    #[serde(default)]
    pub plan: Option<Plan>,
    /// Unix milliseconds
    #[serde(default)]
    pub cancellation_date: Option<i64>,
}

/// Typed subscription change event
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionChangeEvent {
    pub event_id: String,
    pub event_type: WebhookEventType,
    pub data: SubscriptionChangeData,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn purchase_envelope(event: &str) -> WebhookEnvelope {
        WebhookEnvelope::from_value(json!({
            "id": "evt-1",
            "event": event,
            "creation_date": 1_700_000_000_000i64,
            "data": {
                "buyer": {"email": "ana@example.com", "name": "Ana", "document": "12345678909"},
                "purchase": {"transaction": "HP123", "status": "APPROVED",
                             "price": {"value": 49.9, "currency_value": "BRL"}},
                "subscription": {"status": "ACTIVE", "plan": {"name": "Pro", "id": 7}},
                "product": {"id": 1, "name": "Turnover"}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_event_type_parsing() {
        assert_eq!(
            WebhookEventType::from_str("PURCHASE_APPROVED").unwrap(),
            WebhookEventType::PurchaseApproved
        );
        assert_eq!(
            WebhookEventType::from_str("SWITCH_PLAN").unwrap(),
            WebhookEventType::SwitchPlan
        );
        assert_eq!(
            WebhookEventType::from_str("CLUB_FIRST_ACCESS").unwrap(),
            WebhookEventType::Unknown
        );
        assert!(!WebhookEventType::Unknown.is_known());
        assert_eq!(WebhookEventType::PurchaseChargeback.as_str(), "PURCHASE_CHARGEBACK");
    }

    #[test]
    fn test_purchase_extraction() {
        let event = purchase_envelope("PURCHASE_APPROVED").as_purchase().unwrap();
        assert_eq!(event.event_type, WebhookEventType::PurchaseApproved);
        assert_eq!(event.subscriber_email(), "ana@example.com");
        assert_eq!(event.plan_name(), Some("Pro"));
        assert_eq!(event.data.purchase.transaction, "HP123");
    }

    #[test]
    fn test_purchase_extraction_rejects_wrong_kind() {
        let envelope = purchase_envelope("SWITCH_PLAN");
        assert!(envelope.as_purchase().is_err());
    }

    #[test]
    fn test_envelope_requires_id_and_event() {
        assert!(WebhookEnvelope::from_value(json!({"event": "PURCHASE_APPROVED", "data": {}})).is_err());
        assert!(WebhookEnvelope::from_value(json!({"id": " ", "event": "X"})).is_err());
        assert!(WebhookEnvelope::from_value(json!({"id": "e", "event": ""})).is_err());
        assert!(WebhookEnvelope::from_value(json!("string")).is_err());
    }

    #[test]
    fn test_missing_buyer_is_validation_error() {
        let envelope = WebhookEnvelope::from_value(json!({
            "id": "evt-2",
            "event": "PURCHASE_APPROVED",
            "data": {"purchase": {"transaction": "HP1"}}
        }))
        .unwrap();
        let err = envelope.as_purchase().unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_switch_plan_requires_plan() {
        let without = WebhookEnvelope::from_value(json!({
            "id": "evt-3",
            "event": "SWITCH_PLAN",
            "data": {"subscriber": {"email": "ana@example.com"}}
        }))
        .unwrap();
        assert!(without.as_subscription_change().is_err());

        let with = WebhookEnvelope::from_value(json!({
            "id": "evt-4",
            "event": "SWITCH_PLAN",
            "data": {"subscriber": {"email": "ana@example.com"}, "plan": {"name": "Business"}}
        }))
        .unwrap();
        let change = with.as_subscription_change().unwrap();
        assert_eq!(change.data.plan.unwrap().name, "Business");
    }
}
