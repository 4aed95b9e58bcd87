pub mod error;
pub mod money;
pub mod state;

pub use error::EngineError;
pub use money::{Money, MoneyParseError};
pub use state::{
    CheckoutEvent, CheckoutStage, DeliveryMethod, OrderEvent, OrderStatus,
};

use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// How many units a claim command asks for. `"claim"` with no argument is
/// `Count(1)`, `"claim 3"` is `Count(3)`, `"claim all"` takes whatever is
/// left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantitySpec {
    All,
    Count(i32),
}

impl Default for QuantitySpec {
    fn default() -> Self {
        QuantitySpec::Count(1)
    }
}

impl FromStr for QuantitySpec {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(QuantitySpec::All);
        }
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            let n = s.parse().map_err(|_| EngineError::InvalidQuantity)?;
            return Ok(QuantitySpec::Count(n));
        }
        Err(EngineError::InvalidQuantity)
    }
}

impl QuantitySpec {
    /// `All` resolves against live stock; a negative count is a caller bug.
    /// A resolved value of zero is reported by the engine as
    /// `NothingAvailable`, matching the stock check, not as a shape error.
    pub fn resolve(self, remaining: i32) -> Result<i32, EngineError> {
        match self {
            QuantitySpec::All => Ok(remaining),
            QuantitySpec::Count(n) if n >= 0 => Ok(n),
            QuantitySpec::Count(_) => Err(EngineError::InvalidQuantity),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimOutcome {
    pub resource_id: i64,
    pub item_name: String,
    pub quantity_reserved: i32,
    pub new_remaining: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub resource_id: i64,
    pub item_name: String,
    pub quantity_released: i32,
    pub new_remaining: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeOutcome {
    pub resource_id: i64,
    pub item_name: String,
    pub quantity_revoked: i32,
    pub new_remaining: i32,
    pub invoice_no: Option<String>,
    pub order_cancelled: bool,
}

/// One row of a buyer's bag: their active claims on an item, grouped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimSummaryEntry {
    pub resource_id: i64,
    pub name: String,
    pub unit_price: Money,
    pub quantity: i64,
}

/// Admin view: an actor holding active claims, for the revoke flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimHolder {
    pub actor_id: i64,
    pub display_name: Option<String>,
    pub quantity: i64,
    pub earliest: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItemView {
    pub resource_id: i64,
    pub name: String,
    pub unit_price: Money,
    pub quantity: i32,
}

/// Plain line-item list and totals; the document collaborator renders this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderView {
    pub invoice_no: String,
    pub buyer_id: i64,
    pub buyer_name: Option<String>,
    pub delivery_method: DeliveryMethod,
    pub status: OrderStatus,
    pub line_items: Vec<LineItemView>,
    pub cards_subtotal: Money,
    pub delivery_fee: Money,
    pub total: Money,
    pub tracking_number: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Buyer,
    Admin,
    Stale,
}

impl ReleaseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseReason::Buyer => "buyer",
            ReleaseReason::Admin => "admin",
            ReleaseReason::Stale => "stale",
        }
    }
}

/// Outbox payloads. The chat transport consumes these to notify buyers and
/// the admin; the core never calls the transport directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    ClaimReserved {
        resource_id: i64,
        actor_id: i64,
        quantity: i32,
        remaining: i32,
    },
    ClaimsReleased {
        resource_id: i64,
        actor_id: i64,
        quantity: i32,
        remaining: i32,
        reason: ReleaseReason,
    },
    OrderCreated {
        invoice_no: String,
        buyer_id: i64,
        total: Money,
    },
    OrderAdjusted {
        invoice_no: String,
        cards_subtotal: Money,
        total: Money,
    },
    OrderCancelled {
        invoice_no: String,
    },
    PaymentProofReceived {
        invoice_no: String,
    },
    PaymentReviewed {
        invoice_no: String,
        approved: bool,
    },
    OrderPacked {
        invoice_no: String,
    },
    OrderShipped {
        invoice_no: String,
        tracking_number: String,
    },
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::ClaimReserved { .. } => "ClaimReserved",
            DomainEvent::ClaimsReleased { .. } => "ClaimsReleased",
            DomainEvent::OrderCreated { .. } => "OrderCreated",
            DomainEvent::OrderAdjusted { .. } => "OrderAdjusted",
            DomainEvent::OrderCancelled { .. } => "OrderCancelled",
            DomainEvent::PaymentProofReceived { .. } => "PaymentProofReceived",
            DomainEvent::PaymentReviewed { .. } => "PaymentReviewed",
            DomainEvent::OrderPacked { .. } => "OrderPacked",
            DomainEvent::OrderShipped { .. } => "OrderShipped",
        }
    }

    /// Partition key for the event stream: the entity the event is about.
    pub fn aggregate_ref(&self) -> String {
        match self {
            DomainEvent::ClaimReserved { resource_id, .. }
            | DomainEvent::ClaimsReleased { resource_id, .. } => format!("item:{resource_id}"),
            DomainEvent::OrderCreated { invoice_no, .. }
            | DomainEvent::OrderAdjusted { invoice_no, .. }
            | DomainEvent::OrderCancelled { invoice_no }
            | DomainEvent::PaymentProofReceived { invoice_no }
            | DomainEvent::PaymentReviewed { invoice_no, .. }
            | DomainEvent::OrderPacked { invoice_no }
            | DomainEvent::OrderShipped { invoice_no, .. } => format!("order:{invoice_no}"),
        }
    }
}

static TRACKING_RE: OnceLock<Regex> = OnceLock::new();

/// Validated postal tracking number. The OCR collaborator hands us raw
/// label text; we accept the first thing in it shaped like `RR123456789SG`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingNumber(String);

impl TrackingNumber {
    pub fn extract(text: &str) -> Option<TrackingNumber> {
        let re = TRACKING_RE.get_or_init(|| Regex::new(r"[A-Z]{2}[0-9]{9}SG").unwrap());
        re.find(&text.to_uppercase())
            .map(|m| TrackingNumber(m.as_str().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TrackingNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_spec_parses_claim_arguments() {
        assert_eq!("all".parse::<QuantitySpec>().unwrap(), QuantitySpec::All);
        assert_eq!("ALL".parse::<QuantitySpec>().unwrap(), QuantitySpec::All);
        assert_eq!(
            "2".parse::<QuantitySpec>().unwrap(),
            QuantitySpec::Count(2)
        );
        assert!(matches!(
            "two".parse::<QuantitySpec>(),
            Err(EngineError::InvalidQuantity)
        ));
        assert!(matches!(
            "-1".parse::<QuantitySpec>(),
            Err(EngineError::InvalidQuantity)
        ));
    }

    #[test]
    fn quantity_spec_resolution() {
        assert_eq!(QuantitySpec::All.resolve(7).unwrap(), 7);
        assert_eq!(QuantitySpec::All.resolve(0).unwrap(), 0);
        assert_eq!(QuantitySpec::Count(3).resolve(10).unwrap(), 3);
        assert!(QuantitySpec::Count(-2).resolve(10).is_err());
    }

    #[test]
    fn tracking_number_is_extracted_from_label_text() {
        let text = "SINGPOST\nRegistered Mail\nrr123456789sg\nSG 123456";
        assert_eq!(
            TrackingNumber::extract(text).unwrap().as_str(),
            "RR123456789SG"
        );
        assert!(TrackingNumber::extract("no tracking here 123").is_none());
        assert!(TrackingNumber::extract("RR12345SG").is_none());
    }

    #[test]
    fn domain_events_tag_and_partition() {
        let event = DomainEvent::OrderShipped {
            invoice_no: "INV-000016".into(),
            tracking_number: "RR123456789SG".into(),
        };
        assert_eq!(event.event_type(), "OrderShipped");
        assert_eq!(event.aggregate_ref(), "order:INV-000016");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "order_shipped");
        assert_eq!(json["tracking_number"], "RR123456789SG");
    }
}
