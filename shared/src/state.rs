use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    Tracked,
    SelfCollection,
}

impl DeliveryMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryMethod::Tracked => "tracked",
            DeliveryMethod::SelfCollection => "self_collection",
        }
    }

    pub fn parse(s: &str) -> Option<DeliveryMethod> {
        match s {
            "tracked" => Some(DeliveryMethod::Tracked),
            "self_collection" => Some(DeliveryMethod::SelfCollection),
            _ => None,
        }
    }

    /// Only tracked mail collects a shipping address.
    pub fn needs_address(self) -> bool {
        matches!(self, DeliveryMethod::Tracked)
    }
}

/// Per-buyer checkout progression, persisted in `actor_sessions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStage {
    Idle,
    ChoosingDelivery,
    AwaitingConfirmation,
    AwaitingPayment,
    PaymentSubmitted,
    AwaitingAddress,
    ConfirmingAddress,
    AwaitingFulfillment,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutEvent {
    SessionStarted { has_claims: bool },
    DeliveryChosen(DeliveryMethod),
    CheckoutConfirmed,
    PaymentProofReceived,
    PaymentApproved { needs_address: bool },
    PaymentRejected,
    AddressSubmitted,
    AddressConfirmed,
    AddressReentered,
    OrderShipped,
}

impl CheckoutEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CheckoutEvent::SessionStarted { .. } => "session_started",
            CheckoutEvent::DeliveryChosen(_) => "delivery_chosen",
            CheckoutEvent::CheckoutConfirmed => "checkout_confirmed",
            CheckoutEvent::PaymentProofReceived => "payment_proof_received",
            CheckoutEvent::PaymentApproved { .. } => "payment_approved",
            CheckoutEvent::PaymentRejected => "payment_rejected",
            CheckoutEvent::AddressSubmitted => "address_submitted",
            CheckoutEvent::AddressConfirmed => "address_confirmed",
            CheckoutEvent::AddressReentered => "address_reentered",
            CheckoutEvent::OrderShipped => "order_shipped",
        }
    }
}

impl CheckoutStage {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckoutStage::Idle => "idle",
            CheckoutStage::ChoosingDelivery => "choosing_delivery",
            CheckoutStage::AwaitingConfirmation => "awaiting_confirmation",
            CheckoutStage::AwaitingPayment => "awaiting_payment",
            CheckoutStage::PaymentSubmitted => "payment_submitted",
            CheckoutStage::AwaitingAddress => "awaiting_address",
            CheckoutStage::ConfirmingAddress => "confirming_address",
            CheckoutStage::AwaitingFulfillment => "awaiting_fulfillment",
            CheckoutStage::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<CheckoutStage> {
        match s {
            "idle" => Some(CheckoutStage::Idle),
            "choosing_delivery" => Some(CheckoutStage::ChoosingDelivery),
            "awaiting_confirmation" => Some(CheckoutStage::AwaitingConfirmation),
            "awaiting_payment" => Some(CheckoutStage::AwaitingPayment),
            "payment_submitted" => Some(CheckoutStage::PaymentSubmitted),
            "awaiting_address" => Some(CheckoutStage::AwaitingAddress),
            "confirming_address" => Some(CheckoutStage::ConfirmingAddress),
            "awaiting_fulfillment" => Some(CheckoutStage::AwaitingFulfillment),
            "done" => Some(CheckoutStage::Done),
            _ => None,
        }
    }

    /// Fixed transition table; out-of-order events are rejected, never
    /// silently ignored.
    pub fn apply(self, event: &CheckoutEvent) -> Result<CheckoutStage, EngineError> {
        use CheckoutEvent::*;
        use CheckoutStage::*;

        // Starting a session always recomputes the entry stage from the
        // buyer's live claims, whatever was left behind.
        if let SessionStarted { has_claims } = event {
            return Ok(if *has_claims { ChoosingDelivery } else { Idle });
        }

        let next = match (self, event) {
            (ChoosingDelivery, DeliveryChosen(_)) => AwaitingConfirmation,
            (AwaitingConfirmation, CheckoutConfirmed) => AwaitingPayment,
            (AwaitingPayment, PaymentProofReceived) => PaymentSubmitted,
            (PaymentSubmitted, PaymentApproved { needs_address }) => {
                if *needs_address {
                    AwaitingAddress
                } else {
                    AwaitingFulfillment
                }
            }
            (PaymentSubmitted, PaymentRejected) => AwaitingPayment,
            (AwaitingAddress, AddressSubmitted) => ConfirmingAddress,
            (ConfirmingAddress, AddressConfirmed) => AwaitingFulfillment,
            (ConfirmingAddress, AddressReentered) => AwaitingAddress,
            (AwaitingFulfillment, OrderShipped) => Done,
            (from, event) => {
                return Err(EngineError::InvalidTransition {
                    from: from.as_str(),
                    event: event.name(),
                })
            }
        };
        Ok(next)
    }
}

/// Order lifecycle, stored on the order row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    AwaitingPayment,
    PaymentSubmitted,
    AwaitingAddress,
    PackingPending,
    Packed,
    Shipped,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderEvent {
    PaymentProofReceived,
    PaymentApproved { needs_address: bool },
    PaymentRejected,
    AddressConfirmed,
    MarkedPacked,
    MarkedShipped,
}

impl OrderEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OrderEvent::PaymentProofReceived => "payment_proof_received",
            OrderEvent::PaymentApproved { .. } => "payment_approved",
            OrderEvent::PaymentRejected => "payment_rejected",
            OrderEvent::AddressConfirmed => "address_confirmed",
            OrderEvent::MarkedPacked => "marked_packed",
            OrderEvent::MarkedShipped => "marked_shipped",
        }
    }
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::AwaitingPayment => "awaiting_payment",
            OrderStatus::PaymentSubmitted => "payment_submitted",
            OrderStatus::AwaitingAddress => "awaiting_address",
            OrderStatus::PackingPending => "packing_pending",
            OrderStatus::Packed => "packed",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<OrderStatus> {
        match s {
            "awaiting_payment" => Some(OrderStatus::AwaitingPayment),
            "payment_submitted" => Some(OrderStatus::PaymentSubmitted),
            "awaiting_address" => Some(OrderStatus::AwaitingAddress),
            "packing_pending" => Some(OrderStatus::PackingPending),
            "packed" => Some(OrderStatus::Packed),
            "shipped" => Some(OrderStatus::Shipped),
            "rejected" => Some(OrderStatus::Rejected),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal orders are invisible to reconciliation.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Shipped | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }

    pub fn apply(self, event: &OrderEvent) -> Result<OrderStatus, EngineError> {
        use OrderEvent::*;
        use OrderStatus::*;

        let next = match (self, event) {
            (AwaitingPayment, PaymentProofReceived) => PaymentSubmitted,
            (PaymentSubmitted, PaymentApproved { needs_address }) => {
                if *needs_address {
                    AwaitingAddress
                } else {
                    PackingPending
                }
            }
            (PaymentSubmitted, PaymentRejected) => Rejected,
            (AwaitingAddress, AddressConfirmed) => PackingPending,
            (PackingPending, MarkedPacked) => Packed,
            (Packed, MarkedShipped) => Shipped,
            (from, event) => {
                return Err(EngineError::InvalidTransition {
                    from: from.as_str(),
                    event: event.name(),
                })
            }
        };
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_happy_path_tracked() {
        let mut stage = CheckoutStage::Idle;
        let events = [
            CheckoutEvent::SessionStarted { has_claims: true },
            CheckoutEvent::DeliveryChosen(DeliveryMethod::Tracked),
            CheckoutEvent::CheckoutConfirmed,
            CheckoutEvent::PaymentProofReceived,
            CheckoutEvent::PaymentApproved { needs_address: true },
            CheckoutEvent::AddressSubmitted,
            CheckoutEvent::AddressConfirmed,
            CheckoutEvent::OrderShipped,
        ];
        for event in &events {
            stage = stage.apply(event).unwrap();
        }
        assert_eq!(stage, CheckoutStage::Done);
    }

    #[test]
    fn self_collection_skips_address() {
        let stage = CheckoutStage::PaymentSubmitted
            .apply(&CheckoutEvent::PaymentApproved {
                needs_address: false,
            })
            .unwrap();
        assert_eq!(stage, CheckoutStage::AwaitingFulfillment);
    }

    #[test]
    fn session_start_resets_any_stage() {
        let stage = CheckoutStage::ConfirmingAddress
            .apply(&CheckoutEvent::SessionStarted { has_claims: false })
            .unwrap();
        assert_eq!(stage, CheckoutStage::Idle);
    }

    #[test]
    fn out_of_order_checkout_event_is_rejected() {
        let err = CheckoutStage::Idle
            .apply(&CheckoutEvent::PaymentProofReceived)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: "idle",
                event: "payment_proof_received"
            }
        ));
    }

    #[test]
    fn address_reentry_loops_back() {
        let stage = CheckoutStage::ConfirmingAddress
            .apply(&CheckoutEvent::AddressReentered)
            .unwrap();
        assert_eq!(stage, CheckoutStage::AwaitingAddress);
    }

    #[test]
    fn order_happy_path_and_rejection() {
        let status = OrderStatus::AwaitingPayment
            .apply(&OrderEvent::PaymentProofReceived)
            .unwrap();
        let status = status
            .apply(&OrderEvent::PaymentApproved {
                needs_address: true,
            })
            .unwrap();
        assert_eq!(status, OrderStatus::AwaitingAddress);
        let status = status.apply(&OrderEvent::AddressConfirmed).unwrap();
        let status = status.apply(&OrderEvent::MarkedPacked).unwrap();
        let status = status.apply(&OrderEvent::MarkedShipped).unwrap();
        assert_eq!(status, OrderStatus::Shipped);
        assert!(status.is_terminal());

        let rejected = OrderStatus::PaymentSubmitted
            .apply(&OrderEvent::PaymentRejected)
            .unwrap();
        assert_eq!(rejected, OrderStatus::Rejected);
    }

    #[test]
    fn shipping_an_unpacked_order_is_rejected() {
        assert!(OrderStatus::PackingPending
            .apply(&OrderEvent::MarkedShipped)
            .is_err());
    }

    #[test]
    fn status_round_trips_through_storage_form() {
        for status in [
            OrderStatus::AwaitingPayment,
            OrderStatus::PaymentSubmitted,
            OrderStatus::AwaitingAddress,
            OrderStatus::PackingPending,
            OrderStatus::Packed,
            OrderStatus::Shipped,
            OrderStatus::Rejected,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("verifying"), None);
    }
}
