use diesel_async::AsyncPgConnection;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::{self, Policy};
use crate::models::ActorSession;
use crate::{orders, sessions};
use shared::{
    CheckoutEvent, CheckoutStage, ClaimSummaryEntry, DeliveryMethod, EngineError, Money,
    OrderStatus, OrderView, TrackingNumber,
};

/// Shipping address captured from a free-text template block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub recipient: String,
    pub street: String,
    pub unit: String,
    pub postal_code: String,
    pub phone: String,
}

const ADDRESS_FIELDS: [&str; 5] = [
    "name",
    "street name",
    "unit number",
    "postal code",
    "phone number",
];

fn strip_whitespace(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Parses colon-separated `Field : value` lines; all five fields must be
/// present and non-empty. Unknown lines are ignored so the template's
/// decoration survives a copy-paste.
pub fn parse_address_block(text: &str) -> Option<Address> {
    let mut values = [None, None, None, None, None];

    for line in text.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_lowercase();
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        if let Some(idx) = ADDRESS_FIELDS.iter().position(|f| *f == key) {
            values[idx] = Some(value.to_string());
        }
    }

    let [recipient, street, unit, postal, phone] = values;
    Some(Address {
        recipient: recipient?,
        street: street?,
        unit: unit?,
        postal_code: strip_whitespace(&postal?),
        phone: strip_whitespace(&phone?),
    })
}

pub fn address_template() -> &'static str {
    "Name :\nStreet Name :\nUnit Number :\nPostal Code :\nPhone Number :"
}

/// Durable per-buyer checkout scratchpad, stored as the session payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckoutPayload {
    pub delivery_method: Option<DeliveryMethod>,
    pub delivery_fee: Option<Money>,
    pub invoice_no: Option<String>,
    pub pending_address: Option<Address>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShippingSessionPayload {
    invoice_no: String,
}

const ADMIN_AWAITING_TRACKING: &str = "awaiting_tracking";

fn stage_of(session: &Option<ActorSession>) -> CheckoutStage {
    session
        .as_ref()
        .and_then(|s| CheckoutStage::parse(&s.session_type))
        .unwrap_or(CheckoutStage::Idle)
}

fn payload_of(session: &Option<ActorSession>) -> CheckoutPayload {
    session
        .as_ref()
        .and_then(|s| serde_json::from_value(s.payload.clone()).ok())
        .unwrap_or_default()
}

async fn save(
    conn: &mut AsyncPgConnection,
    actor_id: i64,
    stage: CheckoutStage,
    payload: &CheckoutPayload,
) -> Result<(), EngineError> {
    let value = serde_json::to_value(payload).expect("checkout payload serializes");
    sessions::upsert(conn, actor_id, sessions::ROLE_BUYER, stage.as_str(), value).await
}

#[derive(Debug, Serialize)]
pub struct StartSessionResult {
    pub stage: CheckoutStage,
    pub expired_released: i32,
    pub items: Vec<ClaimSummaryEntry>,
    pub cards_subtotal: Money,
}

/// Session start: sweep stale claims first, then open the bag on whatever
/// is left.
pub async fn start_session(
    conn: &mut AsyncPgConnection,
    actor_id: i64,
    policy: Policy,
) -> Result<StartSessionResult, EngineError> {
    let expired_released = engine::sweep_stale_claims(conn, actor_id, policy).await?;
    let items = if expired_released > 0 {
        Vec::new()
    } else {
        engine::summarize_claims(conn, actor_id).await?
    };
    let has_claims = !items.is_empty();
    let stage = CheckoutStage::Idle.apply(&CheckoutEvent::SessionStarted { has_claims })?;
    let cards_subtotal: Money = items
        .iter()
        .map(|e| e.unit_price.times(e.quantity as i32))
        .sum();

    save(conn, actor_id, stage, &CheckoutPayload::default()).await?;
    Ok(StartSessionResult {
        stage,
        expired_released,
        items,
        cards_subtotal,
    })
}

#[derive(Debug, Serialize)]
pub struct DeliveryResult {
    pub stage: CheckoutStage,
    pub delivery_fee: Money,
    pub cards_subtotal: Money,
    pub total: Money,
}

pub async fn choose_delivery(
    conn: &mut AsyncPgConnection,
    actor_id: i64,
    method: DeliveryMethod,
    tracked_fee: Money,
) -> Result<DeliveryResult, EngineError> {
    let session = sessions::load(conn, actor_id).await?;
    let next = stage_of(&session).apply(&CheckoutEvent::DeliveryChosen(method))?;

    let delivery_fee = match method {
        DeliveryMethod::Tracked => tracked_fee,
        DeliveryMethod::SelfCollection => Money::zero(),
    };
    let items = engine::summarize_claims(conn, actor_id).await?;
    let cards_subtotal: Money = items
        .iter()
        .map(|e| e.unit_price.times(e.quantity as i32))
        .sum();
    let total = cards_subtotal.clone() + delivery_fee.clone();

    let mut payload = payload_of(&session);
    payload.delivery_method = Some(method);
    payload.delivery_fee = Some(delivery_fee.clone());
    save(conn, actor_id, next, &payload).await?;

    Ok(DeliveryResult {
        stage: next,
        delivery_fee,
        cards_subtotal,
        total,
    })
}

/// Checkout confirmation: snapshot the bag into an order and remember the
/// invoice in the session.
pub async fn confirm_checkout(
    conn: &mut AsyncPgConnection,
    actor_id: i64,
    buyer_name: Option<String>,
) -> Result<OrderView, EngineError> {
    let session = sessions::load(conn, actor_id).await?;
    let next = stage_of(&session).apply(&CheckoutEvent::CheckoutConfirmed)?;

    let mut payload = payload_of(&session);
    let method = payload.delivery_method.ok_or_else(|| {
        EngineError::InvariantViolation("checkout session lost its delivery method".to_string())
    })?;
    let fee = payload.delivery_fee.clone().unwrap_or_else(Money::zero);

    let view = orders::snapshot_order(conn, actor_id, buyer_name, method, fee).await?;

    payload.invoice_no = Some(view.invoice_no.clone());
    save(conn, actor_id, next, &payload).await?;
    Ok(view)
}

pub async fn submit_payment_proof(
    conn: &mut AsyncPgConnection,
    actor_id: i64,
    proof_ref: String,
    proof_kind: String,
) -> Result<(String, CheckoutStage), EngineError> {
    let session = sessions::load(conn, actor_id).await?;
    let next = stage_of(&session).apply(&CheckoutEvent::PaymentProofReceived)?;

    let payload = payload_of(&session);
    let invoice_no = payload
        .invoice_no
        .clone()
        .ok_or(EngineError::NotFound("order"))?;

    orders::record_payment_proof(conn, invoice_no.clone(), proof_ref, proof_kind).await?;
    save(conn, actor_id, next, &payload).await?;
    Ok((invoice_no, next))
}

/// Admin verdict on a submitted payment. The buyer's session follows the
/// order when it is still where the order left it; a buyer who restarted
/// their session is left alone.
pub async fn review_payment(
    conn: &mut AsyncPgConnection,
    invoice_no: String,
    approve: bool,
) -> Result<orders::ReviewResult, EngineError> {
    let result = orders::review_payment(conn, invoice_no, approve).await?;

    let session = sessions::load(conn, result.buyer_id).await?;
    let event = if approve {
        CheckoutEvent::PaymentApproved {
            needs_address: result.needs_address,
        }
    } else {
        CheckoutEvent::PaymentRejected
    };
    match stage_of(&session).apply(&event) {
        Ok(next) => save(conn, result.buyer_id, next, &payload_of(&session)).await?,
        Err(_) => warn!(
            buyer_id = result.buyer_id,
            "buyer session out of step with payment review; leaving it"
        ),
    }
    Ok(result)
}

pub async fn submit_address(
    conn: &mut AsyncPgConnection,
    actor_id: i64,
    text: &str,
) -> Result<(Address, CheckoutStage), EngineError> {
    let address = parse_address_block(text).ok_or(EngineError::InvalidAddress)?;

    let session = sessions::load(conn, actor_id).await?;
    let next = stage_of(&session).apply(&CheckoutEvent::AddressSubmitted)?;

    let mut payload = payload_of(&session);
    payload.pending_address = Some(address.clone());
    save(conn, actor_id, next, &payload).await?;
    Ok((address, next))
}

pub async fn confirm_address(
    conn: &mut AsyncPgConnection,
    actor_id: i64,
) -> Result<(String, CheckoutStage), EngineError> {
    let session = sessions::load(conn, actor_id).await?;
    let next = stage_of(&session).apply(&CheckoutEvent::AddressConfirmed)?;

    let mut payload = payload_of(&session);
    let address = payload
        .pending_address
        .take()
        .ok_or(EngineError::NotFound("address"))?;
    let invoice_no = payload
        .invoice_no
        .clone()
        .ok_or(EngineError::NotFound("order"))?;

    orders::confirm_address(conn, invoice_no.clone(), address).await?;
    save(conn, actor_id, next, &payload).await?;
    Ok((invoice_no, next))
}

pub async fn reenter_address(
    conn: &mut AsyncPgConnection,
    actor_id: i64,
) -> Result<CheckoutStage, EngineError> {
    let session = sessions::load(conn, actor_id).await?;
    let next = stage_of(&session).apply(&CheckoutEvent::AddressReentered)?;

    let mut payload = payload_of(&session);
    payload.pending_address = None;
    save(conn, actor_id, next, &payload).await?;
    Ok(next)
}

/// Opens a shipping session for a packed order; the tracking number
/// arrives in a follow-up message once the label is read.
pub async fn start_shipping(
    conn: &mut AsyncPgConnection,
    admin_id: i64,
    invoice_no: String,
) -> Result<(), EngineError> {
    let view = orders::view_by_invoice(conn, &invoice_no).await?;
    if view.status != OrderStatus::Packed {
        return Err(EngineError::InvalidTransition {
            from: view.status.as_str(),
            event: "shipping_started",
        });
    }
    let payload = serde_json::to_value(ShippingSessionPayload { invoice_no })
        .expect("shipping payload serializes");
    sessions::upsert(
        conn,
        admin_id,
        sessions::ROLE_ADMIN,
        ADMIN_AWAITING_TRACKING,
        payload,
    )
    .await
}

#[derive(Debug, Serialize)]
pub struct ShipResult {
    pub invoice_no: String,
    pub tracking_number: String,
    pub status: OrderStatus,
    pub buyer_id: i64,
}

/// Consumes label text (OCR output or manually typed), ships the order in
/// the open shipping session, and closes the buyer's checkout.
pub async fn submit_tracking(
    conn: &mut AsyncPgConnection,
    admin_id: i64,
    text: &str,
    shipping_proof_ref: Option<String>,
) -> Result<ShipResult, EngineError> {
    let session = sessions::load(conn, admin_id)
        .await?
        .filter(|s| s.session_type == ADMIN_AWAITING_TRACKING)
        .ok_or(EngineError::NotFound("shipping session"))?;
    let payload: ShippingSessionPayload = serde_json::from_value(session.payload)
        .map_err(|_| EngineError::NotFound("shipping session"))?;

    let tracking = TrackingNumber::extract(text).ok_or(EngineError::InvalidTracking)?;

    let (buyer_id, status) = orders::mark_shipped(
        conn,
        payload.invoice_no.clone(),
        tracking.clone(),
        shipping_proof_ref,
    )
    .await?;
    sessions::clear(conn, admin_id).await?;

    let buyer_session = sessions::load(conn, buyer_id).await?;
    match stage_of(&buyer_session).apply(&CheckoutEvent::OrderShipped) {
        Ok(next) => save(conn, buyer_id, next, &payload_of(&buyer_session)).await?,
        Err(_) => warn!(buyer_id, "buyer session already moved on; not closing it"),
    }

    Ok(ShipResult {
        invoice_no: payload.invoice_no,
        tracking_number: tracking.as_str().to_string(),
        status,
        buyer_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_filled_template() {
        let text = "————— COPY FROM HERE —————\n\
                    Name : Ash Ketchum\n\
                    Street Name : 806 Woodlands St 81\n\
                    Unit Number : #05-123\n\
                    Postal Code : 730 806\n\
                    Phone Number : 9338 5994\n\
                    ————— COPY UNTIL HERE —————";
        let address = parse_address_block(text).unwrap();
        assert_eq!(address.recipient, "Ash Ketchum");
        assert_eq!(address.street, "806 Woodlands St 81");
        assert_eq!(address.unit, "#05-123");
        assert_eq!(address.postal_code, "730806");
        assert_eq!(address.phone, "93385994");
    }

    #[test]
    fn keys_are_case_insensitive() {
        let text = "name: A\nSTREET NAME: B\nunit number: C\nPostal Code: 1\nphone number: 2";
        assert!(parse_address_block(text).is_some());
    }

    #[test]
    fn missing_or_empty_field_rejects_the_block() {
        let text = "Name : A\nStreet Name : B\nUnit Number : C\nPostal Code : 1\n";
        assert!(parse_address_block(text).is_none());

        let text = "Name :\nStreet Name : B\nUnit Number : C\nPostal Code : 1\nPhone Number : 2";
        assert!(parse_address_block(text).is_none());
    }

    #[test]
    fn unknown_lines_are_ignored() {
        let text = "Note to seller\nName : A\nStreet Name : B\nUnit Number : C\n\
                    Postal Code : 1\nPhone Number : 2";
        assert!(parse_address_block(text).is_some());
    }
}
