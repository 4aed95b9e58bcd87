use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared::{DeliveryMethod, EngineError, LineItemView, Money, OrderStatus, OrderView};

pub const CLAIM_ACTIVE: &str = "active";
pub const CLAIM_CANCELLED: &str = "cancelled";

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::catalog_items)]
pub struct CatalogItem {
    pub id: i64,
    pub name: String,
    pub unit_price: Money,
    pub initial_quantity: i32,
    pub remaining_quantity: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::catalog_items)]
pub struct NewCatalogItem {
    pub name: String,
    pub unit_price: Money,
    pub initial_quantity: i32,
    pub remaining_quantity: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::claims)]
pub struct Claim {
    pub id: i64,
    pub resource_id: i64,
    pub actor_id: i64,
    pub display_name: Option<String>,
    pub sequence_number: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::claims)]
pub struct NewClaim {
    pub resource_id: i64,
    pub actor_id: i64,
    pub display_name: Option<String>,
    pub sequence_number: i32,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::orders)]
pub struct Order {
    pub id: i64,
    pub invoice_no: String,
    pub buyer_id: i64,
    pub buyer_name: Option<String>,
    pub delivery_method: String,
    pub cards_subtotal: Money,
    pub delivery_fee: Money,
    pub total: Money,
    pub status: String,
    pub payment_proof_ref: Option<String>,
    pub payment_proof_kind: Option<String>,
    pub tracking_number: Option<String>,
    pub shipping_proof_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn status(&self) -> Result<OrderStatus, EngineError> {
        OrderStatus::parse(&self.status).ok_or_else(|| {
            EngineError::InvariantViolation(format!(
                "order {} carries unknown status {:?}",
                self.invoice_no, self.status
            ))
        })
    }

    pub fn delivery(&self) -> Result<DeliveryMethod, EngineError> {
        DeliveryMethod::parse(&self.delivery_method).ok_or_else(|| {
            EngineError::InvariantViolation(format!(
                "order {} carries unknown delivery method {:?}",
                self.invoice_no, self.delivery_method
            ))
        })
    }

    pub fn into_view(self, lines: Vec<OrderLine>) -> Result<OrderView, EngineError> {
        let status = self.status()?;
        let delivery_method = self.delivery()?;
        Ok(OrderView {
            invoice_no: self.invoice_no,
            buyer_id: self.buyer_id,
            buyer_name: self.buyer_name,
            delivery_method,
            status,
            line_items: lines.into_iter().map(OrderLine::into_view).collect(),
            cards_subtotal: self.cards_subtotal,
            delivery_fee: self.delivery_fee,
            total: self.total,
            tracking_number: self.tracking_number,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub id: i64,
    pub invoice_no: String,
    pub buyer_id: i64,
    pub buyer_name: Option<String>,
    pub delivery_method: String,
    pub cards_subtotal: Money,
    pub delivery_fee: Money,
    pub total: Money,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::order_lines)]
pub struct OrderLine {
    pub id: i64,
    pub order_id: i64,
    pub resource_id: i64,
    pub name: String,
    pub unit_price: Money,
    pub quantity: i32,
}

impl OrderLine {
    pub fn into_view(self) -> LineItemView {
        LineItemView {
            resource_id: self.resource_id,
            name: self.name,
            unit_price: self.unit_price,
            quantity: self.quantity,
        }
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::order_lines)]
pub struct NewOrderLine {
    pub order_id: i64,
    pub resource_id: i64,
    pub name: String,
    pub unit_price: Money,
    pub quantity: i32,
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::shipping_addresses)]
pub struct ShippingAddress {
    pub order_id: i64,
    pub recipient: String,
    pub street: String,
    pub unit: String,
    pub postal_code: String,
    pub phone: String,
    pub confirmed: bool,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::actor_sessions)]
pub struct ActorSession {
    pub actor_id: i64,
    pub role: String,
    pub session_type: String,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::actor_sessions)]
pub struct NewActorSession {
    pub actor_id: i64,
    pub role: String,
    pub session_type: String,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::admin_audit_log)]
pub struct NewAuditEntry {
    pub action: String,
    pub admin_id: i64,
    pub target_actor_id: i64,
    pub resource_id: i64,
    pub quantity: i32,
    pub reason: String,
}

#[derive(Debug, Clone, Queryable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct DbOutboxEvent {
    pub id: Uuid,
    pub aggregate_ref: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::outbox_events)]
pub struct NewOutboxEvent {
    pub id: Uuid,
    pub aggregate_ref: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
}
