use chrono::Utc;
use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use tracing::info;

use crate::checkout::Address;
use crate::engine;
use crate::models::{NewOrder, NewOrderLine, Order, OrderLine, ShippingAddress};
use crate::outbox;
use crate::schema::{order_lines, orders, shipping_addresses};
use shared::{
    DeliveryMethod, DomainEvent, EngineError, Money, OrderEvent, OrderStatus, OrderView,
    TrackingNumber,
};

/// The invoice number is the order's own identity in display form; there
/// is no second unique key to race on.
pub fn derive_invoice_no(order_id: i64) -> String {
    format!("INV-{order_id:06}")
}

fn subtotal_of<'a, I>(lines: I) -> Money
where
    I: IntoIterator<Item = (&'a Money, i32)>,
{
    lines.into_iter().map(|(price, qty)| price.times(qty)).sum()
}

fn reduced_line(quantity: i32, revoked: i32) -> i32 {
    quantity - revoked.min(quantity)
}

fn terminal_statuses() -> Vec<&'static str> {
    vec![
        OrderStatus::Shipped.as_str(),
        OrderStatus::Rejected.as_str(),
        OrderStatus::Cancelled.as_str(),
    ]
}

async fn lock_by_invoice(
    conn: &mut AsyncPgConnection,
    invoice_no: &str,
) -> Result<Order, EngineError> {
    orders::table
        .filter(orders::invoice_no.eq(invoice_no))
        .for_update()
        .first(conn)
        .await
        .optional()?
        .ok_or(EngineError::NotFound("order"))
}

pub async fn view_by_invoice(
    conn: &mut AsyncPgConnection,
    invoice_no: &str,
) -> Result<OrderView, EngineError> {
    let order: Order = orders::table
        .filter(orders::invoice_no.eq(invoice_no))
        .first(conn)
        .await
        .optional()?
        .ok_or(EngineError::NotFound("order"))?;
    let lines = order_lines::table
        .filter(order_lines::order_id.eq(order.id))
        .order(order_lines::id.asc())
        .load(conn)
        .await?;
    order.into_view(lines)
}

/// Copies the buyer's live claims into a durable order. Claims are read,
/// not locked or consumed; the buyer can still cancel afterwards, which is
/// what reconciliation exists for.
pub async fn snapshot_order(
    conn: &mut AsyncPgConnection,
    actor_id: i64,
    buyer_name: Option<String>,
    delivery_method: DeliveryMethod,
    delivery_fee: Money,
) -> Result<OrderView, EngineError> {
    conn.transaction::<OrderView, EngineError, _>(|conn| {
        Box::pin(async move {
            let summary = engine::summarize_claims(conn, actor_id).await?;
            if summary.is_empty() {
                return Err(EngineError::NoActiveClaims);
            }

            let cards_subtotal: Money = summary
                .iter()
                .map(|entry| entry.unit_price.times(entry.quantity as i32))
                .sum();
            let total = cards_subtotal.clone() + delivery_fee.clone();

            let order_id: i64 = diesel::select(sql::<BigInt>("nextval('orders_id_seq')"))
                .get_result(conn)
                .await?;
            let invoice_no = derive_invoice_no(order_id);

            diesel::insert_into(orders::table)
                .values(&NewOrder {
                    id: order_id,
                    invoice_no: invoice_no.clone(),
                    buyer_id: actor_id,
                    buyer_name,
                    delivery_method: delivery_method.as_str().to_string(),
                    cards_subtotal: cards_subtotal.clone(),
                    delivery_fee,
                    total: total.clone(),
                    status: OrderStatus::AwaitingPayment.as_str().to_string(),
                })
                .execute(conn)
                .await?;

            let lines: Vec<NewOrderLine> = summary
                .iter()
                .map(|entry| NewOrderLine {
                    order_id,
                    resource_id: entry.resource_id,
                    name: entry.name.clone(),
                    unit_price: entry.unit_price.clone(),
                    quantity: entry.quantity as i32,
                })
                .collect();
            diesel::insert_into(order_lines::table)
                .values(&lines)
                .execute(conn)
                .await?;

            outbox::record(
                conn,
                &DomainEvent::OrderCreated {
                    invoice_no: invoice_no.clone(),
                    buyer_id: actor_id,
                    total,
                },
            )
            .await?;

            info!(actor_id, %invoice_no, "order snapshot created");

            view_by_invoice(conn, &invoice_no).await
        })
    })
    .await
}

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub invoice_no: Option<String>,
    pub order_cancelled: bool,
}

/// Folds revoked claim units into the buyer's most recent open order.
/// Finding no order or no matching line is the normal case for buyers who
/// never checked out, not an error. Serialized per order by the row lock.
pub async fn reconcile_revocation(
    conn: &mut AsyncPgConnection,
    actor_id: i64,
    resource_id: i64,
    units_revoked: i32,
) -> Result<ReconcileOutcome, EngineError> {
    if units_revoked <= 0 {
        return Ok(ReconcileOutcome::default());
    }

    conn.transaction::<ReconcileOutcome, EngineError, _>(|conn| {
        Box::pin(async move {
            let order: Option<Order> = orders::table
                .filter(orders::buyer_id.eq(actor_id))
                .filter(orders::status.ne_all(terminal_statuses()))
                .order(orders::created_at.desc())
                .for_update()
                .first(conn)
                .await
                .optional()?;
            let Some(order) = order else {
                return Ok(ReconcileOutcome::default());
            };

            let line: Option<OrderLine> = order_lines::table
                .filter(order_lines::order_id.eq(order.id))
                .filter(order_lines::resource_id.eq(resource_id))
                .first(conn)
                .await
                .optional()?;
            let Some(line) = line else {
                return Ok(ReconcileOutcome::default());
            };

            let new_quantity = reduced_line(line.quantity, units_revoked);
            if new_quantity <= 0 {
                diesel::delete(order_lines::table.find(line.id))
                    .execute(conn)
                    .await?;
            } else {
                diesel::update(order_lines::table.find(line.id))
                    .set(order_lines::quantity.eq(new_quantity))
                    .execute(conn)
                    .await?;
            }

            let surviving: Vec<OrderLine> = order_lines::table
                .filter(order_lines::order_id.eq(order.id))
                .load(conn)
                .await?;
            let cards_subtotal = subtotal_of(surviving.iter().map(|l| (&l.unit_price, l.quantity)));

            if cards_subtotal.is_zero() {
                diesel::update(orders::table.find(order.id))
                    .set((
                        orders::status.eq(OrderStatus::Cancelled.as_str()),
                        orders::cards_subtotal.eq(Money::zero()),
                        orders::total.eq(Money::zero()),
                        orders::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)
                    .await?;
                outbox::record(
                    conn,
                    &DomainEvent::OrderCancelled {
                        invoice_no: order.invoice_no.clone(),
                    },
                )
                .await?;
                info!(invoice_no = %order.invoice_no, "order cancelled, no lines left");
                Ok(ReconcileOutcome {
                    invoice_no: Some(order.invoice_no),
                    order_cancelled: true,
                })
            } else {
                let total = cards_subtotal.clone() + order.delivery_fee.clone();
                diesel::update(orders::table.find(order.id))
                    .set((
                        orders::cards_subtotal.eq(cards_subtotal.clone()),
                        orders::total.eq(total.clone()),
                        orders::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)
                    .await?;
                outbox::record(
                    conn,
                    &DomainEvent::OrderAdjusted {
                        invoice_no: order.invoice_no.clone(),
                        cards_subtotal,
                        total,
                    },
                )
                .await?;
                info!(invoice_no = %order.invoice_no, "order totals recomputed");
                Ok(ReconcileOutcome {
                    invoice_no: Some(order.invoice_no),
                    order_cancelled: false,
                })
            }
        })
    })
    .await
}

pub async fn record_payment_proof(
    conn: &mut AsyncPgConnection,
    invoice_no: String,
    proof_ref: String,
    proof_kind: String,
) -> Result<OrderStatus, EngineError> {
    conn.transaction::<OrderStatus, EngineError, _>(|conn| {
        Box::pin(async move {
            let order = lock_by_invoice(conn, &invoice_no).await?;
            let next = order.status()?.apply(&OrderEvent::PaymentProofReceived)?;
            diesel::update(orders::table.find(order.id))
                .set((
                    orders::status.eq(next.as_str()),
                    orders::payment_proof_ref.eq(Some(proof_ref)),
                    orders::payment_proof_kind.eq(Some(proof_kind)),
                    orders::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;
            outbox::record(
                conn,
                &DomainEvent::PaymentProofReceived {
                    invoice_no: order.invoice_no.clone(),
                },
            )
            .await?;
            Ok(next)
        })
    })
    .await
}

pub struct ReviewResult {
    pub buyer_id: i64,
    pub status: OrderStatus,
    pub needs_address: bool,
}

pub async fn review_payment(
    conn: &mut AsyncPgConnection,
    invoice_no: String,
    approve: bool,
) -> Result<ReviewResult, EngineError> {
    conn.transaction::<ReviewResult, EngineError, _>(|conn| {
        Box::pin(async move {
            let order = lock_by_invoice(conn, &invoice_no).await?;
            let needs_address = order.delivery()?.needs_address();
            let event = if approve {
                OrderEvent::PaymentApproved { needs_address }
            } else {
                OrderEvent::PaymentRejected
            };
            let next = order.status()?.apply(&event)?;
            diesel::update(orders::table.find(order.id))
                .set((
                    orders::status.eq(next.as_str()),
                    orders::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;
            outbox::record(
                conn,
                &DomainEvent::PaymentReviewed {
                    invoice_no: order.invoice_no.clone(),
                    approved: approve,
                },
            )
            .await?;
            Ok(ReviewResult {
                buyer_id: order.buyer_id,
                status: next,
                needs_address,
            })
        })
    })
    .await
}

pub async fn confirm_address(
    conn: &mut AsyncPgConnection,
    invoice_no: String,
    address: Address,
) -> Result<OrderStatus, EngineError> {
    conn.transaction::<OrderStatus, EngineError, _>(|conn| {
        Box::pin(async move {
            let order = lock_by_invoice(conn, &invoice_no).await?;
            let next = order.status()?.apply(&OrderEvent::AddressConfirmed)?;

            let row = ShippingAddress {
                order_id: order.id,
                recipient: address.recipient,
                street: address.street,
                unit: address.unit,
                postal_code: address.postal_code,
                phone: address.phone,
                confirmed: true,
            };
            diesel::insert_into(shipping_addresses::table)
                .values(&row)
                .on_conflict(shipping_addresses::order_id)
                .do_update()
                .set((
                    shipping_addresses::recipient.eq(row.recipient.clone()),
                    shipping_addresses::street.eq(row.street.clone()),
                    shipping_addresses::unit.eq(row.unit.clone()),
                    shipping_addresses::postal_code.eq(row.postal_code.clone()),
                    shipping_addresses::phone.eq(row.phone.clone()),
                    shipping_addresses::confirmed.eq(true),
                ))
                .execute(conn)
                .await?;

            diesel::update(orders::table.find(order.id))
                .set((
                    orders::status.eq(next.as_str()),
                    orders::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;
            Ok(next)
        })
    })
    .await
}

pub async fn mark_packed(
    conn: &mut AsyncPgConnection,
    invoice_no: String,
) -> Result<(i64, OrderStatus), EngineError> {
    conn.transaction::<(i64, OrderStatus), EngineError, _>(|conn| {
        Box::pin(async move {
            let order = lock_by_invoice(conn, &invoice_no).await?;
            let next = order.status()?.apply(&OrderEvent::MarkedPacked)?;
            diesel::update(orders::table.find(order.id))
                .set((
                    orders::status.eq(next.as_str()),
                    orders::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;
            outbox::record(
                conn,
                &DomainEvent::OrderPacked {
                    invoice_no: order.invoice_no.clone(),
                },
            )
            .await?;
            Ok((order.buyer_id, next))
        })
    })
    .await
}

pub async fn mark_shipped(
    conn: &mut AsyncPgConnection,
    invoice_no: String,
    tracking: TrackingNumber,
    shipping_proof_ref: Option<String>,
) -> Result<(i64, OrderStatus), EngineError> {
    conn.transaction::<(i64, OrderStatus), EngineError, _>(|conn| {
        Box::pin(async move {
            let order = lock_by_invoice(conn, &invoice_no).await?;
            let next = order.status()?.apply(&OrderEvent::MarkedShipped)?;
            diesel::update(orders::table.find(order.id))
                .set((
                    orders::status.eq(next.as_str()),
                    orders::tracking_number.eq(Some(tracking.as_str().to_string())),
                    orders::shipping_proof_ref.eq(shipping_proof_ref),
                    orders::updated_at.eq(Utc::now()),
                ))
                .execute(conn)
                .await?;
            outbox::record(
                conn,
                &DomainEvent::OrderShipped {
                    invoice_no: order.invoice_no.clone(),
                    tracking_number: tracking.as_str().to_string(),
                },
            )
            .await?;
            info!(
                invoice_no = %order.invoice_no,
                tracking = tracking.as_str(),
                "order shipped"
            );
            Ok((order.buyer_id, next))
        })
    })
    .await
}

pub async fn orders_by_status(
    conn: &mut AsyncPgConnection,
    status: OrderStatus,
) -> Result<Vec<OrderView>, EngineError> {
    let rows: Vec<Order> = orders::table
        .filter(orders::status.eq(status.as_str()))
        .order(orders::created_at.asc())
        .load(conn)
        .await?;
    views_with_lines(conn, rows).await
}

pub async fn orders_for_buyer(
    conn: &mut AsyncPgConnection,
    actor_id: i64,
) -> Result<Vec<OrderView>, EngineError> {
    let rows: Vec<Order> = orders::table
        .filter(orders::buyer_id.eq(actor_id))
        .order(orders::created_at.desc())
        .load(conn)
        .await?;
    views_with_lines(conn, rows).await
}

async fn views_with_lines(
    conn: &mut AsyncPgConnection,
    rows: Vec<Order>,
) -> Result<Vec<OrderView>, EngineError> {
    let mut views = Vec::with_capacity(rows.len());
    for order in rows {
        let lines = order_lines::table
            .filter(order_lines::order_id.eq(order.id))
            .order(order_lines::id.asc())
            .load(conn)
            .await?;
        views.push(order.into_view(lines)?);
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoice_number_is_derived_from_order_identity() {
        assert_eq!(derive_invoice_no(16), "INV-000016");
        assert_eq!(derive_invoice_no(1_234_567), "INV-1234567");
    }

    #[test]
    fn subtotal_plus_fee_keeps_cents_exact() {
        let price = Money::parse("$12.50").unwrap();
        let subtotal = subtotal_of([(&price, 1)]);
        assert_eq!(subtotal.to_string(), "12.50");
        let total = subtotal + Money::parse("3.50").unwrap();
        assert_eq!(total.to_string(), "16.00");
    }

    #[test]
    fn revocation_never_drives_a_line_negative() {
        assert_eq!(reduced_line(3, 2), 1);
        assert_eq!(reduced_line(2, 2), 0);
        assert_eq!(reduced_line(1, 5), 0);
    }
}
